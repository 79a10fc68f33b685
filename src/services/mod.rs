pub mod comparison;
pub mod server;

pub use comparison::ComparisonService;
