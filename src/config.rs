use crate::core::embedding::DEFAULT_EMBEDDING_DIM;
use crate::core::fusion::{ClassicalConfig, FusionPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const APP_NAME: &str = "neuralvision";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_MODEL_FILE: &str = "mobilenet_v2_features.onnx";

pub const ENV_MODEL: &str = "NEURALVISION_MODEL";
pub const ENV_THRESHOLD: &str = "NEURALVISION_THRESHOLD";
pub const ENV_PORT: &str = "PORT";

/// Smallest classical working size; keeps every pyramid level usable.
const MIN_WORKING_SIZE: u32 = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// ONNX file of the truncated network. `None` means the platform default.
    pub model_path: Option<PathBuf>,
    pub dimension: usize,
    pub intra_threads: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            dimension: DEFAULT_EMBEDDING_DIM,
            intra_threads: 2,
        }
    }
}

impl EmbeddingSettings {
    /// Configured path, else `<data_dir>/neuralvision/models/<default file>`.
    pub fn resolved_model_path(&self) -> Option<PathBuf> {
        self.model_path.clone().or_else(default_model_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_upload_bytes: 32 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub embedding: EmbeddingSettings,
    pub classical: ClassicalConfig,
    pub fusion: FusionPolicy,
    pub server: ServerSettings,
}

pub fn default_model_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join(APP_NAME).join("models").join(DEFAULT_MODEL_FILE))
}

pub fn default_log_filter() -> &'static str {
    "neuralvision=info"
}

impl Settings {
    /// Defaults, overlaid with the JSON file at `path` when given, then with
    /// the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|var| std::env::var(var).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(model) = lookup(ENV_MODEL).filter(|v| !v.is_empty()) {
            self.embedding.model_path = Some(PathBuf::from(model));
        }
        if let Some(value) = lookup(ENV_THRESHOLD) {
            self.fusion.threshold = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_THRESHOLD,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_PORT) {
            self.server.port = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_PORT,
                value: value.clone(),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.fusion.threshold.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "fusion.threshold must be finite, got {}",
                self.fusion.threshold
            )));
        }
        if !self.fusion.weights.is_valid() {
            return Err(ConfigError::Invalid(
                "fusion.weights must be finite, non-negative and not all zero".to_string(),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(ConfigError::Invalid("embedding.dimension must be positive".to_string()));
        }
        if self.classical.working_size < MIN_WORKING_SIZE {
            return Err(ConfigError::Invalid(format!(
                "classical.working_size must be at least {MIN_WORKING_SIZE}, got {}",
                self.classical.working_size
            )));
        }
        let orb = &self.classical.orb;
        if orb.scale_factor <= 1.0 || orb.levels == 0 || orb.match_normalizer <= 0.0 {
            return Err(ConfigError::Invalid(
                "classical.orb needs scale_factor > 1, levels > 0 and match_normalizer > 0".to_string(),
            ));
        }
        Ok(())
    }
}
