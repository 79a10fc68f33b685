use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use neuralvision::config::{default_log_filter, EmbeddingSettings, Settings};
use neuralvision::services::server;
use neuralvision::{ComparisonService, FeatureExtractor, FusionOutcome};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "neuralvision", version, about = "Compare two images for visual similarity")]
struct Cli {
    /// JSON settings file
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// ONNX feature extractor (overrides settings and NEURALVISION_MODEL)
    #[arg(long, global = true, value_name = "FILE")]
    model: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compare two image files
    Compare {
        image1: PathBuf,
        image2: PathBuf,
        #[arg(long, value_enum, default_value_t = Mode::Binary)]
        mode: Mode,
        /// Match threshold for the binary mode (default from settings)
        #[arg(long)]
        threshold: Option<f64>,
        /// Print the individual classical signals
        #[arg(long)]
        explain: bool,
        /// Emit a JSON report instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run the HTTP service
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Skip model loading; embedding requests answer 503
        #[arg(long)]
        classical_only: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Binary,
    Embedding,
    Both,
}

impl Mode {
    fn needs_embeddings(self) -> bool {
        matches!(self, Mode::Embedding | Mode::Both)
    }

    fn needs_classical(self) -> bool {
        matches!(self, Mode::Binary | Mode::Both)
    }
}

#[derive(Serialize, Debug)]
struct CompareReport {
    image1: String,
    image2: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    similarity: Option<f64>,
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    matched: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    classical: Option<FusionOutcome>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    if let Some(model) = cli.model {
        settings.embedding.model_path = Some(model);
    }

    match cli.command {
        Commands::Compare {
            image1,
            image2,
            mode,
            threshold,
            explain,
            json,
        } => {
            if let Some(t) = threshold {
                anyhow::ensure!(t.is_finite(), "Threshold must be a finite number, got {t}");
            }

            let service = if mode.needs_embeddings() {
                ComparisonService::new(load_extractor(&settings.embedding)?, &settings)
            } else {
                ComparisonService::classical_only(&settings)
            };

            let bytes1 = read_image(&image1)?;
            let bytes2 = read_image(&image2)?;

            let similarity = if mode.needs_embeddings() {
                Some(benchmark("embedding comparison", || {
                    service.compare_embeddings(&bytes1, &bytes2)
                })?)
            } else {
                None
            };

            let outcome = if mode.needs_classical() {
                let policy = match threshold {
                    Some(t) => service.fusion_policy().with_threshold(t),
                    None => *service.fusion_policy(),
                };
                Some(benchmark("classical comparison", || {
                    service.evaluate_binary(&bytes1, &bytes2, &policy)
                })?)
            } else {
                None
            };

            let report = CompareReport {
                image1: image1.display().to_string(),
                image2: image2.display().to_string(),
                similarity,
                matched: outcome.map(|o| o.verdict()),
                classical: outcome.filter(|_| explain || json),
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report, explain);
            }
        }

        Commands::Serve {
            host,
            port,
            classical_only,
        } => {
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }

            let service = if classical_only {
                log::warn!("Starting without a feature extractor; embedding mode disabled");
                ComparisonService::classical_only(&settings)
            } else {
                ComparisonService::new(load_extractor(&settings.embedding)?, &settings)
            };

            println!(
                "▶ Serving on http://{}:{}",
                settings.server.host, settings.server.port
            );
            let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
            runtime
                .block_on(server::serve(Arc::new(service), &settings.server))
                .context("HTTP server failed")?;
        }
    }

    Ok(())
}

fn print_report(report: &CompareReport, explain: bool) {
    println!("▶ {} ↔ {}", report.image1, report.image2);
    if let Some(similarity) = report.similarity {
        println!("   🧠 Embedding similarity: {similarity:.4}");
    }
    if let Some(matched) = report.matched {
        let label = if matched == 1 { "✅ match" } else { "❌ no match" };
        println!("   🔍 Classical verdict: {matched} ({label})");
    }
    if explain {
        if let Some(outcome) = &report.classical {
            let s = &outcome.signals;
            println!(
                "      histogram  {:.4} (raw {:.4})",
                s.histogram, s.histogram_raw
            );
            println!(
                "      ssim       {:.4} (raw {:.4})",
                s.structural, s.structural_raw
            );
            println!("      keypoints  {:.4}", s.keypoints);
            println!(
                "      mean       {:.4} vs threshold {}",
                outcome.mean, outcome.threshold
            );
        }
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read image {:?}", path))
}

#[cfg(feature = "onnx")]
fn load_extractor(settings: &EmbeddingSettings) -> Result<Arc<dyn FeatureExtractor>> {
    use indicatif::{ProgressBar, ProgressStyle};
    use neuralvision::core::onnx::OnnxExtractor;
    use std::time::Duration;

    let path = settings
        .resolved_model_path()
        .context("No model path configured and no platform data directory")?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.set_message(format!("Loading model {}…", path.display()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let loaded = OnnxExtractor::load(&path, settings.dimension, settings.intra_threads);
    spinner.finish_and_clear();

    let extractor = loaded.with_context(|| format!("Failed to load model {:?}", path))?;
    Ok(Arc::new(extractor))
}

#[cfg(not(feature = "onnx"))]
fn load_extractor(_settings: &EmbeddingSettings) -> Result<Arc<dyn FeatureExtractor>> {
    anyhow::bail!(
        "Embedding mode needs a build with the `onnx` feature; use --mode binary or serve --classical-only"
    )
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    eprintln!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_compare_defaults_to_binary() {
        let cli = Cli::try_parse_from(["neuralvision", "compare", "a.jpg", "b.png"]).unwrap();
        match cli.command {
            Commands::Compare {
                mode,
                threshold,
                explain,
                json,
                ..
            } => {
                assert_eq!(mode, Mode::Binary);
                assert_eq!(threshold, None);
                assert!(!explain && !json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "neuralvision",
            "compare",
            "a.jpg",
            "b.jpg",
            "--mode",
            "both",
            "--threshold",
            "0.7",
            "--model",
            "/tmp/m.onnx",
        ])
        .unwrap();
        assert_eq!(cli.model, Some(PathBuf::from("/tmp/m.onnx")));
        match cli.command {
            Commands::Compare { mode, threshold, .. } => {
                assert_eq!(mode, Mode::Both);
                assert_eq!(threshold, Some(0.7));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_serve_flags() {
        let cli =
            Cli::try_parse_from(["neuralvision", "serve", "--port", "8080", "--classical-only"]).unwrap();
        match cli.command {
            Commands::Serve {
                host,
                port,
                classical_only,
            } => {
                assert_eq!(host, None);
                assert_eq!(port, Some(8080));
                assert!(classical_only);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Cli::try_parse_from(["neuralvision", "compare", "a", "b", "--mode", "fuzzy"]).is_err());
    }

    #[test]
    fn test_read_image() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("img.bin");
        fs::write(&path, [1u8, 2, 3]).unwrap();

        assert_eq!(read_image(&path).unwrap(), vec![1, 2, 3]);
        assert!(read_image(&temp_dir.path().join("missing.jpg")).is_err());
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_embedding_mode_refused_without_onnx() {
        let err = load_extractor(&EmbeddingSettings::default()).err().unwrap();
        assert!(err.to_string().contains("onnx"));
    }

    #[cfg(feature = "onnx")]
    #[test]
    fn test_unloadable_model_fails_fast() {
        let temp_dir = TempDir::new().unwrap();
        let settings = EmbeddingSettings {
            model_path: Some(temp_dir.path().join("absent.onnx")),
            ..EmbeddingSettings::default()
        };
        assert!(load_extractor(&settings).is_err());
    }

    #[test]
    fn test_mode_paths() {
        assert!(Mode::Both.needs_embeddings() && Mode::Both.needs_classical());
        assert!(!Mode::Binary.needs_embeddings());
        assert!(!Mode::Embedding.needs_classical());
    }
}
