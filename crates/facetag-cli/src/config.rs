use anyhow::{bail, Context, Result};
use facetag_core::{models, DistanceMetric, IdentityMatcher, ModelPreset, DEFAULT_ENROLL_WORKERS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Optional TOML config file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model: Option<String>,
    model_dir: Option<PathBuf>,
    gallery_path: Option<PathBuf>,
    metric: Option<String>,
    cosine_threshold: Option<f32>,
    l2_threshold: Option<f32>,
    enroll_workers: Option<usize>,
    slow_frame_ms: Option<u64>,
}

/// Resolved configuration: defaults, then the TOML file, then `FACETAG_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Embedding model preset; fixes the embedding dimension.
    pub model: ModelPreset,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Persisted gallery file.
    pub gallery_path: PathBuf,
    pub metric: DistanceMetric,
    pub cosine_threshold: f32,
    pub l2_threshold: f32,
    /// Number of enrollment worker threads.
    pub enroll_workers: usize,
    /// Frames slower than this are logged.
    pub slow_frame_ms: u64,
}

impl Config {
    /// Load from `path` (or `FACETAG_CONFIG`, or the XDG default) plus the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("FACETAG_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(default_config_path);

        let file = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str::<FileConfig>(&text)
                .with_context(|| format!("invalid config file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                FileConfig::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading config file {}", path.display()))
            }
        };

        Self::resolve(file, |key| std::env::var(key).ok())
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let model_name = env("FACETAG_MODEL")
            .or(file.model)
            .unwrap_or_else(|| models::FACENET.name.to_string());
        let Some(model) = models::by_name(&model_name) else {
            let known: Vec<&str> = models::PRESETS.iter().map(|p| p.name).collect();
            bail!("unknown model {model_name:?} (known: {})", known.join(", "));
        };

        let metric = match env("FACETAG_METRIC").or(file.metric) {
            Some(name) => DistanceMetric::from_str(&name)?,
            None => DistanceMetric::Cosine,
        };

        let config = Self {
            model,
            model_dir: env("FACETAG_MODEL_DIR")
                .map(PathBuf::from)
                .or(file.model_dir)
                .unwrap_or_else(facetag_core::default_model_dir),
            gallery_path: env("FACETAG_GALLERY_PATH")
                .map(PathBuf::from)
                .or(file.gallery_path)
                .unwrap_or_else(facetag_core::default_gallery_path),
            metric,
            cosine_threshold: env_parse(&env, "FACETAG_COSINE_THRESHOLD")
                .or(file.cosine_threshold)
                .unwrap_or(model.cosine_threshold),
            l2_threshold: env_parse(&env, "FACETAG_L2_THRESHOLD")
                .or(file.l2_threshold)
                .unwrap_or(model.l2_threshold),
            enroll_workers: env_parse(&env, "FACETAG_ENROLL_WORKERS")
                .or(file.enroll_workers)
                .unwrap_or(DEFAULT_ENROLL_WORKERS),
            slow_frame_ms: env_parse(&env, "FACETAG_SLOW_FRAME_MS")
                .or(file.slow_frame_ms)
                .unwrap_or(500),
        };

        if config.enroll_workers == 0 {
            bail!("enroll_workers must be at least 1");
        }
        config.matcher()?;
        Ok(config)
    }

    /// Acceptance threshold for the configured metric.
    pub fn threshold(&self) -> f32 {
        match self.metric {
            DistanceMetric::Cosine => self.cosine_threshold,
            DistanceMetric::L2 => self.l2_threshold,
        }
    }

    pub fn matcher(&self) -> Result<IdentityMatcher> {
        IdentityMatcher::new(self.metric, self.threshold())
            .with_context(|| format!("invalid {} threshold", self.metric))
    }

    /// Path to the embedding model file.
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(self.model.file_name)
    }

    pub fn slow_frame(&self) -> Duration {
        Duration::from_millis(self.slow_frame_ms)
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("facetag/config.toml")
}

/// Parse an environment value, ignoring (and logging) malformed input.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring malformed environment value");
            None
        }
    }
}
