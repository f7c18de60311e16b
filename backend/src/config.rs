use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "config/hairscan.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// TorchScript export, preferred when present.
    pub compatible_path: PathBuf,
    /// Weights-only files for the legacy architecture, checked in order.
    pub legacy_paths: Vec<PathBuf>,
    pub download_url: Option<String>,
    /// Upper bound on the whole download, connection included.
    pub download_timeout_ms: u64,
    /// Load at startup instead of on the first request.
    pub preload: bool,
    pub inference_timeout_ms: u64,
    /// `auto`, `cpu` or `cuda`.
    pub device: String,
    pub fallback_seed: u64,
    pub legacy: LegacyArchitectureConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            compatible_path: PathBuf::from("hair-diseases-compatible.pt"),
            legacy_paths: vec![
                PathBuf::from("hair-diseases.safetensors"),
                PathBuf::from("minor/hair-diseases.safetensors"),
            ],
            download_url: None,
            download_timeout_ms: 300_000,
            preload: true,
            inference_timeout_ms: 30_000,
            device: "auto".to_string(),
            fallback_seed: 42,
            legacy: LegacyArchitectureConfig::default(),
        }
    }
}

/// Hyperparameters of the attention layers in legacy weight files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyArchitectureConfig {
    pub attention_units: i64,
    pub head_num: i64,
}

impl Default for LegacyArchitectureConfig {
    fn default() -> Self {
        Self {
            attention_units: 32,
            head_num: 8,
        }
    }
}

impl AppConfig {
    /// Reads the YAML file named by `HAIRSCAN_CONFIG` (or the default path),
    /// then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("HAIRSCAN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = if Path::new(&path).exists() {
            Self::from_file(&path)?
        } else {
            log::info!("No config file at {}, using defaults", path);
            Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = env::var("HOST") {
            self.server.host = host;
        }
        if let Some(port) = parse_env("PORT")? {
            self.server.port = port;
        }
        if let Some(max_upload_bytes) = parse_env("MAX_UPLOAD_BYTES")? {
            self.server.max_upload_bytes = max_upload_bytes;
        }
        if let Ok(path) = env::var("MODEL_PATH") {
            self.model.compatible_path = PathBuf::from(path);
        }
        if let Ok(paths) = env::var("LEGACY_MODEL_PATHS") {
            self.model.legacy_paths = paths
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Ok(url) = env::var("MODEL_DOWNLOAD_URL") {
            self.model.download_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(timeout) = parse_env("MODEL_DOWNLOAD_TIMEOUT_MS")? {
            self.model.download_timeout_ms = timeout;
        }
        if let Some(preload) = parse_env("MODEL_PRELOAD")? {
            self.model.preload = preload;
        }
        if let Some(timeout) = parse_env("INFERENCE_TIMEOUT_MS")? {
            self.model.inference_timeout_ms = timeout;
        }
        if let Ok(device) = env::var("TORCH_DEVICE") {
            self.model.device = device.to_lowercase();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_upload_bytes must be non-zero".into(),
            ));
        }
        if self.model.inference_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "model.inference_timeout_ms must be non-zero".into(),
            ));
        }
        if self.model.download_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "model.download_timeout_ms must be non-zero".into(),
            ));
        }
        if self.model.legacy.head_num <= 0 || self.model.legacy.attention_units <= 0 {
            return Err(ConfigError::Invalid(
                "model.legacy attention parameters must be positive".into(),
            ));
        }
        match self.model.device.as_str() {
            "auto" | "cpu" | "cuda" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "model.device must be auto, cpu or cuda (got {other})"
            ))),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
        Err(_) => Ok(None),
    }
}
