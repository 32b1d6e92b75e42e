//! Configuration for the CPR stream agent.

use crate::core::history::HISTORY_LIMIT;
use crate::core::windowing::{WindowMode, WINDOW_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to bind the HTTP server to
    pub host: String,

    /// Port to bind to (0 for random)
    pub port: u16,

    /// Path to the classifier artifact
    pub model_path: PathBuf,

    /// Path to the calibration parameters; defaults to `scaler_params.json`
    /// next to the model
    pub scaler_path: Option<PathBuf>,

    /// Allowed CORS origins; `*` allows any origin
    pub cors_origins: Vec<String>,

    /// Class index to label table
    pub class_labels: Vec<String>,

    /// Windowing mode for sessions that never asked for one
    pub default_mode: WindowMode,

    /// Compressions after which a session completes and resets
    pub history_limit: usize,

    /// Upper bound on delivering one event to one observer
    #[serde(with = "duration_millis")]
    pub delivery_timeout: Duration,

    /// Queue depth of each observer channel
    pub observer_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            model_path: PathBuf::from("model/model_cpr.json"),
            scaler_path: None,
            cors_origins: vec!["*".to_string()],
            class_labels: ClassLabels::default().into_inner(),
            default_mode: WindowMode::NonOverlap,
            history_limit: HISTORY_LIMIT,
            delivery_timeout: Duration::from_millis(250),
            observer_buffer: 64,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location when no
    /// path is given. A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default_path = Self::config_path();
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path
            }
        };

        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::Io(config_path.clone(), e))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(config_path, e))
    }

    /// Apply `MODEL_PATH`, `SCALER_PATH`, `CORS_ORIGINS` and `PORT` from the
    /// environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("MODEL_PATH") {
            self.model_path = PathBuf::from(model);
        }
        if let Some(scaler) = lookup("SCALER_PATH") {
            self.scaler_path = Some(PathBuf::from(scaler));
        }
        if let Some(origins) = lookup("CORS_ORIGINS") {
            self.cors_origins = parse_origins(&origins);
        }
        if let Some(port) = lookup("PORT") {
            match port.trim().parse() {
                Ok(p) => self.port = p,
                Err(e) => tracing::warn!("Ignoring invalid PORT '{}': {}", port, e),
            }
        }
    }

    /// Get the path to the default configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cpr-stream-agent")
            .join("config.json")
    }

    /// Calibration file location.
    pub fn resolved_scaler_path(&self) -> PathBuf {
        match &self.scaler_path {
            Some(p) => p.clone(),
            None => self
                .model_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("scaler_params.json"),
        }
    }

    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.iter().any(|o| o == "*")
    }
}

/// Parse a comma-separated origin list; `*` alone allows everything.
pub fn parse_origins(s: &str) -> Vec<String> {
    if s.trim() == "*" {
        return vec!["*".to_string()];
    }
    s.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

/// Per-feature standardization parameters captured at training time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerParams {
    pub mean: Vec<f32>,
    pub scale: Vec<f32>,
}

impl ScalerParams {
    /// Read and validate `{ "mean": [...], "scale": [...] }`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingCalibration(path.to_path_buf()));
        }
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let params: ScalerParams =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        params.validate()?;
        Ok(params)
    }

    /// Mean 0, scale 1: leaves windows untouched.
    pub fn identity() -> Self {
        Self {
            mean: vec![0.0; WINDOW_SIZE],
            scale: vec![1.0; WINDOW_SIZE],
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mean.len() != WINDOW_SIZE || self.scale.len() != WINDOW_SIZE {
            return Err(ConfigError::InvalidCalibration(format!(
                "mean and scale need {WINDOW_SIZE} values, got {} and {}",
                self.mean.len(),
                self.scale.len()
            )));
        }
        if self.mean.iter().chain(&self.scale).any(|v| !v.is_finite()) {
            return Err(ConfigError::InvalidCalibration(
                "non-finite calibration value".to_string(),
            ));
        }
        if self.scale.iter().any(|s| *s == 0.0) {
            return Err(ConfigError::InvalidCalibration("zero scale entry".to_string()));
        }
        Ok(())
    }

    /// Z-score each position of a window.
    pub fn standardize(&self, window: &[f32]) -> Vec<f32> {
        window
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| (x - m) / s)
            .collect()
    }
}

/// Class index to human-readable label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassLabels(Vec<String>);

impl ClassLabels {
    pub fn new(labels: Vec<String>) -> Result<Self, ConfigError> {
        if labels.is_empty() {
            return Err(ConfigError::InvalidModel("class label table is empty".to_string()));
        }
        Ok(Self(labels))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn label(&self, index: usize) -> &str {
        self.0.get(index).map(String::as_str).unwrap_or("unknown")
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

impl Default for ClassLabels {
    fn default() -> Self {
        Self(
            ["stabil", "ga stabil", "cenderung atas", "cenderung bawah"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Parse error in {0:?}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
    #[error("Calibration file {0:?} not found; save the training scaler mean and scale next to the model")]
    MissingCalibration(PathBuf),
    #[error("Invalid calibration: {0}")]
    InvalidCalibration(String),
    #[error("Invalid model: {0}")]
    InvalidModel(String),
}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.default_mode, WindowMode::NonOverlap);
        assert_eq!(config.history_limit, 120);
        assert_eq!(config.class_labels.len(), 4);
        assert!(config.allows_any_origin());
        assert_eq!(
            config.resolved_scaler_path(),
            PathBuf::from("model/scaler_params.json")
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"port": 9001, "delivery_timeout": 50}"#).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.delivery_timeout, Duration::from_millis(50));
        assert_eq!(config.observer_buffer, 64);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("MODEL_PATH", "/srv/models/cpr.json"),
            ("CORS_ORIGINS", "http://a.test, http://b.test"),
            ("PORT", "not-a-port"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.model_path, PathBuf::from("/srv/models/cpr.json"));
        assert_eq!(
            config.resolved_scaler_path(),
            PathBuf::from("/srv/models/scaler_params.json")
        );
        assert_eq!(config.cors_origins, vec!["http://a.test", "http://b.test"]);
        assert!(!config.allows_any_origin());
        assert_eq!(config.port, 8000);
    }

    #[test]
    fn test_scaler_load_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scaler_params.json");

        assert!(matches!(
            ScalerParams::load(&path),
            Err(ConfigError::MissingCalibration(_))
        ));

        std::fs::write(&path, r#"{"mean": [1.0, 2.0], "scale": [1.0, 1.0]}"#).unwrap();
        assert!(matches!(
            ScalerParams::load(&path),
            Err(ConfigError::InvalidCalibration(_))
        ));

        let params = ScalerParams {
            mean: vec![5.0; WINDOW_SIZE],
            scale: vec![2.0; WINDOW_SIZE],
        };
        std::fs::write(&path, serde_json::to_string(&params).unwrap()).unwrap();
        let loaded = ScalerParams::load(&path).unwrap();
        assert_eq!(loaded.standardize(&[7.0; WINDOW_SIZE]), vec![1.0; WINDOW_SIZE]);
    }

    #[test]
    fn test_zero_scale_rejected() {
        let mut params = ScalerParams::identity();
        params.scale[3] = 0.0;
        assert!(params.validate().is_err());
    }
}
