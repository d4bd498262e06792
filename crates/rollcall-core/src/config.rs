use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Runtime configuration shared by the daemon and the CLI.
///
/// Built from defaults, then an optional TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine distance a match must stay strictly below.
    pub match_threshold: f32,
    /// Hard limit on how long one recognition session stays active.
    pub session_timeout_secs: u64,
    /// Frames discarded after opening the camera (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Drop nearly black frames before they reach the scheduler.
    pub skip_dark_frames: bool,
}

/// Every key optional; present keys override the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    session_timeout_secs: Option<u64>,
    warmup_frames: Option<usize>,
    skip_dark_frames: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            model_dir: crate::default_model_dir(),
            db_path: crate::data_dir().join("attendance.db"),
            match_threshold: 1.0,
            session_timeout_secs: 300,
            warmup_frames: 4,
            skip_dark_frames: true,
        }
    }
}

impl Config {
    /// Load defaults, the config file if one exists, then the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let path = config_path();
        if path.exists() {
            config.merge_file(&path)?;
            tracing::debug!(path = %path.display(), "loaded config file");
        }
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make every session useless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold.is_finite() && self.match_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                key: "match_threshold",
                reason: format!("must be a positive number, got {}", self.match_threshold),
            });
        }
        if self.session_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "session_timeout_secs",
                reason: "must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.merge_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn merge_toml(&mut self, text: &str) -> Result<(), toml::de::Error> {
        let file: FileConfig = toml::from_str(text)?;
        if let Some(v) = file.camera_device {
            self.camera_device = v;
        }
        if let Some(v) = file.model_dir {
            self.model_dir = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.match_threshold {
            self.match_threshold = v;
        }
        if let Some(v) = file.session_timeout_secs {
            self.session_timeout_secs = v;
        }
        if let Some(v) = file.warmup_frames {
            self.warmup_frames = v;
        }
        if let Some(v) = file.skip_dark_frames {
            self.skip_dark_frames = v;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Ok(v) = std::env::var("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        self.match_threshold = env_parse("ROLLCALL_MATCH_THRESHOLD", self.match_threshold);
        self.session_timeout_secs =
            env_parse("ROLLCALL_SESSION_TIMEOUT_SECS", self.session_timeout_secs);
        self.warmup_frames = env_parse("ROLLCALL_WARMUP_FRAMES", self.warmup_frames);
        self.skip_dark_frames = env_flag("ROLLCALL_SKIP_DARK_FRAMES", self.skip_dark_frames);
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the FaceNet recognition model.
    pub fn facenet_model_path(&self) -> String {
        self.model_dir
            .join("facenet.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("ROLLCALL_CONFIG") {
        return PathBuf::from(p);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| crate::home_dir().join(".config"))
        .join("rollcall/config.toml")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Like [`env_parse`] for booleans, also accepting `1` and `0`.
fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref().map(str::trim) {
        Some("1") => true,
        Some("0") => false,
        Some(v) => v.parse().unwrap_or(default),
        None => default,
    }
}
