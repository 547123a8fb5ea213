use attend_core::{
    default_data_dir, LoopConfig, NamingConvention, SamplerConfig, StabilizerConfig, TrackerKind,
};
use attend_vision::detector::{DEFAULT_NMS_THRESHOLD, DEFAULT_SCORE_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_TOLERANCE: f32 = 1.05;
const DEFAULT_CAMERA_DEVICE: &str = "/dev/video0";
const DEFAULT_WARMUP_FRAMES: usize = 4;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Filename → identity rule, as written in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Naming {
    Stem,
    Prefix,
}

/// Daemon configuration: defaults, then `ATTEND_CONFIG` TOML, then `ATTEND_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory of labelled reference images.
    pub gallery_dir: PathBuf,
    /// Directory holding one `attendance_YYYY-MM-DD.csv` per day.
    pub ledger_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// V4L2 devices; one recognition loop each.
    pub camera_devices: Vec<String>,
    /// Maximum embedding distance for a match (strictly less than).
    pub tolerance: f32,
    pub history_len: usize,
    pub confirm_threshold: usize,
    pub process_every: u32,
    pub downsample: u32,
    pub tracker: TrackerKind,
    pub naming: Naming,
    pub name_separator: char,
    /// Frames discarded after opening a camera (auto-exposure settling).
    pub warmup_frames: usize,
    /// Minimum SCRFD face score.
    pub detect_threshold: f32,
    /// IoU above which overlapping detections are suppressed.
    pub nms_threshold: f32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        let stabilizer = StabilizerConfig::default();
        let sampler = SamplerConfig::default();
        Self {
            gallery_dir: data_dir.join("gallery"),
            ledger_dir: data_dir.join("ledger"),
            model_dir: data_dir.join("models"),
            camera_devices: vec![DEFAULT_CAMERA_DEVICE.to_string()],
            tolerance: DEFAULT_TOLERANCE,
            history_len: stabilizer.history_len,
            confirm_threshold: stabilizer.confirm_threshold,
            process_every: sampler.process_every,
            downsample: sampler.downsample,
            tracker: TrackerKind::Iou,
            naming: Naming::Prefix,
            name_separator: '_',
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            detect_threshold: DEFAULT_SCORE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        }
    }
}

impl Config {
    /// Load from the process environment and validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_sources(|key| std::env::var(key).ok())
    }

    /// Layer an optional TOML file and environment overrides over the defaults.
    ///
    /// `env` stands in for `std::env::var` so tests can inject variables.
    pub fn from_sources(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match env("ATTEND_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = env("ATTEND_GALLERY_DIR") {
            self.gallery_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ATTEND_LEDGER_DIR") {
            self.ledger_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ATTEND_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ATTEND_CAMERA_DEVICES") {
            self.camera_devices = v
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect();
        }
        parse_env(env, "ATTEND_TOLERANCE", &mut self.tolerance)?;
        parse_env(env, "ATTEND_HISTORY_LEN", &mut self.history_len)?;
        parse_env(env, "ATTEND_CONFIRM_THRESHOLD", &mut self.confirm_threshold)?;
        parse_env(env, "ATTEND_PROCESS_EVERY", &mut self.process_every)?;
        parse_env(env, "ATTEND_DOWNSAMPLE", &mut self.downsample)?;
        parse_env(env, "ATTEND_WARMUP_FRAMES", &mut self.warmup_frames)?;
        parse_env(env, "ATTEND_NAME_SEPARATOR", &mut self.name_separator)?;
        parse_env(env, "ATTEND_DETECT_THRESHOLD", &mut self.detect_threshold)?;
        parse_env(env, "ATTEND_NMS_THRESHOLD", &mut self.nms_threshold)?;

        if let Some(v) = env("ATTEND_TRACKER") {
            self.tracker = TrackerKind::parse(&v).ok_or(ConfigError::InvalidEnv {
                key: "ATTEND_TRACKER",
                value: v,
            })?;
        }
        if let Some(v) = env("ATTEND_NAMING") {
            self.naming = match v.trim().to_ascii_lowercase().as_str() {
                "stem" => Naming::Stem,
                "prefix" => Naming::Prefix,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: "ATTEND_NAMING",
                        value: v,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera_devices.is_empty() {
            return Err(ConfigError::Invalid("no camera devices configured".into()));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        for (key, value) in [
            ("detect_threshold", self.detect_threshold),
            ("nms_threshold", self.nms_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be in (0, 1], got {value}"
                )));
            }
        }
        if self.process_every == 0 || self.downsample == 0 {
            return Err(ConfigError::Invalid(
                "process_every and downsample must be at least 1".into(),
            ));
        }
        self.stabilizer()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn stabilizer(&self) -> StabilizerConfig {
        StabilizerConfig {
            history_len: self.history_len,
            confirm_threshold: self.confirm_threshold,
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            tolerance: self.tolerance,
            stabilizer: self.stabilizer(),
            sampler: SamplerConfig {
                process_every: self.process_every,
                downsample: self.downsample,
            },
        }
    }

    pub fn naming_convention(&self) -> NamingConvention {
        match self.naming {
            Naming::Stem => NamingConvention::Stem,
            Naming::Prefix => NamingConvention::Prefix(self.name_separator),
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = env(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { key, value })?;
    }
    Ok(())
}
