//! Pipeline configuration.
//!
//! Defaults are tuned for a workstation with the usual tools on `PATH`.
//! Every field can be overridden from the environment (see [`PipelineConfig::from_env`]).

use crate::capability::BackendKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Which product a run ends in. Fixed when the orchestrator is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    /// Poisson surface mesh.
    Mesh,
    /// Trained gaussian splat model.
    #[default]
    Splat,
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Mesh => write!(f, "mesh"),
            Branch::Splat => write!(f, "splat"),
        }
    }
}

impl FromStr for Branch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mesh" => Ok(Branch::Mesh),
            "splat" | "gaussian" => Ok(Branch::Splat),
            other => Err(format!("unknown branch '{other}', expected mesh or splat")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Longest image side after normalization. Larger inputs are downscaled.
    pub max_image_dimension: u32,
    /// Upper bound on SIFT features per image.
    pub feature_cap: u32,
    /// Force GPU flags on or off. `None` probes for an accelerator.
    pub use_acceleration: Option<bool>,
    /// Fewer iterations and smaller stereo windows.
    pub fast_mode: bool,
    /// Maximum dense points transplanted into the trainer initialization.
    pub point_cap: usize,
    pub branch: Branch,
    /// Forced training backend. `None` auto-detects.
    pub backend: Option<BackendKind>,
    pub sfm_binary: String,
    pub python_binary: String,
    pub primary_trainer_dir: PathBuf,
    pub secondary_trainer: String,
    pub accel_probe_binary: String,
    /// Passed to tools as `--*.num_threads`; -1 uses every core.
    pub num_threads: i32,
    pub probe_timeout_ms: u64,
    pub simulated_step_ms: u64,
    pub emit_binary_scene: bool,
    pub min_images: usize,
    pub max_images: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_image_dimension: 1600,
            feature_cap: 8192,
            use_acceleration: None,
            fast_mode: false,
            point_cap: 500_000,
            branch: Branch::Splat,
            backend: None,
            sfm_binary: "colmap".to_string(),
            python_binary: "python3".to_string(),
            primary_trainer_dir: PathBuf::from("/opt/gaussian-splatting"),
            secondary_trainer: "opensplat".to_string(),
            accel_probe_binary: "nvidia-smi".to_string(),
            num_threads: -1,
            probe_timeout_ms: 5000,
            simulated_step_ms: 250,
            emit_binary_scene: true,
            min_images: 3,
            max_images: 200,
        }
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

/// `auto` (or empty) means "decide at runtime".
fn is_auto(value: &str) -> bool {
    let value = value.trim();
    value.is_empty() || value.eq_ignore_ascii_case("auto")
}

impl PipelineConfig {
    /// Layer values from `lookup` over the defaults.
    ///
    /// Keys are the `RECON_*` environment variable names. Unknown keys are
    /// never requested; malformed values are an error rather than ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("RECON_MAX_IMAGE_DIMENSION") {
            config.max_image_dimension = parse("RECON_MAX_IMAGE_DIMENSION", &v)?;
        }
        if let Some(v) = lookup("RECON_FEATURE_CAP") {
            config.feature_cap = parse("RECON_FEATURE_CAP", &v)?;
        }
        if let Some(v) = lookup("RECON_USE_ACCELERATION") {
            config.use_acceleration = if is_auto(&v) {
                None
            } else {
                Some(parse_bool("RECON_USE_ACCELERATION", &v)?)
            };
        }
        if let Some(v) = lookup("RECON_FAST_MODE") {
            config.fast_mode = parse_bool("RECON_FAST_MODE", &v)?;
        }
        if let Some(v) = lookup("RECON_POINT_CAP") {
            config.point_cap = parse("RECON_POINT_CAP", &v)?;
        }
        if let Some(v) = lookup("RECON_BRANCH") {
            config.branch = parse("RECON_BRANCH", &v)?;
        }
        if let Some(v) = lookup("RECON_BACKEND") {
            config.backend = if is_auto(&v) {
                None
            } else {
                Some(parse("RECON_BACKEND", &v)?)
            };
        }
        if let Some(v) = lookup("RECON_SFM_BIN") {
            config.sfm_binary = v;
        }
        if let Some(v) = lookup("RECON_PYTHON_BIN") {
            config.python_binary = v;
        }
        if let Some(v) = lookup("RECON_PRIMARY_TRAINER_DIR") {
            config.primary_trainer_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RECON_SECONDARY_TRAINER_BIN") {
            config.secondary_trainer = v;
        }
        if let Some(v) = lookup("RECON_ACCEL_PROBE_BIN") {
            config.accel_probe_binary = v;
        }
        if let Some(v) = lookup("RECON_NUM_THREADS") {
            config.num_threads = parse("RECON_NUM_THREADS", &v)?;
        }
        if let Some(v) = lookup("RECON_PROBE_TIMEOUT_MS") {
            config.probe_timeout_ms = parse("RECON_PROBE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RECON_SIMULATED_STEP_MS") {
            config.simulated_step_ms = parse("RECON_SIMULATED_STEP_MS", &v)?;
        }
        if let Some(v) = lookup("RECON_EMIT_GLB") {
            config.emit_binary_scene = parse_bool("RECON_EMIT_GLB", &v)?;
        }
        if let Some(v) = lookup("RECON_MIN_IMAGES") {
            config.min_images = parse("RECON_MIN_IMAGES", &v)?;
        }
        if let Some(v) = lookup("RECON_MAX_IMAGES") {
            config.max_images = parse("RECON_MAX_IMAGES", &v)?;
        }

        Ok(config)
    }

    /// Read `RECON_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn training_iterations(&self) -> u32 {
        if self.fast_mode { 7_000 } else { 30_000 }
    }

    pub fn stereo_window_radius(&self) -> u32 {
        if self.fast_mode { 3 } else { 5 }
    }

    pub fn stereo_iterations(&self) -> u32 {
        if self.fast_mode { 3 } else { 5 }
    }

    pub fn poisson_depth(&self) -> u32 {
        if self.fast_mode { 9 } else { 11 }
    }

    /// A configuration for runs that never touch external tools.
    pub fn simulated() -> Self {
        Self {
            backend: Some(BackendKind::Simulated),
            use_acceleration: Some(false),
            ..Self::default()
        }
    }
}
