
//! Tunable constants as data.
//!
//! Every timing constant and tolerance of the registry lives in one
//! [`Tuning`] value that can be loaded from TOML at startup:
//!
//! ```toml
//! # iopar.toml
//! [netio]
//! keepalive_secs = 2.0
//!
//! [motor]
//! deadband = 0.02
//! ```
//!
//! ```rust,ignore
//! let tuning = Tuning::from_toml_file("iopar.toml")?;
//! let io = Io::builder().tuning(tuning).build();
//! ```
//!
//! # Defaults
//!
//! `Tuning::default()` reproduces the behavior of deployed controllers: a
//! one second keepalive, 0.1% shared tolerance, a 0.01 motor dead-band, and
//! so on.

use std::path::PathBuf;

#[cfg(feature = "config-file")]
use std::path::Path;

#[cfg(feature = "config-file")]
use serde::{Deserialize, Serialize};

use crate::config::{Consts, Presets};

// ---------------------------------------------------------------------------
// Top-level Tuning
// ---------------------------------------------------------------------------

/// All tunables of one registry.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct Tuning {
    pub netio: NetioTuning,
    pub shared: SharedTuning,
    pub motor: MotorTuning,
    pub teleruptor: TeleruptorTuning,
    pub longpress: LongPressTuning,
    pub quota: QuotaTuning,
    pub sysfs: SysfsTuning,
    pub paths: PathTuning,
}

impl Tuning {
    /// Load from a TOML string.
    #[cfg(feature = "config-file")]
    pub fn from_toml_str(s: &str) -> Result<Self, TuningError> {
        toml::from_str(s).map_err(TuningError::Toml)
    }

    /// Load from a TOML file on disk.
    #[cfg(feature = "config-file")]
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, TuningError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(TuningError::Io)?;
        Self::from_toml_str(&content)
    }

    /// Serialize back to TOML, e.g. to dump the effective settings.
    #[cfg(feature = "config-file")]
    pub fn to_toml_string(&self) -> Result<String, TuningError> {
        toml::to_string_pretty(self).map_err(TuningError::TomlSer)
    }

    /// Load and validate in one step.
    #[cfg(feature = "config-file")]
    pub fn load_validated(path: impl AsRef<Path>) -> Result<Self, TuningError> {
        let tuning = Self::from_toml_file(path)?;
        let errors = tuning.validate();
        if errors.is_empty() {
            Ok(tuning)
        } else {
            Err(TuningError::Validation(errors))
        }
    }

    /// Validate all values are within acceptable ranges.
    ///
    /// Returns a list of validation errors. An empty list means the tuning
    /// is valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !(self.netio.keepalive_secs > 0.0) {
            errors.push(format!(
                "netio.keepalive_secs must be > 0, got {}",
                self.netio.keepalive_secs
            ));
        }
        if self.netio.lost_after < 1.0 {
            errors.push(format!(
                "netio.lost_after must be >= 1, got {}",
                self.netio.lost_after
            ));
        }

        // Relative tolerance in [0, 1)
        if !(0.0..1.0).contains(&self.shared.tolerance) {
            errors.push(format!(
                "shared.tolerance must be in [0, 1), got {}",
                self.shared.tolerance
            ));
        }

        if !(0.0..0.5).contains(&self.motor.deadband) {
            errors.push(format!(
                "motor.deadband must be in [0, 0.5), got {}",
                self.motor.deadband
            ));
        }
        if !(self.motor.poll_secs > 0.0) {
            errors.push(format!("motor.poll_secs must be > 0, got {}", self.motor.poll_secs));
        }
        if self.motor.cooldown_secs < 0.0 {
            errors.push(format!(
                "motor.cooldown_secs must be >= 0, got {}",
                self.motor.cooldown_secs
            ));
        }
        if self.motor.hysteresis < 0.0 {
            errors.push(format!(
                "motor.hysteresis must be >= 0, got {}",
                self.motor.hysteresis
            ));
        }

        if !(self.teleruptor.settle_secs > 0.0) {
            errors.push(format!(
                "teleruptor.settle_secs must be > 0, got {}",
                self.teleruptor.settle_secs
            ));
        }
        if self.teleruptor.max_pulses == 0 {
            errors.push("teleruptor.max_pulses must be > 0".into());
        }

        if !(self.longpress.delay_secs > 0.0) {
            errors.push(format!(
                "longpress.delay_secs must be > 0, got {}",
                self.longpress.delay_secs
            ));
        }

        if !(self.quota.reclaim_secs > 0.0) {
            errors.push(format!(
                "quota.reclaim_secs must be > 0, got {}",
                self.quota.reclaim_secs
            ));
        }

        if !(self.sysfs.poll_secs > 0.0) {
            errors.push(format!("sysfs.poll_secs must be > 0, got {}", self.sysfs.poll_secs));
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// Sub-sections
// ---------------------------------------------------------------------------

/// Netio liveness timing.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct NetioTuning {
    /// Interval of `*keepalive` / `*subscribe` lines. Default: 1.0.
    pub keepalive_secs: f64,
    /// A remote is lost after this many silent intervals. Default: 2.0.
    pub lost_after: f64,
}

impl Default for NetioTuning {
    fn default() -> Self {
        Self {
            keepalive_secs: 1.0,
            lost_after: 2.0,
        }
    }
}

/// Shared parameter arbitration.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct SharedTuning {
    /// Relative tolerance under which a competing write is accepted.
    /// Default: 0.001.
    pub tolerance: f64,
}

impl Default for SharedTuning {
    fn default() -> Self {
        Self { tolerance: 0.001 }
    }
}

/// Motor controller timing.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct MotorTuning {
    /// Position dead-band in position mode. Default: 0.01.
    pub deadband: f64,
    /// Pause after stopping before moving again. Default: 0.2.
    pub cooldown_secs: f64,
    /// Longest interval between position updates while moving. Default: 0.5.
    pub poll_secs: f64,
    /// Overshoot past a bound that counts as end-of-course. Default: 0.002.
    pub hysteresis: f64,
    /// Rescheduled attempts after an output write failure. Default: 3.
    pub max_retries: u32,
}

impl Default for MotorTuning {
    fn default() -> Self {
        Self {
            deadband: 0.01,
            cooldown_secs: 0.2,
            poll_secs: 0.5,
            hysteresis: 0.002,
            max_retries: 3,
        }
    }
}

/// Teleruptor pulse timing.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct TeleruptorTuning {
    /// Pulse width and settle time. Default: 0.2.
    pub settle_secs: f64,
    /// Pulses per setpoint change before giving up. Default: 3.
    pub max_pulses: u32,
}

impl Default for TeleruptorTuning {
    fn default() -> Self {
        Self {
            settle_secs: 0.2,
            max_pulses: 3,
        }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct LongPressTuning {
    /// Hold time that makes a press long, unless the `longpress` const
    /// overrides it. Default: 0.5.
    pub delay_secs: f64,
}

impl Default for LongPressTuning {
    fn default() -> Self {
        Self { delay_secs: 0.5 }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct QuotaTuning {
    /// Silence after which a client's grant returns to the pool. Default: 1.0.
    pub reclaim_secs: f64,
}

impl Default for QuotaTuning {
    fn default() -> Self {
        Self { reclaim_secs: 1.0 }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct SysfsTuning {
    /// Default poll period of `sysfs:` parameters. Default: 1.0.
    pub poll_secs: f64,
}

impl Default for SysfsTuning {
    fn default() -> Self {
        Self { poll_secs: 1.0 }
    }
}

/// Filesystem locations. Overridable so tests can point at a temp tree.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "config-file", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config-file", serde(default))]
pub struct PathTuning {
    /// Root of the sysfs tree used by `led:` and `backlight:`. Default: `/sys`.
    pub sysfs_root: PathBuf,
    /// Directory of input event devices. Default: `/dev/input`.
    pub input_dir: PathBuf,
    pub preset_files: Vec<PathBuf>,
    pub const_files: Vec<PathBuf>,
}

impl Default for PathTuning {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            input_dir: PathBuf::from("/dev/input"),
            preset_files: Presets::default_paths(),
            const_files: Consts::default_paths(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from loading tuning files.
#[derive(Debug)]
pub enum TuningError {
    /// I/O error reading a file.
    Io(std::io::Error),
    /// TOML parse error.
    #[cfg(feature = "config-file")]
    Toml(toml::de::Error),
    /// TOML serialization error.
    #[cfg(feature = "config-file")]
    TomlSer(toml::ser::Error),
    /// Validation errors.
    Validation(Vec<String>),
}

impl std::fmt::Display for TuningError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            #[cfg(feature = "config-file")]
            Self::Toml(e) => write!(f, "TOML parse error: {e}"),
            #[cfg(feature = "config-file")]
            Self::TomlSer(e) => write!(f, "TOML serialize error: {e}"),
            Self::Validation(errors) => {
                write!(f, "validation errors: {}", errors.join("; "))
            }
        }
    }
}

impl std::error::Error for TuningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            #[cfg(feature = "config-file")]
            Self::Toml(e) => Some(e),
            #[cfg(feature = "config-file")]
            Self::TomlSer(e) => Some(e),
            Self::Validation(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
