//! # Detection Configuration
//!
//! Common configuration surface shared by the CLI and by embedders. Holds the
//! user-facing knobs, validates them with helpful messages, and converts into
//! the library's [`DetectOptions`](crate::DetectOptions).

use std::path::PathBuf;

use crate::device::region::MAX_CORES;
use crate::engine::ScanMode;
use crate::{DetectOptions, DetectionMode};

/// Configuration for one detection run.
#[derive(Clone, Debug)]
pub struct DetectConfig {
    /// Path of the classifier file (the crate's binary cascade format).
    pub classifier: PathBuf,

    /// Minimum number of detections in a group; groups with fewer members
    /// are discarded. Zero disables grouping entirely.
    pub grouping: i32,

    /// Which window origins to test within each tile.
    pub scan: ScanMode,

    /// Number of worker cores for the device path (1 to [`MAX_CORES`]).
    pub num_cores: usize,

    /// Run detection on the host instead of the worker-core pool.
    pub host: bool,

    /// Optional path for the per-core cycle log (device path only).
    pub log: Option<PathBuf>,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            classifier: PathBuf::from("lbpcascade_frontalface.dat"),
            grouping: 3,
            scan: ScanMode::Even,
            num_cores: MAX_CORES,
            host: false,
            log: None,
        }
    }
}

impl DetectConfig {
    /// Validate the configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_cores == 0 || self.num_cores > MAX_CORES {
            return Err(format!(
                "number of cores must be between 1 and {MAX_CORES}"
            ));
        }
        if self.grouping < 0 {
            return Err("grouping cannot be negative".to_string());
        }
        if self.host && self.log.is_some() {
            return Err("the cycle log is only produced by the device path".to_string());
        }
        Ok(())
    }

    /// Convert to the options consumed by [`crate::detect_objects`].
    pub fn to_options(&self) -> DetectOptions {
        DetectOptions {
            mode: if self.host {
                DetectionMode::Host
            } else {
                DetectionMode::Device
            },
            scan_mode: self.scan,
            num_cores: self.num_cores,
            min_neighbors: self.grouping,
            log_path: self.log.clone(),
        }
    }
}
