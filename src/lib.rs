//! # grid-cascade
//!
//! Multi-core LBP cascade object detection over a shared control region.
//!
//! A detection call builds a scale pyramid from the input image, writes the
//! pyramid and the classifier into one shared memory region, and hands out
//! one task per image tile to a fixed pool of worker cores with exactly-once
//! claim semantics. Each core repeatedly pulls a tile into local memory, runs
//! the cascade interpreter over every eligible scan window, and writes its
//! hits back; the host polls for completion and merges the raw per-tile hits
//! into final detections.
//!
//! ## Architecture
//!
//! The library is organized into focused modules:
//! - `classifier`: the cascade byte format, typed node stream and file codec
//! - `engine`: the per-window LBP evaluation interpreter
//! - `device`: the shared control region, counters, transfers and the
//!   per-core scheduler
//! - `pyramid`: scale pyramid construction and tile planning
//! - `session`: orchestration of one detection batch (device and host paths)
//! - `config`: user-facing configuration and validation
//!
//! Grouping of raw detections lives in the `cascade-merge` workspace crate
//! and is re-exported here.
//!
//! ## Example
//!
//! ```rust,no_run
//! use grid_cascade::{detect_objects, Cascade, DetectOptions, Pixmap};
//!
//! # fn main() -> grid_cascade::DetectResult<()> {
//! let image = Pixmap::load("portrait.img")?;
//! let classifier = Cascade::load("lbpcascade_frontalface.dat")?;
//!
//! let detections = detect_objects(&image, &classifier, &DetectOptions::default())?;
//! for rect in &detections {
//!     println!("{}x{} at ({}, {})", rect.width, rect.height, rect.x, rect.y);
//! }
//! # Ok(())
//! # }
//! ```

// Internal module imports
mod checksum;
pub mod classifier;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod pixmap;
pub mod pyramid;
pub mod session;

use std::path::PathBuf;

/// Re-export the grouping crate's surface for convenience.
pub use cascade_merge::{group_rectangles, intersection_amount, Rect, RectList};

pub use classifier::{Cascade, CascadeBuilder};
pub use config::DetectConfig;
pub use engine::ScanMode;
pub use error::{DetectError, DetectResult, ResultCode};
pub use pixmap::Pixmap;
pub use session::{detect_multi_scale_device, detect_multi_scale_host};

/// Where detection runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionMode {
    /// On the host, without the device protocol.
    Host,
    /// On the worker-core pool behind the shared control region.
    Device,
}

/// Options for [`detect_objects`].
#[derive(Clone, Debug)]
pub struct DetectOptions {
    pub mode: DetectionMode,
    pub scan_mode: ScanMode,
    /// Worker cores for the device path; ignored by the host path.
    pub num_cores: usize,
    /// Minimum detections per group; `< 1` disables grouping.
    pub min_neighbors: i32,
    /// Optional per-core cycle log (device path only).
    pub log_path: Option<PathBuf>,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            mode: DetectionMode::Device,
            scan_mode: ScanMode::Even,
            num_cores: device::region::MAX_CORES,
            min_neighbors: 3,
            log_path: None,
        }
    }
}

/// Run multiscale detection and group the raw hits into final rectangles.
///
/// This is the top-level entry point: it dispatches to the device or host
/// path, then clusters the raw per-window detections with the configured
/// neighbor threshold.
pub fn detect_objects(
    image: &Pixmap,
    classifier: &Cascade,
    options: &DetectOptions,
) -> DetectResult<Vec<Rect>> {
    let mut raw = RectList::new();
    match options.mode {
        DetectionMode::Host => {
            session::detect_multi_scale_host(image, classifier, &mut raw, options.scan_mode)?;
        }
        DetectionMode::Device => {
            session::detect_multi_scale_device(
                image,
                classifier,
                &mut raw,
                options.scan_mode,
                options.num_cores,
                options.log_path.as_deref(),
            )?;
        }
    }
    Ok(group_rectangles(&raw, options.min_neighbors))
}
