//! # Detection Session Orchestration
//!
//! The device path runs one complete batch against a freshly constructed
//! control region:
//!
//! 1. validate the arguments (the classifier capacity check runs before the
//!    region is even mapped; an oversized classifier never touches the
//!    device);
//! 2. build the scale pyramid and register every level in the pixel arena;
//! 3. emit one task per tile per level;
//! 4. spawn the worker cores, release exactly `num_cores` execution slots and
//!    poll the finished counter;
//! 5. map the per-tile hits back to source-image coordinates, dump the
//!    per-core timers if a log path was given, and tear the region down.
//!
//! Nothing survives the call: the region, the counters and the workers all
//! live inside it.
//!
//! The host-only path shares the pyramid and the evaluation engine but skips
//! the device protocol entirely, scanning each level in horizontal bands
//! across scoped threads.
//!
//! Known gap, by contract: there is no watchdog. A core that never finishes
//! its task (a stalled evaluation) leaves the completion poll spinning
//! forever.

use std::fs;
use std::path::Path;
use std::time::Instant;

use cascade_merge::{Rect, RectList};
use tracing::{debug, info};

use crate::classifier::Cascade;
use crate::device::region::{
    ControlRegion, TaskItem, CORE_FREQUENCY, MAX_CLASSIFIER_BYTES, MAX_CORES,
    MAX_DETECTIONS_PER_TILE, TIMER_VALUE_SHIFT,
};
use crate::device::sync::Counter;
use crate::device::worker;
use crate::engine::{Program, ScanMode};
use crate::error::{DetectError, DetectResult};
use crate::pixmap::Pixmap;
use crate::pyramid::{build_pyramid, plan_tiles};

/// Validate the inputs shared by both detection paths and compile the
/// classifier window size out of its meta node.
fn validate(image: &Pixmap, classifier: &Cascade) -> DetectResult<(usize, usize)> {
    if image.is_empty() {
        return Err(DetectError::argument("image", "empty image"));
    }
    if classifier.is_empty() {
        return Err(DetectError::argument("classifier", "empty classifier"));
    }
    let summary = classifier
        .check()
        .map_err(|e| DetectError::argument("classifier", e.to_string()))?;
    Ok((summary.window_width as usize, summary.window_height as usize))
}

/// Multiscale object detection on the worker-core pool.
///
/// Detections are appended to `objects` in source-image coordinates. When
/// `log_path` is given, per-core elapsed cycle counts are written there after
/// completion.
pub fn detect_multi_scale_device(
    image: &Pixmap,
    classifier: &Cascade,
    objects: &mut RectList,
    scan_mode: ScanMode,
    num_cores: usize,
    log_path: Option<&Path>,
) -> DetectResult<()> {
    if num_cores == 0 || num_cores > MAX_CORES {
        return Err(DetectError::argument(
            "num_cores",
            format!("must be between 1 and {MAX_CORES}"),
        ));
    }
    let (window_width, window_height) = validate(image, classifier)?;
    // Capacity is rejected before the region exists; no transfer is ever
    // issued for a classifier that cannot fit core-local memory.
    if classifier.size() > MAX_CLASSIFIER_BYTES {
        return Err(DetectError::capacity(
            "classifier",
            classifier.size(),
            MAX_CLASSIFIER_BYTES,
        ));
    }

    let levels = build_pyramid(image, window_width, window_height)?;
    if levels.is_empty() {
        debug!("image smaller than the detection window; nothing to scan");
        return Ok(());
    }

    let mut region = ControlRegion::new()?;
    region.upload_classifier(classifier)?;

    for level in &levels {
        let index = region.push_image(&level.image)?;
        let property = region.image_property(index);
        for tile in plan_tiles(
            level.image.width(),
            level.image.height(),
            window_width,
            window_height,
        ) {
            let offset =
                property.offset + (tile.y as i32) * property.step + tile.x as i32;
            let task = TaskItem::new(
                offset,
                tile.width as i32,
                tile.height as i32,
                scan_mode.as_i32(),
                index as i32,
            );
            region.push_task(&task)?;
        }
    }

    let task_count = region.task_count();
    region.counters().set_task_count(task_count as i32);
    info!(
        levels = levels.len(),
        tasks = task_count,
        cores = num_cores,
        "device detection starting"
    );

    let started = Instant::now();
    std::thread::scope(|scope| {
        for core in 0..num_cores {
            let region = &region;
            scope.spawn(move || worker::run_core(region, core));
        }

        // Release exactly one execution slot per core.
        for _ in 0..num_cores {
            region
                .counters()
                .bounded_increment(Counter::StartCores, num_cores as i32);
        }

        // Completion is unordered; the only signal is the finished counter
        // reaching the task count.
        while region.counters().load(Counter::TaskFinished) < task_count as i32 {
            std::hint::spin_loop();
        }
        region.request_reset();
    });
    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "all tasks finished"
    );

    // Collect: map each tile hit back through its tile origin and the owning
    // level's scale factor.
    objects
        .reserve(task_count * MAX_DETECTIONS_PER_TILE)
        .map_err(|e| DetectError::memory_from("detection list", e))?;
    let source_width = image.width() as f32;
    for index in 0..task_count {
        let task = region.read_task(index);
        let property = region.image_property(task.image_index as usize);
        let scale = source_width / property.width as f32;
        let relative = task.offset - property.offset;
        let tile_x = relative % property.step;
        let tile_y = relative / property.step;
        for (hit_x, hit_y) in task.hits() {
            objects
                .push(Rect::new(
                    (tile_x + hit_x) as f32 * scale,
                    (tile_y + hit_y) as f32 * scale,
                    window_width as f32 * scale,
                    window_height as f32 * scale,
                ))
                .map_err(|e| DetectError::memory_from("detection list", e))?;
        }
    }

    if let Some(path) = log_path {
        write_timer_log(&region, path)?;
    }

    // Dropping the region is the teardown; nothing survives the call.
    Ok(())
}

/// Multiscale object detection on the host, without the device protocol.
///
/// Shares the pyramid construction and the evaluation engine with the device
/// path; each level is scanned in horizontal bands across the available
/// parallelism.
pub fn detect_multi_scale_host(
    image: &Pixmap,
    classifier: &Cascade,
    objects: &mut RectList,
    scan_mode: ScanMode,
) -> DetectResult<()> {
    let (window_width, window_height) = validate(image, classifier)?;
    let program = Program::compile(classifier)?;

    let levels = build_pyramid(image, window_width, window_height)?;
    if levels.is_empty() {
        return Ok(());
    }

    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    info!(levels = levels.len(), threads, "host detection starting");

    for level in &levels {
        let width = level.image.width();
        let height = level.image.height();
        let step = level.image.step();
        let pixels = level.image.as_bytes();

        // Band b owns window origins with y in [start, end); the band slice
        // extends window_height - 1 rows further so those windows are whole.
        let origin_rows = height - window_height + 1;
        let band_rows = origin_rows.div_ceil(threads);

        let mut bands: Vec<Vec<(usize, usize)>> = Vec::new();
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for band in 0..threads {
                let start = band * band_rows;
                if start >= origin_rows {
                    break;
                }
                let end = (start + band_rows).min(origin_rows);
                let band_height = end - start + window_height - 1;
                let slice = &pixels[start * step..];
                let program = &program;
                // Keep the checkerboard phase of the whole level: a band
                // starting on an odd row sees flipped local parity.
                let band_mode = if start % 2 == 0 {
                    scan_mode
                } else {
                    scan_mode.flip()
                };
                handles.push(scope.spawn(move || {
                    let mut hits = Vec::new();
                    program.scan(slice, step, width, band_height, band_mode, &mut |x, y| {
                        hits.push((x, start + y));
                    });
                    hits
                }));
            }
            for handle in handles {
                bands.push(handle.join().unwrap());
            }
        });

        for (hit_x, hit_y) in bands.into_iter().flatten() {
            objects
                .push(Rect::new(
                    hit_x as f32 * level.scale,
                    hit_y as f32 * level.scale,
                    window_width as f32 * level.scale,
                    window_height as f32 * level.scale,
                ))
                .map_err(|e| DetectError::memory_from("detection list", e))?;
        }
    }

    Ok(())
}

/// Dump the per-core cycle totals collected during a device batch.
fn write_timer_log(region: &ControlRegion, path: &Path) -> DetectResult<()> {
    let slots = region.counters().load(Counter::TimerIndex).max(0) as usize;
    let mut report = String::new();
    for slot in 0..slots.min(MAX_CORES) {
        let record = region.read_timer(slot);
        let cycles = u64::from(record.value) << TIMER_VALUE_SHIFT;
        let millis = cycles as f64 / (f64::from(CORE_FREQUENCY) * 1000.0);
        report.push_str(&format!(
            "core {}: {} cycles ({:.3} ms)\n",
            record.core_id, cycles, millis
        ));
    }
    fs::write(path, report).map_err(|e| DetectError::io_at("writing timer log", path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{CascadeBuilder, Feature};
    use crate::error::ResultCode;

    fn accept_all_24() -> Cascade {
        CascadeBuilder::new(24, 24)
            .decision(
                Feature {
                    x: 0,
                    y: 0,
                    width: 1,
                    height: 1,
                },
                1,
                [0xFFFF_FFFF; 8],
            )
            .stage(0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_empty_image_is_argument_error() {
        let mut objects = RectList::new();
        let err = detect_multi_scale_device(
            &Pixmap::empty(),
            &accept_all_24(),
            &mut objects,
            ScanMode::Even,
            4,
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), ResultCode::Argument);
    }

    #[test]
    fn test_zero_cores_is_argument_error() {
        let image = Pixmap::new(64, 64).unwrap();
        let mut objects = RectList::new();
        let err = detect_multi_scale_device(
            &image,
            &accept_all_24(),
            &mut objects,
            ScanMode::Even,
            0,
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), ResultCode::Argument);
    }

    #[test]
    fn test_undersized_image_detects_nothing() {
        let image = Pixmap::new(16, 16).unwrap();
        let mut objects = RectList::new();
        detect_multi_scale_device(&image, &accept_all_24(), &mut objects, ScanMode::Full, 2, None)
            .unwrap();
        assert!(objects.is_empty());
    }

    #[test]
    fn test_host_and_device_agree_on_hit_count() {
        let image = Pixmap::new(40, 40).unwrap();
        let cascade = accept_all_24();

        let mut host = RectList::new();
        detect_multi_scale_host(&image, &cascade, &mut host, ScanMode::Even).unwrap();

        let mut device = RectList::new();
        detect_multi_scale_device(&image, &cascade, &mut device, ScanMode::Even, 3, None).unwrap();

        // Levels are 40, 33 and 27 pixels, one tile each. In even mode the
        // first two levels have 145 and 50 eligible origins (capped at 16
        // per tile); the 27px level has 8, under the cap.
        assert!(device.len() <= host.len());
        assert_eq!(host.len(), 145 + 50 + 8);
        assert_eq!(device.len(), MAX_DETECTIONS_PER_TILE * 2 + 8);
    }

    #[test]
    fn test_timer_log_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timers.log");
        let image = Pixmap::new(48, 48).unwrap();
        let mut objects = RectList::new();
        detect_multi_scale_device(
            &image,
            &accept_all_24(),
            &mut objects,
            ScanMode::Full,
            2,
            Some(&path),
        )
        .unwrap();
        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.lines().count() >= 1);
        assert!(log.contains("cycles"));
    }
}
