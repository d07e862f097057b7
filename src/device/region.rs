//! The shared control region and its layout.
//!
//! One contiguous block holds everything the host and the cores exchange
//! during a detection batch:
//!
//! ```text
//! [ image property table | classifier bytes | pixel arena | task array | timers ]
//! ```
//!
//! Capacities are hard device ceilings, not tuning knobs: the classifier must
//! fit the slice of core-local memory reserved for it, a tile (in its locally
//! packed form) must fit the core's tile banks, and the arena/task/timer
//! tables have fixed sizes. Exceeding any of them is a reported error, never
//! a silent truncation.
//!
//! The four control counters are *not* part of the mapping; they live in the
//! mutex-guarded [`CounterBank`], which is the only concurrently-mutated
//! state. Everything inside the mapping is either written single-threaded by
//! the host before the cores are released, or written by exactly one core
//! into a range it claimed through the counters.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::classifier::Cascade;
use crate::device::sync::CounterBank;
use crate::device::transfer::SharedArena;
use crate::error::{DetectError, DetectResult};
use crate::pixmap::{round_up8, Pixmap};

/// Size of one core-local memory bank in bytes.
pub const BANK_SIZE: usize = 8192;
/// Recommended tile side. Tiles overlap so detections at edges are not lost.
pub const RECOMMENDED_TILE_SIZE: usize = 128;
/// Maximum detections recorded per tile; extra hits are silently dropped.
/// Even, so the transferred record stays on a 64-bit boundary.
pub const MAX_DETECTIONS_PER_TILE: usize = 16;
/// The classifier must fit one bank with space left for the core's stack.
pub const MAX_CLASSIFIER_BYTES: usize = BANK_SIZE - 512;
/// Core clock in MHz, to convert cycle counts to wall time.
pub const CORE_FREQUENCY: u32 = 400;
/// Accumulated timer values are pre-shifted by this to avoid u32 overflow.
pub const TIMER_VALUE_SHIFT: u32 = 7;

/// Serialized size of one task record.
pub const TASK_BYTES: usize = 32 + 4 * MAX_DETECTIONS_PER_TILE;
/// Serialized size of one timer record.
pub const TIMER_BYTES: usize = 8;
/// Serialized size of one image property record.
pub const IMAGE_PROP_BYTES: usize = 16;

/// A locally-packed tile must fit two banks next to the task and timer
/// records, with room left over.
pub const MAX_TILE_BYTES: usize = BANK_SIZE * 2 - TASK_BYTES - TIMER_BYTES - 1024;
/// Maximum images in the scale pyramid.
pub const MAX_IMAGES: usize = 30;
/// Pixel arena capacity.
pub const MAX_ARENA_BYTES: usize = 16_480_000;
/// Maximum worker cores.
pub const MAX_CORES: usize = 16;
/// Task array capacity.
pub const MAX_TASKS: usize = 2048;

const IMAGE_TABLE_OFFSET: usize = 0;
const CLASSIFIER_OFFSET: usize = IMAGE_TABLE_OFFSET + MAX_IMAGES * IMAGE_PROP_BYTES;
const ARENA_OFFSET: usize = CLASSIFIER_OFFSET + MAX_CLASSIFIER_BYTES;
const TASKS_OFFSET: usize = ARENA_OFFSET + MAX_ARENA_BYTES;
const TIMERS_OFFSET: usize = TASKS_OFFSET + MAX_TASKS * TASK_BYTES;
const REGION_BYTES: usize = TIMERS_OFFSET + MAX_CORES * TIMER_BYTES;

/// One pyramid image resident in the pixel arena. `offset` is relative to the
/// arena start; `step` is a multiple of 8.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImageProperty {
    pub offset: i32,
    pub step: i32,
    pub width: i32,
    pub height: i32,
}

impl ImageProperty {
    fn encode(&self) -> [u8; IMAGE_PROP_BYTES] {
        let mut out = [0u8; IMAGE_PROP_BYTES];
        out[0..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.step.to_le_bytes());
        out[8..12].copy_from_slice(&self.width.to_le_bytes());
        out[12..16].copy_from_slice(&self.height.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8; IMAGE_PROP_BYTES]) -> Self {
        let field = |i: usize| i32::from_le_bytes(bytes[4 * i..4 * i + 4].try_into().unwrap());
        Self {
            offset: field(0),
            step: field(1),
            width: field(2),
            height: field(3),
        }
    }
}

/// One unit of work: a tile of one pyramid image plus its result slots.
///
/// `step` is the tile's locally packed row step (`round_up8(width)`) and
/// `area = step * height` is the local footprint checked against
/// [`MAX_TILE_BYTES`]. A result slot packs a window origin as
/// `x | (y << 16)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskItem {
    pub offset: i32,
    pub width: i32,
    pub height: i32,
    pub area: i32,
    pub step: i32,
    pub scan_mode: i32,
    pub items_count: i32,
    pub image_index: i32,
    pub results: [i32; MAX_DETECTIONS_PER_TILE],
}

impl TaskItem {
    /// Build a task for a tile at arena-relative `offset`.
    pub fn new(offset: i32, width: i32, height: i32, scan_mode: i32, image_index: i32) -> Self {
        let step = round_up8(width as usize) as i32;
        Self {
            offset,
            width,
            height,
            area: step * height,
            step,
            scan_mode,
            items_count: 0,
            image_index,
            results: [0; MAX_DETECTIONS_PER_TILE],
        }
    }

    /// Record a detection at window origin `(x, y)` in tile coordinates.
    /// Hits beyond the per-tile cap are silently dropped.
    pub fn push_hit(&mut self, x: i32, y: i32) {
        let count = self.items_count as usize;
        if count < MAX_DETECTIONS_PER_TILE {
            self.results[count] = x | (y << 16);
            self.items_count += 1;
        }
    }

    /// Recorded detections as `(x, y)` tile coordinates.
    pub fn hits(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.results[..(self.items_count as usize).min(MAX_DETECTIONS_PER_TILE)]
            .iter()
            .map(|&packed| (packed & 0xFFFF, (packed >> 16) & 0xFFFF))
    }

    fn encode(&self) -> [u8; TASK_BYTES] {
        let mut out = [0u8; TASK_BYTES];
        let header = [
            self.offset,
            self.width,
            self.height,
            self.area,
            self.step,
            self.scan_mode,
            self.items_count,
            self.image_index,
        ];
        for (i, value) in header.iter().enumerate() {
            out[4 * i..4 * i + 4].copy_from_slice(&value.to_le_bytes());
        }
        for (i, value) in self.results.iter().enumerate() {
            out[32 + 4 * i..36 + 4 * i].copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8; TASK_BYTES]) -> Self {
        let field = |i: usize| i32::from_le_bytes(bytes[4 * i..4 * i + 4].try_into().unwrap());
        let mut results = [0i32; MAX_DETECTIONS_PER_TILE];
        for (i, slot) in results.iter_mut().enumerate() {
            *slot = field(8 + i);
        }
        Self {
            offset: field(0),
            width: field(1),
            height: field(2),
            area: field(3),
            step: field(4),
            scan_mode: field(5),
            items_count: field(6),
            image_index: field(7),
            results,
        }
    }
}

/// Per-core cycle counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimerRecord {
    /// Accumulated cycles, pre-shifted by [`TIMER_VALUE_SHIFT`].
    pub value: u32,
    pub core_id: u32,
}

impl TimerRecord {
    fn encode(&self) -> [u8; TIMER_BYTES] {
        let mut out = [0u8; TIMER_BYTES];
        out[0..4].copy_from_slice(&self.value.to_le_bytes());
        out[4..8].copy_from_slice(&self.core_id.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8; TIMER_BYTES]) -> Self {
        Self {
            value: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            core_id: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

/// The shared control region for one detection batch.
pub struct ControlRegion {
    arena: SharedArena,
    counters: CounterBank,
    reset: AtomicBool,
    image_count: usize,
    arena_used: usize,
    task_count: usize,
    classifier_len: usize,
}

impl ControlRegion {
    /// Map a fresh, zeroed region.
    pub fn new() -> DetectResult<Self> {
        Ok(Self {
            arena: SharedArena::new(REGION_BYTES)?,
            counters: CounterBank::new(),
            reset: AtomicBool::new(false),
            image_count: 0,
            arena_used: 0,
            task_count: 0,
            classifier_len: 0,
        })
    }

    pub fn counters(&self) -> &CounterBank {
        &self.counters
    }

    /// External reset observed by cores in their WAIT state; this is the only
    /// way out of the scheduler loop.
    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    /// Copy the classifier into its region slice.
    ///
    /// The capacity check runs before any byte is moved: a classifier that
    /// does not fit core-local memory never touches the device.
    pub fn upload_classifier(&mut self, classifier: &Cascade) -> DetectResult<()> {
        if classifier.is_empty() {
            return Err(DetectError::argument("classifier", "empty classifier"));
        }
        if classifier.size() > MAX_CLASSIFIER_BYTES {
            return Err(DetectError::capacity(
                "classifier",
                classifier.size(),
                MAX_CLASSIFIER_BYTES,
            ));
        }
        self.arena
            .write(CLASSIFIER_OFFSET, classifier.as_bytes(), true);
        self.classifier_len = classifier.size();
        Ok(())
    }

    pub fn classifier_len(&self) -> usize {
        self.classifier_len
    }

    /// Core-side copy of the classifier into local memory.
    pub fn read_classifier(&self, dst: &mut [u8]) {
        self.arena.read(CLASSIFIER_OFFSET, dst, true);
    }

    /// Register a pyramid image: copy its pixels into the arena and its
    /// properties into the image table. Returns the image index.
    pub fn push_image(&mut self, image: &Pixmap) -> DetectResult<usize> {
        if self.image_count == MAX_IMAGES {
            return Err(DetectError::memory(format!(
                "image table ({MAX_IMAGES} entries)"
            )));
        }
        let bytes = image.as_bytes();
        if self.arena_used + bytes.len() > MAX_ARENA_BYTES {
            return Err(DetectError::memory(format!(
                "pixel arena ({MAX_ARENA_BYTES} bytes)"
            )));
        }

        let index = self.image_count;
        let property = ImageProperty {
            offset: self.arena_used as i32,
            step: image.step() as i32,
            width: image.width() as i32,
            height: image.height() as i32,
        };
        self.arena.write(ARENA_OFFSET + self.arena_used, bytes, true);
        self.arena.write(
            IMAGE_TABLE_OFFSET + index * IMAGE_PROP_BYTES,
            &property.encode(),
            true,
        );

        self.image_count += 1;
        self.arena_used += bytes.len();
        Ok(index)
    }

    pub fn image_count(&self) -> usize {
        self.image_count
    }

    pub fn image_property(&self, index: usize) -> ImageProperty {
        assert!(index < self.image_count, "image index out of range");
        let mut bytes = [0u8; IMAGE_PROP_BYTES];
        self.arena
            .read(IMAGE_TABLE_OFFSET + index * IMAGE_PROP_BYTES, &mut bytes, true);
        ImageProperty::decode(&bytes)
    }

    /// Append a task to the task array. Returns the task index.
    pub fn push_task(&mut self, task: &TaskItem) -> DetectResult<usize> {
        if self.task_count == MAX_TASKS {
            return Err(DetectError::memory(format!(
                "task array ({MAX_TASKS} entries)"
            )));
        }
        debug_assert!(task.area as usize <= MAX_TILE_BYTES);

        let index = self.task_count;
        self.arena
            .write(TASKS_OFFSET + index * TASK_BYTES, &task.encode(), true);
        self.task_count += 1;
        Ok(index)
    }

    pub fn task_count(&self) -> usize {
        self.task_count
    }

    pub fn read_task(&self, index: usize) -> TaskItem {
        assert!(index < self.task_count, "task index out of range");
        let mut bytes = [0u8; TASK_BYTES];
        self.arena
            .read(TASKS_OFFSET + index * TASK_BYTES, &mut bytes, true);
        TaskItem::decode(&bytes)
    }

    /// Core-side writeback of a completed task (results and count).
    pub fn write_task(&self, index: usize, task: &TaskItem) {
        assert!(index < self.task_count, "task index out of range");
        self.arena
            .write(TASKS_OFFSET + index * TASK_BYTES, &task.encode(), true);
    }

    /// Copy a task's tile from the arena into locally packed form: one row
    /// transfer per tile row, with the final row waited so the caller
    /// observes the whole block as landed.
    pub fn fetch_tile(&self, task: &TaskItem, image_step: usize, dst: &mut [u8]) {
        let width = task.width as usize;
        let height = task.height as usize;
        let step = task.step as usize;
        debug_assert!(dst.len() >= task.area as usize);

        for row in 0..height {
            let src = ARENA_OFFSET + task.offset as usize + row * image_step;
            let wait = row + 1 == height;
            self.arena
                .read(src, &mut dst[row * step..row * step + width], wait);
        }
    }

    pub fn write_timer(&self, slot: usize, record: TimerRecord) {
        assert!(slot < MAX_CORES, "timer slot out of range");
        self.arena
            .write(TIMERS_OFFSET + slot * TIMER_BYTES, &record.encode(), true);
    }

    pub fn read_timer(&self, slot: usize) -> TimerRecord {
        assert!(slot < MAX_CORES, "timer slot out of range");
        let mut bytes = [0u8; TIMER_BYTES];
        self.arena
            .read(TIMERS_OFFSET + slot * TIMER_BYTES, &mut bytes, true);
        TimerRecord::decode(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(TASK_BYTES, 96);
        assert_eq!(MAX_TILE_BYTES, 15_256);
        assert_eq!(MAX_CLASSIFIER_BYTES, 7_680);
        assert_eq!(MAX_CLASSIFIER_BYTES % 8, 0);
        assert_eq!(MAX_DETECTIONS_PER_TILE % 2, 0);
        assert!(REGION_BYTES > MAX_ARENA_BYTES);
    }

    #[test]
    fn test_task_encode_round_trip() {
        let mut task = TaskItem::new(1024, 33, 40, 2, 3);
        task.push_hit(5, 7);
        task.push_hit(100, 200);
        assert_eq!(task.step, 40);
        assert_eq!(task.area, 40 * 40);

        let decoded = TaskItem::decode(&task.encode());
        assert_eq!(decoded, task);
        let hits: Vec<_> = decoded.hits().collect();
        assert_eq!(hits, vec![(5, 7), (100, 200)]);
    }

    #[test]
    fn test_hits_cap_silently() {
        let mut task = TaskItem::new(0, 64, 64, 0, 0);
        for i in 0..40 {
            task.push_hit(i, i);
        }
        assert_eq!(task.items_count as usize, MAX_DETECTIONS_PER_TILE);
        assert_eq!(task.hits().count(), MAX_DETECTIONS_PER_TILE);
    }

    #[test]
    fn test_image_registration_and_fetch() {
        let mut region = ControlRegion::new().unwrap();

        let rows: Vec<u8> = (0..32u32 * 16).map(|i| (i % 256) as u8).collect();
        let image = Pixmap::from_rows(32, 16, &rows).unwrap();
        let index = region.push_image(&image).unwrap();
        assert_eq!(index, 0);

        let property = region.image_property(0);
        assert_eq!(property.width, 32);
        assert_eq!(property.height, 16);
        assert_eq!(property.step, 32);
        assert_eq!(property.offset, 0);

        // Fetch a 10x5 tile at (4, 2) and compare against the source rows.
        let offset = property.offset + 2 * property.step + 4;
        let task = TaskItem::new(offset, 10, 5, 0, 0);
        let mut tile = vec![0u8; task.area as usize];
        region.fetch_tile(&task, property.step as usize, &mut tile);
        for row in 0..5 {
            let expected = image
                .row(2 + row)
                .iter()
                .skip(4)
                .take(10)
                .copied()
                .collect::<Vec<_>>();
            assert_eq!(&tile[row * task.step as usize..row * task.step as usize + 10], &expected[..]);
        }
    }

    #[test]
    fn test_second_image_offset_advances() {
        let mut region = ControlRegion::new().unwrap();
        let a = Pixmap::new(32, 8).unwrap();
        let b = Pixmap::new(16, 4).unwrap();
        region.push_image(&a).unwrap();
        let index = region.push_image(&b).unwrap();
        let property = region.image_property(index);
        assert_eq!(property.offset as usize, a.as_bytes().len());
    }

    #[test]
    fn test_arena_exhaustion_is_memory_error() {
        let mut region = ControlRegion::new().unwrap();
        // 4096x1024 padded grayscale is 4 MiB; the fifth copy exceeds the
        // 16.48 MB arena.
        let big = Pixmap::new(4096, 1024).unwrap();
        for _ in 0..3 {
            region.push_image(&big).unwrap();
        }
        let err = loop {
            match region.push_image(&big) {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.code(), crate::error::ResultCode::Memory);
    }

    #[test]
    fn test_task_round_trip_through_region() {
        let mut region = ControlRegion::new().unwrap();
        let image = Pixmap::new(64, 64).unwrap();
        region.push_image(&image).unwrap();

        let task = TaskItem::new(0, 64, 64, 1, 0);
        let index = region.push_task(&task).unwrap();
        assert_eq!(region.read_task(index), task);

        let mut done = region.read_task(index);
        done.push_hit(1, 2);
        region.write_task(index, &done);
        assert_eq!(region.read_task(index).items_count, 1);
    }

    #[test]
    fn test_oversized_classifier_is_rejected_before_upload() {
        let mut region = ControlRegion::new().unwrap();
        let oversized = Cascade::from_bytes(vec![0u8; MAX_CLASSIFIER_BYTES + 8]);
        let err = region.upload_classifier(&oversized).unwrap_err();
        assert_eq!(err.code(), crate::error::ResultCode::Other);
        assert_eq!(region.classifier_len(), 0);
    }

    #[test]
    fn test_timer_slots_round_trip() {
        let region = ControlRegion::new().unwrap();
        let record = TimerRecord {
            value: 123_456,
            core_id: 7,
        };
        region.write_timer(3, record);
        assert_eq!(region.read_timer(3), record);
        assert_eq!(region.read_timer(0), TimerRecord::default());
    }
}
