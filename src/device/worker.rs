//! Per-core task scheduler.
//!
//! Every core runs the same state machine: `INIT -> WAIT -> RUN -> WAIT ->
//! ...`, with no terminal state short of an external reset. `WAIT` spins on
//! the `start_cores` counter until a slot is granted; `RUN` claims task
//! indices one by one until the claim counter saturates, then falls back to
//! `WAIT`. Task claim order and completion order are both unordered; nothing
//! here may assume any correlation between task index and finish time.
//!
//! There is no cancellation at the protocol level. A core stuck in evaluation
//! stalls the whole batch; the timers written alongside each result are
//! diagnostic only, not a liveness mechanism.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::classifier::Cascade;
use crate::device::region::{
    ControlRegion, TimerRecord, CORE_FREQUENCY, MAX_CORES, MAX_TILE_BYTES, TIMER_VALUE_SHIFT,
};
use crate::device::sync::Counter;
use crate::engine::{Program, ScanMode};

/// Convert an elapsed wall-time interval into core cycles.
fn elapsed_cycles(elapsed: Duration) -> u64 {
    elapsed.as_nanos() as u64 * u64::from(CORE_FREQUENCY) / 1000
}

/// Entry point of one worker core. Returns only after the host requests the
/// external reset.
pub fn run_core(region: &ControlRegion, core_index: usize) {
    // INIT: on real hardware exactly one designated core sets up the shared
    // mutex before anyone spins on it; the others skip straight to WAIT. The
    // counter bank is constructed by the host here, so core 0 has nothing
    // left to initialize and the distinction collapses into this comment.
    let counters = region.counters();

    if region.classifier_len() == 0 {
        warn!(core = core_index, "no classifier uploaded; core refuses to run");
        return;
    }

    // Core-local banks: the tile buffer and the classifier copy.
    let mut tile = vec![0u8; MAX_TILE_BYTES];
    let mut classifier_bytes = vec![0u8; region.classifier_len()];
    region.read_classifier(&mut classifier_bytes);

    let program = match Program::compile(&Cascade::from_bytes(classifier_bytes)) {
        Ok(program) => program,
        Err(error) => {
            // The host validates the classifier before releasing any slot,
            // so this core would otherwise sit on a malformed stream and
            // stall the batch. Refusing to run does the same, loudly.
            warn!(core = core_index, %error, "classifier rejected by core");
            return;
        }
    };

    let mut timer_slot: Option<usize> = None;
    let mut timer_value: u32 = 0;

    loop {
        // WAIT: spin until a slot is granted or the region is torn down.
        loop {
            if region.is_reset() {
                return;
            }
            if counters.bounded_decrement(Counter::StartCores, 0) > 0 {
                break;
            }
            std::hint::spin_loop();
        }

        // First grant: claim a timer slot for this core's cycle totals.
        if timer_slot.is_none() {
            let slot = counters.bounded_increment(Counter::TimerIndex, MAX_CORES as i32);
            if (slot as usize) < MAX_CORES {
                timer_slot = Some(slot as usize);
            }
        }

        // RUN: claim and process tasks until the claim counter saturates.
        let task_total = counters.task_count();
        let mut processed = 0usize;
        loop {
            let claim = counters.bounded_increment(Counter::TaskToTake, task_total);
            if claim >= task_total {
                break;
            }
            let index = claim as usize;

            let mut task = region.read_task(index);
            let image = region.image_property(task.image_index as usize);
            region.fetch_tile(&task, image.step as usize, &mut tile);

            let started = Instant::now();
            task.items_count = 0;
            if let Ok(mode) = ScanMode::from_i32(task.scan_mode) {
                program.scan(
                    &tile,
                    task.step as usize,
                    task.width as usize,
                    task.height as usize,
                    mode,
                    &mut |x, y| task.push_hit(x as i32, y as i32),
                );
            }
            timer_value = timer_value
                .wrapping_add((elapsed_cycles(started.elapsed()) >> TIMER_VALUE_SHIFT) as u32);

            region.write_task(index, &task);
            if let Some(slot) = timer_slot {
                region.write_timer(
                    slot,
                    TimerRecord {
                        value: timer_value,
                        core_id: core_index as u32,
                    },
                );
            }
            counters.bounded_increment(Counter::TaskFinished, task_total);
            processed += 1;
        }
        debug!(core = core_index, processed, "claim counter saturated");
    }
}
