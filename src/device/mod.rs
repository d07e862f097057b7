//! # Device Model
//!
//! The detection batch runs on a fixed pool of independent worker cores that
//! share one memory region with the host. Everything the cores and the host
//! exchange goes through this module:
//!
//! - [`sync`]: the mutex-guarded bounded counters all cross-core coordination
//!   is built from
//! - [`transfer`]: bulk copies in and out of the shared mapping, with a
//!   verified-completion wait mode
//! - [`region`]: the control region layout (image table, classifier bytes,
//!   pixel arena, task array, per-core timers) and its capacity ceilings
//! - [`worker`]: the per-core scheduler state machine that claims and
//!   evaluates tasks
//!
//! The region lives for exactly one detection call: the host constructs it,
//! the cores consume it, and the host tears it down after collecting results.

pub mod region;
pub mod sync;
pub mod transfer;
pub mod worker;

pub use region::{ControlRegion, ImageProperty, TaskItem, TimerRecord};
pub use sync::{Counter, CounterBank};
