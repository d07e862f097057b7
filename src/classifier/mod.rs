//! # Cascade Classifier
//!
//! The classifier is a single contiguous byte buffer holding a typed node
//! stream: one `Meta` node with the native detection window size, one or more
//! stages (each a run of `Decision` nodes closed by a `Stage` node), and a
//! terminating `Final` node. The byte layout is fixed by the on-disk format;
//! [`nodes`] provides typed access over it, [`cascade`] owns the buffer and
//! the file codec.

pub mod cascade;
pub mod nodes;

pub use cascade::{Cascade, CascadeBuilder, FILE_ID_CLASSIFIER};
pub use nodes::{Feature, Node, StreamSummary};
