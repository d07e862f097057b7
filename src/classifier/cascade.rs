//! Classifier buffer ownership and the binary file codec.
//!
//! On disk a classifier is `[u32 magic][i32 size][size bytes]`, little-endian,
//! where the payload is the node stream described in [`super::nodes`]. The
//! payload size is always a multiple of 8 (transfer sizes are rounded up to a
//! 64-bit boundary), which the writer guarantees by zero-padding after the
//! final node.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::checksum;
use crate::classifier::nodes::{self, Feature, Node, StreamSummary};
use crate::error::{DetectError, DetectResult};

/// Identifier written to the beginning of a classifier file.
pub const FILE_ID_CLASSIFIER: u32 = 1_935_764_547;

/// A cascade classifier: one contiguous, validated-on-demand byte buffer.
///
/// The empty classifier (no data) is the uniform "absence" value; releasing it
/// is idempotent. An empty classifier is never valid.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cascade {
    data: Vec<u8>,
}

impl Cascade {
    /// The empty classifier.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap raw node-stream bytes without validating them. Use
    /// [`Cascade::check`] before evaluation.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the node stream in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Deep copy with an independent buffer.
    pub fn deep_clone(&self) -> Self {
        self.clone()
    }

    /// Release the classifier data. Idempotent.
    pub fn clear(&mut self) {
        self.data = Vec::new();
    }

    /// Order-dependent content digest. Equal content gives equal checksums;
    /// distinct content may collide.
    pub fn checksum(&self) -> u32 {
        checksum::fnv1a32(&self.data)
    }

    /// Validate the node stream grammar. The empty classifier is invalid.
    pub fn check(&self) -> DetectResult<StreamSummary> {
        if self.is_empty() {
            return Err(DetectError::contents("empty classifier"));
        }
        nodes::check(&self.data)
    }

    /// Decode into typed nodes, validating along the way.
    pub fn decode(&self) -> DetectResult<Vec<Node>> {
        if self.is_empty() {
            return Err(DetectError::contents("empty classifier"));
        }
        nodes::decode(&self.data)
    }

    /// Save to the binary classifier format.
    pub fn save(&self, path: impl AsRef<Path>) -> DetectResult<()> {
        let path = path.as_ref();
        if self.is_empty() {
            return Err(DetectError::argument(
                "classifier",
                "empty classifier cannot be saved",
            ));
        }

        let mut file = fs::File::create(path)
            .map_err(|e| DetectError::io_at("creating classifier file", path, e))?;
        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&FILE_ID_CLASSIFIER.to_le_bytes());
        header[4..8].copy_from_slice(&(self.data.len() as i32).to_le_bytes());
        file.write_all(&header)
            .map_err(|e| DetectError::io_at("writing classifier header", path, e))?;
        file.write_all(&self.data)
            .map_err(|e| DetectError::io_at("writing classifier body", path, e))?;
        Ok(())
    }

    /// Load a classifier previously written by [`Cascade::save`].
    ///
    /// The magic tag is validated before the declared size is trusted. The
    /// loaded buffer is not grammar-checked here; run [`Cascade::check`]
    /// before using it for detection.
    pub fn load(path: impl AsRef<Path>) -> DetectResult<Self> {
        let path = path.as_ref();
        let mut file = fs::File::open(path)
            .map_err(|e| DetectError::io_at("opening classifier file", path, e))?;

        let mut header = [0u8; 8];
        file.read_exact(&mut header)
            .map_err(|e| DetectError::io_at("reading classifier header", path, e))?;

        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != FILE_ID_CLASSIFIER {
            return Err(DetectError::contents_at(path, "wrong classifier magic tag"));
        }

        let size = i32::from_le_bytes(header[4..8].try_into().unwrap());
        if size <= 0 || size % 8 != 0 {
            return Err(DetectError::contents_at(
                path,
                format!("implausible classifier size {size}"),
            ));
        }

        let size = size as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|e| DetectError::memory_from("classifier buffer", e))?;
        data.resize(size, 0);
        file.read_exact(&mut data)
            .map_err(|e| DetectError::io_at("reading classifier body", path, e))?;

        Ok(Self { data })
    }
}

/// Assembles a classifier node stream in grammar order.
///
/// Mostly used by tests and by import tooling that converts a foreign cascade
/// representation into this format.
pub struct CascadeBuilder {
    bytes: Vec<u8>,
}

impl CascadeBuilder {
    /// Start a stream for the given native window size.
    pub fn new(window_width: i32, window_height: i32) -> Self {
        let mut bytes = Vec::new();
        Node::Meta {
            window_width,
            window_height,
        }
        .encode_into(&mut bytes);
        Self { bytes }
    }

    /// Append a decision node to the current stage.
    pub fn decision(mut self, feature: Feature, score: i32, subsets: [u32; 8]) -> Self {
        Node::Decision {
            feature,
            score,
            subsets,
        }
        .encode_into(&mut self.bytes);
        self
    }

    /// Close the current stage with its rejection threshold.
    pub fn stage(mut self, threshold: i32) -> Self {
        Node::Stage { threshold }.encode_into(&mut self.bytes);
        self
    }

    /// Terminate the stream, pad to the 8-byte boundary and validate.
    pub fn build(mut self) -> DetectResult<Cascade> {
        Node::Final.encode_into(&mut self.bytes);
        while self.bytes.len() % 8 != 0 {
            self.bytes.push(0);
        }
        let cascade = Cascade::from_bytes(self.bytes);
        cascade.check()?;
        Ok(cascade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;

    fn two_stage_cascade() -> Cascade {
        CascadeBuilder::new(24, 24)
            .decision(
                Feature {
                    x: 0,
                    y: 0,
                    width: 8,
                    height: 8,
                },
                120,
                [0xFFFF_FFFF; 8],
            )
            .stage(100)
            .decision(
                Feature {
                    x: 3,
                    y: 3,
                    width: 4,
                    height: 4,
                },
                -60,
                [0x0F0F_0F0F; 8],
            )
            .stage(-10)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_pads_to_eight() {
        let cascade = two_stage_cascade();
        assert_eq!(cascade.size() % 8, 0);
        let summary = cascade.check().unwrap();
        assert_eq!(summary.stages, 2);
        assert_eq!(summary.decisions, 2);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cascade.dat");

        let cascade = two_stage_cascade();
        cascade.save(&path).unwrap();
        let loaded = Cascade::load(&path).unwrap();

        assert_eq!(loaded, cascade);
        assert_eq!(loaded.checksum(), cascade.checksum());
        assert_eq!(loaded.check().unwrap(), cascade.check().unwrap());
    }

    #[test]
    fn test_load_rejects_wrong_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-cascade.dat");
        std::fs::write(&path, [0x55u8; 64]).unwrap();
        let err = Cascade::load(&path).unwrap_err();
        assert_eq!(err.code(), ResultCode::FileContents);
    }

    #[test]
    fn test_load_rejects_unaligned_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unaligned.dat");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FILE_ID_CLASSIFIER.to_le_bytes());
        bytes.extend_from_slice(&68i32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 68]);
        std::fs::write(&path, &bytes).unwrap();
        let err = Cascade::load(&path).unwrap_err();
        assert_eq!(err.code(), ResultCode::FileContents);
    }

    #[test]
    fn test_save_rejects_empty() {
        let err = Cascade::empty().save("/tmp/never-written.cascade").unwrap_err();
        assert_eq!(err.code(), ResultCode::Argument);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut cascade = two_stage_cascade();
        cascade.clear();
        assert!(cascade.is_empty());
        cascade.clear();
        assert!(cascade.is_empty());
        assert!(cascade.check().is_err());
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let cascade = two_stage_cascade();
        let mut copy = cascade.deep_clone();
        assert_eq!(copy.checksum(), cascade.checksum());
        copy.clear();
        assert!(!cascade.is_empty());
    }
}
