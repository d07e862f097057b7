//! Typed access to the flattened classifier node stream.
//!
//! The stream is a sequence of packed little-endian records, each starting
//! with a 4-byte id:
//!
//! ```text
//! Meta     { id, window_width, window_height }          12 bytes
//! Decision { id, feature, score, subsets[8] }           44 bytes
//! Stage    { id, threshold }                             8 bytes
//! Final    { id }                                        4 bytes
//! ```
//!
//! Valid streams follow the grammar `Meta, (Decision*, Stage)+, Final`, with
//! up to 7 zero bytes of trailing padding (buffer sizes are rounded up to an
//! 8-byte transfer boundary). [`decode`] and [`check`] walk the grammar
//! against the buffer's real bounds; no embedded length is ever trusted.

use crate::error::{DetectError, DetectResult};

/// Id of the leading meta node.
pub const NODE_META: i32 = 1_635_018_061;
/// Id of a decision node. Must be zero; the other ids are arbitrary tags.
pub const NODE_DECISION: i32 = 0;
/// Id of a stage-termination node.
pub const NODE_STAGE: i32 = 1_734_440_019;
/// Id of the final node, meaning successful detection.
pub const NODE_FINAL: i32 = 1_819_175_238;

pub const META_BYTES: usize = 12;
pub const DECISION_BYTES: usize = 44;
pub const STAGE_BYTES: usize = 8;
pub const FINAL_BYTES: usize = 4;

/// LBP sample block of a decision node, relative to the scan window origin.
/// All fields fit one byte; the packed form is `w | h<<8 | x<<16 | y<<24`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Feature {
    pub x: u8,
    pub y: u8,
    pub width: u8,
    pub height: u8,
}

impl Feature {
    pub fn pack(&self) -> i32 {
        (u32::from(self.width)
            | (u32::from(self.height) << 8)
            | (u32::from(self.x) << 16)
            | (u32::from(self.y) << 24)) as i32
    }

    pub fn unpack(raw: i32) -> Self {
        let raw = raw as u32;
        Self {
            width: (raw & 255) as u8,
            height: ((raw >> 8) & 255) as u8,
            x: ((raw >> 16) & 255) as u8,
            y: ((raw >> 24) & 255) as u8,
        }
    }
}

/// One record of the node stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Meta {
        window_width: i32,
        window_height: i32,
    },
    Decision {
        feature: Feature,
        score: i32,
        subsets: [u32; 8],
    },
    Stage {
        threshold: i32,
    },
    Final,
}

impl Node {
    /// Append the packed byte form of this node.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Node::Meta {
                window_width,
                window_height,
            } => {
                out.extend_from_slice(&NODE_META.to_le_bytes());
                out.extend_from_slice(&window_width.to_le_bytes());
                out.extend_from_slice(&window_height.to_le_bytes());
            }
            Node::Decision {
                feature,
                score,
                subsets,
            } => {
                out.extend_from_slice(&NODE_DECISION.to_le_bytes());
                out.extend_from_slice(&feature.pack().to_le_bytes());
                out.extend_from_slice(&score.to_le_bytes());
                for subset in subsets {
                    out.extend_from_slice(&subset.to_le_bytes());
                }
            }
            Node::Stage { threshold } => {
                out.extend_from_slice(&NODE_STAGE.to_le_bytes());
                out.extend_from_slice(&threshold.to_le_bytes());
            }
            Node::Final => {
                out.extend_from_slice(&NODE_FINAL.to_le_bytes());
            }
        }
    }
}

/// Shape of a validated stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSummary {
    pub window_width: i32,
    pub window_height: i32,
    pub stages: usize,
    pub decisions: usize,
}

#[inline]
fn read_i32(bytes: &[u8], pos: usize) -> i32 {
    i32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap())
}

/// Decode and validate a complete node stream.
///
/// Returns the typed nodes in stream order (`Meta` first, `Final` last).
pub fn decode(bytes: &[u8]) -> DetectResult<Vec<Node>> {
    let mut nodes = Vec::new();
    walk(bytes, Some(&mut nodes))?;
    Ok(nodes)
}

/// Validate the node stream grammar without materializing nodes.
pub fn check(bytes: &[u8]) -> DetectResult<StreamSummary> {
    walk(bytes, None)
}

fn walk(bytes: &[u8], mut sink: Option<&mut Vec<Node>>) -> DetectResult<StreamSummary> {
    let mut pos = 0usize;

    let need = |pos: usize, len: usize, what: &str| -> DetectResult<()> {
        if pos + len > bytes.len() {
            Err(DetectError::contents(format!(
                "truncated {what} node at byte {pos}"
            )))
        } else {
            Ok(())
        }
    };

    need(pos, META_BYTES, "meta")?;
    if read_i32(bytes, pos) != NODE_META {
        return Err(DetectError::contents("stream does not start with a meta node"));
    }
    let window_width = read_i32(bytes, pos + 4);
    let window_height = read_i32(bytes, pos + 8);
    if !(1..=1024).contains(&window_width) || !(1..=1024).contains(&window_height) {
        return Err(DetectError::contents(format!(
            "implausible window size {window_width}x{window_height}"
        )));
    }
    if let Some(nodes) = sink.as_deref_mut() {
        nodes.push(Node::Meta {
            window_width,
            window_height,
        });
    }
    pos += META_BYTES;

    let mut stages = 0usize;
    let mut decisions = 0usize;
    let mut open_decisions = 0usize;

    loop {
        need(pos, 4, "stream")?;
        let id = read_i32(bytes, pos);
        match id {
            NODE_DECISION => {
                need(pos, DECISION_BYTES, "decision")?;
                let feature = Feature::unpack(read_i32(bytes, pos + 4));
                let score = read_i32(bytes, pos + 8);
                if feature.width == 0 || feature.height == 0 {
                    return Err(DetectError::contents("zero-sized feature block"));
                }
                // The LBP sample covers a 3x3 grid of cells; the whole grid
                // must stay inside the native window.
                let right = i32::from(feature.x) + 3 * i32::from(feature.width);
                let bottom = i32::from(feature.y) + 3 * i32::from(feature.height);
                if right > window_width || bottom > window_height {
                    return Err(DetectError::contents(format!(
                        "feature block {right}x{bottom} exceeds window \
                         {window_width}x{window_height}"
                    )));
                }
                if let Some(nodes) = sink.as_deref_mut() {
                    let mut subsets = [0u32; 8];
                    for (i, subset) in subsets.iter_mut().enumerate() {
                        *subset = read_i32(bytes, pos + 12 + 4 * i) as u32;
                    }
                    nodes.push(Node::Decision {
                        feature,
                        score,
                        subsets,
                    });
                }
                decisions += 1;
                open_decisions += 1;
                pos += DECISION_BYTES;
            }
            NODE_STAGE => {
                need(pos, STAGE_BYTES, "stage")?;
                if let Some(nodes) = sink.as_deref_mut() {
                    nodes.push(Node::Stage {
                        threshold: read_i32(bytes, pos + 4),
                    });
                }
                stages += 1;
                open_decisions = 0;
                pos += STAGE_BYTES;
            }
            NODE_FINAL => {
                if stages == 0 {
                    return Err(DetectError::contents("final node before any stage"));
                }
                if open_decisions != 0 {
                    return Err(DetectError::contents(
                        "decision nodes not closed by a stage before final node",
                    ));
                }
                pos += FINAL_BYTES;
                let tail = &bytes[pos..];
                if tail.len() > 7 || tail.iter().any(|&b| b != 0) {
                    return Err(DetectError::contents(format!(
                        "{} unexpected bytes after final node",
                        tail.len()
                    )));
                }
                if let Some(nodes) = sink.as_deref_mut() {
                    nodes.push(Node::Final);
                }
                return Ok(StreamSummary {
                    window_width,
                    window_height,
                    stages,
                    decisions,
                });
            }
            other => {
                return Err(DetectError::contents(format!(
                    "unknown node id {other} at byte {pos}"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stream() -> Vec<u8> {
        let mut bytes = Vec::new();
        Node::Meta {
            window_width: 24,
            window_height: 24,
        }
        .encode_into(&mut bytes);
        Node::Decision {
            feature: Feature {
                x: 3,
                y: 4,
                width: 2,
                height: 5,
            },
            score: -100,
            subsets: [1, 2, 3, 4, 5, 6, 7, 8],
        }
        .encode_into(&mut bytes);
        Node::Stage { threshold: -50 }.encode_into(&mut bytes);
        Node::Final.encode_into(&mut bytes);
        while bytes.len() % 8 != 0 {
            bytes.push(0);
        }
        bytes
    }

    #[test]
    fn test_feature_pack_round_trip() {
        let feature = Feature {
            x: 200,
            y: 17,
            width: 3,
            height: 255,
        };
        assert_eq!(Feature::unpack(feature.pack()), feature);
    }

    #[test]
    fn test_node_sizes() {
        let mut bytes = Vec::new();
        Node::Meta {
            window_width: 1,
            window_height: 1,
        }
        .encode_into(&mut bytes);
        assert_eq!(bytes.len(), META_BYTES);

        bytes.clear();
        Node::Decision {
            feature: Feature {
                x: 0,
                y: 0,
                width: 1,
                height: 1,
            },
            score: 0,
            subsets: [0; 8],
        }
        .encode_into(&mut bytes);
        assert_eq!(bytes.len(), DECISION_BYTES);

        bytes.clear();
        Node::Stage { threshold: 0 }.encode_into(&mut bytes);
        assert_eq!(bytes.len(), STAGE_BYTES);

        bytes.clear();
        Node::Final.encode_into(&mut bytes);
        assert_eq!(bytes.len(), FINAL_BYTES);
    }

    #[test]
    fn test_decode_round_trip() {
        let bytes = sample_stream();
        let nodes = decode(&bytes).unwrap();
        assert_eq!(nodes.len(), 4);
        let mut encoded = Vec::new();
        for node in &nodes {
            node.encode_into(&mut encoded);
        }
        while encoded.len() % 8 != 0 {
            encoded.push(0);
        }
        assert_eq!(encoded, bytes);
    }

    #[test]
    fn test_check_summary() {
        let summary = check(&sample_stream()).unwrap();
        assert_eq!(summary.window_width, 24);
        assert_eq!(summary.window_height, 24);
        assert_eq!(summary.stages, 1);
        assert_eq!(summary.decisions, 1);
    }

    #[test]
    fn test_rejects_missing_meta() {
        let mut bytes = Vec::new();
        Node::Stage { threshold: 0 }.encode_into(&mut bytes);
        assert!(check(&bytes).is_err());
    }

    #[test]
    fn test_rejects_truncated_decision() {
        let mut bytes = sample_stream();
        bytes.truncate(META_BYTES + 10);
        assert!(check(&bytes).is_err());
    }

    #[test]
    fn test_rejects_final_without_stage() {
        let mut bytes = Vec::new();
        Node::Meta {
            window_width: 24,
            window_height: 24,
        }
        .encode_into(&mut bytes);
        Node::Final.encode_into(&mut bytes);
        assert!(check(&bytes).is_err());
    }

    #[test]
    fn test_rejects_unclosed_decisions() {
        let mut bytes = Vec::new();
        Node::Meta {
            window_width: 24,
            window_height: 24,
        }
        .encode_into(&mut bytes);
        Node::Stage { threshold: 0 }.encode_into(&mut bytes);
        Node::Decision {
            feature: Feature {
                x: 0,
                y: 0,
                width: 1,
                height: 1,
            },
            score: 1,
            subsets: [0; 8],
        }
        .encode_into(&mut bytes);
        Node::Final.encode_into(&mut bytes);
        assert!(check(&bytes).is_err());
    }

    #[test]
    fn test_rejects_feature_outside_window() {
        let mut bytes = Vec::new();
        Node::Meta {
            window_width: 24,
            window_height: 24,
        }
        .encode_into(&mut bytes);
        Node::Decision {
            feature: Feature {
                x: 20,
                y: 0,
                width: 2, // 20 + 6 > 24
                height: 1,
            },
            score: 1,
            subsets: [0; 8],
        }
        .encode_into(&mut bytes);
        Node::Stage { threshold: 0 }.encode_into(&mut bytes);
        Node::Final.encode_into(&mut bytes);
        assert!(check(&bytes).is_err());
    }

    #[test]
    fn test_rejects_nonzero_padding() {
        let mut bytes = sample_stream();
        // Stream tail must be zero bytes only.
        if bytes.len() % 8 == 0 {
            bytes.pop();
            bytes.push(0xFF);
        }
        assert!(check(&bytes).is_err());
    }

    #[test]
    fn test_rejects_oversized_padding() {
        let mut bytes = sample_stream();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(check(&bytes).is_err());
    }
}
