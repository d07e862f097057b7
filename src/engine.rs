//! # Cascade Evaluation Engine
//!
//! Interprets a compiled classifier over every eligible window of a tile.
//! For each window a per-stage score sum is accumulated: a decision node adds
//! its signed score when the subset bit indexed by the window's LBP code is
//! set, and a stage node rejects the window as soon as the sum falls below the
//! stage threshold. A window that survives every stage is a detection at its
//! origin, with the classifier's native window size.
//!
//! ## LBP code
//!
//! A decision's feature block anchors a 3x3 grid of `w x h` pixel cells inside
//! the window. Each of the eight surrounding cell sums is compared against the
//! center cell sum and contributes one bit, clockwise from the top-left:
//!
//! ```text
//! 128  64  32
//!   1   c  16
//!   2   4   8
//! ```
//!
//! This is the bit ordering the classifier data is generated for; changing it
//! would silently invalidate every trained cascade.

use crate::classifier::{Cascade, Node};
use crate::error::{DetectError, DetectResult};

/// Which window origins inside a tile are tested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Checkerboard scan order; origins with even `x + y`.
    Even,
    /// Checkerboard scan order; origins with odd `x + y`.
    Odd,
    /// Every origin.
    Full,
}

impl ScanMode {
    /// Wire value stored in a task item.
    pub fn as_i32(self) -> i32 {
        match self {
            ScanMode::Even => 0,
            ScanMode::Odd => 1,
            ScanMode::Full => 2,
        }
    }

    pub fn from_i32(raw: i32) -> DetectResult<Self> {
        match raw {
            0 => Ok(ScanMode::Even),
            1 => Ok(ScanMode::Odd),
            2 => Ok(ScanMode::Full),
            other => Err(DetectError::argument(
                "scan_mode",
                format!("unknown scan mode {other}"),
            )),
        }
    }

    /// Checkerboard complement: `Even` and `Odd` swap, `Full` is unchanged.
    /// Used when a scan is split at an odd row offset and the sub-scan must
    /// keep the phase of the whole.
    pub fn flip(self) -> Self {
        match self {
            ScanMode::Even => ScanMode::Odd,
            ScanMode::Odd => ScanMode::Even,
            ScanMode::Full => ScanMode::Full,
        }
    }

    #[inline]
    fn admits(self, x: usize, y: usize) -> bool {
        match self {
            ScanMode::Even => (x + y) % 2 == 0,
            ScanMode::Odd => (x + y) % 2 == 1,
            ScanMode::Full => true,
        }
    }
}

/// One interpreter operation. The final node needs no representation: running
/// off the end of the program is the accept.
enum Op {
    Decision {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        score: i32,
        subsets: [u32; 8],
    },
    Stage {
        threshold: i32,
    },
}

/// A classifier compiled for evaluation: validated, typed, with the native
/// window size pulled out of the meta node.
pub struct Program {
    window_width: usize,
    window_height: usize,
    ops: Vec<Op>,
}

impl Program {
    /// Decode and compile a classifier. Fails on any grammar violation.
    pub fn compile(cascade: &Cascade) -> DetectResult<Self> {
        let nodes = cascade.decode()?;

        let mut iter = nodes.into_iter();
        let Some(Node::Meta {
            window_width,
            window_height,
        }) = iter.next()
        else {
            return Err(DetectError::contents("node stream missing meta node"));
        };

        let mut ops = Vec::new();
        for node in iter {
            match node {
                Node::Decision {
                    feature,
                    score,
                    subsets,
                } => ops.push(Op::Decision {
                    x: feature.x as usize,
                    y: feature.y as usize,
                    width: feature.width as usize,
                    height: feature.height as usize,
                    score,
                    subsets,
                }),
                Node::Stage { threshold } => ops.push(Op::Stage { threshold }),
                Node::Final => break,
                Node::Meta { .. } => {
                    return Err(DetectError::contents("unexpected second meta node"));
                }
            }
        }

        Ok(Self {
            window_width: window_width as usize,
            window_height: window_height as usize,
            ops,
        })
    }

    pub fn window_width(&self) -> usize {
        self.window_width
    }

    pub fn window_height(&self) -> usize {
        self.window_height
    }

    /// Evaluate one window with origin `(ox, oy)` in a tile of row step
    /// `step`. The window must lie fully inside the tile.
    pub fn eval_window(&self, pixels: &[u8], step: usize, ox: usize, oy: usize) -> bool {
        let mut sum = 0i64;
        for op in &self.ops {
            match op {
                Op::Decision {
                    x,
                    y,
                    width,
                    height,
                    score,
                    subsets,
                } => {
                    let code = lbp_code(pixels, step, ox + x, oy + y, *width, *height);
                    if subsets[code >> 5] & (1 << (code & 31)) != 0 {
                        sum += i64::from(*score);
                    }
                }
                Op::Stage { threshold } => {
                    if sum < i64::from(*threshold) {
                        return false;
                    }
                    sum = 0;
                }
            }
        }
        true
    }

    /// Run the classifier over every eligible window of a tile, invoking
    /// `on_hit` with the window origin for each accepted one.
    pub fn scan(
        &self,
        pixels: &[u8],
        step: usize,
        width: usize,
        height: usize,
        mode: ScanMode,
        on_hit: &mut dyn FnMut(usize, usize),
    ) {
        if width < self.window_width || height < self.window_height {
            return;
        }
        for oy in 0..=(height - self.window_height) {
            for ox in 0..=(width - self.window_width) {
                if !mode.admits(ox, oy) {
                    continue;
                }
                if self.eval_window(pixels, step, ox, oy) {
                    on_hit(ox, oy);
                }
            }
        }
    }
}

/// Sum of the pixel cell `[x, x+w) x [y, y+h)`.
#[inline]
fn cell_sum(pixels: &[u8], step: usize, x: usize, y: usize, w: usize, h: usize) -> u32 {
    let mut sum = 0u32;
    for row in y..y + h {
        let base = row * step + x;
        for &p in &pixels[base..base + w] {
            sum += u32::from(p);
        }
    }
    sum
}

/// LBP code of the 3x3 cell grid anchored at `(bx, by)` with cell size
/// `cw x ch`.
#[inline]
fn lbp_code(pixels: &[u8], step: usize, bx: usize, by: usize, cw: usize, ch: usize) -> usize {
    let cell = |ix: usize, iy: usize| cell_sum(pixels, step, bx + ix * cw, by + iy * ch, cw, ch);

    let center = cell(1, 1);
    let mut code = 0usize;
    if cell(0, 0) >= center {
        code |= 128;
    }
    if cell(1, 0) >= center {
        code |= 64;
    }
    if cell(2, 0) >= center {
        code |= 32;
    }
    if cell(2, 1) >= center {
        code |= 16;
    }
    if cell(2, 2) >= center {
        code |= 8;
    }
    if cell(1, 2) >= center {
        code |= 4;
    }
    if cell(0, 2) >= center {
        code |= 2;
    }
    if cell(0, 1) >= center {
        code |= 1;
    }
    code
}
