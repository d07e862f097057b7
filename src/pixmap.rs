//! # Grayscale Pixmap
//!
//! The scanner works on 8-bit single-channel images with a row step rounded up
//! to a multiple of 8, matching the alignment the transfer protocol and the
//! pixel arena expect. General-purpose formats (PNG, JPEG, …) are decoded by a
//! collaborator codec at the edge; this module only deals with raw pixels and
//! the crate's own binary image format:
//!
//! ```text
//! [u32 magic][i32 width][i32 height][i32 step][step * height bytes]
//! ```
//!
//! All header fields are little-endian. The empty pixmap (no data, zero
//! dimensions) is the uniform "absence" value; releasing it is idempotent.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::checksum;
use crate::error::{DetectError, DetectResult};

/// Identifier written to the beginning of an image file.
pub const FILE_ID_IMAGE: u32 = 1_734_438_217;

/// Round up to the next multiple of 8 (row alignment of every pixel buffer).
pub(crate) fn round_up8(value: usize) -> usize {
    (value + 7) & !7
}

/// Owned 8-bit grayscale image with an 8-aligned row step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Pixmap {
    data: Vec<u8>,
    width: usize,
    height: usize,
    step: usize,
}

impl Pixmap {
    /// The empty pixmap: no data, zero dimensions.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }

    /// Allocate a zero-filled pixmap of the given dimensions.
    pub fn new(width: usize, height: usize) -> DetectResult<Self> {
        if width == 0 || height == 0 {
            return Err(DetectError::argument("dimensions", "must be non-zero"));
        }
        let step = round_up8(width);
        let len = step
            .checked_mul(height)
            .ok_or_else(|| DetectError::argument("dimensions", "image size overflows"))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| DetectError::memory_from("image buffer", e))?;
        data.resize(len, 0);
        Ok(Self {
            data,
            width,
            height,
            step,
        })
    }

    /// Build a pixmap from tightly-packed rows (`width` bytes per row), adding
    /// the step padding.
    pub fn from_rows(width: usize, height: usize, rows: &[u8]) -> DetectResult<Self> {
        if rows.len() != width * height {
            return Err(DetectError::argument(
                "rows",
                format!("expected {} bytes, got {}", width * height, rows.len()),
            ));
        }
        let mut pixmap = Self::new(width, height)?;
        for y in 0..height {
            pixmap.row_mut(y)
                .copy_from_slice(&rows[y * width..(y + 1) * width]);
        }
        Ok(pixmap)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Bytes from one row to the next; a multiple of 8, at least `width`.
    pub fn step(&self) -> usize {
        self.step
    }

    /// The full step-padded pixel buffer (`step * height` bytes).
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Content bytes of row `y` (`width` bytes, padding excluded).
    pub fn row(&self, y: usize) -> &[u8] {
        &self.data[y * self.step..y * self.step + self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        &mut self.data[y * self.step..y * self.step + self.width]
    }

    /// Digest over the content rows only, so two images with equal pixels get
    /// equal checksums regardless of padding contents.
    pub fn checksum(&self) -> u32 {
        let mut state = checksum::seed();
        for y in 0..self.height {
            state = checksum::fold(state, self.row(y));
        }
        state
    }

    /// Release the pixel data. Idempotent: releasing an empty pixmap is a
    /// no-op.
    pub fn clear(&mut self) {
        *self = Self::empty();
    }

    /// Save in the crate's binary image format.
    ///
    /// An empty pixmap cannot be saved and is rejected with an argument error
    /// before the file is touched.
    pub fn save(&self, path: impl AsRef<Path>) -> DetectResult<()> {
        let path = path.as_ref();
        if self.is_empty() {
            return Err(DetectError::argument("image", "empty image cannot be saved"));
        }

        let mut file = fs::File::create(path)
            .map_err(|e| DetectError::io_at("creating image file", path, e))?;
        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&FILE_ID_IMAGE.to_le_bytes());
        header[4..8].copy_from_slice(&(self.width as i32).to_le_bytes());
        header[8..12].copy_from_slice(&(self.height as i32).to_le_bytes());
        header[12..16].copy_from_slice(&(self.step as i32).to_le_bytes());
        file.write_all(&header)
            .map_err(|e| DetectError::io_at("writing image header", path, e))?;
        file.write_all(&self.data)
            .map_err(|e| DetectError::io_at("writing image pixels", path, e))?;
        Ok(())
    }

    /// Load an image previously written by [`Pixmap::save`].
    ///
    /// The magic tag is validated before anything else is trusted; dimension
    /// fields are then checked for consistency before the pixel payload is
    /// read.
    pub fn load(path: impl AsRef<Path>) -> DetectResult<Self> {
        let path = path.as_ref();
        let mut file =
            fs::File::open(path).map_err(|e| DetectError::io_at("opening image file", path, e))?;

        let mut header = [0u8; 16];
        file.read_exact(&mut header)
            .map_err(|e| DetectError::io_at("reading image header", path, e))?;

        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != FILE_ID_IMAGE {
            return Err(DetectError::contents_at(path, "wrong image magic tag"));
        }

        let width = i32::from_le_bytes(header[4..8].try_into().unwrap());
        let height = i32::from_le_bytes(header[8..12].try_into().unwrap());
        let step = i32::from_le_bytes(header[12..16].try_into().unwrap());
        if width <= 0 || height <= 0 || step < width || step % 8 != 0 {
            return Err(DetectError::contents_at(path, "inconsistent image header"));
        }
        let (width, height, step) = (width as usize, height as usize, step as usize);

        let len = step
            .checked_mul(height)
            .ok_or_else(|| DetectError::contents_at(path, "image size overflows"))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| DetectError::memory_from("image buffer", e))?;
        data.resize(len, 0);
        file.read_exact(&mut data)
            .map_err(|e| DetectError::io_at("reading image pixels", path, e))?;

        Ok(Self {
            data,
            width,
            height,
            step,
        })
    }
}
