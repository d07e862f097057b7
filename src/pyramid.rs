//! # Scale Pyramid & Tile Planning
//!
//! The classifier only knows one native window size, so larger objects are
//! found by repeatedly downscaling the image and scanning every scale. Each
//! level is `SCALE_RATIO` smaller than the previous one; the pyramid stops
//! when either dimension drops below the detection window (or at the image
//! table's capacity, which at ratio 1.19 covers a 180x size range).
//!
//! Each level is then partitioned into tiles small enough for a core's local
//! memory. Neighboring tiles overlap by one window minus one pixel in each
//! direction, which keeps every window that straddles a tile boundary fully
//! inside some other tile; no origin is ever missed.

use fast_image_resize as fir;
use fir::images::{TypedImage, TypedImageRef};
use fir::pixels::U8;
use fir::{ResizeOptions, Resizer};

use crate::device::region::{MAX_IMAGES, MAX_TILE_BYTES, RECOMMENDED_TILE_SIZE};
use crate::error::{DetectError, DetectResult};
use crate::pixmap::{round_up8, Pixmap};

/// Downscale ratio between consecutive pyramid levels.
pub const SCALE_RATIO: f32 = 1.19;

/// One pyramid level: the scaled image and the factor that maps its
/// coordinates back to the source image.
pub struct PyramidLevel {
    pub image: Pixmap,
    pub scale: f32,
}

/// One tile of a pyramid level, in level coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TilePlan {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

fn resize_failed(error: impl std::fmt::Display) -> DetectError {
    DetectError::argument("pyramid resize", error.to_string())
}

/// Downscale a grayscale image to exact dimensions.
fn resize_gray(source: &Pixmap, dst_width: usize, dst_height: usize) -> DetectResult<Pixmap> {
    // The resizer wants tightly packed rows; compact the padded buffer first.
    let mut tight_src = Vec::new();
    tight_src
        .try_reserve_exact(source.width() * source.height())
        .map_err(|e| DetectError::memory_from("resize staging", e))?;
    for y in 0..source.height() {
        tight_src.extend_from_slice(source.row(y));
    }

    let src_view =
        TypedImageRef::<U8>::from_buffer(source.width() as u32, source.height() as u32, &tight_src)
            .map_err(resize_failed)?;

    let mut tight_dst = Vec::new();
    tight_dst
        .try_reserve_exact(dst_width * dst_height)
        .map_err(|e| DetectError::memory_from("resize output", e))?;
    tight_dst.resize(dst_width * dst_height, 0);
    let mut dst_image =
        TypedImage::<U8>::from_buffer(dst_width as u32, dst_height as u32, &mut tight_dst)
            .map_err(resize_failed)?;

    let mut resizer = Resizer::new();
    let options = ResizeOptions::new().use_alpha(false);
    resizer
        .resize_typed::<U8>(&src_view, &mut dst_image, &options)
        .map_err(resize_failed)?;

    Pixmap::from_rows(dst_width, dst_height, &tight_dst)
}

/// Build the scale pyramid for a detection window of `window_width` x
/// `window_height`.
///
/// Level 0 is a copy of the source; every further level is the previous one
/// scaled down by [`SCALE_RATIO`]. Returns an empty vector when the source is
/// already smaller than the window.
pub fn build_pyramid(
    source: &Pixmap,
    window_width: usize,
    window_height: usize,
) -> DetectResult<Vec<PyramidLevel>> {
    let mut levels: Vec<PyramidLevel> = Vec::new();
    if source.width() < window_width || source.height() < window_height {
        return Ok(levels);
    }

    levels.push(PyramidLevel {
        image: source.clone(),
        scale: 1.0,
    });

    loop {
        let previous = &levels[levels.len() - 1].image;
        let next_width = (previous.width() as f32 / SCALE_RATIO) as usize;
        let next_height = (previous.height() as f32 / SCALE_RATIO) as usize;
        if next_width < window_width || next_height < window_height {
            break;
        }
        if levels.len() == MAX_IMAGES {
            break;
        }

        let image = resize_gray(previous, next_width, next_height)?;
        levels.push(PyramidLevel {
            image,
            scale: source.width() as f32 / next_width as f32,
        });
    }

    Ok(levels)
}

/// Tile origin positions along one axis: fixed stride with the final tile
/// pinned to the image edge.
fn axis_positions(extent: usize, tile: usize, overlap: usize) -> Vec<usize> {
    if tile >= extent {
        return vec![0];
    }
    let stride = tile - overlap;
    let mut positions = Vec::new();
    let mut at = 0usize;
    loop {
        if at + tile >= extent {
            positions.push(extent - tile);
            break;
        }
        positions.push(at);
        at += stride;
    }
    positions
}

/// Partition a pyramid level into tiles.
///
/// Tile sides start from [`RECOMMENDED_TILE_SIZE`] and shrink until the
/// locally packed footprint `round_up8(width) * height` fits
/// [`MAX_TILE_BYTES`]. Adjacent tiles overlap by `(window - 1)` pixels in
/// each direction. Returns no tiles when even a window-sized tile would
/// exceed the budget.
pub fn plan_tiles(
    image_width: usize,
    image_height: usize,
    window_width: usize,
    window_height: usize,
) -> Vec<TilePlan> {
    let mut tile_width = RECOMMENDED_TILE_SIZE.max(window_width).min(image_width);
    let mut tile_height = RECOMMENDED_TILE_SIZE.max(window_height).min(image_height);

    while tile_height > window_height && round_up8(tile_width) * tile_height > MAX_TILE_BYTES {
        tile_height -= 1;
    }
    while tile_width > window_width && round_up8(tile_width) * tile_height > MAX_TILE_BYTES {
        tile_width -= 1;
    }
    if round_up8(tile_width) * tile_height > MAX_TILE_BYTES {
        return Vec::new();
    }

    let mut tiles = Vec::new();
    for &y in &axis_positions(image_height, tile_height, window_height - 1) {
        for &x in &axis_positions(image_width, tile_width, window_width - 1) {
            tiles.push(TilePlan {
                x,
                y,
                width: tile_width.min(image_width),
                height: tile_height.min(image_height),
            });
        }
    }
    tiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pyramid_level_dimensions() {
        let source = Pixmap::new(64, 64).unwrap();
        let levels = build_pyramid(&source, 24, 24).unwrap();

        let widths: Vec<usize> = levels.iter().map(|l| l.image.width()).collect();
        assert_eq!(widths, vec![64, 53, 44, 36, 30, 25]);
        assert_eq!(levels[0].scale, 1.0);
        for level in &levels {
            assert!((level.scale - 64.0 / level.image.width() as f32).abs() < 1e-6);
            assert!(level.image.width() >= 24 && level.image.height() >= 24);
        }
        // The next level would drop below the window.
        assert!(((25.0_f32 / SCALE_RATIO) as usize) < 24);
    }

    #[test]
    fn test_pyramid_empty_for_undersized_source() {
        let source = Pixmap::new(20, 40).unwrap();
        assert!(build_pyramid(&source, 24, 24).unwrap().is_empty());
    }

    #[test]
    fn test_single_tile_for_small_level() {
        let tiles = plan_tiles(64, 64, 24, 24);
        assert_eq!(
            tiles,
            vec![TilePlan {
                x: 0,
                y: 0,
                width: 64,
                height: 64
            }]
        );
    }

    #[test]
    fn test_tiles_respect_byte_budget() {
        for (w, h) in [(300, 200), (1920, 1080), (130, 1000)] {
            for tile in plan_tiles(w, h, 24, 24) {
                assert!(round_up8(tile.width) * tile.height <= MAX_TILE_BYTES);
                assert!(tile.width >= 24 && tile.height >= 24);
                assert!(tile.x + tile.width <= w);
                assert!(tile.y + tile.height <= h);
            }
        }
    }

    #[test]
    fn test_tiles_cover_every_window_origin() {
        let (w, h, win) = (300, 200, 24);
        let tiles = plan_tiles(w, h, win, win);
        for oy in 0..=(h - win) {
            for ox in 0..=(w - win) {
                let covered = tiles.iter().any(|t| {
                    ox >= t.x && oy >= t.y && ox + win <= t.x + t.width && oy + win <= t.y + t.height
                });
                assert!(covered, "window origin ({ox}, {oy}) not covered by any tile");
            }
        }
    }

    #[test]
    fn test_budget_shrinks_tile_height() {
        // A full 128x128 tile would be 16384 bytes; the budget trims rows.
        let tiles = plan_tiles(1000, 1000, 24, 24);
        let first = tiles[0];
        assert_eq!(first.width, 128);
        assert_eq!(first.height, MAX_TILE_BYTES / 128);
    }

    #[test]
    fn test_impossible_window_yields_no_tiles() {
        // A 200x200 window cannot fit the tile byte budget at any size.
        assert!(plan_tiles(1000, 1000, 200, 200).is_empty());
    }
}
