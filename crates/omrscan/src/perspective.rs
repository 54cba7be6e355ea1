//! Four-point perspective correction into canonical layout space.

use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

use crate::geometry::{full_frame_corners, order_points, perspective_transform, to_row_major_f32, Point};
use crate::layout::CanonicalSize;
use crate::quality::brightness_stats;

/// Perspective correction failure.
#[derive(Debug, thiserror::Error)]
pub enum PerspectiveError {
    #[error("expected 4 corners, got {0}")]
    CornerCount(usize),
    #[error("degenerate corner geometry (coincident or collinear points)")]
    Degenerate,
    #[error("invalid target size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

/// Warp the quadrilateral `corners` (any order) onto a `size` rectangle.
///
/// Bilinear resampling; pixels mapping outside the source are white.
pub fn correct_perspective(
    img: &GrayImage,
    corners: &[Point],
    size: CanonicalSize,
) -> Result<GrayImage, PerspectiveError> {
    let corners: [Point; 4] = corners
        .try_into()
        .map_err(|_| PerspectiveError::CornerCount(corners.len()))?;
    if size.width == 0 || size.height == 0 {
        return Err(PerspectiveError::InvalidSize {
            width: size.width,
            height: size.height,
        });
    }
    let src = order_points(&corners);
    let dst = full_frame_corners(size.width, size.height);
    let h = perspective_transform(&src, &dst).ok_or(PerspectiveError::Degenerate)?;
    let projection =
        Projection::from_matrix(to_row_major_f32(&h)).ok_or(PerspectiveError::Degenerate)?;

    let mut out = GrayImage::new(size.width, size.height);
    warp_into(img, &projection, Interpolation::Bilinear, Luma([255]), &mut out);
    tracing::debug!(
        width = size.width,
        height = size.height,
        "perspective corrected"
    );
    Ok(out)
}

/// Check a corrected image: size within `tolerance_px` and a plausible mean.
pub fn validate_perspective_correction(
    warped: &GrayImage,
    expected: CanonicalSize,
    tolerance_px: u32,
) -> Result<(), String> {
    let (w, h) = warped.dimensions();
    if w.abs_diff(expected.width) > tolerance_px || h.abs_diff(expected.height) > tolerance_px {
        return Err(format!(
            "size mismatch: got {w}x{h}, expected {}x{}",
            expected.width, expected.height
        ));
    }
    let (mean, _) = brightness_stats(warped);
    if mean < 50.0 {
        return Err(format!("warped image too dark (mean={mean:.1})"));
    }
    if mean > 240.0 {
        return Err(format!("warped image too bright (mean={mean:.1})"));
    }
    Ok(())
}
