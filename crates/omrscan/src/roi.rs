//! Per-bubble region extraction from the aligned canonical image.

use std::collections::BTreeMap;

use image::{GrayImage, Luma};

use crate::geometry::safe_crop;
use crate::layout::{Layout, Position};
use crate::quality::brightness_stats;

/// Extra pixels around the bubble radius on every side.
pub const ROI_PADDING: u32 = 10;

/// No measurable bubble region could be produced.
#[derive(Debug, thiserror::Error)]
pub enum RoiExtractionError {
    #[error("layout defines no bubbles")]
    NoBubbles,
    #[error("all {0} bubble regions fall outside the {1}x{2} image")]
    AllOutOfBounds(usize, u32, u32),
}

/// Question id → option letter → square crop around the bubble.
pub type BubbleRois = BTreeMap<u32, BTreeMap<String, GrayImage>>;

/// Side length of a bubble ROI.
pub fn roi_side(radius: u32, padding: u32) -> u32 {
    (radius + padding) * 2
}

/// Crop the `(radius + padding) * 2` square centered on `center`.
///
/// Clamped to the image; `None` when nothing of the window is inside.
pub fn extract_bubble_roi(
    img: &GrayImage,
    center: Position,
    radius: u32,
    padding: u32,
) -> Option<GrayImage> {
    let half = (radius + padding) as i64;
    let side = roi_side(radius, padding);
    let x = center.x.round() as i64 - half;
    let y = center.y.round() as i64 - half;
    safe_crop(img, x, y, side, side)
}

/// Every bubble of `layout`; out-of-bounds bubbles get a white placeholder.
pub fn extract_all_bubbles(
    img: &GrayImage,
    layout: &Layout,
    padding: u32,
) -> Result<BubbleRois, RoiExtractionError> {
    let radius = layout.bubble_config.radius;
    let side = roi_side(radius, padding);
    let total = layout.bubble_count();
    if total == 0 {
        return Err(RoiExtractionError::NoBubbles);
    }

    let mut placeholders = 0usize;
    let mut rois = BubbleRois::new();
    for q in &layout.questions {
        let per_option = q
            .options
            .iter()
            .map(|(letter, pos)| {
                let roi = extract_bubble_roi(img, *pos, radius, padding).unwrap_or_else(|| {
                    tracing::warn!(
                        question = q.question_id,
                        option = %letter,
                        x = pos.x,
                        y = pos.y,
                        "bubble outside image; using blank placeholder"
                    );
                    placeholders += 1;
                    GrayImage::from_pixel(side, side, Luma([255]))
                });
                (letter.clone(), roi)
            })
            .collect();
        rois.insert(q.question_id, per_option);
    }

    if placeholders == total {
        return Err(RoiExtractionError::AllOutOfBounds(
            total,
            img.width(),
            img.height(),
        ));
    }
    tracing::debug!(bubbles = total, placeholders, "bubble regions extracted");
    Ok(rois)
}

/// Reject regions too small to score or of implausible brightness.
pub fn validate_roi_quality(roi: &GrayImage) -> Result<(), String> {
    let (w, h) = roi.dimensions();
    if w < 10 || h < 10 {
        return Err(format!("ROI too small: {w}x{h}"));
    }
    let (mean, _) = brightness_stats(roi);
    if mean < 30.0 {
        return Err(format!("ROI too dark: mean={mean:.1}"));
    }
    if mean > 250.0 {
        return Err(format!("ROI too bright: mean={mean:.1}"));
    }
    Ok(())
}
