//! Registration-mark alignment of the canonical image.
//!
//! Perspective correction leaves residual drift (printing tolerance, paper
//! curl, corner noise). Each layout mark is searched for in a window around
//! its expected position; detected → expected correspondences then give a
//! small affine or similarity correction which is applied to the image.
//!
//! Search windows are sized from the image diagonal and widened for marks
//! far from the vertical center, where accumulated skew error is largest.

pub mod marks;
pub mod transform;

use image::GrayImage;
use nalgebra::Matrix3;

use crate::geometry::{distance, Point};
use crate::layout::{Layout, MarkKind, RegistrationMark, MIN_REGISTRATION_MARKS};

pub use marks::{CircleSearchConfig, MarkCandidate};
pub use transform::{apply_alignment, estimate_transform, TransformModel};

/// Alignment could not produce a usable correction.
#[derive(Debug, thiserror::Error)]
pub enum AlignmentError {
    #[error("insufficient registration marks: {found} < {required}")]
    InsufficientMarks { found: usize, required: usize },
    #[error("transform estimation failed: {0}")]
    Solver(String),
    #[error("implausible alignment transform: {0}")]
    Implausible(String),
}

/// Alignment parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AlignConfig {
    /// Fixed search radius in pixels; derived from the image diagonal when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_radius: Option<u32>,
    /// Acceptance distance as a fraction of the search radius.
    pub tolerance: f64,
    /// Upper bound of the distance-from-center widening factor.
    pub max_widening: f64,
    /// Circle search covers nominal radius ± this many pixels.
    pub radius_margin: u32,
    pub circle: CircleSearchConfig,
    /// Accepted square contour area as multiples of the nominal area.
    pub square_area_range: [f64; 2],
    pub model: TransformModel,
    /// Largest accepted deviation of the transform scale from 1.
    pub max_scale_change: f64,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            search_radius: None,
            tolerance: 0.3,
            max_widening: 2.0,
            radius_margin: 5,
            circle: CircleSearchConfig::default(),
            square_area_range: [0.3, 3.0],
            model: TransformModel::Affine,
            max_scale_change: 0.25,
        }
    }
}

/// Search radius proportional to the image diagonal: `max(20, 2.4% diag)`.
pub fn auto_search_radius(width: u32, height: u32) -> u32 {
    let diag = (width as f64).hypot(height as f64);
    ((diag * 0.024) as u32).max(20)
}

/// Where one registration mark was found.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MarkDetection {
    pub id: String,
    pub expected: Point,
    /// Detected position, or `expected` when the mark was not found.
    pub position: Point,
    pub found: bool,
}

/// Locate every mark; marks that cannot be found report their expected position.
pub fn detect_registration_marks(
    gray: &GrayImage,
    marks: &[RegistrationMark],
    config: &AlignConfig,
) -> Vec<MarkDetection> {
    let (w, h) = gray.dimensions();
    let base_radius = config
        .search_radius
        .unwrap_or_else(|| auto_search_radius(w, h)) as f64;
    let cy = h as f64 / 2.0;

    marks
        .iter()
        .map(|mark| {
            let expected = mark.position.to_point();
            let widening = if cy > 0.0 {
                (1.0 + (expected[1] - cy).abs() / cy).min(config.max_widening)
            } else {
                1.0
            };
            let radius = base_radius * widening;
            let max_offset = radius * config.tolerance * widening;
            let found = search_mark(gray, mark, expected, radius, config)
                .filter(|p| distance(*p, expected) <= max_offset);
            match found {
                Some(position) => {
                    tracing::debug!(
                        id = %mark.id,
                        dx = position[0] - expected[0],
                        dy = position[1] - expected[1],
                        "registration mark found"
                    );
                    MarkDetection {
                        id: mark.id.clone(),
                        expected,
                        position,
                        found: true,
                    }
                }
                None => {
                    tracing::debug!(id = %mark.id, radius, "registration mark not found");
                    MarkDetection {
                        id: mark.id.clone(),
                        expected,
                        position: expected,
                        found: false,
                    }
                }
            }
        })
        .collect()
}

/// Nearest candidate to the expected position, in image coordinates.
fn search_mark(
    gray: &GrayImage,
    mark: &RegistrationMark,
    expected: Point,
    radius: f64,
    config: &AlignConfig,
) -> Option<Point> {
    let (w, h) = (gray.width() as i64, gray.height() as i64);
    let r = radius.round() as i64;
    let (ex, ey) = (expected[0].round() as i64, expected[1].round() as i64);
    let x0 = (ex - r).clamp(0, w);
    let y0 = (ey - r).clamp(0, h);
    let x1 = (ex + r).clamp(0, w);
    let y1 = (ey + r).clamp(0, h);
    if x1 - x0 < 4 || y1 - y0 < 4 {
        return None;
    }
    let window = image::imageops::crop_imm(
        gray,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    )
    .to_image();
    let local = [expected[0] - x0 as f64, expected[1] - y0 as f64];

    let candidates = match mark.kind {
        MarkKind::Circle => {
            let r_min = mark.size.saturating_sub(config.radius_margin).max(5);
            let r_max = mark.size + config.radius_margin;
            marks::find_circles(&window, r_min, r_max, &config.circle)
        }
        MarkKind::Square => marks::find_squares(&window, mark.size, config.square_area_range),
    };
    candidates
        .iter()
        .min_by(|a, b| distance(a.center, local).total_cmp(&distance(b.center, local)))
        .map(|c| [c.center[0] + x0 as f64, c.center[1] + y0 as f64])
}

/// Estimated correction and the evidence behind it.
#[derive(Debug, Clone)]
pub struct Alignment {
    /// Maps detected → expected positions.
    pub transform: Matrix3<f64>,
    pub model: TransformModel,
    pub marks: Vec<MarkDetection>,
    /// RMS mark distance before and after correction.
    pub rms_before: f64,
    pub rms_after: f64,
}

impl Alignment {
    pub fn marks_found(&self) -> usize {
        self.marks.iter().filter(|m| m.found).count()
    }
}

/// Result of [`align_image_with_layout`].
#[derive(Debug, Clone)]
pub enum AlignmentOutcome {
    Aligned { image: GrayImage, alignment: Alignment },
    /// The layout has too few marks to attempt alignment.
    Skipped { reason: String },
}

/// Detect the layout's registration marks and warp `gray` to cancel drift.
pub fn align_image_with_layout(
    gray: &GrayImage,
    layout: &Layout,
    config: &AlignConfig,
) -> Result<AlignmentOutcome, AlignmentError> {
    let marks = &layout.registration_marks;
    if marks.len() < MIN_REGISTRATION_MARKS {
        tracing::info!(marks = marks.len(), "alignment skipped");
        return Ok(AlignmentOutcome::Skipped {
            reason: format!(
                "layout defines {} registration marks, at least {} required",
                marks.len(),
                MIN_REGISTRATION_MARKS
            ),
        });
    }

    let detections = detect_registration_marks(gray, marks, config);
    let src: Vec<Point> = detections.iter().map(|d| d.position).collect();
    let dst = layout.mark_positions();
    let transform =
        transform::estimate_transform(config.model, &src, &dst, config.max_scale_change)?;

    let alignment = Alignment {
        transform,
        model: config.model,
        rms_before: transform::rms_error(&Matrix3::identity(), &src, &dst),
        rms_after: transform::rms_error(&transform, &src, &dst),
        marks: detections,
    };
    tracing::info!(
        found = alignment.marks_found(),
        total = marks.len(),
        rms_before = alignment.rms_before,
        rms_after = alignment.rms_after,
        "alignment estimated"
    );
    let image = apply_alignment(gray, &transform)?;
    Ok(AlignmentOutcome::Aligned { image, alignment })
}
