//! Live-capture guidance for a single camera frame.
//!
//! Runs quality assessment, lenient paper detection and, when a layout is
//! given, perspective correction plus registration-mark search. No ROI
//! extraction or scoring happens here.

use image::DynamicImage;

use crate::align::{detect_registration_marks, AlignConfig, MarkDetection};
use crate::geometry::Point;
use crate::layout::Layout;
use crate::paper::{
    calculate_perspective_quality, detect_paper_boundary, estimate_deskew_angle, PaperConfig,
};
use crate::perspective::correct_perspective;
use crate::preprocess::{decode_image, upscale_to_minimum, DecodeError};
use crate::quality::{assess_image_quality, quality_score, AssessmentThresholds, QualityMetrics};

/// Preview thresholds; more lenient than batch scanning.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub quality: AssessmentThresholds,
    pub paper: PaperConfig,
    pub align: AlignConfig,
    /// |deskew| over this many degrees sets the `skewed` flag.
    pub max_skew_deg: f64,
    pub min_dimension: u32,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            quality: AssessmentThresholds::default(),
            paper: PaperConfig {
                min_area_ratio: 0.4,
                ..PaperConfig::default()
            },
            align: AlignConfig::default(),
            max_skew_deg: 5.0,
            min_dimension: 600,
        }
    }
}

/// Boolean guidance flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QualityFeedback {
    pub blur_detected: bool,
    pub too_dark: bool,
    pub too_bright: bool,
    pub skewed: bool,
}

/// Everything the capture UI needs for one frame.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PreviewReport {
    pub image_size: [u32; 2],
    pub paper_detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corners: Option<[Point; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub area_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perspective_quality: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deskew_angle: Option<f64>,
    pub metrics: QualityMetrics,
    pub quality_score: f64,
    pub feedback: QualityFeedback,
    pub marks_found: usize,
    pub marks_total: usize,
    pub marks: Vec<MarkDetection>,
    pub messages: Vec<String>,
    pub ready_to_scan: bool,
}

/// Analyze an encoded frame.
pub fn preview_frame(
    bytes: &[u8],
    layout: Option<&Layout>,
    config: &PreviewConfig,
) -> Result<PreviewReport, DecodeError> {
    let img = decode_image(bytes)?;
    Ok(preview_image(&img, layout, config))
}

/// Analyze a decoded frame.
pub fn preview_image(
    img: &DynamicImage,
    layout: Option<&Layout>,
    config: &PreviewConfig,
) -> PreviewReport {
    let (img, scale) = upscale_to_minimum(img, config.min_dimension);
    let gray = img.to_luma8();
    let assessment = assess_image_quality(&gray, &config.quality);
    let metrics = assessment.metrics;

    let paper = match detect_paper_boundary(&gray, &config.paper) {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::debug!(error = %e, "preview: no paper");
            None
        }
    };
    let deskew_angle = paper.as_ref().map(|p| estimate_deskew_angle(&p.corners));
    let skew = deskew_angle.unwrap_or(metrics.skew_angle);

    let mut messages = Vec::new();
    let feedback = QualityFeedback {
        blur_detected: assessment.is_blurry,
        too_dark: assessment.is_too_dark,
        too_bright: assessment.is_too_bright,
        skewed: skew.abs() > config.max_skew_deg,
    };
    if feedback.blur_detected {
        messages.push("Image is too blurry - hold camera steady".to_string());
    }
    if feedback.too_dark {
        messages.push("Image is too dark - improve lighting".to_string());
    } else if feedback.too_bright {
        messages.push("Image is too bright - reduce lighting".to_string());
    }
    if feedback.skewed {
        messages.push(format!("Straighten the paper ({skew:.1}° tilt)"));
    }

    let mut marks = Vec::new();
    let mut correction_failed = false;
    match (&paper, layout) {
        (None, _) => messages.push("Position paper within guide frame".to_string()),
        (Some(p), Some(layout)) => {
            match correct_perspective(&gray, &p.corners, layout.canonical_size) {
                Ok(canonical) => {
                    marks = detect_registration_marks(
                        &canonical,
                        &layout.registration_marks,
                        &config.align,
                    );
                }
                Err(e) => {
                    tracing::debug!(error = %e, "preview: perspective correction failed");
                    correction_failed = true;
                    messages.push("Paper detected but correction failed".to_string());
                }
            }
        }
        (Some(_), None) => {}
    }
    let marks_total = layout.map_or(0, |l| l.registration_marks.len());
    let marks_found = marks.iter().filter(|m| m.found).count();
    if paper.is_some() && !correction_failed && marks_found < marks_total {
        messages.push(format!("Only {marks_found}/{marks_total} marks detected"));
    }

    let quality_ok = !feedback.blur_detected && !feedback.too_dark && !feedback.too_bright;
    let ready_to_scan =
        quality_ok && paper.is_some() && !correction_failed && marks_found == marks_total;
    if ready_to_scan {
        messages.push("Ready to scan".to_string());
    }

    let inv = 1.0 / scale;
    PreviewReport {
        image_size: [
            (gray.width() as f64 * inv).round() as u32,
            (gray.height() as f64 * inv).round() as u32,
        ],
        paper_detected: paper.is_some(),
        corners: paper.map(|p| p.corners.map(|c| [c[0] * inv, c[1] * inv])),
        area_ratio: paper.map(|p| p.area_ratio),
        perspective_quality: paper.map(|p| calculate_perspective_quality(&p.corners)),
        deskew_angle,
        metrics,
        quality_score: quality_score(&metrics, config.quality.blur),
        feedback,
        marks_found,
        marks_total,
        marks,
        messages,
        ready_to_scan,
    }
}
