//! Paper boundary detection.
//!
//! Pipeline: optional downscale → Gaussian blur → Canny → dilation →
//! external contours → area filter → 4-vertex convex polygon search among
//! the largest contours → bounding-box fallback → rescale and clip.
//!
//! [`detect_with_fallback`] adds the caller-level policy: validate the
//! detection and, unless strict, substitute the full frame on failure.

use image::imageops::FilterType;
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::geometry::{approximate_polygon_dp, arc_length};

use crate::geometry::{
    bounding_box, distance, full_frame_corners, is_convex, order_points, polygon_area, Point,
};
use crate::preprocess::threshold::gaussian_smooth;

/// No usable paper outline was found.
#[derive(Debug, thiserror::Error)]
pub enum PaperNotFoundError {
    #[error("no contours detected in image")]
    NoContours,
    #[error("no contours with area between {min_ratio:.0}% and {max_ratio:.0}% of image")]
    NoContourInRange { min_ratio: f64, max_ratio: f64 },
    #[error("paper detection rejected: {0}")]
    Rejected(String),
}

/// Paper detection parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    /// Minimum paper area as a fraction of the image area.
    pub min_area_ratio: f64,
    /// Maximum paper area as a fraction of the image area.
    pub max_area_ratio: f64,
    /// Larger dimension above which detection runs on a downscaled copy.
    pub max_processing_dimension: u32,
    pub canny_low: f32,
    pub canny_high: f32,
    /// Iterations of 5x5 dilation applied to the edge map.
    pub dilate_iterations: u8,
    /// Polygon approximation tolerance as a fraction of the perimeter.
    pub approx_epsilon: f64,
    /// How many of the largest contours are tried for a quadrilateral.
    pub max_candidates: usize,
    /// Detections covering more than this fraction are treated as the frame edge.
    pub max_valid_area_ratio: f64,
    /// Minimum x and y extent of the corners relative to the image size.
    pub min_span_ratio: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            min_area_ratio: 0.2,
            max_area_ratio: 0.95,
            max_processing_dimension: 1500,
            canny_low: 50.0,
            canny_high: 150.0,
            dilate_iterations: 2,
            approx_epsilon: 0.02,
            max_candidates: 10,
            max_valid_area_ratio: 0.98,
            min_span_ratio: 0.3,
        }
    }
}

/// Detected paper outline.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PaperDetection {
    /// Corners in image coordinates, ordered TL, TR, BR, BL.
    pub corners: [Point; 4],
    /// Quadrilateral area over image area.
    pub area_ratio: f64,
    /// True when the outline is the full-frame substitute.
    pub fallback: bool,
}

/// Find the four corners of the paper in `gray`.
pub fn detect_paper_boundary(
    gray: &GrayImage,
    config: &PaperConfig,
) -> Result<PaperDetection, PaperNotFoundError> {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return Err(PaperNotFoundError::NoContours);
    }

    let larger = w.max(h);
    let (work, scale) = if larger > config.max_processing_dimension {
        let s = config.max_processing_dimension as f64 / larger as f64;
        let nw = ((w as f64 * s) as u32).max(1);
        let nh = ((h as f64 * s) as u32).max(1);
        (
            image::imageops::resize(gray, nw, nh, FilterType::Triangle),
            s,
        )
    } else {
        (gray.clone(), 1.0)
    };

    let blurred = gaussian_smooth(&work, 5);
    let edges = imageproc::edges::canny(&blurred, config.canny_low, config.canny_high);
    // A 5x5 square dilated n times has Chebyshev radius 2n.
    let k = config.dilate_iterations.saturating_mul(2);
    let edges = if k > 0 {
        imageproc::morphology::dilate(&edges, Norm::LInf, k)
    } else {
        edges
    };

    let contours: Vec<Vec<Point>> = find_contours::<i32>(&edges)
        .into_iter()
        .filter(|c| c.parent.is_none() && c.border_type == BorderType::Outer)
        .map(|c| {
            c.points
                .iter()
                .map(|p| [p.x as f64, p.y as f64])
                .collect::<Vec<Point>>()
        })
        .collect();
    if contours.is_empty() {
        return Err(PaperNotFoundError::NoContours);
    }

    let work_area = work.width() as f64 * work.height() as f64;
    let min_area = config.min_area_ratio * work_area;
    let max_area = config.max_area_ratio * work_area;
    let mut candidates: Vec<(f64, &Vec<Point>)> = contours
        .iter()
        .map(|c| (polygon_area(c), c))
        .filter(|(a, _)| *a > min_area && *a < max_area)
        .collect();
    if candidates.is_empty() {
        return Err(PaperNotFoundError::NoContourInRange {
            min_ratio: config.min_area_ratio * 100.0,
            max_ratio: config.max_area_ratio * 100.0,
        });
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
    tracing::debug!(
        contours = contours.len(),
        in_range = candidates.len(),
        "paper contour candidates"
    );

    let quad = candidates
        .iter()
        .take(config.max_candidates)
        .find_map(|(_, c)| approximate_quad(c, config.approx_epsilon));
    let corners = match quad {
        Some(q) => q,
        None => {
            tracing::debug!("no quadrilateral found; using bounding box of largest contour");
            bounding_box(candidates[0].1)
        }
    };

    let (max_x, max_y) = (w.saturating_sub(1) as f64, h.saturating_sub(1) as f64);
    let corners = corners.map(|p| {
        [
            (p[0] / scale).clamp(0.0, max_x),
            (p[1] / scale).clamp(0.0, max_y),
        ]
    });
    let corners = order_points(&corners);
    let area_ratio = polygon_area(&corners) / (w as f64 * h as f64);
    tracing::debug!(area_ratio, "paper boundary detected");

    Ok(PaperDetection {
        corners,
        area_ratio,
        fallback: false,
    })
}

fn approximate_quad(contour: &[Point], epsilon_frac: f64) -> Option<[Point; 4]> {
    let pts: Vec<imageproc::point::Point<i32>> = contour
        .iter()
        .map(|p| imageproc::point::Point::new(p[0] as i32, p[1] as i32))
        .collect();
    let eps = epsilon_frac * arc_length(&pts, true);
    let approx = approximate_polygon_dp(&pts, eps, true);
    if approx.len() != 4 {
        return None;
    }
    let quad: [Point; 4] = std::array::from_fn(|i| [approx[i].x as f64, approx[i].y as f64]);
    is_convex(&quad).then_some(quad)
}

/// Sanity-check a detection against the image it came from.
pub fn validate_paper_detection(
    corners: &[Point],
    width: u32,
    height: u32,
    config: &PaperConfig,
) -> Result<(), String> {
    if corners.len() != 4 {
        return Err(format!("expected 4 corners, got {}", corners.len()));
    }
    let image_area = width as f64 * height as f64;
    let area_ratio = polygon_area(corners) / image_area.max(1.0);
    if area_ratio < config.min_area_ratio {
        return Err(format!("detected area too small: {:.1}%", area_ratio * 100.0));
    }
    if area_ratio > config.max_valid_area_ratio {
        return Err("detected area too large, likely the image edge rather than paper".into());
    }

    let (min_x, max_x) = span(corners.iter().map(|p| p[0]));
    let (min_y, max_y) = span(corners.iter().map(|p| p[1]));
    if max_x - min_x < width as f64 * config.min_span_ratio
        || max_y - min_y < height as f64 * config.min_span_ratio
    {
        return Err("detected region too narrow or short".into());
    }
    Ok(())
}

fn span(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}

/// Detect and validate; in non-strict mode fall back to the full frame.
pub fn detect_with_fallback(
    gray: &GrayImage,
    config: &PaperConfig,
    strict: bool,
) -> Result<PaperDetection, PaperNotFoundError> {
    let (w, h) = gray.dimensions();
    let outcome = detect_paper_boundary(gray, config).and_then(|d| {
        validate_paper_detection(&d.corners, w, h, config)
            .map(|()| d)
            .map_err(PaperNotFoundError::Rejected)
    });
    match outcome {
        Ok(d) => Ok(d),
        Err(err) if strict => Err(err),
        Err(err) => {
            tracing::warn!(error = %err, "paper detection failed; using full image frame");
            let corners = full_frame_corners(w, h);
            Ok(PaperDetection {
                corners,
                area_ratio: polygon_area(&corners) / (w as f64 * h as f64).max(1.0),
                fallback: true,
            })
        }
    }
}

/// Width-over-height ratio of an A-series portrait page.
const PAGE_ASPECT: f64 = 0.707;

/// Rate how close the outline is to an upright page rectangle, in [0, 1].
///
/// 70% rectangularity (opposite sides of equal length), 30% closeness of
/// the aspect ratio to a portrait page.
pub fn calculate_perspective_quality(corners: &[Point; 4]) -> f64 {
    let [tl, tr, br, bl] = order_points(corners);
    let top = distance(tl, tr);
    let bottom = distance(bl, br);
    let left = distance(tl, bl);
    let right = distance(tr, br);
    if top.max(bottom) <= 0.0 || left.max(right) <= 0.0 {
        return 0.0;
    }

    let width_diff = (top - bottom).abs() / top.max(bottom);
    let height_diff = (left - right).abs() / left.max(right);
    let rectangularity = 1.0 - (width_diff + height_diff) / 2.0;

    let aspect = (top + bottom) / (left + right);
    let aspect_score = 1.0 - (aspect - PAGE_ASPECT).abs().min(1.0);

    (0.7 * rectangularity + 0.3 * aspect_score).clamp(0.0, 1.0)
}

/// Angle of the top edge (TL → TR) in degrees.
pub fn estimate_deskew_angle(corners: &[Point; 4]) -> f64 {
    let [tl, tr, _, _] = order_points(corners);
    (tr[1] - tl[1]).atan2(tr[0] - tl[0]).to_degrees()
}
