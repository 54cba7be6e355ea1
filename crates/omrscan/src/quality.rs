//! Image quality measures: sharpness, brightness and dominant skew.

use image::GrayImage;
use imageproc::contrast::otsu_level;
use imageproc::hough::{detect_lines, LineDetectionOptions};

use crate::preprocess::threshold::binarize;

/// Snapshot of image quality computed once per scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QualityMetrics {
    /// Variance of the Laplacian response (higher = sharper).
    pub blur_score: f64,
    /// Mean intensity on a 0..255 scale.
    pub brightness_mean: f64,
    /// Intensity standard deviation on a 0..255 scale.
    pub brightness_std: f64,
    /// Median angle of near-horizontal lines, degrees.
    pub skew_angle: f64,
    /// Whether a perspective warp was applied downstream.
    #[serde(default)]
    pub perspective_correction_applied: bool,
}

impl QualityMetrics {
    /// Measure blur, brightness and skew of a grayscale image.
    pub fn measure(gray: &GrayImage) -> Self {
        let (brightness_mean, brightness_std) = brightness_stats(gray);
        Self {
            blur_score: blur_score(gray),
            brightness_mean,
            brightness_std,
            skew_angle: skew_angle(gray),
            perspective_correction_applied: false,
        }
    }
}

/// Variance of the 4-neighbour Laplacian.
pub fn blur_score(gray: &GrayImage) -> f64 {
    let lap = imageproc::filter::laplacian_filter(gray);
    let n = lap.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &v in lap.as_raw() {
        let v = v as f64;
        sum += v;
        sum_sq += v * v;
    }
    let mean = sum / n as f64;
    (sum_sq / n as f64 - mean * mean).max(0.0)
}

/// Mean and population standard deviation of intensities.
pub fn brightness_stats(gray: &GrayImage) -> (f64, f64) {
    let raw = gray.as_raw();
    if raw.is_empty() {
        return (0.0, 0.0);
    }
    let n = raw.len() as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &v in raw {
        let v = v as f64;
        sum += v;
        sum_sq += v * v;
    }
    let mean = sum / n;
    (mean, (sum_sq / n - mean * mean).max(0.0).sqrt())
}

/// Hough vote threshold for skew lines.
const SKEW_LINE_VOTES: u32 = 100;

/// Skew estimate in degrees from near-horizontal Hough lines.
///
/// Otsu binarization, Canny edges, then the median of `normal - 90°` over
/// lines whose deviation from horizontal is under 45°. Returns 0 when no
/// qualifying line is found.
pub fn skew_angle(gray: &GrayImage) -> f64 {
    if gray.width() < 3 || gray.height() < 3 {
        return 0.0;
    }
    let binary = binarize(gray, otsu_level(gray), false);
    let edges = imageproc::edges::canny(&binary, 50.0, 150.0);
    let lines = detect_lines(
        &edges,
        LineDetectionOptions {
            vote_threshold: SKEW_LINE_VOTES,
            suppression_radius: 8,
        },
    );

    let mut angles: Vec<f64> = lines
        .iter()
        .map(|l| l.angle_in_degrees as f64 - 90.0)
        .filter(|a| a.abs() < 45.0)
        .collect();
    if angles.is_empty() {
        return 0.0;
    }
    angles.sort_by(f64::total_cmp);
    let mid = angles.len() / 2;
    if angles.len() % 2 == 0 {
        0.5 * (angles[mid - 1] + angles[mid])
    } else {
        angles[mid]
    }
}

/// User-facing quality verdict used by the live preview.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct QualityAssessment {
    pub metrics: QualityMetrics,
    /// Standard deviation normalized by 128.
    pub contrast_score: f64,
    pub is_blurry: bool,
    pub is_too_dark: bool,
    pub is_too_bright: bool,
}

/// Thresholds for [`assess_image_quality`].
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AssessmentThresholds {
    /// Blur scores below this are reported blurry.
    pub blur: f64,
    pub too_dark: f64,
    pub too_bright: f64,
}

impl Default for AssessmentThresholds {
    fn default() -> Self {
        Self {
            blur: 150.0,
            too_dark: 80.0,
            too_bright: 200.0,
        }
    }
}

/// Classify an image for interactive feedback.
pub fn assess_image_quality(gray: &GrayImage, thresholds: &AssessmentThresholds) -> QualityAssessment {
    let metrics = QualityMetrics::measure(gray);
    QualityAssessment {
        contrast_score: metrics.brightness_std / 128.0,
        is_blurry: metrics.blur_score < thresholds.blur,
        is_too_dark: metrics.brightness_mean < thresholds.too_dark,
        is_too_bright: metrics.brightness_mean > thresholds.too_bright,
        metrics,
    }
}

/// Overall capture quality in [0, 1].
///
/// Starts at 1 and subtracts up to 0.5 for low sharpness, up to 0.3 for
/// brightness outside 80..=200 and up to 0.2 for a standard deviation under 30.
pub fn quality_score(m: &QualityMetrics, sharp_blur: f64) -> f64 {
    let mut score = 1.0;
    if sharp_blur > 0.0 && m.blur_score < sharp_blur {
        score -= ((sharp_blur - m.blur_score) / sharp_blur * 0.5).min(0.5);
    }
    if m.brightness_mean < 80.0 {
        score -= ((80.0 - m.brightness_mean) / 80.0 * 0.3).min(0.3);
    } else if m.brightness_mean > 200.0 {
        score -= ((m.brightness_mean - 200.0) / 55.0 * 0.3).min(0.3);
    }
    if m.brightness_std < 30.0 {
        score -= ((30.0 - m.brightness_std) / 30.0 * 0.2).min(0.2);
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{blur_gray, checkerboard};
    use approx::assert_abs_diff_eq;
    use image::Luma;

    #[test]
    fn flat_image_has_zero_blur_and_std() {
        let img = GrayImage::from_pixel(64, 64, Luma([128]));
        assert_abs_diff_eq!(blur_score(&img), 0.0);
        let (mean, std) = brightness_stats(&img);
        assert_abs_diff_eq!(mean, 128.0);
        assert_abs_diff_eq!(std, 0.0);
    }

    #[test]
    fn blurring_lowers_blur_score() {
        let sharp = checkerboard(128, 128, 8);
        let soft = blur_gray(&sharp, 3.0);
        assert!(blur_score(&sharp) > 4.0 * blur_score(&soft));
    }

    #[test]
    fn skew_of_tilted_line_is_recovered() {
        let mut img = GrayImage::from_pixel(400, 300, Luma([255]));
        let slope = (5.0f64).to_radians().tan();
        for x in 20..380u32 {
            let yc = 150.0 + (x as f64 - 200.0) * slope;
            for dy in -3i32..=3 {
                let y = (yc.round() as i32 + dy) as u32;
                img.put_pixel(x, y, Luma([0]));
            }
        }
        let angle = skew_angle(&img);
        assert!((angle.abs() - 5.0).abs() <= 2.0, "angle {angle}");
    }

    #[test]
    fn blank_image_has_no_skew() {
        let img = GrayImage::from_pixel(200, 200, Luma([240]));
        assert_eq!(skew_angle(&img), 0.0);
    }

    #[test]
    fn quality_score_penalties() {
        let good = QualityMetrics {
            blur_score: 400.0,
            brightness_mean: 150.0,
            brightness_std: 60.0,
            ..Default::default()
        };
        assert_abs_diff_eq!(quality_score(&good, 150.0), 1.0);

        let bad = QualityMetrics {
            blur_score: 0.0,
            brightness_mean: 0.0,
            brightness_std: 0.0,
            ..Default::default()
        };
        assert_abs_diff_eq!(quality_score(&bad, 150.0), 0.0);
    }

    #[test]
    fn assessment_flags_dark_images() {
        let img = GrayImage::from_pixel(64, 64, Luma([20]));
        let a = assess_image_quality(&img, &AssessmentThresholds::default());
        assert!(a.is_too_dark);
        assert!(!a.is_too_bright);
        assert!(a.is_blurry);
    }
}
