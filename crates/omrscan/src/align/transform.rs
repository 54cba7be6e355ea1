//! Residual transform estimation between detected and expected mark
//! positions.
//!
//! Matrices are 3x3 with last row `[0, 0, 1]` and map detected → expected.

use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use nalgebra::{Matrix3, Vector3};

use super::AlignmentError;
use crate::geometry::{project, to_row_major_f32, Point};

/// Family of correcting transforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformModel {
    /// Rotation, non-uniform scale, shear and translation (least squares).
    Affine,
    /// Rotation, uniform scale and translation (least median of squares).
    Similarity,
}

/// Least-squares affine fit mapping `src[i]` onto `dst[i]`.
pub fn estimate_affine(src: &[Point], dst: &[Point]) -> Result<Matrix3<f64>, AlignmentError> {
    check_counts(src, dst, 3)?;
    let mut m = Matrix3::<f64>::zeros();
    let mut bx = Vector3::<f64>::zeros();
    let mut by = Vector3::<f64>::zeros();
    for (s, d) in src.iter().zip(dst) {
        let p = Vector3::new(s[0], s[1], 1.0);
        m += p * p.transpose();
        bx += p * d[0];
        by += p * d[1];
    }
    let inv = m
        .try_inverse()
        .ok_or_else(|| AlignmentError::Solver("marks are collinear".into()))?;
    let rx = inv * bx;
    let ry = inv * by;
    let t = Matrix3::new(rx[0], rx[1], rx[2], ry[0], ry[1], ry[2], 0.0, 0.0, 1.0);
    finite(t)
}

/// Exact similarity through two correspondences (complex ratio form).
fn similarity_from_pair(s0: Point, s1: Point, d0: Point, d1: Point) -> Option<Matrix3<f64>> {
    let (sx, sy) = (s1[0] - s0[0], s1[1] - s0[1]);
    let (dx, dy) = (d1[0] - d0[0], d1[1] - d0[1]);
    let n = sx * sx + sy * sy;
    if n < 1e-9 {
        return None;
    }
    let a = (dx * sx + dy * sy) / n;
    let b = (dy * sx - dx * sy) / n;
    Some(similarity_matrix(a, b, s0, d0))
}

fn similarity_matrix(a: f64, b: f64, s: Point, d: Point) -> Matrix3<f64> {
    let tx = d[0] - (a * s[0] - b * s[1]);
    let ty = d[1] - (b * s[0] + a * s[1]);
    Matrix3::new(a, -b, tx, b, a, ty, 0.0, 0.0, 1.0)
}

/// Least-squares similarity over all correspondences.
fn fit_similarity(src: &[Point], dst: &[Point]) -> Option<Matrix3<f64>> {
    let n = src.len() as f64;
    let mean = |pts: &[Point]| {
        let (x, y) = pts
            .iter()
            .fold((0.0, 0.0), |(x, y), p| (x + p[0], y + p[1]));
        [x / n, y / n]
    };
    let (cs, cd) = (mean(src), mean(dst));
    let (mut num_a, mut num_b, mut den) = (0.0, 0.0, 0.0);
    for (s, d) in src.iter().zip(dst) {
        let (sx, sy) = (s[0] - cs[0], s[1] - cs[1]);
        let (dx, dy) = (d[0] - cd[0], d[1] - cd[1]);
        num_a += sx * dx + sy * dy;
        num_b += sx * dy - sy * dx;
        den += sx * sx + sy * sy;
    }
    if den < 1e-9 {
        return None;
    }
    Some(similarity_matrix(num_a / den, num_b / den, cs, cd))
}

fn sq_residuals(t: &Matrix3<f64>, src: &[Point], dst: &[Point]) -> Vec<f64> {
    src.iter()
        .zip(dst)
        .map(|(s, d)| {
            let p = project(t, *s);
            (p[0] - d[0]).powi(2) + (p[1] - d[1]).powi(2)
        })
        .collect()
}

fn median(mut v: Vec<f64>) -> f64 {
    v.sort_by(f64::total_cmp);
    v[v.len() / 2]
}

/// Least-median-of-squares similarity.
///
/// Every pair of correspondences proposes a hypothesis; the one with the
/// smallest median squared residual wins. Inliers under the robust scale
/// estimate are then refit by least squares.
pub fn estimate_similarity_lmeds(
    src: &[Point],
    dst: &[Point],
) -> Result<Matrix3<f64>, AlignmentError> {
    check_counts(src, dst, 3)?;
    let n = src.len();

    let mut best: Option<(f64, Matrix3<f64>)> = None;
    for i in 0..n {
        for j in (i + 1)..n {
            let Some(t) = similarity_from_pair(src[i], src[j], dst[i], dst[j]) else {
                continue;
            };
            let med = median(sq_residuals(&t, src, dst));
            if best.as_ref().map_or(true, |(b, _)| med < *b) {
                best = Some((med, t));
            }
        }
    }
    let (med, hypothesis) =
        best.ok_or_else(|| AlignmentError::Solver("all marks coincide".into()))?;

    let sigma = 1.4826 * (1.0 + 5.0 / (n as f64 - 2.0)) * med.sqrt();
    let thresh = (2.5 * sigma).max(1.0);
    let residuals = sq_residuals(&hypothesis, src, dst);
    let (s_in, d_in): (Vec<Point>, Vec<Point>) = residuals
        .iter()
        .zip(src.iter().zip(dst))
        .filter(|(r, _)| **r <= thresh * thresh)
        .map(|(_, (s, d))| (*s, *d))
        .unzip();
    tracing::debug!(inliers = s_in.len(), total = n, median_sq = med, "lmeds similarity");

    let refined = if s_in.len() >= 2 {
        fit_similarity(&s_in, &d_in).unwrap_or(hypothesis)
    } else {
        hypothesis
    };
    finite(refined)
}

/// Fit `model` and check the result is a plausible small correction.
pub fn estimate_transform(
    model: TransformModel,
    src: &[Point],
    dst: &[Point],
    max_scale_change: f64,
) -> Result<Matrix3<f64>, AlignmentError> {
    let t = match model {
        TransformModel::Affine => estimate_affine(src, dst)?,
        TransformModel::Similarity => estimate_similarity_lmeds(src, dst)?,
    };
    let det = t[(0, 0)] * t[(1, 1)] - t[(0, 1)] * t[(1, 0)];
    if det <= 0.0 {
        return Err(AlignmentError::Implausible(format!(
            "transform flips orientation (det={det:.3})"
        )));
    }
    let scale = det.sqrt();
    if (scale - 1.0).abs() > max_scale_change {
        return Err(AlignmentError::Implausible(format!(
            "scale change {scale:.3} outside 1 ± {max_scale_change}"
        )));
    }
    Ok(t)
}

/// RMS distance between transformed `src` and `dst`.
pub fn rms_error(t: &Matrix3<f64>, src: &[Point], dst: &[Point]) -> f64 {
    let r = sq_residuals(t, src, dst);
    if r.is_empty() {
        return 0.0;
    }
    (r.iter().sum::<f64>() / r.len() as f64).sqrt()
}

/// Warp `img` by `t` into an image of the same size, white outside.
pub fn apply_alignment(img: &GrayImage, t: &Matrix3<f64>) -> Result<GrayImage, AlignmentError> {
    let projection = Projection::from_matrix(to_row_major_f32(t))
        .ok_or_else(|| AlignmentError::Solver("transform is not invertible".into()))?;
    let mut out = GrayImage::new(img.width(), img.height());
    warp_into(img, &projection, Interpolation::Bilinear, Luma([255]), &mut out);
    Ok(out)
}

fn check_counts(src: &[Point], dst: &[Point], min: usize) -> Result<(), AlignmentError> {
    if src.len() != dst.len() {
        return Err(AlignmentError::Solver(format!(
            "point count mismatch: {} vs {}",
            src.len(),
            dst.len()
        )));
    }
    if src.len() < min {
        return Err(AlignmentError::InsufficientMarks {
            found: src.len(),
            required: min,
        });
    }
    Ok(())
}

fn finite(t: Matrix3<f64>) -> Result<Matrix3<f64>, AlignmentError> {
    if t.iter().all(|v| v.is_finite()) {
        Ok(t)
    } else {
        Err(AlignmentError::Solver("non-finite transform".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn rigid(angle_deg: f64, scale: f64, tx: f64, ty: f64) -> Matrix3<f64> {
        let (s, c) = angle_deg.to_radians().sin_cos();
        Matrix3::new(
            scale * c,
            -scale * s,
            tx,
            scale * s,
            scale * c,
            ty,
            0.0,
            0.0,
            1.0,
        )
    }

    fn marks() -> Vec<Point> {
        vec![[40.0, 40.0], [560.0, 40.0], [560.0, 760.0], [40.0, 760.0]]
    }

    #[test]
    fn affine_recovers_shear_and_translation() {
        let truth = Matrix3::new(1.02, 0.03, -4.0, -0.01, 0.98, 6.0, 0.0, 0.0, 1.0);
        let src = marks();
        let dst: Vec<Point> = src.iter().map(|p| project(&truth, *p)).collect();
        let t = estimate_affine(&src, &dst).unwrap();
        for (a, b) in t.iter().zip(truth.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
        }
    }

    #[test]
    fn affine_rejects_collinear_marks() {
        let src = vec![[0.0, 0.0], [10.0, 10.0], [20.0, 20.0]];
        assert!(matches!(
            estimate_affine(&src, &src),
            Err(AlignmentError::Solver(_))
        ));
    }

    #[test]
    fn lmeds_similarity_ignores_one_outlier() {
        let truth = rigid(1.5, 1.01, 3.0, -2.0);
        let src = marks();
        let mut dst: Vec<Point> = src.iter().map(|p| project(&truth, *p)).collect();
        dst[2][0] += 25.0;
        let t = estimate_similarity_lmeds(&src, &dst).unwrap();
        let clean: Vec<Point> = src.iter().map(|p| project(&truth, *p)).collect();
        assert!(rms_error(&t, &src[..2], &clean[..2]) < 1e-6);
        assert!(rms_error(&t, &src[3..], &clean[3..]) < 1e-6);
    }

    #[test]
    fn too_few_points_and_implausible_scale_are_errors() {
        let src = marks();
        assert!(matches!(
            estimate_transform(TransformModel::Affine, &src[..2], &src[..2], 0.25),
            Err(AlignmentError::InsufficientMarks { found: 2, .. })
        ));
        let grow = rigid(0.0, 1.5, 0.0, 0.0);
        let dst: Vec<Point> = src.iter().map(|p| project(&grow, *p)).collect();
        assert!(matches!(
            estimate_transform(TransformModel::Similarity, &src, &dst, 0.25),
            Err(AlignmentError::Implausible(_))
        ));
        let mirrored: Vec<Point> = src.iter().map(|p| [600.0 - p[0], p[1]]).collect();
        assert!(estimate_transform(TransformModel::Affine, &src, &mirrored, 0.25).is_err());
    }

    #[test]
    fn identity_alignment_keeps_pixels() {
        let img = crate::test_utils::checkerboard(64, 48, 8);
        let out = apply_alignment(&img, &Matrix3::identity()).unwrap();
        assert_eq!(out.dimensions(), img.dimensions());
        for y in 0..47 {
            for x in 0..63 {
                assert_eq!(out.get_pixel(x, y), img.get_pixel(x, y), "at ({x}, {y})");
            }
        }
    }
}
