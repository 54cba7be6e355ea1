//! Planar geometry helpers shared by the pipeline stages.
//!
//! Provides:
//! - canonical corner ordering for quadrilaterals
//! - circular masks and clamped crops on `GrayImage`
//! - polygon measures (area, convexity, centroid, bounding box)
//! - four-point perspective estimation via normalized DLT

use image::{GrayImage, Luma};
use nalgebra::{DMatrix, Matrix3, Vector3};

/// A 2D point `[x, y]` in pixel coordinates.
pub type Point = [f64; 2];

// ── Corner ordering ──────────────────────────────────────────────────────

/// Order four corners as `[top-left, top-right, bottom-right, bottom-left]`.
///
/// Uses the coordinate sum/difference rule: the top-left corner has the
/// smallest `x + y`, bottom-right the largest, top-right the smallest
/// `y - x` and bottom-left the largest. When that rule assigns one point to
/// two roles (strongly rotated quads), corners are ordered by angle around
/// the centroid instead, starting from the smallest `x + y`.
///
/// The result depends only on the set of points, not on input order.
pub fn order_points(pts: &[Point; 4]) -> [Point; 4] {
    let tl = arg_extreme(pts, |p| p[0] + p[1], false);
    let br = arg_extreme(pts, |p| p[0] + p[1], true);
    let tr = arg_extreme(pts, |p| p[1] - p[0], false);
    let bl = arg_extreme(pts, |p| p[1] - p[0], true);

    let mut seen = [false; 4];
    for i in [tl, tr, br, bl] {
        seen[i] = true;
    }
    if seen.iter().all(|&s| s) {
        return [pts[tl], pts[tr], pts[br], pts[bl]];
    }
    order_by_angle(pts)
}

/// Index of the point minimizing (or maximizing) `key`, ties broken by
/// `(x, y)` so that the choice does not depend on input order.
fn arg_extreme(pts: &[Point; 4], key: impl Fn(&Point) -> f64, largest: bool) -> usize {
    let mut best = 0usize;
    for i in 1..4 {
        let a = (key(&pts[i]), pts[i][0], pts[i][1]);
        let b = (key(&pts[best]), pts[best][0], pts[best][1]);
        let better = if largest { a > b } else { a < b };
        if better {
            best = i;
        }
    }
    best
}

fn order_by_angle(pts: &[Point; 4]) -> [Point; 4] {
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / 4.0;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / 4.0;
    let mut sorted = *pts;
    // Image y grows downward, so increasing atan2 walks clockwise on screen.
    sorted.sort_by(|a, b| {
        let ta = (a[1] - cy).atan2(a[0] - cx);
        let tb = (b[1] - cy).atan2(b[0] - cx);
        ta.total_cmp(&tb)
            .then(a[0].total_cmp(&b[0]))
            .then(a[1].total_cmp(&b[1]))
    });
    let start = arg_extreme(&sorted, |p| p[0] + p[1], false);
    [
        sorted[start],
        sorted[(start + 1) % 4],
        sorted[(start + 2) % 4],
        sorted[(start + 3) % 4],
    ]
}

/// Corners of the full `width x height` frame in canonical order.
pub fn full_frame_corners(width: u32, height: u32) -> [Point; 4] {
    let w = width.saturating_sub(1) as f64;
    let h = height.saturating_sub(1) as f64;
    [[0.0, 0.0], [w, 0.0], [w, h], [0.0, h]]
}

// ── Masks and crops ──────────────────────────────────────────────────────

/// Filled circular mask: 255 inside `radius` of `center`, 0 elsewhere.
pub fn circular_mask(width: u32, height: u32, center: [i64; 2], radius: u32) -> GrayImage {
    let r2 = (radius as i64) * (radius as i64);
    GrayImage::from_fn(width, height, |x, y| {
        let dx = x as i64 - center[0];
        let dy = y as i64 - center[1];
        if dx * dx + dy * dy <= r2 {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Crop `[x, x + w) x [y, y + h)` clamped to the image bounds.
///
/// Returns `None` when the clamped window is empty.
pub fn safe_crop(img: &GrayImage, x: i64, y: i64, w: u32, h: u32) -> Option<GrayImage> {
    let (iw, ih) = (img.width() as i64, img.height() as i64);
    let x0 = x.clamp(0, iw);
    let y0 = y.clamp(0, ih);
    let x1 = (x + w as i64).clamp(0, iw);
    let y1 = (y + h as i64).clamp(0, ih);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    let view = image::imageops::crop_imm(
        img,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    );
    Some(view.to_image())
}

// ── Polygons ─────────────────────────────────────────────────────────────

/// Absolute polygon area (shoelace formula).
pub fn polygon_area(pts: &[Point]) -> f64 {
    signed_area(pts).abs()
}

fn signed_area(pts: &[Point]) -> f64 {
    let n = pts.len();
    if n < 3 {
        return 0.0;
    }
    let mut acc = 0.0;
    for i in 0..n {
        let a = pts[i];
        let b = pts[(i + 1) % n];
        acc += a[0] * b[1] - b[0] * a[1];
    }
    0.5 * acc
}

/// Closed-polygon perimeter.
pub fn polygon_perimeter(pts: &[Point]) -> f64 {
    let n = pts.len();
    if n < 2 {
        return 0.0;
    }
    (0..n)
        .map(|i| distance(pts[i], pts[(i + 1) % n]))
        .sum()
}

/// True when all turns have the same orientation and the polygon is not
/// degenerate.
pub fn is_convex(pts: &[Point]) -> bool {
    let n = pts.len();
    if n < 3 {
        return false;
    }
    let mut sign = 0.0f64;
    for i in 0..n {
        let a = pts[i];
        let b = pts[(i + 1) % n];
        let c = pts[(i + 2) % n];
        let cross = (b[0] - a[0]) * (c[1] - b[1]) - (b[1] - a[1]) * (c[0] - b[0]);
        if cross.abs() < 1e-9 {
            continue;
        }
        if sign == 0.0 {
            sign = cross.signum();
        } else if cross.signum() != sign {
            return false;
        }
    }
    sign != 0.0
}

/// Area centroid of a polygon; vertex mean for degenerate (zero-area) input.
pub fn polygon_centroid(pts: &[Point]) -> Point {
    let n = pts.len();
    if n == 0 {
        return [0.0, 0.0];
    }
    let a = signed_area(pts);
    if a.abs() < 1e-9 {
        let sx: f64 = pts.iter().map(|p| p[0]).sum();
        let sy: f64 = pts.iter().map(|p| p[1]).sum();
        return [sx / n as f64, sy / n as f64];
    }
    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..n {
        let p = pts[i];
        let q = pts[(i + 1) % n];
        let cross = p[0] * q[1] - q[0] * p[1];
        cx += (p[0] + q[0]) * cross;
        cy += (p[1] + q[1]) * cross;
    }
    [cx / (6.0 * a), cy / (6.0 * a)]
}

/// Axis-aligned bounding box as four corners in canonical order.
pub fn bounding_box(pts: &[Point]) -> [Point; 4] {
    let mut min = [f64::INFINITY; 2];
    let mut max = [f64::NEG_INFINITY; 2];
    for p in pts {
        min[0] = min[0].min(p[0]);
        min[1] = min[1].min(p[1]);
        max[0] = max[0].max(p[0]);
        max[1] = max[1].max(p[1]);
    }
    [
        [min[0], min[1]],
        [max[0], min[1]],
        [max[0], max[1]],
        [min[0], max[1]],
    ]
}

/// Euclidean distance between two points.
#[inline]
pub fn distance(a: Point, b: Point) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

// ── Perspective ──────────────────────────────────────────────────────────

/// Project a point through a 3x3 homography.
pub fn project(h: &Matrix3<f64>, p: Point) -> Point {
    let v = h * Vector3::new(p[0], p[1], 1.0);
    if v[2].abs() < 1e-15 {
        return [f64::NAN, f64::NAN];
    }
    [v[0] / v[2], v[1] / v[2]]
}

/// Translate the centroid to the origin and scale the mean distance to sqrt(2).
fn normalize_points(pts: &[Point]) -> (Matrix3<f64>, Vec<Point>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p[0]).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p[1]).sum::<f64>() / n;
    let mean_dist = pts
        .iter()
        .map(|p| ((p[0] - cx).powi(2) + (p[1] - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let out = pts
        .iter()
        .map(|p| [s * (p[0] - cx), s * (p[1] - cy)])
        .collect();
    (t, out)
}

/// Any three of the four points (nearly) collinear.
fn has_collinear_triplet(pts: &[Point; 4]) -> bool {
    let scale = polygon_perimeter(pts).max(1.0);
    for skip in 0..4 {
        let tri: Vec<Point> = (0..4).filter(|&i| i != skip).map(|i| pts[i]).collect();
        if polygon_area(&tri) < 1e-6 * scale * scale {
            return true;
        }
    }
    false
}

/// Homography mapping the four `src` corners onto the four `dst` corners.
///
/// Returns `None` for degenerate input (coincident or collinear points).
pub fn perspective_transform(src: &[Point; 4], dst: &[Point; 4]) -> Option<Matrix3<f64>> {
    if has_collinear_triplet(src) || has_collinear_triplet(dst) {
        return None;
    }
    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::zeros(8, 9);
    for i in 0..4 {
        let (sx, sy) = (src_n[i][0], src_n[i][1]);
        let (dx, dy) = (dst_n[i][0], dst_n[i][1]);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // Null vector of A = eigenvector of the smallest eigenvalue of A^T A.
    let ata = a.transpose() * &a;
    let eig = nalgebra::SymmetricEigen::new(ata);
    let mut min_idx = 0;
    for i in 1..9 {
        if eig.eigenvalues[i].abs() < eig.eigenvalues[min_idx].abs() {
            min_idx = i;
        }
    }
    let v = eig.eigenvectors.column(min_idx);
    let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

    let h = t_dst.try_inverse()? * h_norm * t_src;
    let scale = h[(2, 2)];
    if scale.abs() < 1e-12 || !h.iter().all(|x| x.is_finite()) {
        return None;
    }
    Some(h / scale)
}

/// Row-major `f32` copy of a 3x3 matrix, the layout `imageproc` projections use.
pub(crate) fn to_row_major_f32(m: &Matrix3<f64>) -> [f32; 9] {
    [
        m[(0, 0)] as f32,
        m[(0, 1)] as f32,
        m[(0, 2)] as f32,
        m[(1, 0)] as f32,
        m[(1, 1)] as f32,
        m[(1, 2)] as f32,
        m[(2, 0)] as f32,
        m[(2, 1)] as f32,
        m[(2, 2)] as f32,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const QUAD: [Point; 4] = [[12.0, 8.0], [205.0, 20.0], [198.0, 301.0], [3.0, 290.0]];

    #[test]
    fn order_points_is_permutation_invariant() {
        let expected = order_points(&QUAD);
        assert_eq!(expected, QUAD);
        for shift in 0..4 {
            let rotated = [
                QUAD[shift % 4],
                QUAD[(shift + 1) % 4],
                QUAD[(shift + 2) % 4],
                QUAD[(shift + 3) % 4],
            ];
            assert_eq!(order_points(&rotated), expected);
            let reversed = [rotated[3], rotated[2], rotated[1], rotated[0]];
            assert_eq!(order_points(&reversed), expected);
        }
    }

    #[test]
    fn order_points_is_idempotent() {
        let once = order_points(&[QUAD[2], QUAD[0], QUAD[3], QUAD[1]]);
        assert_eq!(order_points(&once), once);
    }

    #[test]
    fn order_points_handles_diamond() {
        let diamond = [[50.0, 0.0], [100.0, 50.0], [50.0, 100.0], [0.0, 50.0]];
        let ordered = order_points(&diamond);
        let mut seen: Vec<Point> = ordered.to_vec();
        seen.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
        let mut expected = diamond.to_vec();
        expected.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
        assert_eq!(seen, expected, "all four corners retained");
        assert!(is_convex(&ordered));
    }

    #[test]
    fn circular_mask_counts_pixels() {
        let mask = circular_mask(21, 21, [10, 10], 5);
        let n = mask.pixels().filter(|p| p[0] > 0).count();
        // Lattice points within radius 5.
        assert_eq!(n, 81);
        assert_eq!(mask.get_pixel(10, 10)[0], 255);
        assert_eq!(mask.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn safe_crop_clamps_and_rejects_empty() {
        let img = GrayImage::from_pixel(50, 40, Luma([7]));
        let c = safe_crop(&img, -5, -5, 20, 20).expect("partial overlap");
        assert_eq!(c.dimensions(), (15, 15));
        let c = safe_crop(&img, 45, 30, 20, 20).expect("partial overlap");
        assert_eq!(c.dimensions(), (5, 10));
        assert!(safe_crop(&img, 60, 0, 10, 10).is_none());
        assert!(safe_crop(&img, -30, 0, 10, 10).is_none());
    }

    #[test]
    fn polygon_measures() {
        let square = [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]];
        assert_abs_diff_eq!(polygon_area(&square), 100.0);
        assert_abs_diff_eq!(polygon_perimeter(&square), 40.0);
        let c = polygon_centroid(&square);
        assert_abs_diff_eq!(c[0], 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(c[1], 5.0, epsilon = 1e-9);
        assert!(is_convex(&square));
        let dart = [[0.0, 0.0], [10.0, 0.0], [3.0, 3.0], [0.0, 10.0]];
        assert!(!is_convex(&dart));
        assert_eq!(bounding_box(&dart)[2], [10.0, 10.0]);
    }

    #[test]
    fn perspective_transform_maps_corners() {
        let dst = full_frame_corners(300, 400);
        let h = perspective_transform(&QUAD, &dst).expect("non-degenerate");
        for (s, d) in QUAD.iter().zip(dst.iter()) {
            let p = project(&h, *s);
            assert_abs_diff_eq!(p[0], d[0], epsilon = 1e-6);
            assert_abs_diff_eq!(p[1], d[1], epsilon = 1e-6);
        }
    }

    #[test]
    fn perspective_transform_rejects_collinear() {
        let line = [[0.0, 0.0], [10.0, 0.0], [20.0, 0.0], [5.0, 30.0]];
        assert!(perspective_transform(&line, &full_frame_corners(10, 10)).is_none());
    }
}
