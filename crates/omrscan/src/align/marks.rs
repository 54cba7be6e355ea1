//! Registration-mark candidates inside a search window.
//!
//! Circles: gradient voting. Every pixel with a strong gradient casts unit
//! votes along both gradient directions at each radius in `[r_min, r_max]`;
//! edges of a disc converge on its center. Peaks are scored by the 3x3 vote
//! sum and kept when they reach a fraction of the ideal perimeter count.
//!
//! Squares: Otsu (inverse) binarization and outer contours whose area is
//! within a band around the nominal square area.

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::contours::{find_contours, BorderType};

use crate::geometry::{polygon_area, polygon_centroid, Point};
use crate::preprocess::threshold::otsu_binarize;

/// Circle voting parameters.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CircleSearchConfig {
    /// Gradient magnitude threshold as a fraction of the window maximum.
    pub grad_threshold: f32,
    /// Absolute gradient floor (Scharr units); keeps flat windows silent.
    pub min_gradient: f32,
    /// Minimum 3x3 vote sum as a fraction of `2*pi*r`.
    pub min_vote_frac: f32,
}

impl Default for CircleSearchConfig {
    fn default() -> Self {
        Self {
            grad_threshold: 0.2,
            min_gradient: 200.0,
            min_vote_frac: 0.5,
        }
    }
}

/// A candidate mark center in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkCandidate {
    pub center: Point,
    pub score: f32,
}

#[inline]
fn bilinear_add(accum: &mut [f32], w: u32, x: f32, y: f32) {
    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let stride = w as usize;
    let base = y0 as usize * stride + x0 as usize;
    accum[base] += (1.0 - fx) * (1.0 - fy);
    accum[base + 1] += fx * (1.0 - fy);
    accum[base + stride] += (1.0 - fx) * fy;
    accum[base + stride + 1] += fx * fy;
}

/// Circle centers with radius in `[r_min, r_max]`, best score first.
pub fn find_circles(
    gray: &GrayImage,
    r_min: u32,
    r_max: u32,
    config: &CircleSearchConfig,
) -> Vec<MarkCandidate> {
    let (w, h) = gray.dimensions();
    if w < 4 || h < 4 || r_max < r_min {
        return Vec::new();
    }

    let gx = imageproc::gradients::horizontal_scharr(gray);
    let gy = imageproc::gradients::vertical_scharr(gray);

    let mut max_mag_sq = 0f32;
    for (a, b) in gx.pixels().zip(gy.pixels()) {
        let (u, v) = (a[0] as f32, b[0] as f32);
        max_mag_sq = max_mag_sq.max(u * u + v * v);
    }
    let threshold = (config.grad_threshold * max_mag_sq.sqrt()).max(config.min_gradient);

    let mut accum = vec![0f32; (w * h) as usize];
    let (xmax, ymax) = ((w - 1) as f32, (h - 1) as f32);
    for y in 0..h {
        for x in 0..w {
            let u = gx.get_pixel(x, y)[0] as f32;
            let v = gy.get_pixel(x, y)[0] as f32;
            let mag = (u * u + v * v).sqrt();
            if mag < threshold {
                continue;
            }
            let (dx, dy) = (u / mag, v / mag);
            for sign in [-1f32, 1.0] {
                for r in r_min..=r_max {
                    let vx = x as f32 + sign * dx * r as f32;
                    let vy = y as f32 + sign * dy * r as f32;
                    if vx >= 0.0 && vx < xmax && vy >= 0.0 && vy < ymax {
                        bilinear_add(&mut accum, w, vx, vy);
                    }
                }
            }
        }
    }

    let Some(votes) = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(w, h, accum) else {
        return Vec::new();
    };
    let score_at = |x: i64, y: i64| -> f32 {
        let mut s = 0.0;
        for yy in (y - 1).max(0)..=(y + 1).min(h as i64 - 1) {
            for xx in (x - 1).max(0)..=(x + 1).min(w as i64 - 1) {
                s += votes.get_pixel(xx as u32, yy as u32)[0];
            }
        }
        s
    };
    let scores: Vec<f32> = (0..h as i64)
        .flat_map(|y| (0..w as i64).map(move |x| (x, y)))
        .map(|(x, y)| score_at(x, y))
        .collect();

    let nominal = (r_min + r_max) as f32 / 2.0;
    let min_score = config.min_vote_frac * std::f32::consts::TAU * nominal;
    let nms_r = r_min.max(2) as i64;

    let mut out = Vec::new();
    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let idx = (y * w as i64 + x) as usize;
            let val = scores[idx];
            if val < min_score {
                continue;
            }
            let mut is_max = true;
            'nms: for ny in (y - nms_r).max(0)..=(y + nms_r).min(h as i64 - 1) {
                for nx in (x - nms_r).max(0)..=(x + nms_r).min(w as i64 - 1) {
                    if (nx - x).pow(2) + (ny - y).pow(2) > nms_r * nms_r {
                        continue;
                    }
                    let nidx = (ny * w as i64 + nx) as usize;
                    if scores[nidx] > val || (scores[nidx] == val && nidx < idx) {
                        is_max = false;
                        break 'nms;
                    }
                }
            }
            if is_max {
                out.push(MarkCandidate {
                    center: refine_peak(&votes, x, y),
                    score: val,
                });
            }
        }
    }
    out.sort_by(|a, b| b.score.total_cmp(&a.score));
    out
}

/// Vote-weighted centroid of the 3x3 neighborhood.
fn refine_peak(votes: &ImageBuffer<Luma<f32>, Vec<f32>>, x: i64, y: i64) -> Point {
    let (w, h) = (votes.width() as i64, votes.height() as i64);
    let (mut sx, mut sy, mut sw) = (0f64, 0f64, 0f64);
    for yy in (y - 1).max(0)..=(y + 1).min(h - 1) {
        for xx in (x - 1).max(0)..=(x + 1).min(w - 1) {
            let v = votes.get_pixel(xx as u32, yy as u32)[0] as f64;
            sx += v * xx as f64;
            sy += v * yy as f64;
            sw += v;
        }
    }
    if sw > 0.0 {
        [sx / sw, sy / sw]
    } else {
        [x as f64, y as f64]
    }
}

/// Dark filled squares of side about `size`, as contour centroids.
pub fn find_squares(gray: &GrayImage, size: u32, area_range: [f64; 2]) -> Vec<MarkCandidate> {
    if gray.width() < 3 || gray.height() < 3 {
        return Vec::new();
    }
    let binary = otsu_binarize(gray, true);
    let nominal = (size as f64).powi(2);
    let (lo, hi) = (area_range[0] * nominal, area_range[1] * nominal);

    find_contours::<i32>(&binary)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.points.len() >= 4)
        .filter_map(|c| {
            let pts: Vec<Point> = c.points.iter().map(|p| [p.x as f64, p.y as f64]).collect();
            let area = polygon_area(&pts);
            (area > lo && area < hi).then(|| MarkCandidate {
                center: polygon_centroid(&pts),
                score: area as f32,
            })
        })
        .collect()
}
