//! Contrast-limited adaptive histogram equalization.
//!
//! The image is split into a grid of tiles. Each tile gets its own clipped,
//! redistributed histogram and lookup table; output pixels blend the four
//! nearest tile tables bilinearly so tile seams do not show.

use image::{GrayImage, Luma};

/// CLAHE parameters.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClaheConfig {
    /// Histogram clip limit, relative to a uniform histogram.
    pub clip_limit: f32,
    /// Number of tiles along x and y.
    pub tile_grid: [u32; 2],
}

impl Default for ClaheConfig {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_grid: [8, 8],
        }
    }
}

/// Apply CLAHE to a grayscale image.
pub fn apply_clahe(gray: &GrayImage, config: &ClaheConfig) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return gray.clone();
    }
    let tile_w = w.div_ceil(config.tile_grid[0].clamp(1, w));
    let tile_h = h.div_ceil(config.tile_grid[1].clamp(1, h));
    // Rounding the tile size up can leave trailing grid cells empty.
    let tx = w.div_ceil(tile_w);
    let ty = h.div_ceil(tile_h);

    let mut luts = vec![[0u8; 256]; (tx * ty) as usize];
    for j in 0..ty {
        for i in 0..tx {
            let x0 = i * tile_w;
            let y0 = j * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            luts[(j * tx + i) as usize] = tile_lut(gray, x0, y0, x1, y1, config.clip_limit);
        }
    }

    let inv_tw = 1.0 / tile_w as f32;
    let inv_th = 1.0 / tile_h as f32;
    GrayImage::from_fn(w, h, |x, y| {
        let v = gray.get_pixel(x, y)[0] as usize;

        let fx = x as f32 * inv_tw - 0.5;
        let fy = y as f32 * inv_th - 0.5;
        let ix = fx.floor();
        let iy = fy.floor();
        let ax = fx - ix;
        let ay = fy - iy;
        let x1 = (ix as i64).clamp(0, tx as i64 - 1) as u32;
        let x2 = (ix as i64 + 1).clamp(0, tx as i64 - 1) as u32;
        let y1 = (iy as i64).clamp(0, ty as i64 - 1) as u32;
        let y2 = (iy as i64 + 1).clamp(0, ty as i64 - 1) as u32;

        let l = |i: u32, j: u32| luts[(j * tx + i) as usize][v] as f32;
        let top = l(x1, y1) * (1.0 - ax) + l(x2, y1) * ax;
        let bottom = l(x1, y2) * (1.0 - ax) + l(x2, y2) * ax;
        let out = top * (1.0 - ay) + bottom * ay;
        Luma([out.round().clamp(0.0, 255.0) as u8])
    })
}

fn tile_lut(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f32) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[gray.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let area = (x1 - x0) * (y1 - y0);
    let mut lut = [0u8; 256];
    if area == 0 {
        for (i, v) in lut.iter_mut().enumerate() {
            *v = i as u8;
        }
        return lut;
    }

    if clip_limit > 0.0 {
        let clip = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for b in hist.iter_mut() {
            if *b > clip {
                excess += *b - clip;
                *b = clip;
            }
        }
        let per_bin = excess / 256;
        let residual = (excess % 256) as usize;
        for b in hist.iter_mut() {
            *b += per_bin;
        }
        if residual > 0 {
            let step = (256 / residual).max(1);
            for b in hist.iter_mut().step_by(step).take(residual) {
                *b += 1;
            }
        }
    }

    let scale = 255.0 / area as f32;
    let mut cdf = 0u32;
    for (i, b) in hist.iter().enumerate() {
        cdf += b;
        lut[i] = (cdf as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}
