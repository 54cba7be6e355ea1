//! Synthetic images and layouts for unit and integration tests.

use std::collections::BTreeMap;

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use imageproc::rect::Rect;

use crate::geometry::{full_frame_corners, perspective_transform, to_row_major_f32, Point};
use crate::layout::{
    BubbleConfig, CanonicalSize, Layout, MarkKind, Position, Question, RegistrationMark,
};

/// Paper intensity of rendered forms.
pub const PAPER: u8 = 225;
/// Ink intensity of filled bubbles and marks.
pub const INK: u8 = 25;
/// Intensity of printed bubble outlines.
pub const OUTLINE: u8 = 90;

/// Five questions with options A-D, four circle marks near the corners.
///
/// Coordinates are given for a 600x800 sheet and scaled to `width x height`.
pub fn sample_layout(width: u32, height: u32) -> Layout {
    let sx = width as f64 / 600.0;
    let sy = height as f64 / 800.0;
    let s = sx.min(sy);
    let at = |x: f64, y: f64| Position {
        x: (x * sx).round(),
        y: (y * sy).round(),
    };

    let marks = [
        ("top_left", 40.0, 40.0),
        ("top_right", 560.0, 40.0),
        ("bottom_right", 560.0, 760.0),
        ("bottom_left", 40.0, 760.0),
    ]
    .into_iter()
    .map(|(id, x, y)| RegistrationMark {
        id: id.to_string(),
        position: at(x, y),
        kind: MarkKind::Circle,
        size: ((12.0 * s).round() as u32).max(6),
    })
    .collect();

    let questions = (1..=5u32)
        .map(|q| {
            let y = 150.0 + 90.0 * (q - 1) as f64;
            let options: BTreeMap<String, Position> = ["A", "B", "C", "D"]
                .iter()
                .enumerate()
                .map(|(k, letter)| (letter.to_string(), at(150.0 + 80.0 * k as f64, y)))
                .collect();
            Question {
                question_id: q,
                options,
            }
        })
        .collect();

    Layout {
        template_id: "form_test".to_string(),
        name: "Synthetic test form".to_string(),
        version: "1.0.0".to_string(),
        canonical_size: CanonicalSize { width, height },
        registration_marks: marks,
        bubble_config: BubbleConfig {
            radius: ((10.0 * s).round() as u32).clamp(5, 50),
            fill_threshold: 0.30,
            ambiguous_threshold: 0.65,
        },
        questions,
        header_fields: Vec::new(),
        metadata: None,
    }
}

/// Render a layout as a printed, optionally marked, sheet.
///
/// `fills` lists `(question_id, option, coverage)`; each marked bubble gets a
/// concentric ink disc covering `coverage` of its area.
pub fn render_form(layout: &Layout, fills: &[(u32, &str, f64)]) -> GrayImage {
    let size = layout.canonical_size;
    let mut img = GrayImage::from_pixel(size.width, size.height, Luma([PAPER]));

    for mark in &layout.registration_marks {
        draw_mark(&mut img, mark.kind, mark.position.to_point(), mark.size);
    }

    let r = layout.bubble_config.radius as i32;
    for q in &layout.questions {
        for (letter, pos) in &q.options {
            let c = (pos.x.round() as i32, pos.y.round() as i32);
            draw_hollow_circle_mut(&mut img, c, r, Luma([OUTLINE]));
            draw_hollow_circle_mut(&mut img, c, r + 1, Luma([OUTLINE]));
            let coverage = fills
                .iter()
                .find(|(qid, opt, _)| *qid == q.question_id && opt == letter)
                .map(|f| f.2);
            if let Some(coverage) = coverage {
                let ink_r = (r as f64 * coverage.clamp(0.0, 1.0).sqrt()).round() as i32;
                if ink_r > 0 {
                    draw_filled_circle_mut(&mut img, c, ink_r, Luma([INK]));
                }
            }
        }
    }
    img
}

/// Draw a filled registration mark centered at `center`.
pub fn draw_mark(img: &mut GrayImage, kind: MarkKind, center: Point, size: u32) {
    let (cx, cy) = (center[0].round() as i32, center[1].round() as i32);
    match kind {
        MarkKind::Circle => draw_filled_circle_mut(img, (cx, cy), size as i32, Luma([INK])),
        MarkKind::Square => {
            let half = size as i32 / 2;
            draw_filled_rect_mut(
                img,
                Rect::at(cx - half, cy - half).of_size(size, size),
                Luma([INK]),
            );
        }
    }
}

/// Warp `sheet` onto a `width x height` background so that its corners land
/// on `corners` (TL, TR, BR, BL).
pub fn place_on_background(
    sheet: &GrayImage,
    width: u32,
    height: u32,
    corners: &[Point; 4],
    background: u8,
) -> GrayImage {
    let src = full_frame_corners(sheet.width(), sheet.height());
    let h = perspective_transform(&src, corners).expect("test corners are non-degenerate");
    let projection =
        Projection::from_matrix(to_row_major_f32(&h)).expect("test homography is invertible");
    let mut out = GrayImage::from_pixel(width, height, Luma([background]));
    warp_into(
        sheet,
        &projection,
        Interpolation::Bilinear,
        Luma([background]),
        &mut out,
    );
    out
}

/// Square checkerboard with `cell`-pixel cells.
pub fn checkerboard(width: u32, height: u32, cell: u32) -> GrayImage {
    GrayImage::from_fn(width, height, |x, y| {
        if ((x / cell) + (y / cell)) % 2 == 0 {
            Luma([230])
        } else {
            Luma([30])
        }
    })
}

/// Gaussian-blur a `GrayImage` via `imageproc`.
pub fn blur_gray(img: &GrayImage, sigma: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    let f = ImageBuffer::<Luma<f32>, Vec<f32>>::from_fn(w, h, |x, y| {
        Luma([img.get_pixel(x, y)[0] as f32 / 255.0])
    });
    let blurred = imageproc::filter::gaussian_blur_f32(&f, sigma);
    GrayImage::from_fn(w, h, |x, y| {
        let v = blurred.get_pixel(x, y)[0].clamp(0.0, 1.0);
        Luma([(v * 255.0).round() as u8])
    })
}

/// PNG-encode a grayscale image.
pub fn encode_png(img: &GrayImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .expect("in-memory PNG encoding");
    buf
}

/// Square ROI with a printed outline and a concentric ink disc.
pub fn bubble_roi(side: u32, radius: u32, coverage: f64, paper: u8) -> GrayImage {
    let mut img = GrayImage::from_pixel(side, side, Luma([paper]));
    let c = ((side / 2) as i32, (side / 2) as i32);
    draw_hollow_circle_mut(&mut img, c, radius as i32, Luma([OUTLINE]));
    draw_hollow_circle_mut(&mut img, c, radius as i32 + 1, Luma([OUTLINE]));
    let ink_r = (radius as f64 * coverage.clamp(0.0, 1.0).sqrt()).round() as i32;
    if ink_r > 0 {
        draw_filled_circle_mut(&mut img, c, ink_r, Luma([INK]));
    }
    img
}
