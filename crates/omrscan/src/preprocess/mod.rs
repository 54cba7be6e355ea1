//! Image normalization ahead of geometric processing.
//!
//! Decode → minimum-resolution upscale → grayscale → optional quality
//! measurement → CLAHE → Gaussian smoothing. A binarization method is chosen
//! from the brightness spread (adaptive under uneven light, Otsu otherwise);
//! the binary image itself is only materialized for diagnostics.

pub mod clahe;
pub mod threshold;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};

use crate::quality::{brightness_stats, QualityMetrics};

pub use clahe::{apply_clahe, ClaheConfig};

/// The input buffer is not a decodable image.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to decode image (invalid or corrupt): {0}")]
    Image(#[from] image::ImageError),
    #[error("decoded image has zero size")]
    Empty,
}

/// Preprocessing failure.
#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("image too blurry: blur_score={score:.1} < {min:.1}")]
    TooBlurry { score: f64, min: f64 },
}

/// Which binarization to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinarizationMode {
    /// Adaptive when the brightness spread is low, Otsu otherwise.
    Auto,
    Otsu,
    Adaptive,
    None,
}

/// Binarization actually applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinarizationMethod {
    Otsu,
    Adaptive,
}

/// Preprocessing parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Apply CLAHE contrast enhancement.
    pub apply_clahe: bool,
    pub clahe: ClaheConfig,
    /// Measure blur/brightness/skew.
    pub check_quality: bool,
    /// Fail (instead of warn) when the blur score is under `min_blur_score`.
    pub strict: bool,
    pub min_blur_score: f64,
    /// Mean brightness under this is reported as too dark.
    pub dark_warning: f64,
    /// Mean brightness over this is reported as too bright.
    pub bright_warning: f64,
    /// |skew| over this many degrees is reported.
    pub skew_warning_deg: f64,
    pub binarization: BinarizationMode,
    /// Brightness std under which `Auto` picks adaptive thresholding.
    pub adaptive_std_threshold: f64,
    /// Adaptive block size as a fraction of the larger image dimension.
    pub adaptive_block_fraction: f64,
    pub adaptive_min_block: u32,
    pub adaptive_c: f32,
    /// Larger-dimension floor; smaller inputs are upscaled to it.
    pub min_dimension: u32,
    /// Gaussian smoothing kernel size (odd).
    pub smoothing_kernel: u32,
    /// Keep grayscale/enhanced/binary stages in the output.
    pub return_intermediates: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            apply_clahe: true,
            clahe: ClaheConfig::default(),
            check_quality: true,
            strict: false,
            min_blur_score: 50.0,
            dark_warning: 50.0,
            bright_warning: 230.0,
            skew_warning_deg: 10.0,
            binarization: BinarizationMode::Auto,
            adaptive_std_threshold: 40.0,
            adaptive_block_fraction: 0.03,
            adaptive_min_block: 11,
            adaptive_c: 10.0,
            min_dimension: 600,
            smoothing_kernel: 5,
            return_intermediates: false,
        }
    }
}

/// Kind of non-fatal quality problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    Blurry,
    TooDark,
    TooBright,
    Skewed,
}

/// A quality observation that did not stop preprocessing.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QualityWarning {
    pub issue: QualityIssue,
    pub message: String,
}

/// Named intermediate images kept for diagnostics.
#[derive(Debug, Clone)]
pub struct PreprocessStages {
    pub grayscale: GrayImage,
    /// CLAHE output; `None` when enhancement is disabled.
    pub enhanced: Option<GrayImage>,
    /// Binarized image; `None` when binarization is disabled.
    pub binary: Option<GrayImage>,
}

/// Result of [`preprocess_image`].
#[derive(Debug, Clone)]
pub struct PreprocessOutput {
    /// Enhanced, smoothed grayscale image used by later stages.
    pub image: GrayImage,
    /// Present when quality checking was enabled.
    pub metrics: Option<QualityMetrics>,
    pub warnings: Vec<QualityWarning>,
    pub binarization: Option<BinarizationMethod>,
    /// Upscale factor applied to reach the minimum dimension (1.0 if none).
    pub scale: f64,
    pub stages: Option<PreprocessStages>,
}

/// Decode an encoded image buffer.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, DecodeError> {
    let img = image::load_from_memory(bytes)?;
    if img.width() == 0 || img.height() == 0 {
        return Err(DecodeError::Empty);
    }
    Ok(img)
}

/// Decode and preprocess an encoded image buffer.
pub fn preprocess_bytes(
    bytes: &[u8],
    config: &PreprocessConfig,
) -> Result<PreprocessOutput, PreprocessError> {
    let img = decode_image(bytes)?;
    preprocess_image(&img, config)
}

/// Upscale so the larger dimension reaches `min_dimension`.
pub fn upscale_to_minimum(img: &DynamicImage, min_dimension: u32) -> (DynamicImage, f64) {
    let (w, h) = (img.width(), img.height());
    let larger = w.max(h);
    if larger == 0 || larger >= min_dimension {
        return (img.clone(), 1.0);
    }
    let scale = min_dimension as f64 / larger as f64;
    let nw = ((w as f64 * scale).round() as u32).max(1);
    let nh = ((h as f64 * scale).round() as u32).max(1);
    tracing::debug!(w, h, nw, nh, "upscaling small input");
    (img.resize_exact(nw, nh, FilterType::CatmullRom), scale)
}

/// Normalize an already-decoded image.
pub fn preprocess_image(
    img: &DynamicImage,
    config: &PreprocessConfig,
) -> Result<PreprocessOutput, PreprocessError> {
    if img.width() == 0 || img.height() == 0 {
        return Err(DecodeError::Empty.into());
    }
    let (img, scale) = upscale_to_minimum(img, config.min_dimension);
    let gray = img.to_luma8();

    let mut warnings = Vec::new();
    let metrics = if config.check_quality {
        let m = QualityMetrics::measure(&gray);
        tracing::debug!(
            blur = m.blur_score,
            mean = m.brightness_mean,
            std = m.brightness_std,
            skew = m.skew_angle,
            "quality measured"
        );
        check_quality(&m, config, &mut warnings)?;
        Some(m)
    } else {
        None
    };

    let enhanced = config
        .apply_clahe
        .then(|| apply_clahe(&gray, &config.clahe));
    let base = enhanced.as_ref().unwrap_or(&gray);
    let processed = threshold::gaussian_smooth(base, threshold::odd(config.smoothing_kernel));

    let brightness_std = match &metrics {
        Some(m) => m.brightness_std,
        None => brightness_stats(&gray).1,
    };
    let binarization = select_binarization(config, brightness_std);
    let binary = if config.return_intermediates {
        binarization.map(|method| binarize(&processed, method, config))
    } else {
        None
    };

    let stages = config.return_intermediates.then(|| PreprocessStages {
        grayscale: gray.clone(),
        enhanced: enhanced.clone(),
        binary,
    });

    tracing::debug!(
        width = processed.width(),
        height = processed.height(),
        ?binarization,
        "preprocessing complete"
    );

    Ok(PreprocessOutput {
        image: processed,
        metrics,
        warnings,
        binarization,
        scale,
        stages,
    })
}

fn check_quality(
    m: &QualityMetrics,
    config: &PreprocessConfig,
    warnings: &mut Vec<QualityWarning>,
) -> Result<(), PreprocessError> {
    if m.blur_score < config.min_blur_score {
        if config.strict {
            return Err(PreprocessError::TooBlurry {
                score: m.blur_score,
                min: config.min_blur_score,
            });
        }
        tracing::warn!(blur = m.blur_score, min = config.min_blur_score, "image blurry");
        warnings.push(QualityWarning {
            issue: QualityIssue::Blurry,
            message: format!(
                "Image too blurry: blur_score={:.1} < {:.1}",
                m.blur_score, config.min_blur_score
            ),
        });
    }
    if m.brightness_mean < config.dark_warning {
        tracing::warn!(mean = m.brightness_mean, "image very dark");
        warnings.push(QualityWarning {
            issue: QualityIssue::TooDark,
            message: format!("Image very dark: mean brightness={:.1}", m.brightness_mean),
        });
    } else if m.brightness_mean > config.bright_warning {
        tracing::warn!(mean = m.brightness_mean, "image very bright");
        warnings.push(QualityWarning {
            issue: QualityIssue::TooBright,
            message: format!("Image very bright: mean brightness={:.1}", m.brightness_mean),
        });
    }
    if m.skew_angle.abs() > config.skew_warning_deg {
        tracing::warn!(skew = m.skew_angle, "significant skew");
        warnings.push(QualityWarning {
            issue: QualityIssue::Skewed,
            message: format!("Significant skew detected: {:.2}°", m.skew_angle),
        });
    }
    Ok(())
}

/// Resolve the binarization mode against the measured brightness spread.
pub fn select_binarization(
    config: &PreprocessConfig,
    brightness_std: f64,
) -> Option<BinarizationMethod> {
    match config.binarization {
        BinarizationMode::None => None,
        BinarizationMode::Otsu => Some(BinarizationMethod::Otsu),
        BinarizationMode::Adaptive => Some(BinarizationMethod::Adaptive),
        BinarizationMode::Auto if brightness_std < config.adaptive_std_threshold => {
            Some(BinarizationMethod::Adaptive)
        }
        BinarizationMode::Auto => Some(BinarizationMethod::Otsu),
    }
}

/// Adaptive block size: a fraction of the larger dimension, odd, floored.
pub fn adaptive_block_size(width: u32, height: u32, config: &PreprocessConfig) -> u32 {
    let raw = (width.max(height) as f64 * config.adaptive_block_fraction) as u32;
    threshold::odd(raw).max(threshold::odd(config.adaptive_min_block))
}

fn binarize(img: &GrayImage, method: BinarizationMethod, config: &PreprocessConfig) -> GrayImage {
    match method {
        BinarizationMethod::Otsu => threshold::otsu_binarize(img, false),
        BinarizationMethod::Adaptive => {
            let block = adaptive_block_size(img.width(), img.height(), config);
            threshold::adaptive_threshold(img, block, config.adaptive_c, false)
        }
    }
}
