//! Scan orchestration.
//!
//! [`Scanner`] runs the stages in a fixed order:
//! layout → preprocess → paper → perspective → align → ROIs → scoring.
//! Layout, preprocessing, paper, perspective and ROI failures stop the scan;
//! alignment problems only produce warnings. Every call returns a
//! [`DetectionResult`]; panics inside a stage are caught and reported as
//! `UNEXPECTED_ERROR`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;

use base64::Engine;
use image::{DynamicImage, GrayImage};

use crate::align::{align_image_with_layout, AlignConfig, AlignmentOutcome};
use crate::fill::{score_all_questions, AnswerStatus, FillConfig};
use crate::layout::{DirLayoutStore, Layout, LayoutCache};
use crate::paper::{detect_with_fallback, PaperConfig};
use crate::perspective::{correct_perspective, validate_perspective_correction};
use crate::preprocess::{decode_image, preprocess_image, PreprocessConfig};
use crate::quality::QualityMetrics;
use crate::result::{
    overall_status, timestamp_now, DebugImages, DetectionResult, ErrorEntry, QuestionDetection,
    Warning,
};
use crate::roi::{extract_all_bubbles, validate_roi_quality, ROI_PADDING};

/// Blur floor applied in strict mode.
const STRICT_MIN_BLUR: f64 = 80.0;

/// Failure to read a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level scan configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub preprocess: PreprocessConfig,
    pub paper: PaperConfig,
    pub align: AlignConfig,
    pub fill: FillConfig,
    /// Fail on blurry input and never substitute the full frame for the paper.
    pub strict: bool,
    /// Pixels around the bubble radius in each ROI.
    pub roi_padding: u32,
    /// Blur scores under this produce `LOW_BLUR_SCORE`.
    pub low_blur_warning: f64,
    /// |skew| over this many degrees produces `SIGNIFICANT_SKEW`.
    pub skew_warning_deg: f64,
    /// Acceptable mean brightness band; outside it `POOR_BRIGHTNESS`.
    pub brightness_range: [f64; 2],
    /// More ambiguous questions than this produce `MULTIPLE_AMBIGUOUS`.
    pub max_ambiguous: usize,
    /// Size tolerance of the perspective check.
    pub perspective_tolerance_px: u32,
    /// Attach base64 PNG snapshots of intermediate stages.
    pub include_debug_images: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            preprocess: PreprocessConfig::default(),
            paper: PaperConfig::default(),
            align: AlignConfig::default(),
            fill: FillConfig::default(),
            strict: false,
            roi_padding: ROI_PADDING,
            low_blur_warning: 100.0,
            skew_warning_deg: 5.0,
            brightness_range: [50.0, 230.0],
            max_ambiguous: 3,
            perspective_tolerance_px: 10,
            include_debug_images: false,
        }
    }
}

impl ScanConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Preprocessing settings with the strict-mode blur floor applied.
    pub fn effective_preprocess(&self) -> PreprocessConfig {
        let mut cfg = self.preprocess.clone();
        if self.strict {
            cfg.strict = true;
            cfg.min_blur_score = cfg.min_blur_score.max(STRICT_MIN_BLUR);
        }
        cfg
    }
}

/// Pipeline stage, used to label errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TemplateLoading,
    Preprocessing,
    PaperDetection,
    PerspectiveCorrection,
    RoiExtraction,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::TemplateLoading => "template_loading",
            Stage::Preprocessing => "preprocessing",
            Stage::PaperDetection => "paper_detection",
            Stage::PerspectiveCorrection => "perspective_correction",
            Stage::RoiExtraction => "roi_extraction",
        }
    }

    pub fn error_code(self) -> &'static str {
        match self {
            Stage::TemplateLoading => "TEMPLATE_LOAD_FAILED",
            Stage::Preprocessing => "PREPROCESSING_FAILED",
            Stage::PaperDetection => "PAPER_NOT_DETECTED",
            Stage::PerspectiveCorrection => "PERSPECTIVE_CORRECTION_FAILED",
            Stage::RoiExtraction => "ROI_EXTRACTION_FAILED",
        }
    }
}

struct StageFailure {
    stage: Stage,
    message: String,
}

impl StageFailure {
    fn new(stage: Stage, err: impl std::fmt::Display) -> Self {
        Self {
            stage,
            message: err.to_string(),
        }
    }
}

/// Image handed to a scan.
#[derive(Debug, Clone, Copy)]
pub enum ScanInput<'a> {
    /// Encoded image file contents.
    Bytes(&'a [u8]),
    Image(&'a DynamicImage),
}

/// Mutable state of one scan.
#[derive(Default)]
struct ScanState {
    metrics: Option<QualityMetrics>,
    warnings: Vec<Warning>,
    detections: Vec<QuestionDetection>,
    debug: DebugImages,
}

/// Runs scans against layouts from a shared cache.
///
/// `Scanner` is `Sync`; one instance can serve several worker threads.
#[derive(Debug)]
pub struct Scanner {
    layouts: LayoutCache,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(layouts: LayoutCache, config: ScanConfig) -> Self {
        Self { layouts, config }
    }

    /// Scanner over `<dir>/<template_id>.json` layouts.
    pub fn with_layout_dir(dir: impl AsRef<Path>, config: ScanConfig) -> Self {
        Self::new(LayoutCache::new(DirLayoutStore::new(dir.as_ref())), config)
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn layouts(&self) -> &LayoutCache {
        &self.layouts
    }

    /// Scan an encoded image.
    pub fn scan_bytes(&self, scan_id: &str, template_id: &str, bytes: &[u8]) -> DetectionResult {
        self.scan(scan_id, template_id, ScanInput::Bytes(bytes))
    }

    /// Scan an already-decoded image.
    pub fn scan_image(
        &self,
        scan_id: &str,
        template_id: &str,
        img: &DynamicImage,
    ) -> DetectionResult {
        self.scan(scan_id, template_id, ScanInput::Image(img))
    }

    /// Resolve `template_id` through the cache, then run the pipeline.
    pub fn scan(&self, scan_id: &str, template_id: &str, input: ScanInput<'_>) -> DetectionResult {
        let start = Instant::now();
        let _span = tracing::info_span!("scan", scan_id, template_id).entered();
        tracing::info!("scan started");

        let mut state = ScanState::default();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let layout = self
                .layouts
                .get(template_id)
                .map_err(|e| StageFailure::new(Stage::TemplateLoading, e))?;
            self.run_stages(&layout, input, &mut state)
        }));
        self.finish(scan_id, template_id, state, outcome, start)
    }

    /// Run the pipeline against a layout the caller already holds.
    pub fn scan_with_layout(
        &self,
        scan_id: &str,
        layout: &Layout,
        input: ScanInput<'_>,
    ) -> DetectionResult {
        let start = Instant::now();
        let template_id = layout.template_id.as_str();
        let _span = tracing::info_span!("scan", scan_id, template_id).entered();

        let mut state = ScanState::default();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.run_stages(layout, input, &mut state)
        }));
        self.finish(scan_id, template_id, state, outcome, start)
    }

    fn run_stages(
        &self,
        layout: &Layout,
        input: ScanInput<'_>,
        state: &mut ScanState,
    ) -> Result<(), StageFailure> {
        let cfg = &self.config;

        let decoded;
        let img = match input {
            ScanInput::Image(img) => img,
            ScanInput::Bytes(bytes) => {
                decoded = decode_image(bytes)
                    .map_err(|e| StageFailure::new(Stage::Preprocessing, e))?;
                &decoded
            }
        };
        let pre = preprocess_image(img, &cfg.effective_preprocess())
            .map_err(|e| StageFailure::new(Stage::Preprocessing, e))?;
        if let Some(m) = &pre.metrics {
            self.quality_warnings(m, &mut state.warnings);
        }
        state.metrics = pre.metrics;
        self.snapshot(&pre.image, |d, s| d.preprocessed = s, &mut state.debug);

        let paper = detect_with_fallback(&pre.image, &cfg.paper, cfg.strict)
            .map_err(|e| StageFailure::new(Stage::PaperDetection, e))?;
        tracing::info!(
            area_ratio = paper.area_ratio,
            fallback = paper.fallback,
            "paper boundary"
        );

        let corrected = correct_perspective(&pre.image, &paper.corners, layout.canonical_size)
            .map_err(|e| StageFailure::new(Stage::PerspectiveCorrection, e))?;
        if let Some(m) = state.metrics.as_mut() {
            m.perspective_correction_applied = !paper.fallback;
        }
        if let Err(reason) = validate_perspective_correction(
            &corrected,
            layout.canonical_size,
            cfg.perspective_tolerance_px,
        ) {
            tracing::warn!(%reason, "perspective check failed");
            state.warnings.push(Warning::new(
                "PERSPECTIVE_QUALITY",
                format!("Perspective correction check failed: {reason}"),
            ));
        }
        self.snapshot(&corrected, |d, s| d.perspective_corrected = s, &mut state.debug);

        let aligned = match align_image_with_layout(&corrected, layout, &cfg.align) {
            Ok(AlignmentOutcome::Aligned { image, alignment }) => {
                tracing::info!(
                    found = alignment.marks_found(),
                    total = alignment.marks.len(),
                    "image aligned"
                );
                image
            }
            Ok(AlignmentOutcome::Skipped { reason }) => {
                state.warnings.push(Warning::new(
                    "ALIGNMENT_SKIPPED",
                    format!("Alignment skipped: {reason}"),
                ));
                corrected
            }
            Err(e) => {
                tracing::warn!(error = %e, "alignment failed; continuing unaligned");
                state.warnings.push(Warning::new(
                    "ALIGNMENT_FAILED",
                    format!("Alignment failed, using perspective-corrected image: {e}"),
                ));
                corrected
            }
        };
        self.snapshot(&aligned, |d, s| d.aligned = s, &mut state.debug);

        let rois = extract_all_bubbles(&aligned, layout, cfg.roi_padding)
            .map_err(|e| StageFailure::new(Stage::RoiExtraction, e))?;
        for (qid, options) in &rois {
            let problem = options
                .iter()
                .find_map(|(letter, roi)| validate_roi_quality(roi).err().map(|m| (letter, m)));
            if let Some((letter, msg)) = problem {
                state.warnings.push(Warning::for_question(
                    "ROI_QUALITY",
                    *qid,
                    format!("Question {qid} option {letter}: {msg}"),
                ));
            }
        }

        state.detections = score_all_questions(&rois, layout, &cfg.fill);
        Ok(())
    }

    fn quality_warnings(&self, m: &QualityMetrics, warnings: &mut Vec<Warning>) {
        let cfg = &self.config;
        if m.blur_score < cfg.low_blur_warning {
            warnings.push(Warning::new(
                "LOW_BLUR_SCORE",
                format!("Image may be blurry (score: {:.1})", m.blur_score),
            ));
        }
        if m.skew_angle.abs() > cfg.skew_warning_deg {
            warnings.push(Warning::new(
                "SIGNIFICANT_SKEW",
                format!("Image is skewed by {:.1} degrees", m.skew_angle),
            ));
        }
        let [lo, hi] = cfg.brightness_range;
        if m.brightness_mean < lo || m.brightness_mean > hi {
            warnings.push(Warning::new(
                "POOR_BRIGHTNESS",
                format!("Mean brightness {:.1} outside {lo}..{hi}", m.brightness_mean),
            ));
        }
    }

    fn snapshot(
        &self,
        img: &GrayImage,
        slot: impl FnOnce(&mut DebugImages, Option<String>),
        debug: &mut DebugImages,
    ) {
        if self.config.include_debug_images {
            slot(debug, encode_png_base64(img));
        }
    }

    fn finish(
        &self,
        scan_id: &str,
        template_id: &str,
        mut state: ScanState,
        outcome: std::thread::Result<Result<(), StageFailure>>,
        start: Instant,
    ) -> DetectionResult {
        let mut errors = Vec::new();
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(StageFailure { stage, message })) => {
                tracing::error!(stage = stage.as_str(), %message, "scan failed");
                errors.push(ErrorEntry::new(stage.error_code(), message, Some(stage.as_str())));
                state.detections.clear();
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(%message, "unexpected failure during scan");
                errors.push(ErrorEntry::new(
                    "UNEXPECTED_ERROR",
                    format!("Unexpected error: {message}"),
                    Some("unknown"),
                ));
                state.detections.clear();
            }
        }

        let ambiguous = state
            .detections
            .iter()
            .filter(|d| d.status == AnswerStatus::Ambiguous)
            .count();
        if ambiguous > self.config.max_ambiguous {
            state.warnings.push(Warning::new(
                "MULTIPLE_AMBIGUOUS",
                format!("{ambiguous} questions have ambiguous answers"),
            ));
        }

        let status = overall_status(&errors, &state.detections);
        let processing_time_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            ?status,
            questions = state.detections.len(),
            ambiguous,
            warnings = state.warnings.len(),
            processing_time_ms,
            "scan finished"
        );

        DetectionResult {
            scan_id: scan_id.to_string(),
            template_id: template_id.to_string(),
            status,
            detections: state.detections,
            quality_metrics: state.metrics,
            warnings: state.warnings,
            errors,
            processing_time_ms,
            timestamp: timestamp_now(),
            debug_images: self.config.include_debug_images.then_some(state.debug),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn encode_png_base64(img: &GrayImage) -> Option<String> {
    let mut buf = Vec::new();
    match img.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png) {
        Ok(()) => Some(base64::engine::general_purpose::STANDARD.encode(&buf)),
        Err(e) => {
            tracing::warn!(error = %e, "debug image encoding failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{LayoutLoadError, LayoutStore};
    use crate::result::DetectionStatus;
    use crate::test_utils::{encode_png, render_form, sample_layout};

    struct OneLayout(Layout);

    impl LayoutStore for OneLayout {
        fn load(&self, id: &str) -> Result<Layout, LayoutLoadError> {
            if id == self.0.template_id {
                Ok(self.0.clone())
            } else {
                Err(LayoutLoadError::NotFound(id.to_string()))
            }
        }

        fn list_available(&self) -> Vec<String> {
            vec![self.0.template_id.clone()]
        }
    }

    fn scanner(config: ScanConfig) -> Scanner {
        Scanner::new(LayoutCache::new(OneLayout(sample_layout(600, 800))), config)
    }

    #[test]
    fn unknown_layout_fails_before_image_work() {
        let result = scanner(ScanConfig::default()).scan_bytes("s1", "nope", b"not an image");
        assert_eq!(result.status, DetectionStatus::Failed);
        assert_eq!(result.errors[0].code, "TEMPLATE_LOAD_FAILED");
        assert_eq!(result.errors[0].stage.as_deref(), Some("template_loading"));
        assert!(result.quality_metrics.is_none());
    }

    #[test]
    fn corrupt_image_is_a_preprocessing_failure() {
        let result = scanner(ScanConfig::default()).scan_bytes("s2", "form_test", b"\x89PNGjunk");
        assert_eq!(result.status, DetectionStatus::Failed);
        assert_eq!(result.errors[0].code, "PREPROCESSING_FAILED");
        assert!(result.detections.is_empty());
    }

    #[test]
    fn marked_form_is_scored() {
        let layout = sample_layout(600, 800);
        let img = render_form(&layout, &[(1, "B", 0.9), (3, "D", 0.9)]);
        let result = scanner(ScanConfig::default()).scan_bytes("s3", "form_test", &encode_png(&img));
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(result.status, DetectionStatus::Success);
        assert_eq!(result.detections.len(), 5);

        let q1 = &result.detections[0];
        assert_eq!(q1.status, AnswerStatus::Answered);
        assert_eq!(q1.selected, vec!["B"]);
        assert_eq!(result.detections[2].selected, vec!["D"]);
        assert_eq!(result.detections[1].status, AnswerStatus::Unanswered);
        assert!(result.quality_metrics.is_some());
        assert!(result.debug_images.is_none());
    }

    #[test]
    fn double_mark_needs_review_and_debug_images_attach() {
        let layout = sample_layout(600, 800);
        let img = render_form(&layout, &[(2, "A", 0.9), (2, "C", 0.9)]);
        let config = ScanConfig {
            include_debug_images: true,
            ..ScanConfig::default()
        };
        let result = scanner(config).scan_image("s4", "form_test", &DynamicImage::ImageLuma8(img));
        assert_eq!(result.status, DetectionStatus::NeedsReview);
        assert_eq!(result.detections[1].status, AnswerStatus::Ambiguous);
        assert_eq!(result.detections[1].selected, vec!["A", "C"]);
        let debug = result.debug_images.unwrap();
        assert!(debug.preprocessed.is_some());
        assert!(debug.aligned.is_some());
    }

    #[test]
    fn strict_mode_rejects_missing_paper() {
        let layout = sample_layout(600, 800);
        let img = render_form(&layout, &[]);
        let config = ScanConfig {
            strict: true,
            ..ScanConfig::default()
        };
        let result = scanner(config).scan_bytes("s5", "form_test", &encode_png(&img));
        assert_eq!(result.status, DetectionStatus::Failed);
        assert_eq!(result.errors[0].code, "PAPER_NOT_DETECTED");
    }

    #[test]
    fn strict_mode_raises_the_blur_floor() {
        let cfg = ScanConfig {
            strict: true,
            ..ScanConfig::default()
        };
        let pre = cfg.effective_preprocess();
        assert!(pre.strict);
        assert_eq!(pre.min_blur_score, 80.0);
        assert!(!ScanConfig::default().effective_preprocess().strict);
    }

    #[test]
    fn config_round_trips_through_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.json");
        std::fs::write(&path, r#"{"strict": true, "fill": {"noise_floor": 0.4}}"#).unwrap();
        let cfg = ScanConfig::from_json_file(&path).unwrap();
        assert!(cfg.strict);
        assert_eq!(cfg.fill.noise_floor, 0.4);
        assert_eq!(cfg.fill.close_ratio, 0.45);
        assert_eq!(cfg.roi_padding, ROI_PADDING);
        assert!(matches!(
            ScanConfig::from_json_file(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn panics_become_unexpected_errors() {
        let scanner = scanner(ScanConfig::default());
        let state = ScanState::default();
        let outcome: std::thread::Result<Result<(), StageFailure>> =
            catch_unwind(|| panic!("boom"));
        let result = scanner.finish("s6", "form_test", state, outcome, Instant::now());
        assert_eq!(result.status, DetectionStatus::Failed);
        assert_eq!(result.errors[0].code, "UNEXPECTED_ERROR");
        assert!(result.errors[0].message.contains("boom"));
    }
}
