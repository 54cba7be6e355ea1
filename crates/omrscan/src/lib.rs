//! omrscan: optical mark recognition for photographed answer sheets.
//!
//! Converts an image of a printed form into per-question bubble
//! measurements. No grading happens here: the output is fill ratios,
//! selected options and a status per question.
//!
//! The pipeline stages are:
//!
//! 1. **Preprocess**: decode, minimum-resolution upscale, quality metrics,
//!    CLAHE contrast enhancement, smoothing, binarization selection.
//! 2. **Paper**: document outline via edges and contour polygon search,
//!    with a full-frame fallback.
//! 3. **Perspective**: four-point warp into the layout's canonical size.
//! 4. **Align**: registration-mark search and a residual affine/similarity
//!    correction.
//! 5. **ROI**: one square crop per bubble.
//! 6. **Fill**: masked ink ratio per bubble and baseline-relative answer
//!    decisions.
//!
//! # Public API
//! - [`Scanner`] and [`ScanConfig`] as primary entry points
//! - [`Layout`], [`LayoutCache`] and the [`LayoutStore`] trait
//! - [`DetectionResult`] and its parts
//! - per-stage functions and their typed errors
//! - [`run_job`]/[`run_worker`] for the queue boundary, [`preview_frame`] for
//!   live capture guidance

pub mod align;
pub mod fill;
pub mod geometry;
pub mod job;
pub mod layout;
pub mod paper;
pub mod perspective;
pub mod pipeline;
pub mod preprocess;
pub mod preview;
pub mod quality;
pub mod result;
pub mod roi;

#[cfg(test)]
pub(crate) mod test_utils;

pub use align::{
    align_image_with_layout, AlignConfig, AlignmentError, AlignmentOutcome, MarkDetection,
    TransformModel,
};
pub use fill::{
    calculate_fill_ratio, determine_selected_answers, AnswerDecision, AnswerStatus, FillConfig,
    FillRatios,
};
pub use geometry::{order_points, Point};
pub use job::{run_job, run_worker, ScanJob, WorkerStats};
pub use layout::{
    CanonicalSize, DirLayoutStore, Layout, LayoutCache, LayoutLoadError, LayoutStore, MarkKind,
    Question, RegistrationMark,
};
pub use paper::{detect_paper_boundary, detect_with_fallback, PaperConfig, PaperNotFoundError};
pub use perspective::{correct_perspective, PerspectiveError};
pub use pipeline::{ConfigError, ScanConfig, ScanInput, Scanner};
pub use preprocess::{
    preprocess_image, DecodeError, PreprocessConfig, PreprocessError, QualityWarning,
};
pub use preview::{preview_frame, PreviewConfig, PreviewReport};
pub use quality::QualityMetrics;
pub use result::{DetectionResult, DetectionStatus, ErrorEntry, QuestionDetection, Warning};
pub use roi::{extract_all_bubbles, RoiExtractionError};
