//! The detection result record handed to callers.
//!
//! Measurements only: fill ratios, selections and their status. No grading
//! decision is ever made here.

use serde::{Deserialize, Serialize};

use crate::fill::{AnswerStatus, FillRatios};
use crate::quality::QualityMetrics;

/// Overall outcome of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Success,
    NeedsReview,
    Failed,
}

/// Measurements and decision for one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionDetection {
    pub question_id: u32,
    pub fill_ratios: FillRatios,
    /// Selected option letters, alphabetical.
    pub selected: Vec<String>,
    pub status: AnswerStatus,
    pub confidence: f64,
}

/// Non-fatal observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question_id: Option<u32>,
}

impl Warning {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            question_id: None,
        }
    }

    pub fn for_question(code: &str, question_id: u32, message: impl Into<String>) -> Self {
        Self {
            question_id: Some(question_id),
            ..Self::new(code, message)
        }
    }
}

/// Failure that stopped the scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl ErrorEntry {
    pub fn new(code: &str, message: impl Into<String>, stage: Option<&str>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            stage: stage.map(str::to_string),
        }
    }
}

/// Base64-encoded PNG snapshots of intermediate stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebugImages {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perspective_corrected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aligned: Option<String>,
}

/// Complete outcome of one scan; the only externally visible output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub scan_id: String,
    pub template_id: String,
    pub status: DetectionStatus,
    pub detections: Vec<QuestionDetection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<QualityMetrics>,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    pub processing_time_ms: u64,
    /// RFC 3339 UTC completion time.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_images: Option<DebugImages>,
}

impl DetectionResult {
    /// A `failed` record carrying a single error.
    pub fn failure(scan_id: &str, template_id: &str, error: ErrorEntry) -> Self {
        Self {
            scan_id: scan_id.to_string(),
            template_id: template_id.to_string(),
            status: DetectionStatus::Failed,
            detections: Vec::new(),
            quality_metrics: None,
            warnings: Vec::new(),
            errors: vec![error],
            processing_time_ms: 0,
            timestamp: timestamp_now(),
            debug_images: None,
        }
    }

    pub fn ambiguous_count(&self) -> usize {
        self.detections
            .iter()
            .filter(|d| d.status == AnswerStatus::Ambiguous)
            .count()
    }

    pub fn answered_count(&self) -> usize {
        self.detections
            .iter()
            .filter(|d| d.status == AnswerStatus::Answered)
            .count()
    }
}

/// `failed` with any error, `needs_review` with an ambiguous question.
pub fn overall_status(errors: &[ErrorEntry], detections: &[QuestionDetection]) -> DetectionStatus {
    if !errors.is_empty() {
        DetectionStatus::Failed
    } else if detections
        .iter()
        .any(|d| d.status == AnswerStatus::Ambiguous)
    {
        DetectionStatus::NeedsReview
    } else {
        DetectionStatus::Success
    }
}

pub(crate) fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
