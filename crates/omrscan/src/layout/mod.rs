//! Answer-sheet layout records.
//!
//! A layout describes one printed form in canonical (perspective-corrected)
//! pixel space: the canonical size, the registration marks used for fine
//! alignment, bubble geometry/thresholds and every question's bubble centers.
//! Layouts are validated when loaded and never mutated afterwards.

mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub use store::{DirLayoutStore, LayoutCache, LayoutStore};

/// Failure to resolve a layout identifier to a valid record.
#[derive(Debug, thiserror::Error)]
pub enum LayoutLoadError {
    #[error("layout '{0}' not found")]
    NotFound(String),
    #[error("failed to read layout '{id}': {source}")]
    Io {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse layout '{id}': {source}")]
    Parse {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("layout '{id}' failed validation: {reason}")]
    Invalid { id: String, reason: String },
}

/// Point in canonical pixel space.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn to_point(self) -> [f64; 2] {
        [self.x, self.y]
    }
}

/// Target size every corrected image must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CanonicalSize {
    pub width: u32,
    pub height: u32,
}

/// Shape of a registration mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkKind {
    Circle,
    Square,
}

fn default_mark_size() -> u32 {
    20
}

/// Printed fiducial at a known canonical position.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RegistrationMark {
    pub id: String,
    pub position: Position,
    #[serde(rename = "type")]
    pub kind: MarkKind,
    /// Radius for circles, side length for squares (pixels).
    #[serde(default = "default_mark_size")]
    pub size: u32,
}

fn default_fill_threshold() -> f64 {
    0.30
}

fn default_ambiguous_threshold() -> f64 {
    0.65
}

/// Bubble geometry and decision thresholds shared by all questions.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BubbleConfig {
    /// Expected bubble radius in canonical pixels.
    pub radius: u32,
    /// Minimum fill ratio for a bubble to count as marked.
    #[serde(default = "default_fill_threshold")]
    pub fill_threshold: f64,
    /// More than one bubble above this ratio makes a question ambiguous.
    #[serde(default = "default_ambiguous_threshold")]
    pub ambiguous_threshold: f64,
}

/// One question: option letter → bubble center.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Question {
    pub question_id: u32,
    pub options: BTreeMap<String, Position>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderFieldKind {
    Title,
    Subtitle,
    TextField,
}

/// Printed header element (name box, title, ...). Not measured by detection.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HeaderField {
    pub field_id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: HeaderFieldKind,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LayoutMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// Complete layout record for one form.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Layout {
    pub template_id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub canonical_size: CanonicalSize,
    pub registration_marks: Vec<RegistrationMark>,
    pub bubble_config: BubbleConfig,
    pub questions: Vec<Question>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_fields: Vec<HeaderField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<LayoutMetadata>,
}

impl Layout {
    /// Parse and validate a layout from JSON text.
    pub fn from_json_str(id: &str, data: &str) -> Result<Self, LayoutLoadError> {
        let layout: Layout = serde_json::from_str(data).map_err(|source| LayoutLoadError::Parse {
            id: id.to_string(),
            source,
        })?;
        validate_layout(&layout).map_err(|reason| LayoutLoadError::Invalid {
            id: id.to_string(),
            reason,
        })?;
        Ok(layout)
    }

    /// Load and validate a layout from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, LayoutLoadError> {
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let data = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LayoutLoadError::NotFound(id.clone())
            } else {
                LayoutLoadError::Io {
                    id: id.clone(),
                    source,
                }
            }
        })?;
        Self::from_json_str(&id, &data)
    }

    /// Total number of bubbles across all questions.
    pub fn bubble_count(&self) -> usize {
        self.questions.iter().map(|q| q.options.len()).sum()
    }

    /// Expected registration mark centers, in layout order.
    pub fn mark_positions(&self) -> Vec<[f64; 2]> {
        self.registration_marks
            .iter()
            .map(|m| m.position.to_point())
            .collect()
    }
}

/// Minimum registration marks a layout must declare.
pub const MIN_REGISTRATION_MARKS: usize = 3;
/// Maximum registration marks a layout may declare.
pub const MAX_REGISTRATION_MARKS: usize = 4;

fn validate_layout(layout: &Layout) -> Result<(), String> {
    if layout.template_id.trim().is_empty() {
        return Err("template_id must not be empty".to_string());
    }
    let size = layout.canonical_size;
    if size.width == 0 || size.height == 0 {
        return Err(format!(
            "canonical_size must be positive (got {}x{})",
            size.width, size.height
        ));
    }
    let inside = |p: &Position| {
        p.x.is_finite()
            && p.y.is_finite()
            && p.x >= 0.0
            && p.y >= 0.0
            && p.x < size.width as f64
            && p.y < size.height as f64
    };

    let n_marks = layout.registration_marks.len();
    if !(MIN_REGISTRATION_MARKS..=MAX_REGISTRATION_MARKS).contains(&n_marks) {
        return Err(format!(
            "registration_marks must have {}..={} entries (got {})",
            MIN_REGISTRATION_MARKS, MAX_REGISTRATION_MARKS, n_marks
        ));
    }
    let mut mark_ids = BTreeSet::new();
    for mark in &layout.registration_marks {
        if !mark_ids.insert(mark.id.as_str()) {
            return Err(format!("duplicate registration mark id '{}'", mark.id));
        }
        if !inside(&mark.position) {
            return Err(format!(
                "registration mark '{}' lies outside the canonical size",
                mark.id
            ));
        }
        if mark.size == 0 {
            return Err(format!("registration mark '{}' has zero size", mark.id));
        }
    }

    let bubble = layout.bubble_config;
    if !(5..=50).contains(&bubble.radius) {
        return Err(format!(
            "bubble_config.radius must be in 5..=50 (got {})",
            bubble.radius
        ));
    }
    if !(0.1..=0.9).contains(&bubble.fill_threshold) {
        return Err(format!(
            "bubble_config.fill_threshold must be in [0.1, 0.9] (got {})",
            bubble.fill_threshold
        ));
    }
    if !(0.1..=1.0).contains(&bubble.ambiguous_threshold) {
        return Err(format!(
            "bubble_config.ambiguous_threshold must be in [0.1, 1.0] (got {})",
            bubble.ambiguous_threshold
        ));
    }

    if layout.questions.is_empty() {
        return Err("questions must contain at least one entry".to_string());
    }
    let mut question_ids = BTreeSet::new();
    for q in &layout.questions {
        if q.question_id == 0 {
            return Err("question_id must be >= 1".to_string());
        }
        if !question_ids.insert(q.question_id) {
            return Err(format!("duplicate question_id {}", q.question_id));
        }
        if q.options.is_empty() {
            return Err(format!("question {} has no options", q.question_id));
        }
        for (letter, pos) in &q.options {
            if letter.trim().is_empty() {
                return Err(format!("question {} has an empty option label", q.question_id));
            }
            if !inside(pos) {
                return Err(format!(
                    "question {} option '{}' lies outside the canonical size",
                    q.question_id, letter
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_layout;

    fn sample_json() -> String {
        serde_json::to_string(&sample_layout(600, 800)).unwrap()
    }

    fn mutate(f: impl FnOnce(&mut serde_json::Value)) -> Result<Layout, LayoutLoadError> {
        let mut v: serde_json::Value = serde_json::from_str(&sample_json()).unwrap();
        f(&mut v);
        Layout::from_json_str("form_test", &v.to_string())
    }

    #[test]
    fn sample_layout_round_trips_through_validation() {
        let layout = Layout::from_json_str("form_test", &sample_json()).unwrap();
        assert_eq!(layout, sample_layout(600, 800));
        assert_eq!(layout.bubble_count(), 20);
    }

    #[test]
    fn defaults_fill_in_optional_fields() {
        let json = r#"{
            "template_id": "mini",
            "name": "Mini",
            "canonical_size": {"width": 400, "height": 500},
            "registration_marks": [
                {"id": "tl", "position": {"x": 20, "y": 20}, "type": "circle"},
                {"id": "tr", "position": {"x": 380, "y": 20}, "type": "square"},
                {"id": "bl", "position": {"x": 20, "y": 480}, "type": "circle"}
            ],
            "bubble_config": {"radius": 10},
            "questions": [{"question_id": 1, "options": {"A": {"x": 100, "y": 100}}}]
        }"#;
        let layout = Layout::from_json_str("mini", json).unwrap();
        assert_eq!(layout.version, "1.0.0");
        assert_eq!(layout.registration_marks[0].size, 20);
        assert_eq!(layout.registration_marks[1].kind, MarkKind::Square);
        assert!((layout.bubble_config.fill_threshold - 0.30).abs() < 1e-12);
        assert!((layout.bubble_config.ambiguous_threshold - 0.65).abs() < 1e-12);
    }

    #[test]
    fn rejects_too_few_marks() {
        let err = mutate(|v| {
            v["registration_marks"].as_array_mut().unwrap().truncate(2);
        })
        .unwrap_err();
        assert!(matches!(err, LayoutLoadError::Invalid { ref reason, .. } if reason.contains("registration_marks")));
    }

    #[test]
    fn rejects_empty_questions() {
        let err = mutate(|v| v["questions"] = serde_json::json!([])).unwrap_err();
        assert!(matches!(err, LayoutLoadError::Invalid { .. }));
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let err = mutate(|v| v["bubble_config"]["fill_threshold"] = serde_json::json!(0.95))
            .unwrap_err();
        assert!(err.to_string().contains("fill_threshold"));
        let err = mutate(|v| v["bubble_config"]["radius"] = serde_json::json!(2)).unwrap_err();
        assert!(err.to_string().contains("radius"));
    }

    #[test]
    fn rejects_duplicate_question_ids() {
        let err = mutate(|v| v["questions"][1]["question_id"] = serde_json::json!(1)).unwrap_err();
        assert!(err.to_string().contains("duplicate question_id"));
    }

    #[test]
    fn rejects_missing_geometry() {
        let err = mutate(|v| {
            v.as_object_mut().unwrap().remove("canonical_size");
        })
        .unwrap_err();
        assert!(matches!(err, LayoutLoadError::Parse { .. }));
    }

    #[test]
    fn rejects_bubbles_outside_canvas() {
        let err = mutate(|v| v["questions"][0]["options"]["A"]["x"] = serde_json::json!(5000))
            .unwrap_err();
        assert!(err.to_string().contains("outside"));
    }
}
