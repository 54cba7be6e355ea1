//! Bubble fill measurement and per-question answer decisions.
//!
//! A bubble's fill ratio is the fraction of a centered circular mask,
//! slightly smaller than the printed radius, classified as ink. The
//! thresholding strategy depends on the mean brightness inside the mask:
//!
//! * bright (> 200): blur the masked region, Otsu (inverse) over the ROI,
//!   re-mask and erode once to strip the printed outline;
//! * dark (< 100): count pixels under a fixed ink level;
//! * otherwise: Gaussian adaptive threshold on the blurred ROI, re-mask and
//!   erode. Only local contrast counts here, so a shadowed blank bubble
//!   stays blank.
//!
//! Decisions subtract the per-question baseline (lowest ratio) before
//! comparing options, so printed outlines common to every option do not
//! look like partial marks.

use std::collections::BTreeMap;

use image::{GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;

use crate::geometry::circular_mask;
use crate::layout::Layout;
use crate::preprocess::threshold::{adaptive_threshold, binarize, gaussian_smooth, odd};
use crate::result::QuestionDetection;
use crate::roi::BubbleRois;

/// Option letter → fill ratio in [0, 1].
pub type FillRatios = BTreeMap<String, f64>;

/// Fill measurement and decision parameters.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FillConfig {
    /// Scoring mask radius as a fraction of the bubble radius.
    pub scoring_radius_frac: f64,
    pub min_scoring_radius: u32,
    /// Masked mean above which the bright (Otsu) branch is used.
    pub bright_mean: f64,
    /// Masked mean below which the dark (fixed level) branch is used.
    pub dark_mean: f64,
    /// Dark-branch ink level: pixels below it are ink.
    pub ink_level: u8,
    /// Blur kernel as a fraction of the ROI size.
    pub blur_frac: f64,
    /// Adaptive block size as a fraction of the ROI size.
    pub block_frac: f64,
    pub min_block: u32,
    pub adaptive_c: f32,
    /// Noise floor for competing options, as a fraction of `fill_threshold`.
    pub noise_floor: f64,
    /// Second-best net fill over best net fill that triggers the relative check.
    pub competitor_ratio: f64,
    /// Net fill over best net fill for an option to count as competing.
    pub close_ratio: f64,
}

impl Default for FillConfig {
    fn default() -> Self {
        Self {
            scoring_radius_frac: 0.95,
            min_scoring_radius: 3,
            bright_mean: 200.0,
            dark_mean: 100.0,
            ink_level: 127,
            blur_frac: 0.08,
            block_frac: 0.25,
            min_block: 7,
            adaptive_c: 5.0,
            noise_floor: 0.35,
            competitor_ratio: 0.55,
            close_ratio: 0.45,
        }
    }
}

/// Fraction of the bubble interior covered by ink.
pub fn calculate_fill_ratio(roi: &GrayImage, radius: u32, config: &FillConfig) -> f64 {
    let (w, h) = roi.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let r = ((radius as f64 * config.scoring_radius_frac) as u32).max(config.min_scoring_radius);
    let center = [(w / 2) as i64, (h / 2) as i64];
    let mask = circular_mask(w, h, center, r);

    let (mut sum, mut count) = (0u64, 0u64);
    for (p, m) in roi.pixels().zip(mask.pixels()) {
        if m[0] > 0 {
            sum += p[0] as u64;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    let mean = sum as f64 / count as f64;
    let dim = w.max(h);
    let blur_k = odd((dim as f64 * config.blur_frac) as u32).max(3);

    let ink = if mean > config.bright_mean {
        let masked = GrayImage::from_fn(w, h, |x, y| {
            if mask.get_pixel(x, y)[0] > 0 {
                *roi.get_pixel(x, y)
            } else {
                Luma([0])
            }
        });
        let blurred = gaussian_smooth(&masked, blur_k);
        let binary = binarize(&blurred, otsu_level(&blurred), true);
        count_ink(&erode(&apply_mask(&binary, &mask), Norm::L1, 1))
    } else if mean < config.dark_mean {
        roi.pixels()
            .zip(mask.pixels())
            .filter(|(p, m)| m[0] > 0 && p[0] < config.ink_level)
            .count() as u64
    } else {
        let blurred = gaussian_smooth(roi, blur_k);
        let block = odd((dim as f64 * config.block_frac) as u32).max(config.min_block);
        let binary = adaptive_threshold(&blurred, block, config.adaptive_c, true);
        count_ink(&erode(&apply_mask(&binary, &mask), Norm::L1, 1))
    };

    (ink as f64 / count as f64).clamp(0.0, 1.0)
}

fn apply_mask(binary: &GrayImage, mask: &GrayImage) -> GrayImage {
    GrayImage::from_fn(binary.width(), binary.height(), |x, y| {
        if mask.get_pixel(x, y)[0] > 0 {
            *binary.get_pixel(x, y)
        } else {
            Luma([0])
        }
    })
}

fn count_ink(binary: &GrayImage) -> u64 {
    binary.pixels().filter(|p| p[0] > 0).count() as u64
}

/// Fill ratios of every option of one question.
pub fn score_question_bubbles(
    rois: &BTreeMap<String, GrayImage>,
    radius: u32,
    config: &FillConfig,
) -> FillRatios {
    rois.iter()
        .map(|(letter, roi)| (letter.clone(), calculate_fill_ratio(roi, radius, config)))
        .collect()
}

/// Decision status of one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Answered,
    Unanswered,
    Ambiguous,
}

/// Selected options, status and confidence for one question.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerDecision {
    /// Selected option letters, alphabetical.
    pub selected: Vec<String>,
    pub status: AnswerStatus,
    pub confidence: f64,
}

impl AnswerDecision {
    fn unanswered() -> Self {
        Self {
            selected: Vec::new(),
            status: AnswerStatus::Unanswered,
            confidence: 0.0,
        }
    }
}

/// Decide which options of a question are marked.
pub fn determine_selected_answers(
    ratios: &FillRatios,
    fill_threshold: f64,
    ambiguous_threshold: f64,
    config: &FillConfig,
) -> AnswerDecision {
    if ratios.is_empty() {
        return AnswerDecision::unanswered();
    }
    let baseline = ratios.values().copied().fold(f64::INFINITY, f64::min);
    let top_abs = ratios.values().copied().fold(f64::NEG_INFINITY, f64::max);
    if top_abs < fill_threshold {
        return AnswerDecision::unanswered();
    }

    // Net fill, descending; letters break ties.
    let mut net: Vec<(&str, f64)> = ratios
        .iter()
        .map(|(k, v)| (k.as_str(), (v - baseline).max(0.0)))
        .collect();
    net.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let (top_letter, top_net) = net[0];
    let second_net = net.get(1).map_or(0.0, |n| n.1);

    let noise_floor = config.noise_floor * fill_threshold;
    if top_net > 0.0 && second_net > noise_floor && second_net > config.competitor_ratio * top_net {
        let mut close: Vec<String> = net
            .iter()
            .filter(|(_, n)| *n > noise_floor && *n > config.close_ratio * top_net)
            .map(|(k, _)| k.to_string())
            .collect();
        if close.len() > 1 {
            close.sort();
            return AnswerDecision {
                selected: close,
                status: AnswerStatus::Ambiguous,
                confidence: top_net - second_net,
            };
        }
    }

    let mut above: Vec<String> = ratios
        .iter()
        .filter(|(_, v)| **v >= ambiguous_threshold)
        .map(|(k, _)| k.clone())
        .collect();
    if above.len() > 1 {
        above.sort();
        return AnswerDecision {
            selected: above,
            status: AnswerStatus::Ambiguous,
            confidence: 0.0,
        };
    }

    let confidence = if net.len() > 1 {
        top_net - second_net
    } else {
        top_net
    };
    AnswerDecision {
        selected: vec![top_letter.to_string()],
        status: AnswerStatus::Answered,
        confidence,
    }
}

/// Score and decide every question of `layout` from its extracted regions.
pub fn score_all_questions(
    rois: &BubbleRois,
    layout: &Layout,
    config: &FillConfig,
) -> Vec<QuestionDetection> {
    let bubble = &layout.bubble_config;
    layout
        .questions
        .iter()
        .filter_map(|q| {
            let Some(options) = rois.get(&q.question_id) else {
                tracing::warn!(question = q.question_id, "no regions for question");
                return None;
            };
            let fill_ratios = score_question_bubbles(options, bubble.radius, config);
            if let Err(reason) = validate_fill_ratios(&fill_ratios) {
                tracing::warn!(question = q.question_id, %reason, "invalid fill ratios");
            }
            let decision = determine_selected_answers(
                &fill_ratios,
                bubble.fill_threshold,
                bubble.ambiguous_threshold,
                config,
            );
            tracing::debug!(
                question = q.question_id,
                status = ?decision.status,
                selected = ?decision.selected,
                confidence = decision.confidence,
                contrast = calculate_contrast_score(&fill_ratios),
                "question scored"
            );
            Some(QuestionDetection {
                question_id: q.question_id,
                fill_ratios,
                selected: decision.selected,
                status: decision.status,
                confidence: decision.confidence,
            })
        })
        .collect()
}

/// All ratios finite and within [0, 1].
pub fn validate_fill_ratios(ratios: &FillRatios) -> Result<(), String> {
    for (k, v) in ratios {
        if !v.is_finite() || !(0.0..=1.0).contains(v) {
            return Err(format!("fill ratio for option {k} out of range: {v}"));
        }
    }
    Ok(())
}

/// Spread of a question's fill ratios (population standard deviation).
pub fn calculate_contrast_score(ratios: &FillRatios) -> f64 {
    if ratios.len() < 2 {
        return 0.0;
    }
    let n = ratios.len() as f64;
    let mean = ratios.values().sum::<f64>() / n;
    (ratios.values().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{blur_gray, bubble_roi, PAPER};
    use approx::assert_abs_diff_eq;

    fn ratios(pairs: &[(&str, f64)]) -> FillRatios {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn decide(pairs: &[(&str, f64)]) -> AnswerDecision {
        determine_selected_answers(&ratios(pairs), 0.30, 0.65, &FillConfig::default())
    }

    #[test]
    fn two_heavy_marks_are_ambiguous() {
        let d = decide(&[("A", 0.7), ("B", 0.7)]);
        assert_eq!(d.status, AnswerStatus::Ambiguous);
        assert_eq!(d.selected, vec!["A", "B"]);

        let d = decide(&[("A", 0.7), ("B", 0.7), ("C", 0.1), ("D", 0.1)]);
        assert_eq!(d.status, AnswerStatus::Ambiguous);
        assert_eq!(d.selected, vec!["A", "B"]);
    }

    #[test]
    fn one_heavy_mark_is_answered_with_net_confidence() {
        let d = decide(&[("A", 0.7), ("B", 0.2)]);
        assert_eq!(d.status, AnswerStatus::Answered);
        assert_eq!(d.selected, vec!["A"]);
        assert_abs_diff_eq!(d.confidence, 0.5, epsilon = 1e-9);
    }

    #[test]
    fn faint_question_is_unanswered() {
        let d = decide(&[("A", 0.10), ("B", 0.10), ("C", 0.10), ("D", 0.10)]);
        assert_eq!(d, AnswerDecision::unanswered());
        assert!(decide(&[]).selected.is_empty());
    }

    #[test]
    fn relative_check_catches_partial_second_mark() {
        // Neither reaches the absolute ambiguity threshold.
        let d = decide(&[("A", 0.60), ("B", 0.45), ("C", 0.08), ("D", 0.08)]);
        assert_eq!(d.status, AnswerStatus::Ambiguous);
        assert_eq!(d.selected, vec!["A", "B"]);
        assert_abs_diff_eq!(d.confidence, 0.15, epsilon = 1e-9);
    }

    #[test]
    fn uniform_bias_does_not_change_clear_answers() {
        let base = [("A", 0.05), ("B", 0.80), ("C", 0.10), ("D", 0.04)];
        let reference = decide(&base);
        assert_eq!(reference.selected, vec!["B"]);
        for step in 1..=10 {
            let bias = 0.025 * step as f64;
            let shifted: Vec<(&str, f64)> = base.iter().map(|(k, v)| (*k, v + bias)).collect();
            let d = decide(&shifted);
            assert_eq!(d.status, reference.status, "bias {bias}");
            assert_eq!(d.selected, reference.selected, "bias {bias}");
        }
    }

    #[test]
    fn single_option_has_no_net_margin() {
        let d = decide(&[("A", 0.9)]);
        assert_eq!(d.status, AnswerStatus::Answered);
        assert_abs_diff_eq!(d.confidence, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn blank_and_filled_bubbles_separate() {
        let cfg = FillConfig::default();
        let blank = calculate_fill_ratio(&bubble_roi(40, 10, 0.0, PAPER), 10, &cfg);
        let filled = calculate_fill_ratio(&bubble_roi(40, 10, 0.9, PAPER), 10, &cfg);
        assert!(blank < 0.05, "blank {blank}");
        assert!(filled > 0.85, "filled {filled}");

        // Same after the smoothing the preprocessor applies.
        let blank = calculate_fill_ratio(&blur_gray(&bubble_roi(40, 10, 0.0, PAPER), 1.1), 10, &cfg);
        let filled =
            calculate_fill_ratio(&blur_gray(&bubble_roi(40, 10, 0.9, PAPER), 1.1), 10, &cfg);
        assert!(blank < 0.05, "blurred blank {blank}");
        assert!(filled > 0.85, "blurred filled {filled}");
    }

    #[test]
    fn more_ink_never_scores_lower() {
        let cfg = FillConfig::default();
        // Dark branch: darken pixels one ring at a time.
        let mut roi = bubble_roi(40, 10, 0.5, 160);
        let mut last = calculate_fill_ratio(&roi, 10, &cfg);
        for r in 7..=9 {
            imageproc::drawing::draw_hollow_circle_mut(&mut roi, (20, 20), r, Luma([20]));
            let next = calculate_fill_ratio(&roi, 10, &cfg);
            assert!(next >= last, "ring {r}: {next} < {last}");
            last = next;
        }

        let coverage = [0.0, 0.25, 0.9];
        let scores: Vec<f64> = coverage
            .iter()
            .map(|c| calculate_fill_ratio(&bubble_roi(40, 10, *c, PAPER), 10, &cfg))
            .collect();
        assert!(scores[0] < scores[1] && scores[1] < scores[2], "{scores:?}");
    }

    /// Blank bubble on uniformly dimmed paper with a printed outline.
    fn shadowed_blank(paper: u8) -> GrayImage {
        let mut roi = GrayImage::from_pixel(40, 40, Luma([paper]));
        for r in [10, 11] {
            imageproc::drawing::draw_hollow_circle_mut(&mut roi, (20, 20), r, Luma([70]));
        }
        roi
    }

    #[test]
    fn shadowed_blank_bubbles_stay_blank() {
        let cfg = FillConfig::default();
        for paper in [120u8, 140, 160, 190] {
            let ratio = calculate_fill_ratio(&shadowed_blank(paper), 10, &cfg);
            assert!(ratio < 0.05, "paper {paper}: {ratio}");
            let blurred = calculate_fill_ratio(&blur_gray(&shadowed_blank(paper), 1.1), 10, &cfg);
            assert!(blurred < 0.05, "blurred paper {paper}: {blurred}");
        }
    }

    #[test]
    fn dim_paper_separates_blank_from_filled() {
        let cfg = FillConfig::default();
        for paper in [120u8, 160] {
            let blank = calculate_fill_ratio(&bubble_roi(40, 10, 0.0, paper), 10, &cfg);
            let filled = calculate_fill_ratio(&bubble_roi(40, 10, 0.9, paper), 10, &cfg);
            assert!(blank < 0.05, "paper {paper}: blank {blank}");
            assert!(filled > 0.85, "paper {paper}: filled {filled}");
        }
    }

    #[test]
    fn partial_mark_on_dim_paper_uses_local_contrast() {
        let cfg = FillConfig::default();
        // Masked mean of a quarter-filled bubble on paper 160 is mid-range.
        let partial = calculate_fill_ratio(&bubble_roi(40, 10, 0.25, 160), 10, &cfg);
        let blank = calculate_fill_ratio(&bubble_roi(40, 10, 0.0, 160), 10, &cfg);
        assert!(partial > 0.12, "partial {partial}");
        assert!(partial < 0.5, "partial {partial}");
        assert!(partial > blank + 0.1, "partial {partial}, blank {blank}");
    }

    #[test]
    fn ratio_validation_and_contrast() {
        assert!(validate_fill_ratios(&ratios(&[("A", 0.2), ("B", 1.0)])).is_ok());
        assert!(validate_fill_ratios(&ratios(&[("A", 1.2)])).is_err());
        assert!(validate_fill_ratios(&ratios(&[("A", f64::NAN)])).is_err());
        assert_abs_diff_eq!(
            calculate_contrast_score(&ratios(&[("A", 0.0), ("B", 1.0)])),
            0.5,
            epsilon = 1e-12
        );
        assert_eq!(calculate_contrast_score(&ratios(&[("A", 0.4)])), 0.0);
    }
}
