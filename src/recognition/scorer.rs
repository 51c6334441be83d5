//! Quality scoring for engine output.
//!
//! Scores are pure functions of the engine result, the routing hint and the
//! configuration. There is no randomness, and no dependence on timing, so
//! selection between engines is reproducible.

use std::sync::Arc;

use crate::config::ScoringConfig;

use super::{
    EngineResult, RoutingHint, ScoreBreakdown, ScoredResult, join_blocks,
    lexicon::{Lexicons, tokenize},
};

/// Longest substring period checked for runaway repetition.
const MAX_REPEAT_PERIOD: usize = 16;

/// Single characters must repeat this many times before we call it a loop.
/// Lower values would flag ordinary words and numbers.
const MIN_SINGLE_CHAR_REPEATS: usize = 8;

/// Scores [`EngineResult`]s.
#[derive(Clone, Debug)]
pub struct Scorer {
    config: ScoringConfig,
    lexicons: Arc<Lexicons>,
}

impl Scorer {
    /// Create a new scorer.
    pub fn new(config: ScoringConfig, lexicons: Arc<Lexicons>) -> Self {
        Self { config, lexicons }
    }

    /// Score a result. Only `ok` results can be scored; anything else returns
    /// `None` and must be treated as absent evidence.
    pub fn score(&self, result: EngineResult, hint: &RoutingHint) -> Option<ScoredResult> {
        let blocks = result.outcome.blocks()?;
        let text = join_blocks(blocks);

        let confidences = blocks
            .iter()
            .filter_map(|block| block.confidence)
            .map(|c| c.clamp(0.0, 1.0))
            .collect::<Vec<_>>();
        let confidence = if confidences.is_empty() {
            self.config.baseline_confidence
        } else {
            confidences.iter().sum::<f32>() / confidences.len() as f32
        };

        let breakdown = ScoreBreakdown {
            confidence,
            coverage: self.coverage(&text, hint),
            coherence: self.coherence(&text, hint),
        };
        let w = &self.config.weights;
        let quality = (w.confidence * breakdown.confidence
            + w.coverage * breakdown.coverage
            + w.coherence * breakdown.coherence)
            / (w.confidence + w.coverage + w.coherence);

        Some(ScoredResult {
            result,
            quality: quality.clamp(0.0, 1.0),
            breakdown,
        })
    }

    /// Dictionary coverage, or character plausibility if we don't have a
    /// lexicon for the text's language.
    fn coverage(&self, text: &str, hint: &RoutingHint) -> f32 {
        let language = hint
            .known_language()
            .or_else(|| self.lexicons.detect_language(text));
        let lexicon = language.and_then(|language| self.lexicons.get(language));
        if let Some(lexicon) = lexicon {
            let tokens = tokenize(text).collect::<Vec<_>>();
            if let Some(coverage) = lexicon.coverage(&tokens) {
                return coverage;
            }
        }
        character_plausibility(text)
    }

    /// Penalize implausibly short output and runaway repetition.
    fn coherence(&self, text: &str, hint: &RoutingHint) -> f32 {
        let chars = text.chars().collect::<Vec<_>>();
        let non_whitespace = chars.iter().filter(|c| !c.is_whitespace()).count();
        if non_whitespace == 0 {
            return 0.0;
        }

        let min_chars = hint.text_density.clamp(0.0, 1.0)
            * self.config.expected_chars_at_full_density
            * self.config.short_output_ratio;
        let length_factor = if min_chars < 1.0 {
            1.0
        } else {
            (non_whitespace as f32 / min_chars).min(1.0)
        };

        length_factor * (1.0 - repetition_ratio(&chars, self.config.min_repeats))
    }
}

/// Share of non-whitespace characters that are letters, digits or ordinary
/// punctuation. Recognizer garbage tends to be full of stray symbols.
fn character_plausibility(text: &str) -> f32 {
    let mut total = 0usize;
    let mut plausible = 0usize;
    for c in text.chars().filter(|c| !c.is_whitespace()) {
        total += 1;
        if c.is_alphanumeric() || ".,;:!?'\"()-/&%€$£§".contains(c) {
            plausible += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        plausible as f32 / total as f32
    }
}

/// Fraction of characters covered by back-to-back repeats of a short unit,
/// such as `"the the the the"` or `"aaaaaaaaaaaa"`.
fn repetition_ratio(chars: &[char], min_repeats: usize) -> f32 {
    if chars.is_empty() {
        return 0.0;
    }
    let mut covered = vec![false; chars.len()];
    for period in 1..=MAX_REPEAT_PERIOD {
        let required = if period == 1 {
            MIN_SINGLE_CHAR_REPEATS
        } else {
            min_repeats
        };
        let mut i = 0;
        while i + period <= chars.len() {
            let unit = &chars[i..i + period];
            // Runs of spaces, dashes or dots are layout, not loops.
            if !unit.iter().any(|c| c.is_alphanumeric()) {
                i += 1;
                continue;
            }
            let mut end = i + period;
            while end + period <= chars.len() && chars[end..end + period] == *unit {
                end += period;
            }
            if (end - i) / period >= required {
                covered[i..end].iter_mut().for_each(|c| *c = true);
                i = end;
            } else {
                i += 1;
            }
        }
    }
    covered.iter().filter(|c| **c).count() as f32 / chars.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engines::{
            EngineKind,
            testing::{block, full_page},
        },
        recognition::{DocumentCategory, EngineOutcome, TextBlock, UNKNOWN_LANGUAGE},
    };

    fn result(blocks: Vec<TextBlock>) -> EngineResult {
        EngineResult {
            engine: "stub".to_owned(),
            kind: EngineKind::Printed,
            rank: 0,
            cost: 1.0,
            outcome: EngineOutcome::Ok(blocks),
            elapsed_ms: 3,
        }
    }

    fn hint(language: &str, text_density: f32) -> RoutingHint {
        RoutingHint {
            category: DocumentCategory::Printed,
            confidence: 0.9,
            skew_degrees: 0.0,
            language: language.to_owned(),
            text_density,
        }
    }

    fn scorer() -> Scorer {
        Scorer::new(ScoringConfig::default(), Arc::new(Lexicons::builtin()))
    }

    const LETTER: &str = "Dear Sir, thank you for your letter of the first of May. \
        We have received your payment and will send the contract this week.";

    #[test]
    fn test_non_ok_results_are_not_scored() {
        let mut timeout = result(vec![]);
        timeout.outcome = EngineOutcome::Timeout;
        assert!(scorer().score(timeout, &hint("en", 0.1)).is_none());
    }

    #[test]
    fn test_clean_text_scores_well() {
        let scored = scorer()
            .score(result(vec![block(LETTER, full_page(), Some(0.95))]), &hint("en", 0.01))
            .unwrap();
        assert_eq!(scored.breakdown.confidence, 0.95);
        assert!(scored.breakdown.coverage > 0.8, "{:?}", scored.breakdown);
        assert_eq!(scored.breakdown.coherence, 1.0);
        assert!(scored.quality > 0.9);
    }

    #[test]
    fn test_missing_confidence_uses_baseline() {
        let scored = scorer()
            .score(result(vec![block(LETTER, full_page(), None)]), &hint("en", 0.0))
            .unwrap();
        assert_eq!(scored.breakdown.confidence, 0.5);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let blocks = vec![
            block(LETTER, full_page(), Some(0.7)),
            block("Invoice 2024-117 total due", full_page(), Some(0.4)),
        ];
        let first = scorer().score(result(blocks.clone()), &hint(UNKNOWN_LANGUAGE, 0.3));
        let second = scorer().score(result(blocks), &hint(UNKNOWN_LANGUAGE, 0.3));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.quality.to_bits(), second.quality.to_bits());
        assert_eq!(first.breakdown, second.breakdown);
    }

    #[test]
    fn test_short_output_is_penalized() {
        let short = scorer()
            .score(result(vec![block("Dear Sir", full_page(), Some(0.9))]), &hint("en", 1.0))
            .unwrap();
        // We expected at least 500 characters on a dense page.
        assert!(short.breakdown.coherence < 0.05);
    }

    #[test]
    fn test_repetition_is_penalized() {
        let looping = "the letter the letter the letter the letter the letter the letter";
        let scored = scorer()
            .score(result(vec![block(looping, full_page(), Some(0.9))]), &hint("en", 0.0))
            .unwrap();
        assert!(scored.breakdown.coherence < 0.2, "{:?}", scored.breakdown);

        let chars = "zzzzzzzzzzzzzzzz".chars().collect::<Vec<_>>();
        assert_eq!(repetition_ratio(&chars, 4), 1.0);
        let dots = "Chapter 1 .......... 3".chars().collect::<Vec<_>>();
        assert_eq!(repetition_ratio(&dots, 4), 0.0);
    }

    #[test]
    fn test_unknown_language_uses_character_plausibility() {
        assert_eq!(character_plausibility("abc, def."), 1.0);
        assert_eq!(character_plausibility("~~^^"), 0.0);
        let scored = scorer()
            .score(
                result(vec![block("xq ~~ ^^ zv", full_page(), Some(0.9))]),
                &hint(UNKNOWN_LANGUAGE, 0.0),
            )
            .unwrap();
        assert_eq!(scored.breakdown.coverage, 0.5);
    }

    #[test]
    fn test_empty_text_scores_low() {
        let scored = scorer()
            .score(result(vec![block("", full_page(), None)]), &hint("en", 0.0))
            .unwrap();
        assert_eq!(scored.breakdown.coverage, 0.0);
        assert_eq!(scored.breakdown.coherence, 0.0);
    }
}
