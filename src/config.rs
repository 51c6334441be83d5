//! Pipeline configuration.
//!
//! We build one [`PipelineConfig`] at startup (from a TOML or JSON file plus
//! command-line overrides), validate it, and pass it by reference into the
//! pipeline. Nothing else in the crate reads global settings.

use std::{collections::BTreeMap, time::Duration};

use schemars::JsonSchema;

use crate::{
    engines::{EngineConfig, default_engine_configs},
    errors::RecognitionError,
    prelude::*,
    recognition::lexicon::LexiconConfig,
};

/// The longest time budget we allow for one adapter invocation.
pub const MAX_TIER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Top-level pipeline configuration.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Stop a tier as soon as one result reaches this quality.
    pub early_accept_threshold: f32,

    /// Time budget for each adapter invocation, in seconds.
    pub tier_timeout_secs: f64,

    /// Maximum adapter invocations running at once, across all pages and
    /// documents.
    pub max_concurrency: usize,

    /// Number of adapters dispatched together in each tier.
    pub tier_size: usize,

    /// Separate pages in the document text with form feeds.
    pub include_page_breaks: bool,

    /// Quality scoring settings.
    pub scoring: ScoringConfig,

    /// Result aggregation settings.
    pub aggregation: AggregationConfig,

    /// Text clean-up settings.
    pub post_processing: PostProcessingConfig,

    /// Extra word lists, keyed by language code.
    pub lexicons: BTreeMap<String, LexiconConfig>,

    /// Engines to register, in registration order.
    pub engines: Vec<EngineConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            early_accept_threshold: 0.9,
            tier_timeout_secs: 60.0,
            max_concurrency: num_cpus::get(),
            tier_size: 2,
            include_page_breaks: false,
            scoring: ScoringConfig::default(),
            aggregation: AggregationConfig::default(),
            post_processing: PostProcessingConfig::default(),
            lexicons: BTreeMap::new(),
            engines: default_engine_configs(),
        }
    }
}

impl PipelineConfig {
    /// The per-adapter time budget.
    pub fn tier_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.tier_timeout_secs)
            .unwrap_or(MAX_TIER_TIMEOUT)
            .min(MAX_TIER_TIMEOUT)
    }

    /// Check that all values are in range.
    pub fn validate(&self) -> Result<(), RecognitionError> {
        let invalid = |msg: String| Err(RecognitionError::InvalidConfig(msg));
        if !(0.0..=1.0).contains(&self.early_accept_threshold) {
            return invalid(format!(
                "early_accept_threshold must be between 0 and 1, got {}",
                self.early_accept_threshold
            ));
        }
        let in_range = Duration::try_from_secs_f64(self.tier_timeout_secs)
            .is_ok_and(|timeout| !timeout.is_zero() && timeout <= MAX_TIER_TIMEOUT);
        if !in_range {
            return invalid(format!(
                "tier_timeout_secs must be positive and at most {}, got {}",
                MAX_TIER_TIMEOUT.as_secs(),
                self.tier_timeout_secs
            ));
        }
        if self.max_concurrency == 0 {
            return invalid("max_concurrency must be at least 1".to_owned());
        }
        if self.tier_size == 0 {
            return invalid("tier_size must be at least 1".to_owned());
        }
        if self.engines.is_empty() {
            return invalid("at least one engine must be configured".to_owned());
        }
        self.scoring.validate()?;
        if !(0.0..=1.0).contains(&self.aggregation.overlap_threshold) {
            return invalid(format!(
                "aggregation.overlap_threshold must be between 0 and 1, got {}",
                self.aggregation.overlap_threshold
            ));
        }
        if self.aggregation.line_tolerance < 0.0 {
            return invalid("aggregation.line_tolerance must not be negative".to_owned());
        }
        Ok(())
    }
}

/// Relative weights of the three quality components.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringWeights {
    pub confidence: f32,
    pub coverage: f32,
    pub coherence: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            confidence: 1.0 / 3.0,
            coverage: 1.0 / 3.0,
            coherence: 1.0 / 3.0,
        }
    }
}

impl ScoringWeights {
    fn sum(&self) -> f32 {
        self.confidence + self.coverage + self.coherence
    }
}

/// Settings for the confidence scorer.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    /// Component weights. These are normalized by their sum.
    pub weights: ScoringWeights,

    /// Confidence assumed for engines which don't report any.
    pub baseline_confidence: f32,

    /// How many characters we expect on a page with a text density of 1.0.
    pub expected_chars_at_full_density: f32,

    /// Output shorter than this fraction of the expected length is penalized.
    pub short_output_ratio: f32,

    /// How many back-to-back copies of a short substring count as a loop.
    pub min_repeats: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            baseline_confidence: 0.5,
            expected_chars_at_full_density: 2500.0,
            short_output_ratio: 0.2,
            min_repeats: 4,
        }
    }
}

impl ScoringConfig {
    fn validate(&self) -> Result<(), RecognitionError> {
        let w = &self.weights;
        if [w.confidence, w.coverage, w.coherence]
            .iter()
            .any(|weight| !weight.is_finite() || *weight < 0.0)
            || w.sum() <= 0.0
        {
            return Err(RecognitionError::InvalidConfig(
                "scoring weights must be non-negative with a positive sum".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.baseline_confidence) {
            return Err(RecognitionError::InvalidConfig(
                "scoring.baseline_confidence must be between 0 and 1".to_owned(),
            ));
        }
        if self.expected_chars_at_full_density <= 0.0 || self.short_output_ratio < 0.0 {
            return Err(RecognitionError::InvalidConfig(
                "scoring length expectations must be positive".to_owned(),
            ));
        }
        if self.min_repeats < 2 {
            return Err(RecognitionError::InvalidConfig(
                "scoring.min_repeats must be at least 2".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Settings for the result aggregator.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AggregationConfig {
    /// Results whose regions overlap by at most this fraction are merged.
    pub overlap_threshold: f32,

    /// Blocks whose tops are within this many pixels are on the same line.
    pub line_tolerance: f32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            overlap_threshold: 0.1,
            line_tolerance: 10.0,
        }
    }
}

/// Which post-processing passes to run.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PostProcessingConfig {
    pub normalize_whitespace: bool,
    pub join_hyphenated_lines: bool,
    pub correct_confusions: bool,
}

impl Default for PostProcessingConfig {
    fn default() -> Self {
        Self {
            normalize_whitespace: true,
            join_hyphenated_lines: true,
            correct_confusions: false,
        }
    }
}
