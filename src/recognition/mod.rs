//! Document recognition: classify pages, route them to engines, score the
//! results and keep the best text.
//!
//! Data flows strictly downward through these modules:
//!
//! 1. [`classifier`] looks at a page and produces a [`RoutingHint`].
//! 2. [`registry`] answers which engines are eligible for that hint.
//! 3. [`orchestrator`] runs engines in tiers, escalating as needed.
//! 4. [`scorer`] turns each [`EngineResult`] into a [`ScoredResult`].
//! 5. [`aggregator`] picks or merges results into an [`AggregatedResult`].
//! 6. [`postprocess`] cleans up the text.
//! 7. [`pipeline`] does all of the above for every page of a document.

use std::fmt;

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{engines::EngineKind, prelude::*};

pub mod aggregator;
pub mod classifier;
pub mod lexicon;
pub mod orchestrator;
pub mod pipeline;
pub mod postprocess;
pub mod registry;
pub mod scorer;

/// Our best guess at what kind of page we're looking at.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    /// Machine-printed text.
    Printed,
    /// Handwriting.
    Handwritten,
    /// A mix of the above, or we couldn't tell.
    Mixed,
    /// Tables and forms.
    Structured,
}

impl DocumentCategory {
    /// All categories, in a fixed order.
    pub const ALL: [DocumentCategory; 4] = [
        DocumentCategory::Printed,
        DocumentCategory::Handwritten,
        DocumentCategory::Mixed,
        DocumentCategory::Structured,
    ];

    /// The snake_case name of this category.
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentCategory::Printed => "printed",
            DocumentCategory::Handwritten => "handwritten",
            DocumentCategory::Mixed => "mixed",
            DocumentCategory::Structured => "structured",
        }
    }
}

impl fmt::Display for DocumentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Language code used when we have no idea.
pub const UNKNOWN_LANGUAGE: &str = "unknown";

/// Classifier output. Produced once per page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct RoutingHint {
    /// The category we think this page belongs to.
    pub category: DocumentCategory,

    /// How sure we are about `category`, between 0.0 and 1.0.
    pub confidence: f32,

    /// Estimated skew of the text lines, in degrees.
    pub skew_degrees: f32,

    /// Detected language code (such as "en"), or "unknown".
    pub language: String,

    /// Rough amount of text on the page, between 0.0 (blank) and 1.0 (dense).
    pub text_density: f32,
}

impl RoutingHint {
    /// The hint we use when we can't say anything useful about a page.
    pub fn ambiguous(confidence: f32) -> Self {
        Self {
            category: DocumentCategory::Mixed,
            confidence,
            skew_degrees: 0.0,
            language: UNKNOWN_LANGUAGE.to_owned(),
            text_density: 0.0,
        }
    }

    /// The detected language, if we know it.
    pub fn known_language(&self) -> Option<&str> {
        if self.language == UNKNOWN_LANGUAGE {
            None
        } else {
            Some(&self.language)
        }
    }
}

/// An axis-aligned rectangle in page pixel coordinates.
#[derive(Clone, Copy, Debug, Default, JsonSchema, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    /// Create a new box, normalizing the corner order.
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self {
            x0: x0.min(x1),
            y0: y0.min(y1),
            x1: x0.max(x1),
            y1: y0.max(y1),
        }
    }

    /// A box covering an entire page.
    pub fn full_page(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Area shared with `other`.
    pub fn intersection_area(&self, other: &BoundingBox) -> f32 {
        let w = self.x1.min(other.x1) - self.x0.max(other.x0);
        let h = self.y1.min(other.y1) - self.y0.max(other.y0);
        if w <= 0.0 || h <= 0.0 { 0.0 } else { w * h }
    }

    /// The smallest box containing both boxes.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }

    /// The smallest box containing all of `boxes`, if there are any.
    pub fn covering(boxes: impl IntoIterator<Item = BoundingBox>) -> Option<BoundingBox> {
        boxes.into_iter().reduce(|acc, b| acc.union(&b))
    }
}

/// A run of text with its location on the page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct TextBlock {
    /// The recognized text.
    pub text: String,

    /// Where the text is on the page.
    pub region: BoundingBox,

    /// The engine's own confidence for this block, between 0.0 and 1.0, if
    /// the engine reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// What happened when we ran an engine on a page.
///
/// Only `Ok` carries text blocks, so a result can never have text and a
/// failure at the same time.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineOutcome {
    /// The engine produced text (possibly empty).
    Ok(Vec<TextBlock>),
    /// The engine ran out of time and was cancelled.
    Timeout,
    /// The engine failed.
    Error(String),
    /// The engine declined the page.
    Unsupported(String),
}

impl EngineOutcome {
    /// The tag for this outcome.
    pub fn tag(&self) -> OutcomeTag {
        match self {
            EngineOutcome::Ok(_) => OutcomeTag::Ok,
            EngineOutcome::Timeout => OutcomeTag::Timeout,
            EngineOutcome::Error(_) => OutcomeTag::Error,
            EngineOutcome::Unsupported(_) => OutcomeTag::Unsupported,
        }
    }

    /// The text blocks, if the engine succeeded.
    pub fn blocks(&self) -> Option<&[TextBlock]> {
        match self {
            EngineOutcome::Ok(blocks) => Some(blocks),
            _ => None,
        }
    }
}

/// A fieldless summary of an [`EngineOutcome`].
#[derive(Clone, Copy, Debug, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeTag {
    Ok,
    Timeout,
    Error,
    Unsupported,
}

/// Output of one adapter invocation.
#[derive(Clone, Debug)]
pub struct EngineResult {
    /// The name of the engine.
    pub engine: String,

    /// What kind of recognizer produced this.
    pub kind: EngineKind,

    /// The position of the engine in the registry's eligible order.
    pub rank: usize,

    /// The engine's relative cost weight.
    pub cost: f32,

    /// What happened.
    pub outcome: EngineOutcome,

    /// How long the invocation took, in milliseconds.
    pub elapsed_ms: u64,
}

/// The parts of a quality score, kept for diagnostics.
#[derive(Clone, Copy, Debug, Default, JsonSchema, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Averaged engine confidence.
    pub confidence: f32,
    /// Fraction of words found in the lexicon (or plausible characters).
    pub coverage: f32,
    /// Structural sanity: not too short, no pathological repetition.
    pub coherence: f32,
}

/// An [`EngineResult`] with `outcome == Ok`, plus a quality score.
#[derive(Clone, Debug)]
pub struct ScoredResult {
    /// The engine result. Always has text blocks.
    pub result: EngineResult,

    /// Normalized quality, between 0.0 and 1.0.
    pub quality: f32,

    /// How we got `quality`.
    pub breakdown: ScoreBreakdown,
}

impl ScoredResult {
    /// The text blocks of the underlying result.
    pub fn blocks(&self) -> &[TextBlock] {
        self.result.outcome.blocks().unwrap_or_default()
    }

    /// The text of the underlying result.
    pub fn text(&self) -> String {
        join_blocks(self.blocks())
    }
}

/// Join the text of `blocks`, one block per line, skipping empty blocks.
pub fn join_blocks<'a>(blocks: impl IntoIterator<Item = &'a TextBlock>) -> String {
    let mut text = String::new();
    for block in blocks {
        if block.text.is_empty() {
            continue;
        }
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&block.text);
    }
    text
}

/// How the aggregator produced a page's text.
#[derive(Clone, Copy, Debug, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// Only one result was available.
    Single,
    /// Several results overlapped, and we picked the best one.
    Select,
    /// Several results covered different regions, and we combined them.
    Merge,
}

/// A text block in the final output, and the engine it came from.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct ProvenancedBlock {
    /// The engine which produced this block.
    pub engine: String,

    /// The block itself.
    #[serde(flatten)]
    pub block: TextBlock,
}

/// A record of one engine invocation, for diagnostics.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct EngineAttempt {
    /// The engine we ran.
    pub engine: String,

    /// What happened.
    pub outcome: OutcomeTag,

    /// How long it took.
    pub elapsed_ms: u64,

    /// The quality score, if the engine produced text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f32>,

    /// The scoring breakdown, if the engine produced text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ScoreBreakdown>,

    /// Error or refusal details, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The final text for one page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Serialize)]
pub struct AggregatedResult {
    /// Index of the page within the document.
    pub page_index: usize,

    /// The chosen or merged text.
    pub text: String,

    /// Quality of the chosen or merged text.
    pub quality: f32,

    /// How we arrived at `text`.
    pub strategy: AggregationStrategy,

    /// The engines which contributed text, in registry order.
    pub engines: Vec<String>,

    /// The retained text blocks, with provenance.
    pub blocks: Vec<ProvenancedBlock>,

    /// The routing hint used for this page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<RoutingHint>,

    /// Every engine invocation made for this page.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<EngineAttempt>,
}

/// Overall status of a document.
#[derive(Clone, Copy, Debug, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every page was recognized.
    Complete,
    /// Some pages failed, but at least one succeeded.
    Partial,
    /// No page succeeded.
    Failed,
}

/// The result of running the pipeline on a document.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct PipelineOutcome {
    /// Overall status.
    pub status: PipelineStatus,

    /// Successfully recognized pages, in page order.
    pub pages: Vec<AggregatedResult>,

    /// Indices of pages which could not be recognized, in ascending order.
    pub failed_pages: Vec<usize>,

    /// The text of the whole document, if any page succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Non-fatal errors collected while processing.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl PipelineOutcome {
    /// A document we couldn't process at all, such as one whose pages could
    /// not be loaded.
    pub fn failure(error: String) -> Self {
        Self {
            status: PipelineStatus::Failed,
            pages: vec![],
            failed_pages: vec![],
            text: None,
            errors: vec![error],
        }
    }
}
