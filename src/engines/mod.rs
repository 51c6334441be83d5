//! Engine adapters: one uniform interface over each concrete recognizer.
//!
//! Adapters are described by `[[engines]]` entries in the configuration file,
//! built once at startup, and handed to the
//! [`EngineRegistry`](crate::recognition::registry::EngineRegistry).

use std::{collections::HashSet, sync::Arc};

use schemars::JsonSchema;
use tokio::time::Instant;

use crate::{
    page::Page,
    prelude::*,
    recognition::{DocumentCategory, TextBlock},
};

pub mod embedded_text;
pub mod llm;
pub mod tesseract;
#[cfg(test)]
pub mod testing;
pub mod textract;

/// The broad family of recognizer an adapter wraps.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// A general-purpose printed-text recognizer.
    Printed,
    /// A recognizer which can read handwriting.
    Handwritten,
    /// A recognizer specialized for tables and forms.
    Structured,
}

/// How well an engine handles each [`DocumentCategory`]. Zero means "never
/// route this category to this engine".
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Fitness {
    pub printed: f32,
    pub handwritten: f32,
    pub mixed: f32,
    pub structured: f32,
}

impl Fitness {
    /// The same fitness for every category.
    pub const fn uniform(value: f32) -> Self {
        Self {
            printed: value,
            handwritten: value,
            mixed: value,
            structured: value,
        }
    }

    /// Fitness for a single category.
    pub fn for_category(&self, category: DocumentCategory) -> f32 {
        match category {
            DocumentCategory::Printed => self.printed,
            DocumentCategory::Handwritten => self.handwritten,
            DocumentCategory::Mixed => self.mixed,
            DocumentCategory::Structured => self.structured,
        }
    }

    /// Apply any overrides from the configuration file.
    fn with_overrides(mut self, overrides: &FitnessOverrides) -> Self {
        let FitnessOverrides {
            printed,
            handwritten,
            mixed,
            structured,
        } = overrides;
        self.printed = printed.unwrap_or(self.printed);
        self.handwritten = handwritten.unwrap_or(self.handwritten);
        self.mixed = mixed.unwrap_or(self.mixed);
        self.structured = structured.unwrap_or(self.structured);
        self
    }
}

/// Static description of what an adapter can do.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineCapability {
    /// Expected fitness per category.
    pub fitness: Fitness,

    /// Relative cost weight. Cheaper engines run first when fitness ties.
    pub cost: f32,

    /// The largest page (in pixels) this engine accepts.
    pub max_page_pixels: Option<u64>,

    /// Does this engine need pixel data?
    pub requires_image: bool,
}

impl EngineCapability {
    /// Build a capability from per-kind defaults and configured overrides.
    pub fn from_settings(
        settings: &CommonEngineSettings,
        default_cost: f32,
        default_fitness: Fitness,
        requires_image: bool,
    ) -> Self {
        Self {
            fitness: default_fitness.with_overrides(&settings.fitness),
            cost: settings.cost.unwrap_or(default_cost),
            max_page_pixels: settings.max_page_pixels,
            requires_image,
        }
    }

    /// Can this engine be routed pages of `category` at all?
    pub fn supports(&self, category: DocumentCategory) -> bool {
        self.fitness.for_category(category) > 0.0
    }

    /// Check whether this engine can accept `page`, returning a reason if
    /// not. We check this before claiming a worker slot.
    pub fn check_page(&self, page: &Page) -> Result<(), String> {
        if self.requires_image && page.image.is_none() {
            return Err("page has no image data".to_owned());
        }
        if let Some(max) = self.max_page_pixels
            && page.pixel_count() > max
        {
            let (w, h) = page.dimensions();
            return Err(format!("page is {w}x{h}, larger than {max} pixels"));
        }
        Ok(())
    }
}

/// Interface to a recognition engine.
///
/// Implementations must be cancel-safe: the orchestrator drops the
/// `recognize` future when the deadline passes or another engine's result is
/// accepted, and nothing observable may happen after that.
#[async_trait]
pub trait EngineAdapter: Send + Sync + 'static {
    /// A unique name for this adapter, used in logs and provenance.
    fn name(&self) -> &str;

    /// What kind of recognizer this is.
    fn kind(&self) -> EngineKind;

    /// What this adapter can handle.
    fn capability(&self) -> &EngineCapability;

    /// Recognize the text on a page.
    ///
    /// Returns [`RecognitionError::UnsupportedPage`](crate::errors::RecognitionError::UnsupportedPage)
    /// (wrapped in [`anyhow::Error`]) to decline a page. Any other error is
    /// treated as an engine fault.
    async fn recognize(&self, page: Arc<Page>, deadline: Instant) -> Result<Vec<TextBlock>>;
}

/// Optional per-category fitness overrides.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FitnessOverrides {
    #[serde(default)]
    pub printed: Option<f32>,
    #[serde(default)]
    pub handwritten: Option<f32>,
    #[serde(default)]
    pub mixed: Option<f32>,
    #[serde(default)]
    pub structured: Option<f32>,
}

/// Settings shared by every `[[engines]]` entry.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema)]
pub struct CommonEngineSettings {
    /// Name for this engine. Defaults to the engine type. Must be unique.
    #[serde(default)]
    pub name: Option<String>,

    /// Relative cost weight.
    #[serde(default)]
    pub cost: Option<f32>,

    /// Fitness overrides. Set a category to 0 to never use this engine for it.
    #[serde(default)]
    pub fitness: FitnessOverrides,

    /// Skip pages larger than this many pixels.
    #[serde(default)]
    pub max_page_pixels: Option<u64>,
}

impl CommonEngineSettings {
    /// Our configured name, or a default.
    pub fn name_or(&self, default: &str) -> String {
        self.name.clone().unwrap_or_else(|| default.to_owned())
    }
}

/// One `[[engines]]` entry in the configuration file.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineConfig {
    /// Use text already embedded in the source file.
    EmbeddedText(embedded_text::EmbeddedTextSettings),
    /// Run the `tesseract` command-line tool.
    Tesseract(tesseract::TesseractSettings),
    /// Ask a vision-capable LLM to transcribe the page.
    VisionLlm(llm::VisionLlmSettings),
    /// Call AWS Textract.
    Textract(textract::TextractSettings),
}

impl EngineConfig {
    /// Build the adapter described by this entry.
    pub async fn build(&self) -> Result<Arc<dyn EngineAdapter>> {
        Ok(match self {
            EngineConfig::EmbeddedText(settings) => {
                Arc::new(embedded_text::EmbeddedTextAdapter::new(settings))
            }
            EngineConfig::Tesseract(settings) => {
                Arc::new(tesseract::TesseractAdapter::new(settings))
            }
            EngineConfig::VisionLlm(settings) => {
                Arc::new(llm::VisionLlmAdapter::new(settings)?)
            }
            EngineConfig::Textract(settings) => {
                Arc::new(textract::TextractAdapter::new(settings).await?)
            }
        })
    }
}

/// The engines we use when the configuration doesn't list any.
pub fn default_engine_configs() -> Vec<EngineConfig> {
    vec![
        EngineConfig::EmbeddedText(Default::default()),
        EngineConfig::Tesseract(Default::default()),
    ]
}

/// Build all configured adapters, in configuration order.
#[instrument(level = "debug", skip_all)]
pub async fn build_adapters(configs: &[EngineConfig]) -> Result<Vec<Arc<dyn EngineAdapter>>> {
    let mut names = HashSet::new();
    let mut adapters = Vec::with_capacity(configs.len());
    for config in configs {
        let adapter = config.build().await?;
        if !names.insert(adapter.name().to_owned()) {
            return Err(anyhow!(
                "engine name {:?} is used more than once; set a unique `name`",
                adapter.name()
            ));
        }
        debug!(engine = adapter.name(), kind = ?adapter.kind(), "Built engine");
        adapters.push(adapter);
    }
    Ok(adapters)
}
