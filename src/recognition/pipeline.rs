//! Run the full recognition pipeline over a document.

use std::sync::Arc;

use futures::{StreamExt as _, stream};

use crate::{
    config::PipelineConfig,
    engines::{EngineAdapter, build_adapters},
    page::Page,
    prelude::*,
    worker_pool::WorkerPool,
};

use super::{
    PipelineOutcome, PipelineStatus, RoutingHint,
    aggregator::Aggregator,
    classifier::Classifier,
    lexicon::Lexicons,
    orchestrator::{Orchestrator, PageDisposition},
    postprocess::PostProcessor,
    registry::EngineRegistry,
    scorer::Scorer,
};

/// Placeholder text for pages we could not recognize.
pub const COULD_NOT_OCR_PAGE: &str = "**COULD_NOT_OCR_PAGE**";

/// Confidence of the hint we use if the classifier crashes.
const FALLBACK_HINT_CONFIDENCE: f32 = 0.0;

/// Classify, recognize, aggregate and clean up every page of a document.
///
/// A single pipeline can process many documents at once. All of them share
/// one worker pool.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    registry: Arc<EngineRegistry>,
    classifier: Classifier,
    orchestrator: Orchestrator,
    post_processor: PostProcessor,
}

impl Pipeline {
    /// Build a pipeline, including every configured engine.
    #[instrument(level = "debug", skip_all)]
    pub async fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let lexicons = Lexicons::load(&config.lexicons).await?;
        let adapters = build_adapters(&config.engines).await?;
        Self::from_parts(config, adapters, Arc::new(lexicons))
    }

    /// Build a pipeline from already-constructed adapters.
    pub fn from_parts(
        config: PipelineConfig,
        adapters: Vec<Arc<dyn EngineAdapter>>,
        lexicons: Arc<Lexicons>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(EngineRegistry::new(adapters)?);
        let pool = WorkerPool::new(config.max_concurrency);
        let orchestrator = Orchestrator::new(
            registry.clone(),
            Scorer::new(config.scoring.clone(), lexicons.clone()),
            Aggregator::new(config.aggregation.clone()),
            pool,
            &config,
        );
        Ok(Self {
            classifier: Classifier::new(
                lexicons.clone(),
                config.scoring.expected_chars_at_full_density,
            ),
            post_processor: PostProcessor::from_config(&config.post_processing, lexicons),
            orchestrator,
            registry,
            config: Arc::new(config),
        })
    }

    /// Our configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Our engines.
    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Classify a page without recognizing it.
    pub async fn classify(&self, page: Arc<Page>) -> RoutingHint {
        let classifier = self.classifier.clone();
        let index = page.index;
        match tokio::task::spawn_blocking(move || classifier.classify(&page)).await {
            Ok(hint) => hint,
            Err(err) => {
                warn!(page = index, %err, "Classifier crashed, routing page as mixed");
                RoutingHint::ambiguous(FALLBACK_HINT_CONFIDENCE)
            }
        }
    }

    /// Recognize every page of a document.
    ///
    /// Never fails: per-page problems are reported in the outcome.
    #[instrument(level = "debug", skip_all, fields(pages = pages.len()))]
    pub async fn run_document(&self, pages: Vec<Page>) -> PipelineOutcome {
        if pages.is_empty() {
            return PipelineOutcome::failure("document has no pages".to_owned());
        }
        let dispositions = stream::iter(pages.into_iter().map(Arc::new))
            .map(|page| self.run_page(page))
            .buffered(self.config.max_concurrency)
            .collect::<Vec<_>>()
            .await;
        self.assemble(dispositions)
    }

    /// Recognize and clean up a single page.
    async fn run_page(&self, page: Arc<Page>) -> (usize, PageDisposition) {
        let index = page.index;
        let hint = self.classify(page.clone()).await;
        let disposition = match self.orchestrator.run_page(page, hint).await {
            PageDisposition::Recognized(mut result) => {
                let language = result
                    .hint
                    .as_ref()
                    .and_then(|hint| hint.known_language())
                    .map(str::to_owned);
                let text = std::mem::take(&mut result.text);
                result.text = self.post_processor.process(text, language.as_deref());
                PageDisposition::Recognized(result)
            }
            failed => failed,
        };
        (index, disposition)
    }

    /// Combine page results into a document outcome. `dispositions` must be
    /// in page order.
    fn assemble(&self, dispositions: Vec<(usize, PageDisposition)>) -> PipelineOutcome {
        let mut pages = vec![];
        let mut failed_pages = vec![];
        let mut errors = vec![];
        let mut texts = vec![];
        for (index, disposition) in dispositions {
            match disposition {
                PageDisposition::Recognized(result) => {
                    texts.push(result.text.clone());
                    pages.push(result);
                }
                PageDisposition::Failed { reason, .. } => {
                    texts.push(COULD_NOT_OCR_PAGE.to_owned());
                    failed_pages.push(index);
                    errors.push(reason);
                }
            }
        }

        let status = if failed_pages.is_empty() {
            PipelineStatus::Complete
        } else if pages.is_empty() {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Partial
        };
        let separator = if self.config.include_page_breaks {
            "\n\x0C\n"
        } else {
            "\n\n"
        };
        debug!(?status, ok = pages.len(), failed = failed_pages.len(), "Assembled document");

        PipelineOutcome {
            status,
            text: (!pages.is_empty()).then(|| texts.join(separator)),
            pages,
            failed_pages,
            errors,
        }
    }
}
