//! Scriptable adapters for tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    errors::RecognitionError,
    page::Page,
    prelude::*,
    recognition::{BoundingBox, DocumentCategory, TextBlock},
};

use super::{EngineAdapter, EngineCapability, EngineKind, Fitness};

/// Tracks how many stub invocations are running at once, and the most we've
/// ever seen.
#[derive(Debug, Default)]
pub struct ActivityGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ActivityGauge {
    /// The highest number of simultaneous invocations observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// The number of invocations running right now.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard {
            gauge: self.clone(),
        }
    }
}

/// Decrements the gauge on every exit path, including cancellation.
struct GaugeGuard {
    gauge: Arc<ActivityGauge>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a stub does once its delay has passed.
#[derive(Clone, Debug)]
enum Behavior {
    Blocks(Vec<TextBlock>),
    Fail(String),
    Decline(String),
    Panic,
}

/// An adapter whose behavior is scripted by the test.
pub struct StubAdapter {
    name: String,
    kind: EngineKind,
    capability: EngineCapability,
    delay: Duration,
    behavior: Behavior,
    gauge: Option<Arc<ActivityGauge>>,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl StubAdapter {
    /// A stub which immediately returns a single full-page block of `text`
    /// with confidence 1.0.
    pub fn new(name: &str, text: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: EngineKind::Printed,
            capability: EngineCapability {
                fitness: Fitness::uniform(0.5),
                cost: 1.0,
                max_page_pixels: None,
                requires_image: false,
            },
            delay: Duration::ZERO,
            behavior: Behavior::Blocks(vec![block(text, full_page(), Some(1.0))]),
            gauge: None,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    /// Return these blocks instead.
    pub fn with_blocks(mut self, blocks: Vec<TextBlock>) -> Self {
        self.behavior = Behavior::Blocks(blocks);
        self
    }

    /// Return an engine fault.
    pub fn failing(mut self, message: &str) -> Self {
        self.behavior = Behavior::Fail(message.to_owned());
        self
    }

    /// Decline every page.
    pub fn declining(mut self, reason: &str) -> Self {
        self.behavior = Behavior::Decline(reason.to_owned());
        self
    }

    /// Panic inside `recognize`.
    pub fn panicking(mut self) -> Self {
        self.behavior = Behavior::Panic;
        self
    }

    /// Wait this long before responding.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the fitness for every category.
    pub fn with_fitness(mut self, fitness: f32) -> Self {
        self.capability.fitness = Fitness::uniform(fitness);
        self
    }

    /// Set the fitness for one category.
    pub fn with_category_fitness(mut self, category: DocumentCategory, fitness: f32) -> Self {
        match category {
            DocumentCategory::Printed => self.capability.fitness.printed = fitness,
            DocumentCategory::Handwritten => self.capability.fitness.handwritten = fitness,
            DocumentCategory::Mixed => self.capability.fitness.mixed = fitness,
            DocumentCategory::Structured => self.capability.fitness.structured = fitness,
        }
        self
    }

    /// Set the cost weight.
    pub fn with_cost(mut self, cost: f32) -> Self {
        self.capability.cost = cost;
        self
    }

    /// Require pixel data.
    pub fn requiring_image(mut self) -> Self {
        self.capability.requires_image = true;
        self
    }

    /// Report activity to `gauge`.
    pub fn with_gauge(mut self, gauge: Arc<ActivityGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// How many times `recognize` was entered.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// How many invocations ran to completion without being cancelled.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineAdapter for StubAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn capability(&self) -> &EngineCapability {
        &self.capability
    }

    async fn recognize(&self, _page: Arc<Page>, _deadline: Instant) -> Result<Vec<TextBlock>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _guard = self.gauge.as_ref().map(|gauge| gauge.enter());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Blocks(blocks) => Ok(blocks.clone()),
            Behavior::Fail(message) => Err(anyhow!("{message}")),
            Behavior::Decline(reason) => Err(RecognitionError::UnsupportedPage {
                engine: self.name.clone(),
                reason: reason.clone(),
            }
            .into()),
            Behavior::Panic => panic!("{} exploded", self.name),
        }
    }
}

/// A box covering a 1000x1000 test page.
pub fn full_page() -> BoundingBox {
    BoundingBox::full_page(1000, 1000)
}

/// Shorthand for building a [`TextBlock`].
pub fn block(text: &str, region: BoundingBox, confidence: Option<f32>) -> TextBlock {
    TextBlock {
        text: text.to_owned(),
        region,
        confidence,
    }
}

/// A text-only page.
pub fn text_page(index: usize, text: &str) -> Page {
    Page::new(index, None, Some(text.to_owned()))
}
