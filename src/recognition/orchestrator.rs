//! Run engines on a page in tiers, escalating until we get good enough text.
//!
//! For each page we walk through these states:
//!
//! - **Routed**: ask the registry for the eligible engines, best first.
//! - **Dispatched**: run the next tier of engines in parallel, each with its
//!   own deadline, and each holding a worker slot.
//! - **Satisfied**: some result reached the early-accept threshold. We cancel
//!   the rest of the tier and keep that result.
//! - **Escalated**: the tier finished without a good enough result, so we
//!   dispatch the next tier.
//! - **Exhausted**: there are no more tiers. We aggregate whatever text we
//!   have, or mark the page as failed.

use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt as _;
use tokio::{
    task::{self, JoinError, JoinSet},
    time::{Instant, timeout_at},
};

use crate::{
    config::PipelineConfig, errors::RecognitionError, page::Page, prelude::*,
    worker_pool::WorkerPool,
};

use super::{
    AggregatedResult, EngineAttempt, EngineOutcome, EngineResult, RoutingHint, ScoredResult,
    TextBlock,
    aggregator::{Aggregator, compare_for_selection},
    registry::{EngineRegistry, RankedAdapter},
    scorer::Scorer,
};

/// What happened to a page.
#[derive(Clone, Debug)]
pub enum PageDisposition {
    /// We have text for the page.
    Recognized(AggregatedResult),

    /// No engine produced any text.
    Failed {
        /// Every engine invocation we made.
        attempts: Vec<EngineAttempt>,
        /// A human-readable summary of what went wrong.
        reason: String,
    },
}

/// Attempts tagged with registry rank, so we can report them in a stable
/// order.
type RankedAttempts = Vec<(usize, EngineAttempt)>;

/// The adapter each running task belongs to.
type TaskEngines = HashMap<task::Id, RankedAdapter>;

/// Schedules engine invocations for individual pages.
pub struct Orchestrator {
    registry: Arc<EngineRegistry>,
    scorer: Scorer,
    aggregator: Aggregator,
    pool: WorkerPool,
    early_accept_threshold: f32,
    tier_timeout: Duration,
    tier_size: usize,
}

impl Orchestrator {
    /// Create a new orchestrator. All pages share `pool`.
    pub fn new(
        registry: Arc<EngineRegistry>,
        scorer: Scorer,
        aggregator: Aggregator,
        pool: WorkerPool,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            registry,
            scorer,
            aggregator,
            pool,
            early_accept_threshold: config.early_accept_threshold,
            tier_timeout: config.tier_timeout(),
            tier_size: config.tier_size.max(1),
        }
    }

    /// Recognize a single page.
    #[instrument(level = "debug", skip_all, fields(page = page.index, category = %hint.category))]
    pub async fn run_page(&self, page: Arc<Page>, hint: RoutingHint) -> PageDisposition {
        let eligible = self.registry.eligible(&hint);
        debug!(
            engines = ?eligible.iter().map(|r| r.adapter.name()).collect::<Vec<_>>(),
            "Routed"
        );

        let mut attempts = RankedAttempts::new();
        let mut scored: Vec<ScoredResult> = vec![];
        for (tier_index, tier) in eligible.chunks(self.tier_size).enumerate() {
            if tier_index > 0 {
                info!(
                    tier = tier_index,
                    best = scored.iter().map(|s| s.quality).fold(0.0f32, f32::max),
                    "Escalated"
                );
            }
            if let Some(accepted) = self
                .run_tier(&page, &hint, tier, &mut attempts, &mut scored)
                .await
            {
                debug!(
                    engine = %accepted.result.engine,
                    quality = accepted.quality,
                    "Satisfied"
                );
                return self.finish(page.index, vec![accepted], hint, attempts);
            }
        }

        debug!(results = scored.len(), "Exhausted");
        if scored.is_empty() {
            let attempts = sorted_attempts(attempts);
            let details = attempts
                .iter()
                .map(|a| {
                    a.detail
                        .clone()
                        .unwrap_or_else(|| format!("{}: {:?}", a.engine, a.outcome))
                })
                .collect::<Vec<_>>();
            let reason = format!(
                "no engine could recognize page {} ({})",
                page.index,
                details.join("; ")
            );
            warn!(%reason, "Page failed");
            return PageDisposition::Failed { attempts, reason };
        }
        self.finish(page.index, scored, hint, attempts)
    }

    /// Run one tier. Returns the accepted result if one reached the
    /// threshold. Otherwise, all scored results are added to `scored`.
    async fn run_tier(
        &self,
        page: &Arc<Page>,
        hint: &RoutingHint,
        tier: &[RankedAdapter],
        attempts: &mut RankedAttempts,
        scored: &mut Vec<ScoredResult>,
    ) -> Option<ScoredResult> {
        let mut tasks = JoinSet::new();
        let mut engines = TaskEngines::new();
        for ranked in tier {
            if let Err(reason) = ranked.adapter.capability().check_page(page) {
                debug!(engine = ranked.adapter.name(), %reason, "Skipping engine");
                let result = unfinished_result(ranked, EngineOutcome::Unsupported(reason));
                self.record(hint, result, attempts);
                continue;
            }
            let handle = tasks.spawn(invoke(
                ranked.clone(),
                page.clone(),
                self.pool.clone(),
                self.tier_timeout,
            ));
            engines.insert(handle.id(), ranked.clone());
        }
        debug!(engines = tasks.len(), "Dispatched");

        let mut accepted = vec![];
        while let Some(joined) = tasks.join_next().await {
            self.collect(hint, &engines, joined, attempts, scored, &mut accepted);
            if !accepted.is_empty() {
                // Anything else which has already finished gets a fair
                // chance, so the choice doesn't depend on arrival order.
                while let Some(joined) = tasks.try_join_next() {
                    self.collect(hint, &engines, joined, attempts, scored, &mut accepted);
                }
                let cancelled = tasks.len();
                tasks.shutdown().await;
                if cancelled > 0 {
                    debug!(cancelled, "Cancelled remaining engines");
                }
                return accepted.into_iter().max_by(compare_for_selection);
            }
        }
        None
    }

    /// Record a finished task, and sort any text into `accepted` or `scored`.
    fn collect(
        &self,
        hint: &RoutingHint,
        engines: &TaskEngines,
        joined: Result<EngineResult, JoinError>,
        attempts: &mut RankedAttempts,
        scored: &mut Vec<ScoredResult>,
        accepted: &mut Vec<ScoredResult>,
    ) {
        let result = match joined {
            Ok(result) => result,
            Err(err) => {
                let Some(ranked) = engines.get(&err.id()) else {
                    error!(%err, "Unknown engine task failed");
                    return;
                };
                let message = if err.is_panic() {
                    format!("panicked: {}", panic_message(err.into_panic().as_ref()))
                } else {
                    err.to_string()
                };
                warn!(engine = ranked.adapter.name(), %message, "Engine task failed");
                unfinished_result(ranked, EngineOutcome::Error(message))
            }
        };
        if let Some(result) = self.record(hint, result, attempts) {
            if result.quality >= self.early_accept_threshold {
                accepted.push(result);
            } else {
                scored.push(result);
            }
        }
    }

    /// Score a result, and note the attempt.
    fn record(
        &self,
        hint: &RoutingHint,
        result: EngineResult,
        attempts: &mut RankedAttempts,
    ) -> Option<ScoredResult> {
        let rank = result.rank;
        let mut attempt = EngineAttempt {
            engine: result.engine.clone(),
            outcome: result.outcome.tag(),
            elapsed_ms: result.elapsed_ms,
            quality: None,
            breakdown: None,
            detail: self.outcome_detail(&result),
        };
        let scored = self.scorer.score(result, hint);
        if let Some(scored) = &scored {
            debug!(
                engine = %attempt.engine,
                quality = scored.quality,
                breakdown = ?scored.breakdown,
                "Scored result"
            );
            attempt.quality = Some(scored.quality);
            attempt.breakdown = Some(scored.breakdown);
        }
        attempts.push((rank, attempt));
        scored
    }

    /// Describe a non-`ok` outcome.
    fn outcome_detail(&self, result: &EngineResult) -> Option<String> {
        let engine = result.engine.clone();
        let err = match &result.outcome {
            EngineOutcome::Ok(_) => return None,
            EngineOutcome::Timeout => RecognitionError::AdapterTimeout {
                engine,
                budget: self.tier_timeout,
            },
            EngineOutcome::Error(message) => RecognitionError::AdapterFault {
                engine,
                message: message.clone(),
            },
            EngineOutcome::Unsupported(reason) => RecognitionError::UnsupportedPage {
                engine,
                reason: reason.clone(),
            },
        };
        Some(err.to_string())
    }

    /// Aggregate the chosen results.
    fn finish(
        &self,
        page_index: usize,
        results: Vec<ScoredResult>,
        hint: RoutingHint,
        attempts: RankedAttempts,
    ) -> PageDisposition {
        let attempts = sorted_attempts(attempts);
        match self.aggregator.aggregate(page_index, results) {
            Ok(mut aggregated) => {
                aggregated.hint = Some(hint);
                aggregated.attempts = attempts;
                PageDisposition::Recognized(aggregated)
            }
            Err(err) => {
                error!(%err, "Could not aggregate results");
                PageDisposition::Failed {
                    attempts,
                    reason: err.to_string(),
                }
            }
        }
    }
}

/// A result for an adapter that never returned normally.
fn unfinished_result(ranked: &RankedAdapter, outcome: EngineOutcome) -> EngineResult {
    EngineResult {
        engine: ranked.adapter.name().to_owned(),
        kind: ranked.adapter.kind(),
        rank: ranked.rank,
        cost: ranked.adapter.capability().cost,
        outcome,
        elapsed_ms: 0,
    }
}

/// Order attempts by registry rank, not arrival.
fn sorted_attempts(mut attempts: RankedAttempts) -> Vec<EngineAttempt> {
    attempts.sort_by_key(|(rank, _)| *rank);
    attempts.into_iter().map(|(_, attempt)| attempt).collect()
}

/// Run a single adapter on a page, holding a worker slot for the duration.
///
/// Never fails: timeouts, errors and panics all become [`EngineOutcome`]s.
#[instrument(level = "debug", skip_all, fields(engine = %ranked.adapter.name()))]
async fn invoke(
    ranked: RankedAdapter,
    page: Arc<Page>,
    pool: WorkerPool,
    budget: Duration,
) -> EngineResult {
    let adapter = ranked.adapter.clone();
    let engine = adapter.name().to_owned();
    let full_page = page.full_page_box();

    let (outcome, elapsed_ms) = match pool.acquire().await {
        Err(err) => (EngineOutcome::Error(format!("{err:#}")), 0),
        Ok(_slot) => {
            let started = Instant::now();
            let Some(deadline) = started.checked_add(budget) else {
                let message = format!("time budget {budget:?} is out of range");
                warn!(%message, "Engine fault");
                return unfinished_result(&ranked, EngineOutcome::Error(message));
            };
            let recognize = AssertUnwindSafe(adapter.recognize(page, deadline)).catch_unwind();
            let outcome = match timeout_at(deadline, recognize).await {
                Err(_) => {
                    warn!(budget = ?budget, "Engine timed out");
                    EngineOutcome::Timeout
                }
                Ok(Err(panic)) => {
                    let message = format!("panicked: {}", panic_message(panic.as_ref()));
                    warn!(%message, "Engine fault");
                    EngineOutcome::Error(message)
                }
                Ok(Ok(Err(err))) => match err.downcast_ref::<RecognitionError>() {
                    Some(RecognitionError::UnsupportedPage { reason, .. }) => {
                        debug!(%reason, "Engine declined page");
                        EngineOutcome::Unsupported(reason.clone())
                    }
                    _ => {
                        let message = format!("{err:#}");
                        warn!(%message, "Engine fault");
                        EngineOutcome::Error(message)
                    }
                },
                // An `ok` result always has at least one block.
                Ok(Ok(Ok(blocks))) if blocks.is_empty() => EngineOutcome::Ok(vec![TextBlock {
                    text: String::new(),
                    region: full_page,
                    confidence: None,
                }]),
                Ok(Ok(Ok(blocks))) => EngineOutcome::Ok(blocks),
            };
            (outcome, started.elapsed().as_millis() as u64)
        }
    };

    EngineResult {
        engine,
        kind: adapter.kind(),
        rank: ranked.rank,
        cost: adapter.capability().cost,
        outcome,
        elapsed_ms,
    }
}

/// Extract the message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AggregationConfig, ScoringConfig},
        engines::{EngineAdapter, testing::{StubAdapter, text_page}},
        recognition::{
            AggregationStrategy, DocumentCategory, OutcomeTag, lexicon::Lexicons,
        },
    };

    const GOOD: &str = "Thank you for your letter of the first of May.";
    const POOR: &str = "zq xv";

    fn hint() -> RoutingHint {
        RoutingHint {
            category: DocumentCategory::Printed,
            confidence: 0.9,
            skew_degrees: 0.0,
            language: "en".to_owned(),
            text_density: 0.0,
        }
    }

    fn orchestrator(
        adapters: Vec<Arc<dyn EngineAdapter>>,
        tier_size: usize,
        tier_timeout: Duration,
    ) -> Orchestrator {
        let config = PipelineConfig {
            tier_size,
            tier_timeout_secs: tier_timeout.as_secs_f64(),
            ..Default::default()
        };
        Orchestrator::new(
            Arc::new(EngineRegistry::new(adapters).unwrap()),
            Scorer::new(ScoringConfig::default(), Arc::new(Lexicons::builtin())),
            Aggregator::new(AggregationConfig::default()),
            WorkerPool::new(8),
            &config,
        )
    }

    fn page() -> Arc<Page> {
        Arc::new(text_page(0, GOOD))
    }

    fn tags(attempts: &[EngineAttempt]) -> Vec<(&str, OutcomeTag)> {
        attempts
            .iter()
            .map(|a| (a.engine.as_str(), a.outcome))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_early_accept_cancels_the_rest_of_the_tier() {
        let fast = Arc::new(StubAdapter::new("fast", GOOD).with_fitness(0.9));
        let late = Arc::new(
            StubAdapter::new("late", GOOD)
                .with_fitness(0.8)
                .with_cost(0.1)
                .with_delay(Duration::from_millis(300)),
        );
        let orchestrator = orchestrator(
            vec![fast.clone(), late.clone()],
            2,
            Duration::from_secs(5),
        );

        let PageDisposition::Recognized(result) = orchestrator.run_page(page(), hint()).await
        else {
            panic!("page should be recognized");
        };
        assert_eq!(result.engines, vec!["fast"]);
        assert_eq!(result.strategy, AggregationStrategy::Single);
        assert!(result.quality >= 0.9);
        assert_eq!(tags(&result.attempts), vec![("fast", OutcomeTag::Ok)]);
        assert_eq!(result.hint, Some(hint()));

        // The late engine never got to finish, even given plenty of time.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(late.finished(), 0);
    }

    #[tokio::test]
    async fn test_timeouts_escalate_to_the_next_tier() {
        let slow = |name| {
            Arc::new(
                StubAdapter::new(name, GOOD)
                    .with_fitness(0.9)
                    .with_delay(Duration::from_secs(30)),
            ) as Arc<dyn EngineAdapter>
        };
        let backup = Arc::new(StubAdapter::new("backup", POOR).with_fitness(0.2));
        let orchestrator = orchestrator(
            vec![slow("slow_a"), slow("slow_b"), backup.clone()],
            2,
            Duration::from_millis(50),
        );

        let PageDisposition::Recognized(result) = orchestrator.run_page(page(), hint()).await
        else {
            panic!("page should be recognized");
        };
        assert_eq!(result.text, POOR);
        assert_eq!(backup.started(), 1);
        assert_eq!(
            tags(&result.attempts),
            vec![
                ("slow_a", OutcomeTag::Timeout),
                ("slow_b", OutcomeTag::Timeout),
                ("backup", OutcomeTag::Ok),
            ]
        );
        assert!(
            result.attempts[0]
                .detail
                .as_deref()
                .unwrap()
                .contains("did not finish")
        );
    }

    #[tokio::test]
    async fn test_page_fails_without_another_tier() {
        let orchestrator = orchestrator(
            vec![
                Arc::new(StubAdapter::new("a", GOOD).with_delay(Duration::from_secs(30))),
                Arc::new(StubAdapter::new("b", GOOD).with_delay(Duration::from_secs(30))),
            ],
            2,
            Duration::from_millis(20),
        );
        let PageDisposition::Failed { attempts, reason } =
            orchestrator.run_page(page(), hint()).await
        else {
            panic!("page should fail");
        };
        assert_eq!(
            tags(&attempts),
            vec![("a", OutcomeTag::Timeout), ("b", OutcomeTag::Timeout)]
        );
        assert!(reason.contains("page 0"), "{reason}");
    }

    #[tokio::test]
    async fn test_faults_degrade_gracefully() {
        let orchestrator = orchestrator(
            vec![
                Arc::new(StubAdapter::new("broken", GOOD).with_fitness(0.9).failing("no model")),
                Arc::new(StubAdapter::new("crashy", GOOD).with_fitness(0.8).panicking()),
                Arc::new(StubAdapter::new("picky", GOOD).with_fitness(0.7).declining("too big")),
                Arc::new(StubAdapter::new("last", POOR).with_fitness(0.6)),
            ],
            1,
            Duration::from_secs(5),
        );
        let PageDisposition::Recognized(result) = orchestrator.run_page(page(), hint()).await
        else {
            panic!("page should be recognized");
        };
        assert_eq!(result.engines, vec!["last"]);
        assert_eq!(
            tags(&result.attempts),
            vec![
                ("broken", OutcomeTag::Error),
                ("crashy", OutcomeTag::Error),
                ("picky", OutcomeTag::Unsupported),
                ("last", OutcomeTag::Ok),
            ]
        );
        assert_eq!(
            result.attempts[0].detail.as_deref(),
            Some("broken failed: no model")
        );
        assert!(
            result.attempts[1]
                .detail
                .as_deref()
                .unwrap()
                .contains("crashy exploded")
        );
    }

    #[tokio::test]
    async fn test_unusable_pages_are_not_dispatched() {
        let needs_pixels = Arc::new(StubAdapter::new("pixels", GOOD).with_fitness(0.9).requiring_image());
        let fallback = Arc::new(StubAdapter::new("fallback", GOOD).with_fitness(0.1));
        let orchestrator = orchestrator(
            vec![needs_pixels.clone(), fallback],
            1,
            Duration::from_secs(5),
        );
        let PageDisposition::Recognized(result) = orchestrator.run_page(page(), hint()).await
        else {
            panic!("page should be recognized");
        };
        assert_eq!(needs_pixels.started(), 0);
        assert_eq!(result.attempts[0].outcome, OutcomeTag::Unsupported);
        assert_eq!(result.engines, vec!["fallback"]);
    }

    #[tokio::test]
    async fn test_empty_output_still_has_a_block() {
        let orchestrator = orchestrator(
            vec![Arc::new(StubAdapter::new("blank", "").with_blocks(vec![]))],
            1,
            Duration::from_secs(5),
        );
        let PageDisposition::Recognized(result) = orchestrator.run_page(page(), hint()).await
        else {
            panic!("page should be recognized");
        };
        assert_eq!(result.text, "");
        assert_eq!(result.blocks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_result_does_not_depend_on_arrival_order() {
        let run = |first_delay: u64, second_delay: u64| async move {
            let orchestrator = orchestrator(
                vec![
                    Arc::new(
                        StubAdapter::new("one", "zq xv the")
                            .with_delay(Duration::from_millis(first_delay)),
                    ),
                    Arc::new(
                        StubAdapter::new("two", "zq of xv")
                            .with_delay(Duration::from_millis(second_delay)),
                    ),
                ],
                2,
                Duration::from_secs(5),
            );
            match orchestrator.run_page(page(), hint()).await {
                PageDisposition::Recognized(result) => result,
                PageDisposition::Failed { reason, .. } => panic!("{reason}"),
            }
        };
        let a = run(0, 50).await;
        let b = run(50, 0).await;
        assert_eq!(a.text, b.text);
        assert_eq!(a.quality.to_bits(), b.quality.to_bits());
        assert_eq!(tags(&a.attempts), tags(&b.attempts));
    }

    #[tokio::test]
    async fn test_huge_timeout_setting_still_recognizes_pages() {
        let config = PipelineConfig {
            tier_size: 1,
            tier_timeout_secs: 1e19,
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(
            Arc::new(EngineRegistry::new(vec![Arc::new(StubAdapter::new("only", GOOD))]).unwrap()),
            Scorer::new(ScoringConfig::default(), Arc::new(Lexicons::builtin())),
            Aggregator::new(AggregationConfig::default()),
            WorkerPool::new(1),
            &config,
        );
        let PageDisposition::Recognized(result) = orchestrator.run_page(page(), hint()).await
        else {
            panic!("page should be recognized");
        };
        assert!(result.text.contains("Thank you"), "{}", result.text);
        assert_eq!(tags(&result.attempts), vec![("only", OutcomeTag::Ok)]);
    }

    #[tokio::test]
    async fn test_unrepresentable_deadline_is_a_fault() {
        let stub = Arc::new(StubAdapter::new("only", GOOD));
        let ranked = RankedAdapter {
            rank: 3,
            adapter: stub.clone(),
        };
        let result = invoke(ranked, page(), WorkerPool::new(1), Duration::MAX).await;
        assert_eq!(result.rank, 3);
        assert!(
            matches!(&result.outcome, EngineOutcome::Error(message) if message.contains("out of range")),
            "{:?}",
            result.outcome
        );
        assert_eq!(stub.started(), 0);
    }

    async fn explode() -> EngineResult {
        panic!("task exploded")
    }

    #[tokio::test]
    async fn test_panicked_tasks_are_recorded_as_faults() {
        let stub: Arc<dyn EngineAdapter> = Arc::new(StubAdapter::new("crashy", GOOD));
        let orchestrator = orchestrator(vec![stub.clone()], 1, Duration::from_secs(5));

        let mut tasks = JoinSet::new();
        let handle = tasks.spawn(explode());
        let engines = TaskEngines::from([(handle.id(), RankedAdapter { rank: 0, adapter: stub })]);
        let joined = tasks.join_next().await.unwrap();

        let (mut attempts, mut scored, mut accepted) = (vec![], vec![], vec![]);
        orchestrator.collect(
            &hint(),
            &engines,
            joined,
            &mut attempts,
            &mut scored,
            &mut accepted,
        );
        assert!(scored.is_empty());
        assert!(accepted.is_empty());
        let attempts = sorted_attempts(attempts);
        assert_eq!(tags(&attempts), vec![("crashy", OutcomeTag::Error)]);
        assert!(
            attempts[0]
                .detail
                .as_deref()
                .unwrap()
                .contains("task exploded")
        );
    }
}
