//! The set of registered engines, and which of them to use for a page.

use std::sync::Arc;

use crate::{engines::EngineAdapter, errors::RecognitionError, prelude::*};

use super::{DocumentCategory, RoutingHint};

/// An adapter and its position in the eligible order for one hint.
#[derive(Clone)]
pub struct RankedAdapter {
    /// Position in the eligible order. Lower runs first.
    pub rank: usize,

    /// The adapter.
    pub adapter: Arc<dyn EngineAdapter>,
}

/// All registered engine adapters, in registration order.
pub struct EngineRegistry {
    adapters: Vec<Arc<dyn EngineAdapter>>,
}

impl EngineRegistry {
    /// Create a registry, checking that every category has at least one
    /// eligible adapter.
    pub fn new(adapters: Vec<Arc<dyn EngineAdapter>>) -> Result<Self, RecognitionError> {
        for category in DocumentCategory::ALL {
            if !adapters
                .iter()
                .any(|adapter| adapter.capability().supports(category))
            {
                return Err(RecognitionError::UnsupportedCategory(category));
            }
        }
        for adapter in &adapters {
            debug!(
                engine = adapter.name(),
                kind = ?adapter.kind(),
                cost = adapter.capability().cost,
                "Registered engine"
            );
        }
        Ok(Self { adapters })
    }

    /// Adapters eligible for `hint`, best first.
    ///
    /// We sort by descending fitness for the hint's category, then by
    /// ascending cost, then by registration order. Never empty for a
    /// registry built by [`EngineRegistry::new`].
    pub fn eligible(&self, hint: &RoutingHint) -> Vec<RankedAdapter> {
        let category = hint.category;
        let mut eligible = self
            .adapters
            .iter()
            .filter(|adapter| adapter.capability().supports(category))
            .collect::<Vec<_>>();
        // `sort_by` is stable, so registration order breaks the final tie.
        eligible.sort_by(|a, b| {
            let (a, b) = (a.capability(), b.capability());
            b.fitness
                .for_category(category)
                .total_cmp(&a.fitness.for_category(category))
                .then_with(|| a.cost.total_cmp(&b.cost))
        });
        eligible
            .into_iter()
            .enumerate()
            .map(|(rank, adapter)| RankedAdapter {
                rank,
                adapter: adapter.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::testing::StubAdapter;

    fn hint(category: DocumentCategory) -> RoutingHint {
        RoutingHint {
            category,
            ..RoutingHint::ambiguous(0.9)
        }
    }

    fn names(ranked: &[RankedAdapter]) -> Vec<&str> {
        ranked.iter().map(|r| r.adapter.name()).collect()
    }

    #[test]
    fn test_eligible_order() {
        let registry = EngineRegistry::new(vec![
            Arc::new(StubAdapter::new("fallback", "").with_fitness(0.1).with_cost(0.0)),
            Arc::new(
                StubAdapter::new("expensive", "")
                    .with_fitness(0.8)
                    .with_cost(5.0),
            ),
            Arc::new(StubAdapter::new("cheap", "").with_fitness(0.8).with_cost(1.0)),
            Arc::new(StubAdapter::new("cheap_too", "").with_fitness(0.8).with_cost(1.0)),
            Arc::new(
                StubAdapter::new("hands", "")
                    .with_fitness(0.5)
                    .with_category_fitness(DocumentCategory::Handwritten, 0.95)
                    .with_category_fitness(DocumentCategory::Printed, 0.0),
            ),
        ])
        .unwrap();

        let printed = registry.eligible(&hint(DocumentCategory::Printed));
        assert_eq!(
            names(&printed),
            vec!["cheap", "cheap_too", "expensive", "fallback"]
        );
        assert_eq!(
            printed.iter().map(|r| r.rank).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );

        let handwritten = registry.eligible(&hint(DocumentCategory::Handwritten));
        assert_eq!(handwritten[0].adapter.name(), "hands");
        assert_eq!(handwritten.len(), 5);
    }

    #[test]
    fn test_every_category_needs_an_engine() {
        let result = EngineRegistry::new(vec![Arc::new(
            StubAdapter::new("printed_only", "")
                .with_fitness(0.0)
                .with_category_fitness(DocumentCategory::Printed, 1.0),
        )]);
        assert!(matches!(
            result,
            Err(RecognitionError::UnsupportedCategory(
                DocumentCategory::Handwritten
            ))
        ));
        assert!(matches!(
            EngineRegistry::new(vec![]),
            Err(RecognitionError::UnsupportedCategory(_))
        ));
    }
}
