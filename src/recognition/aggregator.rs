//! Combine scored results for one page into a single text.

use std::cmp::Ordering;

use crate::{config::AggregationConfig, errors::RecognitionError, prelude::*};

use super::{AggregatedResult, AggregationStrategy, ProvenancedBlock, ScoredResult, TextBlock};

/// Selects or merges [`ScoredResult`]s.
#[derive(Clone, Debug)]
pub struct Aggregator {
    config: AggregationConfig,
}

impl Aggregator {
    /// Create a new aggregator.
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    /// Aggregate the results for one page.
    ///
    /// The output depends only on the set of results, never on the order in
    /// which they arrived.
    pub fn aggregate(
        &self,
        page_index: usize,
        mut results: Vec<ScoredResult>,
    ) -> Result<AggregatedResult, RecognitionError> {
        results.sort_by_key(|scored| scored.result.rank);
        match results.len() {
            0 => Err(RecognitionError::AggregationContractViolation),
            1 => {
                let only = results.remove(0);
                Ok(single(page_index, AggregationStrategy::Single, only))
            }
            _ if self.near_disjoint(&results) => Ok(self.merge(page_index, &results)),
            _ => {
                let best = results
                    .into_iter()
                    .max_by(compare_for_selection)
                    .ok_or(RecognitionError::AggregationContractViolation)?;
                Ok(single(page_index, AggregationStrategy::Select, best))
            }
        }
    }

    /// Do all pairs of results cover (nearly) separate parts of the page?
    fn near_disjoint(&self, results: &[ScoredResult]) -> bool {
        for (i, a) in results.iter().enumerate() {
            for b in &results[i + 1..] {
                let overlap = overlap_ratio(a.blocks(), b.blocks());
                trace!(a = %a.result.engine, b = %b.result.engine, overlap, "Region overlap");
                if overlap > self.config.overlap_threshold {
                    return false;
                }
            }
        }
        true
    }

    /// Concatenate the blocks of every result in reading order.
    fn merge(&self, page_index: usize, results: &[ScoredResult]) -> AggregatedResult {
        let mut blocks = results
            .iter()
            .flat_map(|scored| {
                scored
                    .blocks()
                    .iter()
                    .filter(|block| !block.text.is_empty())
                    .map(|block| ProvenancedBlock {
                        engine: scored.result.engine.clone(),
                        block: block.clone(),
                    })
            })
            .collect::<Vec<_>>();
        blocks.sort_by(|a, b| {
            let (a, b) = (&a.block.region, &b.block.region);
            a.y0.total_cmp(&b.y0).then_with(|| a.x0.total_cmp(&b.x0))
        });

        // Group blocks into lines, then read each line left to right.
        let mut lines: Vec<Vec<ProvenancedBlock>> = vec![];
        for block in blocks {
            match lines.last_mut() {
                Some(line)
                    if block.block.region.y0 - line[0].block.region.y0
                        <= self.config.line_tolerance =>
                {
                    line.push(block)
                }
                _ => lines.push(vec![block]),
            }
        }
        let mut text_lines = vec![];
        let mut ordered = vec![];
        for mut line in lines {
            line.sort_by(|a, b| a.block.region.x0.total_cmp(&b.block.region.x0));
            text_lines.push(
                line.iter()
                    .map(|b| b.block.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
            );
            ordered.extend(line);
        }

        // Weight each result by the blocks it contributed to the merge.
        let (weighted, count) = results.iter().fold((0.0, 0usize), |(q, n), scored| {
            let blocks = scored
                .blocks()
                .iter()
                .filter(|block| !block.text.is_empty())
                .count();
            (q + scored.quality * blocks as f32, n + blocks)
        });
        let mut engines = results
            .iter()
            .map(|scored| scored.result.engine.clone())
            .collect::<Vec<_>>();
        engines.dedup();

        AggregatedResult {
            page_index,
            text: text_lines.join("\n"),
            quality: weighted / count.max(1) as f32,
            strategy: AggregationStrategy::Merge,
            engines,
            blocks: ordered,
            hint: None,
            attempts: vec![],
        }
    }
}

/// Use one result verbatim.
fn single(page_index: usize, strategy: AggregationStrategy, scored: ScoredResult) -> AggregatedResult {
    let engine = scored.result.engine.clone();
    AggregatedResult {
        page_index,
        text: scored.text(),
        quality: scored.quality,
        strategy,
        engines: vec![engine.clone()],
        blocks: scored
            .blocks()
            .iter()
            .map(|block| ProvenancedBlock {
                engine: engine.clone(),
                block: block.clone(),
            })
            .collect(),
        hint: None,
        attempts: vec![],
    }
}

/// Order results so that the best one is greatest: higher quality, then lower
/// cost, then earlier in registry order.
pub fn compare_for_selection(a: &ScoredResult, b: &ScoredResult) -> Ordering {
    a.quality
        .total_cmp(&b.quality)
        .then_with(|| b.result.cost.total_cmp(&a.result.cost))
        .then_with(|| b.result.rank.cmp(&a.result.rank))
}

/// How much of the smaller result's area is shared with the other result.
/// Results without any area are treated as full overlap.
fn overlap_ratio(a: &[TextBlock], b: &[TextBlock]) -> f32 {
    let area = |blocks: &[TextBlock]| blocks.iter().map(|b| b.region.area()).sum::<f32>();
    let smaller = area(a).min(area(b));
    if smaller <= 0.0 {
        return 1.0;
    }
    let shared = a
        .iter()
        .flat_map(|x| b.iter().map(move |y| x.region.intersection_area(&y.region)))
        .sum::<f32>();
    (shared / smaller).min(1.0)
}
