//! OCR using AWS Textract.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use aws_sdk_textract::{
    error::SdkError,
    operation::analyze_document::AnalyzeDocumentError,
    primitives::Blob,
    types::{Block, BlockType, Document, FeatureType, RelationshipType},
};
use keen_retry::ExponentialJitter;
use leaky_bucket::RateLimiter;
use schemars::JsonSchema;
use tokio::time::Instant;

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    aws::load_aws_config,
    page::Page,
    prelude::*,
    rate_limit::RateLimit,
    recognition::{BoundingBox, TextBlock},
    retry::{
        self, EngineRetryResult, IsKnownTransient, retry_result_ok, try_potentially_transient,
    },
};

use super::{CommonEngineSettings, EngineAdapter, EngineCapability, EngineKind, Fitness};

/// Textract is at its best on forms and tables.
const DEFAULT_FITNESS: Fitness = Fitness {
    printed: 0.7,
    handwritten: 0.5,
    mixed: 0.7,
    structured: 0.95,
};

/// Textract accepts at most 10,000 pixels on a side, but that's a lot of
/// pixels for a synchronous call, so we use a more modest default.
const DEFAULT_MAX_PAGE_PIXELS: u64 = 40_000_000;

/// Settings for [`TextractAdapter`].
#[derive(Clone, Debug, Default, Deserialize, JsonSchema)]
pub struct TextractSettings {
    #[serde(flatten)]
    pub common: CommonEngineSettings,

    /// Maximum request rate, such as `"5/s"`.
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub rate_limit: Option<RateLimit>,
}

/// OCR engine wrapping the AWS Textract `AnalyzeDocument` API.
pub struct TextractAdapter {
    name: String,
    capability: EngineCapability,
    client: aws_sdk_textract::Client,
    rate_limiter: Option<RateLimiter>,
}

impl TextractAdapter {
    /// Create a new adapter, using the standard AWS configuration sources.
    pub async fn new(settings: &TextractSettings) -> Result<Self> {
        let config = load_aws_config().await?;
        let client = aws_sdk_textract::Client::new(&config);
        let mut capability =
            EngineCapability::from_settings(&settings.common, 4.0, DEFAULT_FITNESS, true);
        capability.max_page_pixels = capability
            .max_page_pixels
            .or(Some(DEFAULT_MAX_PAGE_PIXELS));
        Ok(Self {
            name: settings.common.name_or("textract"),
            capability,
            client,
            rate_limiter: settings.rate_limit.as_ref().map(RateLimit::to_rate_limiter),
        })
    }

    /// Make a single `AnalyzeDocument` request.
    async fn attempt(&self, png: &[u8]) -> EngineRetryResult<Vec<Block>> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }
        let document = Document::builder().bytes(Blob::new(png)).build();
        let response = try_potentially_transient!(
            self.client
                .analyze_document()
                .document(document)
                .set_feature_types(Some(vec![FeatureType::Tables, FeatureType::Layout]))
                .send()
                .await
        );
        trace!(blocks = response.blocks().len(), "Textract response");
        retry_result_ok(response.blocks().to_vec())
    }
}

#[async_trait]
impl EngineAdapter for TextractAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Structured
    }

    fn capability(&self) -> &EngineCapability {
        &self.capability
    }

    #[instrument(level = "debug", skip_all, fields(engine = %self.name, page = page.index))]
    async fn recognize(&self, page: Arc<Page>, _deadline: Instant) -> Result<Vec<TextBlock>> {
        let (width, height) = page.dimensions();
        let png = spawn_blocking_propagating_panics(move || page.to_png()).await?;

        let resolved = self
            .attempt(&png)
            .await
            .retry_with_async(|_| async { self.attempt(&png).await })
            .with_exponential_jitter(|| ExponentialJitter::FromBackoffRange {
                backoff_range_millis: 100..=10_000,
                re_attempts: 4,
                jitter_ratio: 0.2,
            })
            .await;
        let blocks = retry::resolved_to_result(&self.name, resolved)?;
        blocks_to_text_blocks(&blocks, width, height)
    }
}

impl<R> IsKnownTransient for SdkError<AnalyzeDocumentError, R> {
    fn is_known_transient(&self) -> bool {
        match self {
            SdkError::TimeoutError(_)
            | SdkError::DispatchFailure(_)
            | SdkError::ResponseError(_) => true,
            SdkError::ServiceError(err) => {
                let err = err.err();
                err.is_throttling_exception()
                    || err.is_provisioned_throughput_exceeded_exception()
                    || err.is_internal_server_error()
            }
            _ => false,
        }
    }
}

/// Convert Textract's block graph into text blocks.
///
/// Each table becomes one block, with tab-separated cells. Every line that
/// isn't part of a table becomes its own block. Tables are placed before the
/// first line that starts below them.
fn blocks_to_text_blocks(blocks: &[Block], width: u32, height: u32) -> Result<Vec<TextBlock>> {
    let blocks_by_id = blocks
        .iter()
        .filter_map(|block| Some((block.id()?, block)))
        .collect::<HashMap<_, _>>();
    let region = |block: &Block| -> BoundingBox {
        match block.geometry().and_then(|g| g.bounding_box()) {
            Some(b) => {
                let (w, h) = (width as f32, height as f32);
                BoundingBox::new(
                    b.left() * w,
                    b.top() * h,
                    (b.left() + b.width()) * w,
                    (b.top() + b.height()) * h,
                )
            }
            None => BoundingBox::full_page(width, height),
        }
    };
    let confidence = |block: &Block| block.confidence().map(|c| (c / 100.0).clamp(0.0, 1.0));

    // Tables first, so we know which words they've claimed.
    let mut table_words = HashSet::new();
    let mut tables = vec![];
    for table in blocks
        .iter()
        .filter(|b| b.block_type() == Some(&BlockType::Table))
    {
        let mut rows: BTreeMap<i32, BTreeMap<i32, String>> = BTreeMap::new();
        for cell in children(&blocks_by_id, table)? {
            if cell.block_type() != Some(&BlockType::Cell) {
                continue;
            }
            let mut words = vec![];
            for word in children(&blocks_by_id, cell)? {
                if word.block_type() != Some(&BlockType::Word) {
                    continue;
                }
                if let Some(id) = word.id() {
                    table_words.insert(id);
                }
                words.extend(word.text());
            }
            rows.entry(cell.row_index().unwrap_or_default())
                .or_default()
                .insert(cell.column_index().unwrap_or_default(), words.join(" "));
        }
        let text = rows
            .values()
            .map(|cells| cells.values().cloned().collect::<Vec<_>>().join("\t"))
            .collect::<Vec<_>>()
            .join("\n");
        tables.push(TextBlock {
            text,
            region: region(table),
            confidence: confidence(table),
        });
    }

    let mut lines = vec![];
    for line in blocks
        .iter()
        .filter(|b| b.block_type() == Some(&BlockType::Line))
    {
        let words = children(&blocks_by_id, line)?;
        if !words.is_empty()
            && words
                .iter()
                .all(|w| w.id().is_some_and(|id| table_words.contains(id)))
        {
            continue;
        }
        lines.push(TextBlock {
            text: line.text().unwrap_or_default().to_owned(),
            region: region(line),
            confidence: confidence(line),
        });
    }

    let mut output = Vec::with_capacity(lines.len() + tables.len());
    let mut tables = tables.into_iter().peekable();
    for line in lines {
        while let Some(table) = tables.next_if(|t| t.region.y0 <= line.region.y0) {
            output.push(table);
        }
        output.push(line);
    }
    output.extend(tables);
    debug!(blocks = output.len(), "Converted Textract blocks");
    Ok(output)
}

/// Look up the child blocks of `block`.
fn children<'a>(
    blocks_by_id: &HashMap<&str, &'a Block>,
    block: &Block,
) -> Result<Vec<&'a Block>> {
    let mut found = vec![];
    for relationship in block.relationships() {
        if relationship.r#type() != Some(&RelationshipType::Child) {
            continue;
        }
        for id in relationship.ids() {
            let child = blocks_by_id
                .get(id.as_str())
                .ok_or_else(|| anyhow!("Textract child block {} not found", id))?;
            found.push(*child);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use aws_sdk_textract::types::{
        BoundingBox as TextractBox, Geometry, Relationship, builders::BlockBuilder,
    };

    use super::*;

    fn block_builder(
        block_type: BlockType,
        id: &str,
        text: Option<&str>,
        (left, top, width, height): (f32, f32, f32, f32),
        children: &[&str],
    ) -> BlockBuilder {
        let mut builder = Block::builder()
            .block_type(block_type)
            .id(id)
            .confidence(90.0)
            .geometry(
                Geometry::builder()
                    .bounding_box(
                        TextractBox::builder()
                            .left(left)
                            .top(top)
                            .width(width)
                            .height(height)
                            .build(),
                    )
                    .build(),
            );
        if let Some(text) = text {
            builder = builder.text(text);
        }
        if !children.is_empty() {
            let mut relationship = Relationship::builder().r#type(RelationshipType::Child);
            for child in children {
                relationship = relationship.ids(*child);
            }
            builder = builder.relationships(relationship.build());
        }
        builder
    }

    fn block(
        block_type: BlockType,
        id: &str,
        text: Option<&str>,
        geometry: (f32, f32, f32, f32),
        children: &[&str],
    ) -> Block {
        block_builder(block_type, id, text, geometry, children).build()
    }

    fn cell(id: &str, row: i32, column: i32, children: &[&str]) -> Block {
        block_builder(BlockType::Cell, id, None, (0.1, 0.5, 0.4, 0.1), children)
            .row_index(row)
            .column_index(column)
            .build()
    }

    #[test]
    fn test_blocks_to_text_blocks() {
        let blocks = vec![
            block(BlockType::Line, "l1", Some("Invoice"), (0.1, 0.1, 0.3, 0.05), &["w1"]),
            block(BlockType::Word, "w1", Some("Invoice"), (0.1, 0.1, 0.3, 0.05), &[]),
            block(BlockType::Line, "l2", Some("Item Qty"), (0.1, 0.5, 0.8, 0.05), &["w2", "w3"]),
            block(BlockType::Word, "w2", Some("Item"), (0.1, 0.5, 0.3, 0.05), &[]),
            block(BlockType::Word, "w3", Some("Qty"), (0.6, 0.5, 0.3, 0.05), &[]),
            block(BlockType::Line, "l3", Some("Thank you"), (0.1, 0.9, 0.3, 0.05), &["w4"]),
            block(BlockType::Word, "w4", Some("Thank you"), (0.1, 0.9, 0.3, 0.05), &[]),
            block(BlockType::Table, "t1", None, (0.1, 0.45, 0.8, 0.3), &["c1", "c2"]),
            cell("c2", 1, 2, &["w3"]),
            cell("c1", 1, 1, &["w2"]),
        ];
        let text_blocks = blocks_to_text_blocks(&blocks, 1000, 2000).unwrap();
        let texts = text_blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["Invoice", "Item\tQty", "Thank you"]);
        assert_eq!(
            text_blocks[0].region,
            BoundingBox::new(100.0, 200.0, 400.0, 300.0)
        );
        assert_eq!(text_blocks[0].confidence, Some(0.9));
    }

    #[test]
    fn test_missing_child_is_an_error() {
        let blocks = vec![block(
            BlockType::Line,
            "l1",
            Some("x"),
            (0.0, 0.0, 1.0, 1.0),
            &["missing"],
        )];
        assert!(blocks_to_text_blocks(&blocks, 10, 10).is_err());
    }
}
