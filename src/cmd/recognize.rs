//! The `recognize` subcommand.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use clap::Args;
use futures::StreamExt as _;
use schemars::JsonSchema;

use crate::{
    async_utils::io::{read_jsonl, write_output},
    page::DocumentInput,
    prelude::*,
    recognition::{PipelineOutcome, PipelineStatus, pipeline::Pipeline},
    ui::{ProgressConfig, Ui},
};

use super::{PipelineOpts, StreamOpts};

/// Recognize documents listed in a JSONL file.
#[derive(Debug, Args)]
pub struct RecognizeOpts {
    /// Input JSONL file, one document per line. Defaults to standard input.
    pub input_path: Option<PathBuf>,

    /// Output JSONL file. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[command(flatten)]
    pub stream_opts: StreamOpts,

    #[command(flatten)]
    pub pipeline_opts: PipelineOpts,
}

/// One output record.
#[derive(Debug, JsonSchema, Serialize)]
pub struct DocumentOutput {
    /// The `id` of the input record.
    pub id: Value,

    /// What happened.
    #[serde(flatten)]
    pub outcome: PipelineOutcome,
}

/// The `recognize` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_recognize(ui: Ui, opts: &RecognizeOpts) -> Result<()> {
    // Build our pipeline first, so that configuration errors are reported
    // before we read any input.
    let config = opts.pipeline_opts.load_config().await?;
    let pipeline = Arc::new(Pipeline::new(config).await?);

    let (input, size_hint) = read_jsonl(&ui, opts.input_path.as_deref()).await?;
    let input = opts.stream_opts.apply_stream_input_opts(input);
    let size_hint = match (size_hint, opts.stream_opts.take_first) {
        ((lower, Some(upper)), Some(take_first)) => {
            (lower.min(take_first), Some(upper.min(take_first)))
        }
        (size_hint, _) => size_hint,
    };

    let pb = ui.new_from_size_hint(
        &ProgressConfig {
            emoji: "📄",
            msg: "Recognizing documents",
            done_msg: "Recognized documents",
        },
        size_hint,
    );

    let counters = Arc::new(DocumentCounters::default());
    let output = {
        let counters = counters.clone();
        input
            .map(move |record| {
                let pipeline = pipeline.clone();
                let counters = counters.clone();
                async move {
                    let input = serde_json::from_value::<DocumentInput>(record?)
                        .context("cannot parse input record")?;
                    let output = recognize_document(&pipeline, input).await;
                    counters.update(&output.outcome);
                    serde_json::to_value(&output).context("cannot serialize output record")
                }
            })
            .buffered(opts.stream_opts.job_count.max(1))
            .boxed()
    };
    let output = pb.wrap_stream(output).boxed();
    write_output(opts.output_path.as_deref(), output).await?;

    counters.finish(&ui, opts.stream_opts.allowed_failure_rate)
}

/// Load and recognize a single document. Never fails: loading errors become
/// a failed outcome.
#[instrument(level = "debug", skip_all, fields(id = %input.id))]
async fn recognize_document(pipeline: &Pipeline, input: DocumentInput) -> DocumentOutput {
    let outcome = match input.load_pages().await {
        Ok(pages) => pipeline.run_document(pages).await,
        Err(err) => {
            warn!("Could not load document: {err:#}");
            PipelineOutcome::failure(format!("{err:#}"))
        }
    };
    if outcome.status != PipelineStatus::Complete {
        info!(status = ?outcome.status, failed_pages = ?outcome.failed_pages, "Document not fully recognized");
    }
    DocumentOutput {
        id: input.id,
        outcome,
    }
}

/// Counts of documents and pages, for our final summary.
#[derive(Debug, Default)]
struct DocumentCounters {
    documents: AtomicUsize,
    partial: AtomicUsize,
    failed: AtomicUsize,
    pages: AtomicUsize,
    failed_pages: AtomicUsize,
}

impl DocumentCounters {
    /// Count one finished document.
    fn update(&self, outcome: &PipelineOutcome) {
        self.documents.fetch_add(1, Ordering::Relaxed);
        match outcome.status {
            PipelineStatus::Complete => {}
            PipelineStatus::Partial => {
                self.partial.fetch_add(1, Ordering::Relaxed);
            }
            PipelineStatus::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.pages.fetch_add(
            outcome.pages.len() + outcome.failed_pages.len(),
            Ordering::Relaxed,
        );
        self.failed_pages
            .fetch_add(outcome.failed_pages.len(), Ordering::Relaxed);
    }

    /// Report our counters, and fail if too many documents weren't fully
    /// recognized.
    fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        let documents = self.documents.load(Ordering::Relaxed);
        let partial = self.partial.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let pages = self.pages.load(Ordering::Relaxed);
        let failed_pages = self.failed_pages.load(Ordering::Relaxed);

        ui.display_message(
            "📊",
            &format!("{documents} documents, {pages} pages ({failed_pages} unrecognized)"),
        );
        let incomplete = partial + failed;
        let failure_rate = if documents == 0 {
            0.0
        } else {
            incomplete as f32 / documents as f32
        };
        if failure_rate > allowed_failure_rate {
            return Err(anyhow!(
                "{}/{} ({:.2}%) of documents were not fully recognized, but only {:.2}% were allowed",
                incomplete,
                documents,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ));
        }
        if partial > 0 {
            ui.display_message("⚠️", &format!("{partial} documents were partially recognized"));
        }
        if failed > 0 {
            ui.display_message("❌", &format!("{failed} documents could not be recognized"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_rate() {
        let ui = Ui::init_for_tests();
        let counters = DocumentCounters::default();
        for _ in 0..3 {
            counters.update(&PipelineOutcome {
                status: PipelineStatus::Complete,
                pages: vec![],
                failed_pages: vec![],
                text: Some(String::new()),
                errors: vec![],
            });
        }
        counters.update(&PipelineOutcome::failure("boom".to_owned()));
        assert!(counters.finish(&ui, 0.25).is_ok());
        assert!(counters.finish(&ui, 0.1).is_err());
    }

    #[test]
    fn test_output_flattens_outcome() {
        let output = DocumentOutput {
            id: Value::from("doc-1"),
            outcome: PipelineOutcome::failure("document has no pages".to_owned()),
        };
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["id"], "doc-1");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["errors"][0], "document has no pages");
    }
}
