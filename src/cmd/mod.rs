//! Command-line entry points.

use clap::Args;
use futures::StreamExt as _;

use crate::{
    async_utils::{BoxedStream, io::read_json_or_toml},
    config::PipelineConfig,
    prelude::*,
};

pub mod classify;
pub mod engines;
pub mod recognize;
pub mod schema;

/// Common options for subcommands that process data streams.
#[derive(Debug, Clone, Args)]
pub struct StreamOpts {
    /// Limit processing to the first N records.
    #[clap(long)]
    pub take_first: Option<usize>,

    /// Max number of documents to process at a time.
    #[clap(short = 'j', long = "jobs", default_value = "8")]
    pub job_count: usize,

    /// What portion of documents may fail to be fully recognized? Specified
    /// as a number between 0.0 and 1.0.
    #[clap(long, default_value = "0.01")]
    pub allowed_failure_rate: f32,
}

impl StreamOpts {
    /// Apply any necessary stream opts to our input stream.
    pub fn apply_stream_input_opts<T>(
        &self,
        input: BoxedStream<Result<T>>,
    ) -> BoxedStream<Result<T>>
    where
        T: 'static,
    {
        if let Some(take_first) = self.take_first {
            input.take(take_first).boxed()
        } else {
            input
        }
    }
}

/// Options for loading a [`PipelineConfig`]. Flags override values from the
/// configuration file.
#[derive(Debug, Clone, Default, Args)]
pub struct PipelineOpts {
    /// Pipeline configuration file (TOML or JSON).
    #[clap(long = "config", value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    /// Stop a tier as soon as a result reaches this quality (0.0 to 1.0).
    #[clap(long)]
    pub early_accept_threshold: Option<f32>,

    /// Time budget for each engine invocation, in seconds.
    #[clap(long = "tier-timeout", value_name = "SECS")]
    pub tier_timeout_secs: Option<f64>,

    /// Maximum engine invocations running at once, across all documents.
    #[clap(long)]
    pub max_concurrency: Option<usize>,

    /// Number of engines dispatched together in each tier.
    #[clap(long)]
    pub tier_size: Option<usize>,

    /// Separate pages in the document text with form feeds.
    #[clap(long)]
    pub page_breaks: bool,
}

impl PipelineOpts {
    /// Load our configuration file, apply overrides, and validate the result.
    #[instrument(level = "debug", skip_all)]
    pub async fn load_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config_path {
            Some(path) => read_json_or_toml::<PipelineConfig>(path).await?,
            None => PipelineConfig::default(),
        };
        if let Some(threshold) = self.early_accept_threshold {
            config.early_accept_threshold = threshold;
        }
        if let Some(secs) = self.tier_timeout_secs {
            config.tier_timeout_secs = secs;
        }
        if let Some(max_concurrency) = self.max_concurrency {
            config.max_concurrency = max_concurrency;
        }
        if let Some(tier_size) = self.tier_size {
            config.tier_size = tier_size;
        }
        if self.page_breaks {
            config.include_page_breaks = true;
        }
        config.validate()?;
        debug!(?config, "Loaded pipeline configuration");
        Ok(config)
    }
}
