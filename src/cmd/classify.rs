//! The `classify` subcommand, for seeing how pages would be routed.

use std::sync::Arc;

use clap::Args;
use serde_json::json;

use crate::{
    async_utils::spawn_blocking_propagating_panics, page::load_single_file_page, prelude::*,
    recognition::pipeline::Pipeline,
};

use super::PipelineOpts;

/// Print the routing hint for each file.
#[derive(Debug, Args)]
pub struct ClassifyOpts {
    /// Page images (or text files) to classify.
    #[clap(required = true, value_name = "FILE")]
    pub paths: Vec<PathBuf>,

    #[command(flatten)]
    pub pipeline_opts: PipelineOpts,
}

/// The `classify` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_classify(opts: &ClassifyOpts) -> Result<()> {
    let config = opts.pipeline_opts.load_config().await?;
    let pipeline = Pipeline::new(config).await?;
    for path in &opts.paths {
        let owned_path = path.clone();
        let page =
            spawn_blocking_propagating_panics(move || load_single_file_page(&owned_path))
                .await?;
        let hint = pipeline.classify(Arc::new(page)).await;
        let line = json!({ "path": path, "hint": hint });
        println!("{line}");
    }
    Ok(())
}
