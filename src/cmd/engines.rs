//! The `engines` subcommand, which shows the eligible engine order for each
//! page category.

use clap::Args;
use serde_json::json;

use crate::{
    prelude::*,
    recognition::{DocumentCategory, RoutingHint, pipeline::Pipeline},
};

use super::PipelineOpts;

/// List engines in the order they would be tried.
#[derive(Debug, Args)]
pub struct EnginesOpts {
    /// Only show this category.
    #[clap(long, value_enum)]
    pub category: Option<DocumentCategory>,

    #[command(flatten)]
    pub pipeline_opts: PipelineOpts,
}

/// The `engines` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_engines(opts: &EnginesOpts) -> Result<()> {
    let config = opts.pipeline_opts.load_config().await?;
    let tier_size = config.tier_size;
    let pipeline = Pipeline::new(config).await?;

    let categories = match opts.category {
        Some(category) => vec![category],
        None => DocumentCategory::ALL.to_vec(),
    };
    for category in categories {
        let hint = RoutingHint {
            category,
            ..RoutingHint::ambiguous(1.0)
        };
        let engines = pipeline
            .registry()
            .eligible(&hint)
            .into_iter()
            .map(|ranked| {
                let capability = ranked.adapter.capability();
                json!({
                    "name": ranked.adapter.name(),
                    "kind": ranked.adapter.kind(),
                    "tier": ranked.rank / tier_size + 1,
                    "fitness": capability.fitness.for_category(category),
                    "cost": capability.cost,
                })
            })
            .collect::<Vec<_>>();
        let line = json!({ "category": category, "engines": engines });
        println!("{line}");
    }
    Ok(())
}
