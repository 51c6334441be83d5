use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod aws;
mod cmd;
mod config;
mod data_url;
mod engines;
mod errors;
mod page;
mod prelude;
mod rate_limit;
mod recognition;
mod retry;
mod ui;
mod worker_pool;

/// Recognize text in scanned documents, routing each page to the OCR engines
/// best suited to it.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the server URL for `vision_llm`
    engines.
  - OPENAI_API_KEY: The OpenAI key to use.
  - RUST_LOG (optional): Logging filter, such as `ocr_conductor=debug`.

  Standard AWS environment variables and credential files
  are used for `textract` engines.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Recognize documents. Each input line should have an `id`, and either
    /// a `path` or a list of `pages`.
    Recognize(cmd::recognize::RecognizeOpts),
    /// Print the routing hint for page images, without recognizing them.
    Classify(cmd::classify::ClassifyOpts),
    /// Print the order in which engines are tried for each page category.
    Engines(cmd::engines::EnginesOpts),
    /// Print schemas for input, output and configuration formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Recognize(opts) => opts.output_path.is_none(),
            Cmd::Classify(_) | Cmd::Engines(_) => true,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Recognize(opts) => cmd::recognize::cmd_recognize(ui, opts).await,
        Cmd::Classify(opts) => cmd::classify::cmd_classify(opts).await,
        Cmd::Engines(opts) => cmd::engines::cmd_engines(opts).await,
        Cmd::Schema(opts) => cmd::schema::cmd_schema(opts).await,
    }
}
