use std::{process::ExitCode, str::FromStr};

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod aggregate;
mod async_utils;
mod checkpoint;
mod cmd;
mod config;
mod cpu_limit;
mod export;
mod fragments;
mod ocr;
mod parser;
mod pipeline;
mod pool;
mod prelude;
mod record;
mod render;
mod repair;
mod segment;
mod source;
mod ui;

/// Extract voter records from scanned electoral rolls, resumably.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
External tools:
  - pdfinfo and pdftocairo (Poppler) render PDF pages in `--mode images`.
  - tesseract, with the requested language data, reads card images.

Exit status:
  0 when the export was written, 3 when the folder has no documents,
  4 when the run was interrupted (Ctrl-C or --stop-after), 1 on errors.

Environment Variables:
  - RUST_LOG (optional): Log filter, like `info` or `roll_extract=debug`.

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
    /// Extract records from every document in a folder, resuming any
    /// unfinished run.
    Run(cmd::run::RunOpts),
    /// Print schemas for checkpoint, layout and export formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(_) => false,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<ExitCode> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Run(run_opts) => cmd::run::cmd_run(ui, run_opts).await,
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
