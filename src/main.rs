use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod config;
mod engines;
mod prelude;
mod queues;
mod server;
mod ui;

/// Extract text from images with Tesseract, a few at a time.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - HOST, PORT: Where `serve` listens (default 0.0.0.0:9000).
  - TESSERACT_CMD: The `tesseract` binary to run.
  - TESSERACT_LANG: Tesseract language(s), like "eng+ind".
  - OCR_WORKERS, OCR_QUEUE_CAPACITY, OCR_ENGINE_TIMEOUT,
    OCR_ADMISSION_TIMEOUT, OCR_RESULT_TIMEOUT, OCR_TEMP_DIR:
    Worker pool settings. See the options for each subcommand.
  - RUST_LOG: Logging filter (default "info").

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
    /// Run an HTTP server accepting image uploads at "/upload".
    Serve(cmd::serve::ServeOpts),
    /// OCR image files, writing one JSON record per file.
    Ocr(cmd::ocr::OcrOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Serve(_) => false,
            Cmd::Ocr(opts) => opts.output_path.is_none(),
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
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
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

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bar if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Serve(serve_opts) => {
            cmd::serve::cmd_serve(serve_opts).await?;
        }
        Cmd::Ocr(ocr_opts) => {
            cmd::ocr::cmd_ocr(ui, ocr_opts).await?;
        }
    }
    Ok(())
}
