//! The `ocr` subcommand.

use std::sync::{Arc, Mutex};

use clap::Args;
use futures::{StreamExt as _, stream};

use crate::{
    async_utils::io::write_output,
    config::PoolOpts,
    engines::EngineOpts,
    prelude::*,
    queues::{
        dispatcher::Dispatcher,
        job::{ErrorKind, JobResult},
    },
    ui::{ProgressConfig, Ui},
};

/// Options for the `ocr` subcommand.
#[derive(Args, Clone, Debug)]
pub struct OcrOpts {
    /// Image files to OCR.
    #[clap(required = true)]
    pub paths: Vec<PathBuf>,

    /// Output file (JSONL). Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// What portion of inputs should we allow to fail? Specified as a
    /// number between 0.0 and 1.0.
    #[clap(long, default_value = "0.0")]
    pub allowed_failure_rate: f32,

    #[clap(flatten)]
    pub pool_opts: PoolOpts,

    #[clap(flatten)]
    pub engine_opts: EngineOpts,
}

/// Did we get text for a file?
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Ok,
    Failed,
}

/// Why a file failed.
#[derive(Debug, Serialize)]
pub struct RecordError {
    pub kind: ErrorKind,
    pub message: String,
}

/// One line of output.
#[derive(Debug, Serialize)]
pub struct OcrRecord {
    pub path: PathBuf,
    pub status: WorkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
}

impl OcrRecord {
    fn from_result(path: PathBuf, result: JobResult) -> Self {
        match result {
            Ok(text) => Self {
                path,
                status: WorkStatus::Ok,
                text: Some(text),
                error: None,
            },
            Err(err) => Self {
                path,
                status: WorkStatus::Failed,
                text: None,
                error: Some(RecordError {
                    kind: err.kind(),
                    message: err.to_string(),
                }),
            },
        }
    }
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    // Unlike the server, there's no point in running without an engine.
    let (dispatcher, worker) =
        super::start_dispatcher(&opts.pool_opts, &opts.engine_opts, true).await?;

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing files",
            done_msg: "OCRed files",
        },
        opts.paths.len() as u64,
    );

    // Keep every worker busy and the queue full, but never submit more than
    // the queue can hold, or we'd just be racing the admission timeout.
    let concurrency = dispatcher.worker_count() + dispatcher.queue_capacity();
    let counters = Arc::new(Mutex::new(OcrCounters::default()));
    let counters_clone = counters.clone();
    let output = stream::iter(opts.paths.clone())
        .map(|path| ocr_path(&dispatcher, path))
        .buffered(concurrency)
        .map(move |record| {
            let record = record?;
            counters_clone.lock().expect("lock poisoned").update(&record);
            Ok(record)
        });
    write_output(opts.output_path.as_deref(), pb.wrap_stream(output)).await?;

    // Shut down our workers.
    drop(dispatcher);
    worker.join().await?;

    let counters = counters.lock().expect("lock poisoned").to_owned();
    counters.finish(&ui, opts.allowed_failure_rate)
}

/// OCR a single file. Failing to read the file is a fatal error, but OCR
/// failures are reported in the record.
async fn ocr_path(dispatcher: &Dispatcher, path: PathBuf) -> Result<OcrRecord> {
    let payload = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let result = dispatcher.submit(payload, &name).await;
    if let Err(err) = &result {
        warn!(path = %path.display(), "{}", err);
    }
    Ok(OcrRecord::from_result(path, result))
}

/// Running totals for a batch.
#[derive(Clone, Debug, Default)]
pub struct OcrCounters {
    /// How many records did we process?
    pub total_record_count: usize,

    /// How many records did we fail to process?
    pub failure_count: usize,
}

impl OcrCounters {
    /// Count a record.
    fn update(&mut self, record: &OcrRecord) {
        self.total_record_count += 1;
        if record.status != WorkStatus::Ok {
            self.failure_count += 1;
        }
    }

    /// Report our totals, and fail if too many records failed.
    fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        if self.total_record_count == 0 {
            return Ok(());
        }
        let failure_rate = self.failure_count as f32 / self.total_record_count as f32;
        if failure_rate > allowed_failure_rate {
            Err(anyhow!(
                "{}/{} ({:.2}%) of outputs were failures, but only {:.2}% were allowed",
                self.failure_count,
                self.total_record_count,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ))
        } else {
            if self.failure_count > 0 {
                ui.display_message(
                    "❌",
                    &format!("{} files could not be processed", self.failure_count),
                );
            }
            Ok(())
        }
    }
}
