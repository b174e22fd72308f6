//! OCR jobs and their results.

use std::fmt;

use futures::channel::oneshot;
use uuid::Uuid;

use crate::{config::HumanDuration, prelude::*};

/// Text we return when the engine succeeds but finds nothing. We never report
/// an empty string as a successful result.
pub const NO_TEXT_DETECTED: &str = "No text detected in the image.";

/// The outcome of a single job.
pub type JobResult = std::result::Result<String, OcrError>;

/// Everything that can go wrong with a single submission. All of these are
/// local to one request.
#[derive(Debug, thiserror::Error)]
pub enum OcrError {
    /// The engine never became ready, so we refused to create a job.
    #[error("OCR engine is not configured: {reason}")]
    EngineUnavailable { reason: String },

    /// The queue stayed full for longer than we were willing to wait.
    #[error("OCR service busy: queue stayed full for {}", human(.waited))]
    AdmissionTimeout { waited: Duration },

    /// No result arrived in time. The job may still be running.
    #[error("OCR processing timeout after {}", human(.waited))]
    ProcessingTimeout { waited: Duration },

    /// The engine itself reported an error.
    #[error("OCR engine failed: {0:#}")]
    EngineExecution(anyhow::Error),

    /// We couldn't write the temporary image file.
    #[error("temporary file error: {0:#}")]
    TempFile(anyhow::Error),

    /// The file name doesn't look like an image we can handle.
    #[error("unsupported file type {name:?}; expected one of {}", SUPPORTED_EXTENSIONS.join(", "))]
    UnsupportedFormat { name: String },

    /// Nothing was uploaded.
    #[error("uploaded file {name:?} is empty")]
    EmptyPayload { name: String },

    /// The worker pool has shut down.
    #[error("OCR worker pool has shut down")]
    PoolClosed,
}

impl OcrError {
    /// The payload-free category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OcrError::EngineUnavailable { .. } => ErrorKind::EngineUnavailable,
            OcrError::AdmissionTimeout { .. } => ErrorKind::AdmissionTimeout,
            OcrError::ProcessingTimeout { .. } => ErrorKind::ProcessingTimeout,
            OcrError::EngineExecution(_) => ErrorKind::EngineExecutionError,
            OcrError::TempFile(_) => ErrorKind::TempFileError,
            OcrError::UnsupportedFormat { .. } => ErrorKind::UnsupportedFormat,
            OcrError::EmptyPayload { .. } => ErrorKind::EmptyPayload,
            OcrError::PoolClosed => ErrorKind::PoolClosed,
        }
    }
}

/// Wrap a duration for display in error messages.
fn human(duration: &Duration) -> HumanDuration {
    HumanDuration(*duration)
}

/// Error categories, suitable for serializing into output records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    EngineUnavailable,
    AdmissionTimeout,
    ProcessingTimeout,
    EngineExecutionError,
    TempFileError,
    UnsupportedFormat,
    EmptyPayload,
    PoolClosed,
}

impl ErrorKind {
    /// The same name we use when serializing.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::EngineUnavailable => "engine_unavailable",
            ErrorKind::AdmissionTimeout => "admission_timeout",
            ErrorKind::ProcessingTimeout => "processing_timeout",
            ErrorKind::EngineExecutionError => "engine_execution_error",
            ErrorKind::TempFileError => "temp_file_error",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::EmptyPayload => "empty_payload",
            ErrorKind::PoolClosed => "pool_closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File extensions we accept, lowercase and without the leading dot.
pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "gif", "bmp", "tiff", "tif"];

/// Does this file name have an extension we know how to OCR?
pub fn is_supported_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Clean up raw engine output.
pub fn normalize_text(raw: &str) -> String {
    let text = raw.trim();
    if text.is_empty() {
        NO_TEXT_DETECTED.to_owned()
    } else {
        text.to_owned()
    }
}

/// A single unit of OCR work, travelling from a dispatcher to a worker.
#[derive(Debug)]
pub struct Job {
    /// Used only to correlate log messages.
    pub id: Uuid,

    /// The raw image bytes.
    pub payload: Vec<u8>,

    /// The name the image was uploaded under.
    pub source_name: String,

    /// Where to send our one and only result. The matching receiver belongs
    /// to the dispatcher, and may already have been dropped.
    pub reply: oneshot::Sender<JobResult>,
}

impl Job {
    /// Create a new job, and the receiver on which its result will arrive.
    pub fn new(
        payload: Vec<u8>,
        source_name: String,
    ) -> (Self, oneshot::Receiver<JobResult>) {
        let (reply, rx) = oneshot::channel();
        let job = Self {
            id: Uuid::new_v4(),
            payload,
            source_name,
            reply,
        };
        (job, rx)
    }

    /// Deliver our result. This never blocks, because the channel has room
    /// for exactly one value and we consume `self` to send it.
    pub fn respond(self, result: JobResult) {
        if let Err(_unsent) = self.reply.send(result) {
            debug!(
                job_id = %self.id,
                "dropping job result because the dispatcher stopped waiting"
            );
        }
    }
}
