//! Submitting OCR work and waiting for results.
//!
//! The [`Dispatcher`] is the only thing outside this module that callers need.
//! It checks a submission, hands it to the worker pool, and waits for exactly
//! one outcome, bounded by two independent timeouts:
//!
//! 1. The admission timeout bounds how long we wait for room in the queue.
//! 2. The result timeout bounds how long we wait for a queued job to finish.
//!
//! Neither timeout cancels anything. If we stop waiting for a result, the job
//! keeps running in its worker, and the result it eventually sends is dropped
//! along with the job's private reply channel.

use std::fmt;

use futures::channel::oneshot;
use tokio::time;

use crate::{
    async_utils::JoinWorker,
    config::{HumanDuration, PoolConfig},
    engines::EngineHandle,
    prelude::*,
};

use super::{
    job::{Job, JobResult, OcrError, is_supported_image_name},
    pool::WorkerPool,
    queue::{JobSender, job_queue},
};

/// The life of a single submission, as reported in our logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionState {
    Received,
    Validated,
    Queued,
    Completed,
    TimedOut,
    AdmissionRejected,
    EngineUnavailable,
    Rejected,
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionState::Received => "received",
            SubmissionState::Validated => "validated",
            SubmissionState::Queued => "queued",
            SubmissionState::Completed => "completed",
            SubmissionState::TimedOut => "timed_out",
            SubmissionState::AdmissionRejected => "admission_rejected",
            SubmissionState::EngineUnavailable => "engine_unavailable",
            SubmissionState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Submits jobs to a worker pool. Cheap to clone; every clone feeds the same
/// pool.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    jobs: JobSender,
    engine: EngineHandle,
    worker_count: usize,
    admission_timeout: Duration,
    result_timeout: Duration,
}

impl Dispatcher {
    /// Start a worker pool for `engine` and return a dispatcher feeding it.
    ///
    /// The engine should already have been initialized. The workers exit once
    /// every clone of the dispatcher has been dropped, and the returned
    /// [`JoinWorker`] can be used to wait for that.
    pub fn start(config: &PoolConfig, engine: EngineHandle) -> Result<(Self, JoinWorker)> {
        config.validate()?;
        let (jobs, rx) = job_queue(config.queue_capacity);
        let worker = WorkerPool::spawn(config, engine.clone(), rx);
        let dispatcher = Self {
            jobs,
            engine,
            worker_count: config.worker_count,
            admission_timeout: config.admission_timeout,
            result_timeout: config.result_timeout,
        };
        Ok((dispatcher, worker))
    }

    /// The engine our workers use.
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// How many workers are running jobs.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// How many jobs may wait in the queue.
    pub fn queue_capacity(&self) -> usize {
        self.jobs.max_capacity()
    }

    /// OCR `payload`, which was uploaded as `name`.
    #[instrument(level = "debug", name = "submit", skip(self, payload), fields(bytes = payload.len()))]
    pub async fn submit(&self, payload: Vec<u8>, name: &str) -> JobResult {
        debug!(state = %SubmissionState::Received);

        // Without an engine, nothing else about the upload matters.
        if let Err(err) = self.engine.check_ready() {
            warn!(state = %SubmissionState::EngineUnavailable, "{}", err);
            return Err(err);
        }

        // Cheap checks next, before we touch the queue.
        if !is_supported_image_name(name) {
            info!(state = %SubmissionState::Rejected, "unsupported file type");
            return Err(OcrError::UnsupportedFormat {
                name: name.to_owned(),
            });
        }
        if payload.is_empty() {
            info!(state = %SubmissionState::Rejected, "empty upload");
            return Err(OcrError::EmptyPayload {
                name: name.to_owned(),
            });
        }
        debug!(state = %SubmissionState::Validated);

        let (job, rx) = Job::new(payload, name.to_owned());
        let job_id = job.id;
        if let Err(err) = self.jobs.enqueue(job, self.admission_timeout).await {
            warn!(state = %SubmissionState::AdmissionRejected, %job_id, "{}", err);
            return Err(err);
        }
        debug!(state = %SubmissionState::Queued, %job_id);

        self.wait_for_result(job_id, rx).await
    }

    /// Wait for a queued job's result, giving up after our result timeout.
    async fn wait_for_result(
        &self,
        job_id: uuid::Uuid,
        rx: oneshot::Receiver<JobResult>,
    ) -> JobResult {
        match time::timeout(self.result_timeout, rx).await {
            Ok(Ok(result)) => {
                info!(state = %SubmissionState::Completed, %job_id, ok = result.is_ok());
                result
            }
            // The worker dropped the job without answering. This only happens
            // if the worker itself went away.
            Ok(Err(oneshot::Canceled)) => {
                error!(%job_id, "worker dropped job without a result");
                Err(OcrError::PoolClosed)
            }
            Err(_) => {
                warn!(
                    state = %SubmissionState::TimedOut,
                    %job_id,
                    waited = %HumanDuration(self.result_timeout),
                    "gave up waiting for OCR result; the job is still running"
                );
                Err(OcrError::ProcessingTimeout {
                    waited: self.result_timeout,
                })
            }
        }
    }
}
