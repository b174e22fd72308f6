//! The bounded job queue between dispatchers and workers.
//!
//! Any number of dispatchers may enqueue, and any number of workers may
//! dequeue. Each job comes out exactly once, in the order it went in.

use std::sync::Arc;

use tokio::sync::{
    Mutex,
    mpsc::{self, error::SendTimeoutError},
};

use crate::prelude::*;

use super::job::{Job, OcrError};

/// Create a new job queue holding at most `capacity` waiting jobs.
pub fn job_queue(capacity: usize) -> (JobSender, JobReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        JobSender { tx },
        JobReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// The sending half of a job queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct JobSender {
    tx: mpsc::Sender<Job>,
}

impl JobSender {
    /// Add a job to the queue, waiting at most `admission_timeout` for room.
    ///
    /// If we give up, the job is dropped without ever having been queued.
    pub async fn enqueue(&self, job: Job, admission_timeout: Duration) -> Result<(), OcrError> {
        match self.tx.send_timeout(job, admission_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(job)) => {
                debug!(job_id = %job.id, "queue is still full, giving up");
                Err(OcrError::AdmissionTimeout {
                    waited: admission_timeout,
                })
            }
            Err(SendTimeoutError::Closed(_job)) => Err(OcrError::PoolClosed),
        }
    }

    /// How many more jobs fit in the queue right now.
    #[cfg(test)]
    pub fn available_capacity(&self) -> usize {
        self.tx.capacity()
    }

    /// The most jobs the queue can hold.
    pub fn max_capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

/// The receiving half of a job queue, shared by all workers.
///
/// The underlying receiver sits behind an async mutex, so only one worker
/// waits on it at a time. Tokio's mutex is fair, so idle workers take turns.
#[derive(Clone, Debug)]
pub struct JobReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
}

impl JobReceiver {
    /// Wait for the next job. Returns `None` once every [`JobSender`] has been
    /// dropped and the queue is empty.
    pub async fn dequeue(&self) -> Option<Job> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}
