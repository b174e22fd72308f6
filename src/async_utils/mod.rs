//! Asynchronous utilities for use with Tokio.
//!
//! Our OCR engine is a blocking external program, and everything around it is
//! async. The glue between the two lives here, so that the rest of the code
//! can mostly pretend the engine is just another async call.

use std::pin::Pin;

use futures::future::join_all;
use regex::Regex;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A handle for one or more background workers. This can be awaited
/// to wait for all workers to complete normally.
pub struct JoinWorker {
    /// The task handle.
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a single worker handle that waits for all of `handles`, and
    /// reports the first failure.
    pub fn from_handles(handles: Vec<JoinHandle<Result<()>>>) -> Self {
        Self {
            future: Box::pin(async move {
                for result in join_all(handles).await {
                    result.context("could not join task")??;
                }
                Ok::<_, anyhow::Error>(())
            }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Run a blocking function on Tokio's blocking thread pool.
///
/// Unlike calling [`tokio::task::spawn_blocking`] and unwrapping, a panic in
/// `f` is turned into an ordinary error, so a single bad job can't take down
/// the task that's waiting on it.
pub async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => Err(anyhow!("blocking task panicked: {}", err)),
        Err(err) => Err(anyhow!("blocking task was cancelled: {}", err)),
    }
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. And standard error may be optionally checked against a
/// regex to determine if the command failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(regex) = error_regex {
            if regex.is_match(&stderr) {
                return Err(anyhow!(
                    "{} printed error output:\n{}",
                    command_name,
                    stderr,
                ));
            }
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}
