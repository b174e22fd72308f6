//! Queueing OCR jobs and running them on a fixed pool of workers.

pub mod dispatcher;
pub mod job;
pub mod pool;
pub mod queue;
