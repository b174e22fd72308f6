//! A fake OCR engine for tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use crate::prelude::*;

use super::OcrEngine;

/// What [`StubEngine::extract_text`] should do.
#[derive(Clone, Debug)]
enum Behavior {
    /// Return this text.
    Return(String),
    /// Return the contents of the input file as text.
    Echo,
    /// Fail with this message.
    Fail(String),
    /// Panic.
    Panic,
}

/// Counters shared between a [`StubEngine`] and the test that created it.
#[derive(Debug, Default)]
pub struct StubStats {
    /// How many times we were probed.
    pub probes: AtomicUsize,
    /// How many extraction calls have started.
    pub calls: AtomicUsize,
    /// How many extraction calls are running right now.
    pub in_flight: AtomicUsize,
    /// The highest value `in_flight` ever reached.
    pub max_in_flight: AtomicUsize,
    /// Every path we were asked to read.
    pub paths: Mutex<Vec<PathBuf>>,
}

impl StubStats {
    /// Paths we've been asked to read, so far.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().expect("lock poisoned").clone()
    }
}

/// A scriptable engine which records how it was called.
pub struct StubEngine {
    behavior: Behavior,
    delay: Duration,
    installed: bool,
    stats: Arc<StubStats>,
}

impl StubEngine {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            installed: true,
            stats: Arc::new(StubStats::default()),
        }
    }

    /// An engine that always finds `text`.
    pub fn returning(text: &str) -> Self {
        Self::new(Behavior::Return(text.to_owned()))
    }

    /// An engine that "recognizes" the raw bytes of the file as text.
    pub fn echo() -> Self {
        Self::new(Behavior::Echo)
    }

    /// An engine that always fails with `msg`.
    pub fn failing(msg: &str) -> Self {
        Self::new(Behavior::Fail(msg.to_owned()))
    }

    /// An engine that panics on every call.
    pub fn panicking() -> Self {
        Self::new(Behavior::Panic)
    }

    /// Sleep for `delay` inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail our startup probe.
    pub fn unavailable(mut self) -> Self {
        self.installed = false;
        self
    }

    /// Counters describing how we've been used.
    pub fn stats(&self) -> Arc<StubStats> {
        self.stats.clone()
    }
}

impl OcrEngine for StubEngine {
    fn name(&self) -> &str {
        "stub engine"
    }

    fn probe(&mut self) -> Result<()> {
        self.stats.probes.fetch_add(1, Ordering::SeqCst);
        if self.installed {
            Ok(())
        } else {
            Err(anyhow!("stub engine is not installed"))
        }
    }

    fn extract_text(&mut self, path: &Path) -> Result<String> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        self.stats
            .paths
            .lock()
            .expect("lock poisoned")
            .push(path.to_owned());
        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats
            .max_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        // Read the file before sleeping, while it definitely still exists.
        let contents = std::fs::read(path);
        thread::sleep(self.delay);
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);

        let contents = contents.context("stub engine could not read input")?;
        match &self.behavior {
            Behavior::Return(text) => Ok(text.clone()),
            Behavior::Echo => Ok(String::from_utf8_lossy(&contents).into_owned()),
            Behavior::Fail(msg) => Err(anyhow!("{}", msg)),
            Behavior::Panic => panic!("stub engine panicked"),
        }
    }
}
