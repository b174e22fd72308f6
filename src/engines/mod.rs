//! OCR engine interface.
//!
//! Engines are blocking and must never be called by two threads at once. The
//! [`EngineHandle`] owns the one engine instance in the process, tracks whether
//! it ever became usable, and makes sure only one call runs at a time.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use clap::Args;
use tokio::{sync::Mutex as AsyncMutex, time};

use crate::{
    async_utils::run_blocking,
    config::HumanDuration,
    prelude::*,
    queues::job::OcrError,
};

pub use self::tesseract::TesseractEngine;

#[cfg(test)]
pub mod stub;
pub mod tesseract;

/// How long we let an engine's startup check run.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interface to a blocking OCR engine.
///
/// Methods take `&mut self` because engines are not expected to be safe for
/// concurrent use. [`EngineHandle`] provides the locking.
pub trait OcrEngine: Send + 'static {
    /// A human-readable name for this engine.
    fn name(&self) -> &str;

    /// Check that the engine is installed and working.
    fn probe(&mut self) -> Result<()>;

    /// Extract all the text from the image at `path`.
    fn extract_text(&mut self, path: &Path) -> Result<String>;
}

/// Where an engine is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Uninitialized,
    Probing,
    Ready,
    Unavailable,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineStatus::Uninitialized => "uninitialized",
            EngineStatus::Probing => "probing",
            EngineStatus::Ready => "ready",
            EngineStatus::Unavailable => "unavailable",
        };
        f.write_str(s)
    }
}

/// Lifecycle state, plus an explanation when we're not ready.
#[derive(Debug)]
struct EngineState {
    status: EngineStatus,
    reason: Option<String>,
}

/// Shared state behind an [`EngineHandle`].
struct EngineInner {
    /// Cached from [`OcrEngine::name`], so we can report it without locking
    /// the engine.
    name: String,

    /// Lifecycle state. Only held for an instant.
    state: Mutex<EngineState>,

    /// The engine. Locked from the async side, and the guard moves into the
    /// blocking call, so a caller that gives up while waiting never runs it.
    engine: Arc<AsyncMutex<Box<dyn OcrEngine>>>,
}

/// A cheaply cloneable handle to the process's single OCR engine.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<EngineInner>,
}

impl EngineHandle {
    /// Wrap an engine. It starts out [`EngineStatus::Uninitialized`].
    pub fn new(engine: impl OcrEngine) -> Self {
        let name = engine.name().to_owned();
        Self {
            inner: Arc::new(EngineInner {
                name,
                state: Mutex::new(EngineState {
                    status: EngineStatus::Uninitialized,
                    reason: None,
                }),
                engine: Arc::new(AsyncMutex::new(Box::new(engine))),
            }),
        }
    }

    /// The engine's human-readable name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Our current lifecycle status.
    pub fn status(&self) -> EngineStatus {
        self.lock_state().status
    }

    /// Probe the engine, moving to [`EngineStatus::Ready`] or
    /// [`EngineStatus::Unavailable`]. Only the first call does any work; later
    /// calls just report the current status.
    #[instrument(level = "debug", skip_all, fields(engine = %self.inner.name))]
    pub async fn initialize(&self) -> EngineStatus {
        {
            let mut state = self.lock_state();
            if state.status != EngineStatus::Uninitialized {
                return state.status;
            }
            state.status = EngineStatus::Probing;
        }

        let engine = self.inner.engine.clone();
        let probe = async move {
            let mut engine = engine.lock_owned().await;
            run_blocking(move || engine.probe()).await
        };
        let result = match time::timeout(PROBE_TIMEOUT, probe).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "engine did not respond within {}",
                HumanDuration(PROBE_TIMEOUT)
            )),
        };

        let mut state = self.lock_state();
        match result {
            Ok(()) => {
                info!(engine = %self.inner.name, "OCR engine is ready");
                state.status = EngineStatus::Ready;
                state.reason = None;
            }
            Err(err) => {
                warn!(engine = %self.inner.name, "OCR engine is unavailable: {:#}", err);
                state.status = EngineStatus::Unavailable;
                state.reason = Some(format!("{:#}", err));
            }
        }
        state.status
    }

    /// Fail fast unless the engine is ready to accept work.
    pub fn check_ready(&self) -> Result<(), OcrError> {
        let state = self.lock_state();
        match state.status {
            EngineStatus::Ready => Ok(()),
            status => Err(OcrError::EngineUnavailable {
                reason: state
                    .reason
                    .clone()
                    .unwrap_or_else(|| format!("{} is {}", self.inner.name, status)),
            }),
        }
    }

    /// Run the engine on `path`, giving up after `deadline`.
    ///
    /// The deadline covers both waiting for our turn at the engine and the
    /// call itself. If it expires while we're still waiting, the engine is
    /// never called. A call that has already started can't be interrupted. It
    /// keeps running on the blocking thread pool, holding the engine lock,
    /// and its output is discarded when it finishes.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn extract_text(&self, path: &Path, deadline: Duration) -> Result<String, OcrError> {
        let engine = self.inner.engine.clone();
        let name = self.inner.name.clone();
        let owned_path = path.to_owned();
        let call = async move {
            let mut engine = engine.lock_owned().await;
            trace!("acquired OCR engine");
            run_blocking(move || {
                engine
                    .extract_text(&owned_path)
                    .with_context(|| format!("{} could not read {:?}", name, owned_path))
            })
            .await
        };

        match time::timeout(deadline, call).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(err)) => Err(OcrError::EngineExecution(err)),
            Err(_) => {
                warn!(
                    deadline = %HumanDuration(deadline),
                    "OCR engine call timed out; it will finish in the background"
                );
                Err(OcrError::ProcessingTimeout { waited: deadline })
            }
        }
    }

    /// Lock our lifecycle state.
    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

/// Command-line options for choosing and configuring the OCR engine.
#[derive(Args, Clone, Debug)]
pub struct EngineOpts {
    /// The `tesseract` command to run. Tesseract must already be installed;
    /// we don't go looking for it.
    #[clap(long = "tesseract", env = "TESSERACT_CMD", default_value = "tesseract")]
    pub tesseract_command: PathBuf,

    /// Tesseract language(s) to use, like "eng" or "eng+ind".
    #[clap(long = "lang", env = "TESSERACT_LANG")]
    pub language: Option<String>,
}

impl EngineOpts {
    /// Create an engine handle. The engine still needs to be initialized.
    pub fn create_engine(&self) -> EngineHandle {
        EngineHandle::new(TesseractEngine::new(
            self.tesseract_command.clone(),
            self.language.clone(),
        ))
    }
}
