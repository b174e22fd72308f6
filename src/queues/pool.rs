//! A fixed pool of OCR workers.
//!
//! Each worker pulls one job at a time from the shared [`JobReceiver`], writes
//! the image to a temporary file, runs the engine on it, and sends exactly one
//! result back to whoever submitted the job. Several jobs can be in flight at
//! once (writing files, waiting for the engine), but the [`EngineHandle`]
//! makes sure only one engine call runs at a time.

use std::{
    io::Write as _,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::{
    async_utils::{JoinWorker, run_blocking},
    config::PoolConfig,
    engines::EngineHandle,
    prelude::*,
};

use super::{
    job::{JobResult, OcrError, normalize_text},
    queue::JobReceiver,
};

/// Longest sanitized source name we'll put in a temporary file name.
const MAX_NAME_LEN: usize = 64;

/// Everything a worker needs to process a job.
struct WorkerContext {
    engine: EngineHandle,
    engine_call_timeout: Duration,
    temp_dir: PathBuf,
}

/// The worker pool.
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.worker_count` workers reading from `jobs`.
    ///
    /// Workers run until every sender for `jobs` has been dropped and the
    /// queue has drained. The returned [`JoinWorker`] waits for all of them.
    pub fn spawn(config: &PoolConfig, engine: EngineHandle, jobs: JobReceiver) -> JoinWorker {
        let ctx = Arc::new(WorkerContext {
            engine,
            engine_call_timeout: config.engine_call_timeout,
            temp_dir: config.temp_dir(),
        });
        let handles = (0..config.worker_count)
            .map(|worker_idx| {
                let ctx = ctx.clone();
                let jobs = jobs.clone();
                tokio::spawn(run_worker(worker_idx, ctx, jobs))
            })
            .collect::<Vec<_>>();
        info!(workers = config.worker_count, "OCR worker pool started");
        JoinWorker::from_handles(handles)
    }
}

/// The main loop of a single worker.
#[instrument(level = "debug", name = "worker", skip(ctx, jobs))]
async fn run_worker(worker_idx: usize, ctx: Arc<WorkerContext>, jobs: JobReceiver) -> Result<()> {
    while let Some(mut job) = jobs.dequeue().await {
        // The worker owns the bytes from here on, and hands them to the temp
        // file writer without copying.
        let payload = std::mem::take(&mut job.payload);
        let result = process_job(&ctx, job.id, &job.source_name, payload).await;
        job.respond(result);
    }
    debug!("job queue closed, worker exiting");
    Ok(())
}

/// Process a single job, always producing a result.
#[instrument(level = "debug", skip(ctx, payload), fields(bytes = payload.len()))]
async fn process_job(
    ctx: &WorkerContext,
    job_id: Uuid,
    source_name: &str,
    payload: Vec<u8>,
) -> JobResult {
    let started = Instant::now();

    let artifact = TempArtifact::write(&ctx.temp_dir, source_name, payload)
        .await
        .map_err(|err| {
            warn!("could not write temporary image: {:#}", err);
            OcrError::TempFile(err)
        })?;

    let raw = ctx
        .engine
        .extract_text(artifact.path(), ctx.engine_call_timeout)
        .await;

    // Clean up before looking at the result, so every path removes the file.
    artifact.remove();

    match raw {
        Ok(raw) => {
            let text = normalize_text(&raw);
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                chars = text.chars().count(),
                "OCR job completed"
            );
            Ok(text)
        }
        Err(err) => {
            warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                kind = %err.kind(),
                "OCR job failed: {}",
                err
            );
            Err(err)
        }
    }
}

/// A temporary copy of an uploaded image.
///
/// The file is deleted exactly once: either by [`TempArtifact::remove`], which
/// consumes the artifact, or by [`NamedTempFile`]'s destructor if we unwind
/// before getting there.
struct TempArtifact {
    file: NamedTempFile,
}

impl TempArtifact {
    /// Write `payload` to a new, uniquely named file in `dir`.
    ///
    /// The name combines a nanosecond timestamp, some random characters, and
    /// the sanitized original name, keeping the original extension so that
    /// engines can recognize the format.
    async fn write(dir: &Path, source_name: &str, payload: Vec<u8>) -> Result<Self> {
        let dir = dir.to_owned();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let prefix = format!("ocr_{}_", nanos);
        let suffix = format!("_{}", sanitize_file_name(source_name));
        let file = run_blocking(move || {
            let mut file = tempfile::Builder::new()
                .prefix(&prefix)
                .suffix(&suffix)
                .tempfile_in(&dir)
                .with_context(|| format!("cannot create temporary file in {:?}", dir))?;
            file.write_all(&payload)
                .context("cannot write temporary image file")?;
            file.flush().context("cannot flush temporary image file")?;
            Ok(file)
        })
        .await?;
        trace!(path = %file.path().display(), "wrote temporary image");
        Ok(Self { file })
    }

    /// The path to pass to the engine.
    fn path(&self) -> &Path {
        self.file.path()
    }

    /// Delete the file. Failures are logged, never returned.
    fn remove(self) {
        let path = self.file.path().to_owned();
        if let Err(err) = self.file.close() {
            warn!(path = %path.display(), "failed to remove temporary file: {}", err);
        }
    }
}

/// Reduce an uploaded file name to something safe to embed in a path.
fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let cleaned = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    // Keep the tail, which holds the extension.
    let skip = cleaned.chars().count().saturating_sub(MAX_NAME_LEN);
    cleaned.chars().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::atomic::Ordering};

    use futures::future::join_all;

    use super::*;
    use crate::{
        engines::stub::StubEngine,
        queues::{
            job::{ErrorKind, Job, NO_TEXT_DETECTED},
            queue::job_queue,
        },
    };

    /// A running pool, with the things tests need to poke at.
    struct TestPool {
        jobs: crate::queues::queue::JobSender,
        worker: JoinWorker,
        temp_dir: tempfile::TempDir,
    }

    impl TestPool {
        async fn start(engine: StubEngine, worker_count: usize, engine_call_timeout: Duration) -> Self {
            let temp_dir = tempfile::TempDir::with_prefix("ocr-simple-pool").unwrap();
            let config = PoolConfig {
                worker_count,
                queue_capacity: 10,
                engine_call_timeout,
                temp_dir: Some(temp_dir.path().to_owned()),
                ..PoolConfig::default()
            };
            let engine = EngineHandle::new(engine);
            engine.initialize().await;
            let (jobs, rx) = job_queue(config.queue_capacity);
            let worker = WorkerPool::spawn(&config, engine, rx);
            Self {
                jobs,
                worker,
                temp_dir,
            }
        }

        async fn run(&self, payload: &[u8], name: &str) -> JobResult {
            let (job, rx) = Job::new(payload.to_vec(), name.to_owned());
            self.jobs.enqueue(job, Duration::from_secs(5)).await.unwrap();
            rx.await.expect("worker dropped job without responding")
        }

        fn leftover_files(&self) -> usize {
            fs::read_dir(self.temp_dir.path()).unwrap().count()
        }

        async fn shutdown(self) {
            drop(self.jobs);
            self.worker.join().await.unwrap();
        }
    }

    #[test]
    fn sanitizes_file_names() {
        assert_eq!(sanitize_file_name("photo.png"), "photo.png");
        assert_eq!(sanitize_file_name("../../etc/passwd.png"), "passwd.png");
        assert_eq!(sanitize_file_name("my scan (1).JPG"), "my_scan__1_.JPG");
        let long = format!("{}.png", "a".repeat(200));
        let cleaned = sanitize_file_name(&long);
        assert_eq!(cleaned.len(), MAX_NAME_LEN);
        assert!(cleaned.ends_with(".png"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn successful_job_returns_normalized_text() {
        let pool = TestPool::start(StubEngine::returning("  hello world \n"), 1, Duration::from_secs(5)).await;
        let text = pool.run(b"png", "a.png").await.unwrap();
        assert_eq!(text, "hello world");
        assert_eq!(pool.leftover_files(), 0);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn empty_text_becomes_sentinel() {
        let pool = TestPool::start(StubEngine::returning(""), 1, Duration::from_secs(5)).await;
        let text = pool.run(b"png", "a.png").await.unwrap();
        assert_eq!(text, NO_TEXT_DETECTED);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn engine_error_is_reported_and_temp_file_removed() {
        let stub = StubEngine::failing("unreadable image");
        let stats = stub.stats();
        let pool = TestPool::start(stub, 1, Duration::from_secs(5)).await;

        let err = pool.run(b"png", "a.png").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineExecutionError);

        let paths = stats.paths();
        assert_eq!(paths.len(), 1);
        assert!(!paths[0].exists());
        assert_eq!(pool.leftover_files(), 0);

        // The worker keeps going after a failure.
        let err = pool.run(b"png", "b.png").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineExecutionError);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn engine_timeout_is_reported_and_temp_file_removed() {
        let stub = StubEngine::returning("late").with_delay(Duration::from_millis(500));
        let stats = stub.stats();
        let pool = TestPool::start(stub, 1, Duration::from_millis(100)).await;

        let err = pool.run(b"png", "a.png").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessingTimeout);
        let paths = stats.paths();
        assert_eq!(paths.len(), 1);
        assert!(!paths[0].exists());

        // Let the abandoned call finish; nothing else should happen to the file.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!paths[0].exists());
        assert_eq!(pool.leftover_files(), 0);
        assert_eq!(stats.in_flight.load(Ordering::SeqCst), 0);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn engine_panic_does_not_kill_worker() {
        let pool = TestPool::start(StubEngine::panicking(), 1, Duration::from_secs(5)).await;
        for name in ["a.png", "b.png"] {
            let err = pool.run(b"png", name).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::EngineExecutionError);
        }
        assert_eq!(pool.leftover_files(), 0);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn engine_calls_never_overlap() {
        let stub = StubEngine::echo().with_delay(Duration::from_millis(20));
        let stats = stub.stats();
        let pool = TestPool::start(stub, 3, Duration::from_secs(5)).await;

        let results = join_all((0..10).map(|i| {
            let payload = format!("page {i}");
            let pool = &pool;
            async move { (payload.clone(), pool.run(payload.as_bytes(), "p.png").await) }
        }))
        .await;

        for (payload, result) in results {
            assert_eq!(result.unwrap(), payload);
        }
        assert_eq!(stats.calls.load(Ordering::SeqCst), 10);
        assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(pool.leftover_files(), 0);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_jobs_get_distinct_temp_files() {
        let stub = StubEngine::echo();
        let stats = stub.stats();
        let pool = TestPool::start(stub, 3, Duration::from_secs(5)).await;

        join_all((0..6).map(|_| pool.run(b"same", "same.png"))).await;

        let mut paths = stats.paths();
        assert_eq!(paths.len(), 6);
        assert!(paths.iter().all(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("ocr_") && n.ends_with("_same.png"))
        }));
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 6);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn unwritable_temp_dir_is_a_temp_file_error() {
        let stub = StubEngine::returning("never");
        let stats = stub.stats();
        let config = PoolConfig {
            worker_count: 1,
            temp_dir: Some(PathBuf::from("/nonexistent/ocr-simple/tmp")),
            ..PoolConfig::default()
        };
        let engine = EngineHandle::new(stub);
        engine.initialize().await;
        let (jobs, rx) = job_queue(config.queue_capacity);
        let worker = WorkerPool::spawn(&config, engine, rx);

        let (job, reply) = Job::new(b"png".to_vec(), "a.png".to_owned());
        jobs.enqueue(job, Duration::from_secs(1)).await.unwrap();
        let err = reply.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TempFileError);
        assert_eq!(stats.calls.load(Ordering::SeqCst), 0);

        drop(jobs);
        worker.join().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn jobs_that_time_out_waiting_for_engine_never_call_it() {
        let stub = StubEngine::returning("slow").with_delay(Duration::from_millis(300));
        let stats = stub.stats();
        let pool = TestPool::start(stub, 1, Duration::from_millis(50)).await;

        let results = join_all((0..4).map(|i| {
            let pool = &pool;
            async move { pool.run(b"png", &format!("{i}.png")).await }
        }))
        .await;
        for result in results {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::ProcessingTimeout);
        }

        // Only the first job ever reached the engine. The rest gave up while
        // waiting for it, and must not run later on their deleted files.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(stats.calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.paths().len(), 1);
        assert_eq!(pool.leftover_files(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn temp_artifact_holds_payload_bytes() {
        let dir = tempfile::TempDir::with_prefix("ocr-simple-pool").unwrap();
        let payload = b"raw image bytes".to_vec();
        let artifact = TempArtifact::write(dir.path(), "scan.png", payload)
            .await
            .unwrap();
        assert_eq!(fs::read(artifact.path()).unwrap(), b"raw image bytes");
        let path = artifact.path().to_owned();
        artifact.remove();
        assert!(!path.exists());
    }
}
