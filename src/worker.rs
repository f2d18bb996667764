//! Worker processes and their controllers.
//!
//! The persister and the accumulator each run as a separate OS process, started as
//! `<program> worker <persist|accumulate> --config <file> --status <file>`. The
//! controller writes the configuration and creates the status block in a private
//! temporary directory, then only talks to the worker through that block: it sets
//! the stop flag and polls counters, state and the error slot. No error crosses the
//! process boundary any other way.
//!
//! [`run_persist`] and [`run_accumulate`] are the worker bodies; the CLI also calls
//! them directly for foreground runs.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::accumulator::{AccumulationOutcome, AccumulationResult, Accumulator};
use crate::config::StreamConfig;
use crate::data::status::{SharedStatus, StatusSnapshot, WorkerState};
use crate::error::{StreamError, StreamResult};
use crate::persister::PersisterSummary;
use crate::transport::FrameTransport;

/// Which worker body a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Persist,
    Accumulate,
}

impl WorkerKind {
    /// Subcommand name on the worker command line.
    pub fn as_arg(self) -> &'static str {
        match self {
            WorkerKind::Persist => "persist",
            WorkerKind::Accumulate => "accumulate",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_arg())
    }
}

/// A spawned worker process.
pub struct WorkerHandle {
    kind: WorkerKind,
    child: Child,
    status: SharedStatus,
    // keeps the config and status files alive until the handle is dropped
    _dir: tempfile::TempDir,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("kind", &self.kind)
            .field("pid", &self.child.id())
            .field("status", &self.status)
            .finish()
    }
}

impl WorkerHandle {
    /// Launch `program worker <kind>` with `config`.
    pub fn spawn<P: AsRef<OsStr>>(kind: WorkerKind, config: &StreamConfig, program: P) -> StreamResult<Self> {
        let dir = tempfile::Builder::new().prefix("detstream-worker-").tempdir()?;
        let config_path = dir.path().join("config.toml");
        let status_path = dir.path().join("status");

        std::fs::write(&config_path, config.to_toml_string()?)?;
        let status = SharedStatus::create(&status_path)?;

        let child = Command::new(program)
            .arg("worker")
            .arg(kind.as_arg())
            .arg("--config")
            .arg(&config_path)
            .arg("--status")
            .arg(&status_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        info!(%kind, pid = ?child.id(), "Worker spawned");
        Ok(Self {
            kind,
            child,
            status,
            _dir: dir,
        })
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// OS process id, while the process has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Set the stop flag. The worker exits within one receive timeout.
    pub fn request_stop(&self) {
        self.status.request_stop();
    }

    /// Current counters and state as published by the worker.
    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Whether the process is still alive.
    pub fn is_running(&mut self) -> StreamResult<bool> {
        Ok(self.child.try_wait()?.is_none())
    }

    /// Wait for the process to exit. Returns `None` if `timeout` elapses first.
    pub async fn wait(&mut self, timeout: Duration) -> StreamResult<Option<ExitStatus>> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(exit) => Ok(Some(exit?)),
            Err(_) => Ok(None),
        }
    }

    /// Request a stop and join the process, killing it if it does not exit in time.
    pub async fn stop(&mut self, timeout: Duration) -> StreamResult<ExitStatus> {
        self.request_stop();
        if let Some(exit) = self.wait(timeout).await? {
            return Ok(exit);
        }

        warn!(kind = %self.kind, ?timeout, "Worker ignored stop request, killing");
        self.child.kill().await?;
        Ok(self.child.wait().await?)
    }
}

/// Starts and stops a persister process.
#[derive(Debug)]
pub struct PersisterController {
    config: StreamConfig,
    program: PathBuf,
    worker: Option<WorkerHandle>,
}

impl PersisterController {
    pub fn new(config: StreamConfig, program: impl Into<PathBuf>) -> Self {
        Self {
            config,
            program: program.into(),
            worker: None,
        }
    }

    /// Spawn the persister. A no-op (with a warning) while one is running.
    pub fn start(&mut self) -> StreamResult<()> {
        if let Some(worker) = self.worker.as_mut() {
            if worker.is_running()? {
                warn!("Persister already running, start ignored");
                return Ok(());
            }
        }
        self.worker = Some(WorkerHandle::spawn(WorkerKind::Persist, &self.config, &self.program)?);
        Ok(())
    }

    pub fn is_running(&mut self) -> StreamResult<bool> {
        match self.worker.as_mut() {
            Some(worker) => worker.is_running(),
            None => Ok(false),
        }
    }

    pub fn status(&self) -> Option<StatusSnapshot> {
        self.worker.as_ref().map(WorkerHandle::status)
    }

    /// Stop and join the persister, returning its final status.
    ///
    /// A failure reported through the status block becomes [`StreamError::Worker`].
    pub async fn stop(&mut self, timeout: Duration) -> StreamResult<Option<StatusSnapshot>> {
        let Some(mut worker) = self.worker.take() else {
            return Ok(None);
        };
        let exit = worker.stop(timeout).await?;
        let status = worker.status();
        info!(?exit, frames_written = status.frames_written, "Persister joined");

        if let Some(error) = &status.error {
            return Err(StreamError::Worker(error.clone()));
        }
        if !exit.success() {
            return Err(StreamError::Worker(format!("persister exited with {exit}")));
        }
        Ok(Some(status))
    }
}

/// What an accumulator process produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulationReport {
    pub outcome: AccumulationOutcome,
    pub frames: u64,
    pub output: PathBuf,
}

/// Runs accumulator processes to completion.
#[derive(Debug, Clone)]
pub struct AccumulatorController {
    config: StreamConfig,
    program: PathBuf,
}

impl AccumulatorController {
    pub fn new(config: StreamConfig, program: impl Into<PathBuf>) -> Self {
        Self {
            config,
            program: program.into(),
        }
    }

    /// Spawn an accumulator and wait for its result.
    ///
    /// If the process is still running after `timeout` it is stopped, which yields a
    /// partial sum.
    pub async fn accumulate(&self, timeout: Duration) -> StreamResult<AccumulationReport> {
        let mut worker = WorkerHandle::spawn(WorkerKind::Accumulate, &self.config, &self.program)?;
        let exit = match worker.wait(timeout).await? {
            Some(exit) => exit,
            None => {
                warn!(?timeout, "Accumulator still running, stopping");
                worker.stop(Duration::from_secs(5)).await?
            }
        };

        let status = worker.status();
        if let Some(error) = status.error {
            return Err(StreamError::Worker(error));
        }
        if !exit.success() {
            return Err(StreamError::Worker(format!("accumulator exited with {exit}")));
        }
        let outcome = status
            .outcome
            .ok_or_else(|| StreamError::Worker(format!("accumulator exited in state {:?}", status.state)))?;

        Ok(AccumulationReport {
            outcome,
            frames: status.frames_written,
            output: self.config.accumulator.output.clone(),
        })
    }
}

/// Persister body: subscriber in, HDF5 store out.
pub fn run_persist(config: &StreamConfig, status: Arc<SharedStatus>) -> StreamResult<PersisterSummary> {
    #[cfg(feature = "storage_hdf5")]
    {
        use crate::data::hdf5_store::FrameStore;
        use crate::persister::Persister;

        let store = FrameStore::create(&config.store.output, &config.frame, &config.store)?;
        let mut transport = FrameTransport::connect(config)?;
        let mut persister = Persister::new(store, status, config.persister.idle_timeout);
        persister.run(&mut transport)
    }

    #[cfg(not(feature = "storage_hdf5"))]
    {
        let _ = (config, status);
        Err(StreamError::FeatureNotEnabled("storage_hdf5".into()))
    }
}

/// Accumulator body: sums frames and writes the result to `[accumulator] output`.
pub fn run_accumulate(config: &StreamConfig, status: Arc<SharedStatus>) -> StreamResult<AccumulationResult> {
    if !cfg!(feature = "storage_hdf5") {
        return Err(StreamError::FeatureNotEnabled("storage_hdf5".into()));
    }

    let output = config.accumulator.output.clone();
    let mut transport = FrameTransport::connect(config)?;
    let mut accumulator = Accumulator::new(config, status);
    accumulator.run(&mut transport, |result| save_accumulated(&output, result))
}

#[cfg(feature = "storage_hdf5")]
fn save_accumulated(path: &Path, result: &AccumulationResult) -> StreamResult<()> {
    crate::data::hdf5_store::write_summed_image(path, &result.image, result.frames, result.is_complete())?;
    info!(path = %path.display(), frames = result.frames, "Saved accumulated image");
    Ok(())
}

#[cfg(not(feature = "storage_hdf5"))]
fn save_accumulated(_path: &Path, _result: &AccumulationResult) -> StreamResult<()> {
    Err(StreamError::FeatureNotEnabled("storage_hdf5".into()))
}

/// Entry point of `detstream worker <kind>`. Returns the process exit code.
///
/// Every failure, including ones before the loop starts and panics inside the body,
/// is published to the status block before returning.
pub fn serve(kind: WorkerKind, config_path: &Path, status_path: &Path) -> StreamResult<i32> {
    let status = Arc::new(SharedStatus::open(status_path)?);

    let body_status = status.clone();
    Ok(run_reporting(&status, move || {
        let config = StreamConfig::load_from(config_path)?;
        config.validate()?;
        match kind {
            WorkerKind::Persist => run_persist(&config, body_status).map(|_| ()),
            WorkerKind::Accumulate => run_accumulate(&config, body_status).map(|_| ()),
        }
    }))
}

/// Run `body`, publishing an error or panic to `status`. Returns the exit code.
fn run_reporting<F>(status: &SharedStatus, body: F) -> i32
where
    F: FnOnce() -> StreamResult<()>,
{
    let message = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(body)) {
        Ok(Ok(())) => return 0,
        Ok(Err(e)) => e.to_string(),
        Err(payload) => format!("worker panicked: {}", panic_message(payload.as_ref())),
    };
    error!(error = %message, "Worker failed");
    status.set_error(&message);
    status.set_state(WorkerState::Failed);
    1
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_kind_args() {
        assert_eq!(WorkerKind::Persist.as_arg(), "persist");
        assert_eq!(WorkerKind::Accumulate.to_string(), "accumulate");
    }

    #[test]
    fn test_serve_reports_bad_config_through_status() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        let status_path = dir.path().join("status");
        std::fs::write(&config_path, "[frame]\nrows = 0\n").unwrap();
        let status = SharedStatus::create(&status_path).unwrap();

        let code = serve(WorkerKind::Persist, &config_path, &status_path).unwrap();
        assert_eq!(code, 1);
        assert_eq!(status.state(), WorkerState::Failed);
        assert!(status.error().unwrap().contains("Invalid frame shape"));
    }

    #[test]
    fn test_panic_in_body_is_published() {
        let status = SharedStatus::anonymous().unwrap();
        status.set_state(WorkerState::Running);

        let code = run_reporting(&status, || -> StreamResult<()> { panic!("store handle poisoned") });
        assert_eq!(code, 1);
        assert_eq!(status.state(), WorkerState::Failed);
        let error = status.error().unwrap();
        assert!(error.contains("panicked"), "{error}");
        assert!(error.contains("store handle poisoned"), "{error}");
    }

    #[test]
    fn test_clean_body_exits_zero() {
        let status = SharedStatus::anonymous().unwrap();
        assert_eq!(run_reporting(&status, || Ok(())), 0);
        assert!(status.error().is_none());
    }

    // `false` exits non-zero without ever touching the status block
    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_nonzero_exit_is_worker_error() {
        let mut controller = PersisterController::new(StreamConfig::default(), "false");
        controller.start().unwrap();
        let err = controller.stop(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, StreamError::Worker(ref msg) if msg.contains("exited")), "{err}");

        let accumulator = AccumulatorController::new(StreamConfig::default(), "false");
        let err = accumulator.accumulate(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, StreamError::Worker(ref msg) if msg.contains("exited")), "{err}");
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let err = WorkerHandle::spawn(
            WorkerKind::Persist,
            &StreamConfig::default(),
            "/nonexistent/detstream-binary",
        )
        .unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
    }
}
