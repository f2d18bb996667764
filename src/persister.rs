//! Stream persister: drains a [`FrameSource`] into a [`FrameSink`].
//!
//! ```text
//! Idle -> Running -> Finalizing -> Stopped
//!                              \-> Failed
//! ```
//!
//! One loop iteration is one bounded receive followed by a cast and a write. The stop
//! flag in the status block is polled once per iteration, so shutdown latency is at
//! most one receive timeout. The sink is finalized exactly once on every exit path.
//!
//! Frames the bus drops under overload never reach this loop; they only show up as
//! gaps in the frame ids, counted in `frames_skipped`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::data::status::{SharedStatus, StatusSnapshot, WorkerState};
use crate::error::{StreamError, StreamResult};
use crate::frame::{Image, PixelType};
use crate::logging::RateLimiter;
use crate::transport::FrameSource;

/// Append-only destination for frames.
pub trait FrameSink {
    /// Pixel type frames are cast to before [`FrameSink::write`].
    fn dtype(&self) -> PixelType;

    /// Append one frame.
    fn write(&mut self, image: &Image, frame_id: i64) -> StreamResult<()>;

    /// Make the written data complete for readers. Must tolerate repeated calls.
    fn finalize(&mut self) -> StreamResult<()>;
}

#[cfg(feature = "storage_hdf5")]
impl FrameSink for crate::data::hdf5_store::FrameStore {
    fn dtype(&self) -> PixelType {
        crate::data::hdf5_store::FrameStore::dtype(self)
    }

    fn write(&mut self, image: &Image, frame_id: i64) -> StreamResult<()> {
        crate::data::hdf5_store::FrameStore::write(self, image, frame_id)
    }

    fn finalize(&mut self) -> StreamResult<()> {
        self.close()
    }
}

/// Persister lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersisterState {
    Idle,
    Running,
    Finalizing,
    Stopped,
    Failed,
}

impl From<PersisterState> for WorkerState {
    fn from(state: PersisterState) -> Self {
        match state {
            PersisterState::Idle => WorkerState::Idle,
            PersisterState::Running => WorkerState::Running,
            PersisterState::Finalizing => WorkerState::Finalizing,
            PersisterState::Stopped => WorkerState::Stopped,
            PersisterState::Failed => WorkerState::Failed,
        }
    }
}

/// Why the receive loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stop flag was set
    Requested,
    /// No frame arrived within `idle_timeout`
    Idle,
}

/// Final counters of one persister run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersisterSummary {
    pub reason: StopReason,
    pub status: StatusSnapshot,
}

/// Drains a frame source into a sink until stopped.
pub struct Persister<K: FrameSink> {
    sink: K,
    status: Arc<SharedStatus>,
    idle_timeout: Option<Duration>,
    state: PersisterState,
    decode_warnings: RateLimiter,
}

impl<K: FrameSink> std::fmt::Debug for Persister<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister")
            .field("state", &self.state)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl<K: FrameSink> Persister<K> {
    pub fn new(sink: K, status: Arc<SharedStatus>, idle_timeout: Option<Duration>) -> Self {
        Self {
            sink,
            status,
            idle_timeout,
            state: PersisterState::Idle,
            decode_warnings: RateLimiter::new(100),
        }
    }

    pub fn state(&self) -> PersisterState {
        self.state
    }

    pub fn status(&self) -> &SharedStatus {
        &self.status
    }

    /// Consume the persister, returning the sink.
    pub fn into_sink(self) -> K {
        self.sink
    }

    fn set_state(&mut self, state: PersisterState) {
        self.state = state;
        self.status.set_state(state.into());
    }

    /// Run until stopped, idle, or a fatal error. Finalizes the sink in every case.
    ///
    /// Fatal errors are also published to the status block's error slot.
    pub fn run<S: FrameSource + ?Sized>(&mut self, source: &mut S) -> StreamResult<PersisterSummary> {
        self.set_state(PersisterState::Running);
        info!(dtype = %self.sink.dtype(), idle_timeout = ?self.idle_timeout, "Persister running");
        let drained = self.drain(source);

        self.set_state(PersisterState::Finalizing);
        let finalized = self.sink.finalize();

        let result = match (drained, finalized) {
            (Ok(reason), Ok(())) => Ok(reason),
            (Err(e), finalized) => {
                if let Err(close_err) = finalized {
                    error!(error = %close_err, "Finalize after failure also failed");
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
        };

        match result {
            Ok(reason) => {
                self.set_state(PersisterState::Stopped);
                let status = self.status.snapshot();
                info!(
                    ?reason,
                    frames_written = status.frames_written,
                    decode_failures = status.decode_failures,
                    frames_skipped = status.frames_skipped,
                    "Persister stopped"
                );
                Ok(PersisterSummary { reason, status })
            }
            Err(e) => {
                error!(error = %e, frames_written = self.status.frames_written(), "Persister failed");
                self.status.set_error(&e.to_string());
                self.set_state(PersisterState::Failed);
                Err(e)
            }
        }
    }

    fn drain<S: FrameSource + ?Sized>(&mut self, source: &mut S) -> StreamResult<StopReason> {
        let mut last_frame = Instant::now();
        loop {
            if self.status.stop_requested() {
                return Ok(StopReason::Requested);
            }
            if let Some(timeout) = self.idle_timeout {
                if last_frame.elapsed() >= timeout {
                    info!(?timeout, "No frame within idle timeout");
                    return Ok(StopReason::Idle);
                }
            }

            match source.next_frame() {
                Ok(Some(frame)) => {
                    self.status.record_frame_id(frame.frame_id);
                    let image = frame.image.cast(self.sink.dtype());
                    match self.sink.write(&image, frame.frame_id) {
                        Ok(()) => {
                            self.status.record_written();
                            last_frame = Instant::now();
                            debug!(frame_id = frame.frame_id, "Frame written");
                        }
                        Err(e) if e.is_recoverable() => self.on_decode_failure(&e),
                        Err(e) => return Err(e),
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_recoverable() => self.on_decode_failure(&e),
                Err(e) => return Err(e),
            }
        }
    }

    fn on_decode_failure(&mut self, err: &StreamError) {
        let failures = self.status.record_decode_failure();
        if self.decode_warnings.hit() {
            warn!(error = %err, failures, "Dropping undecodable message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DecodeError;
    use crate::frame::Frame;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MemorySink {
        frames: Vec<(Image, i64)>,
        finalized: usize,
        fail_after: Option<usize>,
    }

    impl FrameSink for MemorySink {
        fn dtype(&self) -> PixelType {
            PixelType::U16
        }

        fn write(&mut self, image: &Image, frame_id: i64) -> StreamResult<()> {
            if image.shape() != (2, 2) {
                return Err(StreamError::Shape {
                    expected: (2, 2),
                    actual: image.shape(),
                });
            }
            if self.fail_after == Some(self.frames.len()) {
                return Err(StreamError::StoreLayout("disk full".into()));
            }
            self.frames.push((image.clone(), frame_id));
            Ok(())
        }

        fn finalize(&mut self) -> StreamResult<()> {
            self.finalized += 1;
            Ok(())
        }
    }

    struct ScriptedSource(VecDeque<StreamResult<Option<Frame>>>);

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> StreamResult<Option<Frame>> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    fn frame(id: i64, rows: usize) -> StreamResult<Option<Frame>> {
        let image = Image::from_vec(rows, 2, vec![1.9f32; rows * 2]).unwrap();
        Ok(Some(Frame::new(image, id)))
    }

    #[test]
    fn test_undecodable_stream_counts_as_idle() {
        struct GarbageSource;

        impl FrameSource for GarbageSource {
            fn next_frame(&mut self) -> StreamResult<Option<Frame>> {
                std::thread::sleep(Duration::from_millis(1));
                Err(DecodeError::ExpectedByteString.into())
            }
        }

        let status = Arc::new(SharedStatus::anonymous().unwrap());
        let mut persister = Persister::new(MemorySink::default(), status.clone(), Some(Duration::from_millis(20)));
        let summary = persister.run(&mut GarbageSource).unwrap();
        assert_eq!(summary.reason, StopReason::Idle);
        assert_eq!(summary.status.frames_written, 0);
        assert!(summary.status.decode_failures > 0);
    }

    #[test]
    fn test_writes_cast_frames_until_idle() {
        let status = Arc::new(SharedStatus::anonymous().unwrap());
        let mut source = ScriptedSource(VecDeque::from(vec![
            frame(1, 2),
            Ok(None),
            frame(2, 2),
            Err(DecodeError::ExpectedByteString.into()),
            frame(3, 3),
            frame(5, 2),
        ]));

        let mut persister = Persister::new(MemorySink::default(), status.clone(), Some(Duration::from_millis(20)));
        let summary = persister.run(&mut source).unwrap();

        assert_eq!(summary.reason, StopReason::Idle);
        assert_eq!(summary.status.frames_written, 3);
        assert_eq!(summary.status.decode_failures, 2);
        assert_eq!(summary.status.frames_skipped, 1);
        assert_eq!(summary.status.state, WorkerState::Stopped);

        let sink = persister.into_sink();
        assert_eq!(sink.finalized, 1);
        assert_eq!(sink.frames.iter().map(|(_, id)| *id).collect::<Vec<_>>(), vec![1, 2, 5]);
        assert_eq!(sink.frames[0].0.as_slice::<u16>().unwrap(), &[1, 1, 1, 1]);
    }

    #[test]
    fn test_stop_flag_ends_loop() {
        let status = Arc::new(SharedStatus::anonymous().unwrap());
        status.request_stop();
        let mut source = ScriptedSource(VecDeque::from(vec![frame(1, 2)]));
        let mut persister = Persister::new(MemorySink::default(), status, None);
        let summary = persister.run(&mut source).unwrap();
        assert_eq!(summary.reason, StopReason::Requested);
        assert_eq!(persister.into_sink().finalized, 1);
    }

    #[test]
    fn test_store_error_still_finalizes() {
        let status = Arc::new(SharedStatus::anonymous().unwrap());
        let mut source = ScriptedSource(VecDeque::from(vec![frame(1, 2), frame(2, 2)]));
        let sink = MemorySink {
            fail_after: Some(1),
            ..Default::default()
        };
        let mut persister = Persister::new(sink, status.clone(), None);

        assert!(matches!(persister.run(&mut source), Err(StreamError::StoreLayout(_))));
        assert_eq!(persister.state(), PersisterState::Failed);
        assert_eq!(status.state(), WorkerState::Failed);
        assert_eq!(status.error().as_deref(), Some("Store error: disk full"));
        assert_eq!(persister.into_sink().finalized, 1);
    }
}
