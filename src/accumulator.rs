//! Frame accumulator: sums a bounded number of frames into one image.
//!
//! ```text
//! Idle -> Accumulating -> (count reached | stall | stop) -> Saving -> Done
//!                                                                  \-> Failed
//! ```
//!
//! Integer frames are summed in `i64`, float frames in `f64`; a float frame arriving
//! into an integer sum promotes it. If no frame arrives within the idle window the
//! loop ends early and the result is marked [`AccumulationOutcome::Partial`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{AccumulatorConfig, StreamConfig};
use crate::data::status::{SharedStatus, WorkerState};
use crate::error::{StreamError, StreamResult};
use crate::frame::{with_pixels, Image, PixelType, Pixels};
use crate::logging::RateLimiter;
use crate::transport::FrameSource;

/// Whether the requested number of frames was summed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulationOutcome {
    Complete,
    Partial,
}

/// Accumulator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulatorState {
    Idle,
    Accumulating,
    Saving,
    Done,
    Failed,
}

impl From<AccumulatorState> for WorkerState {
    fn from(state: AccumulatorState) -> Self {
        match state {
            AccumulatorState::Idle => WorkerState::Idle,
            AccumulatorState::Accumulating => WorkerState::Running,
            AccumulatorState::Saving => WorkerState::Finalizing,
            AccumulatorState::Done => WorkerState::Stopped,
            AccumulatorState::Failed => WorkerState::Failed,
        }
    }
}

/// Wide running sum.
#[derive(Debug, Clone, PartialEq)]
pub enum SumBuffer {
    Int(Vec<i64>),
    Float(Vec<f64>),
}

impl SumBuffer {
    pub fn new(len: usize) -> Self {
        SumBuffer::Int(vec![0; len])
    }

    fn promote(&mut self) {
        if let SumBuffer::Int(sum) = self {
            *self = SumBuffer::Float(sum.iter().map(|&x| x as f64).collect());
        }
    }

    /// Add pixels elementwise. The caller guarantees matching lengths.
    pub fn add(&mut self, pixels: &Pixels) {
        if pixels.dtype().is_float() {
            self.promote();
        }
        match self {
            SumBuffer::Int(sum) => with_pixels!(pixels, v => {
                for (s, &x) in sum.iter_mut().zip(v.iter()) {
                    *s = s.wrapping_add(x as i64);
                }
            }),
            SumBuffer::Float(sum) => with_pixels!(pixels, v => {
                for (s, &x) in sum.iter_mut().zip(v.iter()) {
                    *s += x as f64;
                }
            }),
        }
    }

    /// The sum as pixels of `dtype`.
    pub fn to_pixels(&self, dtype: PixelType) -> Pixels {
        match self {
            SumBuffer::Int(sum) => Pixels::I64(sum.clone()).cast(dtype),
            SumBuffer::Float(sum) => Pixels::F64(sum.clone()).cast(dtype),
        }
    }
}

/// Result handed to the save callback and returned to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct AccumulationResult {
    /// Sum cast to the configured save dtype
    pub image: Image,
    /// Frames actually summed
    pub frames: usize,
    pub outcome: AccumulationOutcome,
    pub first_frame_id: Option<i64>,
    pub last_frame_id: Option<i64>,
}

impl AccumulationResult {
    pub fn is_complete(&self) -> bool {
        self.outcome == AccumulationOutcome::Complete
    }
}

/// Sums `count` frames from a [`FrameSource`].
#[derive(Debug)]
pub struct Accumulator {
    config: AccumulatorConfig,
    shape: (usize, usize),
    status: Arc<SharedStatus>,
    state: AccumulatorState,
    decode_warnings: RateLimiter,
}

impl Accumulator {
    pub fn new(config: &StreamConfig, status: Arc<SharedStatus>) -> Self {
        Self {
            config: config.accumulator.clone(),
            shape: config.frame.shape(),
            status,
            state: AccumulatorState::Idle,
            decode_warnings: RateLimiter::new(100),
        }
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    fn set_state(&mut self, state: AccumulatorState) {
        self.state = state;
        self.status.set_state(state.into());
    }

    /// Accumulate, then hand the cast sum to `save`.
    ///
    /// Decode and shape failures are counted and skipped. Source failures and save
    /// failures end the run in [`AccumulatorState::Failed`].
    pub fn run<S, F>(&mut self, source: &mut S, save: F) -> StreamResult<AccumulationResult>
    where
        S: FrameSource + ?Sized,
        F: FnOnce(&AccumulationResult) -> StreamResult<()>,
    {
        let result = self.accumulate(source).and_then(|result| {
            self.set_state(AccumulatorState::Saving);
            save(&result)?;
            Ok(result)
        });

        match &result {
            Ok(result) => {
                self.status.set_outcome(result.outcome);
                self.set_state(AccumulatorState::Done);
                info!(frames = result.frames, outcome = ?result.outcome, "Accumulation finished");
            }
            Err(e) => {
                self.status.set_error(&e.to_string());
                self.set_state(AccumulatorState::Failed);
                warn!(error = %e, "Accumulation failed");
            }
        }
        result
    }

    fn accumulate<S: FrameSource + ?Sized>(&mut self, source: &mut S) -> StreamResult<AccumulationResult> {
        let (rows, cols) = self.shape;
        let mut sum = SumBuffer::new(rows * cols);
        let mut remaining = self.config.count;
        let mut frames = 0usize;
        let mut first_frame_id = None;
        let mut last_frame_id = None;
        let mut last_receive = Instant::now();

        self.set_state(AccumulatorState::Accumulating);
        info!(count = self.config.count, idle_timeout = ?self.config.idle_timeout, "Accumulating frames");

        let outcome = loop {
            if remaining == 0 {
                break AccumulationOutcome::Complete;
            }
            if self.status.stop_requested() {
                info!(frames, "Stop requested");
                break AccumulationOutcome::Partial;
            }
            // undecodable messages do not count as receiving a frame
            if stalled(last_receive, self.config.idle_timeout) {
                warn!(frames, idle_timeout = ?self.config.idle_timeout, "No frame within idle window, returning partial sum");
                break AccumulationOutcome::Partial;
            }

            match source.next_frame() {
                Ok(Some(frame)) => {
                    if frame.image.shape() != self.shape {
                        self.on_decode_failure(&StreamError::Shape {
                            expected: self.shape,
                            actual: frame.image.shape(),
                        });
                        continue;
                    }
                    sum.add(frame.image.pixels());
                    remaining -= 1;
                    frames += 1;
                    first_frame_id.get_or_insert(frame.frame_id);
                    last_frame_id = Some(frame.frame_id);
                    last_receive = Instant::now();
                    self.status.record_frame_id(frame.frame_id);
                    self.status.record_written();
                    debug!(frame_id = frame.frame_id, remaining, "Frame added");
                }
                Ok(None) => {}
                Err(e) if e.is_recoverable() => self.on_decode_failure(&e),
                Err(e) => return Err(e),
            }
        };

        Ok(AccumulationResult {
            image: Image::new(rows, cols, sum.to_pixels(self.config.save_dtype))?,
            frames,
            outcome,
            first_frame_id,
            last_frame_id,
        })
    }

    fn on_decode_failure(&mut self, err: &StreamError) {
        let failures = self.status.record_decode_failure();
        if self.decode_warnings.hit() {
            warn!(error = %err, failures, "Dropping undecodable message");
        }
    }
}

fn stalled(last_receive: Instant, idle_timeout: Duration) -> bool {
    last_receive.elapsed() >= idle_timeout
}
