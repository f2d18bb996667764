//! Memory-mapped status block shared between a worker process and its controller.
//!
//! Every field has exactly one writer. The controller owns `stop_requested`; the worker
//! owns everything else. Readers poll with `Acquire` loads, writers publish with
//! `Release` stores, so no field is ever read-modify-written by both sides.
//!
//! # Memory Layout
//! ```text
//! Header (#[repr(C)], 1024 bytes):
//!   magic: u64                 (0xDE7E_C70B_0000_0001)
//!   state: AtomicU32           worker
//!   stop_requested: AtomicU32  controller
//!   first_frame_id: AtomicI64  worker (i64::MIN = none yet)
//!   last_frame_id: AtomicI64   worker (i64::MIN = none yet)
//!   frames_written: AtomicU64  worker
//!   decode_failures: AtomicU64 worker
//!   frames_skipped: AtomicU64  worker
//!   outcome: AtomicU32         worker (0 = none, 1 = complete, 2 = partial)
//!   error_len: AtomicU32       worker, published after the error bytes
//!   error: [AtomicU8; 512]     worker, written once
//!   padding
//! ```

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::accumulator::AccumulationOutcome;
use crate::error::{StreamError, StreamResult};

/// Magic number for status block validation
const MAGIC: u64 = 0xDE7E_C70B_0000_0001;

/// Size of the status file in bytes
const BLOCK_SIZE: usize = 1024;

/// Capacity of the error message slot
pub const ERROR_CAPACITY: usize = 512;

/// Sentinel for "no frame id recorded yet"
const NO_FRAME: i64 = i64::MIN;

#[repr(C)]
struct StatusHeader {
    magic: u64,
    state: AtomicU32,
    stop_requested: AtomicU32,
    first_frame_id: AtomicI64,
    last_frame_id: AtomicI64,
    frames_written: AtomicU64,
    decode_failures: AtomicU64,
    frames_skipped: AtomicU64,
    outcome: AtomicU32,
    error_len: AtomicU32,
    error: [AtomicU8; ERROR_CAPACITY],
}

const _: () = assert!(std::mem::size_of::<StatusHeader>() <= BLOCK_SIZE);

/// Lifecycle state of a worker as seen through the status block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, not yet receiving
    Idle,
    /// Receiving frames
    Running,
    /// Closing the store or saving the sum
    Finalizing,
    /// Exited cleanly
    Stopped,
    /// Exited after a fatal error (see the error slot)
    Failed,
}

impl WorkerState {
    fn to_raw(self) -> u32 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Running => 1,
            WorkerState::Finalizing => 2,
            WorkerState::Stopped => 3,
            WorkerState::Failed => 4,
        }
    }

    fn from_raw(raw: u32) -> Self {
        match raw {
            1 => WorkerState::Running,
            2 => WorkerState::Finalizing,
            3 => WorkerState::Stopped,
            4 => WorkerState::Failed,
            _ => WorkerState::Idle,
        }
    }

    /// Whether the worker has exited its loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

/// Point-in-time copy of all status fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: WorkerState,
    pub stop_requested: bool,
    pub first_frame_id: Option<i64>,
    pub last_frame_id: Option<i64>,
    pub frames_written: u64,
    pub decode_failures: u64,
    pub frames_skipped: u64,
    pub outcome: Option<AccumulationOutcome>,
    pub error: Option<String>,
}

/// Cross-process status block.
///
/// # Safety
/// The header pointer targets the start of `mmap`, which is page aligned and at
/// least `BLOCK_SIZE` bytes, and stays valid for as long as `mmap` lives. All shared
/// fields are atomics, including the error bytes, which are written once before
/// `error_len` is published with `Release`.
pub struct SharedStatus {
    _mmap: MmapMut,
    header: *mut StatusHeader,
}

// SAFETY: all access to the mapping after init goes through atomics.
unsafe impl Send for SharedStatus {}

// SAFETY: see above; single writer per field.
unsafe impl Sync for SharedStatus {}

impl std::fmt::Debug for SharedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStatus").field("status", &self.snapshot()).finish()
    }
}

impl SharedStatus {
    /// Create (or truncate) a status file and initialise its header.
    pub fn create(path: &Path) -> StreamResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(BLOCK_SIZE as u64)?;

        // SAFETY: the file was just sized to BLOCK_SIZE and is owned by this process
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self::init(mmap))
    }

    /// Status block backed by anonymous memory, for in-process workers.
    pub fn anonymous() -> StreamResult<Self> {
        let mmap = MmapOptions::new().len(BLOCK_SIZE).map_anon()?;
        Ok(Self::init(mmap))
    }

    fn init(mut mmap: MmapMut) -> Self {
        mmap.fill(0);
        let header = mmap.as_mut_ptr() as *mut StatusHeader;
        // SAFETY: mmap is BLOCK_SIZE bytes, zeroed and page aligned
        unsafe {
            (*header).magic = MAGIC;
            (*header).first_frame_id.store(NO_FRAME, Ordering::Relaxed);
            (*header).last_frame_id.store(NO_FRAME, Ordering::Relaxed);
        }
        if let Err(e) = mmap.flush() {
            tracing::debug!(error = %e, "status block flush failed");
        }
        Self { _mmap: mmap, header }
    }

    /// Attach to a status file created by [`SharedStatus::create`].
    pub fn open(path: &Path) -> StreamResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < BLOCK_SIZE as u64 {
            return Err(StreamError::Status(format!(
                "status file {path:?} is {len} bytes, expected {BLOCK_SIZE}"
            )));
        }

        // SAFETY: the file is at least BLOCK_SIZE bytes
        let mut mmap = unsafe { MmapOptions::new().len(BLOCK_SIZE).map_mut(&file)? };
        let header = mmap.as_mut_ptr() as *mut StatusHeader;
        // SAFETY: header lies within the mapping
        let magic = unsafe { (*header).magic };
        if magic != MAGIC {
            return Err(StreamError::Status(format!(
                "invalid status magic: expected 0x{MAGIC:016X}, got 0x{magic:016X}"
            )));
        }

        Ok(Self { _mmap: mmap, header })
    }

    fn header(&self) -> &StatusHeader {
        // SAFETY: header is valid for the lifetime of self
        unsafe { &*self.header }
    }

    // ---- controller side ----

    /// Ask the worker to stop. Honoured within one receive timeout.
    pub fn request_stop(&self) {
        self.header().stop_requested.store(1, Ordering::Release);
    }

    // ---- worker side ----

    pub fn stop_requested(&self) -> bool {
        self.header().stop_requested.load(Ordering::Acquire) != 0
    }

    pub fn set_state(&self, state: WorkerState) {
        self.header().state.store(state.to_raw(), Ordering::Release);
    }

    /// Record a received frame id, accumulating id gaps into `frames_skipped`.
    pub fn record_frame_id(&self, frame_id: i64) {
        let header = self.header();
        let last = header.last_frame_id.load(Ordering::Relaxed);
        if last == NO_FRAME {
            header.first_frame_id.store(frame_id, Ordering::Release);
        } else if frame_id > last.saturating_add(1) {
            let gap = frame_id.saturating_sub(last).saturating_sub(1) as u64;
            let skipped = header.frames_skipped.load(Ordering::Relaxed);
            header.frames_skipped.store(skipped.saturating_add(gap), Ordering::Release);
        }
        header.last_frame_id.store(frame_id, Ordering::Release);
    }

    pub fn record_written(&self) {
        let header = self.header();
        let n = header.frames_written.load(Ordering::Relaxed);
        header.frames_written.store(n + 1, Ordering::Release);
    }

    /// Increment the decode failure counter and return the new value.
    pub fn record_decode_failure(&self) -> u64 {
        let header = self.header();
        let n = header.decode_failures.load(Ordering::Relaxed) + 1;
        header.decode_failures.store(n, Ordering::Release);
        n
    }

    pub fn set_outcome(&self, outcome: AccumulationOutcome) {
        let raw = match outcome {
            AccumulationOutcome::Complete => 1,
            AccumulationOutcome::Partial => 2,
        };
        self.header().outcome.store(raw, Ordering::Release);
    }

    /// Publish a fatal error message. Only the first call has an effect.
    ///
    /// Messages longer than the slot are truncated at a character boundary.
    pub fn set_error(&self, message: &str) {
        let header = self.header();
        if header.error_len.load(Ordering::Relaxed) != 0 {
            return;
        }

        let mut len = message.len().min(ERROR_CAPACITY);
        while !message.is_char_boundary(len) {
            len -= 1;
        }
        for (slot, &byte) in header.error.iter().zip(&message.as_bytes()[..len]) {
            slot.store(byte, Ordering::Relaxed);
        }
        header.error_len.store(len.max(1) as u32, Ordering::Release);
    }

    // ---- readers ----

    pub fn state(&self) -> WorkerState {
        WorkerState::from_raw(self.header().state.load(Ordering::Acquire))
    }

    pub fn frames_written(&self) -> u64 {
        self.header().frames_written.load(Ordering::Acquire)
    }

    pub fn decode_failures(&self) -> u64 {
        self.header().decode_failures.load(Ordering::Acquire)
    }

    pub fn frames_skipped(&self) -> u64 {
        self.header().frames_skipped.load(Ordering::Acquire)
    }

    pub fn first_frame_id(&self) -> Option<i64> {
        Some(self.header().first_frame_id.load(Ordering::Acquire)).filter(|&id| id != NO_FRAME)
    }

    pub fn last_frame_id(&self) -> Option<i64> {
        Some(self.header().last_frame_id.load(Ordering::Acquire)).filter(|&id| id != NO_FRAME)
    }

    pub fn outcome(&self) -> Option<AccumulationOutcome> {
        match self.header().outcome.load(Ordering::Acquire) {
            1 => Some(AccumulationOutcome::Complete),
            2 => Some(AccumulationOutcome::Partial),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<String> {
        let len = self.header().error_len.load(Ordering::Acquire) as usize;
        if len == 0 {
            return None;
        }
        let len = len.min(ERROR_CAPACITY);
        let bytes: Vec<u8> = self.header().error[..len]
            .iter()
            .map(|byte| byte.load(Ordering::Relaxed))
            .collect();
        Some(String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            stop_requested: self.stop_requested(),
            first_frame_id: self.first_frame_id(),
            last_frame_id: self.last_frame_id(),
            frames_written: self.frames_written(),
            decode_failures: self.decode_failures(),
            frames_skipped: self.frames_skipped(),
            outcome: self.outcome(),
            error: self.error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open_share_fields() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("worker.status");

        let worker = SharedStatus::create(&path).unwrap();
        let controller = SharedStatus::open(&path).unwrap();

        assert_eq!(controller.state(), WorkerState::Idle);
        assert_eq!(controller.first_frame_id(), None);
        assert!(!worker.stop_requested());

        controller.request_stop();
        assert!(worker.stop_requested());

        worker.set_state(WorkerState::Running);
        worker.record_frame_id(7);
        worker.record_written();
        assert_eq!(controller.state(), WorkerState::Running);
        assert_eq!(controller.first_frame_id(), Some(7));
        assert_eq!(controller.frames_written(), 1);
    }

    #[test]
    fn test_frame_id_gaps_count_as_skipped() {
        let status = SharedStatus::anonymous().unwrap();
        for id in [1, 2, 5, 6, 10, 9] {
            status.record_frame_id(id);
        }
        // 3, 4 and 7, 8 missing; a repeated or backwards id adds nothing
        assert_eq!(status.frames_skipped(), 4);
        assert_eq!(status.first_frame_id(), Some(1));
        assert_eq!(status.last_frame_id(), Some(9));
    }

    #[test]
    fn test_error_slot_written_once() {
        let status = SharedStatus::anonymous().unwrap();
        assert_eq!(status.error(), None);
        status.set_error("disk full");
        status.set_error("second error");
        assert_eq!(status.error().as_deref(), Some("disk full"));
    }

    #[test]
    fn test_error_from_worker_thread_reaches_controller_mapping() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("worker.status");
        let worker = SharedStatus::create(&path).unwrap();
        let controller = SharedStatus::open(&path).unwrap();

        std::thread::spawn(move || worker.set_error("frame store unwritable"))
            .join()
            .unwrap();
        assert_eq!(controller.error().as_deref(), Some("frame store unwritable"));
    }

    #[test]
    fn test_error_truncated_on_char_boundary() {
        let status = SharedStatus::anonymous().unwrap();
        let message = "é".repeat(ERROR_CAPACITY);
        status.set_error(&message);
        let stored = status.error().unwrap();
        assert!(stored.len() <= ERROR_CAPACITY);
        assert!(stored.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_outcome_roundtrip() {
        let status = SharedStatus::anonymous().unwrap();
        assert_eq!(status.outcome(), None);
        status.set_outcome(AccumulationOutcome::Partial);
        assert_eq!(status.snapshot().outcome, Some(AccumulationOutcome::Partial));
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("garbage.status");
        std::fs::write(&path, vec![0xAB; BLOCK_SIZE]).unwrap();
        assert!(matches!(SharedStatus::open(&path), Err(StreamError::Status(_))));

        let short = temp_dir.path().join("short.status");
        std::fs::write(&short, b"tiny").unwrap();
        assert!(matches!(SharedStatus::open(&short), Err(StreamError::Status(_))));
    }
}
