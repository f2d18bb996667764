//! Worker processes driven through their controllers.
#![cfg(feature = "storage_hdf5")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use detstream::accumulator::AccumulationOutcome;
use detstream::codec::message::WireCompression;
use detstream::config::{FrameConfig, Protocol, StreamConfig};
use detstream::data::hdf5_store::{read_summed_image, FrameStore};
use detstream::data::status::WorkerState;
use detstream::mock::{FrameGenerator, MockDetector};
use detstream::worker::{AccumulatorController, PersisterController};
use detstream::{PixelType, StreamError};
use serial_test::serial;
use tempfile::tempdir;

const PROGRAM: &str = env!("CARGO_BIN_EXE_detstream");

fn geometry() -> FrameConfig {
    FrameConfig {
        dtype: PixelType::U16,
        rows: 16,
        cols: 16,
    }
}

fn config_for(detector: &MockDetector) -> StreamConfig {
    let mut config = StreamConfig::default();
    config.application.log_level = "warn".into();
    config.transport.endpoint = detector.endpoint().unwrap();
    config.transport.protocol = Protocol::Cbor;
    config.transport.receive_timeout = Duration::from_millis(50);
    config.frame = geometry();
    config
}

/// Publish frames with increasing ids until `running` is cleared.
fn publish_until(detector: MockDetector, running: Arc<AtomicBool>) -> thread::JoinHandle<i64> {
    thread::spawn(move || {
        let mut generator = FrameGenerator::new(geometry(), 1);
        let mut frame_id = 0;
        while running.load(Ordering::SeqCst) {
            frame_id += 1;
            detector.send_frame(&generator.frame(frame_id).unwrap()).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        frame_id
    })
}

#[tokio::test]
#[serial]
async fn test_persister_process_start_stop() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("run.h5");
    let detector = MockDetector::bind("tcp://127.0.0.1:*", Protocol::Cbor, WireCompression::Bslz4).unwrap();
    let mut config = config_for(&detector);
    config.store.output = output.clone();

    let running = Arc::new(AtomicBool::new(true));
    let publisher = publish_until(detector, running.clone());

    let mut controller = PersisterController::new(config, PROGRAM);
    controller.start().unwrap();
    // a second start while running is ignored
    controller.start().unwrap();
    assert!(controller.is_running().unwrap());

    let deadline = Instant::now() + Duration::from_secs(20);
    while controller.status().map_or(0, |s| s.frames_written) < 3 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let status = controller.stop(Duration::from_secs(10)).await.unwrap().unwrap();
    running.store(false, Ordering::SeqCst);
    publisher.join().unwrap();

    assert_eq!(status.state, WorkerState::Stopped);
    assert!(status.frames_written >= 3);
    assert!(!controller.is_running().unwrap());

    let store = FrameStore::open_read(&output).unwrap();
    assert_eq!(store.n_frames() as u64, status.frames_written);
    assert_eq!(store.frame_numbers_len().unwrap(), store.n_frames());
}

#[tokio::test]
#[serial]
async fn test_persister_failure_reaches_controller() {
    let detector = MockDetector::bind("tcp://127.0.0.1:*", Protocol::Cbor, WireCompression::None).unwrap();
    let mut config = config_for(&detector);
    config.store.output = "/nonexistent-dir/detstream/run.h5".into();

    let mut controller = PersisterController::new(config, PROGRAM);
    controller.start().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let err = controller.stop(Duration::from_secs(10)).await.unwrap_err();
    assert!(matches!(err, StreamError::Worker(_)));
}

#[tokio::test]
#[serial]
async fn test_accumulator_process_sums_frames() {
    let dir = tempdir().unwrap();
    let output = dir.path().join("sum.h5");
    let detector = MockDetector::bind("tcp://127.0.0.1:*", Protocol::Cbor, WireCompression::None).unwrap();
    let mut config = config_for(&detector);
    config.accumulator.count = 4;
    config.accumulator.idle_timeout = Duration::from_secs(10);
    config.accumulator.output = output.clone();

    let running = Arc::new(AtomicBool::new(true));
    let publisher = publish_until(detector, running.clone());

    let controller = AccumulatorController::new(config, PROGRAM);
    let report = controller.accumulate(Duration::from_secs(30)).await;
    running.store(false, Ordering::SeqCst);
    publisher.join().unwrap();

    let report = report.unwrap();
    assert_eq!(report.outcome, AccumulationOutcome::Complete);
    assert_eq!(report.frames, 4);
    assert_eq!(report.output, output);

    let (image, frames, complete) = read_summed_image(&output).unwrap();
    assert_eq!(image.shape(), (16, 16));
    assert_eq!(frames, 4);
    assert!(complete);
}
