//! Accumulator runs against a live mock detector.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use detstream::accumulator::{AccumulationOutcome, Accumulator, AccumulatorState};
use detstream::codec::message::WireCompression;
use detstream::config::{FrameConfig, Protocol, StreamConfig};
use detstream::data::status::{SharedStatus, WorkerState};
use detstream::mock::{FrameGenerator, MockDetector};
use detstream::transport::FrameTransport;
use detstream::PixelType;
use serial_test::serial;

const SEED: u64 = 21;

fn geometry() -> FrameConfig {
    FrameConfig {
        dtype: PixelType::U16,
        rows: 8,
        cols: 8,
    }
}

/// Subscriber that has already seen one message from `detector`.
fn joined(detector: &MockDetector, count: usize, idle_timeout: Duration) -> (StreamConfig, FrameTransport) {
    let mut config = StreamConfig::default();
    config.transport.endpoint = detector.endpoint().unwrap();
    config.transport.protocol = Protocol::Cbor;
    config.transport.receive_timeout = Duration::from_millis(20);
    config.frame = geometry();
    config.accumulator.count = count;
    config.accumulator.idle_timeout = idle_timeout;
    config.accumulator.save_dtype = PixelType::I64;

    let mut transport = FrameTransport::connect(&config).unwrap();
    for _ in 0..200 {
        detector.send_start().unwrap();
        assert!(transport.get_frame_jfj().unwrap().is_none());
        if transport.stats().messages_received > 0 {
            break;
        }
    }
    assert!(transport.stats().messages_received > 0, "subscriber never joined");
    (config, transport)
}

fn publish(detector: MockDetector, frames: i64) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut generator = FrameGenerator::new(geometry(), SEED);
        for id in 1..=frames {
            detector.send_frame(&generator.frame(id).unwrap()).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        // keep the socket open until the subscriber has drained
        thread::sleep(Duration::from_millis(200));
    })
}

fn expected_sum(frames: i64) -> Vec<i64> {
    let mut generator = FrameGenerator::new(geometry(), SEED);
    let mut sum = vec![0i64; 64];
    for id in 1..=frames {
        let frame = generator.frame(id).unwrap();
        for (s, &v) in sum.iter_mut().zip(frame.image.as_slice::<u16>().unwrap()) {
            *s += i64::from(v);
        }
    }
    sum
}

#[test]
#[serial]
fn test_complete_accumulation() {
    let detector = MockDetector::bind("tcp://127.0.0.1:*", Protocol::Cbor, WireCompression::Lz4).unwrap();
    let (config, mut transport) = joined(&detector, 5, Duration::from_secs(5));
    let publisher = publish(detector, 5);

    let status = Arc::new(SharedStatus::anonymous().unwrap());
    let mut accumulator = Accumulator::new(&config, status.clone());
    let mut saved = None;
    let result = accumulator
        .run(&mut transport, |result| {
            saved = Some(result.frames);
            Ok(())
        })
        .unwrap();
    publisher.join().unwrap();

    assert_eq!(result.outcome, AccumulationOutcome::Complete);
    assert_eq!(result.frames, 5);
    assert_eq!(saved, Some(5));
    assert_eq!((result.first_frame_id, result.last_frame_id), (Some(1), Some(5)));
    assert_eq!(result.image.as_slice::<i64>().unwrap(), expected_sum(5).as_slice());

    assert_eq!(accumulator.state(), AccumulatorState::Done);
    assert_eq!(status.state(), WorkerState::Stopped);
    assert_eq!(status.outcome(), Some(AccumulationOutcome::Complete));
    assert_eq!(status.frames_written(), 5);
}

#[test]
#[serial]
fn test_stalled_stream_gives_partial_sum() {
    let detector = MockDetector::bind("tcp://127.0.0.1:*", Protocol::Cbor, WireCompression::None).unwrap();
    let (config, mut transport) = joined(&detector, 5, Duration::from_millis(500));
    let publisher = publish(detector, 3);

    let status = Arc::new(SharedStatus::anonymous().unwrap());
    let mut accumulator = Accumulator::new(&config, status.clone());
    let result = accumulator.run(&mut transport, |_| Ok(())).unwrap();
    publisher.join().unwrap();

    assert_eq!(result.outcome, AccumulationOutcome::Partial);
    assert!(!result.is_complete());
    assert_eq!(result.frames, 3);
    assert_eq!(result.image.as_slice::<i64>().unwrap(), expected_sum(3).as_slice());
    assert_eq!(status.outcome(), Some(AccumulationOutcome::Partial));
}
