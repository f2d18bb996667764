//! Mock detector: publishes synthetic frames in either wire format.
//!
//! Used by `detstream mock-detector` and the end-to-end tests. Frames carry a noisy
//! background plus one bright spot that wanders with the frame id, so summed images
//! and stored frames are easy to tell apart.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::codec::legacy::encode_multipart;
use crate::codec::message::{encode_end, encode_image, encode_start, WireCompression};
use crate::config::{FrameConfig, Protocol};
use crate::error::StreamResult;
use crate::frame::{Frame, Image, Pixels};

/// Generates reproducible synthetic frames.
#[derive(Debug)]
pub struct FrameGenerator {
    frame: FrameConfig,
    rng: StdRng,
}

impl FrameGenerator {
    pub fn new(frame: FrameConfig, seed: u64) -> Self {
        Self {
            frame,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// One frame with the given id, in the configured pixel type.
    pub fn frame(&mut self, frame_id: i64) -> StreamResult<Frame> {
        let (rows, cols) = self.frame.shape();
        let spot_row = (frame_id.unsigned_abs() as usize * 7) % rows;
        let spot_col = (frame_id.unsigned_abs() as usize * 13) % cols;

        let values: Vec<f64> = (0..rows * cols)
            .map(|i| {
                let (r, c) = (i / cols, i % cols);
                let background = f64::from(self.rng.gen_range(0u8..8));
                let dr = r.abs_diff(spot_row) as f64;
                let dc = c.abs_diff(spot_col) as f64;
                background + 100.0 * (-(dr * dr + dc * dc) / 4.0).exp()
            })
            .collect();

        let image = Image::new(rows, cols, Pixels::F64(values).cast(self.frame.dtype))?;
        Ok(Frame::new(image, frame_id))
    }
}

/// A PUB socket speaking the detector's wire format.
pub struct MockDetector {
    _context: zmq::Context,
    socket: zmq::Socket,
    protocol: Protocol,
    compression: WireCompression,
    series_id: i64,
}

impl std::fmt::Debug for MockDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDetector")
            .field("protocol", &self.protocol)
            .field("compression", &self.compression)
            .field("series_id", &self.series_id)
            .finish_non_exhaustive()
    }
}

impl MockDetector {
    /// Bind a publisher, e.g. `tcp://*:5501` or `tcp://127.0.0.1:*`.
    pub fn bind(endpoint: &str, protocol: Protocol, compression: WireCompression) -> StreamResult<Self> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::PUB)?;
        socket.set_linger(0)?;
        socket.bind(endpoint)?;
        Ok(Self {
            _context: context,
            socket,
            protocol,
            compression,
            series_id: 1,
        })
    }

    /// The bound endpoint with any wildcard port resolved.
    pub fn endpoint(&self) -> StreamResult<String> {
        let endpoint = self.socket.get_last_endpoint()?;
        Ok(endpoint.unwrap_or_else(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    pub fn set_series_id(&mut self, series_id: i64) {
        self.series_id = series_id;
    }

    /// Announce a series (CBOR only; the legacy format has no headers).
    pub fn send_start(&self) -> StreamResult<()> {
        if self.protocol == Protocol::Cbor {
            self.socket.send(encode_start(self.series_id), 0)?;
        }
        Ok(())
    }

    pub fn send_end(&self) -> StreamResult<()> {
        if self.protocol == Protocol::Cbor {
            self.socket.send(encode_end(self.series_id), 0)?;
        }
        Ok(())
    }

    pub fn send_frame(&self, frame: &Frame) -> StreamResult<()> {
        match self.protocol {
            Protocol::Legacy => self.socket.send_multipart(encode_multipart(frame), 0)?,
            Protocol::Cbor => self
                .socket
                .send(encode_image(self.series_id, frame, self.compression), 0)?,
        }
        debug!(frame_id = frame.frame_id, "Published frame");
        Ok(())
    }

    /// Publish a start message, `count` frames at `interval`, then an end message.
    ///
    /// `keep_going` is checked before every frame.
    pub fn publish_series(
        &self,
        generator: &mut FrameGenerator,
        first_id: i64,
        count: u64,
        interval: Duration,
        keep_going: impl Fn() -> bool,
    ) -> StreamResult<u64> {
        self.send_start()?;
        let mut sent = 0;
        for offset in 0..count {
            if !keep_going() {
                break;
            }
            let frame = generator.frame(first_id + offset as i64)?;
            self.send_frame(&frame)?;
            sent += 1;
            std::thread::sleep(interval);
        }
        self.send_end()?;
        info!(sent, series_id = self.series_id, "Series published");
        Ok(sent)
    }
}
