//! Frame transport: a pub/sub subscriber producing decoded frames.
//!
//! Every receive is bounded by the configured timeout. "No frame yet" is the normal
//! idle condition and is reported as `Ok(None)`; so are transport errors, which only
//! count towards a socket rebuild after `reconnect_after_errors` in a row. Decode and
//! shape failures are returned to the caller, which logs and drops that message.
//!
//! Memory under overload is bounded by the receive high-water mark and a kernel
//! receive buffer of HWM x frame bytes; past that the bus drops messages.

use tracing::{debug, info, warn};

use crate::codec::legacy::decode_multipart;
use crate::codec::message::image_from_value;
use crate::codec::{StreamMessage, TagDecoder};
use crate::config::{FrameConfig, Protocol, StreamConfig, TransportConfig};
use crate::error::{StreamError, StreamResult};
use crate::frame::Frame;

/// Anything that yields decoded frames one bounded receive at a time.
pub trait FrameSource {
    /// One receive attempt: `Ok(None)` when nothing arrived in time.
    fn next_frame(&mut self) -> StreamResult<Option<Frame>>;
}

/// Transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Messages taken off the socket, decodable or not
    pub messages_received: u64,
    /// Messages that failed to decode or had the wrong shape
    pub decode_failures: u64,
    /// Socket rebuilds
    pub reconnects: u64,
}

/// Subscriber socket bound to one endpoint and frame geometry.
pub struct FrameTransport {
    context: zmq::Context,
    socket: Option<zmq::Socket>,
    transport: TransportConfig,
    frame: FrameConfig,
    receive_buffer_bytes: usize,
    decoder: TagDecoder,
    consecutive_errors: u32,
    stats: TransportStats,
}

impl std::fmt::Debug for FrameTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTransport")
            .field("endpoint", &self.transport.endpoint)
            .field("protocol", &self.transport.protocol)
            .field("frame", &self.frame)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl FrameTransport {
    /// Connect a subscriber using the `[transport]` and `[frame]` sections.
    pub fn connect(config: &StreamConfig) -> StreamResult<Self> {
        Self::with_decoder(config, TagDecoder::default())
    }

    /// Connect with a custom tag decoder (e.g. a different decompressor).
    pub fn with_decoder(config: &StreamConfig, decoder: TagDecoder) -> StreamResult<Self> {
        let mut transport = Self {
            context: zmq::Context::new(),
            socket: None,
            transport: config.transport.clone(),
            frame: config.frame,
            receive_buffer_bytes: config.receive_buffer_bytes(),
            decoder,
            consecutive_errors: 0,
            stats: TransportStats::default(),
        };
        transport.socket = Some(transport.open_socket()?);
        info!(
            endpoint = %transport.transport.endpoint,
            protocol = ?transport.transport.protocol,
            rcvbuf = transport.receive_buffer_bytes,
            "Subscriber connected"
        );
        Ok(transport)
    }

    fn open_socket(&self) -> StreamResult<zmq::Socket> {
        let socket = self.context.socket(zmq::SUB)?;
        let timeout_ms = i32::try_from(self.transport.receive_timeout.as_millis()).unwrap_or(i32::MAX);
        socket.set_rcvhwm(self.transport.receive_hwm)?;
        socket.set_rcvbuf(i32::try_from(self.receive_buffer_bytes).unwrap_or(i32::MAX))?;
        socket.set_rcvtimeo(timeout_ms)?;
        socket.set_linger(0)?;
        socket.connect(&self.transport.endpoint)?;
        socket.set_subscribe(b"")?;
        Ok(socket)
    }

    /// Tear down and recreate the subscriber. Safe to call at any time.
    pub fn reconnect(&mut self) -> StreamResult<()> {
        // drop first so the old socket's buffers are released before the new one fills
        self.socket = None;
        self.socket = Some(self.open_socket()?);
        self.consecutive_errors = 0;
        self.stats.reconnects += 1;
        info!(endpoint = %self.transport.endpoint, reconnects = self.stats.reconnects, "Subscriber reconnected");
        Ok(())
    }

    fn socket(&self) -> StreamResult<&zmq::Socket> {
        self.socket
            .as_ref()
            .ok_or_else(|| StreamError::Transport(zmq::Error::ENOTSOCK))
    }

    /// Map a receive failure to "no frame", rebuilding the socket if errors persist.
    fn on_receive_error(&mut self, err: zmq::Error) -> StreamResult<Option<Frame>> {
        if err == zmq::Error::EAGAIN {
            return Ok(None);
        }

        self.consecutive_errors += 1;
        debug!(error = %err, consecutive = self.consecutive_errors, "Receive failed");
        if self.consecutive_errors >= self.transport.reconnect_after_errors.max(1) {
            if let Err(e) = self.reconnect() {
                warn!(error = %e, "Reconnect failed");
            }
        }
        Ok(None)
    }

    fn on_decoded(&mut self, result: StreamResult<Option<Frame>>) -> StreamResult<Option<Frame>> {
        if let Err(e) = &result {
            if e.is_recoverable() {
                self.stats.decode_failures += 1;
            }
        }
        result
    }

    /// Legacy protocol: one multipart receive of `[frame id, raw pixels]`.
    pub fn get_frame(&mut self) -> StreamResult<Option<Frame>> {
        let received = self.socket()?.recv_multipart(0);
        let parts = match received {
            Ok(parts) => parts,
            Err(e) => return self.on_receive_error(e),
        };
        self.consecutive_errors = 0;
        self.stats.messages_received += 1;

        let result = decode_multipart(&parts, &self.frame).map(Some).map_err(StreamError::from);
        self.on_decoded(result)
    }

    /// CBOR protocol: one receive decoded through the tag decoder.
    ///
    /// Start, end and other non-image messages yield `Ok(None)`.
    pub fn get_frame_jfj(&mut self) -> StreamResult<Option<Frame>> {
        let received = self.socket()?.recv_bytes(0);
        let bytes = match received {
            Ok(bytes) => bytes,
            Err(e) => return self.on_receive_error(e),
        };
        self.consecutive_errors = 0;
        self.stats.messages_received += 1;

        let result = self.interpret(&bytes);
        self.on_decoded(result)
    }

    fn interpret(&self, bytes: &[u8]) -> StreamResult<Option<Frame>> {
        match StreamMessage::decode(bytes, &self.decoder)? {
            StreamMessage::Start { series_id } => {
                info!(?series_id, "Series started");
                Ok(None)
            }
            StreamMessage::End { series_id } => {
                info!(?series_id, "Series ended");
                Ok(None)
            }
            StreamMessage::Other { kind } => {
                debug!(kind = %kind, "Ignoring message");
                Ok(None)
            }
            StreamMessage::Image { image_id, data, .. } => {
                let image = image_from_value(data, self.frame.shape())?;
                Ok(Some(Frame::new(image, image_id)))
            }
        }
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn endpoint(&self) -> &str {
        &self.transport.endpoint
    }

    pub fn frame_config(&self) -> &FrameConfig {
        &self.frame
    }
}

impl FrameSource for FrameTransport {
    fn next_frame(&mut self) -> StreamResult<Option<Frame>> {
        match self.transport.protocol {
            Protocol::Legacy => self.get_frame(),
            Protocol::Cbor => self.get_frame_jfj(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::legacy::encode_multipart;
    use crate::frame::{Image, PixelType};
    use serial_test::serial;
    use std::time::Duration;

    fn publisher() -> (zmq::Context, zmq::Socket, String) {
        let ctx = zmq::Context::new();
        let publisher = ctx.socket(zmq::PUB).unwrap();
        publisher.bind("tcp://127.0.0.1:*").unwrap();
        let endpoint = publisher.get_last_endpoint().unwrap().unwrap();
        (ctx, publisher, endpoint)
    }

    fn config(endpoint: &str, protocol: Protocol, frame: FrameConfig) -> StreamConfig {
        let mut config = StreamConfig::default();
        config.transport.endpoint = endpoint.to_string();
        config.transport.protocol = protocol;
        config.transport.receive_timeout = Duration::from_millis(20);
        config.frame = frame;
        config
    }

    #[test]
    #[serial]
    fn test_timeout_yields_none() {
        let (_ctx, _publisher, endpoint) = publisher();
        let frame = FrameConfig {
            dtype: PixelType::U8,
            rows: 2,
            cols: 2,
        };
        let mut transport = FrameTransport::connect(&config(&endpoint, Protocol::Legacy, frame)).unwrap();
        assert!(transport.get_frame().unwrap().is_none());
        assert_eq!(transport.stats().messages_received, 0);
    }

    #[test]
    #[serial]
    fn test_reconnect_is_idempotent() {
        let (_ctx, _publisher, endpoint) = publisher();
        let mut transport =
            FrameTransport::connect(&config(&endpoint, Protocol::Cbor, FrameConfig::default())).unwrap();
        transport.reconnect().unwrap();
        transport.reconnect().unwrap();
        assert_eq!(transport.stats().reconnects, 2);
        assert!(transport.next_frame().unwrap().is_none());
    }

    #[test]
    #[serial]
    fn test_legacy_frame_received() {
        let (_ctx, publisher, endpoint) = publisher();
        let frame = FrameConfig {
            dtype: PixelType::U16,
            rows: 4,
            cols: 4,
        };
        let mut transport = FrameTransport::connect(&config(&endpoint, Protocol::Legacy, frame)).unwrap();

        let sent = Frame::new(Image::from_vec(4, 4, (0..16u16).collect()).unwrap(), 7);
        let parts = encode_multipart(&sent);

        let mut received = None;
        for _ in 0..200 {
            publisher.send_multipart(parts.clone(), 0).unwrap();
            if let Some(frame) = transport.get_frame().unwrap() {
                received = Some(frame);
                break;
            }
        }
        assert_eq!(received, Some(sent));
    }
}
