//! # detstream
//!
//! Detector-frame streaming and persistence. A subscriber consumes a pub/sub stream
//! of detector frames, decodes either the legacy multipart format or CBOR documents
//! with typed-array, nd-array and compression tags, and either appends the frames to
//! a growing HDF5 file or sums a bounded number of them into one image.
//!
//! ## Crate Structure
//!
//! - **`codec`**: Wire decoding. The CBOR tag decoder, compression envelopes, legacy
//!   multipart frames and stream message interpretation.
//! - **`frame`**: Pixel types, `Image` and `Frame`.
//! - **`transport`**: The subscriber socket and the `FrameSource` trait.
//! - **`data`**: The HDF5 frame store and the memory-mapped status block shared with
//!   worker processes.
//! - **`persister`** / **`accumulator`**: The two worker loops.
//! - **`worker`**: Spawning, stopping and observing worker processes.
//! - **`mock`**: A mock detector publisher for tests and demos.
//! - **`config`**, **`logging`**, **`error`**: Configuration, tracing setup and the
//!   crate error type.
//!
//! ## Data flow
//!
//! ```text
//! publisher ─► FrameTransport ─► codec ─► Frame ─┬─► Persister ─► FrameStore (HDF5)
//!                                                └─► Accumulator ─► save callback
//! ```

pub mod accumulator;
pub mod codec;
pub mod config;
pub mod data;
pub mod error;
pub mod frame;
pub mod logging;
pub mod mock;
pub mod persister;
pub mod transport;
pub mod worker;

pub use error::{StreamError, StreamResult};
pub use frame::{Frame, Image, PixelType};
