//! Wire decoding for detector streams.
//!
//! Two payload encodings coexist on the bus:
//!
//! - **Legacy multipart** (`legacy`): an 8-byte frame id followed by a raw pixel buffer.
//! - **CBOR documents** (`cbor`, `tags`, `message`): maps carrying typed arrays,
//!   nd-arrays and vendor-compressed buffers as extension tags.
//!
//! ```text
//! bytes ──► cbor::decode_document ──► TagDecoder::on_tag (per tag, innermost first)
//!                                         │
//!                         ┌───────────────┼──────────────────┐
//!                     nd-array       typed array     compression envelope
//!                   (40 / 1040)       (64 - 87)          (56500)
//! ```

pub mod cbor;
pub mod compression;
pub mod legacy;
pub mod message;
pub mod tags;
pub mod typed_array;

pub use cbor::{decode_document, CborValue, IdentityHook, TagHook};
pub use compression::{Decompressor, VendorDecompressor};
pub use message::StreamMessage;
pub use tags::{NdArray, Order, Tag, TagDecoder};
pub use typed_array::{ArrayData, ElementType, Endian, Quad, TypedArray};

use thiserror::Error;

/// Per-message decoding failures.
///
/// These never end a stream: the worker loops drop the offending message and continue.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("expected array or typed array")]
    ExpectedArray,

    #[error("expected byte string")]
    ExpectedByteString,

    #[error("byte length {len} is not a multiple of item size {itemsize}")]
    Length { len: usize, itemsize: usize },

    #[error("cannot reshape {actual} elements into {expected}")]
    Reshape { expected: usize, actual: usize },

    #[error("invalid nd-array: {0}")]
    InvalidNdArray(String),

    #[error("invalid compression envelope: {0}")]
    InvalidEnvelope(String),

    #[error("unsupported compression algorithm '{0}'")]
    UnsupportedCompression(String),

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("cbor: {0}")]
    Cbor(#[from] minicbor::decode::Error),

    #[error("indefinite-length CBOR not supported")]
    IndefiniteLength,

    #[error("unsupported CBOR item: {0}")]
    UnsupportedItem(String),

    #[error("CBOR nesting deeper than {0}")]
    TooDeep(usize),

    #[error("{0} trailing bytes after CBOR document")]
    TrailingBytes(usize),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("expected 2 message parts, got {0}")]
    Multipart(usize),

    #[error("frame id must be 8 bytes, got {0}")]
    FrameId(usize),

    #[error("pixel buffer is {actual} bytes, frame needs {expected}")]
    PayloadSize { expected: usize, actual: usize },
}
