//! CBOR stream messages.
//!
//! Each bus message is one CBOR map. Header messages carry `"type": "start"` (or
//! `"end"` at the close of a series) and no pixels; image messages carry `series_id`,
//! `image_id` and the pixels under `data.default` as a tagged array.

use minicbor::data::Tag as CborTag;
use minicbor::Encoder;

use super::cbor::{decode_document, CborValue, TagHook};
use super::compression::{bslz4_compress, lz4_compress};
use super::tags::{TAG_COMPRESSED, TAG_NDARRAY_ROW_MAJOR};
use super::DecodeError;
use crate::error::{StreamError, StreamResult};
use crate::frame::{Frame, Image, PixelType, Pixels};

/// One interpreted stream message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Series header.
    Start { series_id: Option<i64> },
    /// Series trailer.
    End { series_id: Option<i64> },
    /// Image payload, still undecoded into a frame.
    Image {
        series_id: Option<i64>,
        image_id: i64,
        data: CborValue,
    },
    /// Any other message type (calibration, metadata, ...).
    Other { kind: String },
}

impl StreamMessage {
    /// Decode raw bytes with `hook` and interpret the resulting document.
    pub fn decode<H: TagHook + ?Sized>(bytes: &[u8], hook: &H) -> Result<Self, DecodeError> {
        Self::from_document(decode_document(bytes, hook)?)
    }

    /// Interpret a decoded document.
    pub fn from_document(mut doc: CborValue) -> Result<Self, DecodeError> {
        if !matches!(doc, CborValue::Map(_)) {
            return Err(DecodeError::InvalidField {
                field: "message",
                reason: "expected a map".into(),
            });
        }

        let series_id = doc.get("series_id").and_then(CborValue::as_i64);
        let kind = match doc.get("type") {
            Some(CborValue::Text(kind)) => Some(kind.clone()),
            Some(_) => {
                return Err(DecodeError::InvalidField {
                    field: "type",
                    reason: "expected text".into(),
                })
            }
            None => None,
        };

        match kind.as_deref() {
            Some("start") => Ok(StreamMessage::Start { series_id }),
            Some("end") => Ok(StreamMessage::End { series_id }),
            Some("image") | None => {
                let image_id = doc
                    .get("image_id")
                    .ok_or(DecodeError::MissingField("image_id"))?
                    .as_i64()
                    .ok_or_else(|| DecodeError::InvalidField {
                        field: "image_id",
                        reason: "expected int64".into(),
                    })?;
                let data = doc
                    .take("data")
                    .and_then(|mut data| data.take("default"))
                    .ok_or(DecodeError::MissingField("data.default"))?;
                Ok(StreamMessage::Image {
                    series_id,
                    image_id,
                    data,
                })
            }
            Some(other) => Ok(StreamMessage::Other {
                kind: other.to_string(),
            }),
        }
    }
}

/// Turn a resolved `data.default` value into an image of the configured shape.
///
/// Nd-arrays must be 2-D (a leading axis of length 1 is squeezed); flat typed arrays
/// are reshaped to `expected`.
pub fn image_from_value(value: CborValue, expected: (usize, usize)) -> StreamResult<Image> {
    let (rows, cols) = expected;
    match value {
        CborValue::NdArray(nd) => {
            let shape = match nd.shape.as_slice() {
                [r, c] | [1, r, c] => (*r, *c),
                other => {
                    return Err(DecodeError::InvalidNdArray(format!(
                        "expected a 2-D image, got shape {other:?}"
                    ))
                    .into())
                }
            };
            if shape != expected {
                return Err(StreamError::Shape {
                    expected,
                    actual: shape,
                });
            }
            Ok(Image::new(rows, cols, Pixels::from(nd.data))?)
        }
        CborValue::TypedArray(typed) => Ok(Image::new(rows, cols, Pixels::from(typed.data))?),
        _ => Err(DecodeError::ExpectedArray.into()),
    }
}

/// Compression applied to encoded image payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireCompression {
    #[default]
    None,
    Lz4,
    Bslz4,
}

/// Little-endian typed-array tag for a pixel type.
pub fn typed_array_tag(dtype: PixelType) -> u64 {
    match dtype {
        PixelType::U8 => 64,
        PixelType::U16 => 69,
        PixelType::U32 => 70,
        PixelType::U64 => 71,
        PixelType::I8 => 72,
        PixelType::I16 => 77,
        PixelType::I32 => 78,
        PixelType::I64 => 79,
        PixelType::F32 => 85,
        PixelType::F64 => 86,
    }
}

type EncodeResult = Result<(), minicbor::encode::Error<std::convert::Infallible>>;

/// Encode a series header.
pub fn encode_start(series_id: i64) -> Vec<u8> {
    encode_header("start", series_id)
}

/// Encode a series trailer.
pub fn encode_end(series_id: i64) -> Vec<u8> {
    encode_header("end", series_id)
}

fn encode_header(kind: &str, series_id: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    let result: EncodeResult = (|| {
        let mut enc = Encoder::new(&mut buf);
        enc.map(2)?;
        enc.str("type")?.str(kind)?;
        enc.str("series_id")?.i64(series_id)?;
        Ok(())
    })();
    // writing into a Vec cannot fail
    debug_assert!(result.is_ok());
    buf
}

/// Encode an image message as a row-major nd-array of a little-endian typed array.
pub fn encode_image(series_id: i64, frame: &Frame, compression: WireCompression) -> Vec<u8> {
    let image = &frame.image;
    let dtype = image.dtype();
    let raw = image.pixels().to_le_bytes();

    let mut buf = Vec::new();
    let result: EncodeResult = (|| {
        let mut enc = Encoder::new(&mut buf);
        enc.map(4)?;
        enc.str("type")?.str("image")?;
        enc.str("series_id")?.i64(series_id)?;
        enc.str("image_id")?.i64(frame.frame_id)?;
        enc.str("data")?.map(1)?.str("default")?;
        enc.tag(CborTag::new(TAG_NDARRAY_ROW_MAJOR))?;
        enc.array(2)?;
        enc.array(2)?.u64(image.rows() as u64)?.u64(image.cols() as u64)?;
        enc.tag(CborTag::new(typed_array_tag(dtype)))?;
        match compression {
            WireCompression::None => {
                enc.bytes(&raw)?;
            }
            WireCompression::Lz4 => {
                enc.tag(CborTag::new(TAG_COMPRESSED))?;
                enc.array(3)?.str("lz4")?.u64(dtype.itemsize() as u64)?;
                enc.bytes(&lz4_compress(&raw, 8192))?;
            }
            WireCompression::Bslz4 => {
                enc.tag(CborTag::new(TAG_COMPRESSED))?;
                enc.array(3)?.str("bslz4")?.u64(dtype.itemsize() as u64)?;
                enc.bytes(&bslz4_compress(&raw, dtype.itemsize(), 8192 / dtype.itemsize()))?;
            }
        }
        Ok(())
    })();
    debug_assert!(result.is_ok());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{IdentityHook, TagDecoder};

    fn sample_frame() -> Frame {
        let image = Image::from_vec(2, 4, (0..8u32).collect()).unwrap();
        Frame::new(image, 17)
    }

    #[test]
    fn test_start_message() {
        let msg = StreamMessage::decode(&encode_start(3), &IdentityHook).unwrap();
        assert_eq!(msg, StreamMessage::Start { series_id: Some(3) });
        let msg = StreamMessage::decode(&encode_end(3), &IdentityHook).unwrap();
        assert_eq!(msg, StreamMessage::End { series_id: Some(3) });
    }

    #[test]
    fn test_image_message_all_compressions() {
        let decoder = TagDecoder::default();
        let frame = sample_frame();
        for compression in [WireCompression::None, WireCompression::Lz4, WireCompression::Bslz4] {
            let bytes = encode_image(1, &frame, compression);
            let StreamMessage::Image { image_id, data, .. } = StreamMessage::decode(&bytes, &decoder).unwrap() else {
                panic!("expected image message");
            };
            assert_eq!(image_id, 17);
            let image = image_from_value(data, (2, 4)).unwrap();
            assert_eq!(image, frame.image, "{compression:?}");
        }
    }

    #[test]
    fn test_shape_mismatch() {
        let decoder = TagDecoder::default();
        let bytes = encode_image(1, &sample_frame(), WireCompression::None);
        let StreamMessage::Image { data, .. } = StreamMessage::decode(&bytes, &decoder).unwrap() else {
            panic!("expected image message");
        };
        let err = image_from_value(data, (4, 2)).unwrap_err();
        assert!(matches!(err, StreamError::Shape { expected: (4, 2), actual: (2, 4) }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_missing_fields() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1).unwrap().str("image_id").unwrap().u8(1).unwrap();
        assert!(matches!(
            StreamMessage::decode(&buf, &IdentityHook),
            Err(DecodeError::MissingField("data.default"))
        ));
    }

    #[test]
    fn test_other_message_type() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(1).unwrap().str("type").unwrap().str("calibration").unwrap();
        assert_eq!(
            StreamMessage::decode(&buf, &IdentityHook).unwrap(),
            StreamMessage::Other {
                kind: "calibration".into()
            }
        );
    }
}
