//! CBOR tag resolution for detector streams.
//!
//! Tag numbers map onto a fixed sum type ([`Tag`]) that is matched exhaustively by
//! [`TagDecoder`]:
//!
//! | Tag | Meaning |
//! |---|---|
//! | 40 / 1040 | nd-array `[dimensions, contents]`, row-major / column-major |
//! | 64 - 87 (except 76) | typed array, element type and byte order per tag |
//! | 56500 | vendor compression envelope `[algorithm, element size, payload]` |
//! | anything else | left unresolved |

use ndarray::{ArrayViewD, IxDyn, ShapeBuilder};

use super::cbor::{CborValue, TagHook};
use super::compression::{Decompressor, VendorDecompressor};
use super::typed_array::{map_array_data, ArrayData, ElementType, Endian, TypedArray};
use super::DecodeError;

/// Row-major nd-array tag.
pub const TAG_NDARRAY_ROW_MAJOR: u64 = 40;
/// Column-major nd-array tag.
pub const TAG_NDARRAY_COL_MAJOR: u64 = 1040;
/// Vendor compression envelope tag.
pub const TAG_COMPRESSED: u64 = 56500;

/// Element layout of an nd-array's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    RowMajor,
    ColumnMajor,
}

/// Tag families understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    NdArray { order: Order },
    TypedArray { element: ElementType, endian: Endian },
    Compressed,
    Unknown(u64),
}

impl From<u64> for Tag {
    fn from(tag: u64) -> Self {
        use ElementType::*;
        use Endian::{Big, Little};

        let typed = |element, endian| Tag::TypedArray { element, endian };
        match tag {
            TAG_NDARRAY_ROW_MAJOR => Tag::NdArray {
                order: Order::RowMajor,
            },
            TAG_NDARRAY_COL_MAJOR => Tag::NdArray {
                order: Order::ColumnMajor,
            },
            64 => typed(U8, Big),
            65 => typed(U16, Big),
            66 => typed(U32, Big),
            67 => typed(U64, Big),
            // 68 is the clamped uint8 variant
            68 => typed(U8, Little),
            69 => typed(U16, Little),
            70 => typed(U32, Little),
            71 => typed(U64, Little),
            72 => typed(I8, Big),
            73 => typed(I16, Big),
            74 => typed(I32, Big),
            75 => typed(I64, Big),
            77 => typed(I16, Little),
            78 => typed(I32, Little),
            79 => typed(I64, Little),
            80 => typed(F16, Big),
            81 => typed(F32, Big),
            82 => typed(F64, Big),
            83 => typed(F128, Big),
            84 => typed(F16, Little),
            85 => typed(F32, Little),
            86 => typed(F64, Little),
            87 => typed(F128, Little),
            TAG_COMPRESSED => Tag::Compressed,
            other => Tag::Unknown(other),
        }
    }
}

/// An nd-array with its contents in logical row-major order.
///
/// Column-major payloads are reordered at decode time; `order` records the wire layout.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub order: Order,
    pub data: ArrayData,
}

/// The detector stream tag hook.
pub struct TagDecoder {
    decompressor: Box<dyn Decompressor>,
}

impl Default for TagDecoder {
    fn default() -> Self {
        Self::new(Box::new(VendorDecompressor))
    }
}

impl std::fmt::Debug for TagDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagDecoder").finish_non_exhaustive()
    }
}

impl TagDecoder {
    /// Create a decoder that resolves compression envelopes with `decompressor`.
    pub fn new(decompressor: Box<dyn Decompressor>) -> Self {
        Self { decompressor }
    }

    /// Resolve one tag.
    pub fn resolve(&self, tag: u64, value: CborValue) -> Result<CborValue, DecodeError> {
        match Tag::from(tag) {
            Tag::NdArray { order } => decode_ndarray(order, value).map(CborValue::NdArray),
            Tag::TypedArray { element, endian } => match value {
                CborValue::Bytes(bytes) => Ok(CborValue::TypedArray(TypedArray {
                    element,
                    endian,
                    data: ArrayData::from_bytes(element, endian, &bytes)?,
                })),
                _ => Err(DecodeError::ExpectedByteString),
            },
            Tag::Compressed => self.decompress(value).map(CborValue::Bytes),
            Tag::Unknown(tag) => Ok(CborValue::Tagged(tag, Box::new(value))),
        }
    }

    fn decompress(&self, value: CborValue) -> Result<Vec<u8>, DecodeError> {
        let CborValue::Array(items) = value else {
            return Err(DecodeError::InvalidEnvelope("expected array".into()));
        };
        let [algorithm, elem_size, payload] = <[CborValue; 3]>::try_from(items).map_err(|items| {
            DecodeError::InvalidEnvelope(format!("expected 3 items, got {}", items.len()))
        })?;

        let CborValue::Text(algorithm) = algorithm else {
            return Err(DecodeError::InvalidEnvelope("algorithm must be text".into()));
        };
        let elem_size = match elem_size {
            CborValue::Int(n) => usize::try_from(n)
                .map_err(|_| DecodeError::InvalidEnvelope(format!("element size {n} out of range")))?,
            _ => return Err(DecodeError::InvalidEnvelope("element size must be an integer".into())),
        };
        let CborValue::Bytes(payload) = payload else {
            return Err(DecodeError::ExpectedByteString);
        };

        self.decompressor.decompress(&algorithm, elem_size, &payload)
    }
}

impl TagHook for TagDecoder {
    fn on_tag(&self, tag: u64, value: CborValue) -> Result<CborValue, DecodeError> {
        self.resolve(tag, value)
    }
}

fn decode_ndarray(order: Order, value: CborValue) -> Result<NdArray, DecodeError> {
    let CborValue::Array(items) = value else {
        return Err(DecodeError::InvalidNdArray("expected [dimensions, contents]".into()));
    };
    let [dims, contents] = <[CborValue; 2]>::try_from(items)
        .map_err(|_| DecodeError::InvalidNdArray("expected [dimensions, contents]".into()))?;

    let shape = match dims {
        CborValue::Array(dims) => dims
            .iter()
            .map(|d| match d {
                CborValue::Int(n) => usize::try_from(*n).ok(),
                _ => None,
            })
            .collect::<Option<Vec<usize>>>()
            .ok_or_else(|| DecodeError::InvalidNdArray("dimensions must be non-negative integers".into()))?,
        _ => return Err(DecodeError::InvalidNdArray("dimensions must be an array".into())),
    };

    let data = match contents {
        CborValue::TypedArray(typed) => typed.data,
        CborValue::NdArray(inner) => inner.data,
        CborValue::Array(items) => materialize(&items)?,
        _ => return Err(DecodeError::ExpectedArray),
    };

    let expected = shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| DecodeError::InvalidNdArray("dimensions overflow".into()))?;
    if data.len() != expected {
        return Err(DecodeError::Reshape {
            expected,
            actual: data.len(),
        });
    }

    let data = match order {
        Order::RowMajor => data,
        Order::ColumnMajor => {
            let shape = &shape;
            map_array_data!(data, v => fortran_to_c(shape, v)?)
        }
    };

    Ok(NdArray { shape, order, data })
}

/// Turn a plain CBOR sequence of numbers into a 1-D buffer.
///
/// All-integer sequences become `int64`, anything containing a float becomes `float64`.
fn materialize(items: &[CborValue]) -> Result<ArrayData, DecodeError> {
    if items.iter().all(|item| matches!(item, CborValue::Int(_))) {
        return items
            .iter()
            .map(|item| match item {
                CborValue::Int(n) => i64::try_from(*n).ok(),
                _ => None,
            })
            .collect::<Option<Vec<i64>>>()
            .map(ArrayData::I64)
            .ok_or_else(|| DecodeError::InvalidNdArray("integer element out of int64 range".into()));
    }

    items
        .iter()
        .map(|item| match item {
            CborValue::Int(n) => Some(*n as f64),
            CborValue::Float(f) => Some(*f),
            _ => None,
        })
        .collect::<Option<Vec<f64>>>()
        .map(ArrayData::F64)
        .ok_or(DecodeError::ExpectedArray)
}

fn fortran_to_c<T: Clone>(shape: &[usize], values: Vec<T>) -> Result<Vec<T>, DecodeError> {
    let view = ArrayViewD::from_shape(IxDyn(shape).f(), &values)
        .map_err(|e| DecodeError::InvalidNdArray(e.to_string()))?;
    Ok(view.iter().cloned().collect())
}
