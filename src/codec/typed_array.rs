//! Homogeneous typed element buffers decoded from CBOR typed-array tags.

use half::f16;

use super::DecodeError;
use crate::frame::Pixels;

/// Element type of a typed array on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
    F128,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn itemsize(self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 | ElementType::F16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 | ElementType::I64 | ElementType::F64 => 8,
            ElementType::F128 => 16,
        }
    }
}

/// Byte order of a typed array payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endian {
    Big,
    Little,
}

/// IEEE 754 binary128 value kept as raw bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Quad(pub u128);

impl Quad {
    const EXP_BIAS: i32 = 16383;
    const FRAC_BITS: u32 = 112;

    /// Nearest-below `f64` value (mantissa truncated to 52 bits).
    pub fn to_f64(self) -> f64 {
        let bits = self.0;
        let negative = bits >> 127 == 1;
        let exp = ((bits >> Self::FRAC_BITS) & 0x7fff) as i32;
        let frac = bits & ((1u128 << Self::FRAC_BITS) - 1);
        let top = (frac >> (Self::FRAC_BITS - 52)) as u64;
        let sign = if negative { -1.0 } else { 1.0 };

        if exp == 0x7fff {
            return if frac == 0 { sign * f64::INFINITY } else { f64::NAN };
        }
        if exp == 0 {
            // binary128 subnormals are far below the f64 range
            return sign * 0.0;
        }

        let sign_bit = if negative { 1u64 << 63 } else { 0 };
        let biased = exp - Self::EXP_BIAS + 1023;
        if biased >= 0x7ff {
            return sign * f64::INFINITY;
        }
        if biased <= 0 {
            let shift = (1 - biased) as u32;
            if shift > 53 {
                return sign * 0.0;
            }
            return f64::from_bits(sign_bit | (((1u64 << 52) | top) >> shift));
        }

        f64::from_bits(sign_bit | ((biased as u64) << 52) | top)
    }

    /// Exact binary128 encoding of an `f64`.
    pub fn from_f64(value: f64) -> Self {
        let bits = value.to_bits();
        let sign = u128::from(bits >> 63) << 127;
        let exp = ((bits >> 52) & 0x7ff) as i32;
        let frac = u128::from(bits & ((1u64 << 52) - 1));

        if exp == 0 && frac == 0 {
            return Quad(sign);
        }
        if exp == 0x7ff {
            let nan = if frac == 0 { 0 } else { 1u128 << (Self::FRAC_BITS - 1) };
            return Quad(sign | (0x7fffu128 << Self::FRAC_BITS) | nan);
        }
        if exp == 0 {
            // f64 subnormal: normalise into binary128's wider exponent range
            let shift = frac.leading_zeros() - (128 - 52);
            let frac = (frac << (shift + 1)) & ((1u128 << 52) - 1);
            let exp = 1 - 1023 - shift as i32 - 1 + Self::EXP_BIAS;
            return Quad(sign | ((exp as u128) << Self::FRAC_BITS) | (frac << (Self::FRAC_BITS - 52)));
        }

        let exp = (exp - 1023 + Self::EXP_BIAS) as u128;
        Quad(sign | (exp << Self::FRAC_BITS) | (frac << (Self::FRAC_BITS - 52)))
    }
}

/// Decoded element buffer, one variant per [`ElementType`].
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F16(Vec<f16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    F128(Vec<Quad>),
}

/// Expands `$body` once per [`ArrayData`] variant, rebuilding the same variant.
macro_rules! map_array_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            ArrayData::U8($v) => ArrayData::U8($body),
            ArrayData::U16($v) => ArrayData::U16($body),
            ArrayData::U32($v) => ArrayData::U32($body),
            ArrayData::U64($v) => ArrayData::U64($body),
            ArrayData::I8($v) => ArrayData::I8($body),
            ArrayData::I16($v) => ArrayData::I16($body),
            ArrayData::I32($v) => ArrayData::I32($body),
            ArrayData::I64($v) => ArrayData::I64($body),
            ArrayData::F16($v) => ArrayData::F16($body),
            ArrayData::F32($v) => ArrayData::F32($body),
            ArrayData::F64($v) => ArrayData::F64($body),
            ArrayData::F128($v) => ArrayData::F128($body),
        }
    };
}
pub(crate) use map_array_data;

impl ArrayData {
    /// Interpret `bytes` as elements of `element` in the given byte order.
    ///
    /// Fails when the byte length is not a multiple of the element size.
    pub fn from_bytes(element: ElementType, endian: Endian, bytes: &[u8]) -> Result<Self, DecodeError> {
        let itemsize = element.itemsize();
        if bytes.len() % itemsize != 0 {
            return Err(DecodeError::Length {
                len: bytes.len(),
                itemsize,
            });
        }

        macro_rules! read {
            ($t:ty) => {
                bytes
                    .chunks_exact(itemsize)
                    .map(|chunk| {
                        let mut raw = [0u8; std::mem::size_of::<$t>()];
                        raw.copy_from_slice(chunk);
                        match endian {
                            Endian::Big => <$t>::from_be_bytes(raw),
                            Endian::Little => <$t>::from_le_bytes(raw),
                        }
                    })
                    .collect()
            };
        }

        Ok(match element {
            ElementType::U8 => ArrayData::U8(bytes.to_vec()),
            ElementType::U16 => ArrayData::U16(read!(u16)),
            ElementType::U32 => ArrayData::U32(read!(u32)),
            ElementType::U64 => ArrayData::U64(read!(u64)),
            ElementType::I8 => ArrayData::I8(read!(i8)),
            ElementType::I16 => ArrayData::I16(read!(i16)),
            ElementType::I32 => ArrayData::I32(read!(i32)),
            ElementType::I64 => ArrayData::I64(read!(i64)),
            ElementType::F16 => ArrayData::F16(read!(f16)),
            ElementType::F32 => ArrayData::F32(read!(f32)),
            ElementType::F64 => ArrayData::F64(read!(f64)),
            ElementType::F128 => {
                let values: Vec<u128> = read!(u128);
                ArrayData::F128(values.into_iter().map(Quad).collect())
            }
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            ArrayData::U8(v) => v.len(),
            ArrayData::U16(v) => v.len(),
            ArrayData::U32(v) => v.len(),
            ArrayData::U64(v) => v.len(),
            ArrayData::I8(v) => v.len(),
            ArrayData::I16(v) => v.len(),
            ArrayData::I32(v) => v.len(),
            ArrayData::I64(v) => v.len(),
            ArrayData::F16(v) => v.len(),
            ArrayData::F32(v) => v.len(),
            ArrayData::F64(v) => v.len(),
            ArrayData::F128(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn element_type(&self) -> ElementType {
        match self {
            ArrayData::U8(_) => ElementType::U8,
            ArrayData::U16(_) => ElementType::U16,
            ArrayData::U32(_) => ElementType::U32,
            ArrayData::U64(_) => ElementType::U64,
            ArrayData::I8(_) => ElementType::I8,
            ArrayData::I16(_) => ElementType::I16,
            ArrayData::I32(_) => ElementType::I32,
            ArrayData::I64(_) => ElementType::I64,
            ArrayData::F16(_) => ElementType::F16,
            ArrayData::F32(_) => ElementType::F32,
            ArrayData::F64(_) => ElementType::F64,
            ArrayData::F128(_) => ElementType::F128,
        }
    }
}

impl From<ArrayData> for Pixels {
    /// Half floats widen to `float32`, binary128 narrows to `float64`.
    fn from(data: ArrayData) -> Self {
        match data {
            ArrayData::U8(v) => Pixels::U8(v),
            ArrayData::U16(v) => Pixels::U16(v),
            ArrayData::U32(v) => Pixels::U32(v),
            ArrayData::U64(v) => Pixels::U64(v),
            ArrayData::I8(v) => Pixels::I8(v),
            ArrayData::I16(v) => Pixels::I16(v),
            ArrayData::I32(v) => Pixels::I32(v),
            ArrayData::I64(v) => Pixels::I64(v),
            ArrayData::F16(v) => Pixels::F32(v.into_iter().map(f16::to_f32).collect()),
            ArrayData::F32(v) => Pixels::F32(v),
            ArrayData::F64(v) => Pixels::F64(v),
            ArrayData::F128(v) => Pixels::F64(v.into_iter().map(Quad::to_f64).collect()),
        }
    }
}

/// A typed array as carried by tags 64-87.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArray {
    pub element: ElementType,
    pub endian: Endian,
    pub data: ArrayData,
}

impl TypedArray {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
