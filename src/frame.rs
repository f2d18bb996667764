//! Frame and image types shared by the transport, the store and the accumulator.
//!
//! A [`Frame`] is created when a wire message is decoded, consumed exactly once by a
//! worker loop and then dropped. Pixel storage is a flat, row-major buffer tagged with
//! its [`PixelType`]; `ndarray` views are handed out on demand for HDF5 I/O.

use std::fmt;
use std::str::FromStr;

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::codec::DecodeError;

/// Pixel types an image (and the HDF5 store) can hold.
///
/// Names follow numpy dtype naming so that configuration files read naturally for
/// the people writing the downstream analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "uint64")]
    U64,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
}

impl PixelType {
    /// All pixel types, in declaration order.
    pub const ALL: [PixelType; 10] = [
        PixelType::U8,
        PixelType::U16,
        PixelType::U32,
        PixelType::U64,
        PixelType::I8,
        PixelType::I16,
        PixelType::I32,
        PixelType::I64,
        PixelType::F32,
        PixelType::F64,
    ];

    /// Size of one pixel in bytes.
    pub fn itemsize(self) -> usize {
        match self {
            PixelType::U8 | PixelType::I8 => 1,
            PixelType::U16 | PixelType::I16 => 2,
            PixelType::U32 | PixelType::I32 | PixelType::F32 => 4,
            PixelType::U64 | PixelType::I64 | PixelType::F64 => 8,
        }
    }

    /// Whether the type is a floating point type.
    pub fn is_float(self) -> bool {
        matches!(self, PixelType::F32 | PixelType::F64)
    }

    /// numpy-style name (`uint16`, `float32`, ...).
    pub fn name(self) -> &'static str {
        match self {
            PixelType::U8 => "uint8",
            PixelType::U16 => "uint16",
            PixelType::U32 => "uint32",
            PixelType::U64 => "uint64",
            PixelType::I8 => "int8",
            PixelType::I16 => "int16",
            PixelType::I32 => "int32",
            PixelType::I64 => "int64",
            PixelType::F32 => "float32",
            PixelType::F64 => "float64",
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PixelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PixelType::ALL
            .iter()
            .copied()
            .find(|ty| ty.name() == s.to_lowercase())
            .ok_or_else(|| format!("Unknown pixel type '{s}'"))
    }
}

/// Flat pixel buffer, one variant per [`PixelType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Pixels {
    U8(Vec<u8>),
    U16(Vec<u16>),
    U32(Vec<u32>),
    U64(Vec<u64>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Expands `$body` once per [`Pixels`] variant with `$v` bound to the inner `Vec`.
macro_rules! with_pixels {
    ($pixels:expr, $v:ident => $body:expr) => {
        match $pixels {
            $crate::frame::Pixels::U8($v) => $body,
            $crate::frame::Pixels::U16($v) => $body,
            $crate::frame::Pixels::U32($v) => $body,
            $crate::frame::Pixels::U64($v) => $body,
            $crate::frame::Pixels::I8($v) => $body,
            $crate::frame::Pixels::I16($v) => $body,
            $crate::frame::Pixels::I32($v) => $body,
            $crate::frame::Pixels::I64($v) => $body,
            $crate::frame::Pixels::F32($v) => $body,
            $crate::frame::Pixels::F64($v) => $body,
        }
    };
}
pub(crate) use with_pixels;

impl Pixels {
    /// Number of pixels.
    pub fn len(&self) -> usize {
        with_pixels!(self, v => v.len())
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pixel type of the buffer.
    pub fn dtype(&self) -> PixelType {
        match self {
            Pixels::U8(_) => PixelType::U8,
            Pixels::U16(_) => PixelType::U16,
            Pixels::U32(_) => PixelType::U32,
            Pixels::U64(_) => PixelType::U64,
            Pixels::I8(_) => PixelType::I8,
            Pixels::I16(_) => PixelType::I16,
            Pixels::I32(_) => PixelType::I32,
            Pixels::I64(_) => PixelType::I64,
            Pixels::F32(_) => PixelType::F32,
            Pixels::F64(_) => PixelType::F64,
        }
    }

    /// Zero-filled buffer of `len` pixels.
    pub fn zeros(dtype: PixelType, len: usize) -> Self {
        match dtype {
            PixelType::U8 => Pixels::U8(vec![0; len]),
            PixelType::U16 => Pixels::U16(vec![0; len]),
            PixelType::U32 => Pixels::U32(vec![0; len]),
            PixelType::U64 => Pixels::U64(vec![0; len]),
            PixelType::I8 => Pixels::I8(vec![0; len]),
            PixelType::I16 => Pixels::I16(vec![0; len]),
            PixelType::I32 => Pixels::I32(vec![0; len]),
            PixelType::I64 => Pixels::I64(vec![0; len]),
            PixelType::F32 => Pixels::F32(vec![0.0; len]),
            PixelType::F64 => Pixels::F64(vec![0.0; len]),
        }
    }

    /// Interpret little-endian raw bytes as pixels of `dtype`.
    pub fn from_le_bytes(dtype: PixelType, bytes: &[u8]) -> Result<Self, DecodeError> {
        let itemsize = dtype.itemsize();
        if bytes.len() % itemsize != 0 {
            return Err(DecodeError::Length {
                len: bytes.len(),
                itemsize,
            });
        }

        macro_rules! decode_le {
            ($variant:ident, $t:ty) => {
                Pixels::$variant(
                    bytes
                        .chunks_exact(itemsize)
                        .map(|chunk| {
                            let mut raw = [0u8; std::mem::size_of::<$t>()];
                            raw.copy_from_slice(chunk);
                            <$t>::from_le_bytes(raw)
                        })
                        .collect(),
                )
            };
        }

        Ok(match dtype {
            PixelType::U8 => Pixels::U8(bytes.to_vec()),
            PixelType::U16 => decode_le!(U16, u16),
            PixelType::U32 => decode_le!(U32, u32),
            PixelType::U64 => decode_le!(U64, u64),
            PixelType::I8 => decode_le!(I8, i8),
            PixelType::I16 => decode_le!(I16, i16),
            PixelType::I32 => decode_le!(I32, i32),
            PixelType::I64 => decode_le!(I64, i64),
            PixelType::F32 => decode_le!(F32, f32),
            PixelType::F64 => decode_le!(F64, f64),
        })
    }

    /// Serialize pixels as little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        with_pixels!(self, v => v.iter().flat_map(|x| x.to_le_bytes()).collect())
    }

    /// Convert to another pixel type with `as` semantics.
    ///
    /// Float to integer conversions saturate; integer narrowing wraps.
    pub fn cast(&self, dtype: PixelType) -> Pixels {
        if self.dtype() == dtype {
            return self.clone();
        }

        macro_rules! convert {
            ($src:expr) => {
                match dtype {
                    PixelType::U8 => Pixels::U8($src.iter().map(|&x| x as u8).collect()),
                    PixelType::U16 => Pixels::U16($src.iter().map(|&x| x as u16).collect()),
                    PixelType::U32 => Pixels::U32($src.iter().map(|&x| x as u32).collect()),
                    PixelType::U64 => Pixels::U64($src.iter().map(|&x| x as u64).collect()),
                    PixelType::I8 => Pixels::I8($src.iter().map(|&x| x as i8).collect()),
                    PixelType::I16 => Pixels::I16($src.iter().map(|&x| x as i16).collect()),
                    PixelType::I32 => Pixels::I32($src.iter().map(|&x| x as i32).collect()),
                    PixelType::I64 => Pixels::I64($src.iter().map(|&x| x as i64).collect()),
                    PixelType::F32 => Pixels::F32($src.iter().map(|&x| x as f32).collect()),
                    PixelType::F64 => Pixels::F64($src.iter().map(|&x| x as f64).collect()),
                }
            };
        }

        with_pixels!(self, v => convert!(v))
    }
}

/// Rust element types that can live in a [`Pixels`] buffer.
pub trait Pixel: Copy + Default + Send + Sync + 'static {
    /// Matching pixel type tag.
    const DTYPE: PixelType;

    /// Borrow the buffer if it holds this type.
    fn slice(pixels: &Pixels) -> Option<&[Self]>;

    /// Wrap an owned vector.
    fn wrap(values: Vec<Self>) -> Pixels;
}

macro_rules! impl_pixel {
    ($t:ty, $variant:ident) => {
        impl Pixel for $t {
            const DTYPE: PixelType = PixelType::$variant;

            fn slice(pixels: &Pixels) -> Option<&[Self]> {
                match pixels {
                    Pixels::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(values: Vec<Self>) -> Pixels {
                Pixels::$variant(values)
            }
        }
    };
}

impl_pixel!(u8, U8);
impl_pixel!(u16, U16);
impl_pixel!(u32, U32);
impl_pixel!(u64, U64);
impl_pixel!(i8, I8);
impl_pixel!(i16, I16);
impl_pixel!(i32, I32);
impl_pixel!(i64, I64);
impl_pixel!(f32, F32);
impl_pixel!(f64, F64);

/// A 2-D image in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    rows: usize,
    cols: usize,
    pixels: Pixels,
}

impl Image {
    /// Create an image, checking that the buffer holds exactly `rows * cols` pixels.
    pub fn new(rows: usize, cols: usize, pixels: Pixels) -> Result<Self, DecodeError> {
        let expected = rows * cols;
        if pixels.len() != expected {
            return Err(DecodeError::Reshape {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self { rows, cols, pixels })
    }

    /// Create an image from a typed vector.
    pub fn from_vec<T: Pixel>(rows: usize, cols: usize, values: Vec<T>) -> Result<Self, DecodeError> {
        Self::new(rows, cols, T::wrap(values))
    }

    /// Zero-filled image.
    pub fn zeros(rows: usize, cols: usize, dtype: PixelType) -> Self {
        Self {
            rows,
            cols,
            pixels: Pixels::zeros(dtype, rows * cols),
        }
    }

    /// `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn dtype(&self) -> PixelType {
        self.pixels.dtype()
    }

    pub fn pixels(&self) -> &Pixels {
        &self.pixels
    }

    pub fn into_pixels(self) -> Pixels {
        self.pixels
    }

    /// Borrow the flat pixel slice as `T`, if the image holds that type.
    pub fn as_slice<T: Pixel>(&self) -> Option<&[T]> {
        T::slice(&self.pixels)
    }

    /// 2-D view as `T`, if the image holds that type.
    pub fn view<T: Pixel>(&self) -> Option<ArrayView2<'_, T>> {
        let slice = T::slice(&self.pixels)?;
        ArrayView2::from_shape((self.rows, self.cols), slice).ok()
    }

    /// Copy of the image converted to `dtype`.
    pub fn cast(&self, dtype: PixelType) -> Image {
        Image {
            rows: self.rows,
            cols: self.cols,
            pixels: self.pixels.cast(dtype),
        }
    }
}

/// One decoded detector frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image: Image,
    pub frame_id: i64,
}

impl Frame {
    pub fn new(image: Image, frame_id: i64) -> Self {
        Self { image, frame_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_type_names_roundtrip() {
        for ty in PixelType::ALL {
            assert_eq!(ty.name().parse::<PixelType>().unwrap(), ty);
        }
        assert!("complex64".parse::<PixelType>().is_err());
        assert_eq!("Float32".parse::<PixelType>().unwrap(), PixelType::F32);
    }

    #[test]
    fn test_itemsize() {
        assert_eq!(PixelType::U8.itemsize(), 1);
        assert_eq!(PixelType::I16.itemsize(), 2);
        assert_eq!(PixelType::F32.itemsize(), 4);
        assert_eq!(PixelType::U64.itemsize(), 8);
    }

    #[test]
    fn test_from_le_bytes_length_check() {
        let err = Pixels::from_le_bytes(PixelType::U16, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, DecodeError::Length { len: 3, itemsize: 2 }));

        let pixels = Pixels::from_le_bytes(PixelType::U16, &[1, 0, 0, 1]).unwrap();
        assert_eq!(pixels, Pixels::U16(vec![1, 256]));
    }

    #[test]
    fn test_cast_float_to_int_saturates() {
        let pixels = Pixels::F32(vec![-1.5, 2.7, 300.0]);
        assert_eq!(pixels.cast(PixelType::U8), Pixels::U8(vec![0, 2, 255]));
        assert_eq!(pixels.cast(PixelType::F32), pixels);
    }

    #[test]
    fn test_image_shape_validation() {
        assert!(Image::from_vec(2, 3, vec![0u16; 6]).is_ok());
        let err = Image::from_vec(2, 3, vec![0u16; 5]).unwrap_err();
        assert!(matches!(err, DecodeError::Reshape { expected: 6, actual: 5 }));
    }

    #[test]
    fn test_image_view() {
        let image = Image::from_vec(2, 2, vec![1i32, 2, 3, 4]).unwrap();
        let view = image.view::<i32>().unwrap();
        assert_eq!(view[[1, 0]], 3);
        assert!(image.view::<u16>().is_none());
    }
}
