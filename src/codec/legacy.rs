//! Legacy two-part wire format.
//!
//! ```text
//! part 0: frame id, 8 bytes, signed, little-endian
//! part 1: rows * cols * itemsize(dtype) bytes of row-major pixels, little-endian
//! ```

use super::DecodeError;
use crate::config::FrameConfig;
use crate::frame::{Frame, Image, Pixels};

/// Decode a legacy multipart message into a frame of the configured geometry.
pub fn decode_multipart<P: AsRef<[u8]>>(parts: &[P], frame: &FrameConfig) -> Result<Frame, DecodeError> {
    let [id, pixels] = parts else {
        return Err(DecodeError::Multipart(parts.len()));
    };
    let frame_id = decode_frame_id(id.as_ref())?;

    let pixels = pixels.as_ref();
    let expected = frame.frame_bytes();
    if pixels.len() != expected {
        return Err(DecodeError::PayloadSize {
            expected,
            actual: pixels.len(),
        });
    }

    let image = Image::new(frame.rows, frame.cols, Pixels::from_le_bytes(frame.dtype, pixels)?)?;
    Ok(Frame::new(image, frame_id))
}

fn decode_frame_id(bytes: &[u8]) -> Result<i64, DecodeError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| DecodeError::FrameId(bytes.len()))?;
    Ok(i64::from_le_bytes(raw))
}

/// Encode a frame as a legacy multipart message.
pub fn encode_multipart(frame: &Frame) -> [Vec<u8>; 2] {
    [
        frame.frame_id.to_le_bytes().to_vec(),
        frame.image.pixels().to_le_bytes(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelType;

    fn geometry() -> FrameConfig {
        FrameConfig {
            dtype: PixelType::U16,
            rows: 2,
            cols: 3,
        }
    }

    #[test]
    fn test_decode_multipart() {
        let pixels: Vec<u8> = (0u16..6).flat_map(|v| v.to_le_bytes()).collect();
        let parts = vec![42i64.to_le_bytes().to_vec(), pixels];
        let frame = decode_multipart(&parts, &geometry()).unwrap();
        assert_eq!(frame.frame_id, 42);
        assert_eq!(frame.image.shape(), (2, 3));
        assert_eq!(frame.image.as_slice::<u16>().unwrap(), &[0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_wrong_part_count() {
        let parts = vec![vec![0u8; 8]];
        assert!(matches!(
            decode_multipart(&parts, &geometry()),
            Err(DecodeError::Multipart(1))
        ));
    }

    #[test]
    fn test_wrong_sizes() {
        let parts = vec![vec![0u8; 4], vec![0u8; 12]];
        assert!(matches!(
            decode_multipart(&parts, &geometry()),
            Err(DecodeError::FrameId(4))
        ));

        let parts = vec![vec![0u8; 8], vec![0u8; 10]];
        assert!(matches!(
            decode_multipart(&parts, &geometry()),
            Err(DecodeError::PayloadSize { expected: 12, actual: 10 })
        ));
    }

    #[test]
    fn test_encode_roundtrip_negative_id() {
        let image = Image::from_vec(2, 3, vec![7u16; 6]).unwrap();
        let frame = Frame::new(image, -5);
        let parts = encode_multipart(&frame);
        assert_eq!(decode_multipart(&parts, &geometry()).unwrap(), frame);
    }
}
