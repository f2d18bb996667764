//! Vendor compression envelopes (tag 56500).
//!
//! Two algorithms are understood, both using the HDF5 filter framing the detector
//! vendor also writes to disk:
//!
//! ```text
//! [u64 BE total bytes][u32 BE block bytes] { [u32 BE compressed len][block] }*
//! ```
//!
//! - `lz4`: each block is an LZ4 block; a block whose compressed length equals its raw
//!   length is stored uncompressed.
//! - `bslz4`: each block is bitshuffled before LZ4 compression. Blocks hold a multiple
//!   of 8 elements; the final `< 8` elements are appended raw after the last block.

use super::DecodeError;

const HEADER_LEN: usize = 12;

/// Default bitshuffle block size in bytes when the header carries zero.
const DEFAULT_BLOCK_BYTES: usize = 8192;

/// Upper bound on how many output bytes one LZ4 input byte can expand to.
const MAX_LZ4_RATIO: usize = 256;

/// Decompressor invoked for every compression envelope.
pub trait Decompressor: Send + Sync {
    /// Decompress `payload` produced by `algorithm` with elements of `elem_size` bytes.
    fn decompress(&self, algorithm: &str, elem_size: usize, payload: &[u8]) -> Result<Vec<u8>, DecodeError>;
}

/// `lz4` / `bslz4` decompressor backed by `lz4_flex`.
#[derive(Debug, Default, Clone, Copy)]
pub struct VendorDecompressor;

impl Decompressor for VendorDecompressor {
    fn decompress(&self, algorithm: &str, elem_size: usize, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        match algorithm {
            "bslz4" => bslz4_decompress(payload, elem_size),
            "lz4" => lz4_decompress(payload),
            other => Err(DecodeError::UnsupportedCompression(other.to_string())),
        }
    }
}

fn corrupt(reason: impl Into<String>) -> DecodeError {
    DecodeError::Decompression(reason.into())
}

fn read_header(payload: &[u8]) -> Result<(usize, usize, &[u8]), DecodeError> {
    if payload.len() < HEADER_LEN {
        return Err(corrupt(format!("header needs {HEADER_LEN} bytes, got {}", payload.len())));
    }
    let mut total = [0u8; 8];
    total.copy_from_slice(&payload[..8]);
    let mut block = [0u8; 4];
    block.copy_from_slice(&payload[8..HEADER_LEN]);

    let total = usize::try_from(u64::from_be_bytes(total)).map_err(|_| corrupt("total size overflows"))?;
    let rest = &payload[HEADER_LEN..];
    let limit = max_decoded_len(rest.len());
    if total > limit {
        return Err(corrupt(format!(
            "header claims {total} bytes, {} compressed bytes decode to at most {limit}",
            rest.len()
        )));
    }
    Ok((total, u32::from_be_bytes(block) as usize, rest))
}

/// Largest output `compressed` bytes of LZ4 data (plus raw tail) can produce.
fn max_decoded_len(compressed: usize) -> usize {
    compressed.saturating_add(1).saturating_mul(MAX_LZ4_RATIO)
}

/// Split off one length-prefixed block.
fn next_block(rest: &[u8]) -> Result<(&[u8], &[u8]), DecodeError> {
    if rest.len() < 4 {
        return Err(corrupt("truncated block length"));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&rest[..4]);
    let len = u32::from_be_bytes(len) as usize;
    let body = &rest[4..];
    if body.len() < len {
        return Err(corrupt(format!("block needs {len} bytes, {} left", body.len())));
    }
    Ok(body.split_at(len))
}

fn lz4_block(block: &[u8], raw_len: usize) -> Result<Vec<u8>, DecodeError> {
    if raw_len > max_decoded_len(block.len()) {
        return Err(corrupt(format!("{}-byte block cannot hold {raw_len} bytes", block.len())));
    }
    let out = lz4_flex::block::decompress(block, raw_len).map_err(|e| corrupt(e.to_string()))?;
    if out.len() != raw_len {
        return Err(corrupt(format!("block decompressed to {} bytes, expected {raw_len}", out.len())));
    }
    Ok(out)
}

/// Decode an `lz4` envelope payload.
pub fn lz4_decompress(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let (total, block_bytes, mut rest) = read_header(payload)?;
    if block_bytes == 0 && total > 0 {
        return Err(corrupt("zero block size"));
    }

    let mut out = Vec::new();
    while out.len() < total {
        let raw_len = block_bytes.min(total - out.len());
        let (block, tail) = next_block(rest)?;
        if block.len() == raw_len {
            out.extend_from_slice(block);
        } else {
            out.extend_from_slice(&lz4_block(block, raw_len)?);
        }
        rest = tail;
    }
    Ok(out)
}

/// Encode `data` as an `lz4` envelope payload.
pub fn lz4_compress(data: &[u8], block_bytes: usize) -> Vec<u8> {
    let block_bytes = block_bytes.max(1);
    let mut out = Vec::with_capacity(HEADER_LEN + data.len());
    out.extend_from_slice(&(data.len() as u64).to_be_bytes());
    out.extend_from_slice(&(block_bytes as u32).to_be_bytes());
    for chunk in data.chunks(block_bytes) {
        let compressed = lz4_flex::block::compress(chunk);
        let block = if compressed.len() >= chunk.len() {
            chunk
        } else {
            compressed.as_slice()
        };
        out.extend_from_slice(&(block.len() as u32).to_be_bytes());
        out.extend_from_slice(block);
    }
    out
}

/// Decode a `bslz4` envelope payload.
pub fn bslz4_decompress(payload: &[u8], elem_size: usize) -> Result<Vec<u8>, DecodeError> {
    if elem_size == 0 {
        return Err(corrupt("zero element size"));
    }
    let (total, block_bytes, mut rest) = read_header(payload)?;
    if total % elem_size != 0 {
        return Err(corrupt(format!("{total} bytes is not a whole number of {elem_size}-byte elements")));
    }
    let block_bytes = if block_bytes == 0 {
        DEFAULT_BLOCK_BYTES
    } else {
        block_bytes
    };
    let block_elems = block_bytes / elem_size;
    if block_elems == 0 || block_elems % 8 != 0 {
        return Err(corrupt(format!("block of {block_elems} elements is not a multiple of 8")));
    }

    let mut out = Vec::new();
    let mut remaining = total / elem_size;
    while remaining >= 8 {
        let elems = if remaining >= block_elems {
            block_elems
        } else {
            remaining - remaining % 8
        };
        let (block, tail) = next_block(rest)?;
        let shuffled = lz4_block(block, elems * elem_size)?;
        out.extend_from_slice(&bit_unshuffle(&shuffled, elems, elem_size));
        rest = tail;
        remaining -= elems;
    }

    let leftover = remaining * elem_size;
    let raw = rest
        .get(..leftover)
        .ok_or_else(|| corrupt(format!("missing {leftover} trailing raw bytes")))?;
    out.extend_from_slice(raw);
    Ok(out)
}

/// Encode `data` as a `bslz4` envelope payload.
pub fn bslz4_compress(data: &[u8], elem_size: usize, block_elems: usize) -> Vec<u8> {
    let elem_size = elem_size.max(1);
    let block_elems = (block_elems.max(8) / 8) * 8;
    let mut out = Vec::with_capacity(HEADER_LEN + data.len());
    out.extend_from_slice(&(data.len() as u64).to_be_bytes());
    out.extend_from_slice(&((block_elems * elem_size) as u32).to_be_bytes());

    let n = data.len() / elem_size;
    let mut offset = 0;
    let mut remaining = n;
    while remaining >= 8 {
        let elems = if remaining >= block_elems {
            block_elems
        } else {
            remaining - remaining % 8
        };
        let bytes = &data[offset * elem_size..(offset + elems) * elem_size];
        let compressed = lz4_flex::block::compress(&bit_shuffle(bytes, elems, elem_size));
        out.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
        out.extend_from_slice(&compressed);
        offset += elems;
        remaining -= elems;
    }
    out.extend_from_slice(&data[offset * elem_size..n * elem_size]);
    out
}

/// Bit-transpose `n` elements (a multiple of 8) of `elem_size` bytes.
///
/// Output row `8 * b + j` holds bit `j` of byte `b` of every element, packed
/// least-significant bit first.
pub fn bit_shuffle(input: &[u8], n: usize, elem_size: usize) -> Vec<u8> {
    let row = n / 8;
    let mut out = vec![0u8; n * elem_size];
    for i in 0..n {
        for b in 0..elem_size {
            let byte = input[i * elem_size + b];
            for j in 0..8 {
                out[(b * 8 + j) * row + i / 8] |= ((byte >> j) & 1) << (i % 8);
            }
        }
    }
    out
}

/// Inverse of [`bit_shuffle`].
pub fn bit_unshuffle(input: &[u8], n: usize, elem_size: usize) -> Vec<u8> {
    let row = n / 8;
    let mut out = vec![0u8; n * elem_size];
    for b in 0..elem_size {
        for j in 0..8 {
            let base = (b * 8 + j) * row;
            for i in 0..n {
                let bit = (input[base + i / 8] >> (i % 8)) & 1;
                out[i * elem_size + b] |= bit << j;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_u16(n: usize) -> Vec<u8> {
        (0..n as u16).flat_map(|v| v.wrapping_mul(37).to_le_bytes()).collect()
    }

    #[test]
    fn test_bit_shuffle_layout() {
        // 8 one-byte elements, only element 0 has bit 0 set
        let mut input = vec![0u8; 8];
        input[0] = 1;
        let shuffled = bit_shuffle(&input, 8, 1);
        assert_eq!(shuffled, vec![1, 0, 0, 0, 0, 0, 0, 0]);

        // element 3 has bit 2 set -> row 2, bit 3
        let mut input = vec![0u8; 8];
        input[3] = 0b100;
        let shuffled = bit_shuffle(&input, 8, 1);
        assert_eq!(shuffled[2], 0b1000);
        assert_eq!(bit_unshuffle(&shuffled, 8, 1), input);
    }

    #[test]
    fn test_bslz4_with_partial_block_and_tail() {
        // 2 full blocks of 64, a 16-element partial block and 3 raw trailing elements
        let data = ramp_u16(64 * 2 + 16 + 3);
        let payload = bslz4_compress(&data, 2, 64);
        assert_eq!(bslz4_decompress(&payload, 2).unwrap(), data);
    }

    #[test]
    fn test_lz4_raw_and_compressed_blocks() {
        let mut data = vec![0u8; 1000];
        data.extend((0..=255u8).collect::<Vec<_>>());
        let payload = lz4_compress(&data, 256);
        assert_eq!(lz4_decompress(&payload).unwrap(), data);
    }

    #[test]
    fn test_vendor_decompressor_dispatch() {
        let data = ramp_u16(100);
        let decompressor = VendorDecompressor;
        let payload = bslz4_compress(&data, 2, 8192);
        assert_eq!(decompressor.decompress("bslz4", 2, &payload).unwrap(), data);
        assert!(matches!(
            decompressor.decompress("zstd", 2, &payload),
            Err(DecodeError::UnsupportedCompression(name)) if name == "zstd"
        ));
    }

    #[test]
    fn test_truncated_payload_fails() {
        let data = ramp_u16(256);
        let payload = bslz4_compress(&data, 2, 128);
        assert!(bslz4_decompress(&payload[..payload.len() - 5], 2).is_err());
        assert!(lz4_decompress(&[0; 4]).is_err());
    }

    fn forged_header(total: u64, block_bytes: u32) -> Vec<u8> {
        let mut payload = total.to_be_bytes().to_vec();
        payload.extend_from_slice(&block_bytes.to_be_bytes());
        payload
    }

    #[test]
    fn test_forged_total_is_rejected_before_allocation() {
        for total in [u64::MAX, 1 << 46, 1 << 20] {
            let payload = forged_header(total, 8192);
            assert!(matches!(lz4_decompress(&payload), Err(DecodeError::Decompression(_))), "{total}");
            assert!(
                matches!(bslz4_decompress(&payload, 2), Err(DecodeError::Decompression(_))),
                "{total}"
            );
        }
    }

    #[test]
    fn test_forged_block_size_is_rejected() {
        // honest total, but a tiny block claiming to expand to far more than LZ4 allows
        let mut payload = forged_header(4096, u32::MAX);
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&[0, 0]);
        payload.extend_from_slice(&[0; 16]);
        assert!(matches!(lz4_decompress(&payload), Err(DecodeError::Decompression(_))));
    }

    #[test]
    fn test_highly_compressible_frame_still_decodes() {
        let data = vec![0u8; 514 * 1030 * 2];
        assert_eq!(lz4_decompress(&lz4_compress(&data, 8192)).unwrap(), data);
        assert_eq!(bslz4_decompress(&bslz4_compress(&data, 2, 4096), 2).unwrap(), data);
    }
}
