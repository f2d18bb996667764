//! Generic CBOR document decoder with a per-tag hook.
//!
//! The decoder walks a document with `minicbor` and builds a [`CborValue`] tree. Every
//! tag it meets is handed to a [`TagHook`] together with its already-decoded inner
//! value, so nested tags resolve innermost first (a compression envelope inside a
//! typed-array tag is decompressed before the typed array sees it).

use minicbor::data::Type;
use minicbor::Decoder;

use super::tags::NdArray;
use super::typed_array::TypedArray;
use super::DecodeError;

/// Maximum container nesting accepted in one document.
pub const MAX_DEPTH: usize = 32;

/// Decoded CBOR item, including the domain values tag hooks produce.
#[derive(Debug, Clone, PartialEq)]
pub enum CborValue {
    Null,
    Undefined,
    Bool(bool),
    Int(i128),
    Float(f64),
    Simple(u8),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<CborValue>),
    Map(Vec<(CborValue, CborValue)>),
    /// A tag the hook left unresolved.
    Tagged(u64, Box<CborValue>),
    TypedArray(TypedArray),
    NdArray(NdArray),
}

impl CborValue {
    /// Look up a text key in a map.
    pub fn get(&self, key: &str) -> Option<&CborValue> {
        match self {
            CborValue::Map(entries) => entries
                .iter()
                .find(|(k, _)| matches!(k, CborValue::Text(t) if t == key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Remove and return the value for a text key in a map.
    pub fn take(&mut self, key: &str) -> Option<CborValue> {
        match self {
            CborValue::Map(entries) => {
                let idx = entries
                    .iter()
                    .position(|(k, _)| matches!(k, CborValue::Text(t) if t == key))?;
                Some(entries.swap_remove(idx).1)
            }
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CborValue::Int(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CborValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Called for every tag encountered while decoding a document.
pub trait TagHook {
    /// Map `(tag, inner value)` to a domain value.
    fn on_tag(&self, tag: u64, value: CborValue) -> Result<CborValue, DecodeError>;
}

/// Hook that leaves every tag unresolved.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityHook;

impl TagHook for IdentityHook {
    fn on_tag(&self, tag: u64, value: CborValue) -> Result<CborValue, DecodeError> {
        Ok(CborValue::Tagged(tag, Box::new(value)))
    }
}

/// Decode one complete CBOR document.
///
/// Indefinite-length items are rejected; trailing bytes after the document are an error.
pub fn decode_document<H: TagHook + ?Sized>(bytes: &[u8], hook: &H) -> Result<CborValue, DecodeError> {
    let mut dec = Decoder::new(bytes);
    let value = decode_value(&mut dec, hook, 0)?;
    let trailing = bytes.len() - dec.position();
    if trailing != 0 {
        return Err(DecodeError::TrailingBytes(trailing));
    }
    Ok(value)
}

fn decode_value<H: TagHook + ?Sized>(
    dec: &mut Decoder<'_>,
    hook: &H,
    depth: usize,
) -> Result<CborValue, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep(MAX_DEPTH));
    }

    let value = match dec.datatype()? {
        Type::Bool => CborValue::Bool(dec.bool()?),
        Type::Null => {
            dec.null()?;
            CborValue::Null
        }
        Type::Undefined => {
            dec.undefined()?;
            CborValue::Undefined
        }
        Type::U8
        | Type::U16
        | Type::U32
        | Type::U64
        | Type::I8
        | Type::I16
        | Type::I32
        | Type::I64
        | Type::Int => CborValue::Int(i128::from(dec.int()?)),
        Type::F16 | Type::F32 | Type::F64 => CborValue::Float(dec.f64()?),
        Type::Simple => CborValue::Simple(dec.simple()?),
        Type::Bytes => CborValue::Bytes(dec.bytes()?.to_vec()),
        Type::String => CborValue::Text(dec.str()?.to_owned()),
        Type::Array => {
            let len = dec.array()?.ok_or(DecodeError::IndefiniteLength)?;
            let mut items = Vec::with_capacity((len as usize).min(1024));
            for _ in 0..len {
                items.push(decode_value(dec, hook, depth + 1)?);
            }
            CborValue::Array(items)
        }
        Type::Map => {
            let len = dec.map()?.ok_or(DecodeError::IndefiniteLength)?;
            let mut entries = Vec::with_capacity((len as usize).min(1024));
            for _ in 0..len {
                let key = decode_value(dec, hook, depth + 1)?;
                let value = decode_value(dec, hook, depth + 1)?;
                entries.push((key, value));
            }
            CborValue::Map(entries)
        }
        Type::Tag => {
            let tag = dec.tag()?.as_u64();
            let inner = decode_value(dec, hook, depth + 1)?;
            hook.on_tag(tag, inner)?
        }
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef | Type::Break => {
            return Err(DecodeError::IndefiniteLength);
        }
        other => return Err(DecodeError::UnsupportedItem(format!("{other:?}"))),
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use minicbor::data::Tag;
    use minicbor::Encoder;

    #[test]
    fn test_decode_plain_map() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("type").unwrap().str("start").unwrap();
        enc.str("series_id").unwrap().u64(7).unwrap();
        enc.str("values").unwrap();
        enc.array(2).unwrap().i64(-3).unwrap().f64(0.5).unwrap();

        let doc = decode_document(&buf, &IdentityHook).unwrap();
        assert_eq!(doc.get("type").and_then(CborValue::as_str), Some("start"));
        assert_eq!(doc.get("series_id").and_then(CborValue::as_i64), Some(7));
        assert_eq!(
            doc.get("values"),
            Some(&CborValue::Array(vec![CborValue::Int(-3), CborValue::Float(0.5)]))
        );
        assert!(doc.get("missing").is_none());
    }

    #[test]
    fn test_identity_hook_keeps_tags() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.tag(Tag::new(12345)).unwrap().bytes(&[1, 2]).unwrap();

        let doc = decode_document(&buf, &IdentityHook).unwrap();
        assert_eq!(
            doc,
            CborValue::Tagged(12345, Box::new(CborValue::Bytes(vec![1, 2])))
        );
    }

    #[test]
    fn test_rejects_indefinite_and_trailing() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.begin_array().unwrap().u8(1).unwrap().end().unwrap();
        assert!(matches!(
            decode_document(&buf, &IdentityHook),
            Err(DecodeError::IndefiniteLength)
        ));

        let mut buf = Vec::new();
        Encoder::new(&mut buf).u8(1).unwrap().u8(2).unwrap();
        assert!(matches!(
            decode_document(&buf, &IdentityHook),
            Err(DecodeError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_rejects_excessive_nesting() {
        let buf = vec![0x81; MAX_DEPTH + 2];
        assert!(matches!(
            decode_document(&buf, &IdentityHook),
            Err(DecodeError::TooDeep(_))
        ));
    }

    #[test]
    fn test_truncated_input_is_cbor_error() {
        assert!(matches!(
            decode_document(&[0x82, 0x01], &IdentityHook),
            Err(DecodeError::Cbor(_))
        ));
    }
}
