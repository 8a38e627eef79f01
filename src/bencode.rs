//! A minimal Bencode codec.
//!
//! Supports the subset the wire protocol actually uses: signed integers,
//! byte strings, lists, and maps keyed by byte strings. Map keys are always
//! written in sorted order so that encoding is canonical: decoding a value
//! and re-encoding it yields the same bytes.

use crate::error::PacketError;
use std::collections::BTreeMap;

/// A decoded Bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// `BTreeMap` keeps keys sorted for us, which gives canonical encoding
    /// for free.
    Map(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Bytes(s.into_bytes())
    }
}

/// Encode a value into its canonical Bencode byte representation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Map(map) => {
            out.push(b'd');
            // BTreeMap iterates in sorted key order already.
            for (key, val) in map {
                encode_into(&Value::Bytes(key.clone()), out);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

/// Decode a single Bencode value from `input`, requiring the entire slice to
/// be consumed (no trailing garbage).
pub fn decode(input: &[u8]) -> Result<Value, PacketError> {
    let mut pos = 0;
    let value = decode_value(input, &mut pos)?;
    if pos != input.len() {
        return Err(PacketError::Malformed(format!(
            "trailing {} byte(s) after top-level value",
            input.len() - pos
        )));
    }
    Ok(value)
}

fn decode_value(input: &[u8], pos: &mut usize) -> Result<Value, PacketError> {
    match input.get(*pos) {
        Some(b'i') => decode_int(input, pos),
        Some(b'l') => decode_list(input, pos),
        Some(b'd') => decode_map(input, pos),
        Some(c) if c.is_ascii_digit() => decode_bytes(input, pos),
        Some(c) => Err(PacketError::Malformed(format!(
            "unexpected byte {:#04x} at offset {}",
            c, pos
        ))),
        None => Err(PacketError::Malformed("unexpected end of input".into())),
    }
}

fn decode_int(input: &[u8], pos: &mut usize) -> Result<Value, PacketError> {
    debug_assert_eq!(input[*pos], b'i');
    *pos += 1;
    let start = *pos;
    while input.get(*pos).map(|b| *b != b'e').unwrap_or(false) {
        *pos += 1;
    }
    let end = *pos;
    if input.get(*pos) != Some(&b'e') {
        return Err(PacketError::Malformed("unterminated integer".into()));
    }
    *pos += 1;
    let text = std::str::from_utf8(&input[start..end])
        .map_err(|e| PacketError::Malformed(format!("non-utf8 integer: {e}")))?;
    let n: i64 = text
        .parse()
        .map_err(|e| PacketError::Malformed(format!("invalid integer {text:?}: {e}")))?;
    Ok(Value::Int(n))
}

fn decode_bytes(input: &[u8], pos: &mut usize) -> Result<Value, PacketError> {
    let start = *pos;
    while input.get(*pos).map(|b| *b != b':').unwrap_or(false) {
        *pos += 1;
    }
    if input.get(*pos) != Some(&b':') {
        return Err(PacketError::Malformed("unterminated byte string length".into()));
    }
    let len_text = std::str::from_utf8(&input[start..*pos])
        .map_err(|e| PacketError::Malformed(format!("non-utf8 length: {e}")))?;
    let len: usize = len_text
        .parse()
        .map_err(|e| PacketError::Malformed(format!("invalid length {len_text:?}: {e}")))?;
    *pos += 1; // skip ':'
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= input.len())
        .ok_or_else(|| PacketError::Malformed("byte string length exceeds input".into()))?;
    let bytes = input[*pos..end].to_vec();
    *pos = end;
    Ok(Value::Bytes(bytes))
}

fn decode_list(input: &[u8], pos: &mut usize) -> Result<Value, PacketError> {
    debug_assert_eq!(input[*pos], b'l');
    *pos += 1;
    let mut items = Vec::new();
    loop {
        match input.get(*pos) {
            Some(b'e') => {
                *pos += 1;
                break;
            }
            Some(_) => items.push(decode_value(input, pos)?),
            None => return Err(PacketError::Malformed("unterminated list".into())),
        }
    }
    Ok(Value::List(items))
}

fn decode_map(input: &[u8], pos: &mut usize) -> Result<Value, PacketError> {
    debug_assert_eq!(input[*pos], b'd');
    *pos += 1;
    let mut map = BTreeMap::new();
    loop {
        match input.get(*pos) {
            Some(b'e') => {
                *pos += 1;
                break;
            }
            Some(c) if c.is_ascii_digit() => {
                let key = match decode_bytes(input, pos)? {
                    Value::Bytes(b) => b,
                    _ => unreachable!(),
                };
                let val = decode_value(input, pos)?;
                map.insert(key, val);
            }
            Some(c) => {
                return Err(PacketError::Malformed(format!(
                    "expected byte-string map key, found {:#04x}",
                    c
                )))
            }
            None => return Err(PacketError::Malformed("unterminated map".into())),
        }
    }
    Ok(Value::Map(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_integers() {
        for n in [-1_000_000_i64, -1, 0, 1, 42, 1_000_000] {
            let v = Value::Int(n);
            assert_eq!(decode(&encode(&v)).unwrap(), v);
        }
    }

    #[test]
    fn round_trips_byte_strings() {
        let v = Value::Bytes(b"hello world".to_vec());
        let bytes = encode(&v);
        assert_eq!(bytes, b"11:hello world");
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn round_trips_empty_byte_string() {
        let v = Value::Bytes(Vec::new());
        assert_eq!(encode(&v), b"0:");
        assert_eq!(decode(&encode(&v)).unwrap(), v);
    }

    #[test]
    fn round_trips_nested_lists() {
        let v = Value::List(vec![
            Value::Int(1),
            Value::Bytes(b"two".to_vec()),
            Value::List(vec![Value::Int(3), Value::Int(4)]),
        ]);
        assert_eq!(decode(&encode(&v)).unwrap(), v);
    }

    #[test]
    fn map_keys_are_sorted_on_encode() {
        let mut map = BTreeMap::new();
        map.insert(b"zebra".to_vec(), Value::Int(1));
        map.insert(b"apple".to_vec(), Value::Int(2));
        let encoded = encode(&Value::Map(map));
        let apple_pos = encoded.windows(5).position(|w| w == b"apple").unwrap();
        let zebra_pos = encoded.windows(5).position(|w| w == b"zebra").unwrap();
        assert!(apple_pos < zebra_pos);
    }

    #[test]
    fn decode_then_encode_is_canonical() {
        let original = b"d5:apple3:one5:zebra3:twoe";
        let decoded = decode(original).unwrap();
        assert_eq!(encode(&decoded), original);
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(decode(b"i1eXXX").is_err());
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(decode(b"d5:apple").is_err());
        assert!(decode(b"5:ab").is_err());
        assert!(decode(b"i42").is_err());
    }

    #[test]
    fn rejects_non_integer_length() {
        assert!(decode(b"x:abc").is_err());
    }
}
