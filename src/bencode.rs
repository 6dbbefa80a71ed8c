//! # Bencode Codec
//!
//! Bencode is the self-delimiting format of torrent files and tracker
//! responses. There are four kinds of values:
//!
//! ```text
//! 4:spam              byte-string (decimal length, colon, raw bytes)
//! i-42e               integer
//! l4:spami7ee         list
//! d3:cow3:mooe        dictionary with byte-string keys
//! ```
//!
//! ## Finding the end of a container
//!
//! Lists and dictionaries are closed by `e`, but byte-string payloads are raw
//! and may contain `e`, `l`, `d` or `:` (piece hashes routinely do). The
//! terminator scan therefore tracks a nesting depth and, whenever it reaches
//! a string, jumps over the length digits and the whole declared payload
//! without looking at it. Only then is the container body decoded item by
//! item.
//!
//! All decoding works on borrowed slices and returns the unconsumed
//! remainder; the input is never modified.

use std::collections::BTreeMap;
use std::str;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::SyntaxError;

type DecodeResult<'a, T> = Result<(T, &'a [u8]), SyntaxError>;

/// Deepest container nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 256;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Byte-string content, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|bytes| str::from_utf8(bytes).ok())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up `key` when this value is a dictionary.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|dict| dict.get(key.as_bytes()))
    }

    /// Encode to bencoded bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into an existing buffer. Dictionary keys come out sorted,
    /// which is the canonical form.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Bytes(bytes) => encode_bytes(bytes, buf),
            Value::Integer(n) => encode_integer(*n, buf),
            Value::List(items) => {
                buf.push(b'l');
                for item in items {
                    item.encode_into(buf);
                }
                buf.push(b'e');
            }
            Value::Dict(entries) => {
                buf.push(b'd');
                for (key, value) in entries {
                    encode_bytes(key, buf);
                    value.encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl<K: Into<Vec<u8>>> FromIterator<(K, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Value::Dict(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// JSON-friendly view: UTF-8 strings stay strings, raw bytes become hex.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Bytes(bytes) => match str::from_utf8(bytes) {
                Ok(s) => serializer.serialize_str(s),
                Err(_) => serializer.serialize_str(&hex::encode(bytes)),
            },
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Dict(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(&String::from_utf8_lossy(key), value)?;
                }
                map.end()
            }
        }
    }
}

/// Encode a value.
pub fn encode(value: &Value) -> Vec<u8> {
    value.encode()
}

/// Encode a single-file info dictionary in the field order
/// `length, name, piece length, pieces`.
pub fn encode_info(length: u64, name: &str, piece_length: u32, pieces: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(pieces.len() + name.len() + 64);
    buf.push(b'd');
    encode_bytes(b"length", &mut buf);
    buf.extend_from_slice(format!("i{}e", length).as_bytes());
    encode_bytes(b"name", &mut buf);
    encode_bytes(name.as_bytes(), &mut buf);
    encode_bytes(b"piece length", &mut buf);
    buf.extend_from_slice(format!("i{}e", piece_length).as_bytes());
    encode_bytes(b"pieces", &mut buf);
    encode_bytes(pieces, &mut buf);
    buf.push(b'e');
    buf
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}

fn encode_integer(n: i64, buf: &mut Vec<u8>) {
    buf.push(b'i');
    buf.extend_from_slice(n.to_string().as_bytes());
    buf.push(b'e');
}

/// Decode one value from the front of `input`.
///
/// Returns the value and the unconsumed remainder. Callers expecting a
/// single value should use [`decode_exact`].
pub fn decode(input: &[u8]) -> DecodeResult<'_, Value> {
    decode_at(input, 0)
}

/// Decode one value found inside `level` enclosing containers.
fn decode_at(input: &[u8], level: usize) -> DecodeResult<'_, Value> {
    match input.first() {
        None => Err(SyntaxError::UnexpectedEof),
        Some(b'0'..=b'9') => {
            let (bytes, rest) = decode_bytes(input)?;
            Ok((Value::Bytes(bytes.to_vec()), rest))
        }
        Some(b'i') => {
            let (n, rest) = decode_integer(input)?;
            Ok((Value::Integer(n), rest))
        }
        Some(b'l') => decode_list(input, level),
        Some(b'd') => decode_dict(input, level),
        Some(&byte) => Err(SyntaxError::UnexpectedByte(byte)),
    }
}

/// Decode exactly one value, rejecting trailing bytes.
pub fn decode_exact(input: &[u8]) -> Result<Value, SyntaxError> {
    let (value, rest) = decode(input)?;
    if !rest.is_empty() {
        return Err(SyntaxError::TrailingBytes(rest.len()));
    }
    Ok(value)
}

/// Split a top-level dictionary into `(key, raw encoded value)` pairs.
///
/// The value slices borrow from `input`, so hashing one yields the digest of
/// the exact bytes found in the file.
pub fn dict_entries_raw(input: &[u8]) -> DecodeResult<'_, Vec<(&[u8], &[u8])>> {
    if input.first() != Some(&b'd') {
        return match input.first() {
            None => Err(SyntaxError::UnexpectedEof),
            Some(&byte) => Err(SyntaxError::UnexpectedByte(byte)),
        };
    }
    let end = find_terminator(input, 0)?;
    let mut body = &input[1..end];
    let mut entries = Vec::new();
    while !body.is_empty() {
        let (key, after_key) = decode_key(body)?;
        let (_, after_value) = decode_at(after_key, 1).map_err(|err| missing_value(err, key))?;
        let raw = &after_key[..after_key.len() - after_value.len()];
        entries.push((key, raw));
        body = after_value;
    }
    Ok((entries, &input[end + 1..]))
}

/// Parse `<digits>:` and return the declared length plus what follows the
/// colon.
fn split_length(input: &[u8]) -> DecodeResult<'_, usize> {
    let digits = input.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 || input.get(digits) != Some(&b':') {
        return Err(SyntaxError::MalformedLength);
    }
    let len = str::from_utf8(&input[..digits])
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or(SyntaxError::MalformedLength)?;
    Ok((len, &input[digits + 1..]))
}

fn decode_bytes(input: &[u8]) -> DecodeResult<'_, &[u8]> {
    let (len, body) = split_length(input)?;
    if body.len() < len {
        return Err(SyntaxError::Truncated {
            declared: len,
            remaining: body.len(),
        });
    }
    Ok(body.split_at(len))
}

fn decode_integer(input: &[u8]) -> DecodeResult<'_, i64> {
    let end = input
        .iter()
        .position(|&b| b == b'e')
        .ok_or(SyntaxError::UnterminatedInteger)?;
    let body = &input[1..end];
    let digits = body.strip_prefix(b"-").unwrap_or(body);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(SyntaxError::InvalidInteger(
            String::from_utf8_lossy(body).into_owned(),
        ));
    }
    let n = str::from_utf8(body)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| SyntaxError::InvalidInteger(String::from_utf8_lossy(body).into_owned()))?;
    Ok((n, &input[end + 1..]))
}

/// Position of the `e` closing the list or dictionary that starts at
/// `input[0]`, which sits inside `level` enclosing containers.
///
/// The scan fails as soon as the total nesting passes [`MAX_DEPTH`], so the
/// recursive decode that follows stays shallow.
fn find_terminator(input: &[u8], level: usize) -> Result<usize, SyntaxError> {
    let mut depth = 0usize;
    let mut pos = 0;
    while pos < input.len() {
        match input[pos] {
            b'0'..=b'9' => {
                // Skip digits, colon and payload in one step.
                let (len, payload) = split_length(&input[pos..])?;
                if payload.len() < len {
                    return Err(SyntaxError::Truncated {
                        declared: len,
                        remaining: payload.len(),
                    });
                }
                let header = input.len() - pos - payload.len();
                pos += header + len;
                continue;
            }
            b'i' => {
                // An integer opens and closes at its own `e`.
                let close = input[pos..]
                    .iter()
                    .position(|&b| b == b'e')
                    .ok_or(SyntaxError::UnterminatedInteger)?;
                pos += close + 1;
                continue;
            }
            b'l' | b'd' => {
                depth += 1;
                if level + depth > MAX_DEPTH {
                    return Err(SyntaxError::TooDeep(MAX_DEPTH));
                }
            }
            b'e' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(pos);
                }
            }
            byte => return Err(SyntaxError::UnexpectedByte(byte)),
        }
        pos += 1;
    }

    if input.first() == Some(&b'd') {
        Err(SyntaxError::UnterminatedDict)
    } else {
        Err(SyntaxError::UnterminatedList)
    }
}

fn decode_list(input: &[u8], level: usize) -> DecodeResult<'_, Value> {
    let end = find_terminator(input, level)?;
    let mut body = &input[1..end];
    let mut items = Vec::new();
    while !body.is_empty() {
        let (item, rest) = decode_at(body, level + 1)?;
        items.push(item);
        body = rest;
    }
    Ok((Value::List(items), &input[end + 1..]))
}

fn decode_dict(input: &[u8], level: usize) -> DecodeResult<'_, Value> {
    let end = find_terminator(input, level)?;
    let mut body = &input[1..end];
    let mut entries = BTreeMap::new();
    while !body.is_empty() {
        let (key, after_key) = decode_key(body)?;
        let (value, rest) =
            decode_at(after_key, level + 1).map_err(|err| missing_value(err, key))?;
        if entries.insert(key.to_vec(), value).is_some() {
            return Err(SyntaxError::DuplicateKey(
                String::from_utf8_lossy(key).into_owned(),
            ));
        }
        body = rest;
    }
    Ok((Value::Dict(entries), &input[end + 1..]))
}

fn decode_key(input: &[u8]) -> DecodeResult<'_, &[u8]> {
    if !input.first().is_some_and(u8::is_ascii_digit) {
        return Err(SyntaxError::NonStringKey);
    }
    decode_bytes(input)
}

fn missing_value(err: SyntaxError, key: &[u8]) -> SyntaxError {
    match err {
        SyntaxError::UnexpectedEof => {
            SyntaxError::MissingValue(String::from_utf8_lossy(key).into_owned())
        }
        other => other,
    }
}
