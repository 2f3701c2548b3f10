//! Bencode codec used by the remote evaluation protocol.

use crate::error::Error;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::io::{BufRead, ErrorKind, Read};

const MAX_DEPTH: usize = 64;
const MAX_STRING_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            // some servers send numbers as strings
            Value::Bytes(_) => self.as_str().and_then(|s| s.trim().parse().ok()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => encode_bytes(b, out),
            Value::List(items) => {
                out.push(b'l');
                items.iter().for_each(|item| item.encode(out));
                out.push(b'e');
            }
            Value::Dict(entries) => {
                out.push(b'd');
                // BTreeMap keeps keys sorted as required by the format
                for (k, v) in entries {
                    encode_bytes(k.as_bytes(), out);
                    v.encode(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

fn encode_bytes(b: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(b.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(b);
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

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Dict(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k:?} {v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

/// Read next value from a stream.
/// Return `Ok(None)` if stream ends cleanly before the first byte of a value.
pub fn read_value<R: BufRead>(reader: &mut R) -> Result<Option<Value>, Error> {
    let first = match next_byte(reader)? {
        None => return Ok(None),
        Some(b) => b,
    };
    decode_with_prefix(reader, first, 0).map(Some)
}

/// Decode a single value from a complete buffer.
pub fn from_bytes(mut data: &[u8]) -> Result<Value, Error> {
    let value = read_value(&mut data)?.ok_or_else(|| Error::Decode("empty input".to_string()))?;
    if !data.is_empty() {
        return Err(Error::Decode(format!("{} trailing bytes", data.len())));
    }
    Ok(value)
}

fn next_byte<R: Read>(reader: &mut R) -> Result<Option<u8>, Error> {
    let mut buf = [0u8; 1];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn expect_byte<R: Read>(reader: &mut R) -> Result<u8, Error> {
    next_byte(reader)?.ok_or_else(|| Error::Decode("unexpected end of stream".to_string()))
}

fn decode_with_prefix<R: BufRead>(reader: &mut R, first: u8, depth: usize) -> Result<Value, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::Decode("nesting too deep".to_string()));
    }

    match first {
        b'i' => {
            let digits = read_until(reader, b'e')?;
            let i = std::str::from_utf8(&digits)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| Error::Decode("invalid integer".to_string()))?;
            Ok(Value::Int(i))
        }
        b'0'..=b'9' => read_bytes(reader, first).map(Value::Bytes),
        b'l' => {
            let mut items = vec![];
            loop {
                match expect_byte(reader)? {
                    b'e' => break,
                    b => items.push(decode_with_prefix(reader, b, depth + 1)?),
                }
            }
            Ok(Value::List(items))
        }
        b'd' => {
            let mut entries = BTreeMap::new();
            loop {
                let b = expect_byte(reader)?;
                if b == b'e' {
                    break;
                }
                if !b.is_ascii_digit() {
                    return Err(Error::Decode("dictionary key must be a string".to_string()));
                }
                let key = String::from_utf8(read_bytes(reader, b)?)
                    .map_err(|_| Error::Decode("dictionary key is not utf-8".to_string()))?;
                let vb = expect_byte(reader)?;
                let value = decode_with_prefix(reader, vb, depth + 1)?;
                entries.insert(key, value);
            }
            Ok(Value::Dict(entries))
        }
        other => Err(Error::Decode(format!("unexpected byte 0x{other:02x}"))),
    }
}

fn read_until<R: BufRead>(reader: &mut R, terminator: u8) -> Result<Vec<u8>, Error> {
    let mut buf = vec![];
    reader.read_until(terminator, &mut buf)?;
    if buf.pop() != Some(terminator) {
        return Err(Error::Decode("unexpected end of stream".to_string()));
    }
    Ok(buf)
}

fn read_bytes<R: BufRead>(reader: &mut R, first_digit: u8) -> Result<Vec<u8>, Error> {
    let mut len_digits = vec![first_digit];
    len_digits.extend(read_until(reader, b':')?);
    let len = std::str::from_utf8(&len_digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| Error::Decode("invalid string length".to_string()))?;
    if len > MAX_STRING_LEN {
        return Err(Error::Decode(format!("string of {len} bytes is too long")));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => Error::Decode("unexpected end of stream".to_string()),
        _ => Error::IO(e),
    })?;
    Ok(buf)
}

#[cfg(test)]
mod test {
    use super::*;

    fn dict(entries: &[(&str, Value)]) -> Value {
        Value::Dict(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn test_encode() {
        let v = dict(&[
            ("op", "eval".into()),
            ("code", "(+ 1 2)".into()),
            ("line", Value::Int(-3)),
            ("status", vec!["done"].into()),
        ]);
        assert_eq!(
            String::from_utf8(v.to_bytes()).unwrap(),
            "d4:code7:(+ 1 2)4:linei-3e2:op4:eval6:statusl4:doneee"
        );
    }

    #[test]
    fn test_decode_stream_of_messages() {
        let data = b"d7:session3:abc5:value1:3ed7:session3:abc6:statusl4:doneee";
        let mut reader = &data[..];
        let first = read_value(&mut reader).unwrap().unwrap();
        assert_eq!(first.get("value").and_then(Value::as_str), Some("3"));
        let second = read_value(&mut reader).unwrap().unwrap();
        assert_eq!(
            second.get("status").and_then(Value::as_list).map(|l| l.len()),
            Some(1)
        );
        assert!(read_value(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_decode_utf8_string() {
        let s = "λ→x";
        let encoded = Value::from(s).to_bytes();
        assert_eq!(from_bytes(&encoded).unwrap().as_str(), Some(s));
    }

    #[test]
    fn test_decode_errors() {
        struct TestCase {
            input: &'static [u8],
            reason: &'static str,
        }

        let cases = [
            TestCase {
                input: b"i12",
                reason: "unterminated integer",
            },
            TestCase {
                input: b"5:abc",
                reason: "short string",
            },
            TestCase {
                input: b"di1e1:ae",
                reason: "integer key",
            },
            TestCase {
                input: b"x",
                reason: "unknown prefix",
            },
            TestCase {
                input: b"l1:a",
                reason: "unterminated list",
            },
            TestCase {
                input: b"iabce",
                reason: "bad integer",
            },
        ];

        for tc in cases {
            assert!(
                matches!(from_bytes(tc.input), Err(Error::Decode(_))),
                "{}",
                tc.reason
            );
        }
    }

    #[test]
    fn test_depth_limit() {
        let mut data = vec![b'l'; MAX_DEPTH + 2];
        data.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert!(matches!(from_bytes(&data), Err(Error::Decode(_))));
    }
}
