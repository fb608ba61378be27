//! Nested value grammar: recursive length-prefixed byte strings and lists.
//!
//! Every edge message is a projection of this shape. Integers travel as
//! canonical big-endian byte strings without leading zeros (zero is the empty
//! string), so the grammar itself only knows two kinds: bytes and lists.

const SHORT_STRING: u8 = 0x80;
const LONG_STRING: u8 = 0xb7;
const SHORT_LIST: u8 = 0xc0;
const LONG_LIST: u8 = 0xf7;
const SHORT_LIMIT: usize = 55;

/// Maximum list nesting accepted from the wire.
pub const MAX_DEPTH: usize = 64;

/// One node of the nested grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    /// Canonical integer: big-endian, leading zero bytes stripped.
    pub fn uint(n: u64) -> Self {
        Value::Bytes(trim_leading_zeros(&n.to_be_bytes()).to_vec())
    }

    pub fn string(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            Value::Bytes(_) => None,
        }
    }

    /// True if this is a byte string equal to `token`.
    pub fn is_token(&self, token: &str) -> bool {
        self.as_bytes() == Some(token.as_bytes())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::uint(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    &bytes[skip..]
}

/// Read a big-endian unsigned integer. Leading zero bytes are tolerated;
/// returns None if the significant bytes do not fit in 64 bits.
pub fn decode_uint(bytes: &[u8]) -> Option<u64> {
    let significant = trim_leading_zeros(bytes);
    if significant.len() > 8 {
        return None;
    }
    Some(significant.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Encode a value into its wire form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Bytes(b) if b.len() == 1 && b[0] < SHORT_STRING => out.push(b[0]),
        Value::Bytes(b) => {
            push_header(b.len(), SHORT_STRING, LONG_STRING, out);
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            let mut body = Vec::new();
            for item in items {
                encode_into(item, &mut body);
            }
            push_header(body.len(), SHORT_LIST, LONG_LIST, out);
            out.extend_from_slice(&body);
        }
    }
}

fn push_header(len: usize, short: u8, long: u8, out: &mut Vec<u8>) {
    if len <= SHORT_LIMIT {
        out.push(short + len as u8);
    } else {
        let be = (len as u64).to_be_bytes();
        let significant = trim_leading_zeros(&be);
        out.push(long + significant.len() as u8);
        out.extend_from_slice(significant);
    }
}

/// Decode exactly one value; the input must contain nothing after it.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    let mut stack = Vec::new();
    let (value, used) = decode_item(bytes, &mut stack)?;
    if used != bytes.len() {
        return Err(DecodeError::TrailingBytes {
            path: "$".into(),
            extra: bytes.len() - used,
        });
    }
    Ok(value)
}

fn raw_path(stack: &[usize]) -> String {
    let mut path = String::from("$");
    for idx in stack {
        path.push_str(&format!("[{}]", idx));
    }
    path
}

fn take<'b>(
    bytes: &'b [u8],
    start: usize,
    len: usize,
    stack: &[usize],
) -> Result<&'b [u8], DecodeError> {
    start
        .checked_add(len)
        .and_then(|end| bytes.get(start..end))
        .ok_or_else(|| DecodeError::Truncated {
            path: raw_path(stack),
        })
}

/// Parse a long-form length: `n` big-endian bytes after the prefix byte.
fn long_length(bytes: &[u8], n: usize, stack: &[usize]) -> Result<(usize, usize), DecodeError> {
    let len_bytes = take(bytes, 1, n, stack)?;
    if len_bytes[0] == 0 {
        return Err(DecodeError::NonCanonical {
            path: raw_path(stack),
        });
    }
    let len = decode_uint(len_bytes)
        .and_then(|l| usize::try_from(l).ok())
        .ok_or_else(|| DecodeError::LengthOverflow {
            path: raw_path(stack),
        })?;
    if len <= SHORT_LIMIT {
        return Err(DecodeError::NonCanonical {
            path: raw_path(stack),
        });
    }
    Ok((len, 1 + n))
}

fn decode_item(bytes: &[u8], stack: &mut Vec<usize>) -> Result<(Value, usize), DecodeError> {
    let Some(&prefix) = bytes.first() else {
        return Err(DecodeError::Truncated {
            path: raw_path(stack),
        });
    };
    match prefix {
        0x00..=0x7f => Ok((Value::Bytes(vec![prefix]), 1)),
        0x80..=0xb7 => {
            let len = usize::from(prefix - SHORT_STRING);
            let body = take(bytes, 1, len, stack)?;
            if len == 1 && body[0] < SHORT_STRING {
                return Err(DecodeError::NonCanonical {
                    path: raw_path(stack),
                });
            }
            Ok((Value::Bytes(body.to_vec()), 1 + len))
        }
        0xb8..=0xbf => {
            let (len, header) = long_length(bytes, usize::from(prefix - LONG_STRING), stack)?;
            let body = take(bytes, header, len, stack)?;
            Ok((Value::Bytes(body.to_vec()), header + len))
        }
        0xc0..=0xf7 => {
            let len = usize::from(prefix - SHORT_LIST);
            let body = take(bytes, 1, len, stack)?;
            Ok((Value::List(decode_list(body, stack)?), 1 + len))
        }
        0xf8..=0xff => {
            let (len, header) = long_length(bytes, usize::from(prefix - LONG_LIST), stack)?;
            let body = take(bytes, header, len, stack)?;
            Ok((Value::List(decode_list(body, stack)?), header + len))
        }
    }
}

fn decode_list(body: &[u8], stack: &mut Vec<usize>) -> Result<Vec<Value>, DecodeError> {
    if stack.len() >= MAX_DEPTH {
        return Err(DecodeError::TooDeep {
            path: raw_path(stack),
        });
    }
    let mut items = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        stack.push(items.len());
        let (item, used) = decode_item(&body[pos..], stack)?;
        stack.pop();
        items.push(item);
        pos += used;
    }
    Ok(items)
}

/// Cursor over a list value. Each read names its field so errors carry a dotted path.
#[derive(Debug, Clone)]
pub struct Fields<'a> {
    path: String,
    items: &'a [Value],
    pos: usize,
}

impl<'a> Fields<'a> {
    pub fn new(value: &'a Value, path: impl Into<String>) -> Result<Self, DecodeError> {
        let path = path.into();
        match value {
            Value::List(items) => Ok(Self {
                path,
                items,
                pos: 0,
            }),
            Value::Bytes(_) => Err(DecodeError::Kind {
                path,
                expected: "list",
            }),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn remaining(&self) -> usize {
        self.items.len() - self.pos
    }

    /// Path of the field called `name` under this list.
    pub fn child_path(&self, name: &str) -> String {
        if name.starts_with('[') {
            format!("{}{}", self.path, name)
        } else {
            format!("{}.{}", self.path, name)
        }
    }

    pub fn value(&mut self, name: &str) -> Result<&'a Value, DecodeError> {
        let items = self.items;
        match items.get(self.pos) {
            Some(item) => {
                self.pos += 1;
                Ok(item)
            }
            None => Err(DecodeError::MissingField {
                path: self.child_path(name),
            }),
        }
    }

    pub fn bytes(&mut self, name: &str) -> Result<&'a [u8], DecodeError> {
        match self.value(name)? {
            Value::Bytes(b) => Ok(b),
            Value::List(_) => Err(DecodeError::Kind {
                path: self.child_path(name),
                expected: "byte string",
            }),
        }
    }

    pub fn uint(&mut self, name: &str) -> Result<u64, DecodeError> {
        let raw = self.bytes(name)?;
        decode_uint(raw).ok_or_else(|| DecodeError::IntegerOverflow {
            path: self.child_path(name),
        })
    }

    pub fn int(&mut self, name: &str) -> Result<i64, DecodeError> {
        let n = self.uint(name)?;
        i64::try_from(n).map_err(|_| DecodeError::IntegerOverflow {
            path: self.child_path(name),
        })
    }

    pub fn string(&mut self, name: &str) -> Result<String, DecodeError> {
        let raw = self.bytes(name)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::Utf8 {
            path: self.child_path(name),
        })
    }

    pub fn list(&mut self, name: &str) -> Result<Fields<'a>, DecodeError> {
        let value = self.value(name)?;
        Fields::new(value, self.child_path(name))
    }

    /// Read a byte string that must equal `token`.
    pub fn token(&mut self, name: &str, token: &'static str) -> Result<(), DecodeError> {
        let raw = self.bytes(name)?;
        if raw != token.as_bytes() {
            return Err(DecodeError::Literal {
                path: self.child_path(name),
                expected: token,
                found: String::from_utf8_lossy(raw).into_owned(),
            });
        }
        Ok(())
    }

    /// All remaining elements as byte strings.
    pub fn remaining_bytes(&mut self) -> Result<Vec<Vec<u8>>, DecodeError> {
        let mut out = Vec::with_capacity(self.remaining());
        while self.remaining() > 0 {
            let name = format!("[{}]", self.pos);
            out.push(self.bytes(&name)?.to_vec());
        }
        Ok(out)
    }

    /// All remaining elements as integers.
    pub fn remaining_uints(&mut self) -> Result<Vec<u64>, DecodeError> {
        let mut out = Vec::with_capacity(self.remaining());
        while self.remaining() > 0 {
            let name = format!("[{}]", self.pos);
            out.push(self.uint(&name)?);
        }
        Ok(out)
    }

    /// Fail if any element was left unread.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingFields {
                path: self.path,
                extra,
            }),
        }
    }
}

/// Malformed bytes or a shape mismatch. The envelope must be discarded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{path}: input truncated")]
    Truncated { path: String },
    #[error("{path}: non-canonical length prefix")]
    NonCanonical { path: String },
    #[error("{path}: length does not fit in memory")]
    LengthOverflow { path: String },
    #[error("{path}: {extra} trailing bytes")]
    TrailingBytes { path: String, extra: usize },
    #[error("{path}: nesting too deep")]
    TooDeep { path: String },
    #[error("{path}: expected {expected}")]
    Kind {
        path: String,
        expected: &'static str,
    },
    #[error("{path}: missing field")]
    MissingField { path: String },
    #[error("{path}: {extra} unexpected trailing fields")]
    TrailingFields { path: String, extra: usize },
    #[error("{path}: integer wider than 64 bits")]
    IntegerOverflow { path: String },
    #[error("{path}: invalid utf-8")]
    Utf8 { path: String },
    #[error("{path}: expected {expected:?}, found {found:?}")]
    Literal {
        path: String,
        expected: &'static str,
        found: String,
    },
    #[error("{path}: unknown method {method:?}")]
    UnknownMethod { path: String, method: String },
}

impl DecodeError {
    /// Path of the offending field.
    pub fn path(&self) -> &str {
        match self {
            DecodeError::Truncated { path }
            | DecodeError::NonCanonical { path }
            | DecodeError::LengthOverflow { path }
            | DecodeError::TrailingBytes { path, .. }
            | DecodeError::TooDeep { path }
            | DecodeError::Kind { path, .. }
            | DecodeError::MissingField { path }
            | DecodeError::TrailingFields { path, .. }
            | DecodeError::IntegerOverflow { path }
            | DecodeError::Utf8 { path }
            | DecodeError::Literal { path, .. }
            | DecodeError::UnknownMethod { path, .. } => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore};

    #[test]
    fn known_encodings() {
        assert_eq!(encode(&Value::string("dog")), b"\x83dog".to_vec());
        assert_eq!(
            encode(&Value::List(vec!["cat".into(), "dog".into()])),
            b"\xc8\x83cat\x83dog".to_vec()
        );
        assert_eq!(encode(&Value::Bytes(vec![])), vec![0x80]);
        assert_eq!(encode(&Value::List(vec![])), vec![0xc0]);
        assert_eq!(encode(&Value::uint(0)), vec![0x80]);
        assert_eq!(encode(&Value::uint(15)), vec![0x0f]);
        assert_eq!(encode(&Value::uint(1024)), vec![0x82, 0x04, 0x00]);
    }

    #[test]
    fn long_string_uses_length_of_length() {
        let body = vec![b'a'; 56];
        let enc = encode(&Value::Bytes(body.clone()));
        assert_eq!(&enc[..2], &[0xb8, 56]);
        assert_eq!(decode(&enc).unwrap(), Value::Bytes(body));
    }

    #[test]
    fn long_list_roundtrip() {
        let items: Vec<Value> = (0..40u64).map(|n| Value::uint(n * 1000)).collect();
        let value = Value::List(items);
        let enc = encode(&value);
        assert_eq!(enc[0], 0xf8);
        assert_eq!(decode(&enc).unwrap(), value);
    }

    #[test]
    fn random_nested_roundtrip() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let mut payload = vec![0u8; rng.gen_range(0..300)];
            rng.fill_bytes(&mut payload);
            let value = Value::List(vec![
                Value::uint(rng.gen()),
                Value::Bytes(payload),
                Value::List(vec![Value::string("portsend"), Value::List(vec![])]),
            ]);
            assert_eq!(decode(&encode(&value)).unwrap(), value);
        }
    }

    #[test]
    fn rejects_non_canonical_single_byte() {
        assert!(matches!(
            decode(&[0x81, 0x05]),
            Err(DecodeError::NonCanonical { .. })
        ));
    }

    #[test]
    fn rejects_long_form_for_short_length() {
        let mut bytes = vec![0xb8, 3];
        bytes.extend_from_slice(b"abc");
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::NonCanonical { .. })
        ));
    }

    #[test]
    fn rejects_truncated_and_trailing() {
        assert!(matches!(
            decode(b"\x83do"),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            decode(b"\x83dogx"),
            Err(DecodeError::TrailingBytes { extra: 1, .. })
        ));
        assert!(matches!(decode(&[]), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn truncated_child_reports_its_index() {
        // List claims 4 bytes of body; second child claims 3 bytes but only 1 remains.
        let err = decode(&[0xc4, 0x01, 0x83, b'a', b'b']).unwrap_err();
        assert_eq!(err.path(), "$[1]");
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut value = Value::List(vec![]);
        for _ in 0..=MAX_DEPTH {
            value = Value::List(vec![value]);
        }
        assert!(matches!(
            decode(&encode(&value)),
            Err(DecodeError::TooDeep { .. })
        ));
    }

    #[test]
    fn fields_errors_carry_path() {
        let value = Value::List(vec![Value::string("portsend"), Value::List(vec![])]);
        let mut fields = Fields::new(&value, "payload").unwrap();
        fields.token("method", "portsend").unwrap();
        let err = fields.uint("ref").unwrap_err();
        assert_eq!(
            err,
            DecodeError::Kind {
                path: "payload.ref".into(),
                expected: "byte string"
            }
        );
        let err = fields.bytes("data").unwrap_err();
        assert_eq!(err.path(), "payload.data");
    }

    #[test]
    fn fields_finish_rejects_extra() {
        let value = Value::List(vec![Value::uint(1), Value::uint(2)]);
        let mut fields = Fields::new(&value, "payload").unwrap();
        fields.uint("a").unwrap();
        assert!(matches!(
            fields.finish(),
            Err(DecodeError::TrailingFields { extra: 1, .. })
        ));
    }

    #[test]
    fn uint_overflow_detected() {
        let value = Value::List(vec![Value::Bytes(vec![1; 9])]);
        let mut fields = Fields::new(&value, "p").unwrap();
        assert!(matches!(
            fields.uint("n"),
            Err(DecodeError::IntegerOverflow { .. })
        ));
        assert_eq!(decode_uint(&[0, 0, 1, 2]), Some(258));
    }
}
