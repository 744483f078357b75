use super::error::BencodeError;
use super::value::{Dict, Value};
use bytes::Bytes;

const MAX_DEPTH: usize = 64;

/// Decodes a single canonical bencode value spanning all of `data`.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    Decoder::run(data, true)
}

/// Like [`decode`], but accepts dictionary keys in any order. Duplicate keys
/// are still rejected.
///
/// Meant for KRPC envelopes from clients that do not sort their keys. Anything
/// that is hashed or signed must go through [`decode`].
pub fn decode_lenient(data: &[u8]) -> Result<Value, BencodeError> {
    Decoder::run(data, false)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    strict: bool,
}

impl<'a> Decoder<'a> {
    fn run(data: &'a [u8], strict: bool) -> Result<Value, BencodeError> {
        let mut decoder = Decoder {
            data,
            pos: 0,
            strict,
        };
        let value = decoder.value(0)?;

        if decoder.pos != data.len() {
            return Err(BencodeError::TrailingData);
        }

        Ok(value)
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            c => Err(BencodeError::UnexpectedChar(c as char)),
        }
    }

    /// Advances past `terminator` and returns everything before it.
    fn until(&mut self, terminator: u8) -> Result<&'a [u8], BencodeError> {
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == terminator)
            .ok_or(BencodeError::UnexpectedEof)?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let raw = self.until(b'e')?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| BencodeError::InvalidInteger("invalid utf8".into()))?;

        if text.is_empty() {
            return Err(BencodeError::InvalidInteger("empty".into()));
        }

        if text.starts_with("-0") || (text.starts_with('0') && text.len() > 1) {
            return Err(BencodeError::InvalidInteger("leading zeros".into()));
        }

        text.parse()
            .map(Value::Integer)
            .map_err(|_| BencodeError::InvalidInteger(text.into()))
    }

    fn bytes(&mut self) -> Result<Bytes, BencodeError> {
        let raw = self.until(b':')?;
        if raw.len() > 1 && raw[0] == b'0' {
            return Err(BencodeError::InvalidStringLength);
        }

        let len: usize = std::str::from_utf8(raw)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;

        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut list = Vec::new();

        while self.peek()? != b'e' {
            list.push(self.value(depth + 1)?);
        }

        self.pos += 1;
        Ok(Value::List(list))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = Dict::new();
        let mut last_key: Option<Bytes> = None;

        while self.peek()? != b'e' {
            let c = self.peek()?;
            if !c.is_ascii_digit() {
                return Err(BencodeError::UnexpectedChar(c as char));
            }

            let key = self.bytes()?;
            if self.strict && last_key.as_ref().is_some_and(|last| *last >= key) {
                return Err(BencodeError::UnsortedKeys);
            }

            let value = self.value(depth + 1)?;
            last_key = Some(key.clone());
            if dict.insert(key, value).is_some() {
                return Err(BencodeError::UnsortedKeys);
            }
        }

        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}
