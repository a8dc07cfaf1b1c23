//! Bencode decoding for transfer descriptors.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("unexpected byte {byte:#04x} at {pos}")]
    UnexpectedByte { byte: u8, pos: usize },
    #[error("invalid integer at byte {0}")]
    InvalidInteger(usize),
    #[error("trailing data after byte {0}")]
    TrailingData(usize),
    #[error("nesting too deep at byte {0}")]
    TooDeep(usize),
}

/// Deepest list/dictionary nesting accepted. Real descriptors stay in
/// single digits.
const MAX_DEPTH: usize = 64;

/// A bencoded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Lossy UTF-8 view of a byte string.
    pub fn as_string(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

/// Decodes exactly one value spanning the whole input.
pub fn decode(data: &[u8]) -> Result<BencodeValue, BencodeError> {
    let mut decoder = Decoder::new(data);
    let value = decoder.value()?;
    if decoder.pos != data.len() {
        return Err(BencodeError::TrailingData(decoder.pos));
    }
    Ok(value)
}

/// Decodes a top-level dictionary and also returns the raw bytes of the value
/// stored under `key`, which content hashes are computed over.
pub fn decode_with_raw<'a>(
    data: &'a [u8],
    key: &str,
) -> Result<(BencodeValue, Option<&'a [u8]>), BencodeError> {
    let mut decoder = Decoder::new(data);
    decoder.expect(b'd')?;
    let mut dict = BTreeMap::new();
    let mut raw = None;
    while decoder.peek()? != b'e' {
        let k = decoder.byte_string()?;
        let start = decoder.pos;
        let v = decoder.value()?;
        if k == key.as_bytes() {
            raw = Some(&data[start..decoder.pos]);
        }
        dict.insert(k, v);
    }
    decoder.pos += 1;
    if decoder.pos != data.len() {
        return Err(BencodeError::TrailingData(decoder.pos));
    }
    Ok((BencodeValue::Dict(dict), raw))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(self.pos))
    }

    fn expect(&mut self, byte: u8) -> Result<(), BencodeError> {
        let found = self.peek()?;
        if found != byte {
            return Err(BencodeError::UnexpectedByte {
                byte: found,
                pos: self.pos,
            });
        }
        self.pos += 1;
        Ok(())
    }

    fn value(&mut self) -> Result<BencodeValue, BencodeError> {
        match self.peek()? {
            b'i' => {
                self.pos += 1;
                let n = self.number_until(b'e')?;
                Ok(BencodeValue::Integer(n))
            }
            b'l' => {
                self.enter()?;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.value()?);
                }
                self.leave();
                Ok(BencodeValue::List(list))
            }
            b'd' => {
                self.enter()?;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.byte_string()?;
                    let value = self.value()?;
                    dict.insert(key, value);
                }
                self.leave();
                Ok(BencodeValue::Dict(dict))
            }
            b'0'..=b'9' => Ok(BencodeValue::Bytes(self.byte_string()?)),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                pos: self.pos,
            }),
        }
    }

    /// Steps over a container's opening byte.
    fn enter(&mut self) -> Result<(), BencodeError> {
        if self.depth >= MAX_DEPTH {
            return Err(BencodeError::TooDeep(self.pos));
        }
        self.depth += 1;
        self.pos += 1;
        Ok(())
    }

    /// Steps over a container's closing `e`.
    fn leave(&mut self) {
        self.depth -= 1;
        self.pos += 1;
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        let len = self.number_until(b':')?;
        let len = usize::try_from(len).map_err(|_| BencodeError::InvalidInteger(start))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;
        let bytes = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn number_until(&mut self, terminator: u8) -> Result<i64, BencodeError> {
        let start = self.pos;
        let offset = self.data[start..]
            .iter()
            .position(|b| *b == terminator)
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;
        let text = std::str::from_utf8(&self.data[start..start + offset])
            .map_err(|_| BencodeError::InvalidInteger(start))?;
        let n = text
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidInteger(start))?;
        self.pos = start + offset + 1;
        Ok(n)
    }
}
