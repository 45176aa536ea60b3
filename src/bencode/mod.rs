use thiserror::Error;
pub mod decoder;
pub mod encoder;

/// A bencode value, the core data structure of the bencoding format used by
/// .torrent files and HTTP tracker responses.
///
/// Byte-strings come in two flavours: [`BencodeValue::Text`] when the raw
/// bytes decode as UTF-8 (tracker URLs, file names, comments) and
/// [`BencodeValue::Bytes`] when they do not (piece hashes, compact peer
/// lists). Both encode back to the identical `<len>:<bytes>` form, so the
/// split never changes the wire bytes.
///
/// Dictionaries keep their entries in insertion order. The `info` dictionary
/// of a metainfo file must re-encode to the exact bytes it was read from
/// (its SHA-1 is the torrent's identity), so keys are never re-sorted.
#[derive(Debug, PartialEq, Clone)]
pub enum BencodeValue {
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(Vec<(Vec<u8>, BencodeValue)>),
}

impl BencodeValue {
    /// Builds the appropriate byte-string variant for `raw`: `Text` when the
    /// bytes are valid UTF-8, `Bytes` otherwise.
    pub fn string(raw: Vec<u8>) -> Self {
        match String::from_utf8(raw) {
            Ok(s) => BencodeValue::Text(s),
            Err(e) => BencodeValue::Bytes(e.into_bytes()),
        }
    }

    /// Looks up `key` in a dictionary value. Returns `None` for missing keys
    /// and for non-dictionary values.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        match self {
            BencodeValue::Dict(entries) => entries
                .iter()
                .find(|(k, _)| k.as_slice() == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BencodeValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The raw bytes of either byte-string variant.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Text(s) => Some(s.as_bytes()),
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Custom error type for bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("Invalid integer format")]
    InvalidInteger,

    #[error("Invalid string length")]
    InvalidStringLength,

    #[error("Unexpected end of input")]
    UnexpectedEOI,

    #[error("Dictionary keys must be strings")]
    DictKeyNotString,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
