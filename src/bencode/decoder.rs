use super::BencodeError;
use super::BencodeResult;
use super::BencodeValue;

use std::io::{self, Read};
use tracing::instrument;

type ByteStream<R> = std::iter::Peekable<io::Bytes<R>>;

/// Decodes a single bencode value from `reader`, consuming exactly the bytes
/// that make up the value.
///
/// The reader is a peekable byte iterator so nested values share one cursor:
/// each helper consumes its own bytes and leaves the cursor on the first byte
/// of the next value.
///
/// # Errors
/// Returns [`BencodeError`] on truncated input, non-digit string lengths,
/// missing `e` terminators, and dictionary keys that are not strings.
#[instrument(skip(reader), level = "debug")]
pub fn decode<R: Read>(reader: R) -> BencodeResult<BencodeValue> {
    decode_next(&mut reader.bytes().peekable())
}

/// Decodes a single bencode value from a byte slice.
pub fn decode_bytes(data: &[u8]) -> BencodeResult<BencodeValue> {
    decode(data)
}

fn peek_byte<R: Read>(reader: &mut ByteStream<R>) -> BencodeResult<u8> {
    match reader.peek() {
        Some(Ok(b)) => Ok(*b),
        Some(Err(e)) => Err(BencodeError::Io(e.kind().into())),
        None => Err(BencodeError::UnexpectedEOI),
    }
}

fn next_byte<R: Read>(reader: &mut ByteStream<R>) -> BencodeResult<u8> {
    reader
        .next()
        .ok_or(BencodeError::UnexpectedEOI)?
        .map_err(BencodeError::Io)
}

/// Reads bytes until `delimiter` is consumed, returning everything before it
/// as a UTF-8 string. Used for the ASCII-decimal length and integer bodies.
fn read_until<R: Read>(reader: &mut ByteStream<R>, delimiter: u8) -> BencodeResult<String> {
    let mut buffer = Vec::new();
    loop {
        let byte = next_byte(reader)?;
        if byte == delimiter {
            break;
        }
        buffer.push(byte);
    }
    String::from_utf8(buffer).map_err(|e| {
        BencodeError::InvalidFormat(format!("non-UTF8 characters in length/integer: {}", e))
    })
}

/// Decodes a bencode byte-string in the form `<length>:<data>`, returning the
/// raw data bytes.
#[instrument(skip(reader), level = "trace")]
pub fn decode_string<R: Read>(reader: &mut ByteStream<R>) -> BencodeResult<Vec<u8>> {
    let length_str = read_until(reader, b':')?;
    let length = length_str
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    let mut string_bytes = Vec::with_capacity(length);
    for _ in 0..length {
        string_bytes.push(next_byte(reader)?);
    }
    Ok(string_bytes)
}

/// Decodes a bencode integer in the form `i<number>e`.
///
/// Leading zeros, `-0` and empty bodies are rejected per the bencoding
/// grammar.
#[instrument(skip(reader), level = "trace")]
pub fn decode_integer<R: Read>(reader: &mut ByteStream<R>) -> BencodeResult<i64> {
    if next_byte(reader)? != b'i' {
        return Err(BencodeError::InvalidFormat(
            "integer must start with 'i'".to_string(),
        ));
    }

    let num_str = read_until(reader, b'e')?;

    if num_str.is_empty() || num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }
    if num_str.len() > 1 && num_str.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }

    num_str
        .parse::<i64>()
        .map_err(|_| BencodeError::InvalidInteger)
}

fn decode_list<R: Read>(reader: &mut ByteStream<R>) -> BencodeResult<Vec<BencodeValue>> {
    if next_byte(reader)? != b'l' {
        return Err(BencodeError::InvalidFormat(
            "list must start with 'l'".to_string(),
        ));
    }

    let mut list = Vec::new();
    while peek_byte(reader)? != b'e' {
        list.push(decode_next(reader)?);
    }
    next_byte(reader)?;

    Ok(list)
}

/// Decodes a bencode dictionary in the form `d<key><value>...e`.
///
/// Entries are kept in the order they appear on the wire; re-encoding a
/// decoded dictionary therefore reproduces the input bytes, which the
/// info-hash computation depends on.
fn decode_dict<R: Read>(
    reader: &mut ByteStream<R>,
) -> BencodeResult<Vec<(Vec<u8>, BencodeValue)>> {
    if next_byte(reader)? != b'd' {
        return Err(BencodeError::InvalidFormat(
            "dictionary must start with 'd'".to_string(),
        ));
    }

    let mut entries = Vec::new();
    while peek_byte(reader)? != b'e' {
        if !peek_byte(reader)?.is_ascii_digit() {
            return Err(BencodeError::DictKeyNotString);
        }
        let key = decode_string(reader)?;
        let value = decode_next(reader)?;
        entries.push((key, value));
    }
    next_byte(reader)?;

    Ok(entries)
}

fn decode_next<R: Read>(reader: &mut ByteStream<R>) -> BencodeResult<BencodeValue> {
    match peek_byte(reader)? {
        b'0'..=b'9' => decode_string(reader).map(BencodeValue::string),
        b'i' => decode_integer(reader).map(BencodeValue::Integer),
        b'l' => decode_list(reader).map(BencodeValue::List),
        b'd' => decode_dict(reader).map(BencodeValue::Dict),
        other => Err(BencodeError::InvalidFormat(format!(
            "unexpected character: {}",
            other as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_integers() {
        assert_eq!(
            decode_bytes(b"i42e").unwrap(),
            BencodeValue::Integer(42)
        );
        assert_eq!(
            decode_bytes(b"i-17e").unwrap(),
            BencodeValue::Integer(-17)
        );
        assert_eq!(decode_bytes(b"i0e").unwrap(), BencodeValue::Integer(0));
    }

    #[test]
    fn rejects_malformed_integers() {
        assert!(decode_bytes(b"i042e").is_err());
        assert!(decode_bytes(b"i-0e").is_err());
        assert!(decode_bytes(b"ie").is_err());
        assert!(decode_bytes(b"i42").is_err());
    }

    #[test]
    fn decodes_strings_as_text_or_bytes() {
        assert_eq!(
            decode_bytes(b"4:spam").unwrap(),
            BencodeValue::Text("spam".to_string())
        );
        // invalid UTF-8 stays raw
        assert_eq!(
            decode_bytes(b"2:\xff\xfe").unwrap(),
            BencodeValue::Bytes(vec![0xff, 0xfe])
        );
        assert_eq!(
            decode_bytes(b"0:").unwrap(),
            BencodeValue::Text(String::new())
        );
    }

    #[test]
    fn rejects_truncated_and_malformed_strings() {
        assert!(decode_bytes(b"5:spam").is_err());
        assert!(decode_bytes(b"5x:spam").is_err());
        assert!(decode_bytes(b"spam").is_err());
    }

    #[test]
    fn decodes_nested_lists_and_dicts() {
        assert_eq!(
            decode_bytes(b"l4:spami42ee").unwrap(),
            BencodeValue::List(vec![
                BencodeValue::Text("spam".to_string()),
                BencodeValue::Integer(42),
            ])
        );
        assert_eq!(
            decode_bytes(b"d3:bari1e3:fool2:abee").unwrap(),
            BencodeValue::Dict(vec![
                (b"bar".to_vec(), BencodeValue::Integer(1)),
                (
                    b"foo".to_vec(),
                    BencodeValue::List(vec![BencodeValue::Text("ab".to_string())])
                ),
            ])
        );
    }

    #[test]
    fn preserves_dict_insertion_order() {
        // keys deliberately not in sorted order
        let value = decode_bytes(b"d1:zi1e1:ai2ee").unwrap();
        match value {
            BencodeValue::Dict(entries) => {
                assert_eq!(entries[0].0, b"z".to_vec());
                assert_eq!(entries[1].0, b"a".to_vec());
            }
            other => panic!("expected dict, got {:?}", other),
        }
    }

    #[test]
    fn rejects_non_string_dict_keys() {
        assert!(matches!(
            decode_bytes(b"di1ei2ee"),
            Err(BencodeError::DictKeyNotString)
        ));
    }

    #[test]
    fn rejects_unterminated_containers() {
        assert!(decode_bytes(b"l4:spam").is_err());
        assert!(decode_bytes(b"d3:foo").is_err());
    }
}
