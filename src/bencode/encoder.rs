use super::BencodeResult;
use super::BencodeValue;
use std::io::Write;
use tracing::instrument;

fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

// Entries are written in insertion order. Re-sorting here would change the
// bytes of a decoded `info` dictionary and with them the info-hash.
fn encode_dict<W: Write>(
    writer: &mut W,
    entries: &[(Vec<u8>, BencodeValue)],
) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in entries {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::Text(s) => encode_string(writer, s.as_bytes()),
        BencodeValue::Bytes(b) => encode_string(writer, b),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(entries) => encode_dict(writer, entries),
    }
}

/// Encodes `value` into `writer` using the standard bencoding grammar.
#[instrument(skip(writer, value), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Encodes `value` into a fresh byte vector.
pub fn encode_to_bytes(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buffer = Vec::new();
    encode(&mut buffer, value)?;
    Ok(buffer)
}
