//! Peer wire messages: `<4-byte big-endian length><payload>` frames where the
//! first payload byte is the message id. A zero-length frame is a keep-alive.
use super::{PeerError, PeerResult};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// Raw bitfield bytes; MSB of byte 0 is piece 0.
    Bitfield(Vec<u8>),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Port(u16),
}

impl Message {
    /// Encodes the message as a complete length-prefixed frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::KeepAlive => {}
            Message::Choke => payload.push(0),
            Message::Unchoke => payload.push(1),
            Message::Interested => payload.push(2),
            Message::NotInterested => payload.push(3),
            Message::Have(index) => {
                payload.push(4);
                payload.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bits) => {
                payload.push(5);
                payload.extend_from_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                payload.push(6);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                payload.push(7);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                payload.push(8);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
            }
            Message::Port(port) => {
                payload.push(9);
                payload.extend_from_slice(&port.to_be_bytes());
            }
        }
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&payload);
        frame
    }

    /// Reads one length-prefixed frame off `reader`.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> PeerResult<Message> {
        let length = reader.read_u32().await?;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;
        Self::parse(&payload)
    }

    /// Parses a non-empty frame payload (id byte plus body).
    pub fn parse(payload: &[u8]) -> PeerResult<Message> {
        let (id, body) = match payload.split_first() {
            Some(split) => split,
            None => return Ok(Message::KeepAlive),
        };
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have(read_u32(body, 0, "Have")?),
            5 => Message::Bitfield(body.to_vec()),
            6 => Message::Request {
                index: read_u32(body, 0, "Request")?,
                begin: read_u32(body, 4, "Request")?,
                length: read_u32(body, 8, "Request")?,
            },
            7 => {
                if body.len() < 8 {
                    return Err(PeerError::MalformedMessage(
                        "Piece payload shorter than its header".to_string(),
                    ));
                }
                Message::Piece {
                    index: read_u32(body, 0, "Piece")?,
                    begin: read_u32(body, 4, "Piece")?,
                    block: Bytes::copy_from_slice(&body[8..]),
                }
            }
            8 => Message::Cancel {
                index: read_u32(body, 0, "Cancel")?,
                begin: read_u32(body, 4, "Cancel")?,
                length: read_u32(body, 8, "Cancel")?,
            },
            9 => {
                if body.len() != 2 {
                    return Err(PeerError::MalformedMessage(
                        "Port payload must be 2 bytes".to_string(),
                    ));
                }
                Message::Port(u16::from_be_bytes([body[0], body[1]]))
            }
            // ids we do not speak are treated as keep-alives
            _ => Message::KeepAlive,
        };
        Ok(msg)
    }
}

fn read_u32(body: &[u8], offset: usize, kind: &str) -> PeerResult<u32> {
    let bytes = body
        .get(offset..offset + 4)
        .ok_or_else(|| PeerError::MalformedMessage(format!("{kind} payload truncated")))?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Expands a bitfield into the piece indices it advertises, MSB-first.
pub fn bitfield_indices(bits: &[u8]) -> Vec<u32> {
    let mut indices = Vec::new();
    for (byte_index, byte) in bits.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << (7 - bit)) != 0 {
                indices.push((byte_index * 8 + bit) as u32);
            }
        }
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(msg: Message) {
        let wire = msg.encode();
        let parsed = Message::read(&mut &wire[..]).await.unwrap();
        assert_eq!(parsed, msg);
        // byte-exact on re-encode
        assert_eq!(parsed.encode(), wire);
    }

    #[tokio::test]
    async fn every_message_kind_roundtrips() {
        roundtrip(Message::KeepAlive).await;
        roundtrip(Message::Choke).await;
        roundtrip(Message::Unchoke).await;
        roundtrip(Message::Interested).await;
        roundtrip(Message::NotInterested).await;
        roundtrip(Message::Have(23)).await;
        roundtrip(Message::Bitfield(vec![0b1010_0001, 0b0000_1000])).await;
        roundtrip(Message::Request {
            index: 12,
            begin: 123,
            length: 19999,
        })
        .await;
        roundtrip(Message::Piece {
            index: 123,
            begin: 333,
            block: Bytes::from_iter((0..32u8).chain([0, 0])),
        })
        .await;
        roundtrip(Message::Cancel {
            index: 12,
            begin: 123,
            length: 19999,
        })
        .await;
        roundtrip(Message::Port(1237)).await;
    }

    #[test]
    fn frames_carry_the_documented_ids() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(Message::Choke.encode(), vec![0, 0, 0, 1, 0]);
        assert_eq!(Message::Unchoke.encode(), vec![0, 0, 0, 1, 1]);
        assert_eq!(
            Message::Have(1).encode(),
            vec![0, 0, 0, 5, 4, 0, 0, 0, 1]
        );
        assert_eq!(
            Message::Request {
                index: 1,
                begin: 2,
                length: 3
            }
            .encode(),
            vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );
    }

    #[tokio::test]
    async fn unknown_ids_decode_as_keep_alive() {
        let wire = vec![0, 0, 0, 3, 42, 1, 2];
        assert_eq!(
            Message::read(&mut &wire[..]).await.unwrap(),
            Message::KeepAlive
        );
    }

    #[tokio::test]
    async fn truncated_payloads_are_malformed() {
        // Have with a 2-byte body
        let wire = vec![0, 0, 0, 3, 4, 0, 1];
        assert!(matches!(
            Message::read(&mut &wire[..]).await,
            Err(PeerError::MalformedMessage(_))
        ));
        // short read of the frame itself
        let wire = vec![0, 0, 0, 9, 7, 0];
        assert!(Message::read(&mut &wire[..]).await.is_err());
    }

    #[test]
    fn bitfield_bits_are_msb_first() {
        assert_eq!(bitfield_indices(&[0b1000_0000]), vec![0]);
        assert_eq!(bitfield_indices(&[0b0000_0001]), vec![7]);
        assert_eq!(bitfield_indices(&[0b0100_0000, 0b1000_0001]), vec![1, 8, 15]);
        assert!(bitfield_indices(&[]).is_empty());
    }
}
