//! The fixed 68-byte handshake that opens every peer connection.
//!
//! It verifies that both sides are participating in the same torrent (via
//! the info-hash) and carries the remote peer id, which is retained purely
//! for logging.
use super::{PeerError, PeerResult};
use tokio::io::{AsyncRead, AsyncReadExt};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 68;

/// `<19><"BitTorrent protocol"><8 zero bytes><info_hash><peer_id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Serializes the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        // bytes 20..28 stay zero: no extensions advertised
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Reads exactly 68 bytes from `stream` and parses them, rejecting
    /// anything that is not a BitTorrent protocol handshake.
    pub async fn read<R: AsyncRead + Unpin>(stream: &mut R) -> PeerResult<Self> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;

        if buf[0] as usize != PROTOCOL.len() || &buf[1..20] != PROTOCOL {
            return Err(PeerError::InvalidProtocol);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { info_hash, peer_id })
    }

    /// Rejects the remote side when it is serving a different torrent.
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> PeerResult<()> {
        if &self.info_hash != expected_info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_info_hash_and_peer_id() {
        let handshake = Handshake::new([0xab; 20], *b"-GT0001-123456789012");
        let wire = handshake.serialize();
        assert_eq!(wire.len(), 68);
        assert_eq!(wire[0], 19);

        let parsed = Handshake::read(&mut &wire[..]).await.unwrap();
        assert_eq!(parsed, handshake);
        assert!(parsed.validate(&[0xab; 20]).is_ok());
    }

    #[tokio::test]
    async fn rejects_foreign_protocols_and_hashes() {
        let mut wire = Handshake::new([1; 20], [2; 20]).serialize();
        wire[5] ^= 0xff;
        assert!(matches!(
            Handshake::read(&mut &wire[..]).await,
            Err(PeerError::InvalidProtocol)
        ));

        let wire = Handshake::new([1; 20], [2; 20]).serialize();
        let parsed = Handshake::read(&mut &wire[..]).await.unwrap();
        assert!(matches!(
            parsed.validate(&[9; 20]),
            Err(PeerError::InfoHashMismatch)
        ));
    }

    #[tokio::test]
    async fn short_input_is_an_error() {
        let wire = Handshake::new([1; 20], [2; 20]).serialize();
        assert!(Handshake::read(&mut &wire[..40]).await.is_err());
    }
}
