//! UDP announce transport per BEP 15.
//!
//! Two binary messages over one connected socket: connect (obtains a
//! connection id the tracker expects on later packets) and announce. Lost
//! datagrams are retransmitted on a 15·2ⁿ second schedule; a stale
//! connection id is dropped on error and re-obtained on the next announce.
use super::{
    parse_compact_peers, AnnounceRequest, AnnounceResponse, TrackerError, TrackerResult,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};
use url::Url;

/// Magic constant opening every connect request.
const CONNECT_MAGIC: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// Attempt `n` waits `RETRY_BASE * 2^n`; after all attempts the announce
/// fails.
const RETRY_ATTEMPTS: u32 = 9;
const RETRY_BASE: Duration = Duration::from_secs(15);

pub struct UdpTracker {
    url: Url,
    socket: Option<UdpSocket>,
    connection_id: Option<u64>,
    retry_base: Duration,
}

impl UdpTracker {
    pub fn new(url: Url) -> TrackerResult<Self> {
        if url.host_str().is_none() || url.port().is_none() {
            return Err(TrackerError::Malformed(format!(
                "announce URL {url} lacks a host or port"
            )));
        }
        Ok(Self {
            url,
            socket: None,
            connection_id: None,
            retry_base: RETRY_BASE,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub async fn announce(&mut self, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        let connection_id = match self.connection_id {
            Some(id) => id,
            None => self.connect().await?,
        };

        let transaction_id = rand::random::<u32>();
        let packet = announce_packet(connection_id, transaction_id, request)?;
        let result = match self.exchange(&packet).await {
            Ok(response) => parse_announce(&response, transaction_id),
            Err(e) => Err(e),
        };
        if result.is_err() {
            // the connection id may have expired; re-obtain it next time
            self.connection_id = None;
        }
        result
    }

    /// Obtains a fresh connection id from the tracker.
    async fn connect(&mut self) -> TrackerResult<u64> {
        let transaction_id = rand::random::<u32>();
        let mut packet = Vec::with_capacity(16);
        packet.write_u64::<BigEndian>(CONNECT_MAGIC)?;
        packet.write_u32::<BigEndian>(ACTION_CONNECT)?;
        packet.write_u32::<BigEndian>(transaction_id)?;

        debug!(tracker = %self.url, "sending connect to UDP tracker");
        let response = self.exchange(&packet).await?;
        if response.len() < 16 {
            return Err(TrackerError::Malformed(format!(
                "connect response of {} bytes, expected at least 16",
                response.len()
            )));
        }
        let mut cursor = Cursor::new(&response);
        let action = cursor.read_u32::<BigEndian>()?;
        let response_transaction_id = cursor.read_u32::<BigEndian>()?;
        let connection_id = cursor.read_u64::<BigEndian>()?;
        if response_transaction_id != transaction_id {
            return Err(TrackerError::TransactionMismatch);
        }
        if action != ACTION_CONNECT {
            return Err(TrackerError::Malformed(format!(
                "connect response carries action {action}"
            )));
        }
        self.connection_id = Some(connection_id);
        Ok(connection_id)
    }

    /// Sends `packet` and waits for one datagram back, retransmitting on the
    /// exponential schedule.
    async fn exchange(&mut self, packet: &[u8]) -> TrackerResult<Vec<u8>> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => self.open_socket().await?,
        };
        let result = exchange_on(&socket, packet, self.retry_base).await;
        self.socket = Some(socket);
        result
    }

    async fn open_socket(&self) -> TrackerResult<UdpSocket> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let host = self
            .url
            .host_str()
            .ok_or_else(|| TrackerError::Malformed("announce URL lost its host".to_string()))?;
        let port = self
            .url
            .port()
            .ok_or_else(|| TrackerError::Malformed("announce URL lost its port".to_string()))?;
        socket.connect((host, port)).await?;
        Ok(socket)
    }
}

async fn exchange_on(
    socket: &UdpSocket,
    packet: &[u8],
    retry_base: Duration,
) -> TrackerResult<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    for attempt in 0..RETRY_ATTEMPTS {
        socket.send(packet).await?;
        let wait = retry_base * 2u32.pow(attempt);
        match timeout(wait, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => return Ok(buf[..len].to_vec()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                trace!(attempt, "UDP tracker timed out, retransmitting");
            }
        }
    }
    Err(TrackerError::RetriesExhausted(RETRY_ATTEMPTS))
}

/// The fixed 98-byte announce packet.
fn announce_packet(
    connection_id: u64,
    transaction_id: u32,
    request: &AnnounceRequest,
) -> TrackerResult<Vec<u8>> {
    let mut packet = Vec::with_capacity(98);
    packet.write_u64::<BigEndian>(connection_id)?;
    packet.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    packet.write_u32::<BigEndian>(transaction_id)?;
    packet.write_all(&request.info_hash)?;
    packet.write_all(&request.peer_id)?;
    packet.write_u64::<BigEndian>(request.downloaded)?;
    packet.write_u64::<BigEndian>(request.left)?;
    packet.write_u64::<BigEndian>(request.uploaded)?;
    packet.write_u32::<BigEndian>(request.event.wire_value())?;
    // ip address 0: let the tracker use the packet source
    packet.write_u32::<BigEndian>(0)?;
    packet.write_u32::<BigEndian>(request.key)?;
    // numwant -1: tracker default
    packet.write_i32::<BigEndian>(-1)?;
    packet.write_u16::<BigEndian>(request.port)?;
    Ok(packet)
}

fn parse_announce(response: &[u8], transaction_id: u32) -> TrackerResult<AnnounceResponse> {
    if response.len() < 8 {
        return Err(TrackerError::Malformed(format!(
            "announce response of {} bytes, expected at least 8",
            response.len()
        )));
    }
    let mut cursor = Cursor::new(response);
    let action = cursor.read_u32::<BigEndian>()?;
    let response_transaction_id = cursor.read_u32::<BigEndian>()?;
    if response_transaction_id != transaction_id {
        return Err(TrackerError::TransactionMismatch);
    }
    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&response[8..]).into_owned();
        return Err(TrackerError::Failure(message));
    }
    if action != ACTION_ANNOUNCE || response.len() < 20 {
        return Err(TrackerError::Malformed(format!(
            "announce response carries action {action} in {} bytes",
            response.len()
        )));
    }
    let interval = cursor.read_u32::<BigEndian>()?;
    let leechers = cursor.read_u32::<BigEndian>()?;
    let seeders = cursor.read_u32::<BigEndian>()?;
    let peers = parse_compact_peers(&response[20..])?;
    Ok(AnnounceResponse {
        interval: Some(interval as u64),
        complete: seeders,
        incomplete: leechers,
        peers,
    })
}
