//! Tracker clients for the BitTorrent protocol.
//!
//! Two announce transports (HTTP and UDP) share one lifecycle: announce
//! `started`, re-announce every tracker-supplied interval, and send a
//! best-effort `stopped` on close. Announce errors are scoped to the tracker
//! that hit them; it flags the error, backs off and retries.
use crate::torrent::store::TorrentStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

pub mod http;
pub mod manager;
pub mod udp;

use http::HttpTracker;
use manager::Swarm;
use udp::UdpTracker;

/// Seconds between announces when the tracker does not supply an interval,
/// and the backoff after a failed announce.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// How many peers we ask for per announce.
pub const DEFAULT_NUMWANT: u32 = 50;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported announce scheme in {0}")]
    UnsupportedScheme(String),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("bencode deserialization error: {0}")]
    BencodeDe(#[from] serde_bencode::Error),

    #[error("tracker reported failure: {0}")]
    Failure(String),

    #[error("transaction id mismatch")]
    TransactionMismatch,

    #[error("malformed tracker response: {0}")]
    Malformed(String),

    #[error("no response after {0} attempts")]
    RetriesExhausted(u32),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    #[default]
    None,
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    /// Value of the HTTP `event` query parameter; regular announces omit it.
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            AnnounceEvent::None => None,
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
        }
    }

    /// Numeric event of the BEP 15 announce packet.
    pub fn wire_value(self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }
}

/// Parameters of a single announce, shared by both transports.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub numwant: u32,
    /// Stable random value identifying this run to the tracker.
    pub key: u32,
}

/// A parsed announce response, already reduced to what the engine consumes.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: Option<u64>,
    /// Seeders.
    pub complete: u32,
    /// Leechers.
    pub incomplete: u32,
    pub peers: Vec<SocketAddr>,
}

/// Parses a compact peer list: 6 bytes per peer, 4-byte IPv4 address then a
/// big-endian port. Any other length is malformed.
pub fn parse_compact_peers(data: &[u8]) -> TrackerResult<Vec<SocketAddr>> {
    if data.len() % 6 != 0 {
        return Err(TrackerError::Malformed(format!(
            "compact peer list of {} bytes is not a multiple of 6",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(6)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect())
}

enum Transport {
    Http(HttpTracker),
    Udp(UdpTracker),
}

/// One announcer bound to a single announce URL.
pub struct Tracker {
    url: Url,
    transport: Transport,
    store: Arc<TorrentStore>,
    swarm: Arc<Swarm>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    key: u32,
    connected: bool,
    error: bool,
    interval: Duration,
}

impl Tracker {
    /// Builds a tracker for `announce_url`, picking the transport from the
    /// URL scheme.
    pub fn from_url(
        announce_url: &str,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        key: u32,
        store: Arc<TorrentStore>,
        swarm: Arc<Swarm>,
    ) -> TrackerResult<Tracker> {
        let url = Url::parse(announce_url)?;
        let transport = match url.scheme() {
            "http" | "https" => Transport::Http(HttpTracker::new(url.clone())?),
            "udp" => Transport::Udp(UdpTracker::new(url.clone())?),
            _ => return Err(TrackerError::UnsupportedScheme(announce_url.to_string())),
        };
        Ok(Tracker {
            url,
            transport,
            store,
            swarm,
            info_hash,
            peer_id,
            key,
            connected: false,
            error: false,
            interval: DEFAULT_ANNOUNCE_INTERVAL,
        })
    }

    fn request(&self, event: AnnounceEvent) -> AnnounceRequest {
        let downloaded = self.store.confirmed_bytes();
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            // the engine never listens for incoming connections
            port: 0,
            uploaded: 0,
            downloaded,
            left: self.store.total_length - downloaded,
            event,
            numwant: DEFAULT_NUMWANT,
            key: self.key,
        }
    }

    /// Runs one announce and feeds the result into the swarm state.
    pub async fn announce(&mut self, event: AnnounceEvent) -> TrackerResult<AnnounceResponse> {
        let request = self.request(event);
        let response = match &mut self.transport {
            Transport::Http(tracker) => tracker.announce(&request).await?,
            Transport::Udp(tracker) => tracker.announce(&request).await?,
        };
        self.connected = true;
        self.error = false;
        if let Some(interval) = response.interval {
            self.interval = Duration::from_secs(interval);
        }
        debug!(
            tracker = %self.url,
            leechers = response.incomplete,
            seeders = response.complete,
            peers = response.peers.len(),
            "announce ok"
        );
        self.swarm
            .update(response.incomplete, response.complete, &response.peers);
        Ok(response)
    }

    /// The periodic announce loop: `started` first, then plain announces
    /// every interval until `shutdown` flips, then a best-effort `stopped`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut event = AnnounceEvent::Started;
        while !*shutdown.borrow() {
            if let Err(e) = self.announce(event).await {
                self.error = true;
                warn!(tracker = %self.url, error = %e, "announce failed");
            } else {
                event = AnnounceEvent::None;
            }
            let wait = if self.error {
                DEFAULT_ANNOUNCE_INTERVAL
            } else {
                self.interval
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }
        if self.connected {
            let _ = self.announce(AnnounceEvent::Stopped).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_peers_parse_only_multiples_of_six() {
        let data = [127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0, 80];
        let peers = parse_compact_peers(&data).unwrap();
        assert_eq!(
            peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:80".parse().unwrap(),
            ]
        );
        assert!(parse_compact_peers(&[]).unwrap().is_empty());
        for bad_len in [1usize, 5, 7, 11] {
            assert!(parse_compact_peers(&vec![0u8; bad_len]).is_err());
        }
    }

    #[test]
    fn announce_events_map_to_wire_values() {
        assert_eq!(AnnounceEvent::None.wire_value(), 0);
        assert_eq!(AnnounceEvent::Completed.wire_value(), 1);
        assert_eq!(AnnounceEvent::Started.wire_value(), 2);
        assert_eq!(AnnounceEvent::Stopped.wire_value(), 3);
        assert_eq!(AnnounceEvent::None.query_value(), None);
        assert_eq!(AnnounceEvent::Started.query_value(), Some("started"));
    }
}
