//! HTTP(S) announce transport.
//!
//! One GET per announce with the parameters percent-encoded into the query
//! string (`info_hash` and `peer_id` as raw bytes), 5 second timeout, and a
//! bencoded response body carrying either a compact peer string or a list of
//! peer dictionaries.
use super::{
    parse_compact_peers, AnnounceRequest, AnnounceResponse, TrackerError, TrackerResult,
};
use serde::de::{self, SeqAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;
use url::Url;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpTracker {
    url: Url,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(url: Url) -> TrackerResult<Self> {
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { url, client })
    }

    pub async fn announce(&mut self, request: &AnnounceRequest) -> TrackerResult<AnnounceResponse> {
        let url = self.announce_url(request);
        debug!(%url, "sending announce to HTTP tracker");
        let response = self.client.get(&url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }

    fn announce_url(&self, request: &AnnounceRequest) -> String {
        let separator = if self.url.query().is_some() { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, build_query(request))
    }
}

/// Assembles the announce query string. The two 20-byte identifiers go
/// through [`url_encode`] because they are raw bytes, not text.
fn build_query(request: &AnnounceRequest) -> String {
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}&key={}",
        url_encode(&request.info_hash),
        url_encode(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
        request.numwant,
        request.key,
    );
    if let Some(event) = request.event.query_value() {
        query.push_str("&event=");
        query.push_str(event);
    }
    query
}

/// Percent-encodes a byte slice per RFC 3986: unreserved characters
/// (a-z, A-Z, 0-9, -, ., _, ~) pass through, everything else becomes %XX.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[derive(Debug, Deserialize)]
struct HttpAnnounceResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    complete: Option<u32>,
    #[serde(default)]
    incomplete: Option<u32>,
    #[serde(default)]
    peers: Peers,
}

/// The `peers` key is either a compact byte string or a list of
/// `{ip, port}` dictionaries; both collapse to socket addresses.
#[derive(Debug, Default)]
struct Peers(Vec<SocketAddr>);

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

struct PeersVisitor;

impl<'de> Visitor<'de> for PeersVisitor {
    type Value = Peers;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a compact peer string or a list of peer dictionaries")
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        parse_compact_peers(v).map(Peers).map_err(E::custom)
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        self.visit_bytes(v.as_bytes())
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut peers = Vec::new();
        while let Some(dict) = seq.next_element::<PeerDict>()? {
            // hostnames in peer dicts are rare and not worth a resolver here
            if let Ok(ip) = dict.ip.parse::<IpAddr>() {
                peers.push(SocketAddr::new(ip, dict.port));
            }
        }
        Ok(Peers(peers))
    }
}

impl<'de> Deserialize<'de> for Peers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_any(PeersVisitor)
    }
}

fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let response: HttpAnnounceResponse = serde_bencode::from_bytes(bytes)?;
    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Failure(reason));
    }
    Ok(AnnounceResponse {
        interval: response.interval,
        complete: response.complete.unwrap_or(0),
        incomplete: response.incomplete.unwrap_or(0),
        peers: response.peers.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::AnnounceEvent;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            info_hash: [0xAB; 20],
            peer_id: *b"-GT0001-123456789012",
            port: 0,
            uploaded: 0,
            downloaded: 16384,
            left: 23616,
            event: AnnounceEvent::Started,
            numwant: 50,
            key: 0xDEAD,
        }
    }

    #[test]
    fn query_percent_encodes_raw_bytes() {
        let query = build_query(&request());
        assert!(query.starts_with(&format!("info_hash={}", "%AB".repeat(20))));
        // the peer id prefix is plain ASCII and passes through
        assert!(query.contains("peer_id=-GT0001-123456789012"));
        assert!(query.contains("&compact=1"));
        assert!(query.contains("&downloaded=16384"));
        assert!(query.contains("&left=23616"));
        assert!(query.ends_with("&event=started"));

        let mut plain = request();
        plain.event = AnnounceEvent::None;
        assert!(!build_query(&plain).contains("event="));
    }

    #[test]
    fn parses_compact_peer_response() {
        let body =
            b"d8:completei3e10:incompletei7e8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.interval, Some(1800));
        assert_eq!(response.complete, 3);
        assert_eq!(response.incomplete, 7);
        assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn parses_dictionary_peer_response() {
        let body = b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip8:10.0.0.94:porti80eeee";
        let response = parse_announce_response(body).unwrap();
        assert_eq!(response.interval, Some(900));
        assert_eq!(
            response.peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.9:80".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn failure_reason_is_an_error() {
        let body = b"d14:failure reason17:torrent not founde";
        assert!(matches!(
            parse_announce_response(body),
            Err(TrackerError::Failure(reason)) if reason == "torrent not found"
        ));
    }
}
