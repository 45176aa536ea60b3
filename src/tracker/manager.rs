//! Fans announces out to every tracker of the torrent and aggregates the
//! peer sets they return.
use super::Tracker;
use crate::torrent::metainfo::Metainfo;
use crate::torrent::store::TorrentStore;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Swarm knowledge shared by all trackers: the unioned peer set and the last
/// reported leecher/seeder counts. Trackers push into it, the scheduler reads
/// from it and is woken through `updates`.
#[derive(Debug, Default)]
pub struct Swarm {
    leechers: AtomicU32,
    seeders: AtomicU32,
    peers: Mutex<HashSet<SocketAddr>>,
    updates: Notify,
}

impl Swarm {
    pub fn update(&self, leechers: u32, seeders: u32, peers: &[SocketAddr]) {
        self.leechers.store(leechers, Ordering::SeqCst);
        self.seeders.store(seeders, Ordering::SeqCst);
        self.peers.lock().unwrap().extend(peers.iter().copied());
        self.updates.notify_waiters();
    }

    /// Every peer address any tracker has ever returned.
    pub fn peers(&self) -> HashSet<SocketAddr> {
        self.peers.lock().unwrap().clone()
    }

    /// `(leechers, seeders)` from the most recent successful announce.
    pub fn counts(&self) -> (u32, u32) {
        (
            self.leechers.load(Ordering::SeqCst),
            self.seeders.load(Ordering::SeqCst),
        )
    }

    /// Resolves after the next tracker update.
    pub async fn changed(&self) {
        self.updates.notified().await;
    }
}

pub struct TrackerManager {
    pub peer_id: [u8; 20],
    swarm: Arc<Swarm>,
    trackers: Vec<Tracker>,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl TrackerManager {
    /// Builds one tracker per announce URL of the descriptor. URLs with
    /// schemes we do not speak are skipped with a warning.
    pub fn new(metainfo: &Metainfo, store: Arc<TorrentStore>) -> TrackerManager {
        let peer_id = generate_peer_id();
        let key = rand::rng().random::<u32>();
        let swarm = Arc::new(Swarm::default());
        let (shutdown, _) = watch::channel(false);

        let trackers = metainfo
            .announce_urls()
            .iter()
            .filter_map(|announce_url| {
                match Tracker::from_url(
                    announce_url,
                    metainfo.info_hash,
                    peer_id,
                    key,
                    store.clone(),
                    swarm.clone(),
                ) {
                    Ok(tracker) => Some(tracker),
                    Err(e) => {
                        warn!(url = %announce_url, error = %e, "skipping tracker");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        debug!(trackers = trackers.len(), "tracker manager ready");

        TrackerManager {
            peer_id,
            swarm,
            trackers,
            handles: Vec::new(),
            shutdown,
        }
    }

    /// Spawns the announce loop of every tracker.
    pub fn start(&mut self) {
        for tracker in self.trackers.drain(..) {
            self.handles
                .push(tokio::spawn(tracker.run(self.shutdown.subscribe())));
        }
    }

    pub fn swarm(&self) -> Arc<Swarm> {
        self.swarm.clone()
    }

    pub fn peers(&self) -> HashSet<SocketAddr> {
        self.swarm.peers()
    }

    /// Stops every announce loop and waits for the final `stopped`
    /// announces to go out.
    pub async fn close(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// 20-byte peer id in the Azureus convention: client tag, then twelve random
/// ASCII digits. Stable for the lifetime of the process.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-GT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    for byte in peer_id[prefix.len()..].iter_mut() {
        *byte = rng.random_range(b'0'..=b'9');
    }
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_is_tagged_and_numeric() {
        let peer_id = generate_peer_id();
        assert_eq!(&peer_id[..8], b"-GT0001-");
        assert!(peer_id[8..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn swarm_unions_peer_sets() {
        let swarm = Swarm::default();
        let a: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        swarm.update(3, 1, &[a, b]);
        swarm.update(2, 2, &[a]);
        assert_eq!(swarm.peers(), HashSet::from([a, b]));
        assert_eq!(swarm.counts(), (2, 2));
    }
}
