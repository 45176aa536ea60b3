//! The central download loop: admits peers discovered by the trackers,
//! ranks pieces rarest-first, distributes outstanding blocks to peer queues
//! and accounts every block that comes back.
use crate::peer::session::{BlockReceived, Peer};
use crate::peer::BLOCKS_TO_QUEUE;
use crate::torrent::metainfo::Metainfo;
use crate::torrent::store::{Block, TorrentStore};
use crate::torrent::TorrentError;
use crate::tracker::manager::TrackerManager;
use anyhow::Result;
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Cap on concurrently connected peers.
pub const MAX_PEERS: usize = 50;

/// Scheduler tick period.
pub const CLIENT_UPDATES_INTERVAL: Duration = Duration::from_secs(5);

pub struct TorrentClient {
    metainfo: Arc<Metainfo>,
    store: Arc<TorrentStore>,
    trackers: TrackerManager,
    peers: Vec<Peer>,
    dead_peers: HashSet<SocketAddr>,
    on_block: BlockReceived,
    running: Arc<AtomicBool>,
    completed: Arc<Notify>,
}

impl TorrentClient {
    /// Loads the descriptor and initialises the data store under
    /// `<output_root>/<name>`.
    pub async fn new(torrent_path: &Path, output_root: &Path) -> Result<TorrentClient> {
        let metainfo = Arc::new(Metainfo::load(torrent_path)?);
        info!(
            torrent = %torrent_path.display(),
            name = %metainfo.info.name,
            info_hash = %hex::encode(metainfo.info_hash),
            pieces = metainfo.num_pieces(),
            total = metainfo.total_length(),
            "loaded torrent"
        );
        let store = Arc::new(TorrentStore::new(&metainfo, output_root).await?);
        let trackers = TrackerManager::new(&metainfo, store.clone());

        let running = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(Notify::new());
        let on_block = block_received(store.clone(), running.clone(), completed.clone());

        Ok(TorrentClient {
            metainfo,
            store,
            trackers,
            peers: Vec::new(),
            dead_peers: HashSet::new(),
            on_block,
            running,
            completed,
        })
    }

    pub fn store(&self) -> Arc<TorrentStore> {
        self.store.clone()
    }

    /// Drives the download to completion, then shuts everything down.
    pub async fn run(&mut self) -> Result<()> {
        if self.store.check_existing_data().await? {
            info!("nothing to download, existing data is complete");
            return Ok(());
        }
        self.trackers.start();
        self.running.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) {
            self.reap_peers();
            self.admit_peers();
            self.assign_blocks();
            if self.store.is_complete() {
                break;
            }
            let swarm = self.trackers.swarm();
            let (leechers, seeders) = swarm.counts();
            debug!(
                peers = self.peers.len(),
                leechers,
                seeders,
                downloaded = self.store.confirmed_bytes(),
                total = self.store.total_length,
                "scheduler tick"
            );
            tokio::select! {
                _ = sleep(CLIENT_UPDATES_INTERVAL) => {}
                _ = self.completed.notified() => {}
                // fresh tracker peers are worth an early tick
                _ = swarm.changed() => {}
            }
        }
        info!(name = %self.metainfo.info.name, "download complete");
        self.stop().await;
        Ok(())
    }

    /// Cooperative shutdown: trackers first (they announce `stopped`), then
    /// peers, then the store.
    pub async fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.trackers.close().await;
        for peer in self.peers.drain(..) {
            peer.close().await;
        }
        self.store.close().await;
    }

    /// Drops sessions that have ended; their addresses go to the dead list
    /// and are only retried once fresh candidates run out.
    fn reap_peers(&mut self) {
        let mut alive = Vec::with_capacity(self.peers.len());
        for peer in self.peers.drain(..) {
            if peer.is_alive() || peer.is_starting() {
                alive.push(peer);
            } else {
                debug!(peer = %peer.addr, "reaping dead peer session");
                self.dead_peers.insert(peer.addr);
            }
        }
        self.peers = alive;
    }

    /// Spins up sessions for tracker-discovered addresses up to
    /// [`MAX_PEERS`], preferring addresses that have not failed before.
    fn admit_peers(&mut self) {
        let known = self.trackers.peers();
        let active: HashSet<SocketAddr> = self.peers.iter().map(|peer| peer.addr).collect();
        let fresh = known
            .iter()
            .filter(|addr| !self.dead_peers.contains(addr) && !active.contains(addr));
        let retry = known
            .iter()
            .filter(|addr| self.dead_peers.contains(addr) && !active.contains(addr));
        let candidates: Vec<SocketAddr> = fresh.chain(retry).copied().collect();

        for addr in candidates {
            if self.peers.len() >= MAX_PEERS {
                break;
            }
            debug!(peer = %addr, "starting peer session");
            self.peers.push(Peer::spawn(
                addr,
                self.metainfo.info_hash,
                self.trackers.peer_id,
                self.on_block.clone(),
            ));
        }
    }

    /// Rarest-first block distribution. Pieces are ranked by how few active
    /// peers advertise them; each unconfirmed piece's outstanding blocks are
    /// spread over its peers, least-loaded first, without overfilling any
    /// queue.
    fn assign_blocks(&self) {
        let num_pieces = self.store.num_pieces();
        let mut availability: Vec<(usize, Vec<usize>)> =
            (0..num_pieces).map(|piece_id| (piece_id, Vec::new())).collect();
        for (peer_index, peer) in self.peers.iter().enumerate() {
            for piece_id in peer.available_pieces() {
                // bits past the end of the bitfield carry no meaning
                if let Some(entry) = availability.get_mut(piece_id as usize) {
                    entry.1.push(peer_index);
                }
            }
        }
        availability.sort_by_key(|(_, peers)| peers.len());

        for (piece_id, mut peer_indices) in availability {
            if peer_indices.is_empty() {
                continue;
            }
            let piece = match self.store.piece(piece_id) {
                Ok(piece) => piece,
                Err(_) => continue,
            };
            if piece.is_confirmed() {
                continue;
            }
            let mut blocks_left: VecDeque<Arc<Block>> = piece
                .blocks
                .iter()
                .filter(|block| !block.is_downloaded() && block.request_timed_out())
                .cloned()
                .collect();
            if blocks_left.is_empty() {
                continue;
            }
            peer_indices.sort_by_key(|&peer_index| self.peers[peer_index].queued_blocks());
            for peer_index in peer_indices {
                let peer = &self.peers[peer_index];
                while let Some(block) = blocks_left.front() {
                    if peer.queued_blocks() >= BLOCKS_TO_QUEUE
                        || !peer.enqueue(block.clone())
                    {
                        break;
                    }
                    blocks_left.pop_front();
                }
                if blocks_left.is_empty() {
                    break;
                }
            }
        }
    }
}

/// The callback a peer session invokes for every received Piece payload. It
/// writes and accounts the block; an error is fatal to the session that
/// delivered it.
fn block_received(
    store: Arc<TorrentStore>,
    running: Arc<AtomicBool>,
    completed: Arc<Notify>,
) -> BlockReceived {
    Arc::new(move |index, begin, data| {
        let store = store.clone();
        let running = running.clone();
        let completed = completed.clone();
        Box::pin(async move {
            let block = store
                .find_block(index, begin)
                .ok_or(TorrentError::UnknownBlock {
                    piece: index,
                    begin,
                })?;
            if data.len() != block.length as usize {
                return Err(TorrentError::BlockSizeMismatch {
                    piece: index,
                    begin,
                    expected: block.length,
                    actual: data.len(),
                }
                .into());
            }
            store.write_block(&block, &data).await?;
            let piece = store.piece(index as usize)?;
            if !block.set_downloaded(true) {
                piece.add_downloaded_bytes(block.length as u64);
            }
            if piece.is_downloaded() && !piece.is_confirmed() {
                if store.verify_piece(index as usize).await? {
                    piece.set_confirmed(true);
                    debug!(piece = index, "piece verified");
                    if store.is_complete() {
                        running.store(false, Ordering::SeqCst);
                        completed.notify_waiters();
                    }
                } else {
                    warn!(piece = index, "piece failed verification, clearing for refetch");
                    piece.clear_blocks();
                }
            }
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::tests::multi_file_fixture;
    use bytes::Bytes;
    use tempfile::TempDir;

    async fn fixture_store() -> (TempDir, Arc<TorrentStore>, Vec<u8>) {
        let (value, contents) = multi_file_fixture();
        let metainfo = Metainfo::parse(value).unwrap();
        let dir = TempDir::new().unwrap();
        let store = Arc::new(TorrentStore::new(&metainfo, dir.path()).await.unwrap());
        (dir, store, contents)
    }

    fn client_for(store: Arc<TorrentStore>, peers: Vec<Peer>) -> TorrentClient {
        let (value, _) = multi_file_fixture();
        let metainfo = Arc::new(Metainfo::parse(value).unwrap());
        let running = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(Notify::new());
        let on_block = block_received(store.clone(), running.clone(), completed.clone());
        let trackers = TrackerManager::new(&metainfo, store.clone());
        TorrentClient {
            metainfo,
            store,
            trackers,
            peers,
            dead_peers: HashSet::new(),
            on_block,
            running,
            completed,
        }
    }

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 6881))
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<Arc<Block>>) -> Vec<Arc<Block>> {
        let mut blocks = Vec::new();
        while let Ok(block) = rx.try_recv() {
            blocks.push(block);
        }
        blocks
    }

    #[tokio::test]
    async fn rarest_pieces_are_assigned_first() {
        let (_dir, store, _) = fixture_store().await;
        // availability: piece 0 -> {a, b, c}, piece 1 -> {a, d}; piece 1 is
        // the rarest and must be handed out first
        let (peer_a, mut rx_a) = Peer::stub(addr(1), HashSet::from([0, 1]));
        let (peer_b, mut rx_b) = Peer::stub(addr(2), HashSet::from([0]));
        let (peer_c, mut rx_c) = Peer::stub(addr(3), HashSet::from([1]));
        let (peer_d, mut rx_d) = Peer::stub(addr(4), HashSet::from([0]));

        let client = client_for(store.clone(), vec![peer_a, peer_b, peer_c, peer_d]);
        client.assign_blocks();

        let a_blocks = drain(&mut rx_a);
        let b_blocks = drain(&mut rx_b);
        let c_blocks = drain(&mut rx_c);
        let d_blocks = drain(&mut rx_d);

        // piece 1 went to one of its advertisers before a took on piece 0
        assert!(a_blocks.first().is_some_and(|b| b.piece_id == 1) || !c_blocks.is_empty());
        // every block was assigned exactly once
        let mut all: Vec<(u32, u32)> = a_blocks
            .iter()
            .chain(&b_blocks)
            .chain(&c_blocks)
            .chain(&d_blocks)
            .map(|block| (block.piece_id, block.begin))
            .collect();
        all.sort_unstable();
        assert_eq!(all, vec![(0, 0), (0, 16384), (1, 0)]);
        // peers b and d never advertised piece 1
        assert!(b_blocks.iter().all(|block| block.piece_id == 0));
        assert!(d_blocks.iter().all(|block| block.piece_id == 0));
    }

    #[tokio::test]
    async fn confirmed_pieces_and_fresh_requests_are_skipped() {
        let (_dir, store, _) = fixture_store().await;
        store.piece(0).unwrap().set_confirmed(true);
        for block in &store.piece(1).unwrap().blocks {
            block.mark_requested();
        }
        let (peer_a, mut rx_a) = Peer::stub(addr(1), HashSet::from([0, 1]));
        let client = client_for(store, vec![peer_a]);
        client.assign_blocks();
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn block_callback_verifies_completed_pieces() {
        let (_dir, store, contents) = fixture_store().await;
        let running = Arc::new(AtomicBool::new(true));
        let completed = Arc::new(Notify::new());
        let callback = block_received(store.clone(), running.clone(), completed.clone());

        for piece in store.pieces() {
            for block in &piece.blocks {
                let begin = block.absolute_begin as usize;
                let payload =
                    Bytes::copy_from_slice(&contents[begin..begin + block.length as usize]);
                callback(block.piece_id, block.begin, payload).await.unwrap();
            }
        }
        assert!(store.is_complete());
        assert!(!running.load(Ordering::SeqCst));
        assert_eq!(store.confirmed_bytes(), store.total_length);
    }

    #[tokio::test]
    async fn size_mismatched_blocks_are_rejected() {
        let (_dir, store, _) = fixture_store().await;
        let running = Arc::new(AtomicBool::new(true));
        let completed = Arc::new(Notify::new());
        let callback = block_received(store.clone(), running, completed);

        let result = callback(0, 0, Bytes::from_static(b"short")).await;
        assert!(result.is_err());
        // unknown block offset
        assert!(callback(0, 1, Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_block_data_clears_the_piece_for_refetch() {
        let (_dir, store, contents) = fixture_store().await;
        let running = Arc::new(AtomicBool::new(true));
        let completed = Arc::new(Notify::new());
        let callback = block_received(store.clone(), running, completed);

        let piece = store.piece(1).unwrap();
        for block in &piece.blocks {
            // right length, wrong bytes
            let payload = Bytes::from(vec![0x55u8; block.length as usize]);
            callback(1, block.begin, payload).await.unwrap();
        }
        assert!(!piece.is_confirmed());
        assert!(piece.blocks.iter().all(|block| !block.is_downloaded()));
        assert_eq!(piece.bytes_downloaded(), 0);

        // the correct bytes then confirm it
        for block in &piece.blocks {
            let begin = block.absolute_begin as usize;
            let payload = Bytes::copy_from_slice(&contents[begin..begin + block.length as usize]);
            callback(1, block.begin, payload).await.unwrap();
        }
        assert!(piece.is_confirmed());
    }
}
