//! One session per remote peer: connect, handshake, then three concurrent
//! activities — the keep-alive loop, the request loop pulling blocks off the
//! scheduler's queue, and the main read loop dispatching incoming messages.
//!
//! A session failure (connect error, reset, protocol violation, a rejected
//! block) only kills this session; the scheduler reaps the handle on its
//! next tick.
use super::handshake::Handshake;
use super::message::{bitfield_indices, Message};
use super::{PeerError, BLOCKS_TO_QUEUE, CONNECT_TIMEOUT, KEEP_ALIVE_INTERVAL};
use crate::torrent::store::Block;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

/// Future returned by the block-received callback.
pub type BlockFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Invoked for every received Piece payload as `(piece index, begin, data)`.
/// An error return is fatal to the session that received the block.
pub type BlockReceived = Arc<dyn Fn(u32, u32, Bytes) -> BlockFuture + Send + Sync>;

type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Scheduler-side handle to a running peer session.
pub struct Peer {
    pub addr: SocketAddr,
    state: Arc<PeerState>,
    work: mpsc::Sender<Arc<Block>>,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct PeerState {
    alive: AtomicBool,
    starting: AtomicBool,
    peer_interested: AtomicBool,
    /// The id the remote sent in its handshake; informational only.
    remote_peer_id: Mutex<Option<[u8; 20]>>,
    available_pieces: Mutex<HashSet<u32>>,
    shutdown: Notify,
}

impl Peer {
    /// Spawns a session task for `addr` and returns its handle.
    pub fn spawn(
        addr: SocketAddr,
        info_hash: [u8; 20],
        our_peer_id: [u8; 20],
        on_block: BlockReceived,
    ) -> Peer {
        let (work_tx, work_rx) = mpsc::channel(BLOCKS_TO_QUEUE);
        let state = Arc::new(PeerState {
            alive: AtomicBool::new(false),
            starting: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            remote_peer_id: Mutex::new(None),
            available_pieces: Mutex::new(HashSet::new()),
            shutdown: Notify::new(),
        });
        let (choked_tx, choked_rx) = watch::channel(true);
        let session = PeerSession {
            addr,
            info_hash,
            our_peer_id,
            on_block,
            state: state.clone(),
            work: Some(work_rx),
            writer: None,
            keep_alive_task: None,
            request_task: None,
            choked_tx,
            choked_rx,
            requests: Arc::new(Semaphore::new(BLOCKS_TO_QUEUE)),
        };
        let task = tokio::spawn(session.run());
        Peer {
            addr,
            state,
            work: work_tx,
            task,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    /// True from construction until the handshake completes (or fails).
    pub fn is_starting(&self) -> bool {
        self.state.starting.load(Ordering::SeqCst)
    }

    pub fn is_peer_interested(&self) -> bool {
        self.state.peer_interested.load(Ordering::SeqCst)
    }

    /// The id the remote presented in its handshake, once connected.
    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        *self.state.remote_peer_id.lock().unwrap()
    }

    /// The piece indices this peer has advertised via Bitfield and Have.
    pub fn available_pieces(&self) -> HashSet<u32> {
        self.state.available_pieces.lock().unwrap().clone()
    }

    /// Blocks currently queued for this session's request loop.
    pub fn queued_blocks(&self) -> usize {
        self.work.max_capacity() - self.work.capacity()
    }

    /// Hands a block to the session. Returns false when the queue is full or
    /// the session is gone; the scheduler moves on to another peer either
    /// way.
    pub fn enqueue(&self, block: Arc<Block>) -> bool {
        self.work.try_send(block).is_ok()
    }

    /// Signals the session to stop and waits for it to tear down.
    pub async fn close(self) {
        self.state.shutdown.notify_one();
        let _ = self.task.await;
    }

    #[cfg(test)]
    pub(crate) fn stub(
        addr: SocketAddr,
        available: HashSet<u32>,
    ) -> (Peer, mpsc::Receiver<Arc<Block>>) {
        let (work_tx, work_rx) = mpsc::channel(BLOCKS_TO_QUEUE);
        let state = Arc::new(PeerState {
            alive: AtomicBool::new(true),
            starting: AtomicBool::new(false),
            peer_interested: AtomicBool::new(false),
            remote_peer_id: Mutex::new(None),
            available_pieces: Mutex::new(available),
            shutdown: Notify::new(),
        });
        let peer = Peer {
            addr,
            state,
            work: work_tx,
            task: tokio::spawn(async {}),
        };
        (peer, work_rx)
    }
}

struct PeerSession {
    addr: SocketAddr,
    info_hash: [u8; 20],
    our_peer_id: [u8; 20],
    on_block: BlockReceived,
    state: Arc<PeerState>,
    work: Option<mpsc::Receiver<Arc<Block>>>,
    writer: Option<SharedWriter>,
    keep_alive_task: Option<JoinHandle<()>>,
    request_task: Option<JoinHandle<Result<()>>>,
    choked_tx: watch::Sender<bool>,
    choked_rx: watch::Receiver<bool>,
    requests: Arc<Semaphore>,
}

impl PeerSession {
    async fn run(mut self) {
        let state = self.state.clone();
        let result = tokio::select! {
            _ = state.shutdown.notified() => Ok(()),
            result = self.main_loop() => result,
        };
        if let Err(e) = result {
            // failures during startup are routine (most candidates are gone)
            if self.state.starting.load(Ordering::SeqCst) {
                debug!(peer = %self.addr, error = %e, "could not establish peer session");
            } else {
                warn!(peer = %self.addr, error = %e, "connection with peer dropped");
            }
        }
        self.teardown().await;
    }

    /// Connect, handshake, spawn the two sub-activities, then read messages
    /// until the connection dies.
    async fn main_loop(&mut self) -> Result<()> {
        let (mut reader, writer) = self.connect().await?;
        self.writer = Some(writer.clone());

        self.keep_alive_task = Some(tokio::spawn(keep_alive(writer.clone())));
        if let Some(work) = self.work.take() {
            self.request_task = Some(tokio::spawn(request_blocks(
                writer,
                work,
                self.choked_rx.clone(),
                self.requests.clone(),
            )));
        }

        loop {
            let msg = Message::read(&mut reader).await?;
            self.handle_message(msg).await?;
        }
    }

    async fn connect(&mut self) -> Result<(OwnedReadHalf, SharedWriter)> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| PeerError::ConnectTimeout)??;
        let (mut reader, mut writer) = stream.into_split();

        let ours = Handshake::new(self.info_hash, self.our_peer_id);
        writer.write_all(&ours.serialize()).await?;
        let theirs = Handshake::read(&mut reader).await?;
        theirs.validate(&self.info_hash)?;

        *self.state.remote_peer_id.lock().unwrap() = Some(theirs.peer_id);
        self.state.starting.store(false, Ordering::SeqCst);
        self.state.alive.store(true, Ordering::SeqCst);
        debug!(
            peer = %self.addr,
            peer_id = %String::from_utf8_lossy(&theirs.peer_id),
            "connected to peer"
        );

        Ok((reader, Arc::new(tokio::sync::Mutex::new(writer))))
    }

    async fn handle_message(&mut self, msg: Message) -> Result<()> {
        trace!(peer = %self.addr, ?msg, "<-");
        match msg {
            Message::Choke => {
                self.choked_tx.send_replace(true);
            }
            Message::Unchoke => {
                self.choked_tx.send_replace(false);
            }
            Message::Interested => {
                self.state.peer_interested.store(true, Ordering::SeqCst);
            }
            Message::NotInterested => {
                self.state.peer_interested.store(false, Ordering::SeqCst);
            }
            Message::Have(index) => {
                self.state.available_pieces.lock().unwrap().insert(index);
            }
            Message::Bitfield(bits) => {
                self.state
                    .available_pieces
                    .lock()
                    .unwrap()
                    .extend(bitfield_indices(&bits));
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                (self.on_block)(index, begin, block)
                    .await
                    .with_context(|| format!("block [{index}, {begin}] rejected"))?;
                // one request slot frees per delivered block; an unsolicited
                // flood must not widen the window
                if self.requests.available_permits() < BLOCKS_TO_QUEUE {
                    self.requests.add_permits(1);
                }
            }
            // leech-only: we take requests in but never serve them
            Message::Request { index, begin, .. } | Message::Cancel { index, begin, .. } => {
                trace!(peer = %self.addr, index, begin, "ignoring upload request");
            }
            Message::Port(_) | Message::KeepAlive => {}
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        self.state.alive.store(false, Ordering::SeqCst);
        self.state.starting.store(false, Ordering::SeqCst);
        if let Some(task) = self.request_task.take() {
            task.abort();
        }
        if let Some(task) = self.keep_alive_task.take() {
            task.abort();
        }
        if let Some(writer) = self.writer.take() {
            // drain errors on a dead link are expected
            let _ = writer.lock().await.shutdown().await;
        }
    }
}

async fn send_message(writer: &SharedWriter, msg: &Message) -> Result<(), PeerError> {
    trace!(?msg, "->");
    writer.lock().await.write_all(&msg.encode()).await?;
    Ok(())
}

async fn keep_alive(writer: SharedWriter) {
    loop {
        if send_message(&writer, &Message::KeepAlive).await.is_err() {
            break;
        }
        sleep(KEEP_ALIVE_INTERVAL).await;
    }
}

/// Pulls assigned blocks off the queue and turns them into Request messages,
/// gated on the remote unchoking us and on the outstanding-request window.
async fn request_blocks(
    writer: SharedWriter,
    mut work: mpsc::Receiver<Arc<Block>>,
    mut choked: watch::Receiver<bool>,
    requests: Arc<Semaphore>,
) -> Result<()> {
    // we never choke the remote side once we are ready to transfer
    send_message(&writer, &Message::Unchoke).await?;
    let mut interested = false;
    while let Some(block) = work.recv().await {
        block.mark_requested();
        if !interested {
            interested = true;
            send_message(&writer, &Message::Interested).await?;
        }
        choked.wait_for(|choked| !*choked).await?;
        requests.acquire().await?.forget();
        send_message(
            &writer,
            &Message::Request {
                index: block.piece_id,
                begin: block.begin,
                length: block.length,
            },
        )
        .await?;
    }
    Ok(())
}
