//! On-disk data store for a torrent: the piece/block layout, the mapping of
//! the contiguous byte stream onto files, block writes, piece reads and SHA-1
//! verification.
//!
//! Blocks are shared as `Arc<Block>` work items between the scheduler and the
//! peer sessions; their mutable state (downloaded flag, request stamp) is
//! fine-grained so no table-wide lock is held across file I/O. Each file
//! handle carries its own async lock because seek-then-read/write on a handle
//! is not atomic.
use super::metainfo::Metainfo;
use super::{TorrentError, TorrentResult};
use sha1::{Digest, Sha1};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Transfer unit: every block is 16 KiB except possibly the last of a piece.
pub const BLOCK_SIZE: u32 = 1 << 14;

/// How long an outstanding block request stays reserved before the scheduler
/// may hand the block to another peer.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// A 16 KiB subrange of a piece, the unit of network transfer.
#[derive(Debug)]
pub struct Block {
    pub piece_id: u32,
    pub block_id: u32,
    /// Offset within the piece.
    pub begin: u32,
    /// Offset in the torrent's contiguous byte stream.
    pub absolute_begin: u64,
    pub length: u32,
    downloaded: AtomicBool,
    last_requested: Mutex<Option<Instant>>,
}

impl Block {
    pub fn is_downloaded(&self) -> bool {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Flips the downloaded flag, returning the previous value.
    pub fn set_downloaded(&self, downloaded: bool) -> bool {
        self.downloaded.swap(downloaded, Ordering::SeqCst)
    }

    /// Stamps the block as requested now. Called by a peer session right
    /// before it sends the Request message.
    pub fn mark_requested(&self) {
        *self.last_requested.lock().unwrap() = Some(Instant::now());
    }

    /// True when the block was never requested, or its last request is older
    /// than [`REQUEST_TIMEOUT`].
    pub fn request_timed_out(&self) -> bool {
        match *self.last_requested.lock().unwrap() {
            None => true,
            Some(at) => at.elapsed() > REQUEST_TIMEOUT,
        }
    }
}

/// A fixed-length chunk of the payload, the unit of verification.
#[derive(Debug)]
pub struct Piece {
    pub piece_id: usize,
    /// Offset in the torrent's contiguous byte stream.
    pub begin: u64,
    pub length: u64,
    pub sha1_hash: [u8; 20],
    bytes_downloaded: AtomicU64,
    confirmed: AtomicBool,
    pub blocks: Vec<Arc<Block>>,
}

impl Piece {
    pub fn end(&self) -> u64 {
        self.begin + self.length
    }

    /// A piece is downloaded exactly when all of its blocks are.
    pub fn is_downloaded(&self) -> bool {
        self.blocks.iter().all(|block| block.is_downloaded())
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    pub fn set_confirmed(&self, confirmed: bool) {
        self.confirmed.store(confirmed, Ordering::SeqCst);
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::SeqCst)
    }

    pub fn add_downloaded_bytes(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Clears every block's downloaded flag and rolls the byte counter back.
    /// Used when a completed piece fails verification and must be refetched.
    pub fn clear_blocks(&self) {
        for block in &self.blocks {
            if block.set_downloaded(false) {
                self.bytes_downloaded
                    .fetch_sub(block.length as u64, Ordering::SeqCst);
            }
        }
    }

    /// Checks `data` against the expected digest for this piece.
    pub fn verify(&self, data: &[u8]) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest: [u8; 20] = hasher.finalize().into();
        digest == self.sha1_hash
    }

    pub fn find_block(&self, begin: u32) -> Option<Arc<Block>> {
        self.blocks
            .iter()
            .find(|block| block.begin == begin)
            .cloned()
    }
}

/// One file of the torrent, mapped into the contiguous byte stream at
/// `begin`. The handle lock serializes seek+read/write pairs; distinct files
/// can be touched concurrently.
#[derive(Debug)]
pub struct TorrentFile {
    /// Path relative to the output root.
    pub name: PathBuf,
    pub length: u64,
    /// Start position in the contiguous byte stream.
    pub begin: u64,
    downloaded: AtomicBool,
    handle: tokio::sync::Mutex<File>,
}

impl TorrentFile {
    pub fn end(&self) -> u64 {
        self.begin + self.length
    }

    pub fn is_downloaded(&self) -> bool {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Reads up to `length` bytes at `begin` (offsets within this file). The
    /// result is shorter when the file does not reach that far yet, which is
    /// the normal case while probing pre-existing data.
    async fn read_section(&self, begin: u64, length: u64) -> std::io::Result<Vec<u8>> {
        let mut handle = self.handle.lock().await;
        // just-written data must be visible to this read
        handle.flush().await?;
        handle.seek(SeekFrom::Start(begin)).await?;
        let mut data = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = handle.read(&mut data[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        Ok(data)
    }

    async fn write_section(&self, begin: u64, data: &[u8]) -> std::io::Result<()> {
        let mut handle = self.handle.lock().await;
        handle.seek(SeekFrom::Start(begin)).await?;
        handle.write_all(data).await?;
        handle.flush().await?;
        Ok(())
    }
}

/// Intersection of two half-open byte intervals `[a, b)` and `[c, d)`,
/// projected three ways.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Intersection {
    /// In stream coordinates.
    pub absolute: (u64, u64),
    /// Relative to `a` (e.g. an offset into a block's payload).
    pub from_a: (u64, u64),
    /// Relative to `c` (e.g. an offset into a file).
    pub from_c: (u64, u64),
}

impl Intersection {
    pub fn len(&self) -> u64 {
        self.absolute.1 - self.absolute.0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Computes the intersection of `[a, b)` and `[c, d)`, or `None` when they
/// do not overlap. The one mapping primitive behind block writes, piece reads
/// and per-file accounting.
pub fn intersect(a: u64, b: u64, c: u64, d: u64) -> Option<Intersection> {
    if a < d && c < b {
        let start = a.max(c);
        let end = b.min(d);
        Some(Intersection {
            absolute: (start, end),
            from_a: (start - a, end - a),
            from_c: (start - c, end - c),
        })
    } else {
        None
    }
}

/// The data store: owns the piece table and the opened files.
#[derive(Debug)]
pub struct TorrentStore {
    pub name: String,
    pub total_length: u64,
    pub piece_length: u64,
    pieces: Vec<Piece>,
    files: Vec<TorrentFile>,
}

impl TorrentStore {
    /// Materializes the piece/block layout from the descriptor and opens
    /// every file under `output_root` for read/write, creating files and
    /// parent directories as needed. Existing content is left untouched so a
    /// later [`TorrentStore::check_existing_data`] can resume from it.
    pub async fn new(metainfo: &Metainfo, output_root: &Path) -> TorrentResult<TorrentStore> {
        let piece_length = metainfo.info.piece_length;

        let mut pieces = Vec::with_capacity(metainfo.num_pieces());
        for (piece_id, sha1_hash) in metainfo.piece_hashes.iter().enumerate() {
            let begin = piece_id as u64 * piece_length;
            let length = metainfo.piece_size(piece_id);
            let blocks = (0..length)
                .step_by(BLOCK_SIZE as usize)
                .enumerate()
                .map(|(block_id, block_begin)| {
                    Arc::new(Block {
                        piece_id: piece_id as u32,
                        block_id: block_id as u32,
                        begin: block_begin as u32,
                        absolute_begin: begin + block_begin,
                        length: (BLOCK_SIZE as u64).min(length - block_begin) as u32,
                        downloaded: AtomicBool::new(false),
                        last_requested: Mutex::new(None),
                    })
                })
                .collect();
            pieces.push(Piece {
                piece_id,
                begin,
                length,
                sha1_hash: *sha1_hash,
                bytes_downloaded: AtomicU64::new(0),
                confirmed: AtomicBool::new(false),
                blocks,
            });
        }

        let mut files = Vec::new();
        let mut file_begin = 0u64;
        for spec in metainfo.info.file_specs() {
            let path = output_root.join(&spec.path);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .await?;
            files.push(TorrentFile {
                name: spec.path,
                length: spec.length,
                begin: file_begin,
                downloaded: AtomicBool::new(false),
                handle: tokio::sync::Mutex::new(handle),
            });
            file_begin += spec.length;
        }

        debug!(
            name = %metainfo.info.name,
            pieces = pieces.len(),
            files = files.len(),
            total = metainfo.total_length(),
            "initialised data store"
        );

        Ok(TorrentStore {
            name: metainfo.info.name.clone(),
            total_length: metainfo.total_length(),
            piece_length,
            pieces,
            files,
        })
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, piece_id: usize) -> TorrentResult<&Piece> {
        self.pieces
            .get(piece_id)
            .ok_or(TorrentError::PieceOutOfRange(piece_id))
    }

    /// Locates the block at `begin` within piece `piece_id`, as reported by a
    /// Piece message.
    pub fn find_block(&self, piece_id: u32, begin: u32) -> Option<Arc<Block>> {
        self.pieces
            .get(piece_id as usize)
            .and_then(|piece| piece.find_block(begin))
    }

    /// The files overlapping `[begin, begin + length)` of the stream, each
    /// with the in-file offset and length of the overlap, in stream order.
    fn mapped_files(&self, begin: u64, length: u64) -> Vec<(&TorrentFile, u64, u64)> {
        self.files
            .iter()
            .filter_map(|file| {
                intersect(begin, begin + length, file.begin, file.end()).map(|overlap| {
                    (file, overlap.from_c.0, overlap.len())
                })
            })
            .collect()
    }

    /// Writes a block's payload into every file it intersects. Writes to one
    /// file are serialized by that file's lock; distinct files may be written
    /// concurrently by other tasks.
    pub async fn write_block(&self, block: &Block, data: &[u8]) -> TorrentResult<()> {
        if data.len() != block.length as usize {
            return Err(TorrentError::BlockSizeMismatch {
                piece: block.piece_id,
                begin: block.begin,
                expected: block.length,
                actual: data.len(),
            });
        }
        let mut data_begin = 0usize;
        for (file, file_offset, length) in
            self.mapped_files(block.absolute_begin, block.length as u64)
        {
            file.write_section(file_offset, &data[data_begin..data_begin + length as usize])
                .await?;
            data_begin += length as usize;
        }
        Ok(())
    }

    /// Reads the current bytes of a piece out of its mapped files, in file
    /// order. May return less than the piece length when files are still
    /// short.
    pub async fn read_piece(&self, piece_id: usize) -> TorrentResult<Vec<u8>> {
        let piece = self.piece(piece_id)?;
        let mut data = Vec::with_capacity(piece.length as usize);
        for (file, file_offset, length) in self.mapped_files(piece.begin, piece.length) {
            data.extend_from_slice(&file.read_section(file_offset, length).await?);
        }
        Ok(data)
    }

    /// Hashes the piece's current on-disk bytes and compares against the
    /// expected digest.
    pub async fn verify_piece(&self, piece_id: usize) -> TorrentResult<bool> {
        let data = self.read_piece(piece_id).await?;
        Ok(self.piece(piece_id)?.verify(&data))
    }

    /// Verifies whatever is already on disk and reconciles the piece table
    /// with it: confirmed pieces get all their blocks marked downloaded,
    /// pieces that were marked downloaded but no longer verify are cleared
    /// for refetch. Returns true iff every piece is already confirmed.
    pub async fn check_existing_data(&self) -> TorrentResult<bool> {
        let mut all_confirmed = true;
        for piece in &self.pieces {
            let was_downloaded = piece.is_downloaded();
            let confirmed = self.verify_piece(piece.piece_id).await?;
            piece.set_confirmed(confirmed);
            if !confirmed {
                all_confirmed = false;
            }
            if was_downloaded && !confirmed {
                // marked as downloaded but invalid, refetch
                piece.clear_blocks();
            } else if !was_downloaded && confirmed {
                for block in &piece.blocks {
                    if !block.set_downloaded(true) {
                        piece.add_downloaded_bytes(block.length as u64);
                    }
                }
            }
        }
        for file in &self.files {
            let complete = self
                .pieces
                .iter()
                .filter(|piece| {
                    intersect(piece.begin, piece.end(), file.begin, file.end()).is_some()
                })
                .all(|piece| piece.is_confirmed());
            file.downloaded.store(complete, Ordering::SeqCst);
        }
        if all_confirmed {
            info!(name = %self.name, "existing data passes verification");
        }
        Ok(all_confirmed)
    }

    /// Bytes belonging to confirmed pieces only; what gets reported to
    /// trackers as `downloaded`.
    pub fn confirmed_bytes(&self) -> u64 {
        self.pieces
            .iter()
            .filter(|piece| piece.is_confirmed())
            .map(|piece| piece.length)
            .sum()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.pieces.iter().map(|piece| piece.bytes_downloaded()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|piece| piece.is_confirmed())
    }

    /// Flushes every file to stable storage. Handles close when the store is
    /// dropped.
    pub async fn close(&self) {
        for file in &self.files {
            let handle = file.handle.lock().await;
            if let Err(e) = handle.sync_all().await {
                warn!(file = %file.name.display(), error = %e, "failed to sync file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::tests::multi_file_fixture;
    use crate::torrent::metainfo::Metainfo;
    use tempfile::TempDir;

    async fn fixture_store() -> (TempDir, TorrentStore, Vec<u8>) {
        let (value, contents) = multi_file_fixture();
        let metainfo = Metainfo::parse(value).unwrap();
        let dir = TempDir::new().unwrap();
        let store = TorrentStore::new(&metainfo, dir.path()).await.unwrap();
        (dir, store, contents)
    }

    fn block_payload(contents: &[u8], block: &Block) -> Vec<u8> {
        let begin = block.absolute_begin as usize;
        contents[begin..begin + block.length as usize].to_vec()
    }

    /// Writes the real content of every file straight to disk, bypassing the
    /// store, as a crashed-and-restarted download would leave it.
    fn seed_files(dir: &Path, contents: &[u8]) {
        let root = dir.join("some_files");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.bin"), &contents[..10000]).unwrap();
        std::fs::write(root.join("b.bin"), &contents[10000..30000]).unwrap();
        std::fs::write(root.join("c.bin"), &contents[30000..]).unwrap();
    }

    #[test]
    fn intersect_projects_three_ways() {
        let overlap = intersect(10, 30, 20, 50).unwrap();
        assert_eq!(overlap.absolute, (20, 30));
        assert_eq!(overlap.from_a, (10, 20));
        assert_eq!(overlap.from_c, (0, 10));
        assert_eq!(overlap.len(), 10);

        // touching intervals do not intersect
        assert_eq!(intersect(0, 10, 10, 20), None);
        assert_eq!(intersect(10, 20, 0, 10), None);
        // containment
        let inner = intersect(5, 8, 0, 100).unwrap();
        assert_eq!(inner.absolute, (5, 8));
        assert_eq!(inner.from_c, (5, 8));
    }

    #[tokio::test]
    async fn blocks_tile_every_piece_exactly() {
        let (_dir, store, _) = fixture_store().await;
        assert_eq!(
            store.pieces().iter().map(|p| p.length).sum::<u64>(),
            store.total_length
        );
        for piece in store.pieces() {
            let mut expected_begin = 0u32;
            for block in &piece.blocks {
                assert_eq!(block.begin, expected_begin);
                assert_eq!(block.absolute_begin, piece.begin + block.begin as u64);
                expected_begin += block.length;
            }
            assert_eq!(expected_begin as u64, piece.length);
        }
        // interior blocks are full sized
        for piece in store.pieces() {
            for block in &piece.blocks[..piece.blocks.len() - 1] {
                assert_eq!(block.length, BLOCK_SIZE);
            }
        }
    }

    #[tokio::test]
    async fn write_blocks_in_any_order_then_read_back() {
        let (_dir, store, contents) = fixture_store().await;
        // write back to front so pieces spanning file boundaries get
        // assembled out of order
        for piece in store.pieces().iter().rev() {
            for block in piece.blocks.iter().rev() {
                store
                    .write_block(block, &block_payload(&contents, block))
                    .await
                    .unwrap();
            }
        }
        for piece in store.pieces() {
            let data = store.read_piece(piece.piece_id).await.unwrap();
            let begin = piece.begin as usize;
            assert_eq!(data, &contents[begin..begin + piece.length as usize]);
            assert!(store.verify_piece(piece.piece_id).await.unwrap());
        }
    }

    #[tokio::test]
    async fn write_block_is_idempotent() {
        let (_dir, store, contents) = fixture_store().await;
        let block = store.find_block(1, 0).unwrap();
        let payload = block_payload(&contents, &block);
        store.write_block(&block, &payload).await.unwrap();
        store.write_block(&block, &payload).await.unwrap();
        let piece = store.piece(1).unwrap();
        let data = store.read_piece(1).await.unwrap();
        assert_eq!(
            &data[..block.length as usize],
            &contents[piece.begin as usize..piece.begin as usize + block.length as usize]
        );
    }

    #[tokio::test]
    async fn rejects_wrong_sized_payload() {
        let (_dir, store, _) = fixture_store().await;
        let block = store.find_block(0, 0).unwrap();
        let short = vec![0u8; block.length as usize - 1];
        assert!(matches!(
            store.write_block(&block, &short).await,
            Err(TorrentError::BlockSizeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn resume_confirms_complete_data_without_network() {
        let (value, contents) = multi_file_fixture();
        let metainfo = Metainfo::parse(value).unwrap();
        let dir = TempDir::new().unwrap();
        seed_files(dir.path(), &contents);

        let store = TorrentStore::new(&metainfo, dir.path()).await.unwrap();
        assert!(store.check_existing_data().await.unwrap());
        assert!(store.is_complete());
        assert_eq!(store.confirmed_bytes(), store.total_length);
        assert_eq!(store.downloaded_bytes(), store.total_length);
        for file in store.files() {
            assert!(file.is_downloaded());
        }
    }

    #[tokio::test]
    async fn corrupt_piece_is_cleared_and_recoverable() {
        let (value, contents) = multi_file_fixture();
        let metainfo = Metainfo::parse(value).unwrap();
        let dir = TempDir::new().unwrap();
        seed_files(dir.path(), &contents);

        // flip one byte inside the last piece (which lives entirely in c.bin)
        let c_path = dir.path().join("some_files").join("c.bin");
        let mut c_data = std::fs::read(&c_path).unwrap();
        c_data[3000] ^= 0xff;
        std::fs::write(&c_path, &c_data).unwrap();

        let store = TorrentStore::new(&metainfo, dir.path()).await.unwrap();
        assert!(!store.check_existing_data().await.unwrap());
        assert!(store.piece(0).unwrap().is_confirmed());
        let piece = store.piece(1).unwrap();
        assert!(!piece.is_confirmed());
        assert!(piece.blocks.iter().all(|block| !block.is_downloaded()));

        // simulated re-download of the correct bytes
        for block in &piece.blocks {
            store
                .write_block(block, &block_payload(&contents, block))
                .await
                .unwrap();
            block.set_downloaded(true);
        }
        assert!(store.verify_piece(1).await.unwrap());
        piece.set_confirmed(true);
        assert!(store.is_complete());
    }

    #[tokio::test]
    async fn request_timeout_governs_reassignment() {
        let (_dir, store, _) = fixture_store().await;
        let block = store.find_block(0, 0).unwrap();
        assert!(block.request_timed_out());
        block.mark_requested();
        assert!(!block.request_timed_out());
    }
}
