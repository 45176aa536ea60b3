//! Torrent metadata and data-store logic.
//!
//! [`metainfo`] turns a bencoded .torrent file into a typed descriptor;
//! [`store`] owns the piece/block layout and the files on disk.
use thiserror::Error;
pub mod metainfo;
pub mod store;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("pieces length {actual} does not cover {expected} pieces")]
    InvalidPiecesLength { expected: usize, actual: usize },

    #[error("no block at piece {piece} offset {begin}")]
    UnknownBlock { piece: u32, begin: u32 },

    #[error("block [{piece}, {begin}] payload is {actual} bytes, expected {expected}")]
    BlockSizeMismatch {
        piece: u32,
        begin: u32,
        expected: u32,
        actual: usize,
    },

    #[error("piece {0} out of range")]
    PieceOutOfRange(usize),
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
