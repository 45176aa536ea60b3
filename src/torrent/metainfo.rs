//! Typed metainfo descriptor parsed from a .torrent file.
//!
//! The descriptor is immutable after load and shared by every component.
//! The info-hash is the SHA-1 of the bencoded `info` sub-value exactly as it
//! appeared on disk; the codec preserves dictionary order, so re-encoding the
//! decoded value reproduces those bytes.
use crate::bencode::{decoder, encoder, BencodeValue};

use super::{TorrentError, TorrentResult};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, PartialEq, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
    pub info: Info,
    pub info_hash: [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Info {
    /// File name (single-file) or directory name (multi-file).
    pub name: String,
    pub piece_length: u64,
    /// Concatenated 20-byte SHA-1 digests, one per piece.
    pub pieces: Vec<u8>,
    pub private: bool,
    pub layout: FileLayout,
}

/// The two possible `info` shapes: a lone file, or an ordered list of files
/// mapped onto one contiguous byte stream.
#[derive(Debug, PartialEq, Clone)]
pub enum FileLayout {
    Single {
        length: u64,
        md5sum: Option<String>,
    },
    Multi {
        files: Vec<FileEntry>,
    },
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub length: u64,
    /// Path components below the torrent's directory, in descriptor order.
    pub path: Vec<String>,
}

impl FileEntry {
    /// Joins the path components with the platform separator.
    pub fn relative_path(&self) -> PathBuf {
        self.path.iter().collect()
    }
}

/// A file's position in the torrent's contiguous byte stream, relative to the
/// output root. Consumed by the data store when opening files.
#[derive(Debug, PartialEq, Clone)]
pub struct FileSpec {
    pub path: PathBuf,
    pub length: u64,
}

impl Metainfo {
    /// Reads and parses a .torrent file.
    #[tracing::instrument(level = "debug")]
    pub fn load(path: &Path) -> TorrentResult<Metainfo> {
        let data = std::fs::read(path)?;
        Self::parse(decoder::decode_bytes(&data)?)
    }

    /// Parses a decoded metainfo value into the typed descriptor.
    pub fn parse(data: BencodeValue) -> TorrentResult<Metainfo> {
        if !matches!(data, BencodeValue::Dict(_)) {
            return Err(TorrentError::InvalidFormat(
                "root is not a dictionary".to_string(),
            ));
        }

        let announce = data
            .get(b"announce")
            .and_then(BencodeValue::as_str)
            .ok_or_else(|| TorrentError::MissingField("announce".to_string()))?
            .to_string();

        let info_value = data
            .get(b"info")
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;

        let info_hash = hash_info(info_value)?;
        let info = parse_info(info_value)?;
        let piece_hashes = parse_pieces(&info.pieces)?;

        let expected_pieces = total_pieces(info.total_length(), info.piece_length);
        if piece_hashes.len() != expected_pieces {
            return Err(TorrentError::InvalidPiecesLength {
                expected: expected_pieces,
                actual: piece_hashes.len(),
            });
        }

        let announce_list = match data.get(b"announce-list") {
            Some(value) => parse_announce_list(value)?,
            None => Vec::new(),
        };

        let creation_date = match data.get(b"creation date").and_then(BencodeValue::as_int) {
            Some(timestamp) => {
                let secs = u64::try_from(timestamp)
                    .map_err(|_| TorrentError::InvalidFormat("negative creation date".into()))?;
                Some(UNIX_EPOCH + std::time::Duration::from_secs(secs))
            }
            None => None,
        };

        let text_field = |key: &[u8]| {
            data.get(key)
                .and_then(BencodeValue::as_str)
                .map(str::to_string)
        };

        Ok(Metainfo {
            announce,
            announce_list,
            creation_date,
            comment: text_field(b"comment"),
            created_by: text_field(b"created by"),
            encoding: text_field(b"encoding"),
            info,
            info_hash,
            piece_hashes,
        })
    }

    /// All announce URLs: the flattened `announce-list` tiers when present,
    /// otherwise just `announce`.
    pub fn announce_urls(&self) -> Vec<String> {
        if self.announce_list.is_empty() {
            vec![self.announce.clone()]
        } else {
            self.announce_list.iter().flatten().cloned().collect()
        }
    }

    pub fn total_length(&self) -> u64 {
        self.info.total_length()
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of piece `index`: `piece_length` for all but the last piece,
    /// which takes whatever remains of the total. When the total is an exact
    /// multiple of `piece_length` the last piece is a full one.
    pub fn piece_size(&self, index: usize) -> u64 {
        let n = self.num_pieces();
        if index + 1 < n {
            self.info.piece_length
        } else {
            self.total_length() - (n as u64 - 1) * self.info.piece_length
        }
    }
}

impl Info {
    pub fn total_length(&self) -> u64 {
        match &self.layout {
            FileLayout::Single { length, .. } => *length,
            FileLayout::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    /// The on-disk files in stream order, rooted at the output directory:
    /// `<name>` alone for a single file, `<name>/<entry path>` per entry for
    /// a multi-file torrent.
    pub fn file_specs(&self) -> Vec<FileSpec> {
        match &self.layout {
            FileLayout::Single { length, .. } => vec![FileSpec {
                path: PathBuf::from(&self.name),
                length: *length,
            }],
            FileLayout::Multi { files } => files
                .iter()
                .map(|entry| FileSpec {
                    path: Path::new(&self.name).join(entry.relative_path()),
                    length: entry.length,
                })
                .collect(),
        }
    }
}

fn total_pieces(total_length: u64, piece_length: u64) -> usize {
    (total_length.div_ceil(piece_length)) as usize
}

fn hash_info(info_value: &BencodeValue) -> TorrentResult<[u8; 20]> {
    let encoded = encoder::encode_to_bytes(info_value)?;
    let mut hasher = Sha1::new();
    hasher.update(&encoded);
    Ok(hasher.finalize().into())
}

/// Splits the concatenated `pieces` string into 20-byte digest arrays, one
/// per piece index.
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidFormat(
            "pieces length is not a multiple of 20".to_string(),
        ));
    }
    Ok(pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn parse_announce_list(value: &BencodeValue) -> TorrentResult<Vec<Vec<String>>> {
    let tiers = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("announce-list not a list".to_string()))?;
    tiers
        .iter()
        .map(|tier| {
            let trackers = tier.as_list().ok_or_else(|| {
                TorrentError::InvalidFormat("announce tier not a list".to_string())
            })?;
            trackers
                .iter()
                .map(|tracker| {
                    tracker
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| {
                            TorrentError::InvalidFormat("tracker URL not a string".to_string())
                        })
                })
                .collect()
        })
        .collect()
}

fn parse_info(value: &BencodeValue) -> TorrentResult<Info> {
    if !matches!(value, BencodeValue::Dict(_)) {
        return Err(TorrentError::InvalidFormat(
            "info is not a dictionary".to_string(),
        ));
    }

    let piece_length = value
        .get(b"piece length")
        .and_then(BencodeValue::as_int)
        .filter(|len| *len > 0)
        .ok_or_else(|| TorrentError::MissingField("piece length".to_string()))?
        as u64;

    let pieces = value
        .get(b"pieces")
        .and_then(BencodeValue::as_bytes)
        .ok_or_else(|| TorrentError::MissingField("pieces".to_string()))?
        .to_vec();

    let name = value
        .get(b"name")
        .and_then(BencodeValue::as_str)
        .ok_or_else(|| TorrentError::MissingField("name".to_string()))?
        .to_string();

    let private = matches!(value.get(b"private"), Some(BencodeValue::Integer(1)));

    // `files` present means multi-file; otherwise `length` is required.
    let layout = match value.get(b"files") {
        Some(files_value) => FileLayout::Multi {
            files: parse_files(files_value)?,
        },
        None => {
            let length = value
                .get(b"length")
                .and_then(BencodeValue::as_int)
                .filter(|len| *len >= 0)
                .ok_or_else(|| TorrentError::MissingField("length".to_string()))?
                as u64;
            let md5sum = value
                .get(b"md5sum")
                .and_then(BencodeValue::as_str)
                .map(str::to_string);
            FileLayout::Single { length, md5sum }
        }
    };

    Ok(Info {
        name,
        piece_length,
        pieces,
        private,
        layout,
    })
}

fn parse_files(value: &BencodeValue) -> TorrentResult<Vec<FileEntry>> {
    let entries = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("files not a list".to_string()))?;
    entries
        .iter()
        .map(|entry| {
            let length = entry
                .get(b"length")
                .and_then(BencodeValue::as_int)
                .filter(|len| *len >= 0)
                .ok_or_else(|| TorrentError::MissingField("file length".to_string()))?
                as u64;
            let path_value = entry
                .get(b"path")
                .and_then(BencodeValue::as_list)
                .ok_or_else(|| TorrentError::MissingField("file path".to_string()))?;
            let path = path_value
                .iter()
                .map(|component| {
                    component.as_str().map(str::to_string).ok_or_else(|| {
                        TorrentError::InvalidFormat(
                            "file path component not a string".to_string(),
                        )
                    })
                })
                .collect::<TorrentResult<Vec<String>>>()?;
            if path.is_empty() {
                return Err(TorrentError::InvalidFormat(
                    "file path is empty".to_string(),
                ));
            }
            Ok(FileEntry { length, path })
        })
        .collect()
}
