//! Library root for bitleech, an async BitTorrent leecher.
//!
//! Re-exports the core modules: bencode codec, torrent metadata and data
//! store, peer sessions, tracker clients and the download client itself.
pub mod bencode;
pub mod client;
pub mod peer;
pub mod torrent;
pub mod tracker;
