//! bundle-core: types shared by every party in bundle transmission.
//!
//! Nothing in this crate performs I/O on the network. Identity files and
//! recovered JSON state are the only filesystem contact.

pub mod bundle;
pub mod config;
pub mod crypto;
pub mod payload;
pub mod recency;
pub mod recovery;
pub mod session;
pub mod wire;
