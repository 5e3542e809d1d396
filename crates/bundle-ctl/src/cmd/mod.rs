//! CLI command modules.

pub mod client;
pub mod http;
pub mod status;
pub mod transport;
