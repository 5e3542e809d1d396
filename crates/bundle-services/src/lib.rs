//! bundle-services — stateful pieces of delay-tolerant bundle transmission.
//! Storage, windows, sessions, the transmission engine, the three node
//! roles, and the exchange protocol that moves bundles between them.

pub mod adu_store;
pub mod client;
pub mod consumer;
pub mod engine;
pub mod exchange;
pub mod ledger;
pub mod locks;
pub mod peers;
pub mod persist;
pub mod routing;
pub mod security;
pub mod sender;
pub mod server;
pub mod transport;
pub mod violations;
pub mod window;

pub use adu_store::{AduDirection, AduError, AduMetadata, AduStore, StoredAdu};
pub use client::{ClientNode, SyncReport};
pub use consumer::{AduConsumer, ChannelConsumer, ConsumerEvent, NullConsumer};
pub use engine::{
    BundleFault, EngineSettings, OutboundBundle, PeerStatus, Receipt, ReceiveOutcome, TransmissionEngine,
};
pub use exchange::{ExchangeClient, ExchangeHandler, ExchangeListener, UploadOptions};
pub use peers::{PeerDirectory, PeerRecord};
pub use security::BundleSecurity;
pub use server::ServerNode;
pub use transport::{RelayReport, TransportNode};
pub use violations::{Violation, ViolationKind, ViolationLog};
pub use window::{Classification, SlidingWindow};
