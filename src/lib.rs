//! Remote media-center client engine.
//!
//! Keeps a local mirror of a host's media catalog, reconciles it against
//! the host after reconnects, follows the host's live notifications and
//! drives the connection state machine from discovery and device
//! lifecycle signals.
//!
//! The entry point is [`ConnectionManager::spawn`], which returns an
//! [`EngineHandle`].

pub mod api;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod host;
pub mod mirror;
pub mod notifications;
pub mod persistence;
pub mod state;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use api::{Connector, JsonRpcConnector, RemoteApi, Session};
pub use catalog::{CatalogItem, CatalogKind, MediaDomain};
pub use config::Config;
pub use connection::{ConnectionManager, EngineHandle};
pub use discovery::{Candidate, Discovery, DiscoveryEvent, MdnsDiscovery};
pub use error::RemoteError;
pub use events::EngineEvent;
pub use host::{HostDescriptor, LibraryScope};
pub use notifications::PlayerStatus;
pub use state::ConnectionState;
pub use store::{KeyValueStore, MemoryStore, RedbStore};
pub use sync::Library;
