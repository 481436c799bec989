//! The host boundary.
//!
//! - [`RemoteApi`]: one request/response call, plus a fire-and-forget variant
//! - [`Connector`]: opens a [`Session`] (API handle + notification stream)
//! - [`JsonRpcConnector`]: JSON-RPC over HTTP with a websocket for pushes
//!
//! Everything above this module only sees these traits.

pub mod fetch;
pub mod jsonrpc;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;

use crate::error::RemoteError;
use crate::host::HostDescriptor;

pub use jsonrpc::JsonRpcConnector;

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Issue one request and wait for its `result`.
    async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError>;

    /// Issue a request without waiting for a reconciled response.
    async fn notify(&self, method: &str, params: Value) -> Result<(), RemoteError>;
}

/// Raw push messages from the host. The stream ends when the host closes
/// the connection.
pub type NotificationStream = BoxStream<'static, Result<String, RemoteError>>;

/// An open connection to one host.
pub struct Session {
    /// Identifier used to recognise our own notifications. The host only
    /// puts it in `sender` for messages we broadcast ourselves with
    /// `JSONRPC.NotifyAll { sender: id, .. }`; library and player changes we
    /// cause through ordinary calls come back with the host's own sender and
    /// are applied like anyone else's.
    pub id: String,
    pub api: Arc<dyn RemoteApi>,
    pub notifications: NotificationStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, host: &HostDescriptor) -> Result<Session, RemoteError>;
}
