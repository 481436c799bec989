//! In-process host doubles for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};

use crate::api::{Connector, RemoteApi, Session};
use crate::catalog::CatalogKind;
use crate::config::SyncConfig;
use crate::error::RemoteError;
use crate::events::EngineEvent;
use crate::host::{HostDescriptor, LibraryScope};
use crate::state::{ConnectionState, StateHolder};
use crate::store::{HostCache, MemoryStore};
use crate::sync::{Library, LibrarySynchronizer};

/// Scripted host. Serves list, details and property calls from an in-memory
/// catalog; individual methods can be overridden with a canned reply.
#[derive(Default)]
pub struct MockApi {
    records: Mutex<BTreeMap<CatalogKind, Vec<Value>>>,
    properties: Mutex<Map<String, Value>>,
    overrides: Mutex<HashMap<String, Result<Value, RemoteError>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: &str, result: Value) {
        self.overrides.lock().unwrap().insert(method.to_string(), Ok(result));
    }

    pub fn fail(&self, method: &str, error: RemoteError) {
        self.overrides.lock().unwrap().insert(method.to_string(), Err(error));
    }

    pub fn clear_override(&self, method: &str) {
        self.overrides.lock().unwrap().remove(method);
    }

    pub fn set_records(&self, kind: CatalogKind, records: Vec<Value>) {
        self.records.lock().unwrap().insert(kind, records);
    }

    pub fn upsert_record(&self, kind: CatalogKind, record: Value) {
        let mut records = self.records.lock().unwrap();
        let list = records.entry(kind).or_default();
        let id = record[kind.id_field()].clone();
        match list.iter_mut().find(|r| r[kind.id_field()] == id) {
            Some(existing) => *existing = record,
            None => list.push(record),
        }
    }

    pub fn remove_record(&self, kind: CatalogKind, id: u64) {
        if let Some(list) = self.records.lock().unwrap().get_mut(&kind) {
            list.retain(|r| r[kind.id_field()] != json!(id));
        }
    }

    pub fn set_property(&self, key: &str, value: &str) {
        self.properties.lock().unwrap().insert(key.to_string(), json!(value));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(m, _)| m == method).count()
    }

    /// Ids requested through the details call of `kind`.
    pub fn detail_requests(&self, kind: CatalogKind) -> Vec<u64> {
        let Some((method, _)) = kind.details_method() else {
            return Vec::new();
        };
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .filter_map(|(_, params)| params[kind.id_field()].as_u64())
            .collect()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn answer(&self, method: &str, params: &Value) -> Result<Value, RemoteError> {
        if let Some(reply) = self.overrides.lock().unwrap().get(method) {
            return reply.clone();
        }

        let records = self.records.lock().unwrap();
        for kind in CatalogKind::ALL {
            if method == kind.list_method() {
                let list = records.get(&kind).cloned().unwrap_or_default();
                return Ok(json!({ kind.list_key(): list, "limits": { "total": list.len() } }));
            }
            if let Some((details, key)) = kind.details_method() {
                if method == details {
                    let id = &params[kind.id_field()];
                    return records
                        .get(&kind)
                        .and_then(|list| list.iter().find(|r| &r[kind.id_field()] == id))
                        .map(|record| json!({ key: record }))
                        .ok_or(RemoteError::Rpc { code: -32602, message: "Invalid params.".into() });
                }
            }
        }

        match method {
            "JSONRPC.Ping" => Ok(json!("pong")),
            "AudioLibrary.GetProperties" => Ok(Value::Object(self.properties.lock().unwrap().clone())),
            "Files.GetDirectory" => Ok(json!({ "files": [] })),
            "Player.GetActivePlayers" => Ok(json!([])),
            "Playlist.GetItems" => Ok(json!({ "items": [] })),
            _ => Err(RemoteError::Rpc { code: -32601, message: "Method not found.".into() }),
        }
    }
}

#[async_trait]
impl RemoteApi for MockApi {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        let reply = self.answer(method, &params);
        self.calls.lock().unwrap().push((method.to_string(), params));
        reply
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push((method.to_string(), params));
        Ok(())
    }
}

/// Hands out sessions backed by one shared [`MockApi`]. Notifications are
/// pushed into the most recently opened session.
pub struct MockConnector {
    pub api: Arc<MockApi>,
    pub session_id: String,
    pushes: Mutex<Option<mpsc::UnboundedSender<Result<String, RemoteError>>>>,
    refuse: Mutex<Option<RemoteError>>,
    opens: AtomicUsize,
}

impl MockConnector {
    pub fn new(api: Arc<MockApi>) -> Self {
        Self {
            api,
            session_id: "drift-host-test-00000001".to_string(),
            pushes: Mutex::new(None),
            refuse: Mutex::new(None),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn refuse_with(&self, error: Option<RemoteError>) {
        *self.refuse.lock().unwrap() = error;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn push(&self, message: Value) {
        self.push_raw(Ok(message.to_string()));
    }

    pub fn push_raw(&self, message: Result<String, RemoteError>) {
        if let Some(tx) = self.pushes.lock().unwrap().as_ref() {
            let _ = tx.send(message);
        }
    }

    /// End the notification stream as if the host went away.
    pub fn hang_up(&self) {
        self.pushes.lock().unwrap().take();
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _host: &HostDescriptor) -> Result<Session, RemoteError> {
        if let Some(error) = self.refuse.lock().unwrap().clone() {
            return Err(error);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.pushes.lock().unwrap() = Some(tx);
        let notifications = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        })
        .boxed();

        Ok(Session {
            id: self.session_id.clone(),
            api: self.api.clone(),
            notifications,
        })
    }
}

/// A minimal host record of `kind` with a file derived from the id.
pub fn record(kind: CatalogKind, id: u64) -> Value {
    let mut value = json!({
        kind.id_field(): id,
        "label": format!("{} {}", kind, id),
    });
    match kind {
        CatalogKind::MovieSet => value["title"] = json!(format!("Set {}", id)),
        CatalogKind::Artist | CatalogKind::Album | CatalogKind::Genre => {}
        _ => value["file"] = json!(format!("/{}/{}.mkv", kind, id)),
    }
    value
}

pub fn episode(id: u64, show: u64) -> Value {
    let mut value = record(CatalogKind::Episode, id);
    value["tvshowid"] = json!(show);
    value
}

pub fn host() -> HostDescriptor {
    HostDescriptor::new("Living Room", "192.168.1.20", 8080, 9090)
}

/// A host notification as it arrives on the socket.
pub fn notification(method: &str, sender: &str, data: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": { "sender": sender, "data": data }
    })
}

/// Let spawned tasks run to their next pending point.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// A synchronizer wired to a [`MockApi`] and a [`MemoryStore`], already in
/// the `connecting` state.
pub struct Fixture {
    pub api: Arc<MockApi>,
    pub store: Arc<MemoryStore>,
    pub events: broadcast::Sender<EngineEvent>,
    pub state_holder: StateHolder,
    pub settings: SyncConfig,
    pub host: HostDescriptor,
    pub sync: Arc<LibrarySynchronizer>,
}

impl Fixture {
    pub fn new(scope: LibraryScope) -> Self {
        Self::with_settings(scope, SyncConfig::default())
    }

    pub fn with_settings(scope: LibraryScope, settings: SyncConfig) -> Self {
        let mut host = host();
        host.scope = scope;
        let api = Arc::new(MockApi::new());
        let store = Arc::new(MemoryStore::new());
        let (events, _) = broadcast::channel(64);
        Self::build(api, store, events, host, settings)
    }

    fn build(
        api: Arc<MockApi>,
        store: Arc<MemoryStore>,
        events: broadcast::Sender<EngineEvent>,
        host: HostDescriptor,
        settings: SyncConfig,
    ) -> Self {
        let state_holder = StateHolder::new();
        state_holder.transition(ConnectionState::Connecting);
        let library = Arc::new(Library::new(host.clone(), store.clone(), &settings, events.clone()));
        let sync = Arc::new(LibrarySynchronizer::new(
            api.clone(),
            library,
            settings.clone(),
            state_holder.clone(),
        ));
        Self { api, store, events, state_holder, settings, host, sync }
    }

    pub fn library(&self) -> &Arc<Library> {
        self.sync.library()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_holder.get()
    }

    pub fn cache(&self) -> HostCache {
        HostCache::new(self.store.clone(), &self.host)
    }

    pub fn mirror_writes(&self) -> usize {
        self.store.write_count(&self.cache().mirror_key())
    }

    /// Full load of the current mock catalog, written straight to the store.
    pub async fn seed_cache(&self) {
        self.sync.load_library(true).await.unwrap();
        self.library().flush().await;
    }

    /// Start over with an empty in-memory library, as after a restart. The
    /// store and the mock host are kept.
    pub fn reconnect(&mut self) {
        let library = Arc::new(Library::new(
            self.host.clone(),
            self.store.clone(),
            &self.settings,
            self.events.clone(),
        ));
        self.sync = Arc::new(LibrarySynchronizer::new(
            self.api.clone(),
            library,
            self.settings.clone(),
            self.state_holder.clone(),
        ));
        self.api.reset_calls();
    }

    /// Same host and store, different scope.
    pub fn with_scope(self, scope: LibraryScope) -> Self {
        let mut host = self.host.clone();
        host.scope = scope;
        self.api.reset_calls();
        Self::build(self.api, self.store, self.events, host, self.settings)
    }
}
