//! Live notifications from the host.
//!
//! Raw frames are parsed into [`NotificationEvent`]s and classified into a
//! [`Reaction`] without touching any state. The [`NotificationReactor`] then
//! applies reactions: player and volume changes update [`PlayerStatus`]
//! directly, catalog changes are queued to a single worker so they reach
//! the [`LibrarySynchronizer`] in arrival order.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::api::{fetch, NotificationStream};
use crate::catalog::{CatalogKind, MediaDomain};
use crate::error::RemoteError;
use crate::events::EngineEvent;
use crate::host::LibraryScope;
use crate::state::ConnectionState;
use crate::sync::LibrarySynchronizer;

/// One decoded push message.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub method: String,
    pub sender: String,
    pub item_id: Option<u64>,
    pub kind: Option<CatalogKind>,
    pub data: Value,
}

impl NotificationEvent {
    /// Decode one frame. Responses to our own requests share the socket and
    /// come back as `Ok(None)`.
    pub fn parse(text: &str) -> Result<Option<Self>, RemoteError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| RemoteError::decode("notification", e))?;

        let Some(method) = value.get("method").and_then(Value::as_str) else {
            if value.get("id").is_some() {
                return Ok(None);
            }
            return Err(RemoteError::decode("notification.method", "missing"));
        };

        let params = value.get("params");
        let sender = params
            .and_then(|p| p.get("sender"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = params
            .and_then(|p| p.get("data"))
            .cloned()
            .unwrap_or(Value::Null);

        // library events carry id/type at the top, player events under `item`
        let field = |name: &str| {
            data.get(name)
                .or_else(|| data.get("item").and_then(|item| item.get(name)))
                .cloned()
        };
        let item_id = field("id").and_then(|id| id.as_u64());
        let kind = field("type")
            .and_then(|kind| kind.as_str().and_then(CatalogKind::from_notification_type));

        Ok(Some(Self {
            method: method.to_string(),
            sender,
            item_id,
            kind,
            data,
        }))
    }

    fn player_id(&self) -> Option<i64> {
        self.data.get("player")?.get("playerid")?.as_i64()
    }

    fn speed(&self) -> Option<i64> {
        self.data.get("player")?.get("speed")?.as_i64()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayerChange {
    Playing { player_id: Option<i64>, speed: i64, item: Option<Value> },
    Paused { player_id: Option<i64> },
    Stopped,
    Speed { player_id: Option<i64>, speed: i64 },
    Property { player_id: Option<i64>, property: Map<String, Value> },
}

/// What a notification asks the engine to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    Ignore,
    SelfEcho,
    /// A per-item catalog event while its domain is being scanned.
    Suppressed,
    ScanStarted(MediaDomain),
    ScanFinished(MediaDomain),
    Remove { kind: CatalogKind, id: u64 },
    Upsert { kind: CatalogKind, id: u64 },
    Player(PlayerChange),
    Volume { volume: Option<u64>, muted: Option<bool> },
    QueueChanged { playlist_id: Option<i64> },
    HostUnavailable,
}

/// Decide what `event` means for a session with id `session_id`.
pub fn classify(
    event: &NotificationEvent,
    session_id: &str,
    scope: LibraryScope,
    scanning: impl Fn(MediaDomain) -> bool,
) -> Reaction {
    // Only `JSONRPC.NotifyAll` broadcasts carry a sender we chose; the host
    // signs everything else itself.
    if event.sender == session_id {
        return Reaction::SelfEcho;
    }

    let (namespace, name) = event.method.split_once('.').unwrap_or((event.method.as_str(), ""));
    match (namespace, name) {
        ("VideoLibrary" | "AudioLibrary", _) => {
            let Some(domain) = MediaDomain::from_method(&event.method) else {
                return Reaction::Ignore;
            };
            if !scope.includes_domain(domain) {
                return Reaction::Ignore;
            }
            match name {
                "OnScanStarted" | "OnCleanStarted" => Reaction::ScanStarted(domain),
                "OnScanFinished" | "OnCleanFinished" => Reaction::ScanFinished(domain),
                "OnRemove" | "OnUpdate" => {
                    let (Some(kind), Some(id)) = (event.kind, event.item_id) else {
                        return Reaction::Ignore;
                    };
                    if !scope.includes(kind) {
                        return Reaction::Ignore;
                    }
                    if scanning(kind.domain()) {
                        return Reaction::Suppressed;
                    }
                    if name == "OnRemove" {
                        Reaction::Remove { kind, id }
                    } else {
                        Reaction::Upsert { kind, id }
                    }
                }
                _ => Reaction::Ignore,
            }
        }
        ("Player", "OnPlay" | "OnResume" | "OnAVStart") => Reaction::Player(PlayerChange::Playing {
            player_id: event.player_id(),
            speed: event.speed().unwrap_or(1),
            item: event.data.get("item").cloned(),
        }),
        ("Player", "OnPause") => Reaction::Player(PlayerChange::Paused {
            player_id: event.player_id(),
        }),
        ("Player", "OnStop") => Reaction::Player(PlayerChange::Stopped),
        ("Player", "OnSpeedChanged") => Reaction::Player(PlayerChange::Speed {
            player_id: event.player_id(),
            speed: event.speed().unwrap_or(0),
        }),
        ("Player", "OnPropertyChanged") => Reaction::Player(PlayerChange::Property {
            player_id: event.player_id(),
            property: event
                .data
                .get("property")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        }),
        ("Application", "OnVolumeChanged") => Reaction::Volume {
            volume: event.data.get("volume").and_then(Value::as_u64),
            muted: event.data.get("muted").and_then(Value::as_bool),
        },
        ("Playlist", "OnAdd" | "OnRemove" | "OnClear") => Reaction::QueueChanged {
            playlist_id: event.data.get("playlistid").and_then(Value::as_i64),
        },
        ("System", "OnQuit" | "OnRestart" | "OnSleep") => Reaction::HostUnavailable,
        _ => Reaction::Ignore,
    }
}

/// Ephemeral playback state, refreshed from notifications only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerStatus {
    pub player_id: Option<i64>,
    pub playing: bool,
    pub speed: i64,
    pub item: Option<Value>,
    pub properties: Map<String, Value>,
    pub volume: Option<u64>,
    pub muted: bool,
    /// Items of the active player's queue.
    pub queue: Vec<Value>,
}

impl PlayerStatus {
    /// Apply one change. Returns whether anything changed.
    pub fn apply(&mut self, change: PlayerChange) -> bool {
        let before = self.clone();
        match change {
            PlayerChange::Playing { player_id, speed, item } => {
                self.player_id = player_id.or(self.player_id);
                self.playing = true;
                self.speed = speed;
                if item.is_some() {
                    self.item = item;
                }
            }
            PlayerChange::Paused { player_id } => {
                self.player_id = player_id.or(self.player_id);
                self.playing = false;
                self.speed = 0;
            }
            PlayerChange::Stopped => {
                let (volume, muted) = (self.volume, self.muted);
                *self = PlayerStatus { volume, muted, ..Default::default() };
            }
            PlayerChange::Speed { player_id, speed } => {
                self.player_id = player_id.or(self.player_id);
                self.speed = speed;
                self.playing = speed != 0;
            }
            PlayerChange::Property { player_id, property } => {
                self.player_id = player_id.or(self.player_id);
                self.properties.extend(property);
            }
        }
        *self != before
    }
}

/// Why a reactor stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum ReactorExit {
    Cancelled,
    Failed(RemoteError),
    /// The host announced it is quitting, restarting or going to sleep.
    HostUnavailable,
}

#[derive(Debug)]
enum Job {
    Remove { kind: CatalogKind, id: u64 },
    Refresh { kind: CatalogKind, id: u64 },
    Rescan(MediaDomain),
    Queue(i64),
}

pub struct NotificationReactor {
    session_id: String,
    sync: Arc<LibrarySynchronizer>,
    player: watch::Sender<PlayerStatus>,
}

impl NotificationReactor {
    pub fn new(
        session_id: impl Into<String>,
        sync: Arc<LibrarySynchronizer>,
        player: watch::Sender<PlayerStatus>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sync,
            player,
        }
    }

    /// Consume `notifications` until the session is cancelled, the stream
    /// fails, or the host goes away. Malformed frames are logged and skipped.
    pub async fn run(self, mut notifications: NotificationStream, cancel: CancellationToken) -> ReactorExit {
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let (failures_tx, mut failures) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_jobs(
            self.sync.clone(),
            self.player.clone(),
            jobs_rx,
            failures_tx,
        ));

        let exit = loop {
            tokio::select! {
                _ = cancel.cancelled() => break ReactorExit::Cancelled,
                Some(error) = failures.recv() => break ReactorExit::Failed(error),
                message = notifications.next() => match message {
                    None => break ReactorExit::Failed(RemoteError::Closed),
                    Some(Err(e)) if e.is_transport() => break ReactorExit::Failed(e),
                    Some(Err(e)) => tracing::warn!("Dropping undecodable notification: {}", e),
                    Some(Ok(text)) => {
                        if let Some(exit) = self.handle(&text, &jobs) {
                            break exit;
                        }
                    }
                },
            }
        };

        // stops any in-flight reconciliation with the session
        worker.abort();
        self.sync.library().reset_scanning();
        tracing::debug!("Notification reactor stopped: {:?}", exit);
        exit
    }

    fn handle(&self, text: &str, jobs: &mpsc::UnboundedSender<Job>) -> Option<ReactorExit> {
        let event = match NotificationEvent::parse(text) {
            Ok(Some(event)) => event,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!("Dropping malformed notification: {}", e);
                return None;
            }
        };

        let library = self.sync.library();
        let reaction = classify(&event, &self.session_id, self.sync.scope(), |domain| {
            library.is_scanning(domain)
        });
        tracing::trace!("{} -> {:?}", event.method, reaction);

        let job = match reaction {
            Reaction::Ignore | Reaction::SelfEcho => None,
            Reaction::Suppressed => {
                tracing::debug!("Ignoring {} during library scan", event.method);
                None
            }
            Reaction::ScanStarted(domain) => {
                tracing::info!("Host started scanning the {} library", domain);
                library.set_scanning(domain, true);
                self.sync.state().transition(ConnectionState::UpdatingLibrary);
                None
            }
            Reaction::ScanFinished(domain) => {
                tracing::info!("Host finished scanning the {} library", domain);
                library.set_scanning(domain, false);
                Some(Job::Rescan(domain))
            }
            Reaction::Remove { kind, id } => Some(Job::Remove { kind, id }),
            Reaction::Upsert { kind, id } => Some(Job::Refresh { kind, id }),
            Reaction::Player(change) => {
                let started = match &change {
                    PlayerChange::Playing { player_id, .. } => *player_id,
                    _ => None,
                };
                if self.player.send_if_modified(|status| status.apply(change)) {
                    library.emit(EngineEvent::PlayerChanged);
                }
                started.map(Job::Queue)
            }
            Reaction::Volume { volume, muted } => {
                let changed = self.player.send_if_modified(|status| {
                    let before = (status.volume, status.muted);
                    status.volume = volume.or(status.volume);
                    status.muted = muted.unwrap_or(status.muted);
                    before != (status.volume, status.muted)
                });
                if changed {
                    library.emit(EngineEvent::PlayerChanged);
                }
                None
            }
            Reaction::QueueChanged { playlist_id } => {
                let active = self.player.borrow().player_id;
                match (playlist_id, active) {
                    (Some(id), Some(active)) if id != active => None,
                    (Some(id), _) => Some(Job::Queue(id)),
                    (None, active) => active.map(Job::Queue),
                }
            }
            Reaction::HostUnavailable => {
                tracing::info!("Host announced {}", event.method);
                return Some(ReactorExit::HostUnavailable);
            }
        };

        if let Some(job) = job {
            // the worker only goes away together with this reactor
            let _ = jobs.send(job);
        }
        None
    }
}

/// Apply queued jobs one at a time. Catalog jobs additionally go through the
/// library's reconcile slot, which orders them against load passes.
async fn run_jobs(
    sync: Arc<LibrarySynchronizer>,
    player: watch::Sender<PlayerStatus>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    failures: mpsc::UnboundedSender<RemoteError>,
) {
    while let Some(job) = jobs.recv().await {
        tracing::trace!("Running {:?}", job);
        let result = match job {
            Job::Remove { kind, id } => Ok(sync.remove_item(kind, id).await),
            Job::Refresh { kind, id } => sync.refresh_item(kind, id).await,
            Job::Rescan(_) => sync.load_library(false).await.map(|()| true),
            Job::Queue(playlist_id) => refresh_queue(&sync, &player, playlist_id).await.map(|()| false),
        };

        let refresh = match result {
            Ok(mutated) => mutated,
            Err(e) if e.is_transport() => {
                let _ = failures.send(e);
                return;
            }
            Err(e) => {
                tracing::warn!("Notification handling failed: {}", e);
                false
            }
        };

        // catalog changes can rename or drop queued items
        let active = player.borrow().player_id;
        if let (true, Some(playlist_id)) = (refresh, active) {
            if let Err(e) = refresh_queue(&sync, &player, playlist_id).await {
                if e.is_transport() {
                    let _ = failures.send(e);
                    return;
                }
                tracing::warn!("Could not refresh play queue: {}", e);
            }
        }
    }
}

async fn refresh_queue(
    sync: &LibrarySynchronizer,
    player: &watch::Sender<PlayerStatus>,
    playlist_id: i64,
) -> Result<(), RemoteError> {
    let queue = fetch::fetch_queue(sync.api(), playlist_id).await?;
    let changed = player.send_if_modified(|status| {
        if status.queue == queue {
            return false;
        }
        status.queue = queue;
        true
    });
    if changed {
        sync.library().emit(EngineEvent::QueueChanged);
    }
    Ok(())
}
