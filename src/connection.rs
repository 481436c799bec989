//! The connection manager.
//!
//! One actor task owns the target host, the current session and the
//! discovery watch. Everything that changes them (application calls,
//! discovery events, sessions ending) arrives as a message on its queue and
//! is handled in order. The application talks to it through an
//! [`EngineHandle`].

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::Connector;
use crate::config::SyncConfig;
use crate::discovery::{Candidate, Discovery, DiscoveryEvent};
use crate::error::RemoteError;
use crate::events::EngineEvent;
use crate::host::HostDescriptor;
use crate::notifications::{NotificationReactor, PlayerStatus, ReactorExit};
use crate::state::{ConnectionState, StateHolder};
use crate::store::KeyValueStore;
use crate::sync::{Library, LibrarySynchronizer};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug)]
enum Command {
    Connect(HostDescriptor),
    Disconnect,
    Suspend,
    Resume,
    Reload,
}

#[derive(Debug)]
enum Internal {
    Discovery(DiscoveryEvent),
    SessionEnded { generation: u64, exit: ReactorExit },
}

type SharedLibrary = Arc<RwLock<Option<Arc<Library>>>>;

/// Cheap, cloneable front door to a running engine. Dropping every handle
/// stops the engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: StateHolder,
    events: broadcast::Sender<EngineEvent>,
    player: watch::Receiver<PlayerStatus>,
    library: SharedLibrary,
}

impl EngineHandle {
    /// Connect to `host`. A no-op while already connected to the same
    /// endpoint; any other session is torn down first.
    pub fn connect(&self, host: HostDescriptor) {
        self.send(Command::Connect(host));
    }

    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// The device is going to sleep.
    pub fn on_suspend(&self) {
        self.send(Command::Suspend);
    }

    pub fn on_resume(&self) {
        self.send(Command::Resume);
    }

    /// Fetch every kind in scope from scratch. This is how an
    /// `outdatedLibrary` state is resolved by hand.
    pub fn reload_library(&self) {
        self.send(Command::Reload);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_player(&self) -> watch::Receiver<PlayerStatus> {
        self.player.clone()
    }

    pub fn player(&self) -> PlayerStatus {
        self.player.borrow().clone()
    }

    /// The mirrored library of the current target, if any.
    pub fn library(&self) -> Option<Arc<Library>> {
        self.library
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::warn!("Engine is no longer running");
        }
    }
}

struct ActiveSession {
    generation: u64,
    cancel: CancellationToken,
    reload: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl ActiveSession {
    fn stop(self) {
        self.cancel.cancel();
        // the task only awaits network and the reconcile slot
        self.task.abort();
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    discovery: Option<Arc<dyn Discovery>>,
    store: Arc<dyn KeyValueStore>,
    settings: SyncConfig,

    state: StateHolder,
    events: broadcast::Sender<EngineEvent>,
    player: watch::Sender<PlayerStatus>,
    library: SharedLibrary,

    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal: mpsc::UnboundedReceiver<Internal>,

    target: Option<HostDescriptor>,
    session: Option<ActiveSession>,
    generation: u64,
    discovery_cancel: Option<CancellationToken>,
}

impl ConnectionManager {
    /// Start the engine on the current runtime. Discovery (when given)
    /// starts watching right away.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        discovery: Option<Arc<dyn Discovery>>,
        store: Arc<dyn KeyValueStore>,
        settings: SyncConfig,
    ) -> EngineHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (player, player_rx) = watch::channel(PlayerStatus::default());
        let state = StateHolder::new();
        let library: SharedLibrary = Arc::new(RwLock::new(None));

        let handle = EngineHandle {
            commands: commands_tx,
            state: state.clone(),
            events: events.clone(),
            player: player_rx,
            library: library.clone(),
        };

        let manager = ConnectionManager {
            connector,
            discovery,
            store,
            settings,
            state,
            events,
            player,
            library,
            commands,
            internal_tx,
            internal,
            target: None,
            session: None,
            generation: 0,
            discovery_cancel: None,
        };
        tokio::spawn(manager.run());

        handle
    }

    async fn run(mut self) {
        self.start_discovery();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = self.internal.recv() => self.handle_internal(message),
            }
        }

        self.stop_session();
        self.stop_discovery();
        if let Some(library) = self.current_library() {
            library.flush().await;
        }
        tracing::debug!("Connection manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(host) => self.connect(host),
            Command::Disconnect => self.disconnect(),
            Command::Suspend => self.suspend(),
            Command::Resume => self.resume(),
            Command::Reload => match &self.session {
                Some(session) => {
                    let _ = session.reload.send(());
                }
                None => tracing::info!("Reload requested without an open session"),
            },
        }
    }

    fn handle_internal(&mut self, message: Internal) {
        match message {
            Internal::Discovery(DiscoveryEvent::Added(candidate)) => self.candidate_added(candidate),
            Internal::Discovery(DiscoveryEvent::Removed(candidate)) => self.candidate_removed(candidate),
            Internal::SessionEnded { generation, exit } => self.session_ended(generation, exit),
        }
    }

    fn connect(&mut self, host: HostDescriptor) {
        let same = self.target.as_ref().is_some_and(|t| t.same_endpoint(&host));
        if same && self.session.is_some() {
            tracing::debug!("Already connected to {}", host.name);
            return;
        }

        self.stop_session();
        // leave whatever state the previous target was in
        if self.state.get() != ConnectionState::None {
            self.state.transition(ConnectionState::None);
        }
        self.player.send_replace(PlayerStatus::default());

        tracing::info!("Connecting to {} ({}:{})", host.name, host.address, host.port);
        self.target = Some(host);
        self.state.transition(ConnectionState::Connecting);
        self.start_session();
    }

    fn disconnect(&mut self) {
        self.stop_session();
        if let Some(host) = self.target.take() {
            tracing::info!("Disconnected from {}", host.name);
        }
        self.set_library(None);
        self.player.send_replace(PlayerStatus::default());
        self.state.transition(ConnectionState::None);
    }

    fn suspend(&mut self) {
        self.stop_session();
        self.stop_discovery();
        self.state.transition(ConnectionState::Sleeping);
    }

    fn resume(&mut self) {
        if !self.state.transition(ConnectionState::Wakeup) {
            return;
        }
        if self.target.is_none() {
            self.state.transition(ConnectionState::None);
            self.start_discovery();
            return;
        }
        if self.discovery.is_some() {
            // the target comes back through discovery
            self.start_discovery();
        } else {
            self.state.transition(ConnectionState::Connecting);
            self.start_session();
        }
    }

    fn candidate_added(&mut self, candidate: Candidate) {
        let Some(target) = &self.target else {
            let _ = self.events.send(EngineEvent::HostDiscovered(candidate));
            return;
        };
        if !target.matches(&candidate) {
            let _ = self.events.send(EngineEvent::HostDiscovered(candidate));
            return;
        }

        let reachable = matches!(
            self.state.get(),
            ConnectionState::None
                | ConnectionState::Offline
                | ConnectionState::Failure
                | ConnectionState::Wakeup
        );
        if reachable && self.state.transition(ConnectionState::Online) {
            tracing::info!("{} is online", target.name);
            self.stop_session();
            self.start_session();
        }
    }

    fn candidate_removed(&mut self, candidate: Candidate) {
        let is_target = self.target.as_ref().is_some_and(|t| t.matches(&candidate));
        if !is_target {
            let _ = self.events.send(EngineEvent::HostLost(candidate.name));
            return;
        }

        tracing::info!("{} went offline", candidate.name);
        self.stop_session();
        self.state.transition(ConnectionState::Offline);
    }

    fn session_ended(&mut self, generation: u64, exit: ReactorExit) {
        if self.session.as_ref().map(|s| s.generation) != Some(generation) {
            tracing::trace!("Ignoring end of stale session {}", generation);
            return;
        }
        self.stop_session();

        match exit {
            ReactorExit::Cancelled => {}
            ReactorExit::HostUnavailable => {
                self.state.transition(ConnectionState::Offline);
            }
            ReactorExit::Failed(e) => {
                tracing::warn!("Session failed: {}", e);
                self.state.transition(ConnectionState::Failure);
            }
        }
    }

    fn start_session(&mut self) {
        let Some(host) = self.target.clone() else {
            return;
        };

        let library = match self.current_library() {
            Some(library) if library.host().same_endpoint(&host) => library,
            _ => {
                let library = Arc::new(Library::new(
                    host.clone(),
                    self.store.clone(),
                    &self.settings,
                    self.events.clone(),
                ));
                self.set_library(Some(library.clone()));
                library
            }
        };

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        let (reload, reload_rx) = mpsc::unbounded_channel();

        let ctx = SessionContext {
            host,
            connector: self.connector.clone(),
            library,
            settings: self.settings.clone(),
            state: self.state.clone(),
            player: self.player.clone(),
        };
        let internal = self.internal_tx.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let exit = run_session(ctx, token, reload_rx).await;
            if exit != ReactorExit::Cancelled {
                let _ = internal.send(Internal::SessionEnded { generation, exit });
            }
        });

        self.session = Some(ActiveSession {
            generation,
            cancel,
            reload,
            task,
        });
    }

    fn stop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop();
        }
    }

    fn start_discovery(&mut self) {
        let Some(discovery) = &self.discovery else {
            return;
        };
        if self.discovery_cancel.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let mut events = discovery.watch(cancel.clone());
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if internal.send(Internal::Discovery(event)).is_err() {
                    break;
                }
            }
        });
        self.discovery_cancel = Some(cancel);
    }

    fn stop_discovery(&mut self) {
        if let Some(cancel) = self.discovery_cancel.take() {
            cancel.cancel();
        }
    }

    fn current_library(&self) -> Option<Arc<Library>> {
        self.library
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_library(&self, library: Option<Arc<Library>>) {
        *self.library.write().unwrap_or_else(PoisonError::into_inner) = library;
    }
}

struct SessionContext {
    host: HostDescriptor,
    connector: Arc<dyn Connector>,
    library: Arc<Library>,
    settings: SyncConfig,
    state: StateHolder,
    player: watch::Sender<PlayerStatus>,
}

/// Open a session, load the library and keep it in step until the session
/// ends or is cancelled.
async fn run_session(
    ctx: SessionContext,
    cancel: CancellationToken,
    mut reload: mpsc::UnboundedReceiver<()>,
) -> ReactorExit {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return ReactorExit::Cancelled,
        opened = ctx.connector.open(&ctx.host) => opened,
    };
    let session = match opened {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Could not open a session with {}: {}", ctx.host.name, e);
            return ReactorExit::Failed(e);
        }
    };
    tracing::info!("Session {} open with {}", session.id, ctx.host.name);

    let sync = Arc::new(LibrarySynchronizer::new(
        session.api,
        ctx.library,
        ctx.settings,
        ctx.state,
    ));
    let reactor = NotificationReactor::new(session.id, sync.clone(), ctx.player);
    let reactor_cancel = cancel.child_token();
    let mut reactor = tokio::spawn(reactor.run(session.notifications, reactor_cancel.clone()));

    let mut force = false;
    let exit = loop {
        tokio::select! {
            _ = cancel.cancelled() => break ReactorExit::Cancelled,
            exit = &mut reactor => {
                break exit.unwrap_or(ReactorExit::Failed(RemoteError::Closed));
            }
            loaded = sync.load_library(force) => {
                if let Err(e) = loaded {
                    if e.is_transport() {
                        break ReactorExit::Failed(e);
                    }
                    tracing::warn!("Library load incomplete: {}", e);
                }
                // park until the next manual reload
                tokio::select! {
                    _ = cancel.cancelled() => break ReactorExit::Cancelled,
                    exit = &mut reactor => {
                        break exit.unwrap_or(ReactorExit::Failed(RemoteError::Closed));
                    }
                    request = reload.recv() => match request {
                        Some(()) => force = true,
                        None => break ReactorExit::Cancelled,
                    },
                }
            }
        }
    };

    reactor_cancel.cancel();
    reactor.abort();
    exit
}
