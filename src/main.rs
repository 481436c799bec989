use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use drift_host::config::Config;
use drift_host::host::{self, HostDescriptor, HostStatus};
use drift_host::{
    ConnectionManager, ConnectionState, Discovery, EngineEvent, EngineHandle, JsonRpcConnector,
    MdnsDiscovery, RedbStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("drift_host=info".parse()?))
        .init();

    let config = Config::load()?;
    let mut hosts = host::load_hosts()?;

    let store = Arc::new(RedbStore::new()?);
    let connector = Arc::new(JsonRpcConnector::new(&config.remote)?);
    let discovery: Option<Arc<dyn Discovery>> = if config.discovery.enabled {
        Some(Arc::new(MdnsDiscovery::new(&config.discovery, &config.remote)))
    } else {
        None
    };

    let engine = ConnectionManager::spawn(connector, discovery, store, config.sync.clone());
    let mut events = engine.subscribe_events();
    let mut states = engine.subscribe_state();

    match hosts.iter().find(|h| h.status == HostStatus::Configured) {
        Some(host) => engine.connect(host.clone()),
        None => tracing::info!("No configured host, waiting for one to be discovered"),
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                engine.disconnect();
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                report_state(&engine, state);
            }
            event = events.recv() => match event {
                Ok(EngineEvent::HostDiscovered(candidate)) => {
                    if hosts.iter().any(|h| h.matches(&candidate)) {
                        continue;
                    }
                    let mut adopted = HostDescriptor::from_candidate(&candidate);
                    if engine.library().is_none() {
                        adopted.configure();
                        tracing::info!("Adopting {} at {}", adopted.name, adopted.address);
                        engine.connect(adopted.clone());
                    }
                    hosts.push(adopted);
                    if let Err(e) = host::save_hosts(&hosts) {
                        tracing::warn!("Failed to save hosts: {}", e);
                    }
                }
                Ok(EngineEvent::LibraryChanged(kind)) => tracing::debug!("{} changed", kind),
                Ok(event) => tracing::debug!("{:?}", event),
                Err(RecvError::Lagged(skipped)) => tracing::debug!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    Ok(())
}

fn report_state(engine: &EngineHandle, state: ConnectionState) {
    match state {
        ConnectionState::LoadedLibrary | ConnectionState::OutdatedLibrary => {
            let Some(library) = engine.library() else {
                return;
            };
            let summary: Vec<String> = library.with_mirror(|mirror| {
                mirror
                    .kinds()
                    .map(|kind| format!("{} {}", mirror.len(kind), kind))
                    .collect()
            });
            tracing::info!("{} ({}): {}", library.host().name, state, summary.join(", "));
        }
        other => tracing::info!("Connection {}", other),
    }
}
