//! Zeroconf discovery of hosts on the local network.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{DiscoveryConfig, RemoteConfig};

/// A resolved host advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub address: Ipv4Addr,
    /// HTTP JSON-RPC port.
    pub port: u16,
    /// Notification port.
    pub tcp_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Added(Candidate),
    /// A previously added candidate stopped advertising.
    Removed(Candidate),
}

pub trait Discovery: Send + Sync {
    /// Start watching. Events flow until `cancel` fires; the channel closes
    /// afterwards.
    fn watch(&self, cancel: CancellationToken) -> mpsc::UnboundedReceiver<DiscoveryEvent>;
}

/// Browses for `_xbmc-jsonrpc-h._tcp` (or the configured service type)
/// advertisements. Resolver failures restart the browse after a delay.
pub struct MdnsDiscovery {
    service_type: String,
    restart_delay: Duration,
    default_tcp_port: u16,
}

impl MdnsDiscovery {
    pub fn new(config: &DiscoveryConfig, remote: &RemoteConfig) -> Self {
        Self {
            service_type: config.service_type.clone(),
            restart_delay: Duration::from_millis(config.restart_delay_ms),
            default_tcp_port: remote.default_tcp_port,
        }
    }

    /// Instance name without the service suffix.
    fn instance_name(&self, fullname: &str) -> String {
        fullname
            .strip_suffix(&self.service_type)
            .map(|name| name.trim_end_matches('.'))
            .unwrap_or(fullname)
            .to_string()
    }

    fn candidate(&self, info: &ServiceInfo) -> Option<Candidate> {
        let address = info.get_addresses().iter().find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })?;
        let tcp_port = info
            .get_property_val_str("tcpport")
            .and_then(|port| port.parse().ok())
            .unwrap_or(self.default_tcp_port);

        Some(Candidate {
            name: self.instance_name(info.get_fullname()),
            address,
            port: info.get_port(),
            tcp_port,
        })
    }

    /// One browse session. Returns `true` when cancelled, `false` when the
    /// daemon failed and the browse should be restarted.
    async fn browse(
        &self,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<DiscoveryEvent>,
        seen: &mut HashMap<String, Candidate>,
    ) -> bool {
        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(e) => {
                tracing::warn!("Failed to start mDNS daemon: {}", e);
                return false;
            }
        };
        let receiver = match daemon.browse(&self.service_type) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::warn!("Failed to browse for {}: {}", self.service_type, e);
                let _ = daemon.shutdown();
                return false;
            }
        };
        tracing::info!("Browsing for {}", self.service_type);

        let cancelled = loop {
            tokio::select! {
                _ = cancel.cancelled() => break true,
                event = receiver.recv_async() => match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let Some(candidate) = self.candidate(&info) else {
                            tracing::debug!("{} has no IPv4 address", info.get_fullname());
                            continue;
                        };
                        if seen.get(info.get_fullname()) == Some(&candidate) {
                            continue;
                        }
                        tracing::info!("Discovered {} at {}:{}", candidate.name, candidate.address, candidate.port);
                        seen.insert(info.get_fullname().to_string(), candidate.clone());
                        if events.send(DiscoveryEvent::Added(candidate)).is_err() {
                            break true;
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        if let Some(candidate) = seen.remove(&fullname) {
                            tracing::info!("{} stopped advertising", candidate.name);
                            if events.send(DiscoveryEvent::Removed(candidate)).is_err() {
                                break true;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("mDNS browse interrupted: {}", e);
                        break false;
                    }
                },
            }
        };

        let _ = daemon.shutdown();
        cancelled
    }
}

impl Discovery for MdnsDiscovery {
    fn watch(&self, cancel: CancellationToken) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = MdnsDiscovery {
            service_type: self.service_type.clone(),
            restart_delay: self.restart_delay,
            default_tcp_port: self.default_tcp_port,
        };

        tokio::spawn(async move {
            let mut seen = HashMap::new();
            loop {
                if this.browse(&cancel, &tx, &mut seen).await {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(this.restart_delay) => {
                        tracing::debug!("Restarting mDNS browse");
                    }
                }
            }
        });

        rx
    }
}
