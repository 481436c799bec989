use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::{CatalogKind, MediaDomain};
use crate::discovery::Candidate;

const HOSTS_FILE_NAME: &str = "hosts.toml";
const CURRENT_VERSION: u32 = 1;

/// Which catalog kinds are mirrored for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryScope {
    Audio,
    Video,
    #[default]
    All,
    None,
}

impl LibraryScope {
    pub fn includes_domain(self, domain: MediaDomain) -> bool {
        match self {
            LibraryScope::All => true,
            LibraryScope::Audio => domain == MediaDomain::Audio,
            LibraryScope::Video => domain == MediaDomain::Video,
            LibraryScope::None => false,
        }
    }

    pub fn includes(self, kind: CatalogKind) -> bool {
        self.includes_domain(kind.domain())
    }

    /// Kinds in scope, parents first.
    pub fn kinds(self) -> Vec<CatalogKind> {
        CatalogKind::ALL
            .into_iter()
            .filter(|kind| self.includes(*kind))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    /// Seen on the network, never confirmed by the user.
    #[default]
    New,
    Configured,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

/// A host the engine can connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub name: String,
    /// IPv4 address or resolvable host name.
    pub address: String,
    /// HTTP JSON-RPC port.
    pub port: u16,
    /// Notification (websocket) port.
    pub tcp_port: u16,
    #[serde(default)]
    pub scope: LibraryScope,
    #[serde(default)]
    pub status: HostStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl HostDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16, tcp_port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            tcp_port,
            scope: LibraryScope::All,
            status: HostStatus::New,
            credentials: None,
        }
    }

    /// Adopt a discovered candidate as an unconfirmed host.
    pub fn from_candidate(candidate: &Candidate) -> Self {
        Self::new(
            candidate.name.clone(),
            candidate.address.to_string(),
            candidate.port,
            candidate.tcp_port,
        )
    }

    pub fn configure(&mut self) {
        self.status = HostStatus::Configured;
    }

    /// Stable identity used for equality of targets and cache namespaces.
    pub fn identity(&self) -> String {
        format!("{}@{}", self.name, self.address)
    }

    /// Short, filesystem- and key-safe digest of [`identity`](Self::identity).
    pub fn cache_namespace(&self) -> String {
        let digest = blake3::hash(self.identity().as_bytes());
        digest.to_hex()[..16].to_string()
    }

    /// Whether a discovered candidate is this host, by network identity.
    pub fn matches(&self, candidate: &Candidate) -> bool {
        if self.address == candidate.address.to_string() {
            return true;
        }
        self.name.eq_ignore_ascii_case(&candidate.name)
            || self.address.eq_ignore_ascii_case(&candidate.name)
    }

    /// Connection target changes that require a new session.
    pub fn same_endpoint(&self, other: &HostDescriptor) -> bool {
        self.identity() == other.identity()
            && self.port == other.port
            && self.tcp_port == other.tcp_port
            && self.credentials == other.credentials
            && self.scope == other.scope
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedHosts {
    pub version: u32,
    #[serde(default)]
    pub hosts: Vec<HostDescriptor>,
}

impl PersistedHosts {
    pub fn new(hosts: Vec<HostDescriptor>) -> Self {
        Self {
            version: CURRENT_VERSION,
            hosts,
        }
    }
}

fn get_hosts_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to get config directory")?
        .join("drift-host");

    fs::create_dir_all(&config_dir)
        .context("Failed to create config directory")?;

    Ok(config_dir.join(HOSTS_FILE_NAME))
}

/// Persist the known hosts. Hosts still in `new` status are not written.
pub fn save_hosts(hosts: &[HostDescriptor]) -> Result<()> {
    save_hosts_to(&get_hosts_path()?, hosts)
}

pub fn load_hosts() -> Result<Vec<HostDescriptor>> {
    load_hosts_from(&get_hosts_path()?)
}

pub fn save_hosts_to(path: &Path, hosts: &[HostDescriptor]) -> Result<()> {
    let configured = hosts
        .iter()
        .filter(|h| h.status == HostStatus::Configured)
        .cloned()
        .collect();
    let contents = toml::to_string_pretty(&PersistedHosts::new(configured))
        .context("Failed to serialize hosts to TOML")?;
    fs::write(path, contents)
        .context("Failed to write hosts file")?;
    Ok(())
}

pub fn load_hosts_from(path: &Path) -> Result<Vec<HostDescriptor>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Could not read hosts file: {}", e);
            return Ok(Vec::new());
        }
    };

    match toml::from_str::<PersistedHosts>(&contents) {
        Ok(persisted) => Ok(persisted.hosts),
        Err(e) => {
            tracing::warn!("Hosts file corrupt, starting fresh: {}", e);
            Ok(Vec::new())
        }
    }
}
