use crate::catalog::CatalogKind;
use crate::discovery::Candidate;

/// Change notifications for the host application. State changes are
/// observed separately through the state channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Records of this kind were added, replaced or removed.
    LibraryChanged(CatalogKind),
    PlaylistsChanged,
    PlayerChanged,
    QueueChanged,
    /// A host that is not the current target appeared on the network.
    HostDiscovered(Candidate),
    HostLost(String),
}
