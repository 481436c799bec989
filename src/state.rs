//! Connection state and the single holder every transition goes through.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    #[default]
    None,
    Connecting,
    LoadingLibrary,
    UpdatingLibrary,
    LoadedLibrary,
    OutdatedLibrary,
    Sleeping,
    Wakeup,
    Offline,
    Online,
    Failure,
}

impl ConnectionState {
    /// A session is open and the library is (being) mirrored.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::LoadingLibrary
                | ConnectionState::UpdatingLibrary
                | ConnectionState::LoadedLibrary
                | ConnectionState::OutdatedLibrary
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn allows(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (a, b) if a == b => false,
            // disconnect is always allowed
            (_, None) => true,
            (None | Offline | Failure | Wakeup, Online) => true,
            (None | Offline | Failure | Wakeup | Online, Connecting) => true,
            (Online | Connecting, LoadingLibrary) => true,
            (LoadedLibrary | OutdatedLibrary, LoadingLibrary) => true,
            (LoadingLibrary | LoadedLibrary | OutdatedLibrary, UpdatingLibrary) => true,
            (LoadingLibrary | UpdatingLibrary, LoadedLibrary) => true,
            (LoadingLibrary | UpdatingLibrary | LoadedLibrary, OutdatedLibrary) => true,
            (Sleeping, Wakeup) => true,
            (Sleeping, _) => false,
            (_, Sleeping) => true,
            (s, Failure) => s.is_connected() || matches!(s, Connecting | Online),
            (s, Offline) => s.is_connected() || matches!(s, Connecting | Online | Failure | Wakeup),
            _ => false,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::None => "none",
            ConnectionState::Connecting => "connecting",
            ConnectionState::LoadingLibrary => "loadingLibrary",
            ConnectionState::UpdatingLibrary => "updatingLibrary",
            ConnectionState::LoadedLibrary => "loadedLibrary",
            ConnectionState::OutdatedLibrary => "outdatedLibrary",
            ConnectionState::Sleeping => "sleeping",
            ConnectionState::Wakeup => "wakeup",
            ConnectionState::Offline => "offline",
            ConnectionState::Online => "online",
            ConnectionState::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// Owns the current [`ConnectionState`]. Transitions are checked and applied
/// under the channel's lock, so concurrent callers are serialized.
#[derive(Clone)]
pub struct StateHolder {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHolder {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::None);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next` if the table allows it. Returns whether it moved.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut from = ConnectionState::None;
        let moved = self.tx.send_if_modified(|state| {
            from = *state;
            if state.allows(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!("Connection state {} -> {}", from, next);
        } else if from != next {
            tracing::trace!("Ignoring transition {} -> {}", from, next);
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_happy_path_transitions() {
        let holder = StateHolder::new();
        assert!(holder.transition(Online));
        assert!(holder.transition(LoadingLibrary));
        assert!(holder.transition(OutdatedLibrary));
        assert!(holder.transition(UpdatingLibrary));
        assert!(holder.transition(LoadedLibrary));
        assert_eq!(holder.get(), LoadedLibrary);
    }

    #[test]
    fn test_sleep_and_wake() {
        let holder = StateHolder::new();
        holder.transition(Connecting);
        holder.transition(LoadingLibrary);
        holder.transition(LoadedLibrary);

        assert!(holder.transition(Sleeping));
        // nothing but wakeup (or disconnect) leaves sleeping
        assert!(!holder.transition(Offline));
        assert!(!holder.transition(Online));
        assert!(holder.transition(Wakeup));
        assert!(holder.transition(Online));
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let holder = StateHolder::new();
        assert!(!holder.transition(LoadedLibrary));
        assert!(!holder.transition(Failure));
        assert!(!holder.transition(Wakeup));
        assert_eq!(holder.get(), None);
    }

    #[test]
    fn test_disconnect_from_anywhere() {
        for state in [Connecting, LoadedLibrary, Sleeping, Failure, Offline] {
            assert!(state.allows(None), "{} -> none", state);
        }
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let holder = StateHolder::new();
        let mut rx = holder.subscribe();

        holder.transition(Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Connecting);
    }
}
