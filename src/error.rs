//! Errors surfaced by the remote host boundary.
//!
//! Everything above the RemoteAPI degrades these into visible states
//! (`failure`, `offline`, `outdatedLibrary`) instead of returning them to the
//! host application.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Host unreachable, timed out, or the connection dropped mid-call.
    #[error("transport error: {0}")]
    Transport(String),

    /// The host answered, but not in the shape we expected.
    #[error("unexpected response at `{path}`: {message}")]
    Decode { path: String, message: String },

    /// The host rejected the call with a JSON-RPC error object.
    #[error("host returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The session was closed before the call could complete.
    #[error("session closed")]
    Closed,
}

impl RemoteError {
    pub fn decode(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        RemoteError::Decode {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Whether this failure means the session itself is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, RemoteError::Transport(_) | RemoteError::Closed)
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            RemoteError::decode("response", err)
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RemoteError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => RemoteError::Closed,
            other => RemoteError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(RemoteError::Transport("timed out".into()).is_transport());
        assert!(RemoteError::Closed.is_transport());
        assert!(!RemoteError::decode("result.movies", "missing field `file`").is_transport());
        assert!(!RemoteError::Rpc { code: -32602, message: "Invalid params".into() }.is_transport());
    }

    #[test]
    fn test_decode_message_names_path() {
        let err = RemoteError::decode("result.moviedetails", "missing field `movieid`");
        assert_eq!(
            err.to_string(),
            "unexpected response at `result.moviedetails`: missing field `movieid`"
        );
    }
}
