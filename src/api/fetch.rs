//! Typed catalog requests on top of [`RemoteApi`].
//!
//! Decode failures are logged with the offending path and degrade to empty
//! or missing results. Transport failures are returned so the caller can move
//! the connection to `failure`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::RemoteApi;
use crate::catalog::{CatalogItem, CatalogKind, MediaDomain};
use crate::error::RemoteError;
use crate::fingerprint::{Fingerprint, Timestamps};

/// A saved playlist on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPlaylist {
    pub label: String,
    pub file: String,
    pub domain: MediaDomain,
}

/// Array stored under `key` in a list response. Hosts omit the key entirely
/// when the list is empty.
fn list_entries(method: &str, result: &Value, key: &str) -> Result<Vec<Value>, RemoteError> {
    match result.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(RemoteError::decode(
            format!("{}.result.{}", method, key),
            format!("expected array, got {}", other),
        )),
    }
}

/// Records of one kind. `complete` is false when part or all of the reply
/// could not be decoded, so `items` may be missing records the host has.
#[derive(Debug, Clone, Default)]
pub struct KindList {
    pub items: Vec<CatalogItem>,
    pub complete: bool,
}

impl KindList {
    fn degraded() -> Self {
        Self { items: Vec::new(), complete: false }
    }
}

/// Fetch every record of one kind with full properties.
pub async fn fetch_kind(api: &dyn RemoteApi, kind: CatalogKind) -> Result<KindList, RemoteError> {
    let method = kind.list_method();
    let result = match api.call(method, kind.list_params(kind.properties())).await {
        Ok(result) => result,
        Err(e @ RemoteError::Decode { .. }) => {
            tracing::warn!("Could not decode {} list: {}", kind, e);
            return Ok(KindList::degraded());
        }
        Err(e) => return Err(e),
    };

    let entries = match list_entries(method, &result, kind.list_key()) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("{}", e);
            return Ok(KindList::degraded());
        }
    };

    let mut list = KindList { items: Vec::with_capacity(entries.len()), complete: true };
    for (index, entry) in entries.into_iter().enumerate() {
        match CatalogItem::from_value(kind, entry) {
            Ok(item) => list.items.push(item),
            Err(e) => {
                tracing::warn!(
                    "Dropping {} record at {}.result.{}[{}]: {}",
                    kind, method, kind.list_key(), index, e
                );
                list.complete = false;
            }
        }
    }
    Ok(list)
}

/// Fetch one record. `Ok(None)` when the host no longer has it or the reply
/// could not be decoded.
pub async fn fetch_details(
    api: &dyn RemoteApi,
    kind: CatalogKind,
    id: u64,
) -> Result<Option<CatalogItem>, RemoteError> {
    let Some((method, key)) = kind.details_method() else {
        // No details call for this kind; pick it out of the full list
        let list = fetch_kind(api, kind).await?;
        return Ok(list.items.into_iter().find(|item| item.id() == id));
    };

    let result = match api.call(method, kind.details_params(id)).await {
        Ok(result) => result,
        Err(RemoteError::Rpc { code, message }) => {
            tracing::debug!("{} {} not available on host ({}: {})", kind, id, code, message);
            return Ok(None);
        }
        Err(e @ RemoteError::Decode { .. }) => {
            tracing::warn!("Could not decode {} {}: {}", kind, id, e);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let Some(record) = result.get(key).cloned() else {
        tracing::warn!("{}.result.{} missing for {} {}", method, key, kind, id);
        return Ok(None);
    };

    match CatalogItem::from_value(kind, record) {
        Ok(item) => Ok(Some(item)),
        Err(e) => {
            tracing::warn!("Could not decode {}.result.{}: {}", method, key, e);
            Ok(None)
        }
    }
}

/// Cheap `(id, natural key)` listing of a video kind.
///
/// Unlike full fetches, a malformed entry fails the whole fingerprint: a
/// silently shortened fingerprint would read as deletions.
pub async fn fetch_fingerprint(api: &dyn RemoteApi, kind: CatalogKind) -> Result<Fingerprint, RemoteError> {
    let method = kind.list_method();
    let result = api
        .call(method, kind.list_params(kind.fingerprint_properties()))
        .await?;
    let entries = list_entries(method, &result, kind.list_key())?;
    let key_field = kind.fingerprint_properties().first().copied().unwrap_or("label");

    let mut pairs = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let id = entry
            .get(kind.id_field())
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                RemoteError::decode(
                    format!("{}.result.{}[{}].{}", method, kind.list_key(), index, kind.id_field()),
                    "missing or non-numeric id",
                )
            })?;
        let key = entry
            .get(key_field)
            .or_else(|| entry.get("label"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        pairs.push((id, key.to_string()));
    }

    Ok(Fingerprint::from_entries(pairs))
}

/// Library-wide audio timestamps, one call for all audio kinds.
pub async fn fetch_audio_timestamps(
    api: &dyn RemoteApi,
    kinds: &[CatalogKind],
) -> Result<Timestamps, RemoteError> {
    let properties: Vec<&str> = kinds
        .iter()
        .flat_map(|kind| kind.timestamp_properties().iter().copied())
        .collect();
    if properties.is_empty() {
        return Ok(Timestamps::new());
    }

    let result = api
        .call("AudioLibrary.GetProperties", json!({ "properties": properties }))
        .await?;
    let Value::Object(map) = result else {
        return Err(RemoteError::decode("AudioLibrary.GetProperties.result", "expected object"));
    };

    Ok(map
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect())
}

/// Saved playlists for both media domains. Missing playlist folders are
/// simply empty.
pub async fn fetch_user_playlists(api: &dyn RemoteApi) -> Result<Vec<UserPlaylist>, RemoteError> {
    let mut playlists = Vec::new();

    for (domain, folder, media) in [
        (MediaDomain::Video, "special://profile/playlists/video/", "video"),
        (MediaDomain::Audio, "special://profile/playlists/music/", "music"),
    ] {
        let method = "Files.GetDirectory";
        let result = match api
            .call(method, json!({ "directory": folder, "media": media }))
            .await
        {
            Ok(result) => result,
            Err(RemoteError::Rpc { .. }) => continue,
            Err(e @ RemoteError::Decode { .. }) => {
                tracing::warn!("Could not decode {} playlists: {}", media, e);
                continue;
            }
            Err(e) => return Err(e),
        };

        let entries = list_entries(method, &result, "files").unwrap_or_else(|e| {
            tracing::warn!("{}", e);
            Vec::new()
        });
        for entry in entries {
            let (Some(label), Some(file)) = (
                entry.get("label").and_then(Value::as_str),
                entry.get("file").and_then(Value::as_str),
            ) else {
                continue;
            };
            playlists.push(UserPlaylist {
                label: label.to_string(),
                file: file.to_string(),
                domain,
            });
        }
    }

    Ok(playlists)
}

/// `(playerid, type)` of the first active player.
pub async fn fetch_active_player(api: &dyn RemoteApi) -> Result<Option<(i64, String)>, RemoteError> {
    let result = api.call("Player.GetActivePlayers", json!({})).await?;
    let Some(players) = result.as_array() else {
        return Ok(None);
    };
    Ok(players.iter().find_map(|player| {
        let id = player.get("playerid")?.as_i64()?;
        let kind = player.get("type").and_then(Value::as_str).unwrap_or_default();
        Some((id, kind.to_string()))
    }))
}

/// Items of one play queue.
pub async fn fetch_queue(api: &dyn RemoteApi, playlist_id: i64) -> Result<Vec<Value>, RemoteError> {
    let method = "Playlist.GetItems";
    let result = api
        .call(
            method,
            json!({ "playlistid": playlist_id, "properties": ["title", "file", "duration"] }),
        )
        .await?;
    list_entries(method, &result, "items").or_else(|e| {
        tracing::warn!("{}", e);
        Ok(Vec::new())
    })
}
