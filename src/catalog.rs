//! The fixed set of catalog kinds mirrored from the host, and the records
//! stored for each of them.
//!
//! Records keep the few fields the engine reasons about (id, label, natural
//! key, parent reference) as typed fields. Every other field the host sends
//! rides along untouched in `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Which half of the host's library a kind lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDomain {
    Audio,
    Video,
}

impl MediaDomain {
    /// Domain addressed by a notification or request method prefix.
    pub fn from_method(method: &str) -> Option<Self> {
        if method.starts_with("AudioLibrary.") {
            Some(MediaDomain::Audio)
        } else if method.starts_with("VideoLibrary.") {
            Some(MediaDomain::Video)
        } else {
            None
        }
    }
}

impl std::fmt::Display for MediaDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaDomain::Audio => write!(f, "audio"),
            MediaDomain::Video => write!(f, "video"),
        }
    }
}

/// Catalog kinds, declared parents first so iterating in order never visits a
/// child before its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CatalogKind {
    MovieSet,
    Movie,
    TvShow,
    Episode,
    MusicVideo,
    Artist,
    Album,
    Song,
    Genre,
}

impl CatalogKind {
    pub const ALL: [CatalogKind; 9] = [
        CatalogKind::MovieSet,
        CatalogKind::Movie,
        CatalogKind::TvShow,
        CatalogKind::Episode,
        CatalogKind::MusicVideo,
        CatalogKind::Artist,
        CatalogKind::Album,
        CatalogKind::Song,
        CatalogKind::Genre,
    ];

    pub fn domain(self) -> MediaDomain {
        match self {
            CatalogKind::MovieSet
            | CatalogKind::Movie
            | CatalogKind::TvShow
            | CatalogKind::Episode
            | CatalogKind::MusicVideo => MediaDomain::Video,
            CatalogKind::Artist | CatalogKind::Album | CatalogKind::Song | CatalogKind::Genre => {
                MediaDomain::Audio
            }
        }
    }

    /// Video kinds are fingerprinted per item; audio kinds only by a few
    /// library-wide timestamps.
    pub fn has_item_fingerprint(self) -> bool {
        self.domain() == MediaDomain::Video
    }

    /// Name of the id field in host records and request params.
    pub fn id_field(self) -> &'static str {
        match self {
            CatalogKind::MovieSet => "setid",
            CatalogKind::Movie => "movieid",
            CatalogKind::TvShow => "tvshowid",
            CatalogKind::Episode => "episodeid",
            CatalogKind::MusicVideo => "musicvideoid",
            CatalogKind::Artist => "artistid",
            CatalogKind::Album => "albumid",
            CatalogKind::Song => "songid",
            CatalogKind::Genre => "genreid",
        }
    }

    pub fn list_method(self) -> &'static str {
        match self {
            CatalogKind::MovieSet => "VideoLibrary.GetMovieSets",
            CatalogKind::Movie => "VideoLibrary.GetMovies",
            CatalogKind::TvShow => "VideoLibrary.GetTVShows",
            CatalogKind::Episode => "VideoLibrary.GetEpisodes",
            CatalogKind::MusicVideo => "VideoLibrary.GetMusicVideos",
            CatalogKind::Artist => "AudioLibrary.GetArtists",
            CatalogKind::Album => "AudioLibrary.GetAlbums",
            CatalogKind::Song => "AudioLibrary.GetSongs",
            CatalogKind::Genre => "AudioLibrary.GetGenres",
        }
    }

    /// Key of the item array inside a list response.
    pub fn list_key(self) -> &'static str {
        match self {
            CatalogKind::MovieSet => "sets",
            CatalogKind::Movie => "movies",
            CatalogKind::TvShow => "tvshows",
            CatalogKind::Episode => "episodes",
            CatalogKind::MusicVideo => "musicvideos",
            CatalogKind::Artist => "artists",
            CatalogKind::Album => "albums",
            CatalogKind::Song => "songs",
            CatalogKind::Genre => "genres",
        }
    }

    /// Details method and the key of the record in its response. Genres have
    /// no details call; they are only ever refreshed as a whole list.
    pub fn details_method(self) -> Option<(&'static str, &'static str)> {
        match self {
            CatalogKind::MovieSet => Some(("VideoLibrary.GetMovieSetDetails", "setdetails")),
            CatalogKind::Movie => Some(("VideoLibrary.GetMovieDetails", "moviedetails")),
            CatalogKind::TvShow => Some(("VideoLibrary.GetTVShowDetails", "tvshowdetails")),
            CatalogKind::Episode => Some(("VideoLibrary.GetEpisodeDetails", "episodedetails")),
            CatalogKind::MusicVideo => {
                Some(("VideoLibrary.GetMusicVideoDetails", "musicvideodetails"))
            }
            CatalogKind::Artist => Some(("AudioLibrary.GetArtistDetails", "artistdetails")),
            CatalogKind::Album => Some(("AudioLibrary.GetAlbumDetails", "albumdetails")),
            CatalogKind::Song => Some(("AudioLibrary.GetSongDetails", "songdetails")),
            CatalogKind::Genre => None,
        }
    }

    /// Properties requested for full records.
    pub fn properties(self) -> &'static [&'static str] {
        match self {
            CatalogKind::MovieSet => &["title", "playcount", "art"],
            CatalogKind::Movie => &[
                "title", "file", "setid", "year", "rating", "playcount", "runtime", "genre",
                "dateadded", "lastplayed", "resume", "art",
            ],
            CatalogKind::TvShow => &[
                "title", "file", "year", "episode", "watchedepisodes", "dateadded", "art",
            ],
            CatalogKind::Episode => &[
                "title", "file", "tvshowid", "showtitle", "season", "episode", "playcount",
                "runtime", "firstaired", "resume", "art",
            ],
            CatalogKind::MusicVideo => &[
                "title", "file", "artist", "album", "year", "playcount", "runtime", "art",
            ],
            CatalogKind::Artist => &["genre", "thumbnail", "fanart", "description"],
            CatalogKind::Album => &[
                "title", "artist", "artistid", "year", "genre", "playcount", "dateadded",
                "thumbnail",
            ],
            CatalogKind::Song => &[
                "title", "file", "albumid", "album", "artist", "track", "disc", "duration",
                "genre", "playcount",
            ],
            CatalogKind::Genre => &["title", "thumbnail"],
        }
    }

    /// Minimal properties for the cheap fingerprint listing of video kinds.
    pub fn fingerprint_properties(self) -> &'static [&'static str] {
        match self {
            CatalogKind::MovieSet => &["title"],
            CatalogKind::Movie
            | CatalogKind::TvShow
            | CatalogKind::Episode
            | CatalogKind::MusicVideo => &["file"],
            _ => &[],
        }
    }

    /// `AudioLibrary.GetProperties` fields that change when this kind changes.
    pub fn timestamp_properties(self) -> &'static [&'static str] {
        match self {
            CatalogKind::Artist => &["artistslastadded", "artistsmodified"],
            CatalogKind::Album => &["albumslastadded", "albumsmodified"],
            CatalogKind::Song => &["songslastadded", "songsmodified"],
            CatalogKind::Genre => &["librarylastupdated"],
            _ => &[],
        }
    }

    pub fn list_params(self, properties: &[&str]) -> Value {
        let mut params = json!({ "properties": properties });
        if self == CatalogKind::Artist {
            params["albumartistsonly"] = json!(false);
        }
        params
    }

    pub fn details_params(self, id: u64) -> Value {
        let mut params = Map::new();
        params.insert(self.id_field().to_string(), json!(id));
        params.insert("properties".to_string(), json!(self.properties()));
        Value::Object(params)
    }

    /// The kind an item of this kind points at, if any.
    pub fn parent(self) -> Option<CatalogKind> {
        match self {
            CatalogKind::Movie => Some(CatalogKind::MovieSet),
            CatalogKind::Episode => Some(CatalogKind::TvShow),
            CatalogKind::Song => Some(CatalogKind::Album),
            _ => None,
        }
    }

    /// Kinds whose items point at this kind.
    pub fn children(self) -> &'static [CatalogKind] {
        match self {
            CatalogKind::MovieSet => &[CatalogKind::Movie],
            CatalogKind::TvShow => &[CatalogKind::Episode],
            CatalogKind::Album => &[CatalogKind::Song],
            _ => &[],
        }
    }

    /// Whether deleting a parent deletes its children (shows, albums) or only
    /// detaches them (movie sets).
    pub fn cascades_delete(self) -> bool {
        matches!(self, CatalogKind::TvShow | CatalogKind::Album)
    }

    /// Kind named by the `type` field of a library notification.
    pub fn from_notification_type(kind: &str) -> Option<Self> {
        match kind {
            "set" | "movieset" => Some(CatalogKind::MovieSet),
            "movie" => Some(CatalogKind::Movie),
            "tvshow" => Some(CatalogKind::TvShow),
            "episode" => Some(CatalogKind::Episode),
            "musicvideo" => Some(CatalogKind::MusicVideo),
            "artist" => Some(CatalogKind::Artist),
            "album" => Some(CatalogKind::Album),
            "song" => Some(CatalogKind::Song),
            "genre" => Some(CatalogKind::Genre),
            _ => None,
        }
    }
}

impl std::fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CatalogKind::MovieSet => "movieSet",
            CatalogKind::Movie => "movie",
            CatalogKind::TvShow => "tvShow",
            CatalogKind::Episode => "episode",
            CatalogKind::MusicVideo => "musicVideo",
            CatalogKind::Artist => "artist",
            CatalogKind::Album => "album",
            CatalogKind::Song => "song",
            CatalogKind::Genre => "genre",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieSet {
    #[serde(rename = "setid")]
    pub id: u64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub title: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    #[serde(rename = "movieid")]
    pub id: u64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub file: String,
    /// Owning movie set, 0 when the movie is not part of one.
    #[serde(default)]
    pub setid: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TvShow {
    #[serde(rename = "tvshowid")]
    pub id: u64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub file: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    #[serde(rename = "episodeid")]
    pub id: u64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub tvshowid: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicVideo {
    #[serde(rename = "musicvideoid")]
    pub id: u64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub file: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    #[serde(rename = "artistid")]
    pub id: u64,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Album {
    #[serde(rename = "albumid")]
    pub id: u64,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    #[serde(rename = "songid")]
    pub id: u64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub albumid: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genre {
    #[serde(rename = "genreid")]
    pub id: u64,
    #[serde(default)]
    pub label: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One mirrored record, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CatalogItem {
    MovieSet(MovieSet),
    Movie(Movie),
    TvShow(TvShow),
    Episode(Episode),
    MusicVideo(MusicVideo),
    Artist(Artist),
    Album(Album),
    Song(Song),
    Genre(Genre),
}

impl CatalogItem {
    /// Decode a host record of the given kind.
    pub fn from_value(kind: CatalogKind, value: Value) -> serde_json::Result<Self> {
        Ok(match kind {
            CatalogKind::MovieSet => CatalogItem::MovieSet(serde_json::from_value(value)?),
            CatalogKind::Movie => CatalogItem::Movie(serde_json::from_value(value)?),
            CatalogKind::TvShow => CatalogItem::TvShow(serde_json::from_value(value)?),
            CatalogKind::Episode => CatalogItem::Episode(serde_json::from_value(value)?),
            CatalogKind::MusicVideo => CatalogItem::MusicVideo(serde_json::from_value(value)?),
            CatalogKind::Artist => CatalogItem::Artist(serde_json::from_value(value)?),
            CatalogKind::Album => CatalogItem::Album(serde_json::from_value(value)?),
            CatalogKind::Song => CatalogItem::Song(serde_json::from_value(value)?),
            CatalogKind::Genre => CatalogItem::Genre(serde_json::from_value(value)?),
        })
    }

    pub fn kind(&self) -> CatalogKind {
        match self {
            CatalogItem::MovieSet(_) => CatalogKind::MovieSet,
            CatalogItem::Movie(_) => CatalogKind::Movie,
            CatalogItem::TvShow(_) => CatalogKind::TvShow,
            CatalogItem::Episode(_) => CatalogKind::Episode,
            CatalogItem::MusicVideo(_) => CatalogKind::MusicVideo,
            CatalogItem::Artist(_) => CatalogKind::Artist,
            CatalogItem::Album(_) => CatalogKind::Album,
            CatalogItem::Song(_) => CatalogKind::Song,
            CatalogItem::Genre(_) => CatalogKind::Genre,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            CatalogItem::MovieSet(i) => i.id,
            CatalogItem::Movie(i) => i.id,
            CatalogItem::TvShow(i) => i.id,
            CatalogItem::Episode(i) => i.id,
            CatalogItem::MusicVideo(i) => i.id,
            CatalogItem::Artist(i) => i.id,
            CatalogItem::Album(i) => i.id,
            CatalogItem::Song(i) => i.id,
            CatalogItem::Genre(i) => i.id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            CatalogItem::MovieSet(i) => &i.label,
            CatalogItem::Movie(i) => &i.label,
            CatalogItem::TvShow(i) => &i.label,
            CatalogItem::Episode(i) => &i.label,
            CatalogItem::MusicVideo(i) => &i.label,
            CatalogItem::Artist(i) => &i.label,
            CatalogItem::Album(i) => &i.label,
            CatalogItem::Song(i) => &i.label,
            CatalogItem::Genre(i) => &i.label,
        }
    }

    /// The per-item value fingerprints compare: file path for playable
    /// video items, title for movie sets, label otherwise.
    pub fn natural_key(&self) -> &str {
        match self {
            CatalogItem::MovieSet(i) if !i.title.is_empty() => &i.title,
            CatalogItem::MovieSet(i) => &i.label,
            CatalogItem::Movie(i) => &i.file,
            CatalogItem::TvShow(i) => &i.file,
            CatalogItem::Episode(i) => &i.file,
            CatalogItem::MusicVideo(i) => &i.file,
            CatalogItem::Song(i) => &i.file,
            other => other.label(),
        }
    }

    /// Id of the parent item, if this item has one.
    pub fn parent_id(&self) -> Option<u64> {
        let id = match self {
            CatalogItem::Movie(i) => i.setid,
            CatalogItem::Episode(i) => i.tvshowid,
            CatalogItem::Song(i) => i.albumid,
            _ => 0,
        };
        (id != 0).then_some(id)
    }

    /// Clear the parent reference (used when a movie set disappears).
    pub fn detach_parent(&mut self) {
        match self {
            CatalogItem::Movie(i) => i.setid = 0,
            CatalogItem::Episode(i) => i.tvshowid = 0,
            CatalogItem::Song(i) => i.albumid = 0,
            _ => {}
        }
    }
}
