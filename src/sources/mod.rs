//! Track sources and the `/loadtracks` resolution pipeline.

pub mod http;
pub mod soundcloud;
pub mod youtube;

use serde::Serialize;

use regex::Regex;

use tokio::io::AsyncWriteExt;

use futures_util::StreamExt;

use std::fmt::{self, Display, Formatter};

use crate::audio::Input;
use crate::config::{LavalinkConfig, SourcesConfig};
use crate::protocol::payload::Severity;
use crate::protocol::{Track, TrackInfo};

/// An error resolving or opening a track.
#[derive(Debug)]
pub enum Error {
    /// The source is switched off in configuration; carries the protocol
    /// error code.
    Disabled(&'static str),
    /// The resolver found nothing.
    NoMatches,
    /// The resolver failed with a message.
    Resolve(String),
    Http(reqwest::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl Error {
    /// Severity reported in `TrackExceptionEvent`s.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Disabled(_) | Error::NoMatches | Error::Resolve(_) => Severity::Common,
            _ => Severity::Fault,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::Disabled(code) => f.write_str(code),
            Error::NoMatches => f.write_str("no matches"),
            Error::Resolve(msg) => f.write_str(msg),
            Error::Http(err) => Display::fmt(err, f),
            Error::Io(err) => Display::fmt(err, f),
            Error::Json(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Http(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            _ => None,
        }
    }
}

/// `loadType` values of a `/loadtracks` response.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadType {
    TrackLoaded,
    PlaylistLoaded,
    SearchResult,
    NoMatches,
    LoadFailed,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_track: Option<i64>,
}

/// A complete `/loadtracks` response.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub load_type: LoadType,
    pub playlist_info: PlaylistInfo,
    pub tracks: Vec<Track>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<LoadException>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoadException {
    pub message: String,
    pub severity: Severity,
}

impl LoadResult {
    fn of(load_type: LoadType, tracks: Vec<TrackInfo>) -> LoadResult {
        LoadResult {
            load_type,
            playlist_info: PlaylistInfo::default(),
            tracks: tracks.into_iter().map(Track::new).collect(),
            exception: None,
        }
    }

    fn no_matches() -> LoadResult {
        LoadResult::of(LoadType::NoMatches, Vec::new())
    }

    fn failed(err: Error) -> LoadResult {
        LoadResult {
            load_type: LoadType::LoadFailed,
            playlist_info: PlaylistInfo::default(),
            tracks: Vec::new(),
            exception: Some(LoadException {
                message: err.to_string(),
                severity: err.severity(),
            }),
        }
    }
}

/// Resolves a `/loadtracks` identifier.
pub async fn load_tracks(
    http: &reqwest::Client,
    config: &LavalinkConfig,
    identifier: &str,
) -> LoadResult {
    let re = Regex::new(r"^(ytsearch:)?(scsearch:)?(.+)$").unwrap();

    let Some(caps) = re.captures(identifier) else {
        return LoadResult::no_matches();
    };
    let rest = &caps[3];

    let resolved = if caps.get(1).is_some() {
        search(http, config, rest).await
    } else if caps.get(2).is_some() {
        search_soundcloud(http, config, rest).await
    } else {
        return resolve_plain(http, config, rest).await;
    };

    match resolved {
        Ok(tracks) if tracks.is_empty() => LoadResult::no_matches(),
        Ok(tracks) => LoadResult::of(LoadType::SearchResult, tracks),
        Err(err) => LoadResult::failed(err),
    }
}

/// Search, preferring youtube and falling back to soundcloud when youtube
/// search is switched off.
async fn search(
    http: &reqwest::Client,
    config: &LavalinkConfig,
    terms: &str,
) -> Result<Vec<TrackInfo>, Error> {
    if config.sources.youtube && config.youtube_search_enabled {
        youtube::search(terms).await
    } else {
        search_soundcloud(http, config, terms).await
    }
}

async fn search_soundcloud(
    http: &reqwest::Client,
    config: &LavalinkConfig,
    terms: &str,
) -> Result<Vec<TrackInfo>, Error> {
    if config.sources.soundcloud && config.soundcloud_search_enabled {
        soundcloud::search(http, terms).await
    } else {
        Err(Error::Disabled("SOUNDCLOUD_NOT_ENABLED"))
    }
}

/// Resolves a non-search identifier: a path, a known site URL, a plain
/// URL, or bare search terms.
async fn resolve_plain(
    http: &reqwest::Client,
    config: &LavalinkConfig,
    identifier: &str,
) -> LoadResult {
    let sources = &config.sources;

    if identifier.starts_with('/') {
        if !sources.local {
            return LoadResult::failed(Error::Disabled("LOCAL_NOT_ENABLED"));
        }

        return match http::local_track(identifier).await {
            Ok(info) => LoadResult::of(LoadType::TrackLoaded, vec![info]),
            Err(Error::NoMatches) => LoadResult::no_matches(),
            Err(err) => LoadResult::failed(err),
        };
    }

    if let Some(host) = url_host(identifier) {
        if host.contains("soundcloud") {
            if !sources.soundcloud {
                return LoadResult::failed(Error::Disabled("SOUNDCLOUD_NOT_ENABLED"));
            }

            return match soundcloud::resolve(http, identifier).await {
                Ok(tracks) if tracks.is_empty() => LoadResult::no_matches(),
                Ok(tracks) if tracks.len() == 1 => LoadResult::of(LoadType::TrackLoaded, tracks),
                Ok(tracks) => LoadResult::of(LoadType::PlaylistLoaded, tracks),
                Err(err) => LoadResult::failed(err),
            };
        }

        if host.contains("youtube.com") || host.contains("youtu.be") {
            if !sources.youtube {
                return LoadResult::failed(Error::Disabled("YOUTUBE_NOT_ENABLED"));
            }

            return match youtube::resolve(identifier).await {
                Ok(tracks) if tracks.is_empty() => LoadResult::no_matches(),
                Ok(tracks) if tracks.len() == 1 => LoadResult::of(LoadType::TrackLoaded, tracks),
                Ok(tracks) => LoadResult::of(LoadType::PlaylistLoaded, tracks),
                Err(err) => LoadResult::failed(err),
            };
        }

        if !sources.http {
            return LoadResult::failed(Error::Disabled("HTTP_NOT_ENABLED"));
        }

        return LoadResult::of(LoadType::TrackLoaded, vec![http::http_track(identifier)]);
    }

    // not a URL at all: treat it as search terms
    match search(http, config, identifier).await {
        Ok(tracks) if tracks.is_empty() => LoadResult::no_matches(),
        Ok(tracks) => LoadResult::of(LoadType::SearchResult, tracks),
        Err(err) => LoadResult::failed(err),
    }
}

/// Opens the playback byte stream for a decoded track.
pub async fn open(
    http: &reqwest::Client,
    sources: &SourcesConfig,
    info: &TrackInfo,
) -> Result<Input, Error> {
    match info.source.as_str() {
        "youtube" if !sources.youtube => Err(Error::Disabled("YOUTUBE_NOT_ENABLED")),
        "youtube" => youtube::stream(info.uri.as_deref().unwrap_or(&info.identifier)),
        "soundcloud" if !sources.soundcloud => Err(Error::Disabled("SOUNDCLOUD_NOT_ENABLED")),
        "soundcloud" => soundcloud::stream(http, &info.identifier).await,
        "local" if !sources.local => Err(Error::Disabled("LOCAL_NOT_ENABLED")),
        "local" => http::local_stream(&info.identifier).await,
        "http" if !sources.http => Err(Error::Disabled("HTTP_NOT_ENABLED")),
        "http" => http::http_stream(http, &info.identifier).await,
        other => Err(Error::Resolve(format!("unknown source {}", other))),
    }
}

/// Turns an HTTP response body into an [`Input`].
pub(crate) fn stream_response(response: reqwest::Response) -> Input {
    let (mut tx, rx) = tokio::io::duplex(64 * 1024);

    let task = tokio::spawn(async move {
        let mut chunks = response.bytes_stream();

        while let Some(chunk) = chunks.next().await {
            let Ok(chunk) = chunk else { return };

            if tx.write_all(&chunk).await.is_err() {
                return;
            }
        }

        let _ = tx.shutdown().await;
    });

    Input::new(rx).with_task(task)
}

fn url_host(identifier: &str) -> Option<&str> {
    let rest = identifier
        .strip_prefix("https://")
        .or_else(|| identifier.strip_prefix("http://"))?;

    let host = rest.split(['/', '?']).next().unwrap_or(rest);

    // drop a port if one is attached
    Some(host.split(':').next().unwrap_or(host))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LavalinkConfig {
        LavalinkConfig::default()
    }

    #[test]
    fn url_host_extraction() {
        assert_eq!(
            url_host("https://www.youtube.com/watch?v=x"),
            Some("www.youtube.com"),
        );
        assert_eq!(
            url_host("http://soundcloud.com:443/someone/song"),
            Some("soundcloud.com"),
        );
        assert_eq!(url_host("ytsearch:never gonna"), None);
        assert_eq!(url_host("/tmp/a.ogg"), None);
    }

    #[tokio::test]
    async fn local_disabled_is_load_failed() {
        let http = reqwest::Client::new();
        let result = load_tracks(&http, &config(), "/tmp/a.ogg").await;

        assert_eq!(result.load_type, LoadType::LoadFailed);
        assert_eq!(
            result.exception.unwrap().message,
            "LOCAL_NOT_ENABLED",
        );
    }

    #[tokio::test]
    async fn scsearch_disabled_is_load_failed() {
        let http = reqwest::Client::new();
        let mut config = config();
        config.soundcloud_search_enabled = false;

        let result = load_tracks(&http, &config, "scsearch:some song").await;

        assert_eq!(result.load_type, LoadType::LoadFailed);
        assert_eq!(
            result.exception.unwrap().message,
            "SOUNDCLOUD_NOT_ENABLED",
        );
    }

    #[tokio::test]
    async fn http_url_loads_without_network() {
        let http = reqwest::Client::new();
        let result = load_tracks(&http, &config(), "https://example.com/a.mp3").await;

        assert_eq!(result.load_type, LoadType::TrackLoaded);
        assert_eq!(result.tracks.len(), 1);
        assert_eq!(result.tracks[0].info.source, "http");

        // blob round-trips through the decoder
        let decoded = TrackInfo::decode(&result.tracks[0].track).unwrap();
        assert_eq!(decoded, result.tracks[0].info);
    }

    #[tokio::test]
    async fn http_url_disabled_is_load_failed() {
        let http = reqwest::Client::new();
        let mut config = config();
        config.sources.http = false;

        let result = load_tracks(&http, &config, "https://example.com/a.mp3").await;
        assert_eq!(result.load_type, LoadType::LoadFailed);
    }

    #[tokio::test]
    async fn open_refuses_disabled_source() {
        let http = reqwest::Client::new();
        let info = http::http_track("https://example.com/a.mp3");

        let mut sources = SourcesConfig::default();
        sources.http = false;

        assert!(matches!(
            open(&http, &sources, &info).await,
            Err(Error::Disabled("HTTP_NOT_ENABLED")),
        ));
    }
}
