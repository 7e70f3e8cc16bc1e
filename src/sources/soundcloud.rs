//! Soundcloud resolution and streaming.
//!
//! The api-v2 endpoints want a client id that the website rotates every so
//! often; it is scraped out of the site's scripts and cached in
//! `./soundcloud.txt` for up to a week.

use serde::Deserialize;

use regex::Regex;

use tokio::io::AsyncWriteExt;

use futures_util::StreamExt;

use std::time::SystemTime;

use tracing::{debug, warn};

use super::{stream_response, Error};
use crate::audio::Input;
use crate::constants::{SOUNDCLOUD_KEY_FILE, SOUNDCLOUD_KEY_MAX_AGE};
use crate::protocol::TrackInfo;

const API: &str = "https://api-v2.soundcloud.com";

/// Prefix marking an identifier as a transcoding URL.
const TRANSCODING_PREFIX: &str = "O:";

#[derive(Deserialize)]
struct ScTrack {
    id: u64,
    title: String,
    /// Milliseconds.
    duration: u64,
    permalink_url: String,
    user: ScUser,
    #[serde(default)]
    media: ScMedia,
}

#[derive(Deserialize)]
struct ScUser {
    username: String,
}

#[derive(Default, Deserialize)]
struct ScMedia {
    #[serde(default)]
    transcodings: Vec<ScTranscoding>,
}

#[derive(Deserialize)]
struct ScTranscoding {
    url: String,
    format: ScFormat,
}

#[derive(Deserialize)]
struct ScFormat {
    protocol: String,
}

impl ScTrack {
    fn into_info(self) -> TrackInfo {
        // prefer the progressive transcoding; fall back to hls
        let transcoding = self
            .media
            .transcodings
            .iter()
            .find(|t| t.format.protocol == "progressive")
            .or_else(|| self.media.transcodings.first());

        let identifier = match transcoding {
            Some(t) => format!("{}{}", TRANSCODING_PREFIX, t.url),
            None => self.id.to_string(),
        };

        TrackInfo {
            identifier,
            is_seekable: true,
            author: self.user.username,
            length: self.duration,
            is_stream: false,
            position: 0,
            title: self.title,
            uri: Some(self.permalink_url),
            source: String::from("soundcloud"),
        }
    }
}

/// Resolves a soundcloud page URL into track info.
///
/// Playlist and set pages resolve to every contained track that already
/// carries its metadata.
pub async fn resolve(http: &reqwest::Client, url: &str) -> Result<Vec<TrackInfo>, Error> {
    let client_id = client_id(http).await?;

    let resolved: serde_json::Value = http
        .get(format!("{}/resolve", API))
        .query(&[("url", url), ("client_id", client_id.as_str())])
        .send()
        .await
        .map_err(Error::Http)?
        .json()
        .await
        .map_err(Error::Http)?;

    match resolved["kind"].as_str() {
        Some("track") => {
            let track: ScTrack = serde_json::from_value(resolved).map_err(Error::Json)?;
            Ok(vec![track.into_info()])
        }
        Some("playlist") => {
            let tracks = resolved["tracks"].as_array().cloned().unwrap_or_default();

            Ok(tracks
                .into_iter()
                .filter_map(|value| serde_json::from_value::<ScTrack>(value).ok())
                .map(ScTrack::into_info)
                .collect())
        }
        _ => Ok(Vec::new()),
    }
}

/// Searches for tracks.
pub async fn search(http: &reqwest::Client, terms: &str) -> Result<Vec<TrackInfo>, Error> {
    #[derive(Deserialize)]
    struct SearchPage {
        collection: Vec<serde_json::Value>,
    }

    let client_id = client_id(http).await?;

    let page: SearchPage = http
        .get(format!("{}/search/tracks", API))
        .query(&[("q", terms), ("client_id", client_id.as_str()), ("limit", "10")])
        .send()
        .await
        .map_err(Error::Http)?
        .json()
        .await
        .map_err(Error::Http)?;

    Ok(page
        .collection
        .into_iter()
        .filter_map(|value| serde_json::from_value::<ScTrack>(value).ok())
        .map(ScTrack::into_info)
        .collect())
}

/// Opens the audio byte stream behind an identifier produced by
/// [`resolve`]/[`search`].
pub async fn stream(http: &reqwest::Client, identifier: &str) -> Result<Input, Error> {
    let transcoding = identifier
        .strip_prefix(TRANSCODING_PREFIX)
        .ok_or_else(|| Error::Resolve(String::from("identifier is not streamable")))?;

    let client_id = client_id(http).await?;

    // the transcoding endpoint answers with the actual media location
    #[derive(Deserialize)]
    struct StreamLocation {
        url: String,
    }

    let location: StreamLocation = http
        .get(transcoding)
        .query(&[("client_id", client_id.as_str())])
        .send()
        .await
        .map_err(Error::Http)?
        .json()
        .await
        .map_err(Error::Http)?;

    if transcoding.contains("/hls") {
        hls_stream(http.clone(), location.url).await
    } else {
        let response = http.get(location.url).send().await.map_err(Error::Http)?;
        Ok(stream_response(response))
    }
}

/// Downloads an HLS playlist segment by segment into one continuous stream.
async fn hls_stream(http: reqwest::Client, playlist_url: String) -> Result<Input, Error> {
    let playlist = http
        .get(&playlist_url)
        .send()
        .await
        .map_err(Error::Http)?
        .text()
        .await
        .map_err(Error::Http)?;

    let segments: Vec<String> = playlist
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect();

    let (mut tx, rx) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(async move {
        for segment in segments {
            let response = match http.get(&segment).send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!("hls segment fetch failed: {}", err);
                    break;
                }
            };

            let mut chunks = response.bytes_stream();
            while let Some(chunk) = chunks.next().await {
                let Ok(chunk) = chunk else { return };

                if tx.write_all(&chunk).await.is_err() {
                    return;
                }
            }
        }

        let _ = tx.shutdown().await;
    });

    Ok(Input::new(rx).with_task(task))
}

/// Produces a usable api-v2 client id, scraping a fresh one when the cached
/// copy is missing or stale.
pub async fn client_id(http: &reqwest::Client) -> Result<String, Error> {
    if let Some(cached) = read_cached_key().await {
        return Ok(cached);
    }

    let key = scrape_client_id(http).await?;

    // truncate-write so concurrent readers never see a partial key
    if let Err(err) = tokio::fs::write(SOUNDCLOUD_KEY_FILE, &key).await {
        warn!("could not cache soundcloud key: {}", err);
    }

    Ok(key)
}

async fn read_cached_key() -> Option<String> {
    let meta = tokio::fs::metadata(SOUNDCLOUD_KEY_FILE).await.ok()?;

    let age = meta
        .modified()
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())?;
    if age > SOUNDCLOUD_KEY_MAX_AGE {
        return None;
    }

    let key = tokio::fs::read_to_string(SOUNDCLOUD_KEY_FILE).await.ok()?;
    let key = key.trim();

    (!key.is_empty()).then(|| key.to_owned())
}

/// Pulls the client id out of the website's script bundles.
async fn scrape_client_id(http: &reqwest::Client) -> Result<String, Error> {
    let page = http
        .get("https://soundcloud.com/")
        .send()
        .await
        .map_err(Error::Http)?
        .text()
        .await
        .map_err(Error::Http)?;

    let script_re = Regex::new(r#"src="(https://[^"]+\.sndcdn\.com/assets/[^"]+\.js)""#).unwrap();
    let key_re = Regex::new(r#"client_id\s*[:=]\s*"([a-zA-Z0-9]{16,})""#).unwrap();

    // the id usually hides in one of the last bundles, so walk backwards
    let scripts: Vec<&str> = script_re
        .captures_iter(&page)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    for script_url in scripts.iter().rev() {
        let script = http
            .get(*script_url)
            .send()
            .await
            .map_err(Error::Http)?
            .text()
            .await
            .map_err(Error::Http)?;

        if let Some(caps) = key_re.captures(&script) {
            let key = caps[1].to_owned();
            debug!("scraped soundcloud client id from {}", script_url);
            return Ok(key);
        }
    }

    Err(Error::Resolve(String::from(
        "no client id in soundcloud scripts",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track_json() -> serde_json::Value {
        serde_json::json!({
            "kind": "track",
            "id": 12345,
            "title": "A Song",
            "duration": 180_000,
            "permalink_url": "https://soundcloud.com/someone/a-song",
            "user": {"username": "someone"},
            "media": {"transcodings": [
                {"url": "https://api-v2.soundcloud.com/media/1/hls", "format": {"protocol": "hls"}},
                {"url": "https://api-v2.soundcloud.com/media/1/progressive", "format": {"protocol": "progressive"}}
            ]}
        })
    }

    #[test]
    fn prefers_progressive_transcoding() {
        let track: ScTrack = serde_json::from_value(track_json()).unwrap();
        let info = track.into_info();

        assert_eq!(
            info.identifier,
            "O:https://api-v2.soundcloud.com/media/1/progressive",
        );
        assert_eq!(info.length, 180_000);
        assert_eq!(info.author, "someone");
        assert_eq!(info.source, "soundcloud");
    }

    #[test]
    fn falls_back_to_first_transcoding() {
        let mut json = track_json();
        json["media"]["transcodings"].as_array_mut().unwrap().pop();

        let track: ScTrack = serde_json::from_value(json).unwrap();
        assert_eq!(
            track.into_info().identifier,
            "O:https://api-v2.soundcloud.com/media/1/hls",
        );
    }

    #[test]
    fn key_regex_matches_bundle_styles() {
        let key_re = Regex::new(r#"client_id\s*[:=]\s*"([a-zA-Z0-9]{16,})""#).unwrap();

        let caps = key_re
            .captures(r#"o={client_id:"AbCdEfGh12345678IjKl"}"#)
            .unwrap();
        assert_eq!(&caps[1], "AbCdEfGh12345678IjKl");
    }
}
