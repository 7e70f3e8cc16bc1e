//! Generic HTTP and local file sources.

use tokio::process::Command;

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;

use super::{stream_response, Error};
use crate::audio::Input;
use crate::protocol::TrackInfo;

/// Builds track info for a plain audio URL.
///
/// Nothing is fetched up front; the length stays unknown until playback.
pub fn http_track(url: &str) -> TrackInfo {
    let title = url
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(url)
        .to_owned();

    TrackInfo {
        identifier: url.to_owned(),
        is_seekable: true,
        author: String::new(),
        length: 0,
        is_stream: false,
        position: 0,
        title,
        uri: Some(url.to_owned()),
        source: String::from("http"),
    }
}

/// Opens the byte stream behind a plain audio URL.
pub async fn http_stream(http: &reqwest::Client, url: &str) -> Result<Input, Error> {
    let response = http.get(url).send().await.map_err(Error::Http)?;

    Ok(stream_response(response))
}

/// Builds track info for a local file, probing its duration with `ffprobe`.
pub async fn local_track(path: &str) -> Result<TrackInfo, Error> {
    if !Path::new(path).is_file() {
        return Err(Error::NoMatches);
    }

    let title = Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned());

    Ok(TrackInfo {
        identifier: path.to_owned(),
        is_seekable: true,
        author: String::new(),
        length: probe_duration(path).await.unwrap_or(0),
        is_stream: false,
        position: 0,
        title,
        uri: Some(path.to_owned()),
        source: String::from("local"),
    })
}

/// Opens a local file for playback.
pub async fn local_stream(path: &str) -> Result<Input, Error> {
    let file = tokio::fs::File::open(path).await.map_err(Error::Io)?;

    Ok(Input::new(file))
}

/// Asks `ffprobe` for a duration in milliseconds.
async fn probe_duration(path: &str) -> Option<u64> {
    #[derive(Deserialize)]
    struct Probe {
        format: ProbeFormat,
    }

    #[derive(Deserialize)]
    struct ProbeFormat {
        duration: Option<String>,
    }

    let output = Command::new("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format", path])
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;

    let probe: Probe = serde_json::from_slice(&output.stdout).ok()?;
    let seconds: f64 = probe.format.duration?.parse().ok()?;

    Some((seconds * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_title_is_last_path_segment() {
        let info = http_track("https://example.com/audio/song.mp3");

        assert_eq!(info.title, "song.mp3");
        assert_eq!(info.source, "http");
        assert_eq!(info.uri.as_deref(), Some("https://example.com/audio/song.mp3"));
    }

    #[tokio::test]
    async fn missing_local_file_is_no_match() {
        assert!(matches!(
            local_track("/definitely/not/here.ogg").await,
            Err(Error::NoMatches),
        ));
    }
}
