//! Track resolution and streaming through the `youtube-dl` command line
//! tool.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;

use std::process::Stdio;

use serde::Deserialize;

use super::Error;
use crate::audio::Input;
use crate::protocol::TrackInfo;

/// How many results a search returns.
const SEARCH_LIMIT: usize = 5;

#[derive(Deserialize)]
struct YtdlQuery {
    id: String,
    title: String,
    webpage_url: String,
    #[serde(default)]
    uploader: Option<String>,
    /// Seconds; absent for live streams.
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    is_live: Option<bool>,
}

impl From<YtdlQuery> for TrackInfo {
    fn from(q: YtdlQuery) -> TrackInfo {
        let is_stream = q.is_live.unwrap_or(false);

        TrackInfo {
            identifier: q.id,
            is_seekable: !is_stream,
            author: q.uploader.unwrap_or_default(),
            length: q.duration.map(|secs| (secs * 1000.0) as u64).unwrap_or(0),
            is_stream,
            position: 0,
            title: q.title,
            uri: Some(q.webpage_url),
            source: String::from("youtube"),
        }
    }
}

/// Resolves a watch URL into track info, or a playlist URL into many.
pub async fn resolve(url: &str) -> Result<Vec<TrackInfo>, Error> {
    query(url).await
}

/// Searches and returns up to [`SEARCH_LIMIT`] tracks.
pub async fn search(terms: &str) -> Result<Vec<TrackInfo>, Error> {
    query(&format!("ytsearch{}:{}", SEARCH_LIMIT, terms)).await
}

/// Runs `youtube-dl -j` and parses one JSON document per line.
async fn query(arg: &str) -> Result<Vec<TrackInfo>, Error> {
    let mut ytdl = Command::new("youtube-dl")
        .args(["-j", arg])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(Error::Io)?;

    let stdout = ytdl.stdout.take().unwrap();
    let stderr = ytdl.stderr.take().unwrap();

    async fn read_to_end(mut stream: impl AsyncRead + Unpin) -> Result<String, std::io::Error> {
        let mut out = String::new();
        stream.read_to_string(&mut out).await.map(|_| out)
    }

    let (_exit, out, err) = tokio::try_join!(
        ytdl.wait(),
        read_to_end(stdout),
        error_from_stderr(stderr),
    )
    .map_err(Error::Io)?;

    if let Some(err) = err {
        return Err(Error::Resolve(err));
    }

    let mut tracks = Vec::new();
    for line in out.lines().filter(|line| !line.trim().is_empty()) {
        let q: YtdlQuery = serde_json::from_str(line).map_err(Error::Json)?;
        tracks.push(q.into());
    }

    Ok(tracks)
}

/// Opens the raw audio byte stream for a watch URL.
pub fn stream(url: &str) -> Result<Input, Error> {
    let ytdl = Command::new("youtube-dl")
        .args(["-f", "webm[abr>0]/bestaudio/best", "-R", "infinite", "-q", url, "-o", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(Error::Io)?;

    Ok(Input::from_child(ytdl))
}

/// Scrapes an error message off `youtube-dl` stderr.
///
/// `youtube-dl` exit codes are meaningless, so this is the only way we can
/// get a message out of it.
async fn error_from_stderr<T>(stream: T) -> Result<Option<String>, std::io::Error>
where
    T: AsyncRead + Unpin,
{
    // stderr looks like this:
    // WARNING: warning
    // ERROR: error <-- this is what we want
    const ERROR_PREFIX: &str = "ERROR:";

    let stream = BufReader::new(stream);

    let mut lines = stream.lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(message) = line.strip_prefix(ERROR_PREFIX) {
            return Ok(Some(message.trim().to_owned()));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scrapes_error_lines() {
        let stderr = b"WARNING: something benign\nERROR: Video unavailable\n";

        let err = error_from_stderr(&stderr[..]).await.unwrap();
        assert_eq!(err.as_deref(), Some("Video unavailable"));
    }

    #[tokio::test]
    async fn no_error_line() {
        let err = error_from_stderr(&b"WARNING: just noise\n"[..]).await.unwrap();
        assert_eq!(err, None);
    }

    #[test]
    fn live_queries_have_no_length() {
        let q = YtdlQuery {
            id: String::from("x"),
            title: String::from("radio"),
            webpage_url: String::from("https://example.com/x"),
            uploader: None,
            duration: None,
            is_live: Some(true),
        };

        let info = TrackInfo::from(q);
        assert!(info.is_stream);
        assert!(!info.is_seekable);
        assert_eq!(info.length, 0);
    }
}
