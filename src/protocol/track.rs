//! The opaque track descriptor blob.
//!
//! Tracks travel between the server and its clients as base64 blobs so that
//! clients can hold on to them without understanding them. The binary layout
//! is flags, version, then length-prefixed UTF-8 strings and big-endian
//! 64-bit integers; it round-trips exactly.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use serde::{Deserialize, Serialize};

use std::fmt::{self, Display, Formatter};
use std::io::{Cursor, Read, Write};

/// Current version of the blob layout.
pub const TRACK_VERSION: u8 = 2;

/// Decoded information about a track.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    pub is_seekable: bool,
    pub author: String,
    /// Track length in milliseconds.
    pub length: u64,
    pub is_stream: bool,
    /// Start position in milliseconds.
    pub position: u64,
    pub title: String,
    pub uri: Option<String>,
    /// Source that resolved the track: `youtube`, `soundcloud`, `local` or
    /// `http`.
    #[serde(rename = "sourceName")]
    pub source: String,
}

impl TrackInfo {
    /// Encodes the info into an opaque base64 blob.
    pub fn encode(&self) -> String {
        // infallible: the sink is a Vec
        let mut buf = Vec::with_capacity(64);

        buf.write_u8(0).unwrap();
        buf.write_u8(TRACK_VERSION).unwrap();
        write_str(&mut buf, &self.title);
        write_str(&mut buf, &self.author);
        buf.write_u64::<BigEndian>(self.length).unwrap();
        write_str(&mut buf, &self.identifier);
        buf.write_u8(self.is_stream as u8).unwrap();
        match &self.uri {
            Some(uri) => {
                buf.write_u8(1).unwrap();
                write_str(&mut buf, uri);
            }
            None => buf.write_u8(0).unwrap(),
        }
        write_str(&mut buf, &self.source);
        buf.write_u64::<BigEndian>(self.position).unwrap();

        BASE64.encode(buf)
    }

    /// Decodes an opaque base64 blob back into track info.
    pub fn decode(blob: &str) -> Result<TrackInfo, Error> {
        let raw = BASE64.decode(blob).map_err(Error::Base64)?;
        let mut cur = Cursor::new(raw);

        let _flags = cur.read_u8().map_err(Error::Truncated)?;
        let version = cur.read_u8().map_err(Error::Truncated)?;
        if version != TRACK_VERSION {
            return Err(Error::Version(version));
        }

        let title = read_str(&mut cur)?;
        let author = read_str(&mut cur)?;
        let length = cur.read_u64::<BigEndian>().map_err(Error::Truncated)?;
        let identifier = read_str(&mut cur)?;
        let is_stream = cur.read_u8().map_err(Error::Truncated)? != 0;
        let uri = if cur.read_u8().map_err(Error::Truncated)? != 0 {
            Some(read_str(&mut cur)?)
        } else {
            None
        };
        let source = read_str(&mut cur)?;
        let position = cur.read_u64::<BigEndian>().map_err(Error::Truncated)?;

        Ok(TrackInfo {
            identifier,
            is_seekable: !is_stream,
            author,
            length,
            is_stream,
            position,
            title,
            uri,
            source,
        })
    }
}

/// A track as a client sees it: the encoded blob plus its decoded info.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Track {
    pub track: String,
    pub info: TrackInfo,
}

impl Track {
    /// Encodes fresh info into a full track.
    pub fn new(info: TrackInfo) -> Track {
        Track {
            track: info.encode(),
            info,
        }
    }

    /// Decodes a blob into a full track.
    pub fn decode(blob: &str) -> Result<Track, Error> {
        Ok(Track {
            track: blob.to_owned(),
            info: TrackInfo::decode(blob)?,
        })
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();

    // the length prefix is u16; longer strings do not occur in practice, but
    // truncate at a char boundary instead of corrupting the stream
    let mut len = bytes.len().min(u16::MAX as usize);
    while !s.is_char_boundary(len) {
        len -= 1;
    }

    buf.write_u16::<BigEndian>(len as u16).unwrap();
    buf.write_all(&bytes[..len]).unwrap();
}

fn read_str(cur: &mut Cursor<Vec<u8>>) -> Result<String, Error> {
    let len = cur.read_u16::<BigEndian>().map_err(Error::Truncated)? as usize;

    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes).map_err(Error::Truncated)?;

    String::from_utf8(bytes).map_err(|err| Error::Utf8(err.utf8_error()))
}

/// An error decoding a track blob.
#[derive(Debug)]
pub enum Error {
    /// The blob is not valid base64.
    Base64(base64::DecodeError),
    /// The blob ended early.
    Truncated(std::io::Error),
    /// A string field is not valid UTF-8.
    Utf8(std::str::Utf8Error),
    /// Unknown layout version.
    Version(u8),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::Base64(err) => write!(f, "invalid base64: {}", err),
            Error::Truncated(_) => f.write_str("track blob ended early"),
            Error::Utf8(err) => write!(f, "invalid utf8: {}", err),
            Error::Version(v) => write!(f, "unknown track version {}", v),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Base64(err) => Some(err),
            Error::Truncated(err) => Some(err),
            Error::Utf8(err) => Some(err),
            Error::Version(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TrackInfo {
        TrackInfo {
            identifier: String::from("dQw4w9WgXcQ"),
            is_seekable: true,
            author: String::from("Rick Astley"),
            length: 212_000,
            is_stream: false,
            position: 0,
            title: String::from("Never Gonna Give You Up"),
            uri: Some(String::from("https://www.youtube.com/watch?v=dQw4w9WgXcQ")),
            source: String::from("youtube"),
        }
    }

    #[test]
    fn round_trip() {
        let info = sample();
        let decoded = TrackInfo::decode(&info.encode()).unwrap();

        assert_eq!(info, decoded);
    }

    #[test]
    fn round_trip_without_uri() {
        let info = TrackInfo {
            uri: None,
            source: String::from("local"),
            identifier: String::from("/tmp/a.ogg"),
            ..sample()
        };
        let decoded = TrackInfo::decode(&info.encode()).unwrap();

        assert_eq!(info, decoded);
    }

    #[test]
    fn stream_is_not_seekable() {
        let info = TrackInfo {
            is_stream: true,
            is_seekable: false,
            ..sample()
        };
        let decoded = TrackInfo::decode(&info.encode()).unwrap();

        assert!(decoded.is_stream);
        assert!(!decoded.is_seekable);
    }

    #[test]
    fn rejects_garbage() {
        assert!(TrackInfo::decode("not base64!!").is_err());
        assert!(TrackInfo::decode("AAECAw==").is_err());
    }
}
