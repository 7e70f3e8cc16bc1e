//! Audio sources.
//!
//! A [`Source`] turns a resolved input byte stream into a sequence of Opus
//! packets. The usual path pipes the input through ffmpeg (seek and filter
//! arguments included) and encodes the resulting PCM here, which is also
//! where the live volume multiplier is applied. Inputs that are already
//! Ogg-Opus and need no filtering skip ffmpeg entirely.

pub mod probe;

use probe::{Container, OggPacketReader, PROBE_LEN};

use crate::constants::{DEFAULT_BITRATE, SAMPLE_RATE, STEREO_FRAME_SIZE};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use std::fmt::{self, Debug, Display, Formatter};
use std::io::Cursor;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use opus::{Application, Bitrate, Channels, Encoder};

use tracing::debug;

/// A live volume multiplier, shared between a queue and its source.
///
/// Stored as `f32` bits so both sides can update it without locking.
#[derive(Clone, Debug)]
pub struct Volume(Arc<AtomicU32>);

impl Volume {
    pub fn new(value: f32) -> Volume {
        Volume(Arc::new(AtomicU32::new(value.to_bits())))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl Default for Volume {
    fn default() -> Volume {
        Volume::new(1.0)
    }
}

/// A resolved input byte stream, plus the handles needed to tear it down.
pub struct Input {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    children: Vec<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl Input {
    /// Wraps a plain reader.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Input {
        Input {
            reader: Box::new(reader),
            children: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Wraps the stdout of a child process, keeping the child for cleanup.
    ///
    /// # Panics
    /// Panics if the child's `stdout` was not set to [`Stdio::piped`].
    pub fn from_child(mut child: Child) -> Input {
        let stdout = child.stdout.take().unwrap();

        Input {
            reader: Box::new(stdout),
            children: vec![child],
            tasks: Vec::new(),
        }
    }

    /// Attaches a feeder task that must be aborted with the input.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Input {
        self.tasks.push(task);
        self
    }

    /// Sniffs the container, giving the consumed bytes back to the stream.
    pub async fn probe(&mut self) -> Result<Container, Error> {
        let mut head = vec![0u8; PROBE_LEN];
        let mut filled = 0;

        while filled < head.len() {
            let n = self.reader.read(&mut head[filled..]).await.map_err(Error::Io)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        head.truncate(filled);

        let container = probe::detect(&head);

        // put the sniffed bytes back in front
        let reader = std::mem::replace(&mut self.reader, Box::new(tokio::io::empty()));
        self.reader = Box::new(Cursor::new(head).chain(reader));

        Ok(container)
    }

    /// Kills any child processes and aborts feeder tasks.
    pub async fn close(&mut self) -> Result<(), Error> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for mut child in self.children.drain(..) {
            child.kill().await.map_err(Error::Io)?;
        }
        Ok(())
    }
}

impl Debug for Input {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("Input(_)")
    }
}

/// An audio source producing Opus packets.
pub struct Source {
    kind: SourceKind,
    volume: Volume,
}

enum SourceKind {
    /// ffmpeg decodes (and filters) to s16le PCM; the Opus encode happens
    /// here so volume stays a live multiplier.
    Transcode {
        input: Input,
        ffmpeg: Child,
        coder: Encoder,
        buf: Box<[i16; STEREO_FRAME_SIZE]>,
        /// Bytes of the frame filled so far.
        buf_len: usize,
    },
    /// The input is already Ogg-Opus; packets pass through untouched.
    Passthrough { input: Input, reader: OggPacketReader<Box<dyn AsyncRead + Send + Unpin>> },
}

impl Source {
    /// Spawns ffmpeg over an input stream.
    ///
    /// `input_args` land before `-i -` (seeking); `output_args` after the
    /// output format options (the filter graph).
    pub fn transcode(
        mut input: Input,
        input_args: &[String],
        output_args: &[String],
        volume: Volume,
    ) -> Result<Source, Error> {
        let mut args: Vec<&str> = Vec::new();
        args.extend(input_args.iter().map(String::as_str));
        args.extend([
            "-i",
            "-",
            "-analyzeduration",
            "0",
            "-loglevel",
            "0",
            "-f",
            "s16le",
            "-ar",
            "48000",
            "-ac",
            "2",
        ]);
        args.extend(output_args.iter().map(String::as_str));
        args.push("pipe:1");

        debug!("ffmpeg {}", args.join(" "));

        let mut ffmpeg = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(Error::Io)?;

        // feed the source stream into ffmpeg's stdin
        let mut stdin = ffmpeg.stdin.take().unwrap();
        let reader = std::mem::replace(&mut input.reader, Box::new(tokio::io::empty()));
        let feeder = tokio::spawn(async move {
            let mut reader = reader;
            let _ = tokio::io::copy(&mut reader, &mut stdin).await;
            let _ = stdin.shutdown().await;
        });
        let input = input.with_task(feeder);

        let mut coder = Encoder::new(SAMPLE_RATE as u32, Channels::Stereo, Application::Audio)
            .map_err(Error::Codec)?;
        coder
            .set_bitrate(Bitrate::Bits(DEFAULT_BITRATE))
            .map_err(Error::Codec)?;

        Ok(Source {
            kind: SourceKind::Transcode {
                input,
                ffmpeg,
                coder,
                buf: Box::new([0i16; STEREO_FRAME_SIZE]),
                buf_len: 0,
            },
            volume,
        })
    }

    /// Passes an Ogg-Opus input straight through.
    pub fn passthrough(mut input: Input, volume: Volume) -> Source {
        let reader = std::mem::replace(&mut input.reader, Box::new(tokio::io::empty()));

        Source {
            kind: SourceKind::Passthrough {
                input,
                reader: OggPacketReader::new(reader),
            },
            volume,
        }
    }

    /// True when volume changes cannot be applied inline.
    pub fn is_passthrough(&self) -> bool {
        matches!(self.kind, SourceKind::Passthrough { .. })
    }

    /// Reads the next Opus packet into the buffer.
    ///
    /// Returns `Ok(0)` at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match &mut self.kind {
            SourceKind::Transcode {
                ffmpeg,
                coder,
                buf: pcm,
                buf_len,
                ..
            } => {
                let stdout = ffmpeg.stdout.as_mut().unwrap();
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut pcm[..]);

                // fill one full frame of PCM
                while *buf_len < bytes.len() {
                    let len = stdout
                        .read(&mut bytes[*buf_len..])
                        .await
                        .map_err(Error::Io)?;

                    if len == 0 {
                        break;
                    }
                    *buf_len += len;
                }

                if *buf_len == 0 {
                    return Ok(0);
                }

                // zero-pad a trailing partial frame so the encoder always
                // sees a whole one
                bytes[*buf_len..].fill(0);
                *buf_len = 0;

                let volume = self.volume.get();
                if (volume - 1.0).abs() > f32::EPSILON {
                    for sample in pcm.iter_mut() {
                        *sample = (f32::from(*sample) * volume)
                            .clamp(f32::from(i16::MIN), f32::from(i16::MAX))
                            as i16;
                    }
                }

                coder.encode(&pcm[..], buf).map_err(Error::Codec)
            }
            SourceKind::Passthrough { reader, .. } => {
                match reader.next_packet().await.map_err(Error::Io)? {
                    Some(packet) if packet.len() <= buf.len() => {
                        buf[..packet.len()].copy_from_slice(&packet);
                        Ok(packet.len())
                    }
                    // oversized packets cannot go out in one RTP frame
                    Some(_) => Err(Error::OversizedPacket),
                    None => Ok(0),
                }
            }
        }
    }

    /// Kills the processes associated with the source.
    pub async fn close(&mut self) -> Result<(), Error> {
        match &mut self.kind {
            SourceKind::Transcode { input, ffmpeg, .. } => {
                input.close().await?;
                ffmpeg.kill().await.map_err(Error::Io)?;
            }
            SourceKind::Passthrough { input, .. } => {
                input.close().await?;
            }
        }

        Ok(())
    }
}

impl Debug for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            SourceKind::Transcode { .. } => f.write_str("Source::Transcode(_)"),
            SourceKind::Passthrough { .. } => f.write_str("Source::Passthrough(_)"),
        }
    }
}

/// An audio source error.
#[derive(Debug)]
pub enum Error {
    /// Io error.
    Io(std::io::Error),
    /// Codec error.
    Codec(opus::Error),
    /// A passthrough packet does not fit in one RTP payload.
    OversizedPacket,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => Display::fmt(err, f),
            Error::Codec(err) => Display::fmt(err, f),
            Error::OversizedPacket => f.write_str("opus packet too large for rtp"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Codec(err) => Some(err),
            Error::OversizedPacket => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_gives_bytes_back() {
        let mut input = Input::new(&b"OggSrest of the stream"[..]);

        assert_eq!(input.probe().await.unwrap(), Container::Ogg);

        let mut out = Vec::new();
        input.reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"OggSrest of the stream");
    }

    #[tokio::test]
    async fn probe_short_stream() {
        let mut input = Input::new(&b"ab"[..]);

        assert_eq!(input.probe().await.unwrap(), Container::Unknown);

        let mut out = Vec::new();
        input.reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ab");
    }

    #[test]
    fn volume_cell_round_trips() {
        let volume = Volume::new(1.0);
        volume.set(0.25);

        assert_eq!(volume.get(), 0.25);
    }
}
