//! Audio packet streamer.
//!
//! Sources usually produce audio much faster than its playback speed, so
//! packets are paced out at one per timestep. The streamer also interpolates
//! short breaks in transmission with silence frames, the way the platform
//! expects.

use crate::audio::Source;
use crate::constants::{SILENCE_FRAME, TIMESTEP_LENGTH, VOICE_PACKET_MAX};
use crate::voice::{RtpPacket, RtpSocket};

use tokio::time::{sleep_until, timeout_at, Duration, Instant};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::warn;

use super::player::Error;

/// Milliseconds of audio in one packet.
const MS_PER_PACKET: u64 = 1000 / crate::constants::AUDIO_FRAME_RATE as u64;

/// Paces packets from a [`Source`] onto an [`RtpSocket`].
pub struct PacketStreamer {
    patience: Duration,

    source: Option<Source>,
    waiting_for_source: bool,
    finished: bool,

    packet: RtpPacket,
    next_packet: Instant,
    ready: bool,

    silence_frames: usize,

    /// Raw milliseconds of the current source that have been sent.
    position_ms: Arc<AtomicU64>,
    /// Raw position at which the source is cut off early.
    limit_ms: Option<u64>,
}

impl PacketStreamer {
    /// Creates a new, empty `PacketStreamer`.
    ///
    /// `patience` determines how much extra time the streamer will wait for
    /// audio data before considering there to be a break in the stream.
    /// 200ms is a good default.
    pub fn new(patience: Duration, position_ms: Arc<AtomicU64>) -> PacketStreamer {
        PacketStreamer {
            patience,
            source: None,
            waiting_for_source: true,
            finished: false,
            packet: RtpPacket::default(),
            next_packet: Instant::now(),
            ready: false,
            silence_frames: 0,
            position_ms,
            limit_ms: None,
        }
    }

    /// Gives the streamer a new source to play, restarting the position
    /// counter.
    pub fn source(&mut self, source: Source, limit_ms: Option<u64>) {
        self.wait_for_source();
        self.source = Some(source);
        self.limit_ms = limit_ms;
        self.finished = false;
        self.position_ms.store(0, Ordering::Relaxed);
    }

    /// Checks if a source is present in the streamer.
    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Takes the inner [`Source`].
    pub fn take_source(&mut self) -> Option<Source> {
        self.wait_for_source();
        self.source.take()
    }

    /// Restarts the packet schedule from now. Called after a pause or a
    /// socket change so the backlog does not burst out at once.
    pub fn resync(&mut self) {
        self.next_packet = Instant::now() + TIMESTEP_LENGTH;
    }

    /// Streams the inner audio over the socket.
    ///
    /// This future is intended to be cancelled, as it will not return unless
    /// there's an error or the status of packet flow changes.
    pub async fn stream(&mut self, rtp: &mut RtpSocket) -> Result<Status, Error> {
        loop {
            if self.ready {
                sleep_until(self.next_packet).await;

                let packet = std::mem::take(&mut self.packet);
                rtp.send(packet).await.map_err(Error::Voice)?;

                self.next_packet += TIMESTEP_LENGTH;
                self.ready = false;
            } else if let Some(status) = self.next(rtp.ssrc()).await? {
                return Ok(status);
            }
        }
    }

    /// Polls for the next packet, marking `self.ready` once one is staged.
    async fn next(&mut self, ssrc: u32) -> Result<Option<Status>, Error> {
        if self.silence_frames > 0 {
            self.silence_frames -= 1;

            self.packet.payload_mut()[..SILENCE_FRAME.len()].copy_from_slice(SILENCE_FRAME);
            self.packet.set_payload_len(SILENCE_FRAME.len());
            self.ready = true;

            // the break becomes official once the silence drains
            if self.silence_frames == 0 && self.waiting_for_source {
                if self.finished {
                    self.finished = false;
                    Ok(Some(Status::Finished(ssrc)))
                } else {
                    Ok(Some(Status::Stopped(ssrc)))
                }
            } else {
                Ok(None)
            }
        } else if self.finished {
            // the source ended before it ever produced a packet
            self.finished = false;
            Ok(Some(Status::Finished(ssrc)))
        } else {
            self.next_from_source(ssrc).await
        }
    }

    /// Polls for the next packet from the source.
    async fn next_from_source(&mut self, ssrc: u32) -> Result<Option<Status>, Error> {
        let Some(source) = self.source.as_mut() else {
            // there is no source, wait
            std::future::pending().await
        };

        // an end threshold cuts the source off as if it had ended
        if let Some(limit) = self.limit_ms {
            if self.position_ms.load(Ordering::Relaxed) >= limit {
                self.finish().await?;
                return Ok(None);
            }
        }

        let (len, end_wait) = if self.waiting_for_source {
            // no strict schedule to keep; the remote is not expecting packets
            let len = source.read(self.packet.payload_mut()).await.map_err(Error::Audio)?;

            (len, true)
        } else {
            // time out if the source stalls so we can warn the remote about
            // the break in audio
            let res = timeout_at(
                self.next_packet + self.patience,
                source.read(self.packet.payload_mut()),
            )
            .await;

            match res {
                Ok(Ok(len)) => (len, false),
                Ok(Err(err)) => return Err(Error::Audio(err)),
                Err(_) => {
                    let now = Instant::now();
                    warn!("source stalled for {}ms", (now - self.next_packet).as_millis());

                    self.wait_for_source();

                    // exit so we can start playing the silence frames
                    return Ok(None);
                }
            }
        };

        if len > 0 {
            self.packet.set_payload_len(len);
            self.ready = true;
            self.position_ms.fetch_add(MS_PER_PACKET, Ordering::Relaxed);
        } else {
            self.finish().await?;
        }

        // if the source is finally returning, we can report a start
        if end_wait && self.ready {
            // reset the schedule so packets pace from now
            self.next_packet = Instant::now() + TIMESTEP_LENGTH;
            self.waiting_for_source = false;

            Ok(Some(Status::Started(ssrc)))
        } else {
            Ok(None)
        }
    }

    /// The source reached its end; tear it down and queue the break.
    async fn finish(&mut self) -> Result<(), Error> {
        if let Some(mut source) = self.source.take() {
            source.close().await.map_err(Error::Audio)?;
        }
        self.wait_for_source();
        self.finished = true;

        Ok(())
    }

    fn wait_for_source(&mut self) {
        if !self.waiting_for_source {
            self.waiting_for_source = true;
            self.silence_frames += 5;
        }
    }
}

/// An event that is returned from [`PacketStreamer::stream`] that is
/// informative on the status of the streamer.
pub enum Status {
    /// Packets have begun streaming, with the first packet's `ssrc`.
    Started(u32),
    /// There is a break in transmission, with the last packet's `ssrc`.
    Stopped(u32),
    /// The source played through to its end, with the last packet's `ssrc`.
    Finished(u32),
}

// oversized payloads would already have failed in Source::read
const _: () = assert!(VOICE_PACKET_MAX > SILENCE_FRAME.len());
