//! The per-room audio player.
//!
//! A [`Player`] is a handle to a task that owns the voice connection, the
//! RTP socket and the packet streamer for one room. The queue drives it with
//! commands; it reports state transitions back through the worker's event
//! channel.

use crate::audio::Source;
use crate::constants::VOICE_CONNECT_THRESHOLD;
use crate::pool::QueueKey;
use crate::voice::{self, Connection, RtpSocket, Session};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

use super::streamer::{PacketStreamer, Status};

/// An audio sink that plays audio to a voice room.
pub struct Player {
    command_tx: UnboundedSender<Command>,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Player {
    /// Creates a new `Player` whose events arrive on `event_tx` tagged with
    /// `key`.
    pub fn new(key: QueueKey, event_tx: UnboundedSender<(QueueKey, PlayerEvent)>) -> Player {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            position_ms: Arc::new(AtomicU64::new(0)),
        });

        let shared_clone = shared.clone();
        let task = tokio::spawn(async move {
            PlayerTask::new(key, shared_clone, event_tx, command_rx).run().await;
        });

        Player {
            command_tx,
            shared,
            task,
        }
    }

    /// Connects (or reconnects) the voice endpoint.
    pub fn connect(&self, session: Session) {
        let _ = self.command_tx.send(Command::Connect(session));
    }

    /// Plays a new source, cutting it off early at `limit_ms` raw
    /// milliseconds when given.
    pub fn play(&self, source: Source, limit_ms: Option<u64>) {
        let _ = self.command_tx.send(Command::Play(source, limit_ms));
    }

    pub fn pause(&self, paused: bool) {
        let _ = self.command_tx.send(Command::Pause(paused));
    }

    /// Drops the current source without reporting an end.
    pub fn stop(&self) {
        let _ = self.command_tx.send(Command::Stop);
    }

    /// Raw milliseconds of the current source that have played.
    pub fn position_ms(&self) -> u64 {
        self.shared.position_ms.load(Ordering::Relaxed)
    }

    /// If the voice connection is up.
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// If the player is actively streaming audio.
    pub fn playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    /// Tears the player down.
    pub fn destroy(&self) {
        let _ = self.command_tx.send(Command::Disconnect);
        self.task.abort();
    }
}

/// A player state transition.
#[derive(Debug)]
pub enum PlayerEvent {
    /// The source began producing audio (or was armed while paused).
    Playing,
    /// The source played through to its natural end.
    Ended,
    /// The source or connection failed.
    Error(Error),
    /// The voice websocket closed.
    Closed {
        code: u16,
        reason: String,
        by_remote: bool,
    },
}

/// A player error.
#[derive(Debug)]
pub enum Error {
    Audio(crate::audio::Error),
    Voice(voice::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::Audio(err) => Display::fmt(err, f),
            Error::Voice(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Audio(err) => Some(err),
            Error::Voice(err) => Some(err),
        }
    }
}

enum Command {
    Connect(Session),
    Play(Source, Option<u64>),
    Pause(bool),
    Stop,
    Disconnect,
}

struct Shared {
    connected: AtomicBool,
    playing: AtomicBool,
    position_ms: Arc<AtomicU64>,
}

/// The task that runs behind each player.
struct PlayerTask {
    key: QueueKey,
    shared: Arc<Shared>,
    event_tx: UnboundedSender<(QueueKey, PlayerEvent)>,
    command_rx: UnboundedReceiver<Command>,

    conn: Option<Connection>,
    rtp: Option<RtpSocket>,
    streamer: PacketStreamer,
    paused: bool,
}

impl PlayerTask {
    fn new(
        key: QueueKey,
        shared: Arc<Shared>,
        event_tx: UnboundedSender<(QueueKey, PlayerEvent)>,
        command_rx: UnboundedReceiver<Command>,
    ) -> PlayerTask {
        let streamer =
            PacketStreamer::new(Duration::from_millis(200), shared.position_ms.clone());

        PlayerTask {
            key,
            shared,
            event_tx,
            command_rx,
            conn: None,
            rtp: None,
            streamer,
            paused: false,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.command_rx.recv() => {
                    match command {
                        Some(Command::Connect(session)) => self.handle_connect(session).await,
                        Some(Command::Play(source, limit_ms)) => {
                            // the old pipeline goes down only now that the
                            // replacement exists
                            self.close_source().await;
                            self.streamer.source(source, limit_ms);

                            if self.paused {
                                // armed but held; report readiness anyway
                                self.emit(PlayerEvent::Playing);
                            }
                        }
                        Some(Command::Pause(paused)) => {
                            if self.paused && !paused {
                                self.streamer.resync();
                            }
                            self.paused = paused;
                        }
                        Some(Command::Stop) => {
                            self.close_source().await;
                            self.shared.playing.store(false, Ordering::Release);
                        }
                        Some(Command::Disconnect) | None => break,
                    }
                }
                ev = recv_voice(self.conn.as_mut()) => {
                    match ev {
                        Some(Ok(voice::Event::ChangeSocket(rtp))) => {
                            self.rtp = Some(rtp);
                            self.streamer.resync();
                        }
                        Some(Err(err)) => {
                            self.handle_voice_error(err);
                        }
                        None => {
                            self.shared.connected.store(false, Ordering::Release);
                            self.conn = None;
                            self.rtp = None;
                        }
                    }
                }
                result = stream_audio(&mut self.streamer, self.rtp.as_mut(), self.paused) => {
                    match result {
                        Ok(Status::Started(ssrc)) => {
                            self.set_speaking(true, ssrc).await;
                            self.shared.playing.store(true, Ordering::Release);
                            self.emit(PlayerEvent::Playing);
                        }
                        Ok(Status::Stopped(ssrc)) => {
                            self.set_speaking(false, ssrc).await;
                            if !self.streamer.has_source() {
                                self.shared.playing.store(false, Ordering::Release);
                            }
                        }
                        Ok(Status::Finished(ssrc)) => {
                            self.set_speaking(false, ssrc).await;
                            self.shared.playing.store(false, Ordering::Release);
                            self.emit(PlayerEvent::Ended);
                        }
                        Err(err) => {
                            self.close_source().await;
                            self.shared.playing.store(false, Ordering::Release);
                            self.emit(PlayerEvent::Error(err));
                        }
                    }
                }
            }
        }

        // cleanup on the way out
        self.close_source().await;
        self.shared.connected.store(false, Ordering::Release);
    }

    async fn handle_connect(&mut self, session: Session) {
        debug!("connecting voice for {:?}", self.key);

        match timeout(VOICE_CONNECT_THRESHOLD, Connection::connect(session)).await {
            Ok(Ok((conn, rtp))) => {
                self.conn = Some(conn);
                self.rtp = Some(rtp);
                self.streamer.resync();
                self.shared.connected.store(true, Ordering::Release);
            }
            Ok(Err(err)) => {
                error!("voice connect: {}", err);
                self.handle_voice_error(err);
            }
            Err(_) => {
                self.handle_voice_error(voice::Error::Timeout);
            }
        }
    }

    fn handle_voice_error(&mut self, err: voice::Error) {
        self.shared.connected.store(false, Ordering::Release);
        self.conn = None;
        self.rtp = None;

        if let Some((code, reason, by_remote)) = err.close_info() {
            self.emit(PlayerEvent::Closed {
                code,
                reason,
                by_remote,
            });
        } else {
            self.emit(PlayerEvent::Error(Error::Voice(err)));
        }
    }

    async fn set_speaking(&mut self, speaking: bool, ssrc: u32) {
        if let Some(conn) = self.conn.as_mut() {
            if let Err(err) = conn.send_speaking(speaking, ssrc).await {
                error!("speaking update: {}", err);
            }
        }
    }

    async fn close_source(&mut self) {
        if let Some(mut source) = self.streamer.take_source() {
            if let Err(err) = source.close().await {
                error!("close source: {}", err);
            }
        }
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.event_tx.send((self.key, event));
    }
}

/// Waits for a voice event, or forever if there is no connection.
async fn recv_voice(
    conn: Option<&mut Connection>,
) -> Option<Result<voice::Event, voice::Error>> {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}

/// Streams audio, or waits forever while paused or unconnected.
async fn stream_audio(
    streamer: &mut PacketStreamer,
    rtp: Option<&mut RtpSocket>,
    paused: bool,
) -> Result<Status, Error> {
    match rtp {
        Some(rtp) if !paused => streamer.stream(rtp).await,
        _ => std::future::pending().await,
    }
}
