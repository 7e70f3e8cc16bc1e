//! The per-room queue.
//!
//! A queue owns the current track, the filter chain and the player for one
//! voice room, and is the single place playback events are decided. Arming
//! (resolving the source and spawning ffmpeg) happens in a detached task so
//! a slow fetch never blocks the worker loop; the task reports back through
//! the worker's internal channel.

use crate::audio::{self, Source, Volume};
use crate::config::SourcesConfig;
use crate::constants::PLAYER_STUCK_THRESHOLD;
use crate::protocol::payload::{
    EndReason, EventKind, Exception, OutboundFrame, PlayRequest, PlayerUpdateState, Severity,
    VoiceUpdate,
};
use crate::protocol::track::{self, Track};
use crate::protocol::{FilterChain, FilterSpec};
use crate::sources;
use crate::voice::Session;

use tokio::sync::mpsc::UnboundedSender;

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::player::{Error as PlayerError, Player, PlayerEvent};
use super::{GatewayBound, QueueKey};

/// Where the queue is in the arm cycle.
///
/// `ReArming` means audio is still flowing from the old pipeline while the
/// new one spins up; natural ends in that window stay silent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ArmPhase {
    Idle,
    Arming,
    Live,
    ReArming,
}

/// Messages an arm task or timer posts back into the worker loop.
pub enum Internal {
    Armed {
        key: QueueKey,
        epoch: u64,
        result: Result<Source, sources::Error>,
    },
    Stuck {
        key: QueueKey,
        epoch: u64,
    },
}

pub struct Queue {
    key: QueueKey,
    player: Player,
    track: Option<Track>,
    chain: Arc<Mutex<FilterChain>>,
    volume: Volume,
    paused: bool,
    phase: ArmPhase,
    /// Suppresses the next natural-end / stop event (re-arm, internal stop).
    suppress_end: bool,
    /// The most recent arm launch; stale arm results are discarded.
    epoch: u64,
    /// End threshold from the play request, in (scaled) track milliseconds.
    end_time: Option<u64>,
    /// Whether the armed source bypasses the inline encoder.
    passthrough: bool,
    destroyed: bool,

    events_tx: UnboundedSender<GatewayBound>,
    internal_tx: UnboundedSender<Internal>,
    http: reqwest::Client,
    sources: SourcesConfig,
}

impl Queue {
    pub fn new(
        key: QueueKey,
        player: Player,
        events_tx: UnboundedSender<GatewayBound>,
        internal_tx: UnboundedSender<Internal>,
        http: reqwest::Client,
        sources: SourcesConfig,
    ) -> Queue {
        Queue {
            key,
            player,
            track: None,
            chain: Arc::new(Mutex::new(FilterChain::new())),
            volume: Volume::default(),
            paused: false,
            phase: ArmPhase::Idle,
            suppress_end: false,
            epoch: 0,
            end_time: None,
            passthrough: false,
            destroyed: false,
            events_tx,
            internal_tx,
            http,
            sources,
        }
    }

    /// Feeds a stored voice server state to the player.
    pub fn voice_server(&mut self, update: VoiceUpdate) {
        let Some(endpoint) = update.event.endpoint else {
            return;
        };

        self.player.connect(Session {
            guild_id: self.key.1,
            user_id: self.key.0,
            session_id: update.session_id,
            token: update.event.token,
            endpoint,
        });
    }

    /// Queues a track, replacing whatever is playing.
    pub fn play(&mut self, req: PlayRequest) -> Result<(), track::Error> {
        if self.destroyed {
            return Ok(());
        }

        if self.track.is_some() {
            if req.no_replace && self.phase != ArmPhase::Idle {
                debug!("skipping play, track in progress and noReplace set");
                return Ok(());
            }

            if let Some(old) = self.track.take() {
                self.emit(EventKind::TrackEndEvent {
                    track: old.track,
                    reason: EndReason::Replaced,
                });
            }
        }

        let track = Track::decode(&req.track)?;

        {
            let mut chain = self.chain.lock().unwrap();
            chain.seek_ms = match req.start_time {
                Some(start) if start > 0 => Some(start),
                _ => None,
            };
        }

        if let Some(volume) = req.volume {
            self.volume.set(volume.min(1000) as f32 / 100.0);
        }

        self.paused = req.pause;
        self.player.pause(req.pause);

        self.end_time = req.end_time.filter(|&end| end > 0);
        self.track = Some(track);
        self.suppress_end = self.phase == ArmPhase::Live || self.phase == ArmPhase::ReArming;
        self.launch_arm(if self.suppress_end {
            ArmPhase::ReArming
        } else {
            ArmPhase::Arming
        });

        Ok(())
    }

    /// Stops playback. Internal stops (end threshold, destroy) emit nothing.
    pub fn stop(&mut self, internal: bool) {
        // cancel any in-flight arm
        self.epoch += 1;
        self.player.stop();

        if let Some(track) = self.track.take() {
            if !internal && !self.suppress_end {
                self.emit(EventKind::TrackEndEvent {
                    track: track.track,
                    reason: EndReason::Stopped,
                });
            }
        }

        self.suppress_end = false;
        self.phase = ArmPhase::Idle;
        self.clear_route();
    }

    pub fn pause(&mut self, paused: bool) {
        self.paused = paused;
        self.player.pause(paused);
    }

    /// Seeks by re-arming with an `-ss` prefix. Positions beyond the track
    /// clamp to its length.
    pub fn seek(&mut self, position: u64) {
        let Some(track) = &self.track else {
            return;
        };

        let length = track.info.length;
        let position = if length > 0 { position.min(length) } else { position };

        self.chain.lock().unwrap().seek_ms = Some(position);
        self.rearm();
    }

    /// Applies a live volume change; also kept for the next track.
    pub fn set_volume(&mut self, volume: u32) {
        self.volume.set(volume.min(1000) as f32 / 100.0);

        // a passthrough pipeline has no inline encoder to scale samples in
        if self.passthrough && self.track.is_some() {
            self.rearm();
        }
    }

    /// Replaces the filter chain from a spec and re-arms.
    pub fn filters(&mut self, spec: FilterSpec) {
        self.chain.lock().unwrap().apply(&spec);
        self.rearm();
    }

    /// Replaces the filter chain with raw ffmpeg arguments and re-arms.
    pub fn ffmpeg(&mut self, args: Vec<String>) {
        self.chain.lock().unwrap().apply_raw(args);
        self.rearm();
    }

    /// Tears the queue down. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }

        self.suppress_end = true;
        self.stop(true);
        self.destroyed = true;
        self.player.destroy();
    }

    /// The `playerUpdate` frame for this tick, if one is due.
    pub fn player_update(&self) -> Option<OutboundFrame> {
        if self.paused || self.destroyed || self.track.is_none() {
            return None;
        }

        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|at| at.as_millis() as u64)
            .unwrap_or(0);

        Some(OutboundFrame::PlayerUpdate {
            guild_id: self.key.1.to_string(),
            state: PlayerUpdateState {
                time,
                position: self.position(),
                connected: self.player.connected(),
            },
        })
    }

    /// The position reported to clients.
    pub fn position(&self) -> u64 {
        let (seek, rate) = {
            let chain = self.chain.lock().unwrap();
            (chain.seek_ms.unwrap_or(0), chain.rate)
        };

        scaled_position(self.player.position_ms(), seek, rate)
    }

    pub fn is_playing(&self) -> bool {
        !self.paused && self.track.is_some() && self.player.playing()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Reacts to a player transition.
    pub fn on_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Playing => match self.phase {
                ArmPhase::Arming => {
                    self.phase = ArmPhase::Live;
                    self.suppress_end = false;

                    if let Some(track) = &self.track {
                        let track = track.track.clone();
                        self.emit(EventKind::TrackStartEvent { track });
                    }
                }
                ArmPhase::ReArming => {
                    // filters picked up mid-flight; no event
                    self.phase = ArmPhase::Live;
                    self.suppress_end = false;
                }
                ArmPhase::Live | ArmPhase::Idle => (),
            },
            PlayerEvent::Ended => {
                if self.phase != ArmPhase::Live {
                    // an old pipeline drained during a re-arm
                    return;
                }

                if let Some(track) = self.track.take() {
                    if !self.suppress_end {
                        self.emit(EventKind::TrackEndEvent {
                            track: track.track,
                            reason: EndReason::Finished,
                        });
                    }
                }

                self.suppress_end = false;
                self.phase = ArmPhase::Idle;
                self.clear_route();
            }
            PlayerEvent::Error(err) => self.on_player_error(err),
            PlayerEvent::Closed {
                code,
                reason,
                by_remote,
            } => {
                self.emit(EventKind::WebSocketClosedEvent {
                    code,
                    reason,
                    by_remote,
                });
            }
        }
    }

    /// Accepts the result of an arm task.
    pub fn on_armed(&mut self, epoch: u64, result: Result<Source, sources::Error>) {
        if self.destroyed || epoch != self.epoch {
            // a stale arm; silently drop the pipeline it built
            if let Ok(mut source) = result {
                tokio::spawn(async move {
                    let _ = source.close().await;
                });
            }
            return;
        }

        match result {
            Ok(source) => {
                self.passthrough = source.is_passthrough();

                let limit = self.raw_limit();
                self.player.play(source, limit);
            }
            Err(err) => {
                let was_rearm = self.phase == ArmPhase::ReArming;

                if let Some(track) = &self.track {
                    let track = track.track.clone();
                    self.emit(EventKind::TrackExceptionEvent {
                        track,
                        error: err.to_string(),
                        exception: Exception {
                            message: err.to_string(),
                            severity: err.severity(),
                            cause: format!("{:?}", err),
                        },
                    });
                }

                if was_rearm {
                    // the old pipeline is still flowing; stay live
                    self.phase = ArmPhase::Live;
                    self.suppress_end = false;
                } else {
                    self.track = None;
                    self.phase = ArmPhase::Idle;
                    self.suppress_end = false;
                    self.clear_route();
                }
            }
        }
    }

    /// Fires when the stuck timer for an arm elapses.
    pub fn check_stuck(&mut self, epoch: u64) {
        if self.destroyed || epoch != self.epoch {
            return;
        }

        if !matches!(self.phase, ArmPhase::Arming | ArmPhase::ReArming) {
            return;
        }

        warn!("queue {:?} stuck while arming", self.key);

        if let Some(track) = &self.track {
            let track = track.track.clone();
            self.emit(EventKind::TrackStuckEvent {
                track,
                threshold_ms: PLAYER_STUCK_THRESHOLD.as_millis() as u64,
            });
        }

        let suppress = self.suppress_end;
        self.suppress_end = false;

        self.epoch += 1;
        self.player.stop();

        if let Some(track) = self.track.take() {
            if !suppress {
                self.emit(EventKind::TrackEndEvent {
                    track: track.track,
                    reason: EndReason::Stopped,
                });
            }
        }

        self.phase = ArmPhase::Idle;
        self.clear_route();
    }

    /// Re-arms the running pipeline so chain changes take effect.
    ///
    /// If an arm is already in flight it will pick the chain up when it
    /// builds its argv, so nothing new is launched.
    fn rearm(&mut self) {
        if self.track.is_none() {
            // nothing live; the chain applies to the next play
            return;
        }

        match self.phase {
            ArmPhase::Arming | ArmPhase::ReArming => (),
            ArmPhase::Live => {
                self.suppress_end = true;
                self.launch_arm(ArmPhase::ReArming);
            }
            ArmPhase::Idle => (),
        }
    }

    /// Spawns the arm task and its stuck timer.
    fn launch_arm(&mut self, phase: ArmPhase) {
        let Some(track) = &self.track else {
            return;
        };

        self.phase = phase;
        self.epoch += 1;

        let key = self.key;
        let epoch = self.epoch;
        let info = track.info.clone();
        let chain = self.chain.clone();
        let volume = self.volume.clone();
        let http = self.http.clone();
        let sources_cfg = self.sources.clone();
        let internal_tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = arm(&http, &sources_cfg, &info, &chain, volume).await;
            let _ = internal_tx.send(Internal::Armed { key, epoch, result });
        });

        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PLAYER_STUCK_THRESHOLD).await;
            let _ = internal_tx.send(Internal::Stuck { key, epoch });
        });
    }

    fn on_player_error(&mut self, err: PlayerError) {
        // cancel any in-flight arm and drop whatever is still streaming
        self.epoch += 1;
        self.player.stop();

        if let Some(track) = self.track.take() {
            self.emit(EventKind::TrackExceptionEvent {
                track: track.track,
                error: err.to_string(),
                exception: Exception {
                    message: err.to_string(),
                    severity: Severity::Fault,
                    cause: format!("{:?}", err),
                },
            });
        }

        self.suppress_end = false;
        self.phase = ArmPhase::Idle;
        self.clear_route();
    }

    /// Raw-source cutoff equivalent to `end_time`, accounting for seek and
    /// rate.
    fn raw_limit(&self) -> Option<u64> {
        let end = self.end_time?;

        let (seek, rate) = {
            let chain = self.chain.lock().unwrap();
            (chain.seek_ms.unwrap_or(0), chain.rate)
        };

        let scaled_end = (end as f64 / rate.max(0.001)) as u64;

        Some(scaled_end.saturating_sub(seek))
    }

    fn emit(&self, event: EventKind) {
        let _ = self.events_tx.send(GatewayBound::Frame {
            key: self.key,
            frame: OutboundFrame::Event {
                guild_id: self.key.1.to_string(),
                event,
            },
        });
    }

    fn clear_route(&self) {
        let _ = self.events_tx.send(GatewayBound::ClearRoute { key: self.key });
    }

    #[cfg(test)]
    fn force_track(&mut self, phase: ArmPhase) {
        use crate::protocol::TrackInfo;

        self.track = Some(Track::new(TrackInfo {
            identifier: String::from("/tmp/a.ogg"),
            is_seekable: true,
            author: String::new(),
            length: 60_000,
            is_stream: false,
            position: 0,
            title: String::from("a"),
            uri: None,
            source: String::from("local"),
        }));
        self.phase = phase;
        self.epoch += 1;
    }
}

/// Reported position: `floor((raw + seek) * rate)`.
fn scaled_position(raw_ms: u64, seek_ms: u64, rate: f64) -> u64 {
    ((raw_ms + seek_ms) as f64 * rate).floor() as u64
}

/// Resolves the source bytes and builds the pipeline. Runs detached from
/// the worker loop; the chain is read at argv-construction time so late
/// filter mutations still land.
async fn arm(
    http: &reqwest::Client,
    sources_cfg: &SourcesConfig,
    info: &crate::protocol::TrackInfo,
    chain: &Arc<Mutex<FilterChain>>,
    volume: Volume,
) -> Result<Source, sources::Error> {
    let mut input = sources::open(http, sources_cfg, info).await?;

    let (empty, input_args, output_args) = {
        let chain = chain.lock().unwrap();
        (chain.is_empty(), chain.input_args(), chain.output_args())
    };

    // with nothing to filter and no seek, an Ogg-Opus input can skip the
    // transcode entirely
    if empty && (volume.get() - 1.0).abs() < f32::EPSILON {
        match input.probe().await {
            Ok(audio::probe::Container::Ogg) => return Ok(Source::passthrough(input, volume)),
            Ok(_) => (),
            Err(err) => {
                let _ = input.close().await;
                return Err(sources::Error::Io(match err {
                    audio::Error::Io(err) => err,
                    other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
                }));
            }
        }
    }

    Source::transcode(input, &input_args, &output_args, volume).map_err(|err| match err {
        audio::Error::Io(err) => sources::Error::Io(err),
        other => sources::Error::Resolve(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    fn queue() -> (
        Queue,
        mpsc::UnboundedReceiver<GatewayBound>,
        mpsc::UnboundedReceiver<Internal>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (player_tx, _player_rx) = mpsc::unbounded_channel();

        let key = (42, 100);
        let player = Player::new(key, player_tx);
        let queue = Queue::new(
            key,
            player,
            events_tx,
            internal_tx,
            reqwest::Client::new(),
            SourcesConfig::default(),
        );

        (queue, events_rx, internal_rx)
    }

    fn next_event(rx: &mut mpsc::UnboundedReceiver<GatewayBound>) -> Option<GatewayBound> {
        rx.try_recv().ok()
    }

    #[test]
    fn position_scaling() {
        assert_eq!(scaled_position(1000, 0, 1.0), 1000);
        assert_eq!(scaled_position(1000, 500, 1.0), 1500);
        assert_eq!(scaled_position(1000, 500, 2.0), 3000);
        assert_eq!(scaled_position(999, 0, 0.5), 499);
    }

    #[tokio::test]
    async fn arming_to_live_emits_track_start() {
        let (mut queue, mut events, _internal) = queue();
        queue.force_track(ArmPhase::Arming);

        queue.on_player_event(PlayerEvent::Playing);

        assert_eq!(queue.phase, ArmPhase::Live);
        match next_event(&mut events) {
            Some(GatewayBound::Frame {
                frame: OutboundFrame::Event { event: EventKind::TrackStartEvent { .. }, .. },
                ..
            }) => (),
            other => panic!("expected TrackStartEvent, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rearm_completion_is_silent() {
        let (mut queue, mut events, _internal) = queue();
        queue.force_track(ArmPhase::ReArming);
        queue.suppress_end = true;

        queue.on_player_event(PlayerEvent::Playing);

        assert_eq!(queue.phase, ArmPhase::Live);
        assert!(!queue.suppress_end);
        assert!(next_event(&mut events).is_none());
    }

    #[tokio::test]
    async fn natural_end_emits_finished_once() {
        let (mut queue, mut events, _internal) = queue();
        queue.force_track(ArmPhase::Live);

        queue.on_player_event(PlayerEvent::Ended);

        match next_event(&mut events) {
            Some(GatewayBound::Frame {
                frame:
                    OutboundFrame::Event {
                        event: EventKind::TrackEndEvent { reason, .. },
                        ..
                    },
                ..
            }) => assert_eq!(reason, EndReason::Finished),
            other => panic!("expected TrackEndEvent, got {:?}", other),
        }

        // route is released after the terminating event
        assert!(matches!(
            next_event(&mut events),
            Some(GatewayBound::ClearRoute { .. }),
        ));

        // a second end is ignored: the track is gone
        queue.on_player_event(PlayerEvent::Ended);
        assert!(next_event(&mut events).is_none());
    }

    #[tokio::test]
    async fn end_during_rearm_is_suppressed() {
        let (mut queue, mut events, _internal) = queue();
        queue.force_track(ArmPhase::ReArming);
        queue.suppress_end = true;

        queue.on_player_event(PlayerEvent::Ended);

        assert!(next_event(&mut events).is_none());
        assert!(queue.track.is_some());
    }

    #[tokio::test]
    async fn stop_without_track_is_silent() {
        let (mut queue, mut events, _internal) = queue();

        queue.stop(false);

        assert!(!matches!(
            next_event(&mut events),
            Some(GatewayBound::Frame { .. }),
        ));
    }

    #[tokio::test]
    async fn stop_emits_stopped() {
        let (mut queue, mut events, _internal) = queue();
        queue.force_track(ArmPhase::Live);

        queue.stop(false);

        match next_event(&mut events) {
            Some(GatewayBound::Frame {
                frame:
                    OutboundFrame::Event {
                        event: EventKind::TrackEndEvent { reason, .. },
                        ..
                    },
                ..
            }) => assert_eq!(reason, EndReason::Stopped),
            other => panic!("expected TrackEndEvent, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stuck_arm_emits_stuck_then_stopped() {
        let (mut queue, mut events, _internal) = queue();
        queue.force_track(ArmPhase::Arming);
        let epoch = queue.epoch;

        queue.check_stuck(epoch);

        assert!(matches!(
            next_event(&mut events),
            Some(GatewayBound::Frame {
                frame: OutboundFrame::Event { event: EventKind::TrackStuckEvent { .. }, .. },
                ..
            }),
        ));
        assert!(matches!(
            next_event(&mut events),
            Some(GatewayBound::Frame {
                frame: OutboundFrame::Event {
                    event: EventKind::TrackEndEvent { reason: EndReason::Stopped, .. },
                    ..
                },
                ..
            }),
        ));
        assert_eq!(queue.phase, ArmPhase::Idle);
    }

    #[tokio::test]
    async fn stale_stuck_timer_is_ignored() {
        let (mut queue, mut events, _internal) = queue();
        queue.force_track(ArmPhase::Arming);
        let stale = queue.epoch;

        // a newer arm superseded the timer's epoch
        queue.epoch += 1;
        queue.check_stuck(stale);

        assert!(next_event(&mut events).is_none());
        assert_eq!(queue.phase, ArmPhase::Arming);
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_silent() {
        let (mut queue, mut events, _internal) = queue();
        queue.force_track(ArmPhase::Live);

        queue.destroy();
        queue.destroy();

        // only route clearing, no events
        while let Some(bound) = next_event(&mut events) {
            assert!(matches!(bound, GatewayBound::ClearRoute { .. }));
        }
        assert!(queue.is_destroyed());
    }

    #[tokio::test]
    async fn seek_clamps_to_track_length() {
        let (mut queue, _events, _internal) = queue();
        queue.force_track(ArmPhase::Live);

        queue.seek(120_000); // track is 60s long

        assert_eq!(queue.chain.lock().unwrap().seek_ms, Some(60_000));
    }

    #[tokio::test]
    async fn raw_limit_accounts_for_seek_and_rate() {
        let (mut queue, _events, _internal) = queue();
        queue.force_track(ArmPhase::Live);
        queue.end_time = Some(30_000);

        {
            let mut chain = queue.chain.lock().unwrap();
            chain.seek_ms = Some(10_000);
            chain.rate = 2.0;
        }

        // end at 30s of track time = 15s raw, minus the 10s seek
        assert_eq!(queue.raw_limit(), Some(5_000));
    }
}
