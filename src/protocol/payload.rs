//! Client websocket frames.
//!
//! Inbound frames are discriminated by their `op` string; outbound frames are
//! `stats`, `playerUpdate` and `event`.

use serde::{Deserialize, Serialize};

use super::filters::FilterSpec;

/// A control frame received from a client.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum InboundFrame {
    Play(PlayRequest),
    Stop {
        #[serde(rename = "guildId")]
        guild_id: String,
    },
    Pause {
        #[serde(rename = "guildId")]
        guild_id: String,
        pause: bool,
    },
    Seek {
        #[serde(rename = "guildId")]
        guild_id: String,
        position: u64,
    },
    Volume {
        #[serde(rename = "guildId")]
        guild_id: String,
        volume: u32,
    },
    Filters {
        #[serde(rename = "guildId")]
        guild_id: String,
        #[serde(flatten)]
        spec: FilterSpec,
    },
    Ffmpeg {
        #[serde(rename = "guildId")]
        guild_id: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Destroy {
        #[serde(rename = "guildId")]
        guild_id: String,
    },
    VoiceUpdate(VoiceUpdate),
    ConfigureResuming {
        key: Option<String>,
        timeout: Option<u64>,
    },
    Dump,
}

/// The `play` op payload.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayRequest {
    pub guild_id: String,
    pub track: String,
    #[serde(default)]
    pub start_time: Option<u64>,
    #[serde(default)]
    pub end_time: Option<u64>,
    /// Volume override, 0..=1000.
    #[serde(default)]
    pub volume: Option<u32>,
    #[serde(default)]
    pub pause: bool,
    #[serde(default)]
    pub no_replace: bool,
}

/// The `voiceUpdate` op payload: the session id the client observed plus the
/// raw voice server update it received from the platform.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceUpdate {
    pub guild_id: String,
    pub session_id: String,
    pub event: VoiceServerEvent,
}

/// Raw `VOICE_SERVER_UPDATE` payload, snake-cased like the platform sends it.
#[derive(Clone, Debug, Deserialize)]
pub struct VoiceServerEvent {
    pub token: String,
    #[serde(default)]
    pub guild_id: Option<String>,
    pub endpoint: Option<String>,
}

/// A frame pushed to a client.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutboundFrame {
    Stats(StatsFrame),
    PlayerUpdate {
        #[serde(rename = "guildId")]
        guild_id: String,
        state: PlayerUpdateState,
    },
    Event {
        #[serde(rename = "guildId")]
        guild_id: String,
        #[serde(flatten)]
        event: EventKind,
    },
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct PlayerUpdateState {
    /// Wall-clock unix time, milliseconds.
    pub time: u64,
    /// Track position, milliseconds.
    pub position: u64,
    pub connected: bool,
}

/// Playback events, discriminated by their `type` string.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum EventKind {
    TrackStartEvent {
        track: String,
    },
    TrackEndEvent {
        track: String,
        reason: EndReason,
    },
    TrackExceptionEvent {
        track: String,
        error: String,
        exception: Exception,
    },
    TrackStuckEvent {
        track: String,
        #[serde(rename = "thresholdMs")]
        threshold_ms: u64,
    },
    WebSocketClosedEvent {
        code: u16,
        reason: String,
        #[serde(rename = "byRemote")]
        by_remote: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

#[derive(Clone, Debug, Serialize)]
pub struct Exception {
    pub message: String,
    pub severity: Severity,
    pub cause: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Common,
    Suspicious,
    Fault,
}

/// The server-wide `stats` frame.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsFrame {
    pub players: usize,
    pub playing_players: usize,
    /// Milliseconds since the server started.
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub frame_stats: FrameStats,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: usize,
    pub system_load: f64,
    pub lavalink_load: f64,
}

/// The platform library kept frame counters; this server does not, but the
/// shape is part of the protocol.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct FrameStats {
    pub sent: u64,
    pub nulled: u64,
    pub deficit: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"op":"play","guildId":"100","track":"abc","noReplace":true}"#,
        )
        .unwrap();

        match frame {
            InboundFrame::Play(play) => {
                assert_eq!(play.guild_id, "100");
                assert_eq!(play.track, "abc");
                assert!(play.no_replace);
                assert!(!play.pause);
                assert_eq!(play.start_time, None);
            }
            other => panic!("wrong frame: {:?}", other),
        }
    }

    #[test]
    fn parses_voice_update() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"op":"voiceUpdate","guildId":"100","sessionId":"s","event":{"token":"t","guild_id":"100","endpoint":"e"}}"#,
        )
        .unwrap();

        match frame {
            InboundFrame::VoiceUpdate(update) => {
                assert_eq!(update.session_id, "s");
                assert_eq!(update.event.endpoint.as_deref(), Some("e"));
            }
            other => panic!("wrong frame: {:?}", other),
        }
    }

    #[test]
    fn parses_filters_with_flattened_spec() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"op":"filters","guildId":"100","timescale":{"speed":2.0}}"#,
        )
        .unwrap();

        match frame {
            InboundFrame::Filters { guild_id, spec } => {
                assert_eq!(guild_id, "100");
                assert_eq!(spec.playback_rate(), 2.0);
            }
            other => panic!("wrong frame: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_op() {
        assert!(serde_json::from_str::<InboundFrame>(r#"{"op":"polka"}"#).is_err());
    }

    #[test]
    fn event_frame_shape() {
        let frame = OutboundFrame::Event {
            guild_id: String::from("100"),
            event: EventKind::TrackEndEvent {
                track: String::from("abc"),
                reason: EndReason::Finished,
            },
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();

        assert_eq!(json["op"], "event");
        assert_eq!(json["type"], "TrackEndEvent");
        assert_eq!(json["guildId"], "100");
        assert_eq!(json["reason"], "FINISHED");
    }

    #[test]
    fn player_update_shape() {
        let frame = OutboundFrame::PlayerUpdate {
            guild_id: String::from("100"),
            state: PlayerUpdateState {
                time: 1,
                position: 2,
                connected: true,
            },
        };

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();

        assert_eq!(json["op"], "playerUpdate");
        assert_eq!(json["state"]["position"], 2);
    }
}
