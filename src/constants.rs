//! Constants.

use tokio::time::Duration;

/// Raw sample rate of the Opus stream sent to the platform.
pub const SAMPLE_RATE: usize = 48_000;

/// The rate of frames to be sent per second.
pub const AUDIO_FRAME_RATE: usize = 50;

/// Number of samples in one complete frame of audio per channel.
pub const MONO_FRAME_SIZE: usize = SAMPLE_RATE / AUDIO_FRAME_RATE;

/// Number of samples in one complete frame of stereo audio.
pub const STEREO_FRAME_SIZE: usize = MONO_FRAME_SIZE * 2;

/// Length of time between sent packets.
pub const TIMESTEP_LENGTH: Duration = Duration::from_millis(1000 / AUDIO_FRAME_RATE as u64);

/// Maximum size of an RTP voice packet.
pub const VOICE_PACKET_MAX: usize = 1460;

/// An Opus frame of pure silence.
pub const SILENCE_FRAME: &[u8] = &[0xf8, 0xff, 0xfe];

/// Default bitrate of the Opus encoder.
pub const DEFAULT_BITRATE: i32 = 128_000;

/// How long a player may sit in the arming phase before a
/// `TrackStuckEvent` is raised.
pub const PLAYER_STUCK_THRESHOLD: Duration = Duration::from_millis(10_000);

/// How long a voice connection may take to reach ready before it is
/// reported closed with code 4000.
pub const VOICE_CONNECT_THRESHOLD: Duration = Duration::from_millis(15_000);

/// How long a stored voice server state stays replayable.
pub const VOICE_STATE_TTL: Duration = Duration::from_secs(20);

/// Interval between `playerUpdate` frames for live queues.
pub const PLAYER_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between `stats` frames pushed to every client.
pub const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between keepalive pings on client sockets.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Default resume window when `configureResuming` gives no timeout.
pub const RESUME_TIMEOUT_DEFAULT: u64 = 60;

/// Age at which the cached soundcloud client id is refreshed.
pub const SOUNDCLOUD_KEY_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// File the soundcloud client id is cached in.
pub const SOUNDCLOUD_KEY_FILE: &str = "./soundcloud.txt";
