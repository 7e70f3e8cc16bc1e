//! A lightweight, protocol-compatible stand-in for the Lavalink audio
//! gateway: clients speak the usual websocket/REST surface, and playback is
//! spread across a pool of workers that drive source → ffmpeg → Opus → UDP
//! pipelines per voice room.

pub mod audio;
pub mod config;
pub mod constants;
pub mod gateway;
pub mod pool;
pub mod protocol;
pub mod sources;
pub mod voice;

pub use config::Config;
pub use gateway::Gateway;
