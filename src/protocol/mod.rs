//! Wire protocol shared with clients: track blobs, websocket frames and
//! filter configuration.

pub mod filters;
pub mod payload;
pub mod track;

pub use filters::{FilterChain, FilterSpec};
pub use payload::{EndReason, EventKind, InboundFrame, OutboundFrame};
pub use track::{Track, TrackInfo};
