//! Live playback paths
//!
//! [`GaplessPlaybackEngine`] presents the clip sequence through one
//! segmented buffer. When the host cannot do that, `initialize` returns
//! false and the caller drives a [`SequentialPlayer`] instead.

pub mod capability;
pub mod gapless;
pub mod sequential;
pub mod state;

pub use capability::{detect_capability, Capability, UnsupportedReason};
pub use gapless::GaplessPlaybackEngine;
pub use sequential::SequentialPlayer;
pub use state::PlaybackState;
