//! # Segue Engine Library (segue-engine)
//!
//! Gapless clip stitching: frame-exact export with cross-fades and
//! synchronized audio, and live gapless playback over a segmented buffer.
//!
//! **Architecture:** every externally owned facility (decoders, compositing
//! surfaces, recording sinks, mixing graph, playback element) sits behind the
//! [`host`] traits; every acquired handle is tracked by a
//! [`resources::ResourceRegistry`] and released exactly once.
//!
//! - [`export::ExportPipeline`]: preparing → rendering → finalizing
//! - [`playback::GaplessPlaybackEngine`] with [`playback::SequentialPlayer`]
//!   as the fallback

pub mod audio;
pub mod error;
pub mod export;
pub mod host;
pub mod playback;
pub mod render;
pub mod resources;

pub use error::{AppendError, Error, PreloadError, Result};
pub use export::{ExportCallbacks, ExportPipeline, ExportRequest};
pub use playback::{GaplessPlaybackEngine, SequentialPlayer};
pub use resources::ResourceRegistry;
