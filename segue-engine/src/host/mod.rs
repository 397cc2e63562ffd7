//! Host seam
//!
//! Everything the engine does not own itself (decoders, compositing
//! surfaces, recording sinks, the mixing graph, ephemeral playable
//! locations, the viewer's playback element, payload fetching) is reached
//! through the traits in this module. Engine logic never branches on
//! platform specifics; a host answers capability questions once through
//! [`HostCapabilities`].
//!
//! Two implementations ship with the crate:
//! - [`memory`]: an in-process software host for headless runs and tests
//! - [`fetch`]: payload fetching over HTTP(S) or from local files

pub mod fetch;
pub mod memory;

use crate::error::{AppendError, Result};
use crate::render::Placement;
use async_trait::async_trait;
use segue_common::ClipSource;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Host identifier of an audio stream exposed by a decode surface
pub type AudioSourceId = u64;

/// Host identifier of a node in an [`AudioGraph`]
pub type NodeId = u64;

/// Live, host-managed handle producing frames of one decoded clip
pub trait DecodeSurface: Send + Sync {
    /// Host identifier of this surface
    fn id(&self) -> u64;

    /// Intrinsic video size `(width, height)`
    fn natural_size(&self) -> (u32, u32);

    /// Duration reported by the decoder (seconds)
    fn duration_seconds(&self) -> f64;

    /// Audio stream of this clip, if it has one
    fn audio_source(&self) -> Option<AudioSourceId>;

    /// Release host decode resources
    fn release(&self) -> Result<()>;
}

/// Opens decode surfaces for clip sources
#[async_trait]
pub trait ClipDecoder: Send + Sync {
    /// Resolve once the clip is decode-ready
    async fn open(&self, source: &ClipSource) -> Result<Arc<dyn DecodeSurface>>;
}

/// Target frame that clips are composited onto
///
/// Draws at an opacity accumulate additively, so two draws whose opacities
/// sum to 1.0 composite to full brightness.
pub trait CompositingSurface: Send + Sync {
    /// Host identifier of this surface
    fn id(&self) -> u64;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Clear to black before composing a new frame
    fn clear(&self);

    /// Draw the frame of `surface` at `clip_time` seconds into `placement`
    fn draw(
        &self,
        surface: &dyn DecodeSurface,
        clip_time: f64,
        placement: Placement,
        opacity: f64,
    ) -> Result<()>;

    /// Release host compositing resources
    fn release(&self) -> Result<()>;
}

/// Parameters of a recording sink bound to a compositing surface
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Target bitrate in bits per second
    pub bitrate: u64,
    pub mime_type: String,
}

/// Host-managed encoder consuming composited frames
#[async_trait]
pub trait RecordingSink: Send + Sync {
    /// Container type the sink produces
    fn mime_type(&self) -> String;

    fn start(&self) -> Result<()>;

    /// Encode the surface's current contents as the frame at `timestamp`
    fn capture(&self, timestamp: Duration) -> Result<()>;

    /// Drain encoded fragments produced so far
    fn take_output(&self) -> Vec<Vec<u8>>;

    /// Flush the encoder and return the remaining fragments
    async fn stop(&self) -> Result<Vec<Vec<u8>>>;

    /// Stop without flushing; idempotent
    fn abort(&self);
}

/// Host mixing graph with sample-accurate gain automation
///
/// Times are seconds on the graph clock returned by [`AudioGraph::now`].
pub trait AudioGraph: Send + Sync {
    fn now(&self) -> f64;

    /// Final output node (feeds the recording sink or the speakers)
    fn destination(&self) -> NodeId;

    fn create_gain(&self, initial: f64) -> Result<NodeId>;

    fn create_media_source(&self, source: AudioSourceId) -> Result<NodeId>;

    fn connect(&self, from: NodeId, to: NodeId) -> Result<()>;

    /// Disconnect every output of `node`
    fn disconnect(&self, node: NodeId) -> Result<()>;

    fn set_value_at(&self, gain: NodeId, value: f64, at: f64) -> Result<()>;

    /// Ramp linearly from the previous automation point to `value` at `end`
    fn linear_ramp_to(&self, gain: NodeId, value: f64, end: f64) -> Result<()>;

    /// Drop automation scheduled at or after `from`
    fn cancel_scheduled(&self, gain: NodeId, from: f64) -> Result<()>;

    /// Release the mixing context
    fn close(&self) -> Result<()>;
}

/// Factory for ephemeral playable locations (blob-style URIs)
pub trait LocationProvider: Send + Sync {
    fn create(&self, bytes: &[u8], mime_type: &str) -> Result<String>;

    fn revoke(&self, location: &str) -> Result<()>;
}

/// Export-side host factories
pub trait MediaHost: Send + Sync {
    fn decoder(&self) -> Arc<dyn ClipDecoder>;

    fn create_surface(&self, width: u32, height: u32) -> Result<Arc<dyn CompositingSurface>>;

    fn recorder_supports(&self, mime_type: &str) -> bool;

    fn open_recorder(
        &self,
        surface: &Arc<dyn CompositingSurface>,
        config: &RecorderConfig,
    ) -> Result<Arc<dyn RecordingSink>>;

    fn create_audio_graph(&self) -> Result<Arc<dyn AudioGraph>>;

    fn locations(&self) -> Arc<dyn LocationProvider>;
}

/// Playback capabilities of the viewer's host
pub trait HostCapabilities: Send + Sync {
    /// Whether a segmented append buffer exists at all
    fn segmented_buffer_available(&self) -> bool;

    fn is_type_supported(&self, mime_type: &str) -> bool;

    /// Platform is known to misbehave with segmented playback
    fn known_unreliable(&self) -> bool;
}

/// Continuous sequence-mode buffer fed with encoded segments
///
/// Each appended segment's timeline continues from the previous one.
#[async_trait]
pub trait SegmentedBuffer: Send + Sync {
    /// Append one segment; resolves when the update completes
    async fn append(&self, bytes: &[u8]) -> std::result::Result<(), AppendError>;

    /// Remove buffered media in `[start, end)` seconds
    async fn remove(&self, start: f64, end: f64) -> std::result::Result<(), AppendError>;

    /// End of the buffered timeline (seconds)
    fn buffered_end(&self) -> f64;

    /// Signal that no more segments follow
    fn end_of_stream(&self) -> std::result::Result<(), AppendError>;

    /// Detach from the playback sink; idempotent
    fn detach(&self);
}

/// A segmented buffer attached to a playback sink
pub struct SegmentedAttachment {
    /// Ephemeral location the sink plays from
    pub location: String,
    pub buffer: Arc<dyn SegmentedBuffer>,
}

/// The viewer's playback element
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    /// Open a sequence-mode buffer of `mime_type` and attach it as the source
    fn open_segmented_buffer(&self, mime_type: &str) -> Result<SegmentedAttachment>;

    /// Revoke a location handed out by `open_segmented_buffer`
    fn release_location(&self, location: &str) -> Result<()>;

    /// Play a single clip directly (sequential fallback)
    fn set_source(&self, location: &str) -> Result<()>;

    /// Playback position (seconds)
    fn current_time(&self) -> f64;

    fn seek(&self, seconds: f64);

    async fn play(&self) -> Result<()>;

    fn pause(&self);

    fn is_ended(&self) -> bool;

    fn set_muted(&self, muted: bool);

    fn set_volume(&self, volume: f64);

    /// Drop the current source; idempotent
    fn detach(&self);
}

/// Fetches clip payloads for segmented playback
#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    /// Fetch the bytes at `location`, honoring `cancel` at every await point
    async fn fetch(&self, location: &str, cancel: &CancellationToken) -> Result<Vec<u8>>;
}
