//! In-process software host
//!
//! A complete [`MediaHost`] plus playback-side implementations that run
//! without any platform media stack:
//! - decode surfaces are solid-colour clips whose colour is derived from the
//!   source location
//! - the compositing surface keeps a draw list and evaluates it on demand
//! - the recorder emits one compact 16-byte record per captured frame,
//!   grouped into fragments
//! - the audio graph evaluates gain automation exactly
//! - the playback sink runs a virtual clock over a quota-bounded segmented
//!   buffer
//!
//! All timing uses `tokio::time`, so sessions are deterministic under a
//! paused clock. Fault injection hooks (decode failures, hangs, append
//! failures, encoder failures) exist for exercising recovery paths.

mod audio;
mod fetch;
mod media;
mod playback;

pub use audio::MemoryAudioGraph;
pub use fetch::MemoryFetcher;
pub use media::{
    decode_recording, FrameRecord, MemoryCanvas, MemoryDecodeSurface, MemoryRecorder,
    RecordingDigest, RECORDING_MIME,
};
pub use playback::{
    parse_segment_duration, segment_payload, MemoryCapabilities, MemoryPlaybackSink,
    MemorySegmentedBuffer, SEGMENT_MIME,
};

use crate::error::{Error, Result};
use crate::host::{
    AudioGraph, ClipDecoder, CompositingSurface, DecodeSurface, LocationProvider, MediaHost,
    RecorderConfig, RecordingSink,
};
use async_trait::async_trait;
use segue_common::ClipSource;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const DEFAULT_DECODE_LATENCY: Duration = Duration::from_millis(10);

/// Per-location decode behaviour
#[derive(Debug, Clone, Default)]
struct ClipBehavior {
    latency: Option<Duration>,
    fail_remaining: u32,
    hang: bool,
    reported_duration: Option<f64>,
    natural_size: Option<(u32, u32)>,
    silent: bool,
}

#[derive(Default)]
struct HostState {
    behaviors: HashMap<String, ClipBehavior>,
    decode_attempts: HashMap<String, u32>,
    decodes_in_flight: usize,
    max_decodes_in_flight: usize,
    /// Live decode surface id → colour
    live_surfaces: HashMap<u64, [u8; 4]>,
    live_canvases: HashSet<u64>,
    recorder_mime_types: Vec<String>,
    recorder_frames_per_fragment: u64,
    fail_recorder_stop: bool,
    canvases: HashMap<u64, Arc<MemoryCanvas>>,
    recorders: Vec<Arc<MemoryRecorder>>,
    audio_graphs: Vec<Arc<MemoryAudioGraph>>,
}

/// Shared state of a memory host and every object it created
pub(crate) struct HostShared {
    next_id: AtomicU64,
    state: Mutex<HostState>,
}

impl HostShared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn surface_color(&self, id: u64) -> Option<[u8; 4]> {
        self.state().live_surfaces.get(&id).copied()
    }

    pub(crate) fn release_surface(&self, id: u64) -> Result<()> {
        match self.state().live_surfaces.remove(&id) {
            Some(_) => Ok(()),
            None => Err(Error::Host(format!("decode surface {} released twice", id))),
        }
    }

    pub(crate) fn release_canvas(&self, id: u64) -> Result<()> {
        let mut state = self.state();
        state.canvases.remove(&id);
        if state.live_canvases.remove(&id) {
            Ok(())
        } else {
            Err(Error::Host(format!("compositing surface {} released twice", id)))
        }
    }
}

/// Solid colour of a clip, derived from its location
pub fn clip_color(location: &str) -> [u8; 4] {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    location.hash(&mut hasher);
    let h = hasher.finish().to_le_bytes();
    // Keep channels away from 0 so every clip is visible
    [h[0] | 0x20, h[1] | 0x20, h[2] | 0x20, 255]
}

/// Software media host
#[derive(Clone)]
pub struct MemoryHost {
    shared: Arc<HostShared>,
    locations: Arc<MemoryLocations>,
}

impl MemoryHost {
    pub fn new() -> Self {
        let state = HostState {
            recorder_mime_types: vec!["video/webm".to_string(), RECORDING_MIME.to_string()],
            recorder_frames_per_fragment: 10,
            ..HostState::default()
        };
        Self {
            shared: Arc::new(HostShared {
                next_id: AtomicU64::new(1),
                state: Mutex::new(state),
            }),
            locations: Arc::new(MemoryLocations::new()),
        }
    }

    fn behavior(&self, location: &str, f: impl FnOnce(&mut ClipBehavior)) {
        let mut state = self.shared.state();
        f(state.behaviors.entry(location.to_string()).or_default());
    }

    /// Delay before `location` becomes decode-ready
    pub fn set_decode_latency(&self, location: &str, latency: Duration) {
        self.behavior(location, |b| b.latency = Some(latency));
    }

    /// Fail the next `count` decodes of `location`
    pub fn fail_decodes(&self, location: &str, count: u32) {
        self.behavior(location, |b| b.fail_remaining = count);
    }

    /// Never signal decode-ready for `location`
    pub fn hang_decode(&self, location: &str) {
        self.behavior(location, |b| b.hang = true);
    }

    /// Duration the decoder reports instead of the declared one
    pub fn set_reported_duration(&self, location: &str, seconds: f64) {
        self.behavior(location, |b| b.reported_duration = Some(seconds));
    }

    pub fn set_natural_size(&self, location: &str, width: u32, height: u32) {
        self.behavior(location, |b| b.natural_size = Some((width, height)));
    }

    /// Clip has no audio stream
    pub fn set_silent(&self, location: &str) {
        self.behavior(location, |b| b.silent = true);
    }

    /// Container types the recorder accepts
    pub fn set_recorder_mime_types(&self, mime_types: Vec<String>) {
        self.shared.state().recorder_mime_types = mime_types;
    }

    /// Frames grouped into one recorder fragment
    pub fn set_frames_per_fragment(&self, frames: u64) {
        self.shared.state().recorder_frames_per_fragment = frames.max(1);
    }

    /// Make every recorder fail when stopped
    pub fn fail_recorder_stop(&self) {
        self.shared.state().fail_recorder_stop = true;
    }

    pub fn decode_attempts(&self, location: &str) -> u32 {
        self.shared
            .state()
            .decode_attempts
            .get(location)
            .copied()
            .unwrap_or(0)
    }

    pub fn max_concurrent_decodes(&self) -> usize {
        self.shared.state().max_decodes_in_flight
    }

    pub fn live_decode_surfaces(&self) -> usize {
        self.shared.state().live_surfaces.len()
    }

    pub fn live_compositing_surfaces(&self) -> usize {
        self.shared.state().live_canvases.len()
    }

    pub fn last_recorder(&self) -> Option<Arc<MemoryRecorder>> {
        self.shared.state().recorders.last().cloned()
    }

    pub fn last_audio_graph(&self) -> Option<Arc<MemoryAudioGraph>> {
        self.shared.state().audio_graphs.last().cloned()
    }

    pub fn memory_locations(&self) -> Arc<MemoryLocations> {
        Arc::clone(&self.locations)
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryDecoder {
    shared: Arc<HostShared>,
}

/// Decrements the in-flight decode count however the decode ends
struct InFlightGuard<'a> {
    shared: &'a HostShared,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        state.decodes_in_flight = state.decodes_in_flight.saturating_sub(1);
    }
}

#[async_trait]
impl ClipDecoder for MemoryDecoder {
    async fn open(&self, source: &ClipSource) -> Result<Arc<dyn DecodeSurface>> {
        let location = source.source_location.clone();
        let behavior = {
            let mut state = self.shared.state();
            *state.decode_attempts.entry(location.clone()).or_insert(0) += 1;
            state.decodes_in_flight += 1;
            state.max_decodes_in_flight = state.max_decodes_in_flight.max(state.decodes_in_flight);
            state.behaviors.get(&location).cloned().unwrap_or_default()
        };
        let _guard = InFlightGuard { shared: &self.shared };

        if behavior.hang {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(behavior.latency.unwrap_or(DEFAULT_DECODE_LATENCY)).await;

        if behavior.fail_remaining > 0 {
            let mut state = self.shared.state();
            if let Some(b) = state.behaviors.get_mut(&location) {
                b.fail_remaining -= 1;
            }
            return Err(Error::Host(format!("cannot decode {}", location)));
        }

        let id = self.shared.next_id();
        let color = clip_color(&location);
        self.shared.state().live_surfaces.insert(id, color);
        debug!(surface_id = id, location = %location, "Opened memory decode surface");

        let surface = MemoryDecodeSurface::new(
            id,
            Arc::clone(&self.shared),
            behavior.natural_size.unwrap_or((1920, 1080)),
            behavior.reported_duration.unwrap_or(source.duration_seconds),
            (!behavior.silent).then_some(id),
        );
        Ok(Arc::new(surface))
    }
}

impl MediaHost for MemoryHost {
    fn decoder(&self) -> Arc<dyn ClipDecoder> {
        Arc::new(MemoryDecoder {
            shared: Arc::clone(&self.shared),
        })
    }

    fn create_surface(&self, width: u32, height: u32) -> Result<Arc<dyn CompositingSurface>> {
        if width == 0 || height == 0 {
            return Err(Error::Host(format!("invalid surface size {}x{}", width, height)));
        }
        let id = self.shared.next_id();
        let canvas = Arc::new(MemoryCanvas::new(id, width, height, Arc::clone(&self.shared)));
        let mut state = self.shared.state();
        state.live_canvases.insert(id);
        state.canvases.insert(id, Arc::clone(&canvas));
        Ok(canvas)
    }

    fn recorder_supports(&self, mime_type: &str) -> bool {
        self.shared
            .state()
            .recorder_mime_types
            .iter()
            .any(|m| m == mime_type)
    }

    fn open_recorder(
        &self,
        surface: &Arc<dyn CompositingSurface>,
        config: &RecorderConfig,
    ) -> Result<Arc<dyn RecordingSink>> {
        if !self.recorder_supports(&config.mime_type) {
            return Err(Error::Sink(format!("unsupported recorder type {}", config.mime_type)));
        }
        let mut state = self.shared.state();
        let canvas = state
            .canvases
            .get(&surface.id())
            .cloned()
            .ok_or_else(|| Error::Sink("recorder target is not a live memory surface".to_string()))?;
        let recorder = Arc::new(MemoryRecorder::new(
            canvas,
            config.clone(),
            state.recorder_frames_per_fragment,
            state.fail_recorder_stop,
        ));
        state.recorders.push(Arc::clone(&recorder));
        Ok(recorder)
    }

    fn create_audio_graph(&self) -> Result<Arc<dyn AudioGraph>> {
        let graph = Arc::new(MemoryAudioGraph::new());
        self.shared.state().audio_graphs.push(Arc::clone(&graph));
        Ok(graph)
    }

    fn locations(&self) -> Arc<dyn LocationProvider> {
        self.locations.clone()
    }
}

/// Blob-style location registry
pub struct MemoryLocations {
    entries: Mutex<HashMap<String, (Vec<u8>, String)>>,
    created: AtomicU64,
    revoked: AtomicU64,
}

impl MemoryLocations {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
            revoked: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, (Vec<u8>, String)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bytes behind a live location
    pub fn get(&self, location: &str) -> Option<Vec<u8>> {
        self.entries().get(location).map(|(bytes, _)| bytes.clone())
    }

    pub fn mime_type(&self, location: &str) -> Option<String> {
        self.entries().get(location).map(|(_, mime)| mime.clone())
    }

    pub fn live_count(&self) -> usize {
        self.entries().len()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn revoked_count(&self) -> u64 {
        self.revoked.load(Ordering::Relaxed)
    }
}

impl Default for MemoryLocations {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationProvider for MemoryLocations {
    fn create(&self, bytes: &[u8], mime_type: &str) -> Result<String> {
        let location = format!("blob:segue/{}", uuid::Uuid::new_v4());
        self.entries()
            .insert(location.clone(), (bytes.to_vec(), mime_type.to_string()));
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(location)
    }

    fn revoke(&self, location: &str) -> Result<()> {
        match self.entries().remove(location) {
            Some(_) => {
                self.revoked.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::Host(format!("unknown location {}", location))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_decoder_tracks_surfaces() {
        let host = MemoryHost::new();
        host.set_natural_size("mem://a", 640, 480);
        let surface = host.decoder().open(&ClipSource::new("mem://a", 2.0)).await.unwrap();

        assert_eq!(surface.natural_size(), (640, 480));
        assert_eq!(surface.duration_seconds(), 2.0);
        assert!(surface.audio_source().is_some());
        assert_eq!(host.live_decode_surfaces(), 1);

        surface.release().unwrap();
        assert!(surface.release().is_err());
        assert_eq!(host.live_decode_surfaces(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_clip_has_no_audio() {
        let host = MemoryHost::new();
        host.set_silent("mem://quiet");
        let surface = host.decoder().open(&ClipSource::new("mem://quiet", 1.0)).await.unwrap();
        assert!(surface.audio_source().is_none());
    }

    #[test]
    fn test_locations_revoke_once() {
        let locations = MemoryLocations::new();
        let uri = locations.create(b"abc", "video/webm").unwrap();
        assert!(uri.starts_with("blob:segue/"));
        assert_eq!(locations.get(&uri).unwrap(), b"abc");
        assert_eq!(locations.mime_type(&uri).unwrap(), "video/webm");

        locations.revoke(&uri).unwrap();
        assert!(locations.revoke(&uri).is_err());
        assert_eq!(locations.live_count(), 0);
        assert_eq!(locations.revoked_count(), 1);
    }

    #[test]
    fn test_recorder_requires_supported_type() {
        let host = MemoryHost::new();
        let surface = host.create_surface(1280, 720).unwrap();
        let config = RecorderConfig {
            width: 1280,
            height: 720,
            fps: 30.0,
            bitrate: 5_000_000,
            mime_type: "video/x-unknown".to_string(),
        };
        assert!(host.open_recorder(&surface, &config).is_err());
        assert!(host.create_surface(0, 720).is_err());
    }

    #[test]
    fn test_clip_colors_are_stable_and_visible() {
        assert_eq!(clip_color("mem://a"), clip_color("mem://a"));
        let color = clip_color("mem://b");
        assert!(color[..3].iter().all(|c| *c >= 0x20));
    }
}
