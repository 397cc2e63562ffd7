//! Playback-side objects of the memory host: capability probe, a virtual-clock
//! playback sink and a quota-bounded sequence-mode segmented buffer
//!
//! Segment payloads carry their own duration in a 12-byte header
//! (`SGMT` + little-endian `f64` seconds), which stands in for the timing a
//! real demuxer would read from the container.

use super::MemoryLocations;
use crate::error::{AppendError, Error, Result};
use crate::host::{
    HostCapabilities, LocationProvider, PlaybackSink, SegmentedAttachment, SegmentedBuffer,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Segment container type accepted by the memory segmented buffer
pub const SEGMENT_MIME: &str = "video/mp4; codecs=\"avc1.42E01E, mp4a.40.2\"";

const SEGMENT_MAGIC: &[u8; 4] = b"SGMT";
const SEGMENT_HEADER_LEN: usize = 12;
const DEFAULT_QUOTA_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_APPEND_LATENCY: Duration = Duration::from_millis(20);

/// Build a segment payload of `duration_seconds` with `body_len` filler bytes
pub fn segment_payload(duration_seconds: f64, body_len: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SEGMENT_HEADER_LEN + body_len);
    bytes.extend_from_slice(SEGMENT_MAGIC);
    bytes.extend_from_slice(&duration_seconds.to_le_bytes());
    bytes.resize(SEGMENT_HEADER_LEN + body_len, 0xA5);
    bytes
}

/// Duration carried by a segment payload
pub fn parse_segment_duration(bytes: &[u8]) -> Option<f64> {
    if bytes.len() < SEGMENT_HEADER_LEN || &bytes[..4] != SEGMENT_MAGIC {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[4..SEGMENT_HEADER_LEN]);
    let duration = f64::from_le_bytes(buf);
    (duration.is_finite() && duration >= 0.0).then_some(duration)
}

/// Configurable capability probe
#[derive(Debug, Clone)]
pub struct MemoryCapabilities {
    pub segmented_buffer: bool,
    pub supported_types: Vec<String>,
    pub unreliable: bool,
}

impl MemoryCapabilities {
    /// Segmented playback of [`SEGMENT_MIME`] supported
    pub fn full() -> Self {
        Self {
            segmented_buffer: true,
            supported_types: vec![SEGMENT_MIME.to_string()],
            unreliable: false,
        }
    }

    /// No segmented buffer primitive at all
    pub fn without_segmented_buffer() -> Self {
        Self {
            segmented_buffer: false,
            supported_types: Vec::new(),
            unreliable: false,
        }
    }

    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.supported_types = types;
        self
    }

    pub fn unreliable(mut self) -> Self {
        self.unreliable = true;
        self
    }
}

impl HostCapabilities for MemoryCapabilities {
    fn segmented_buffer_available(&self) -> bool {
        self.segmented_buffer
    }

    fn is_type_supported(&self, mime_type: &str) -> bool {
        self.supported_types.iter().any(|t| t == mime_type)
    }

    fn known_unreliable(&self) -> bool {
        self.unreliable
    }
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    start: f64,
    end: f64,
    bytes: usize,
}

#[derive(Default)]
struct BufferState {
    segments: Vec<Segment>,
    end: f64,
    retained_bytes: usize,
    quota_bytes: usize,
    updating: bool,
    end_of_stream: bool,
    detached: bool,
    injected_failures: u32,
    appends: u32,
    removed: Vec<(f64, f64)>,
}

/// Quota-bounded sequence-mode buffer
pub struct MemorySegmentedBuffer {
    state: Mutex<BufferState>,
    append_latency: Duration,
}

impl MemorySegmentedBuffer {
    fn new(quota_bytes: usize, injected_failures: u32, append_latency: Duration) -> Self {
        Self {
            state: Mutex::new(BufferState {
                quota_bytes,
                injected_failures,
                ..BufferState::default()
            }),
            append_latency,
        }
    }

    fn state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Segments still holding data
    pub fn segment_count(&self) -> usize {
        self.state().segments.len()
    }

    pub fn retained_bytes(&self) -> usize {
        self.state().retained_bytes
    }

    /// Successful appends
    pub fn append_count(&self) -> u32 {
        self.state().appends
    }

    /// Ranges passed to `remove`
    pub fn removed_ranges(&self) -> Vec<(f64, f64)> {
        self.state().removed.clone()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.state().end_of_stream
    }

    pub fn is_detached(&self) -> bool {
        self.state().detached
    }
}

#[async_trait]
impl SegmentedBuffer for MemorySegmentedBuffer {
    async fn append(&self, bytes: &[u8]) -> std::result::Result<(), AppendError> {
        {
            let mut state = self.state();
            if state.detached {
                return Err(AppendError::Detached);
            }
            if state.updating {
                return Err(AppendError::InvalidState("buffer is still updating".to_string()));
            }
            if state.end_of_stream {
                return Err(AppendError::InvalidState("buffer has ended".to_string()));
            }
            if parse_segment_duration(bytes).is_none() {
                return Err(AppendError::Decode("missing segment header".to_string()));
            }
            if state.injected_failures > 0 {
                state.injected_failures -= 1;
                return Err(AppendError::InvalidState("append rejected".to_string()));
            }
            if state.retained_bytes + bytes.len() > state.quota_bytes {
                return Err(AppendError::QuotaExceeded);
            }
            state.updating = true;
        }

        tokio::time::sleep(self.append_latency).await;

        let mut state = self.state();
        state.updating = false;
        if state.detached {
            return Err(AppendError::Detached);
        }
        let duration = parse_segment_duration(bytes).unwrap_or(0.0);
        let start = state.end;
        state.segments.push(Segment {
            start,
            end: start + duration,
            bytes: bytes.len(),
        });
        state.end = start + duration;
        state.retained_bytes += bytes.len();
        state.appends += 1;
        Ok(())
    }

    async fn remove(&self, start: f64, end: f64) -> std::result::Result<(), AppendError> {
        {
            let mut state = self.state();
            if state.detached {
                return Err(AppendError::Detached);
            }
            if state.updating {
                return Err(AppendError::InvalidState("buffer is still updating".to_string()));
            }
            state.updating = true;
        }

        tokio::time::sleep(self.append_latency / 4).await;

        let mut state = self.state();
        state.updating = false;
        let mut freed = 0;
        state.segments.retain(|segment| {
            let evict = segment.start >= start && segment.end <= end;
            if evict {
                freed += segment.bytes;
            }
            !evict
        });
        state.retained_bytes -= freed;
        state.removed.push((start, end));
        Ok(())
    }

    fn buffered_end(&self) -> f64 {
        self.state().end
    }

    fn end_of_stream(&self) -> std::result::Result<(), AppendError> {
        let mut state = self.state();
        if state.detached {
            return Err(AppendError::Detached);
        }
        if state.updating {
            return Err(AppendError::InvalidState("buffer is still updating".to_string()));
        }
        state.end_of_stream = true;
        Ok(())
    }

    fn detach(&self) {
        self.state().detached = true;
    }
}

enum Source {
    None,
    Segmented {
        location: String,
        buffer: Arc<MemorySegmentedBuffer>,
    },
    Single {
        location: String,
        duration: f64,
    },
}

struct SinkState {
    source: Source,
    base: f64,
    playing_since: Option<Instant>,
    muted: bool,
    volume: f64,
    quota_bytes: usize,
    injected_append_failures: u32,
    reject_play: bool,
}

impl SinkState {
    fn media_end(&self) -> f64 {
        match &self.source {
            Source::None => 0.0,
            Source::Segmented { buffer, .. } => buffer.buffered_end(),
            Source::Single { duration, .. } => *duration,
        }
    }

    fn position(&self) -> f64 {
        let raw = match self.playing_since {
            Some(since) => self.base + since.elapsed().as_secs_f64(),
            None => self.base,
        };
        raw.min(self.media_end()).max(0.0)
    }

    fn media_complete(&self) -> bool {
        match &self.source {
            Source::None => false,
            Source::Segmented { buffer, .. } => buffer.is_end_of_stream(),
            Source::Single { .. } => true,
        }
    }
}

/// Virtual-clock playback element
pub struct MemoryPlaybackSink {
    state: Mutex<SinkState>,
    locations: Arc<MemoryLocations>,
    media: Mutex<HashMap<String, f64>>,
    append_latency: Duration,
}

impl MemoryPlaybackSink {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SinkState {
                source: Source::None,
                base: 0.0,
                playing_since: None,
                muted: false,
                volume: 1.0,
                quota_bytes: DEFAULT_QUOTA_BYTES,
                injected_append_failures: 0,
                reject_play: false,
            }),
            locations: Arc::new(MemoryLocations::new()),
            media: Mutex::new(HashMap::new()),
            append_latency: DEFAULT_APPEND_LATENCY,
        }
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Duration of a directly playable clip (sequential fallback)
    pub fn with_media(self, location: &str, duration: f64) -> Self {
        self.media
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(location.to_string(), duration);
        self
    }

    /// Byte quota of buffers opened from now on
    pub fn set_quota(&self, bytes: usize) {
        self.state().quota_bytes = bytes;
    }

    /// Reject the next `count` appends of buffers opened from now on
    pub fn inject_append_failures(&self, count: u32) {
        self.state().injected_append_failures = count;
    }

    /// Make `play()` fail, as a host blocking autoplay would
    pub fn reject_play(&self) {
        self.state().reject_play = true;
    }

    /// Buffer attached by the last `open_segmented_buffer`
    pub fn segmented_buffer(&self) -> Option<Arc<MemorySegmentedBuffer>> {
        match &self.state().source {
            Source::Segmented { buffer, .. } => Some(Arc::clone(buffer)),
            _ => None,
        }
    }

    /// Location currently playing
    pub fn current_source(&self) -> Option<String> {
        match &self.state().source {
            Source::None => None,
            Source::Segmented { location, .. } | Source::Single { location, .. } => {
                Some(location.clone())
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state().playing_since.is_some()
    }

    pub fn volume(&self) -> f64 {
        self.state().volume
    }

    pub fn is_muted(&self) -> bool {
        self.state().muted
    }

    pub fn live_locations(&self) -> usize {
        self.locations.live_count()
    }
}

impl Default for MemoryPlaybackSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlaybackSink for MemoryPlaybackSink {
    fn open_segmented_buffer(&self, mime_type: &str) -> Result<SegmentedAttachment> {
        if mime_type != SEGMENT_MIME {
            return Err(Error::Host(format!("unsupported segment type {}", mime_type)));
        }
        let mut state = self.state();
        let buffer = Arc::new(MemorySegmentedBuffer::new(
            state.quota_bytes,
            state.injected_append_failures,
            self.append_latency,
        ));
        let location = self.locations.create(&[], mime_type)?;
        state.source = Source::Segmented {
            location: location.clone(),
            buffer: Arc::clone(&buffer),
        };
        state.base = 0.0;
        state.playing_since = None;
        Ok(SegmentedAttachment { location, buffer })
    }

    fn release_location(&self, location: &str) -> Result<()> {
        self.locations.revoke(location)
    }

    fn set_source(&self, location: &str) -> Result<()> {
        let duration = self
            .media
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(location)
            .copied()
            .ok_or_else(|| Error::Host(format!("cannot load {}", location)))?;
        let mut state = self.state();
        state.source = Source::Single {
            location: location.to_string(),
            duration,
        };
        state.base = 0.0;
        state.playing_since = None;
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.state().position()
    }

    fn seek(&self, seconds: f64) {
        let mut state = self.state();
        let target = if seconds.is_finite() { seconds } else { 0.0 };
        state.base = target.clamp(0.0, state.media_end().max(0.0));
        if state.playing_since.is_some() {
            state.playing_since = Some(Instant::now());
        }
    }

    async fn play(&self) -> Result<()> {
        let mut state = self.state();
        if state.reject_play {
            return Err(Error::Host("playback was not allowed".to_string()));
        }
        if matches!(state.source, Source::None) {
            return Err(Error::InvalidState("no source attached".to_string()));
        }
        if state.playing_since.is_none() {
            state.playing_since = Some(Instant::now());
        }
        Ok(())
    }

    fn pause(&self) {
        let mut state = self.state();
        state.base = state.position();
        state.playing_since = None;
    }

    fn is_ended(&self) -> bool {
        let state = self.state();
        let end = state.media_end();
        end > 0.0 && state.media_complete() && state.position() >= end
    }

    fn set_muted(&self, muted: bool) {
        self.state().muted = muted;
    }

    fn set_volume(&self, volume: f64) {
        self.state().volume = volume;
    }

    fn detach(&self) {
        let mut state = self.state();
        state.base = state.position();
        state.playing_since = None;
        if let Source::Segmented { buffer, .. } = &state.source {
            buffer.detach();
        }
        state.source = Source::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_payload_header() {
        let payload = segment_payload(4.25, 100);
        assert_eq!(payload.len(), 112);
        assert_eq!(parse_segment_duration(&payload), Some(4.25));
        assert_eq!(parse_segment_duration(b"garbage bytes"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_mode_appends_continue_timeline() {
        let sink = MemoryPlaybackSink::new();
        let attachment = sink.open_segmented_buffer(SEGMENT_MIME).unwrap();
        let buffer = attachment.buffer;

        buffer.append(&segment_payload(4.0, 10)).await.unwrap();
        buffer.append(&segment_payload(6.0, 10)).await.unwrap();
        assert_eq!(buffer.buffered_end(), 10.0);
        assert_eq!(sink.live_locations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_append_is_rejected() {
        let sink = MemoryPlaybackSink::new();
        let buffer = sink.open_segmented_buffer(SEGMENT_MIME).unwrap().buffer;
        let first = segment_payload(1.0, 10);
        let second = segment_payload(1.0, 10);

        let (a, b) = tokio::join!(buffer.append(&first), buffer.append(&second));
        assert!(a.is_ok());
        assert!(matches!(b, Err(AppendError::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_and_eviction() {
        let sink = MemoryPlaybackSink::new();
        sink.set_quota(250);
        let buffer = sink.open_segmented_buffer(SEGMENT_MIME).unwrap().buffer;

        buffer.append(&segment_payload(2.0, 100)).await.unwrap();
        buffer.append(&segment_payload(2.0, 100)).await.unwrap();
        assert_eq!(
            buffer.append(&segment_payload(2.0, 100)).await,
            Err(AppendError::QuotaExceeded)
        );

        buffer.remove(0.0, 2.0).await.unwrap();
        buffer.append(&segment_payload(2.0, 100)).await.unwrap();
        assert_eq!(buffer.buffered_end(), 6.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_virtual_clock_plays_to_end() {
        let sink = MemoryPlaybackSink::new();
        let buffer = sink.open_segmented_buffer(SEGMENT_MIME).unwrap().buffer;
        buffer.append(&segment_payload(3.0, 10)).await.unwrap();
        buffer.end_of_stream().unwrap();

        sink.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!((sink.current_time() - 1.5).abs() < 1e-6);

        sink.pause();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!((sink.current_time() - 1.5).abs() < 1e-6);

        sink.seek(2.9);
        sink.play().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.current_time(), 3.0);
        assert!(sink.is_ended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_source_requires_known_media() {
        let sink = MemoryPlaybackSink::new().with_media("mem://a", 2.0);
        assert!(sink.set_source("mem://missing").is_err());
        sink.set_source("mem://a").unwrap();
        assert_eq!(sink.current_source().as_deref(), Some("mem://a"));
        sink.detach();
        assert!(sink.current_source().is_none());
        assert!(sink.play().await.is_err());
    }

    #[test]
    fn test_capabilities() {
        let caps = MemoryCapabilities::full();
        assert!(caps.segmented_buffer_available());
        assert!(caps.is_type_supported(SEGMENT_MIME));
        assert!(!caps.is_type_supported("video/webm"));
        assert!(MemoryCapabilities::full().unreliable().known_unreliable());
        assert!(!MemoryCapabilities::without_segmented_buffer().segmented_buffer_available());
    }
}
