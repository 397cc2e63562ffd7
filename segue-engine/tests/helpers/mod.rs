//! Test helpers for segue-engine integration tests
//!
//! Provides reusable fixtures built on the in-memory host:
//! - Export pipelines over a shared `MemoryHost`
//! - Gapless engines over a `MemoryFetcher` pre-loaded with segment payloads
//! - Event collection from the EventBus

#![allow(dead_code)]

use segue_common::config::{EngineConfig, PlaybackConfig};
use segue_common::events::{EngineEvent, EventBus};
use segue_common::ClipSource;
use segue_engine::export::ExportPipeline;
use segue_engine::host::memory::{MemoryCapabilities, MemoryFetcher, MemoryHost, MemoryPlaybackSink};
use segue_engine::GaplessPlaybackEngine;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Segment body size used by the playback fixtures
pub const SEGMENT_BODY_LEN: usize = 64;

/// Payload size of one fixture segment (header + body)
pub const SEGMENT_PAYLOAD_LEN: usize = 12 + SEGMENT_BODY_LEN;

/// Clip list from `(location, seconds)` pairs
pub fn clips(spec: &[(&str, f64)]) -> Vec<ClipSource> {
    spec.iter()
        .map(|(location, seconds)| ClipSource::new(*location, *seconds))
        .collect()
}

/// Export pipeline over `host` with a roomy event bus
pub fn export_pipeline(host: &MemoryHost, config: EngineConfig) -> (ExportPipeline, EventBus) {
    let bus = EventBus::new(4096);
    let pipeline = ExportPipeline::new(Arc::new(host.clone()), config, bus.clone());
    (pipeline, bus)
}

/// Fetcher serving a segment payload for every clip
pub fn fetcher_for(clips: &[ClipSource]) -> Arc<MemoryFetcher> {
    let fetcher = Arc::new(MemoryFetcher::new());
    for clip in clips {
        fetcher.insert_clip(&clip.source_location, clip.duration_seconds, SEGMENT_BODY_LEN);
    }
    fetcher
}

/// Sink that can also play every clip directly (sequential fallback)
pub fn sink_for(clips: &[ClipSource]) -> Arc<MemoryPlaybackSink> {
    let sink = clips.iter().fold(MemoryPlaybackSink::new(), |sink, clip| {
        sink.with_media(&clip.source_location, clip.duration_seconds)
    });
    Arc::new(sink)
}

/// Gapless engine with default playback settings
pub fn gapless_engine(
    capabilities: MemoryCapabilities,
    fetcher: Arc<MemoryFetcher>,
) -> (GaplessPlaybackEngine, EventBus) {
    let bus = EventBus::new(1024);
    let engine = GaplessPlaybackEngine::new(
        PlaybackConfig::default(),
        Arc::new(capabilities),
        fetcher,
        bus.clone(),
    );
    (engine, bus)
}

/// Drain every event currently queued on `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Number of events of one type
pub fn count_events(events: &[EngineEvent], event_type: &str) -> usize {
    events
        .iter()
        .filter(|event| event.event_type() == event_type)
        .count()
}

/// `(previous, current)` of every ClipChanged event, in order
pub fn clip_changes(events: &[EngineEvent]) -> Vec<(usize, usize)> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::ClipChanged {
                previous_index,
                current_index,
                ..
            } => Some((*previous_index, *current_index)),
            _ => None,
        })
        .collect()
}
