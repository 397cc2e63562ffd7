//! Gapless playback over one sequence-mode segmented buffer
//!
//! Clip payloads are fetched with bounded concurrency but appended strictly
//! in source order, one append at a time. A poller derives the current clip
//! from the playback clock against the cumulative clip offsets.

use super::capability::{detect_capability, Capability};
use super::state::PlaybackState;
use crate::error::{AppendError, Error, Result};
use crate::host::{HostCapabilities, PayloadFetcher, PlaybackSink, SegmentedBuffer};
use crate::resources::{ResourceKind, ResourceRegistry};
use futures::stream::{self, StreamExt};
use segue_common::clip::validate_clips;
use segue_common::config::PlaybackConfig;
use segue_common::events::{EngineEvent, EventBus, GaplessPlaybackState, PlaybackStatus};
use segue_common::timing::ClipTimeline;
use segue_common::ClipSource;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decode-reported durations within this many seconds of the declared one
/// are treated as equal (one frame at 30 fps)
const DURATION_TOLERANCE_SECONDS: f64 = 1.0 / 30.0;

struct Session {
    sink: Arc<dyn PlaybackSink>,
    buffer: Arc<dyn SegmentedBuffer>,
    clips: Vec<ClipSource>,
}

struct Inner {
    session: Option<Session>,
    timeline: ClipTimeline,
    volume: f64,
    muted: bool,
}

/// Segmented-buffer playback engine
pub struct GaplessPlaybackEngine {
    config: PlaybackConfig,
    capabilities: Arc<dyn HostCapabilities>,
    fetcher: Arc<dyn PayloadFetcher>,
    state: Arc<PlaybackState>,
    inner: Arc<Mutex<Inner>>,
    registry: ResourceRegistry,
    cancel: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl GaplessPlaybackEngine {
    pub fn new(
        config: PlaybackConfig,
        capabilities: Arc<dyn HostCapabilities>,
        fetcher: Arc<dyn PayloadFetcher>,
        bus: EventBus,
    ) -> Self {
        let volume = config.initial_volume.clamp(0.0, 1.0);
        Self {
            config,
            capabilities,
            fetcher,
            state: Arc::new(PlaybackState::new(bus)),
            inner: Arc::new(Mutex::new(Inner {
                session: None,
                timeline: ClipTimeline::new(Vec::new()),
                volume,
                muted: false,
            })),
            registry: ResourceRegistry::new("gapless-playback"),
            cancel: CancellationToken::new(),
            poller: Mutex::new(None),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> watch::Receiver<GaplessPlaybackState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> GaplessPlaybackState {
        self.state.snapshot()
    }

    /// Resources held for the current session
    pub fn outstanding_resources(&self) -> usize {
        self.registry.outstanding()
    }

    /// Probe the host and attach a segmented buffer to `sink`
    ///
    /// Returns false when segmented playback is unavailable; the state then
    /// reports `using_fallback` and the caller switches to sequential
    /// playback. Never fails.
    pub fn initialize(&self, sink: Arc<dyn PlaybackSink>, clips: Vec<ClipSource>) -> bool {
        if self.state.status() != PlaybackStatus::Idle || self.cancel.is_cancelled() {
            warn!(status = %self.state.status(), "Gapless engine already initialized");
            return false;
        }
        self.state.set_status(PlaybackStatus::Initializing);

        if let Err(e) = validate_clips(&clips) {
            warn!(error = %e, "Rejected clip list");
            self.state.set_status(PlaybackStatus::Error);
            return false;
        }

        let timeline = ClipTimeline::from_clips(&clips);
        let total_clips = clips.len();
        self.state.update(|state| {
            state.total_clips = total_clips;
            state.total_duration_seconds = timeline.total_duration();
        });

        let format = match detect_capability(
            self.capabilities.as_ref(),
            &self.config.segment_mime_candidates,
        ) {
            Capability::Supported { format } => format,
            Capability::Unsupported { reason } => {
                self.engage_fallback(reason.to_string());
                return false;
            }
        };

        let attachment = match sink.open_segmented_buffer(&format) {
            Ok(attachment) => attachment,
            Err(e) => {
                self.engage_fallback(format!("cannot open segmented buffer: {}", e));
                return false;
            }
        };

        let release_sink = Arc::clone(&sink);
        let location = attachment.location.clone();
        self.registry.register(
            ResourceKind::PlayableLocation,
            attachment.location.clone(),
            move || release_sink.release_location(&location),
        );
        self.registry
            .register_segmented_buffer(Arc::clone(&attachment.buffer), format.clone());

        {
            let mut inner = self.inner();
            sink.set_volume(inner.volume);
            sink.set_muted(inner.muted);
            inner.timeline = timeline;
            inner.session = Some(Session {
                sink,
                buffer: attachment.buffer,
                clips,
            });
        }

        info!(format = %format, clips = total_clips, "Gapless playback initialized");
        self.state.set_status(PlaybackStatus::Loading);
        true
    }

    fn engage_fallback(&self, reason: String) {
        info!(reason = %reason, "Segmented playback unavailable, using fallback");
        self.state.update(|state| state.using_fallback = true);
        self.state.set_status(PlaybackStatus::Idle);
        self.state.emit(EngineEvent::FallbackEngaged {
            reason,
            timestamp: segue_common::time::now(),
        });
    }

    fn session_handles(&self) -> Result<(Arc<dyn PlaybackSink>, Arc<dyn SegmentedBuffer>, Vec<ClipSource>)> {
        let inner = self.inner();
        let session = inner
            .session
            .as_ref()
            .ok_or_else(|| Error::InvalidState("gapless engine is not initialized".to_string()))?;
        Ok((
            Arc::clone(&session.sink),
            Arc::clone(&session.buffer),
            session.clips.clone(),
        ))
    }

    /// Fetch every clip and append it in order, then end the stream
    pub async fn load_all(&self) -> Result<()> {
        if self.state.status() != PlaybackStatus::Loading {
            return Err(Error::InvalidState(format!(
                "cannot load while {}",
                self.state.status()
            )));
        }
        let (sink, buffer, clips) = self.session_handles()?;

        match self.fetch_and_append(&sink, &buffer, &clips).await {
            Ok(()) => {
                buffer.end_of_stream()?;
                self.state.set_status(PlaybackStatus::Ready);
                Ok(())
            }
            Err(_) if self.cancel.is_cancelled() => Err(Error::Cancelled),
            Err(e) => {
                warn!(error = %e, "Gapless load failed");
                self.state.set_status(PlaybackStatus::Error);
                Err(e)
            }
        }
    }

    async fn fetch_and_append(
        &self,
        sink: &Arc<dyn PlaybackSink>,
        buffer: &Arc<dyn SegmentedBuffer>,
        clips: &[ClipSource],
    ) -> Result<()> {
        let token = &self.cancel;
        let fetcher = &self.fetcher;
        let mut payloads = stream::iter(0..clips.len())
            .map(|index| async move {
                let clip = &clips[index];
                let bytes = fetcher.fetch(&clip.source_location, token).await;
                (index, bytes)
            })
            .buffered(self.config.fetch_concurrency.max(1));

        while let Some((index, bytes)) = payloads.next().await {
            let bytes = bytes?;
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let start = buffer.buffered_end();
            self.append_with_recovery(sink, buffer, &bytes).await?;
            let end = buffer.buffered_end();
            let appended = end - start;

            let (total, updated) = {
                let mut inner = self.inner();
                let declared = inner.timeline.duration_of(index).unwrap_or(0.0);
                let updated = (appended - declared).abs() > DURATION_TOLERANCE_SECONDS;
                if updated {
                    inner.timeline.update_duration(index, appended);
                }
                (inner.timeline.total_duration(), updated)
            };
            if updated {
                debug!(clip_index = index, duration = appended, "Using decode-reported duration");
            }

            self.state.update(|state| {
                state.clips_appended = index + 1;
                state.total_duration_seconds = total;
                state.buffered_percent = if total > 0.0 {
                    (end / total * 100.0).min(100.0)
                } else {
                    0.0
                };
            });
            debug!(clip_index = index, bytes = bytes.len(), buffered_end = end, "Segment appended");
            self.state.emit(EngineEvent::SegmentAppended {
                clip_index: index,
                bytes: bytes.len(),
                buffered_end_seconds: end,
                timestamp: segue_common::time::now(),
            });
        }
        Ok(())
    }

    /// Append once; on a quota-type rejection evict played data and retry once
    async fn append_with_recovery(
        &self,
        sink: &Arc<dyn PlaybackSink>,
        buffer: &Arc<dyn SegmentedBuffer>,
        bytes: &[u8],
    ) -> Result<()> {
        match buffer.append(bytes).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let evict_end = (sink.current_time() - self.config.evict_keep_behind_seconds).max(0.0);
                warn!(error = %e, evict_end, "Append rejected, evicting played data and retrying");
                if evict_end > 0.0 {
                    buffer.remove(0.0, evict_end).await?;
                }
                buffer.append(bytes).await.map_err(Error::from)
            }
            Err(AppendError::Detached) if self.cancel.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(e.into()),
        }
    }

    /// Start or resume playback
    pub async fn play(&self) -> Result<()> {
        let status = self.state.status();
        if !status.is_playable() {
            return Err(Error::InvalidState(format!("cannot play while {}", status)));
        }
        if status == PlaybackStatus::Playing {
            return Ok(());
        }
        let (sink, _, _) = self.session_handles()?;

        if status == PlaybackStatus::Ended {
            sink.seek(0.0);
            self.inner().timeline.reset();
        }
        sink.play().await?;
        self.state.set_status(PlaybackStatus::Playing);
        self.ensure_poller(sink);
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        if self.state.status() != PlaybackStatus::Playing {
            return Ok(());
        }
        let (sink, _, _) = self.session_handles()?;
        sink.pause();
        self.state.update(|state| state.current_time_seconds = sink.current_time());
        self.state.set_status(PlaybackStatus::Paused);
        Ok(())
    }

    /// Seek on the continuous timeline; clamped to `[0, total]`
    pub fn seek(&self, seconds: f64) -> Result<()> {
        let status = self.state.status();
        if !status.is_playable() {
            return Err(Error::InvalidState(format!("cannot seek while {}", status)));
        }
        let (sink, _, _) = self.session_handles()?;

        let (target, previous, crossed, index) = {
            let mut inner = self.inner();
            let total = inner.timeline.total_duration();
            let target = if seconds.is_finite() { seconds.clamp(0.0, total) } else { 0.0 };
            let previous = inner.timeline.current_index();
            let (crossed, index) = inner.timeline.check_boundary(target);
            (target, previous, crossed, index)
        };

        sink.seek(target);
        self.state.update(|state| state.current_time_seconds = target);
        if let (true, Some(previous), Some(index)) = (crossed, previous, index) {
            self.state.clip_changed(previous, index, target);
        } else if let Some(index) = index {
            self.state.update(|state| state.current_clip_index = index);
        }

        if status == PlaybackStatus::Ended && target < self.state.snapshot().total_duration_seconds {
            self.state.set_status(PlaybackStatus::Paused);
        }
        Ok(())
    }

    /// Seek to the cumulative start of clip `index`
    pub fn seek_to_clip(&self, index: usize) -> Result<()> {
        let start = self
            .inner()
            .timeline
            .start_of(index)
            .ok_or_else(|| Error::InvalidInput(format!("no clip at index {}", index)))?;
        self.seek(start)
    }

    pub fn set_muted(&self, muted: bool) {
        let mut inner = self.inner();
        inner.muted = muted;
        if let Some(session) = &inner.session {
            session.sink.set_muted(muted);
        }
    }

    /// Set output volume, clamped to `[0, 1]`
    pub fn set_volume(&self, volume: f64) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        let mut inner = self.inner();
        inner.volume = volume;
        if let Some(session) = &inner.session {
            session.sink.set_volume(volume);
        }
    }

    pub fn volume(&self) -> f64 {
        self.inner().volume
    }

    fn ensure_poller(&self, sink: Arc<dyn PlaybackSink>) {
        let mut poller = self.poller.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let state = Arc::clone(&self.state);
        let token = self.cancel.child_token();
        let period = self.config.poll_interval();

        *poller = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !poll_once(&inner, &state, sink.as_ref()) {
                            break;
                        }
                    }
                }
            }
            debug!("Playback poller stopped");
        }));
    }

    /// Abort fetches, stop the poller, detach the buffer and release its location
    ///
    /// Idempotent.
    pub fn destroy(&self) {
        self.cancel.cancel();
        if let Some(handle) = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            handle.abort();
        }

        let session = self.inner().session.take();
        let report = self.registry.dispose_all();
        if let Some(session) = session {
            session.sink.detach();
            info!(released = report.released, failed = report.failed, "Gapless playback destroyed");
        }
        self.state.set_status(PlaybackStatus::Idle);
    }
}

impl Drop for GaplessPlaybackEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One poller tick; returns false once playback has ended
fn poll_once(inner: &Mutex<Inner>, state: &PlaybackState, sink: &dyn PlaybackSink) -> bool {
    if state.status() != PlaybackStatus::Playing {
        return state.status() == PlaybackStatus::Paused;
    }

    let position = sink.current_time();
    let (previous, crossed, index, boundary_starts) = {
        let mut inner = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = inner.timeline.current_index();
        let (crossed, index) = inner.timeline.check_boundary(position);
        // Every boundary passed since the last tick, including clips shorter
        // than the poll interval
        let boundary_starts: Vec<f64> = match (crossed, previous, index) {
            (true, Some(previous), Some(index)) if index > previous => (previous + 1..=index)
                .map(|clip| inner.timeline.start_of(clip).unwrap_or(position))
                .collect(),
            _ => Vec::new(),
        };
        (previous, crossed, index, boundary_starts)
    };

    state.update(|s| s.current_time_seconds = position);
    match (crossed, previous, index) {
        (true, Some(previous), Some(index)) if index > previous => {
            debug!(previous, index, position, "Clip boundary crossed");
            for (clip, start) in (previous + 1..=index).zip(boundary_starts) {
                state.clip_changed(clip - 1, clip, start);
            }
        }
        (true, Some(previous), Some(index)) => {
            debug!(previous, index, position, "Playback moved back a clip");
            state.clip_changed(previous, index, position);
        }
        (_, _, Some(index)) => state.update(|s| s.current_clip_index = index),
        _ => {}
    }

    if sink.is_ended() {
        state.set_status(PlaybackStatus::Ended);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{MemoryCapabilities, MemoryFetcher, MemoryPlaybackSink};

    fn engine(fetcher: Arc<MemoryFetcher>) -> GaplessPlaybackEngine {
        GaplessPlaybackEngine::new(
            PlaybackConfig::default(),
            Arc::new(MemoryCapabilities::full()),
            fetcher,
            EventBus::new(256),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_rejects_empty_clips() {
        let engine = engine(Arc::new(MemoryFetcher::new()));
        assert!(!engine.initialize(Arc::new(MemoryPlaybackSink::new()), vec![]));
        assert_eq!(engine.state().status, PlaybackStatus::Error);
        assert!(!engine.state().using_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_appends_in_order() {
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert_clip("mem://a", 2.0, 64);
        fetcher.insert_clip("mem://b", 3.0, 64);
        // First clip arrives last but is still appended first
        fetcher.set_latency("mem://a", std::time::Duration::from_millis(200));

        let engine = engine(Arc::clone(&fetcher));
        let sink = Arc::new(MemoryPlaybackSink::new());
        let clips = vec![ClipSource::new("mem://a", 2.0), ClipSource::new("mem://b", 3.0)];
        assert!(engine.initialize(sink.clone(), clips));

        engine.load_all().await.unwrap();
        let state = engine.state();
        assert_eq!(state.status, PlaybackStatus::Ready);
        assert_eq!(state.clips_appended, 2);
        assert_eq!(state.buffered_percent, 100.0);
        assert_eq!(fetcher.completion_order(), vec!["mem://b", "mem://a"]);
        assert_eq!(sink.segmented_buffer().unwrap().buffered_end(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_requires_loaded_state() {
        let engine = engine(Arc::new(MemoryFetcher::new()));
        assert!(matches!(engine.play().await, Err(Error::InvalidState(_))));
        assert!(matches!(engine.seek(1.0), Err(Error::InvalidState(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_is_clamped() {
        let engine = engine(Arc::new(MemoryFetcher::new()));
        let sink = Arc::new(MemoryPlaybackSink::new());
        engine.initialize(sink.clone(), vec![ClipSource::new("mem://a", 1.0)]);

        engine.set_volume(3.0);
        assert_eq!(sink.volume(), 1.0);
        engine.set_volume(-1.0);
        assert_eq!(sink.volume(), 0.0);
        engine.set_muted(true);
        assert!(sink.is_muted());
    }
}
