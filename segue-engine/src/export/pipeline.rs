//! Export pipeline: re-renders a clip sequence into one artifact
//!
//! One export runs at a time per pipeline. Each export owns a session
//! [`ResourceRegistry`] holding every intermediate handle (compositing
//! surface, recording sink, mixing context, decode surfaces); it is
//! disposed on every exit path. Artifact locations outlive the session and
//! live in the pipeline's own registry until `release_artifact` or
//! `dispose`.

use super::state::ExportSession;
use crate::audio::AudioSyncController;
use crate::error::{Error, Result};
use crate::host::{
    AudioGraph, AudioSourceId, CompositingSurface, MediaHost, RecorderConfig, RecordingSink,
};
use crate::render::double_buffer::preload_all;
use crate::render::{
    fit_rect, ChunkedOutputManager, DecodedClipHandle, DoubleBufferManager, FrameTick,
    FrameTimer, PreloadOptions,
};
use crate::resources::{ResourceId, ResourceRegistry};
use segue_common::clip::validate_clips;
use segue_common::config::EngineConfig;
use segue_common::events::{EngineEvent, EventBus, ExportStatus, RenderingState};
use segue_common::timing::{frame_interval, frames_to_seconds, ClipTimeline};
use segue_common::{ClipSource, ExportArtifact, QualitySpec, QualityTier, TransitionWindow};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Parameters of one export
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub quality_tier: QualityTier,
    pub clips: Vec<ClipSource>,
}

impl ExportRequest {
    pub fn new(quality_tier: QualityTier, clips: Vec<ClipSource>) -> Self {
        Self {
            quality_tier,
            clips,
        }
    }
}

pub type ProgressCallback = Box<dyn Fn(&RenderingState) + Send + Sync>;
pub type CompleteCallback = Box<dyn FnOnce(&ExportArtifact) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(&Error) + Send>;

/// Callback-style observers for [`ExportPipeline::export_with_callbacks`]
#[derive(Default)]
pub struct ExportCallbacks {
    pub on_progress: Option<ProgressCallback>,
    pub on_complete: Option<CompleteCallback>,
    pub on_error: Option<ErrorCallback>,
}

/// Clears the pipeline's active token however the export future ends
struct ActiveGuard<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

/// Handles acquired while preparing, shared by rendering and finalizing
struct Prepared {
    surface: Arc<dyn CompositingSurface>,
    recorder: Arc<dyn RecordingSink>,
    graph: Arc<dyn AudioGraph>,
    mime_type: String,
    spec: QualitySpec,
}

/// Position of the render loop
#[derive(Debug, Default)]
struct RenderCursor {
    clip: usize,
    /// Next global frame to composite
    frame: u64,
    crossfade_started: bool,
    failure: Option<Error>,
}

/// Export orchestrator
///
/// ```no_run
/// # async fn run() -> segue_engine::Result<()> {
/// use segue_engine::export::{ExportPipeline, ExportRequest};
/// use segue_engine::host::memory::MemoryHost;
/// use segue_common::config::EngineConfig;
/// use segue_common::events::EventBus;
/// use segue_common::{ClipSource, QualityTier};
/// use std::sync::Arc;
///
/// let pipeline = ExportPipeline::new(
///     Arc::new(MemoryHost::new()),
///     EngineConfig::default(),
///     EventBus::default(),
/// );
/// let clips = vec![ClipSource::new("mem://a", 4.0), ClipSource::new("mem://b", 6.0)];
/// let artifact = pipeline.export(ExportRequest::new(QualityTier::Hd1080, clips)).await?;
/// println!("{} bytes", artifact.size_bytes);
/// # Ok(())
/// # }
/// ```
pub struct ExportPipeline {
    host: Arc<dyn MediaHost>,
    config: EngineConfig,
    bus: EventBus,
    state_tx: Arc<watch::Sender<RenderingState>>,
    artifacts: Arc<ResourceRegistry>,
    artifact_ids: Mutex<HashMap<String, ResourceId>>,
    active: Mutex<Option<CancellationToken>>,
    last_session: Mutex<Option<Arc<ResourceRegistry>>>,
}

impl ExportPipeline {
    pub fn new(host: Arc<dyn MediaHost>, config: EngineConfig, bus: EventBus) -> Self {
        let (state_tx, _) = watch::channel(RenderingState::default());
        Self {
            host,
            config,
            bus,
            state_tx: Arc::new(state_tx),
            artifacts: Arc::new(ResourceRegistry::new("export-artifacts")),
            artifact_ids: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            last_session: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Observe `RenderingState` snapshots
    pub fn subscribe(&self) -> watch::Receiver<RenderingState> {
        self.state_tx.subscribe()
    }

    /// Latest snapshot
    pub fn state(&self) -> RenderingState {
        self.state_tx.borrow().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.active().is_some()
    }

    /// Request cooperative cancellation of the running export
    ///
    /// Returns false when no export is running.
    pub fn cancel(&self) -> bool {
        match self.active().as_ref() {
            Some(token) => {
                info!("Export cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Resources still held by the most recent export session
    pub fn outstanding_session_resources(&self) -> usize {
        self.last_session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|registry| registry.outstanding())
            .unwrap_or(0)
    }

    /// Artifact locations not yet released
    pub fn outstanding_artifacts(&self) -> usize {
        self.artifacts.outstanding()
    }

    /// Revoke an artifact's playable location
    ///
    /// Returns `Ok(false)` for unknown or already released locations.
    pub fn release_artifact(&self, location: &str) -> Result<bool> {
        let id = self
            .artifact_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(location);
        match id {
            Some(id) => self.artifacts.release(id),
            None => Ok(false),
        }
    }

    /// Cancel any running export and release every artifact location
    pub fn dispose(&self) {
        self.cancel();
        self.artifact_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        let report = self.artifacts.dispose_all();
        debug!(released = report.released, failed = report.failed, "Export pipeline disposed");
    }

    /// Run one export to its terminal state
    pub async fn export(&self, request: ExportRequest) -> Result<ExportArtifact> {
        let token = {
            let mut active = self.active();
            if active.is_some() {
                return Err(Error::InvalidState("an export is already running".to_string()));
            }
            let token = CancellationToken::new();
            *active = Some(token.clone());
            token
        };
        let _guard = ActiveGuard { slot: &self.active };

        let registry = Arc::new(ResourceRegistry::new("export-session"));
        *self
            .last_session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(&registry));

        let mut session = ExportSession::new(
            request.quality_tier,
            request.clips.len(),
            Arc::clone(&self.state_tx),
            self.bus.clone(),
        );
        info!(
            session_id = %session.session_id(),
            quality_tier = %request.quality_tier,
            clips = request.clips.len(),
            "Starting export"
        );

        let result = self.run(&request, &mut session, &registry, &token).await;

        let terminal = match &result {
            Ok(_) => (ExportStatus::Complete, "Export complete".to_string()),
            Err(e) if e.is_cancelled() => (ExportStatus::Cancelled, "Export cancelled".to_string()),
            Err(e) => (ExportStatus::Error, e.to_string()),
        };
        if let Err(e) = session.transition_to(terminal.0, terminal.1) {
            warn!(error = %e, "Could not record terminal export status");
        }

        match &result {
            Ok(artifact) => {
                info!(
                    session_id = %session.session_id(),
                    size_bytes = artifact.size_bytes,
                    duration = artifact.total_duration_seconds,
                    frames = artifact.frame_count,
                    "Export complete"
                );
                session.emit(EngineEvent::ExportCompleted {
                    session_id: session.session_id(),
                    quality_tier: artifact.quality_tier,
                    total_duration_seconds: artifact.total_duration_seconds,
                    size_bytes: artifact.size_bytes,
                    timestamp: segue_common::time::now(),
                });
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                error!(session_id = %session.session_id(), error = %e, "Export failed");
                session.emit(EngineEvent::ExportFailed {
                    session_id: session.session_id(),
                    error: e.to_string(),
                    timestamp: segue_common::time::now(),
                });
            }
        }

        let report = registry.dispose_all();
        debug!(
            released = report.released,
            failed = report.failed,
            "Export session resources disposed"
        );
        result
    }

    /// Run an export, reporting through callbacks as well as the result
    pub async fn export_with_callbacks(
        &self,
        request: ExportRequest,
        callbacks: ExportCallbacks,
    ) -> Result<ExportArtifact> {
        let ExportCallbacks {
            on_progress,
            on_complete,
            on_error,
        } = callbacks;
        let mut rx = self.subscribe();
        rx.borrow_and_update();

        let forward = async {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                if let Some(cb) = &on_progress {
                    cb(&snapshot);
                }
            }
        };

        let result = tokio::select! {
            result = self.export(request) => result,
            _ = forward => Err(Error::InvalidState("progress channel closed".to_string())),
        };

        if let Some(cb) = &on_progress {
            cb(&self.state());
        }
        match &result {
            Ok(artifact) => {
                if let Some(cb) = on_complete {
                    cb(artifact);
                }
            }
            Err(e) => {
                if let Some(cb) = on_error {
                    cb(e);
                }
            }
        }
        result
    }

    async fn run(
        &self,
        request: &ExportRequest,
        session: &mut ExportSession,
        registry: &Arc<ResourceRegistry>,
        token: &CancellationToken,
    ) -> Result<ExportArtifact> {
        session.transition_to(ExportStatus::Preparing, "Preparing export")?;
        validate_clips(&request.clips)?;

        let prepared = self.prepare(request.quality_tier, registry)?;
        session.update_preparing(0.2, "Preloading clips");

        let mut audio = AudioSyncController::new(Arc::clone(&prepared.graph), Arc::clone(registry))?;
        let export = &self.config.export;
        let buffers = DoubleBufferManager::new(
            self.host.decoder(),
            Arc::clone(registry),
            PreloadOptions {
                timeout: export.preload_timeout(),
                retries: export.preload_retries,
            },
        );
        let mut chunks = ChunkedOutputManager::new(export.chunk_ceiling);

        let outcome = self
            .render_and_finalize(request, session, &prepared, &buffers, &mut audio, &mut chunks, token)
            .await;

        prepared.recorder.abort();
        chunks.dispose();
        audio.dispose();
        buffers.dispose();
        outcome
    }

    fn prepare(&self, tier: QualityTier, registry: &ResourceRegistry) -> Result<Prepared> {
        let export = &self.config.export;
        let spec = self.config.quality.spec(tier);

        let surface = self.host.create_surface(spec.width, spec.height)?;
        registry.register_compositing_surface(Arc::clone(&surface));

        let mime_type = export
            .recorder_mime_candidates
            .iter()
            .find(|m| self.host.recorder_supports(m))
            .cloned()
            .ok_or_else(|| Error::Sink("no supported recording format".to_string()))?;

        let recorder = self.host.open_recorder(
            &surface,
            &RecorderConfig {
                width: spec.width,
                height: spec.height,
                fps: export.encode_fps,
                bitrate: spec.bitrate,
                mime_type: mime_type.clone(),
            },
        )?;
        registry.register_recording_sink(Arc::clone(&recorder));

        let graph = self.host.create_audio_graph()?;
        debug!(
            width = spec.width,
            height = spec.height,
            bitrate = spec.bitrate,
            mime_type = %mime_type,
            "Export surface and recorder ready"
        );

        Ok(Prepared {
            surface,
            recorder,
            graph,
            mime_type,
            spec,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn render_and_finalize(
        &self,
        request: &ExportRequest,
        session: &mut ExportSession,
        prepared: &Prepared,
        buffers: &DoubleBufferManager,
        audio: &mut AudioSyncController,
        chunks: &mut ChunkedOutputManager,
        token: &CancellationToken,
    ) -> Result<ExportArtifact> {
        let export = &self.config.export;
        let fps = export.encode_fps;

        let infos = preload_all(buffers, &request.clips, export.preload_concurrency).await?;
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Decode-reported durations drive scheduling
        let timeline = ClipTimeline::new(infos.iter().map(|info| info.duration).collect());
        let total_frames = timeline.total_frames(fps);
        debug!(
            total_duration = timeline.total_duration(),
            total_frames,
            "Clip timeline built"
        );

        prepared.recorder.start()?;
        session.transition_to(ExportStatus::Rendering, "Rendering clip 1")?;

        stage_clip(buffers, 0)?;
        buffers.swap();
        audio.connect_outgoing(slot_audio(buffers, Slot::Active))?;
        if timeline.len() > 1 {
            stage_clip(buffers, 1)?;
            audio.connect_incoming(slot_audio(buffers, Slot::Standby))?;
        }

        let timer = FrameTimer::with_stop_token(export.display_refresh_hz, token.child_token());
        let budget = frame_interval(fps);
        let mut cursor = RenderCursor::default();

        let stats = timer
            .start(fps, |tick| {
                if token.is_cancelled() || cursor.frame >= total_frames {
                    return false;
                }
                let step = self.render_step(
                    &mut cursor,
                    &timeline,
                    tick,
                    budget,
                    session,
                    prepared,
                    buffers,
                    audio,
                    chunks,
                );
                if let Err(e) = step {
                    cursor.failure = Some(e);
                    return false;
                }
                cursor.frame < total_frames
            })
            .await;

        debug!(
            invocations = stats.invocations,
            ticks = stats.ticks,
            stopped = stats.stopped,
            "Frame loop finished"
        );

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(e) = cursor.failure {
            return Err(e);
        }
        if cursor.frame < total_frames {
            return Err(Error::InvalidState(format!(
                "frame loop ended after {} of {} frames",
                cursor.frame, total_frames
            )));
        }

        session.transition_to(ExportStatus::Finalizing, "Finalizing output")?;
        for fragment in prepared.recorder.stop().await? {
            chunks.add_chunk(fragment);
        }
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bytes = chunks.finalize()?;
        let locations = self.host.locations();
        let location = locations.create(&bytes, &prepared.mime_type)?;
        let id = self.artifacts.register_location(locations, location.clone());
        self.artifact_ids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(location.clone(), id);

        Ok(ExportArtifact {
            size_bytes: bytes.len() as u64,
            bytes,
            playable_location: location,
            total_duration_seconds: frames_to_seconds(cursor.frame, fps),
            quality_tier: request.quality_tier,
            mime_type: prepared.mime_type.clone(),
            frame_count: cursor.frame,
        })
    }

    /// Composite, capture and account one frame
    #[allow(clippy::too_many_arguments)]
    fn render_step(
        &self,
        cursor: &mut RenderCursor,
        timeline: &ClipTimeline,
        tick: FrameTick,
        budget: Duration,
        session: &mut ExportSession,
        prepared: &Prepared,
        buffers: &DoubleBufferManager,
        audio: &mut AudioSyncController,
        chunks: &mut ChunkedOutputManager,
    ) -> Result<()> {
        let export = &self.config.export;
        let fps = export.encode_fps;
        let global = cursor.frame;

        while cursor.clip + 1 < timeline.len() && global >= timeline.frame_span(cursor.clip, fps).1 {
            self.advance_clip(cursor, timeline, buffers, audio)?;
        }

        let clip = cursor.clip;
        let (_, span_end) = timeline.frame_span(clip, fps);
        let start = timeline.start_of(clip).unwrap_or(0.0);
        let duration = timeline.duration_of(clip).unwrap_or(0.0);
        let clip_time = (frames_to_seconds(global, fps) - start).max(0.0);
        let now_ms = clip_time * 1000.0;

        let has_next = clip + 1 < timeline.len();
        let window = TransitionWindow::at_clip_tail(duration * 1000.0, export.transition_window_ms);
        // The last frame of a clip always blends so no boundary is a hard cut
        let in_window = has_next && (window.contains(now_ms) || global + 1 == span_end);

        let surface = &prepared.surface;
        let target = prepared.spec;
        surface.clear();
        let blended = buffers.with_slots(|active, standby| -> Result<bool> {
            let active = active.ok_or_else(|| {
                Error::InvalidState(format!("clip {} is not in the active slot", clip))
            })?;
            let active_rect = placement_for(active, target);

            match standby.filter(|_| in_window) {
                Some(standby) => {
                    let opacity = window.opacity_at(now_ms, export.easing);
                    surface.draw(
                        active.surface.as_ref(),
                        clip_time,
                        active_rect,
                        opacity.pair.outgoing,
                    )?;
                    // Incoming clip holds its first frame until the swap
                    surface.draw(
                        standby.surface.as_ref(),
                        0.0,
                        placement_for(standby, target),
                        opacity.pair.incoming,
                    )?;
                    Ok(true)
                }
                None => {
                    surface.draw(active.surface.as_ref(), clip_time, active_rect, 1.0)?;
                    Ok(false)
                }
            }
        })?;

        if blended && !cursor.crossfade_started {
            cursor.crossfade_started = true;
            // Anchor the audio ramp to the visual window start
            let lag = ((now_ms - window.start_ms).max(0.0)) / 1000.0;
            let at = prepared.graph.now() - lag;
            audio.crossfade(window.duration_ms, Some(at))?;
            debug!(
                outgoing = clip,
                incoming = clip + 1,
                window_ms = window.duration_ms,
                "Crossfade started"
            );
            session.emit(EngineEvent::CrossfadeStarted {
                session_id: session.session_id(),
                outgoing_index: clip,
                incoming_index: clip + 1,
                window_ms: window.duration_ms,
                timestamp: segue_common::time::now(),
            });
        }

        prepared
            .recorder
            .capture(Duration::from_secs_f64(frames_to_seconds(global, fps)))?;
        for fragment in prepared.recorder.take_output() {
            chunks.add_chunk(fragment);
        }

        cursor.frame += 1;
        session.record_frame(cursor.frame, timeline.total_frames(fps), clip, tick.delta, budget);
        Ok(())
    }

    /// Promote the standby clip and stage the one after it
    fn advance_clip(
        &self,
        cursor: &mut RenderCursor,
        timeline: &ClipTimeline,
        buffers: &DoubleBufferManager,
        audio: &mut AudioSyncController,
    ) -> Result<()> {
        buffers.swap();
        audio.promote_incoming()?;
        cursor.clip += 1;
        cursor.crossfade_started = false;

        let next = cursor.clip + 1;
        if next < timeline.len() {
            stage_clip(buffers, next)?;
            audio.connect_incoming(slot_audio(buffers, Slot::Standby))?;
        } else {
            buffers.clear_standby();
        }
        debug!(clip_index = cursor.clip, "Advanced to next clip");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Active,
    Standby,
}

fn stage_clip(buffers: &DoubleBufferManager, index: usize) -> Result<()> {
    buffers
        .stage(index)
        .map_err(|source| Error::Preload { index, source })
}

fn slot_audio(buffers: &DoubleBufferManager, slot: Slot) -> Option<AudioSourceId> {
    buffers.with_slots(|active, standby| {
        let handle = match slot {
            Slot::Active => active,
            Slot::Standby => standby,
        };
        handle.and_then(|h| h.surface.audio_source())
    })
}

fn placement_for(handle: &DecodedClipHandle, target: QualitySpec) -> crate::render::Placement {
    fit_rect(
        handle.natural_width,
        handle.natural_height,
        target.width,
        target.height,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::{decode_recording, MemoryHost};

    fn pipeline(host: &MemoryHost) -> ExportPipeline {
        ExportPipeline::new(
            Arc::new(host.clone()),
            EngineConfig::default(),
            EventBus::new(1024),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_clip_has_no_transition() {
        let host = MemoryHost::new();
        let pipeline = pipeline(&host);
        let clips = vec![ClipSource::new("mem://solo", 1.0)];

        let artifact = pipeline
            .export(ExportRequest::new(QualityTier::Hd720, clips))
            .await
            .unwrap();

        assert_eq!(artifact.frame_count, 30);
        let digest = decode_recording(&artifact.bytes).unwrap();
        assert_eq!((digest.width, digest.height), (1280, 720));
        assert!(digest.frames.iter().all(|f| (f.opacity - 1.0).abs() < 1e-6));
        assert_eq!(pipeline.state().status, ExportStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_export_rejected() {
        let host = MemoryHost::new();
        let pipeline = Arc::new(pipeline(&host));
        let clips = vec![ClipSource::new("mem://a", 2.0)];

        let running = {
            let pipeline = Arc::clone(&pipeline);
            let clips = clips.clone();
            tokio::spawn(async move {
                pipeline
                    .export(ExportRequest::new(QualityTier::Hd720, clips))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        let second = pipeline
            .export(ExportRequest::new(QualityTier::Hd720, clips))
            .await;
        assert!(matches!(second, Err(Error::InvalidState(_))));
        assert!(running.await.unwrap().is_ok());
        assert!(!pipeline.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_clip_list_is_error() {
        let host = MemoryHost::new();
        let pipeline = pipeline(&host);
        let err = pipeline
            .export(ExportRequest::new(QualityTier::Hd720, vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Common(_)));
        assert_eq!(pipeline.state().status, ExportStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_recorder_is_sink_error() {
        let host = MemoryHost::new();
        host.set_recorder_mime_types(vec!["video/x-none".to_string()]);
        let pipeline = pipeline(&host);

        let err = pipeline
            .export(ExportRequest::new(
                QualityTier::Hd720,
                vec![ClipSource::new("mem://a", 1.0)],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sink(_)));
        assert_eq!(host.live_compositing_surfaces(), 0);
        assert_eq!(pipeline.outstanding_session_resources(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_artifact_revokes_location() {
        let host = MemoryHost::new();
        let pipeline = pipeline(&host);
        let artifact = pipeline
            .export(ExportRequest::new(
                QualityTier::Hd720,
                vec![ClipSource::new("mem://a", 0.5)],
            ))
            .await
            .unwrap();

        let locations = host.memory_locations();
        assert!(locations.get(&artifact.playable_location).is_some());
        assert!(pipeline.release_artifact(&artifact.playable_location).unwrap());
        assert!(!pipeline.release_artifact(&artifact.playable_location).unwrap());
        assert!(locations.get(&artifact.playable_location).is_none());
    }
}
