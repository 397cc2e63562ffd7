//! Sequential single-clip playback for hosts without segmented buffers
//!
//! Clips play one at a time on the same sink; the poller switches the
//! source at each clip end. Observers see the same `GaplessPlaybackState`
//! as with the gapless engine, with `using_fallback` set.

use super::state::PlaybackState;
use crate::error::{Error, Result};
use crate::host::PlaybackSink;
use segue_common::clip::validate_clips;
use segue_common::config::PlaybackConfig;
use segue_common::events::{EventBus, GaplessPlaybackState, PlaybackStatus};
use segue_common::timing::ClipTimeline;
use segue_common::ClipSource;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Slack before a clip's declared end at which the next clip is switched in
const END_EPSILON_SECONDS: f64 = 0.001;

struct Cursor {
    clip: usize,
}

struct Shared {
    sink: Arc<dyn PlaybackSink>,
    clips: Vec<ClipSource>,
    timeline: ClipTimeline,
    cursor: Mutex<Cursor>,
    state: PlaybackState,
}

impl Shared {
    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load_clip(&self, index: usize) -> Result<()> {
        let clip = self
            .clips
            .get(index)
            .ok_or_else(|| Error::InvalidInput(format!("no clip at index {}", index)))?;
        self.sink.set_source(&clip.source_location)?;
        self.cursor().clip = index;
        debug!(clip_index = index, location = %clip.source_location, "Loaded clip");
        Ok(())
    }

    fn position(&self) -> f64 {
        let clip = self.cursor().clip;
        self.timeline.start_of(clip).unwrap_or(0.0) + self.sink.current_time()
    }
}

/// Fallback player with manual clip-boundary switching
pub struct SequentialPlayer {
    shared: Arc<Shared>,
    config: PlaybackConfig,
    cancel: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl SequentialPlayer {
    pub fn new(
        config: PlaybackConfig,
        sink: Arc<dyn PlaybackSink>,
        clips: Vec<ClipSource>,
        bus: EventBus,
    ) -> Result<Self> {
        validate_clips(&clips)?;
        let timeline = ClipTimeline::from_clips(&clips);
        let state = PlaybackState::new(bus);
        state.update(|s| {
            s.using_fallback = true;
            s.total_clips = clips.len();
            s.total_duration_seconds = timeline.total_duration();
        });
        sink.set_volume(config.initial_volume.clamp(0.0, 1.0));

        Ok(Self {
            shared: Arc::new(Shared {
                sink,
                clips,
                timeline,
                cursor: Mutex::new(Cursor { clip: 0 }),
                state,
            }),
            config,
            cancel: CancellationToken::new(),
            poller: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<GaplessPlaybackState> {
        self.shared.state.subscribe()
    }

    pub fn state(&self) -> GaplessPlaybackState {
        self.shared.state.snapshot()
    }

    /// Load the first clip; the player is then ready
    pub fn load(&self) -> Result<()> {
        let state = &self.shared.state;
        if state.status() != PlaybackStatus::Idle {
            return Err(Error::InvalidState(format!("cannot load while {}", state.status())));
        }
        state.set_status(PlaybackStatus::Loading);
        match self.shared.load_clip(0) {
            Ok(()) => {
                state.update(|s| s.clips_appended = 1);
                state.set_status(PlaybackStatus::Ready);
                Ok(())
            }
            Err(e) => {
                state.set_status(PlaybackStatus::Error);
                Err(e)
            }
        }
    }

    pub async fn play(&self) -> Result<()> {
        let status = self.shared.state.status();
        if !status.is_playable() {
            return Err(Error::InvalidState(format!("cannot play while {}", status)));
        }
        if status == PlaybackStatus::Playing {
            return Ok(());
        }
        if status == PlaybackStatus::Ended {
            self.shared.load_clip(0)?;
            self.shared.state.update(|s| s.current_clip_index = 0);
        }
        self.shared.sink.play().await?;
        self.shared.state.set_status(PlaybackStatus::Playing);
        self.ensure_poller();
        Ok(())
    }

    pub fn pause(&self) {
        if self.shared.state.status() != PlaybackStatus::Playing {
            return;
        }
        self.shared.sink.pause();
        let position = self.shared.position();
        self.shared.state.update(|s| s.current_time_seconds = position);
        self.shared.state.set_status(PlaybackStatus::Paused);
    }

    /// Seek on the virtual continuous timeline
    pub async fn seek(&self, seconds: f64) -> Result<()> {
        let status = self.shared.state.status();
        if !status.is_playable() {
            return Err(Error::InvalidState(format!("cannot seek while {}", status)));
        }
        let shared = &self.shared;
        let total = shared.timeline.total_duration();
        let target = if seconds.is_finite() { seconds.clamp(0.0, total) } else { 0.0 };
        let index = shared.timeline.index_at(target).unwrap_or(0);
        let previous = shared.cursor().clip;

        if index != previous {
            shared.load_clip(index)?;
            if status == PlaybackStatus::Playing {
                shared.sink.play().await?;
            }
            shared.state.clip_changed(previous, index, target);
        }
        shared
            .sink
            .seek(target - shared.timeline.start_of(index).unwrap_or(0.0));
        shared.state.update(|s| s.current_time_seconds = target);

        if status == PlaybackStatus::Ended && target < total {
            shared.state.set_status(PlaybackStatus::Paused);
        }
        Ok(())
    }

    pub async fn seek_to_clip(&self, index: usize) -> Result<()> {
        let start = self
            .shared
            .timeline
            .start_of(index)
            .ok_or_else(|| Error::InvalidInput(format!("no clip at index {}", index)))?;
        self.seek(start).await
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.sink.set_muted(muted);
    }

    pub fn set_volume(&self, volume: f64) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.shared.sink.set_volume(volume);
    }

    fn ensure_poller(&self) {
        let mut poller = self.poller.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let shared = Arc::clone(&self.shared);
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
                        if !poll_once(&shared).await {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Stop polling and detach the sink; idempotent
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
        self.shared.sink.detach();
        self.shared.state.set_status(PlaybackStatus::Idle);
    }
}

impl Drop for SequentialPlayer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// One poller tick; returns false once the last clip has ended
async fn poll_once(shared: &Shared) -> bool {
    match shared.state.status() {
        PlaybackStatus::Playing => {}
        PlaybackStatus::Paused => return true,
        _ => return false,
    }

    let clip = shared.cursor().clip;
    let local = shared.sink.current_time();
    let declared = shared.timeline.duration_of(clip).unwrap_or(0.0);
    let start = shared.timeline.start_of(clip).unwrap_or(0.0);
    let clip_done = shared.sink.is_ended() || local >= declared - END_EPSILON_SECONDS;

    if !clip_done {
        shared.state.update(|s| {
            s.current_time_seconds = start + local;
            s.current_clip_index = clip;
        });
        return true;
    }

    let next = clip + 1;
    if next >= shared.clips.len() {
        shared.state.update(|s| s.current_time_seconds = shared.timeline.total_duration());
        shared.state.set_status(PlaybackStatus::Ended);
        info!("Sequential playback ended");
        return false;
    }

    let switched = match shared.load_clip(next) {
        Ok(()) => shared.sink.play().await,
        Err(e) => Err(e),
    };
    if let Err(e) = switched {
        tracing::warn!(clip_index = next, error = %e, "Failed to switch clip");
        shared.state.set_status(PlaybackStatus::Error);
        return false;
    }

    let position = shared.timeline.start_of(next).unwrap_or(0.0);
    shared.state.update(|s| {
        s.current_time_seconds = position;
        s.clips_appended = s.clips_appended.max(next + 1);
    });
    shared.state.clip_changed(clip, next, position);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryPlaybackSink;
    use std::time::Duration;

    fn player() -> (Arc<MemoryPlaybackSink>, SequentialPlayer, EventBus) {
        let sink = Arc::new(
            MemoryPlaybackSink::new()
                .with_media("mem://a", 1.0)
                .with_media("mem://b", 2.0),
        );
        let bus = EventBus::new(64);
        let clips = vec![ClipSource::new("mem://a", 1.0), ClipSource::new("mem://b", 2.0)];
        let player =
            SequentialPlayer::new(PlaybackConfig::default(), sink.clone(), clips, bus.clone())
                .unwrap();
        (sink, player, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn test_switches_clips_and_ends() {
        let (sink, player, bus) = player();
        let mut events = bus.subscribe();
        player.load().unwrap();
        assert!(player.state().using_fallback);

        player.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(sink.current_source().as_deref(), Some("mem://b"));
        assert_eq!(player.state().current_clip_index, 1);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(player.state().status, PlaybackStatus::Ended);

        let mut clip_changes = 0;
        while let Ok(event) = events.try_recv() {
            if event.event_type() == "ClipChanged" {
                clip_changes += 1;
            }
        }
        assert_eq!(clip_changes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_across_clips() {
        let (sink, player, _bus) = player();
        player.load().unwrap();
        player.seek(2.5).await.unwrap();

        assert_eq!(sink.current_source().as_deref(), Some("mem://b"));
        assert!((sink.current_time() - 1.5).abs() < 1e-9);
        assert_eq!(player.state().current_clip_index, 1);

        player.seek_to_clip(0).await.unwrap();
        assert_eq!(sink.current_source().as_deref(), Some("mem://a"));
        assert!(player.seek_to_clip(5).await.is_err());
    }

    #[test]
    fn test_rejects_invalid_clips() {
        let sink = Arc::new(MemoryPlaybackSink::new());
        assert!(SequentialPlayer::new(
            PlaybackConfig::default(),
            sink,
            vec![ClipSource::new("mem://a", -1.0)],
            EventBus::new(4)
        )
        .is_err());
    }
}
