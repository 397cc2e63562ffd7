//! Export session state machine and progress accounting
//!
//! Progress bands:
//! - preparing: 0-10 %
//! - rendering: 10-95 %, proportional to frames composited
//! - finalizing: 95-100 %
//!
//! Snapshots go out on the pipeline's watch channel whenever the status or
//! clip index changes, or the whole-percent value moves.

use crate::error::{Error, Result};
use segue_common::events::{EngineEvent, EventBus, ExportStatus, RenderingState};
use segue_common::QualityTier;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

const PREPARING_END: f64 = 10.0;
const RENDERING_END: f64 = 95.0;

/// Frame ticks longer than this multiple of the budget count as dropped
const DROPPED_FRAME_FACTOR: f64 = 1.5;

/// Mutable state of one export session
pub struct ExportSession {
    session_id: Uuid,
    state: RenderingState,
    tx: Arc<watch::Sender<RenderingState>>,
    bus: EventBus,
    started_at: Instant,
    render_started_at: Option<Instant>,
    last_published_percent: i64,
}

impl ExportSession {
    /// Start a session in `idle`, publishing the initial snapshot
    pub fn new(
        quality_tier: QualityTier,
        total_clips: usize,
        tx: Arc<watch::Sender<RenderingState>>,
        bus: EventBus,
    ) -> Self {
        let state = RenderingState {
            total_clips,
            quality_tier: Some(quality_tier),
            ..RenderingState::default()
        };
        let session = Self {
            session_id: Uuid::new_v4(),
            state,
            tx,
            bus,
            started_at: Instant::now(),
            render_started_at: None,
            last_published_percent: 0,
        };
        session.publish();
        session
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn status(&self) -> ExportStatus {
        self.state.status
    }

    pub fn snapshot(&self) -> RenderingState {
        self.state.clone()
    }

    /// Time since the session started
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn publish(&self) {
        self.tx.send_replace(self.state.clone());
    }

    fn set_percent(&mut self, percent: f64) {
        self.state.progress_percent = percent.clamp(0.0, 100.0);
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition_to(&mut self, next: ExportStatus, message: impl Into<String>) -> Result<()> {
        let old = self.state.status;
        if !old.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "export cannot move from {} to {}",
                old, next
            )));
        }

        self.state.status = next;
        self.state.message = message.into();
        match next {
            ExportStatus::Preparing => self.set_percent(0.0),
            ExportStatus::Rendering => {
                self.set_percent(PREPARING_END);
                self.render_started_at = Some(Instant::now());
            }
            ExportStatus::Finalizing => {
                self.set_percent(RENDERING_END);
                self.state.estimated_seconds_remaining = None;
            }
            ExportStatus::Complete => {
                self.set_percent(100.0);
                self.state.estimated_seconds_remaining = Some(0.0);
            }
            ExportStatus::Error | ExportStatus::Cancelled => {
                self.state.estimated_seconds_remaining = None;
            }
            ExportStatus::Idle => {}
        }
        self.last_published_percent = self.state.progress_percent.floor() as i64;

        info!(
            session_id = %self.session_id,
            old_status = %old,
            new_status = %next,
            "Export status changed"
        );
        self.bus.emit_lossy(EngineEvent::ExportStatusChanged {
            session_id: self.session_id,
            old_status: old,
            new_status: next,
            timestamp: segue_common::time::now(),
        });
        self.publish();
        Ok(())
    }

    /// Progress inside the preparing band; `fraction` in `[0, 1]`
    pub fn update_preparing(&mut self, fraction: f64, message: impl Into<String>) {
        self.state.message = message.into();
        self.set_percent(PREPARING_END * fraction.clamp(0.0, 1.0));
        self.publish_if_moved(false);
    }

    /// Account one composited frame
    ///
    /// `delta` is the frame timer's time since the previous invocation and
    /// `budget` the encode frame interval.
    pub fn record_frame(
        &mut self,
        frames_done: u64,
        total_frames: u64,
        clip_index: usize,
        delta: Duration,
        budget: Duration,
    ) {
        if !budget.is_zero() && delta.as_secs_f64() > budget.as_secs_f64() * DROPPED_FRAME_FACTOR {
            self.state.dropped_frame_count += 1;
        }

        let clip_changed = self.state.current_clip_index != clip_index;
        if clip_changed {
            self.state.current_clip_index = clip_index;
            self.state.message = format!(
                "Rendering clip {} of {}",
                clip_index + 1,
                self.state.total_clips
            );
        }

        let fraction = if total_frames == 0 {
            1.0
        } else {
            (frames_done as f64 / total_frames as f64).min(1.0)
        };
        self.set_percent(PREPARING_END + (RENDERING_END - PREPARING_END) * fraction);

        if let Some(render_started) = self.render_started_at {
            let seconds = render_started.elapsed().as_secs_f64();
            if seconds > 0.0 && frames_done > 0 {
                let fps = frames_done as f64 / seconds;
                self.state.frames_per_second = fps;
                let remaining = total_frames.saturating_sub(frames_done) as f64;
                self.state.estimated_seconds_remaining = Some(remaining / fps);
            }
        }

        self.publish_if_moved(clip_changed);
    }

    /// Set the message without moving progress
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.state.message = message.into();
        self.publish();
    }

    fn publish_if_moved(&mut self, force: bool) {
        let percent = self.state.progress_percent.floor() as i64;
        if force || percent != self.last_published_percent {
            self.last_published_percent = percent;
            self.publish();
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        self.bus.emit_lossy(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (ExportSession, watch::Receiver<RenderingState>, EventBus) {
        let (tx, rx) = watch::channel(RenderingState::default());
        let bus = EventBus::new(64);
        let session = ExportSession::new(QualityTier::Hd1080, 3, Arc::new(tx), bus.clone());
        (session, rx, bus)
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_transition_rejected() {
        let (mut session, _rx, _bus) = session();
        assert!(session.transition_to(ExportStatus::Rendering, "skip").is_err());
        assert_eq!(session.status(), ExportStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_emit_events() {
        let (mut session, rx, bus) = session();
        let mut events = bus.subscribe();

        session.transition_to(ExportStatus::Preparing, "Preparing").unwrap();
        session.transition_to(ExportStatus::Rendering, "Rendering").unwrap();

        assert_eq!(rx.borrow().status, ExportStatus::Rendering);
        assert_eq!(rx.borrow().progress_percent, 10.0);

        let first = events.try_recv().unwrap();
        assert!(matches!(
            first,
            EngineEvent::ExportStatusChanged {
                old_status: ExportStatus::Idle,
                new_status: ExportStatus::Preparing,
                ..
            }
        ));
        assert_eq!(events.try_recv().unwrap().event_type(), "ExportStatusChanged");
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_progress_and_eta() {
        let (mut session, rx, _bus) = session();
        session.transition_to(ExportStatus::Preparing, "Preparing").unwrap();
        session.transition_to(ExportStatus::Rendering, "Rendering").unwrap();

        let budget = Duration::from_millis(33);
        tokio::time::advance(Duration::from_secs(1)).await;
        session.record_frame(30, 120, 0, budget, budget);

        let snapshot = rx.borrow().clone();
        assert!((snapshot.progress_percent - (10.0 + 85.0 * 0.25)).abs() < 1e-9);
        assert!((snapshot.frames_per_second - 30.0).abs() < 1e-6);
        assert!((snapshot.estimated_seconds_remaining.unwrap() - 3.0).abs() < 1e-6);
        assert_eq!(snapshot.dropped_frame_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_counts_as_dropped() {
        let (mut session, _rx, _bus) = session();
        session.transition_to(ExportStatus::Preparing, "Preparing").unwrap();
        session.transition_to(ExportStatus::Rendering, "Rendering").unwrap();

        let budget = Duration::from_millis(33);
        session.record_frame(1, 100, 0, Duration::from_millis(40), budget);
        session.record_frame(2, 100, 0, Duration::from_millis(66), budget);
        assert_eq!(session.snapshot().dropped_frame_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clip_change_publishes_message() {
        let (mut session, rx, _bus) = session();
        session.transition_to(ExportStatus::Preparing, "Preparing").unwrap();
        session.transition_to(ExportStatus::Rendering, "Rendering").unwrap();

        session.record_frame(1, 1000, 1, Duration::ZERO, Duration::from_millis(33));
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.current_clip_index, 1);
        assert_eq!(snapshot.message, "Rendering clip 2 of 3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_reaches_hundred() {
        let (mut session, rx, _bus) = session();
        for (status, msg) in [
            (ExportStatus::Preparing, "Preparing"),
            (ExportStatus::Rendering, "Rendering"),
            (ExportStatus::Finalizing, "Finalizing"),
            (ExportStatus::Complete, "Complete"),
        ] {
            session.transition_to(status, msg).unwrap();
        }
        assert_eq!(rx.borrow().progress_percent, 100.0);
        assert!(rx.borrow().status.is_terminal());
    }
}
