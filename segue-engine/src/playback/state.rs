//! Shared `GaplessPlaybackState` cell
//!
//! Both playback paths publish snapshots through a watch channel and
//! lifecycle events through the [`EventBus`]. The cell is shared between the
//! player and its poller task.

use segue_common::events::{EngineEvent, EventBus, GaplessPlaybackState, PlaybackStatus};
use tokio::sync::watch;
use tracing::info;

pub struct PlaybackState {
    tx: watch::Sender<GaplessPlaybackState>,
    bus: EventBus,
}

impl PlaybackState {
    pub fn new(bus: EventBus) -> Self {
        let (tx, _) = watch::channel(GaplessPlaybackState::default());
        Self { tx, bus }
    }

    pub fn subscribe(&self) -> watch::Receiver<GaplessPlaybackState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> GaplessPlaybackState {
        self.tx.borrow().clone()
    }

    pub fn status(&self) -> PlaybackStatus {
        self.tx.borrow().status
    }

    /// Apply `f` and publish if anything changed
    pub fn update(&self, f: impl FnOnce(&mut GaplessPlaybackState)) {
        self.tx.send_if_modified(|state| {
            let before = state.clone();
            f(state);
            *state != before
        });
    }

    /// Move to `next`, emitting a status event when it differs
    pub fn set_status(&self, next: PlaybackStatus) {
        let mut old = next;
        self.tx.send_if_modified(|state| {
            old = state.status;
            state.status = next;
            old != next
        });
        if old != next {
            info!(old_status = %old, new_status = %next, "Playback status changed");
            self.bus.emit_lossy(EngineEvent::PlaybackStatusChanged {
                old_status: old,
                new_status: next,
                timestamp: segue_common::time::now(),
            });
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        self.bus.emit_lossy(event);
    }

    /// Publish a clip change
    pub fn clip_changed(&self, previous_index: usize, current_index: usize, position_seconds: f64) {
        self.update(|state| state.current_clip_index = current_index);
        self.emit(EngineEvent::ClipChanged {
            previous_index,
            current_index,
            position_seconds,
            timestamp: segue_common::time::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_event_only_on_change() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe();
        let state = PlaybackState::new(bus);

        state.set_status(PlaybackStatus::Initializing);
        state.set_status(PlaybackStatus::Initializing);

        assert_eq!(events.try_recv().unwrap().event_type(), "PlaybackStatusChanged");
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_update_publishes_changes_only() {
        let state = PlaybackState::new(EventBus::new(4));
        let mut rx = state.subscribe();
        rx.borrow_and_update();

        state.update(|s| s.total_clips = 3);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        state.update(|s| s.total_clips = 3);
        assert!(!rx.has_changed().unwrap());
    }
}
