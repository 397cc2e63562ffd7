//! Event types for the segue event system
//!
//! Provides shared event definitions and the EventBus used by the export and
//! playback paths. Progress snapshots themselves travel on watch channels
//! owned by each orchestrator; the bus carries lifecycle events.

mod export_types;
mod playback_types;

pub use export_types::{ExportStatus, RenderingState};
pub use playback_types::{GaplessPlaybackState, PlaybackStatus};

use crate::clip::QualityTier;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// Segue event types
///
/// Events are broadcast via EventBus and can be serialized for transport to a
/// host UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// Export session moved to a new status
    ExportStatusChanged {
        session_id: Uuid,
        old_status: ExportStatus,
        new_status: ExportStatus,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Cross-fade between two clips began (video and audio together)
    CrossfadeStarted {
        session_id: Uuid,
        outgoing_index: usize,
        incoming_index: usize,
        window_ms: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Export produced its artifact
    ExportCompleted {
        session_id: Uuid,
        quality_tier: QualityTier,
        total_duration_seconds: f64,
        size_bytes: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Export ended in error (cancellation is reported as a status change)
    ExportFailed {
        session_id: Uuid,
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback session moved to a new status
    PlaybackStatusChanged {
        old_status: PlaybackStatus,
        new_status: PlaybackStatus,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback crossed a clip boundary
    ClipChanged {
        previous_index: usize,
        current_index: usize,
        position_seconds: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// One clip's payload finished appending to the segmented buffer
    SegmentAppended {
        clip_index: usize,
        bytes: usize,
        buffered_end_seconds: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Segmented playback is unavailable; caller must switch clips itself
    FallbackEngaged {
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl EngineEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            EngineEvent::ExportStatusChanged { .. } => "ExportStatusChanged",
            EngineEvent::CrossfadeStarted { .. } => "CrossfadeStarted",
            EngineEvent::ExportCompleted { .. } => "ExportCompleted",
            EngineEvent::ExportFailed { .. } => "ExportFailed",
            EngineEvent::PlaybackStatusChanged { .. } => "PlaybackStatusChanged",
            EngineEvent::ClipChanged { .. } => "ClipChanged",
            EngineEvent::SegmentAppended { .. } => "SegmentAppended",
            EngineEvent::FallbackEngaged { .. } => "FallbackEngaged",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus
///
/// Uses tokio::broadcast internally:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use segue_common::events::{EventBus, EngineEvent};
///
/// let bus = EventBus::new(100);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(EngineEvent::FallbackEngaged {
///     reason: "no segmented buffer".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert_eq!(rx.try_recv().unwrap().event_type(), "FallbackEngaged");
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream` of events
    ///
    /// Lagged receivers surface as `Err` items rather than ending the stream.
    pub fn subscribe_stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: EngineEvent,
    ) -> Result<usize, broadcast::error::SendError<EngineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
