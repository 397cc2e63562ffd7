//! Export-related type definitions
//!
//! Status machine and progress snapshot of an export session.

use crate::clip::QualityTier;
use serde::{Deserialize, Serialize};

/// Export session status
///
/// `idle → preparing → rendering → finalizing → complete`, with `error`
/// and `cancelled` reachable from preparing/rendering/finalizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Idle,
    Preparing,
    Rendering,
    Finalizing,
    Complete,
    Error,
    Cancelled,
}

impl ExportStatus {
    /// Terminal statuses end the session
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExportStatus::Complete | ExportStatus::Error | ExportStatus::Cancelled
        )
    }

    /// Whether the state machine permits `self → next`
    pub fn can_transition_to(&self, next: ExportStatus) -> bool {
        use ExportStatus::*;
        match (self, next) {
            (Idle, Preparing) => true,
            (Preparing, Rendering) => true,
            (Rendering, Finalizing) => true,
            (Finalizing, Complete) => true,
            (Preparing | Rendering | Finalizing, Error | Cancelled) => true,
            // A finished session may start over
            (Complete | Error | Cancelled, Idle | Preparing) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ExportStatus::Idle => "idle",
            ExportStatus::Preparing => "preparing",
            ExportStatus::Rendering => "rendering",
            ExportStatus::Finalizing => "finalizing",
            ExportStatus::Complete => "complete",
            ExportStatus::Error => "error",
            ExportStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Read-only progress snapshot of an export session
///
/// Published to observers on every meaningful update; observers never
/// mutate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderingState {
    pub status: ExportStatus,

    /// Percentage complete (0.0 - 100.0)
    pub progress_percent: f64,

    /// Current operation description
    pub message: String,

    pub current_clip_index: usize,
    pub total_clips: usize,

    /// Estimated remaining time (seconds), None if unknown
    pub estimated_seconds_remaining: Option<f64>,

    /// Measured composited frames per wall-clock second
    pub frames_per_second: f64,

    /// Frame ticks that overran the encode frame budget
    pub dropped_frame_count: u64,

    /// Tier being rendered, once known
    pub quality_tier: Option<QualityTier>,
}

impl Default for RenderingState {
    fn default() -> Self {
        Self {
            status: ExportStatus::Idle,
            progress_percent: 0.0,
            message: String::from("Idle"),
            current_clip_index: 0,
            total_clips: 0,
            estimated_seconds_remaining: None,
            frames_per_second: 0.0,
            dropped_frame_count: 0,
            quality_tier: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use ExportStatus::*;
        let path = [Idle, Preparing, Rendering, Finalizing, Complete];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn test_failure_transitions() {
        use ExportStatus::*;
        for from in [Preparing, Rendering, Finalizing] {
            assert!(from.can_transition_to(Error));
            assert!(from.can_transition_to(Cancelled));
        }
        assert!(!Idle.can_transition_to(Cancelled));
        assert!(!Idle.can_transition_to(Rendering));
        assert!(!Complete.can_transition_to(Error));
    }

    #[test]
    fn test_terminal() {
        assert!(ExportStatus::Complete.is_terminal());
        assert!(ExportStatus::Cancelled.is_terminal());
        assert!(!ExportStatus::Rendering.is_terminal());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(RenderingState::default()).unwrap();
        assert_eq!(json["status"], "idle");
        assert!(json.get("progressPercent").is_some());
        assert!(json.get("droppedFrameCount").is_some());
    }
}
