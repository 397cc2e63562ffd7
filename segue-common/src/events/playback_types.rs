//! Playback-related type definitions
//!
//! Status machine and state snapshot of a gapless playback session.

use serde::{Deserialize, Serialize};

/// Gapless playback status
///
/// `idle → initializing → loading → ready → playing ⇄ paused → ended`, with
/// `error` reachable from initializing/loading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Idle,
    Initializing,
    Loading,
    Ready,
    Playing,
    Paused,
    Ended,
    Error,
}

impl PlaybackStatus {
    /// Statuses in which play/pause/seek are meaningful
    pub fn is_playable(&self) -> bool {
        matches!(
            self,
            PlaybackStatus::Ready
                | PlaybackStatus::Playing
                | PlaybackStatus::Paused
                | PlaybackStatus::Ended
        )
    }
}

impl std::fmt::Display for PlaybackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PlaybackStatus::Idle => "idle",
            PlaybackStatus::Initializing => "initializing",
            PlaybackStatus::Loading => "loading",
            PlaybackStatus::Ready => "ready",
            PlaybackStatus::Playing => "playing",
            PlaybackStatus::Paused => "paused",
            PlaybackStatus::Ended => "ended",
            PlaybackStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Read-only snapshot of a playback session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GaplessPlaybackState {
    pub status: PlaybackStatus,
    pub current_clip_index: usize,
    pub current_time_seconds: f64,
    pub total_duration_seconds: f64,

    /// Buffered timeline as a percentage of the total (0.0 - 100.0)
    pub buffered_percent: f64,

    pub clips_appended: usize,
    pub total_clips: usize,

    /// True when the host cannot play segments gaplessly and the caller must
    /// switch clips itself
    pub using_fallback: bool,
}

impl Default for GaplessPlaybackState {
    fn default() -> Self {
        Self {
            status: PlaybackStatus::Idle,
            current_clip_index: 0,
            current_time_seconds: 0.0,
            total_duration_seconds: 0.0,
            buffered_percent: 0.0,
            clips_appended: 0,
            total_clips: 0,
            using_fallback: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playable_statuses() {
        assert!(PlaybackStatus::Ready.is_playable());
        assert!(PlaybackStatus::Paused.is_playable());
        assert!(!PlaybackStatus::Loading.is_playable());
        assert!(!PlaybackStatus::Error.is_playable());
    }

    #[test]
    fn test_display_matches_serde() {
        for status in [PlaybackStatus::Idle, PlaybackStatus::Playing, PlaybackStatus::Ended] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }
}
