//! Frame timing helpers and the cumulative clip timeline
//!
//! # Frame accounting
//!
//! The export path composites at a fixed encode rate. Clip spans are derived
//! from *cumulative* offsets rounded to whole frames:
//!
//! ```text
//! frames(i) = round(end_i × fps) − round(start_i × fps)
//! ```
//!
//! so per-clip rounding never accumulates and the total frame count stays
//! within half a frame of the duration sum.
//!
//! ```rust
//! use segue_common::timing::*;
//!
//! let timeline = ClipTimeline::new(vec![4.0, 6.0, 3.0]);
//! assert_eq!(timeline.total_duration(), 13.0);
//! assert_eq!(timeline.frame_span(1, 30.0), (120, 300));
//! assert_eq!(frames_to_seconds(390, 30.0), 13.0);
//! ```
//!
//! # Boundary detection
//!
//! [`ClipTimeline::check_boundary`] caches the clip index of the last
//! observed position, so a monotonically advancing clock reports each clip
//! change exactly once.

use crate::clip::ClipSource;
use std::time::Duration;

/// Length of one frame at `fps`
pub fn frame_interval(fps: f64) -> Duration {
    if fps <= 0.0 || !fps.is_finite() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(1.0 / fps)
}

/// Index of the frame nearest to `seconds` at `fps`
pub fn frame_at(seconds: f64, fps: f64) -> u64 {
    let frame = (seconds * fps).round();
    if frame.is_finite() && frame > 0.0 {
        frame as u64
    } else {
        0
    }
}

/// Whole frames covering `[start_seconds, end_seconds)`
pub fn frames_between(start_seconds: f64, end_seconds: f64, fps: f64) -> u64 {
    frame_at(end_seconds, fps).saturating_sub(frame_at(start_seconds, fps))
}

/// Duration of `frames` frames at `fps`, in seconds
pub fn frames_to_seconds(frames: u64, fps: f64) -> f64 {
    if fps <= 0.0 {
        return 0.0;
    }
    frames as f64 / fps
}

/// Ordered clip durations with precomputed cumulative start offsets
#[derive(Debug, Clone)]
pub struct ClipTimeline {
    /// Per-clip durations (seconds)
    durations: Vec<f64>,

    /// Cumulative start offset of each clip (seconds)
    starts: Vec<f64>,

    /// Sum of all durations (seconds)
    total: f64,

    /// Clip index of the last position passed to `check_boundary`
    ///
    /// None until the first call.
    current_index: Option<usize>,
}

impl ClipTimeline {
    /// Build a timeline from clip durations in playback order
    pub fn new(durations: Vec<f64>) -> Self {
        let mut timeline = Self {
            durations,
            starts: Vec::new(),
            total: 0.0,
            current_index: None,
        };
        timeline.recompute_offsets();
        timeline
    }

    /// Build a timeline from declared clip durations
    pub fn from_clips(clips: &[ClipSource]) -> Self {
        Self::new(clips.iter().map(|c| c.duration_seconds).collect())
    }

    fn recompute_offsets(&mut self) {
        let mut cursor = 0.0;
        self.starts = self
            .durations
            .iter()
            .map(|d| {
                let start = cursor;
                cursor += d.max(0.0);
                start
            })
            .collect();
        self.total = cursor;
    }

    /// Number of clips
    pub fn len(&self) -> usize {
        self.durations.len()
    }

    /// Check if timeline is empty
    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    /// Sum of clip durations (seconds)
    pub fn total_duration(&self) -> f64 {
        self.total
    }

    /// Cumulative start offset of clip `index`
    pub fn start_of(&self, index: usize) -> Option<f64> {
        self.starts.get(index).copied()
    }

    /// Cumulative end offset of clip `index`
    pub fn end_of(&self, index: usize) -> Option<f64> {
        Some(self.start_of(index)? + self.duration_of(index)?)
    }

    /// Duration of clip `index`
    pub fn duration_of(&self, index: usize) -> Option<f64> {
        self.durations.get(index).copied()
    }

    /// Replace the duration of one clip (e.g. with a decode-reported value)
    ///
    /// Offsets of all following clips shift accordingly. Returns false when
    /// `index` is out of range.
    pub fn update_duration(&mut self, index: usize, duration_seconds: f64) -> bool {
        match self.durations.get_mut(index) {
            Some(slot) => {
                *slot = duration_seconds.max(0.0);
                self.recompute_offsets();
                true
            }
            None => false,
        }
    }

    /// Clip index containing `position_seconds`
    ///
    /// Positions before the start map to the first clip and positions at or
    /// past the end map to the last clip. Returns None for an empty timeline.
    pub fn index_at(&self, position_seconds: f64) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let count = self.starts.partition_point(|start| *start <= position_seconds);
        Some(count.saturating_sub(1).min(self.len() - 1))
    }

    /// Check if `position_seconds` crossed into a different clip
    ///
    /// Returns `(crossed, index)`. The first call only initializes the cached
    /// index and reports `crossed = false`.
    pub fn check_boundary(&mut self, position_seconds: f64) -> (bool, Option<usize>) {
        // Fast path: still inside the cached clip
        if let Some(current) = self.current_index {
            if let (Some(start), Some(end)) = (self.start_of(current), self.end_of(current)) {
                let is_last = current + 1 == self.len();
                if position_seconds >= start && (position_seconds < end || is_last) {
                    return (false, Some(current));
                }
            }
        }

        let index = self.index_at(position_seconds);
        let crossed = match (self.current_index, index) {
            (Some(previous), Some(new)) => previous != new,
            _ => false,
        };
        self.current_index = index;
        (crossed, index)
    }

    /// Clip index cached by the last `check_boundary` call
    pub fn current_index(&self) -> Option<usize> {
        self.current_index
    }

    /// Forget the cached index (next `check_boundary` re-initializes)
    pub fn reset(&mut self) {
        self.current_index = None;
    }

    /// Frame range `[start, end)` of clip `index` at `fps`
    pub fn frame_span(&self, index: usize, fps: f64) -> (u64, u64) {
        match (self.start_of(index), self.end_of(index)) {
            (Some(start), Some(end)) => (frame_at(start, fps), frame_at(end, fps)),
            _ => (0, 0),
        }
    }

    /// Total frames of the whole timeline at `fps`
    pub fn total_frames(&self, fps: f64) -> u64 {
        frame_at(self.total, fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_timeline() {
        let mut timeline = ClipTimeline::new(vec![]);
        assert!(timeline.is_empty());
        assert_eq!(timeline.index_at(1.0), None);
        assert_eq!(timeline.check_boundary(1.0), (false, None));
        assert_eq!(timeline.total_duration(), 0.0);
    }

    #[test]
    fn test_cumulative_offsets() {
        let timeline = ClipTimeline::new(vec![4.0, 6.0, 3.0]);
        assert_eq!(timeline.start_of(0), Some(0.0));
        assert_eq!(timeline.start_of(1), Some(4.0));
        assert_eq!(timeline.start_of(2), Some(10.0));
        assert_eq!(timeline.end_of(2), Some(13.0));
        assert_eq!(timeline.start_of(3), None);
    }

    #[test]
    fn test_index_at_edges() {
        let timeline = ClipTimeline::new(vec![4.0, 6.0, 3.0]);
        assert_eq!(timeline.index_at(-1.0), Some(0));
        assert_eq!(timeline.index_at(0.0), Some(0));
        assert_eq!(timeline.index_at(3.999), Some(0));
        assert_eq!(timeline.index_at(4.0), Some(1));
        assert_eq!(timeline.index_at(12.9), Some(2));
        assert_eq!(timeline.index_at(13.0), Some(2));
        assert_eq!(timeline.index_at(99.0), Some(2));
    }

    #[test]
    fn test_boundary_fires_once_per_crossing() {
        let mut timeline = ClipTimeline::new(vec![4.0, 6.0, 3.0]);
        let mut crossings = Vec::new();

        // 100ms poll over a monotonically increasing clock
        for step in 0..=140 {
            let t = step as f64 * 0.1;
            let (crossed, index) = timeline.check_boundary(t);
            if crossed {
                crossings.push(index.unwrap());
            }
        }

        assert_eq!(crossings, vec![1, 2]);
    }

    #[test]
    fn test_first_check_does_not_cross() {
        let mut timeline = ClipTimeline::new(vec![1.0, 1.0]);
        assert_eq!(timeline.check_boundary(1.5), (false, Some(1)));
        assert_eq!(timeline.check_boundary(1.6), (false, Some(1)));
    }

    #[test]
    fn test_backward_seek_crosses() {
        let mut timeline = ClipTimeline::new(vec![2.0, 2.0]);
        timeline.check_boundary(3.0);
        assert_eq!(timeline.check_boundary(1.0), (true, Some(0)));
        timeline.reset();
        assert_eq!(timeline.current_index(), None);
    }

    #[test]
    fn test_update_duration_shifts_following_offsets() {
        let mut timeline = ClipTimeline::new(vec![4.0, 6.0, 3.0]);
        assert!(timeline.update_duration(0, 4.5));
        assert_eq!(timeline.start_of(1), Some(4.5));
        assert_eq!(timeline.total_duration(), 13.5);
        assert!(!timeline.update_duration(7, 1.0));
    }

    #[test]
    fn test_frame_spans_do_not_accumulate_rounding() {
        let timeline = ClipTimeline::new(vec![1.01, 1.01, 1.01]);
        let fps = 30.0;
        let total: u64 = (0..timeline.len())
            .map(|i| {
                let (start, end) = timeline.frame_span(i, fps);
                end - start
            })
            .sum();
        assert_eq!(total, timeline.total_frames(fps));
        let rendered = frames_to_seconds(total, fps);
        assert!((rendered - 3.03).abs() <= 0.5 / fps);
    }

    #[test]
    fn test_frame_helpers() {
        assert_eq!(frame_interval(30.0), Duration::from_secs_f64(1.0 / 30.0));
        assert_eq!(frame_interval(0.0), Duration::ZERO);
        assert_eq!(frame_at(1.0, 30.0), 30);
        assert_eq!(frame_at(-1.0, 30.0), 0);
        assert_eq!(frames_between(4.0, 10.0, 30.0), 180);
        assert_eq!(frames_to_seconds(45, 30.0), 1.5);
    }
}
