//! Fade law for cross-fade transitions
//!
//! Every easing curve maps transition progress to the *incoming* opacity; the
//! outgoing opacity is always its complement. Computing the outgoing value as
//! `1.0 - incoming` keeps `outgoing + incoming == 1.0` exact in IEEE-754
//! arithmetic for every progress in `[0, 1]`, so a cross-fade never dips in
//! brightness, including at the end points.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Easing curves supported by the fade law
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Easing {
    /// v(t) = t
    Linear,

    /// v(t) = t², slow start
    EaseIn,

    /// v(t) = 1 - (1 - t)², slow finish
    EaseOut,

    /// Piecewise quadratic, slow at both ends
    EaseInOut,
}

impl Easing {
    /// Map normalized progress `t` to eased progress
    ///
    /// Input is clamped to `[0, 1]`. Every curve returns exactly `0.0` at
    /// `t = 0` and exactly `1.0` at `t = 1`.
    pub fn apply(&self, t: f64) -> f64 {
        let t = clamp_progress(t);

        match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t,
            Easing::EaseOut => {
                let inv = 1.0 - t;
                1.0 - inv * inv
            }
            Easing::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    let inv = -2.0 * t + 2.0;
                    1.0 - inv * inv / 2.0
                }
            }
        }
    }

    /// Parse easing from configuration text
    ///
    /// Accepts `linear`, `ease_in`, `ease_out`, `ease_in_out` with `-` or no
    /// separator as aliases, case-insensitively.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "linear" => Some(Easing::Linear),
            "ease_in" | "easein" | "in" => Some(Easing::EaseIn),
            "ease_out" | "easeout" | "out" => Some(Easing::EaseOut),
            "ease_in_out" | "easeinout" | "in_out" => Some(Easing::EaseInOut),
            _ => None,
        }
    }

    /// Canonical configuration string
    pub fn to_config_string(&self) -> &'static str {
        match self {
            Easing::Linear => "linear",
            Easing::EaseIn => "ease_in",
            Easing::EaseOut => "ease_out",
            Easing::EaseInOut => "ease_in_out",
        }
    }

    /// Human-readable name
    pub fn display_name(&self) -> &'static str {
        match self {
            Easing::Linear => "Linear",
            Easing::EaseIn => "Ease In",
            Easing::EaseOut => "Ease Out",
            Easing::EaseInOut => "Ease In-Out",
        }
    }

    /// All supported curves
    pub fn all_variants() -> &'static [Easing] {
        &[
            Easing::Linear,
            Easing::EaseIn,
            Easing::EaseOut,
            Easing::EaseInOut,
        ]
    }
}

impl Default for Easing {
    fn default() -> Self {
        Easing::Linear
    }
}

impl fmt::Display for Easing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Complementary opacities of the two clips inside a transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpacityPair {
    pub outgoing: f64,
    pub incoming: f64,
}

impl OpacityPair {
    /// Only the outgoing clip is visible
    pub const OUTGOING_ONLY: OpacityPair = OpacityPair {
        outgoing: 1.0,
        incoming: 0.0,
    };

    /// Sum of both opacities (always exactly 1.0 for pairs from [`opacity_pair`])
    pub fn total(&self) -> f64 {
        self.outgoing + self.incoming
    }
}

/// Compute the conserved opacity pair for a transition progress value
pub fn opacity_pair(progress: f64, easing: Easing) -> OpacityPair {
    let incoming = easing.apply(progress);
    OpacityPair {
        outgoing: 1.0 - incoming,
        incoming,
    }
}

/// Short fixed span during which two clips are composited together
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransitionWindow {
    /// Start of the window on the clock that drives compositing (ms)
    pub start_ms: f64,
    /// Window length (ms)
    pub duration_ms: f64,
}

impl TransitionWindow {
    pub fn new(start_ms: f64, duration_ms: f64) -> Self {
        Self {
            start_ms,
            duration_ms,
        }
    }

    /// Window placed at the tail of a clip of `clip_duration_ms`
    ///
    /// A window longer than the clip is clamped to the clip.
    pub fn at_clip_tail(clip_duration_ms: f64, duration_ms: f64) -> Self {
        let duration_ms = duration_ms.min(clip_duration_ms).max(0.0);
        Self {
            start_ms: clip_duration_ms - duration_ms,
            duration_ms,
        }
    }

    /// End of the window (ms)
    pub fn end_ms(&self) -> f64 {
        self.start_ms + self.duration_ms
    }

    /// Whether `now_ms` lies inside the window (start inclusive)
    pub fn contains(&self, now_ms: f64) -> bool {
        now_ms >= self.start_ms && now_ms < self.end_ms()
    }

    /// Opacity state at `now_ms`
    pub fn opacity_at(&self, now_ms: f64, easing: Easing) -> FrameOpacity {
        frame_opacity(self.start_ms, self.duration_ms, now_ms, easing)
    }
}

/// Opacity state of one composited frame inside a transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameOpacity {
    /// Linear progress through the window, clamped to `[0, 1]`
    pub progress: f64,
    pub pair: OpacityPair,
    /// `true` once progress has reached 1.0
    pub complete: bool,
}

/// Derive transition progress from clock time and compute its opacity pair
///
/// A zero or negative window length is treated as an instantaneous cut:
/// progress is 1.0 and the transition is complete.
pub fn frame_opacity(
    transition_start_ms: f64,
    window_duration_ms: f64,
    now_ms: f64,
    easing: Easing,
) -> FrameOpacity {
    let progress = if window_duration_ms <= 0.0 {
        1.0
    } else {
        clamp_progress((now_ms - transition_start_ms) / window_duration_ms)
    };

    FrameOpacity {
        progress,
        pair: opacity_pair(progress, easing),
        complete: progress >= 1.0,
    }
}

fn clamp_progress(t: f64) -> f64 {
    if t.is_nan() {
        return 0.0;
    }
    t.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opacity_conserved_exactly_for_all_curves() {
        for easing in Easing::all_variants() {
            for step in 0..=10_000 {
                let progress = step as f64 / 10_000.0;
                let pair = opacity_pair(progress, *easing);
                assert_eq!(
                    pair.outgoing + pair.incoming,
                    1.0,
                    "{:?} at {} gave {:?}",
                    easing,
                    progress,
                    pair
                );
            }
        }
    }

    #[test]
    fn test_opacity_conserved_for_irregular_progress() {
        let samples = [1e-17, 1e-9, 0.1, 1.0 / 3.0, 0.499_999_999, 0.7, 0.999_999_999_9];
        for easing in Easing::all_variants() {
            for progress in samples {
                assert_eq!(opacity_pair(progress, *easing).total(), 1.0);
            }
        }
    }

    #[test]
    fn test_end_points_exact() {
        for easing in Easing::all_variants() {
            assert_eq!(opacity_pair(0.0, *easing), OpacityPair::OUTGOING_ONLY);
            let end = opacity_pair(1.0, *easing);
            assert_eq!(end.outgoing, 0.0);
            assert_eq!(end.incoming, 1.0);
        }
    }

    #[test]
    fn test_progress_is_clamped() {
        assert_eq!(opacity_pair(-0.5, Easing::Linear), OpacityPair::OUTGOING_ONLY);
        assert_eq!(opacity_pair(7.0, Easing::EaseIn).incoming, 1.0);
        assert_eq!(opacity_pair(f64::NAN, Easing::EaseOut).incoming, 0.0);
    }

    #[test]
    fn test_curve_shapes() {
        assert!((Easing::Linear.apply(0.25) - 0.25).abs() < 1e-12);
        assert!((Easing::EaseIn.apply(0.5) - 0.25).abs() < 1e-12);
        assert!((Easing::EaseOut.apply(0.5) - 0.75).abs() < 1e-12);
        assert!((Easing::EaseInOut.apply(0.5) - 0.5).abs() < 1e-12);
        assert!(Easing::EaseIn.apply(0.3) < Easing::EaseOut.apply(0.3));
    }

    #[test]
    fn test_frame_opacity_progress_and_completion() {
        let start = frame_opacity(1000.0, 50.0, 1000.0, Easing::Linear);
        assert_eq!(start.progress, 0.0);
        assert!(!start.complete);

        let mid = frame_opacity(1000.0, 50.0, 1025.0, Easing::Linear);
        assert!((mid.pair.incoming - 0.5).abs() < 1e-12);
        assert!(!mid.complete);

        let done = frame_opacity(1000.0, 50.0, 1050.0, Easing::Linear);
        assert!(done.complete);
        assert_eq!(done.pair.incoming, 1.0);

        let late = frame_opacity(1000.0, 50.0, 9000.0, Easing::Linear);
        assert!(late.complete);
    }

    #[test]
    fn test_zero_length_window_is_a_cut() {
        let cut = frame_opacity(0.0, 0.0, 0.0, Easing::EaseInOut);
        assert!(cut.complete);
        assert_eq!(cut.pair.incoming, 1.0);
    }

    #[test]
    fn test_window_at_clip_tail() {
        let window = TransitionWindow::at_clip_tail(4000.0, 50.0);
        assert_eq!(window.start_ms, 3950.0);
        assert_eq!(window.end_ms(), 4000.0);
        assert!(window.contains(3950.0));
        assert!(!window.contains(4000.0));

        let clamped = TransitionWindow::at_clip_tail(20.0, 50.0);
        assert_eq!(clamped.start_ms, 0.0);
        assert_eq!(clamped.duration_ms, 20.0);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(Easing::from_str("linear"), Some(Easing::Linear));
        assert_eq!(Easing::from_str("ease-in"), Some(Easing::EaseIn));
        assert_eq!(Easing::from_str("EaseOut"), Some(Easing::EaseOut));
        assert_eq!(Easing::from_str("ease_in_out"), Some(Easing::EaseInOut));
        assert_eq!(Easing::from_str("bounce"), None);
        for easing in Easing::all_variants() {
            assert_eq!(Easing::from_str(easing.to_config_string()), Some(*easing));
        }
    }

    #[test]
    fn test_default_and_display() {
        assert_eq!(Easing::default(), Easing::Linear);
        assert_eq!(format!("{}", Easing::EaseInOut), "Ease In-Out");
    }
}
