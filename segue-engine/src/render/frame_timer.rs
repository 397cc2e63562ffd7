//! Display-refresh-aligned frame loop
//!
//! The timer ticks at the display refresh rate and runs the callback body
//! only when at least 90% of the target frame budget has elapsed since the
//! previous invocation. A 30 fps target on a 60 Hz display therefore runs the
//! callback on every second tick. When the host falls behind, missed ticks
//! are skipped rather than replayed; callers detect overruns from the
//! reported `delta`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Fraction of the frame budget that must elapse between invocations
const BUDGET_GATE: f64 = 0.9;

/// Timing of one callback invocation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTick {
    /// Time since the previous invocation (zero for the first)
    pub delta: Duration,
    /// Time since the loop started
    pub elapsed: Duration,
    /// Zero-based invocation counter
    pub invocation: u64,
}

/// Summary of one `start()` run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameLoopStats {
    /// Callback invocations
    pub invocations: u64,
    /// Refresh ticks observed (including gated ones)
    pub ticks: u64,
    pub elapsed: Duration,
    /// True when the loop ended through `stop()` rather than the callback
    pub stopped: bool,
}

/// Clears the running flag however the loop ends, including a dropped future
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic frame driver
pub struct FrameTimer {
    refresh_period: Duration,
    stop: CancellationToken,
    running: AtomicBool,
}

impl FrameTimer {
    /// Create a timer ticking at `refresh_hz`
    pub fn new(refresh_hz: f64) -> Self {
        Self::with_stop_token(refresh_hz, CancellationToken::new())
    }

    /// Create a timer that also stops when `stop` is cancelled
    pub fn with_stop_token(refresh_hz: f64, stop: CancellationToken) -> Self {
        let refresh_hz = if refresh_hz.is_finite() && refresh_hz > 0.0 {
            refresh_hz
        } else {
            60.0
        };
        Self {
            refresh_period: Duration::from_secs_f64(1.0 / refresh_hz),
            stop,
            running: AtomicBool::new(false),
        }
    }

    pub fn refresh_period(&self) -> Duration {
        self.refresh_period
    }

    /// Run the loop until the callback returns `false` or `stop()` is called
    ///
    /// Returns immediately if the timer was already stopped or another loop
    /// is running on this timer.
    pub async fn start<F>(&self, target_fps: f64, mut callback: F) -> FrameLoopStats
    where
        F: FnMut(FrameTick) -> bool,
    {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Frame timer already running, ignoring start");
            return FrameLoopStats::default();
        }
        let _running = RunningGuard(&self.running);

        let budget = segue_common::timing::frame_interval(target_fps);
        let gate = budget.mul_f64(BUDGET_GATE);

        let mut ticker = interval(self.refresh_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let started = Instant::now();
        let mut last_invocation: Option<Instant> = None;
        let mut stats = FrameLoopStats::default();

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    stats.stopped = true;
                    break;
                }
                tick = ticker.tick() => {
                    stats.ticks += 1;

                    let delta = match last_invocation {
                        Some(last) => {
                            let since = tick.saturating_duration_since(last);
                            if since < gate {
                                continue;
                            }
                            since
                        }
                        None => Duration::ZERO,
                    };

                    last_invocation = Some(tick);
                    let frame = FrameTick {
                        delta,
                        elapsed: tick.saturating_duration_since(started),
                        invocation: stats.invocations,
                    };
                    stats.invocations += 1;
                    trace!(invocation = frame.invocation, delta_ms = delta.as_secs_f64() * 1000.0, "Frame tick");

                    if !callback(frame) {
                        break;
                    }
                }
            }
        }

        stats.elapsed = started.elapsed();
        stats
    }

    /// Halt the loop; idempotent, and later `start()` calls return at once
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
