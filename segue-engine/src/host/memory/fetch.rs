//! In-memory payload fetcher

use super::playback::segment_payload;
use crate::error::{Error, Result};
use crate::host::PayloadFetcher;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FetcherState {
    payloads: HashMap<String, Vec<u8>>,
    latency: HashMap<String, Duration>,
    failing: HashSet<String>,
    fetches: u32,
    in_flight: usize,
    max_in_flight: usize,
    /// Completion order of successful fetches
    completed: Vec<String>,
}

/// Serves payloads from a map, with per-location latency and failures
pub struct MemoryFetcher {
    state: Mutex<FetcherState>,
    default_latency: Duration,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FetcherState::default()),
            default_latency: Duration::from_millis(5),
        }
    }

    fn state(&self) -> MutexGuard<'_, FetcherState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, location: &str, bytes: Vec<u8>) {
        self.state().payloads.insert(location.to_string(), bytes);
    }

    /// Serve a segment payload of `duration_seconds` at `location`
    pub fn insert_clip(&self, location: &str, duration_seconds: f64, body_len: usize) {
        self.insert(location, segment_payload(duration_seconds, body_len));
    }

    pub fn set_latency(&self, location: &str, latency: Duration) {
        self.state().latency.insert(location.to_string(), latency);
    }

    /// Fail every fetch of `location`
    pub fn fail(&self, location: &str) {
        self.state().failing.insert(location.to_string());
    }

    pub fn fetch_count(&self) -> u32 {
        self.state().fetches
    }

    pub fn max_concurrent(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn completion_order(&self) -> Vec<String> {
        self.state().completed.clone()
    }
}

impl Default for MemoryFetcher {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a MemoryFetcher);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

#[async_trait]
impl PayloadFetcher for MemoryFetcher {
    async fn fetch(&self, location: &str, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let latency = {
            let mut state = self.state();
            state.fetches += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state
                .latency
                .get(location)
                .copied()
                .unwrap_or(self.default_latency)
        };
        let _in_flight = InFlight(self);

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(latency) => {}
        }

        let mut state = self.state();
        if state.failing.contains(location) {
            return Err(Error::Fetch {
                location: location.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let bytes = state.payloads.get(location).cloned().ok_or_else(|| Error::Fetch {
            location: location.to_string(),
            reason: "not found".to_string(),
        })?;
        state.completed.push(location.to_string());
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fetch_known_and_unknown() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("mem://a", vec![1, 2, 3]);
        let token = CancellationToken::new();

        assert_eq!(fetcher.fetch("mem://a", &token).await.unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            fetcher.fetch("mem://missing", &token).await,
            Err(Error::Fetch { .. })
        ));
        assert_eq!(fetcher.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_honors_cancellation() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("mem://slow", vec![0]);
        fetcher.set_latency("mem://slow", Duration::from_secs(60));
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let err = fetcher.fetch("mem://slow", &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(fetcher.completion_order().is_empty());
    }
}
