//! Double-buffered decoded clips
//!
//! Two slots hold decoded clip handles: the *active* slot is what is being
//! composited, the *standby* slot holds the next clip so it is decode-ready
//! before the boundary. `swap()` toggles which slot is active without moving
//! any data.
//!
//! Preloads are keyed by clip index. Concurrent requests for the same index
//! share one decode: later callers wait on the first request's outcome.
//! Completed preloads wait in a ready pool until `stage()` assigns them to
//! the standby slot. Every decode surface is registered with the session's
//! [`ResourceRegistry`] the moment it exists.

use crate::error::{PreloadError, Result};
use crate::host::{ClipDecoder, DecodeSurface};
use crate::resources::{ResourceId, ResourceRegistry};
use segue_common::ClipSource;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Preload limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreloadOptions {
    /// Upper bound on one decode-ready wait
    pub timeout: Duration,
    /// Extra attempts after a decode failure; timeouts are never retried
    pub retries: u32,
}

impl Default for PreloadOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retries: 2,
        }
    }
}

/// Metadata of a decode-ready clip
#[derive(Debug, Clone, PartialEq)]
pub struct ClipInfo {
    pub index: usize,
    pub natural_width: u32,
    pub natural_height: u32,
    /// Decode-reported duration (seconds)
    pub duration: f64,
}

/// One live decode surface bound to a clip source
///
/// The handle's lifetime is owned by the registry entry `resource_id`;
/// whoever holds the handle releases it through the registry. Handles move
/// between the ready pool and the slots; copies go out as [`ClipInfo`].
pub struct DecodedClipHandle {
    pub source: ClipSource,
    pub index: usize,
    pub surface: Arc<dyn DecodeSurface>,
    pub resource_id: ResourceId,
    pub natural_width: u32,
    pub natural_height: u32,
    pub duration: f64,
    pub ready: bool,
}

impl DecodedClipHandle {
    pub fn info(&self) -> ClipInfo {
        ClipInfo {
            index: self.index,
            natural_width: self.natural_width,
            natural_height: self.natural_height,
            duration: self.duration,
        }
    }
}

impl std::fmt::Debug for DecodedClipHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedClipHandle")
            .field("index", &self.index)
            .field("source", &self.source.source_location)
            .field("resource_id", &self.resource_id)
            .field("size", &(self.natural_width, self.natural_height))
            .field("duration", &self.duration)
            .field("ready", &self.ready)
            .finish()
    }
}

type Waiter = oneshot::Sender<std::result::Result<ClipInfo, PreloadError>>;

/// Held by the request that owns the decode for an index
///
/// If that request is dropped before it settles, the pending entry is
/// cleared and every joined waiter is told the preload was abandoned.
struct LeaderGuard<'a> {
    manager: &'a DoubleBufferManager,
    index: usize,
    settled: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let waiters = self.manager.inner().pending.remove(&self.index);
        debug!(clip_index = self.index, "Preload dropped before completion");
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(Err(PreloadError::Abandoned));
        }
    }
}

#[derive(Default)]
struct Inner {
    slots: [Option<DecodedClipHandle>; 2],
    active: usize,
    ready: HashMap<usize, DecodedClipHandle>,
    pending: HashMap<usize, Vec<Waiter>>,
    disposed: bool,
}

impl Inner {
    fn standby(&self) -> usize {
        1 - self.active
    }

    fn find(&self, index: usize) -> Option<&DecodedClipHandle> {
        self.ready.get(&index).or_else(|| {
            self.slots
                .iter()
                .flatten()
                .find(|handle| handle.index == index)
        })
    }
}

/// Active/standby holder of decoded clips with a deduplicating preload queue
pub struct DoubleBufferManager {
    decoder: Arc<dyn ClipDecoder>,
    registry: Arc<ResourceRegistry>,
    options: PreloadOptions,
    inner: Mutex<Inner>,
}

impl DoubleBufferManager {
    pub fn new(
        decoder: Arc<dyn ClipDecoder>,
        registry: Arc<ResourceRegistry>,
        options: PreloadOptions,
    ) -> Self {
        Self {
            decoder,
            registry,
            options,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make clip `index` decode-ready
    ///
    /// Resolves immediately if the clip is already loaded, joins an in-flight
    /// request for the same index, or starts a new decode.
    pub async fn preload(
        &self,
        source: &ClipSource,
        index: usize,
    ) -> std::result::Result<ClipInfo, PreloadError> {
        let joined = {
            let mut inner = self.inner();
            if inner.disposed {
                return Err(PreloadError::Abandoned);
            }
            if let Some(handle) = inner.find(index) {
                return Ok(handle.info());
            }
            match inner.pending.get_mut(&index) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inner.pending.insert(index, Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = joined {
            debug!(clip_index = index, "Joining in-flight preload");
            return rx.await.unwrap_or(Err(PreloadError::Abandoned));
        }

        let mut leader = LeaderGuard {
            manager: self,
            index,
            settled: false,
        };
        let outcome = self.decode_with_retry(source).await;

        let mut inner = self.inner();
        let waiters = inner.pending.remove(&index);
        leader.settled = true;

        let result = match (outcome, waiters.is_some() && !inner.disposed) {
            (Ok(surface), true) => {
                let handle = self.make_handle(source, index, surface);
                let info = handle.info();
                info!(
                    clip_index = index,
                    width = info.natural_width,
                    height = info.natural_height,
                    duration = info.duration,
                    "Clip decode-ready"
                );
                inner.ready.insert(index, handle);
                Ok(info)
            }
            (Ok(surface), false) => {
                // Disposed mid-flight: route the late surface through the
                // registry so it is still released exactly once
                let id = self.registry.register_decode_surface(
                    surface,
                    format!("clip {} (abandoned)", index),
                );
                if let Err(e) = self.registry.release(id) {
                    warn!(clip_index = index, error = %e, "Failed to release abandoned surface");
                }
                Err(PreloadError::Abandoned)
            }
            (Err(e), _) => {
                warn!(clip_index = index, error = %e, "Clip preload failed");
                Err(e)
            }
        };

        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(result.clone());
        }
        result
    }

    /// Preload clip `index` and assign it to the standby slot
    pub async fn preload_standby(
        &self,
        source: &ClipSource,
        index: usize,
    ) -> std::result::Result<ClipInfo, PreloadError> {
        let info = self.preload(source, index).await?;
        self.stage(index)?;
        Ok(info)
    }

    async fn decode_with_retry(
        &self,
        source: &ClipSource,
    ) -> std::result::Result<Arc<dyn DecodeSurface>, PreloadError> {
        let attempts = self.options.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.options.timeout, self.decoder.open(source)).await {
                Ok(Ok(surface)) => return Ok(surface),
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        warn!(
                            source = %source.source_location,
                            attempt,
                            error = %e,
                            "Decode failed, retrying"
                        );
                    }
                }
                Err(_) => {
                    return Err(PreloadError::Timeout {
                        timeout_ms: self.options.timeout.as_millis() as u64,
                    });
                }
            }
        }

        Err(PreloadError::Decode {
            attempts,
            reason: last_error,
        })
    }

    fn make_handle(
        &self,
        source: &ClipSource,
        index: usize,
        surface: Arc<dyn DecodeSurface>,
    ) -> DecodedClipHandle {
        let (natural_width, natural_height) = surface.natural_size();
        let reported = surface.duration_seconds();
        let duration = if reported.is_finite() && reported > 0.0 {
            reported
        } else {
            source.duration_seconds
        };
        let resource_id = self
            .registry
            .register_decode_surface(Arc::clone(&surface), format!("clip {}", index));

        DecodedClipHandle {
            source: source.clone(),
            index,
            surface,
            resource_id,
            natural_width,
            natural_height,
            duration,
            ready: true,
        }
    }

    /// Move preloaded clip `index` into the standby slot
    ///
    /// Whatever occupied the standby slot is released.
    pub fn stage(&self, index: usize) -> std::result::Result<(), PreloadError> {
        let displaced = {
            let mut inner = self.inner();
            if inner.disposed {
                return Err(PreloadError::Abandoned);
            }
            let handle = inner.ready.remove(&index).ok_or(PreloadError::Abandoned)?;
            let standby = inner.standby();
            inner.slots[standby].replace(handle)
        };

        if let Some(old) = displaced {
            self.release_handle(old);
        }
        debug!(clip_index = index, "Staged clip in standby slot");
        Ok(())
    }

    /// Toggle active and standby; O(1), no data is moved
    ///
    /// Returns the newly active clip, if any.
    pub fn swap(&self) -> Option<ClipInfo> {
        let mut inner = self.inner();
        inner.active = inner.standby();
        let active = inner.active;
        inner.slots[active].as_ref().map(DecodedClipHandle::info)
    }

    /// Release the standby slot's clip, if any
    pub fn clear_standby(&self) {
        let released = {
            let mut inner = self.inner();
            let standby = inner.standby();
            inner.slots[standby].take()
        };
        if let Some(handle) = released {
            self.release_handle(handle);
        }
    }

    /// Run `f` with the active and standby handles
    pub fn with_slots<R>(
        &self,
        f: impl FnOnce(Option<&DecodedClipHandle>, Option<&DecodedClipHandle>) -> R,
    ) -> R {
        let inner = self.inner();
        let standby = inner.standby();
        f(inner.slots[inner.active].as_ref(), inner.slots[standby].as_ref())
    }

    pub fn active_info(&self) -> Option<ClipInfo> {
        self.with_slots(|active, _| active.map(DecodedClipHandle::info))
    }

    pub fn standby_info(&self) -> Option<ClipInfo> {
        self.with_slots(|_, standby| standby.map(DecodedClipHandle::info))
    }

    /// Info of a loaded clip (ready pool or either slot)
    pub fn info(&self, index: usize) -> Option<ClipInfo> {
        self.inner().find(index).map(DecodedClipHandle::info)
    }

    /// Clips waiting in the ready pool
    pub fn ready_count(&self) -> usize {
        self.inner().ready.len()
    }

    /// Preloads still in flight
    pub fn pending_count(&self) -> usize {
        self.inner().pending.len()
    }

    fn release_handle(&self, handle: DecodedClipHandle) {
        if let Err(e) = self.registry.release(handle.resource_id) {
            warn!(clip_index = handle.index, error = %e, "Failed to release decode surface");
        }
    }

    /// Release both slots and the ready pool and abandon in-flight preloads
    ///
    /// Idempotent.
    pub fn dispose(&self) {
        let (handles, waiters) = {
            let mut inner = self.inner();
            inner.disposed = true;
            let mut handles: Vec<DecodedClipHandle> =
                inner.slots.iter_mut().filter_map(Option::take).collect();
            handles.extend(inner.ready.drain().map(|(_, handle)| handle));
            let waiters: Vec<Waiter> = inner.pending.drain().flat_map(|(_, w)| w).collect();
            (handles, waiters)
        };

        if !handles.is_empty() {
            debug!(count = handles.len(), "Disposing decoded clips");
        }
        for handle in handles {
            self.release_handle(handle);
        }
        for waiter in waiters {
            let _ = waiter.send(Err(PreloadError::Abandoned));
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner().disposed
    }
}

/// Preload every clip with at most `concurrency` decodes in flight
///
/// `concurrency == 0` starts all preloads at once. Returns the clip infos in
/// source order, or the first failure.
pub async fn preload_all(
    manager: &DoubleBufferManager,
    clips: &[ClipSource],
    concurrency: usize,
) -> Result<Vec<ClipInfo>> {
    use futures::stream::{self, StreamExt, TryStreamExt};

    let limit = if concurrency == 0 {
        clips.len().max(1)
    } else {
        concurrency
    };

    let mut infos: Vec<ClipInfo> = stream::iter(0..clips.len())
        .map(|index| async move {
            let source = &clips[index];
            manager
                .preload(source, index)
                .await
                .map_err(|source| crate::Error::Preload { index, source })
        })
        .buffer_unordered(limit)
        .try_collect()
        .await?;

    infos.sort_by_key(|info| info.index);
    Ok(infos)
}
