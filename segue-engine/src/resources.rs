//! Resource lifetime registry
//!
//! Every externally owned handle (playable locations, decode surfaces,
//! compositing surfaces, recording sinks, mixing contexts, segmented buffers)
//! is registered here together with the action that releases it. Each
//! registration is released exactly once:
//! - `release(id)` removes the entry before running its releaser, so a second
//!   call is a no-op
//! - `dispose_all()` drains every remaining entry, logging individual release
//!   failures instead of returning them, so one bad handle cannot block the
//!   rest
//!
//! Dropping a registry runs `dispose_all()`.

use crate::error::{Error, Result};
use crate::host::{
    AudioGraph, CompositingSurface, DecodeSurface, LocationProvider, RecordingSink,
    SegmentedBuffer,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Category of a registered resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    PlayableLocation,
    DecodeSurface,
    CompositingSurface,
    RecordingSink,
    MixingContext,
    SegmentedBuffer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceKind::PlayableLocation => "playable_location",
            ResourceKind::DecodeSurface => "decode_surface",
            ResourceKind::CompositingSurface => "compositing_surface",
            ResourceKind::RecordingSink => "recording_sink",
            ResourceKind::MixingContext => "mixing_context",
            ResourceKind::SegmentedBuffer => "segmented_buffer",
        };
        f.write_str(label)
    }
}

/// Handle of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

type Releaser = Box<dyn FnOnce() -> Result<()> + Send>;

struct Entry {
    kind: ResourceKind,
    label: String,
    releaser: Releaser,
}

/// Outcome of a `dispose_all()` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisposeReport {
    pub released: usize,
    pub failed: usize,
}

/// Registry of externally owned resources
pub struct ResourceRegistry {
    name: String,
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<ResourceId, Entry>>,
}

impl ResourceRegistry {
    /// Create an empty registry; `name` appears in log output
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_id: AtomicU64::new(1),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<ResourceId, Entry>> {
        // A panicking releaser never runs under the lock, so the map is
        // consistent even if poisoned
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a resource with the action that releases it
    pub fn register<F>(&self, kind: ResourceKind, label: impl Into<String>, releaser: F) -> ResourceId
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let label = label.into();
        debug!(registry = %self.name, resource_id = %id, kind = %kind, label = %label, "Registered resource");
        self.entries().insert(
            id,
            Entry {
                kind,
                label,
                releaser: Box::new(releaser),
            },
        );
        id
    }

    /// Register an ephemeral playable location, revoked on release
    pub fn register_location(
        &self,
        provider: Arc<dyn LocationProvider>,
        location: String,
    ) -> ResourceId {
        let label = location.clone();
        self.register(ResourceKind::PlayableLocation, label, move || {
            provider.revoke(&location)
        })
    }

    pub fn register_decode_surface(
        &self,
        surface: Arc<dyn DecodeSurface>,
        label: impl Into<String>,
    ) -> ResourceId {
        self.register(ResourceKind::DecodeSurface, label, move || surface.release())
    }

    pub fn register_compositing_surface(&self, surface: Arc<dyn CompositingSurface>) -> ResourceId {
        let label = format!("surface {}x{}", surface.width(), surface.height());
        self.register(ResourceKind::CompositingSurface, label, move || {
            surface.release()
        })
    }

    /// Register a recording sink; release aborts it without flushing
    pub fn register_recording_sink(&self, sink: Arc<dyn RecordingSink>) -> ResourceId {
        let label = sink.mime_type();
        self.register(ResourceKind::RecordingSink, label, move || {
            sink.abort();
            Ok(())
        })
    }

    pub fn register_mixing_context(&self, graph: Arc<dyn AudioGraph>) -> ResourceId {
        self.register(ResourceKind::MixingContext, "mixing graph", move || {
            graph.close()
        })
    }

    /// Register a segmented buffer; release detaches it
    pub fn register_segmented_buffer(
        &self,
        buffer: Arc<dyn SegmentedBuffer>,
        label: impl Into<String>,
    ) -> ResourceId {
        self.register(ResourceKind::SegmentedBuffer, label, move || {
            buffer.detach();
            Ok(())
        })
    }

    /// Release one resource
    ///
    /// Returns `Ok(false)` when `id` is not (or no longer) registered. A
    /// failing releaser still counts as released; its error is returned.
    pub fn release(&self, id: ResourceId) -> Result<bool> {
        let entry = self.entries().remove(&id);
        match entry {
            Some(entry) => {
                debug!(registry = %self.name, resource_id = %id, kind = %entry.kind, "Releasing resource");
                (entry.releaser)().map_err(|e| {
                    Error::Host(format!("failed to release {} ({}): {}", entry.kind, entry.label, e))
                })?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release every registered resource of one kind
    pub fn release_kind(&self, kind: ResourceKind) -> DisposeReport {
        let drained: Vec<(ResourceId, Entry)> = {
            let mut entries = self.entries();
            let ids: Vec<ResourceId> = entries
                .iter()
                .filter(|(_, e)| e.kind == kind)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };
        self.run_releasers(drained)
    }

    /// Force-release everything still registered
    ///
    /// Resources are released newest first. Safe to call any number of times.
    pub fn dispose_all(&self) -> DisposeReport {
        let drained: Vec<(ResourceId, Entry)> = std::mem::take(&mut *self.entries())
            .into_iter()
            .collect();
        if drained.is_empty() {
            return DisposeReport::default();
        }
        let report = self.run_releasers(drained);
        debug!(
            registry = %self.name,
            released = report.released,
            failed = report.failed,
            "Disposed all resources"
        );
        report
    }

    fn run_releasers(&self, drained: Vec<(ResourceId, Entry)>) -> DisposeReport {
        let mut report = DisposeReport::default();
        for (id, entry) in drained.into_iter().rev() {
            match (entry.releaser)() {
                Ok(()) => report.released += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        registry = %self.name,
                        resource_id = %id,
                        kind = %entry.kind,
                        label = %entry.label,
                        error = %e,
                        "Resource release failed"
                    );
                }
            }
        }
        report
    }

    /// Whether `id` is still registered
    pub fn is_registered(&self, id: ResourceId) -> bool {
        self.entries().contains_key(&id)
    }

    /// Number of resources still registered
    pub fn outstanding(&self) -> usize {
        self.entries().len()
    }

    /// Number of resources of `kind` still registered
    pub fn outstanding_by_kind(&self, kind: ResourceKind) -> usize {
        self.entries().values().filter(|e| e.kind == kind).count()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("name", &self.name)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl Drop for ResourceRegistry {
    fn drop(&mut self) {
        let report = self.dispose_all();
        if report.released + report.failed > 0 {
            warn!(
                registry = %self.name,
                released = report.released,
                failed = report.failed,
                "Registry dropped with outstanding resources"
            );
        }
    }
}
