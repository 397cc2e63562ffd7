//! Audio crossfade controller
//!
//! Graph layout:
//!
//! ```text
//! outgoing source ─▶ gain A ─┐
//!                            ├─▶ master gain ─▶ destination
//! incoming source ─▶ gain B ─┘
//! ```
//!
//! The two input paths swap roles after every boundary
//! ([`AudioSyncController::promote_incoming`]), so a clip keeps its gain node
//! from the moment it is connected as incoming until it is retired as
//! outgoing. Volume and mute act on the master gain only and never disturb
//! crossfade automation.

use crate::error::{Error, Result};
use crate::host::{AudioGraph, AudioSourceId, NodeId};
use crate::resources::{ResourceId, ResourceRegistry};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct GainPath {
    gain: NodeId,
    /// Media source node currently bound to this path
    source: Option<NodeId>,
}

/// Scheduled ramp window on the graph clock (seconds)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossfadeSchedule {
    pub start: f64,
    pub end: f64,
}

/// Two-path gain mixer keeping audio fades in step with video fades
pub struct AudioSyncController {
    graph: Arc<dyn AudioGraph>,
    registry: Arc<ResourceRegistry>,
    context_id: ResourceId,
    master: NodeId,
    paths: [GainPath; 2],
    outgoing: usize,
    volume: f64,
    muted: bool,
    disposed: bool,
}

impl AudioSyncController {
    /// Build the mixing graph on `graph`, registering it with `registry`
    pub fn new(graph: Arc<dyn AudioGraph>, registry: Arc<ResourceRegistry>) -> Result<Self> {
        let context_id = registry.register_mixing_context(Arc::clone(&graph));

        let build = || -> Result<(NodeId, [GainPath; 2])> {
            let master = graph.create_gain(1.0)?;
            graph.connect(master, graph.destination())?;

            let outgoing = graph.create_gain(1.0)?;
            let incoming = graph.create_gain(0.0)?;
            graph.connect(outgoing, master)?;
            graph.connect(incoming, master)?;

            Ok((
                master,
                [
                    GainPath { gain: outgoing, source: None },
                    GainPath { gain: incoming, source: None },
                ],
            ))
        };

        let (master, paths) = match build() {
            Ok(nodes) => nodes,
            Err(e) => {
                if let Err(release_err) = registry.release(context_id) {
                    warn!(error = %release_err, "Failed to close mixing context after build error");
                }
                return Err(e);
            }
        };

        Ok(Self {
            graph,
            registry,
            context_id,
            master,
            paths,
            outgoing: 0,
            volume: 1.0,
            muted: false,
            disposed: false,
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            return Err(Error::InvalidState("audio controller disposed".to_string()));
        }
        Ok(())
    }

    fn incoming(&self) -> usize {
        1 - self.outgoing
    }

    fn bind(&mut self, path: usize, source: Option<AudioSourceId>) -> Result<()> {
        self.ensure_live()?;

        if let Some(old) = self.paths[path].source.take() {
            self.graph.disconnect(old)?;
        }
        if let Some(source) = source {
            let node = self.graph.create_media_source(source)?;
            self.graph.connect(node, self.paths[path].gain)?;
            self.paths[path].source = Some(node);
        }
        Ok(())
    }

    /// Bind a clip's audio to the outgoing path, replacing any prior binding
    ///
    /// `None` (a silent clip) leaves the path unbound.
    pub fn connect_outgoing(&mut self, source: Option<AudioSourceId>) -> Result<()> {
        self.bind(self.outgoing, source)
    }

    /// Bind a clip's audio to the incoming path, replacing any prior binding
    pub fn connect_incoming(&mut self, source: Option<AudioSourceId>) -> Result<()> {
        let path = self.incoming();
        self.bind(path, source)?;
        // Incoming stays silent until its crossfade
        let now = self.graph.now();
        self.graph.cancel_scheduled(self.paths[path].gain, now)?;
        self.graph.set_value_at(self.paths[path].gain, 0.0, now)
    }

    /// Schedule outgoing 1→0 and incoming 0→1 over exactly `duration_ms`
    ///
    /// `at` is the start on the graph clock; `None` starts now.
    pub fn crossfade(&mut self, duration_ms: f64, at: Option<f64>) -> Result<CrossfadeSchedule> {
        self.ensure_live()?;

        let start = at.unwrap_or_else(|| self.graph.now());
        let end = start + duration_ms.max(0.0) / 1000.0;
        let out_gain = self.paths[self.outgoing].gain;
        let in_gain = self.paths[self.incoming()].gain;

        for (gain, from, to) in [(out_gain, 1.0, 0.0), (in_gain, 0.0, 1.0)] {
            self.graph.cancel_scheduled(gain, start)?;
            self.graph.set_value_at(gain, from, start)?;
            self.graph.linear_ramp_to(gain, to, end)?;
        }

        debug!(start, end, "Scheduled audio crossfade");
        Ok(CrossfadeSchedule { start, end })
    }

    /// Retire the outgoing path and make the incoming path the new outgoing
    pub fn promote_incoming(&mut self) -> Result<()> {
        self.ensure_live()?;

        let retired = self.outgoing;
        if let Some(node) = self.paths[retired].source.take() {
            self.graph.disconnect(node)?;
        }
        self.outgoing = self.incoming();

        let now = self.graph.now();
        let out_gain = self.paths[self.outgoing].gain;
        let in_gain = self.paths[retired].gain;
        self.graph.cancel_scheduled(out_gain, now)?;
        self.graph.set_value_at(out_gain, 1.0, now)?;
        self.graph.cancel_scheduled(in_gain, now)?;
        self.graph.set_value_at(in_gain, 0.0, now)
    }

    fn apply_master(&self) -> Result<()> {
        let value = if self.muted { 0.0 } else { self.volume };
        let now = self.graph.now();
        self.graph.cancel_scheduled(self.master, now)?;
        self.graph.set_value_at(self.master, value, now)
    }

    /// Scale the master path; clamped to `[0, 1]`
    pub fn set_volume(&mut self, volume: f64) -> Result<()> {
        self.ensure_live()?;
        self.volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.apply_master()
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        self.ensure_live()?;
        self.muted = muted;
        self.apply_master()
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Gain nodes of the `(outgoing, incoming)` paths
    pub fn gain_nodes(&self) -> (NodeId, NodeId) {
        (self.paths[self.outgoing].gain, self.paths[self.incoming()].gain)
    }

    pub fn master_node(&self) -> NodeId {
        self.master
    }

    /// Disconnect every node and release the mixing context; idempotent
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        let mut nodes: Vec<NodeId> = self.paths.iter().filter_map(|p| p.source).collect();
        nodes.extend(self.paths.iter().map(|p| p.gain));
        nodes.push(self.master);
        for node in nodes {
            if let Err(e) = self.graph.disconnect(node) {
                warn!(node, error = %e, "Failed to disconnect audio node");
            }
        }
        for path in self.paths.iter_mut() {
            path.source = None;
        }

        if let Err(e) = self.registry.release(self.context_id) {
            warn!(error = %e, "Failed to close mixing context");
        }
    }
}

impl Drop for AudioSyncController {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::MemoryAudioGraph;

    fn controller() -> (Arc<MemoryAudioGraph>, Arc<ResourceRegistry>, AudioSyncController) {
        let graph = Arc::new(MemoryAudioGraph::new());
        let registry = Arc::new(ResourceRegistry::new("audio"));
        let controller =
            AudioSyncController::new(graph.clone() as Arc<dyn AudioGraph>, Arc::clone(&registry))
                .unwrap();
        (graph, registry, controller)
    }

    #[tokio::test(start_paused = true)]
    async fn test_crossfade_gains_are_complementary() {
        let (graph, _registry, mut audio) = controller();
        audio.connect_outgoing(Some(1)).unwrap();
        audio.connect_incoming(Some(2)).unwrap();

        let (out_gain, in_gain) = audio.gain_nodes();
        let schedule = audio.crossfade(50.0, Some(10.0)).unwrap();
        assert_eq!(schedule, CrossfadeSchedule { start: 10.0, end: 10.05 });

        for step in 0..=10 {
            let t = 10.0 + 0.005 * step as f64;
            let sum = graph.gain_at(out_gain, t) + graph.gain_at(in_gain, t);
            assert!((sum - 1.0).abs() < 1e-9, "t={t} sum={sum}");
        }
        assert_eq!(graph.gain_at(out_gain, 9.0), 1.0);
        assert_eq!(graph.gain_at(in_gain, 9.0), 0.0);
        assert_eq!(graph.gain_at(out_gain, 10.06), 0.0);
        assert_eq!(graph.gain_at(in_gain, 11.0), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebinding_disconnects_previous_source() {
        let (graph, _registry, mut audio) = controller();
        audio.connect_incoming(Some(7)).unwrap();
        audio.connect_incoming(Some(8)).unwrap();

        let (_, in_gain) = audio.gain_nodes();
        assert_eq!(graph.sources_feeding(in_gain), vec![8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_promote_swaps_roles() {
        let (graph, _registry, mut audio) = controller();
        audio.connect_outgoing(Some(1)).unwrap();
        audio.connect_incoming(Some(2)).unwrap();
        let (old_out, old_in) = audio.gain_nodes();

        audio.crossfade(50.0, None).unwrap();
        audio.promote_incoming().unwrap();

        assert_eq!(audio.gain_nodes(), (old_in, old_out));
        assert_eq!(graph.sources_feeding(old_in), vec![2]);
        assert!(graph.sources_feeding(old_out).is_empty());
        let now = graph.now();
        assert_eq!(graph.gain_at(old_in, now), 1.0);
        assert_eq!(graph.gain_at(old_out, now), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_acts_on_master_only() {
        let (graph, _registry, mut audio) = controller();
        let (out_gain, _) = audio.gain_nodes();

        audio.set_volume(1.7).unwrap();
        assert_eq!(audio.volume(), 1.0);
        audio.set_volume(0.25).unwrap();
        let now = graph.now();
        assert_eq!(graph.gain_at(audio.master_node(), now), 0.25);
        assert_eq!(graph.gain_at(out_gain, now), 1.0);

        audio.set_muted(true).unwrap();
        assert_eq!(graph.gain_at(audio.master_node(), now), 0.0);
        audio.set_muted(false).unwrap();
        assert_eq!(graph.gain_at(audio.master_node(), now), 0.25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_build_reports_build_error_and_unregisters() {
        let graph = Arc::new(MemoryAudioGraph::new());
        graph.close().unwrap();
        let registry = Arc::new(ResourceRegistry::new("audio"));

        let err = AudioSyncController::new(graph.clone() as Arc<dyn AudioGraph>, Arc::clone(&registry))
            .err()
            .unwrap();

        // The second close fails on the host; the build error still wins
        assert!(err.to_string().contains("mixing context is closed"), "{err}");
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_closes_context_once() {
        let (graph, registry, mut audio) = controller();
        audio.connect_outgoing(Some(1)).unwrap();
        assert_eq!(registry.outstanding(), 1);

        audio.dispose();
        audio.dispose();
        assert!(graph.is_closed());
        assert_eq!(registry.outstanding(), 0);
        assert!(audio.crossfade(50.0, None).is_err());
    }
}
