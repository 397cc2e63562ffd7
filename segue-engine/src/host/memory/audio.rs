//! Automation-evaluating mixing graph of the memory host

use crate::error::{Error, Result};
use crate::host::{AudioGraph, AudioSourceId, NodeId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

const DESTINATION: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Automation {
    Set { time: f64, value: f64 },
    Ramp { time: f64, value: f64 },
}

impl Automation {
    fn time(&self) -> f64 {
        match self {
            Automation::Set { time, .. } | Automation::Ramp { time, .. } => *time,
        }
    }

    fn value(&self) -> f64 {
        match self {
            Automation::Set { value, .. } | Automation::Ramp { value, .. } => *value,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct GainState {
    initial: f64,
    /// Kept sorted by time; equal times keep insertion order
    events: Vec<Automation>,
}

impl GainState {
    fn insert(&mut self, event: Automation) {
        let at = self.events.partition_point(|e| e.time() <= event.time());
        self.events.insert(at, event);
    }

    fn value_at(&self, t: f64) -> f64 {
        let mut value = self.initial;
        let mut previous: Option<(f64, f64)> = None;

        for event in &self.events {
            if event.time() <= t {
                value = event.value();
                previous = Some((event.time(), event.value()));
                continue;
            }
            if let (Automation::Ramp { time, value: target }, Some((t0, v0))) = (event, previous) {
                let span = time - t0;
                if span > 0.0 {
                    value = v0 + (target - v0) * (t - t0) / span;
                }
            }
            break;
        }
        value
    }
}

#[derive(Default)]
struct GraphState {
    next_node: NodeId,
    gains: HashMap<NodeId, GainState>,
    sources: HashMap<NodeId, AudioSourceId>,
    edges: Vec<(NodeId, NodeId)>,
    closed: bool,
}

/// Mixing graph with exact gain automation on a tokio clock
pub struct MemoryAudioGraph {
    started: Instant,
    state: Mutex<GraphState>,
}

impl MemoryAudioGraph {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            state: Mutex::new(GraphState {
                next_node: DESTINATION + 1,
                ..GraphState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_state(&self) -> Result<MutexGuard<'_, GraphState>> {
        let state = self.state();
        if state.closed {
            return Err(Error::Host("mixing context is closed".to_string()));
        }
        Ok(state)
    }

    /// Gain value of `node` at graph time `t`
    pub fn gain_at(&self, node: NodeId, t: f64) -> f64 {
        self.state()
            .gains
            .get(&node)
            .map(|gain| gain.value_at(t))
            .unwrap_or(0.0)
    }

    /// Audio sources connected directly into `node`
    pub fn sources_feeding(&self, node: NodeId) -> Vec<AudioSourceId> {
        let state = self.state();
        state
            .edges
            .iter()
            .filter(|(_, to)| *to == node)
            .filter_map(|(from, _)| state.sources.get(from).copied())
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.state().edges.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl Default for MemoryAudioGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioGraph for MemoryAudioGraph {
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn destination(&self) -> NodeId {
        DESTINATION
    }

    fn create_gain(&self, initial: f64) -> Result<NodeId> {
        let mut state = self.open_state()?;
        let node = state.next_node;
        state.next_node += 1;
        state.gains.insert(
            node,
            GainState {
                initial,
                events: Vec::new(),
            },
        );
        Ok(node)
    }

    fn create_media_source(&self, source: AudioSourceId) -> Result<NodeId> {
        let mut state = self.open_state()?;
        let node = state.next_node;
        state.next_node += 1;
        state.sources.insert(node, source);
        Ok(node)
    }

    fn connect(&self, from: NodeId, to: NodeId) -> Result<()> {
        let mut state = self.open_state()?;
        let known = |n: NodeId| n == DESTINATION || state.gains.contains_key(&n) || state.sources.contains_key(&n);
        if !known(from) || !known(to) {
            return Err(Error::Host(format!("cannot connect unknown node {} -> {}", from, to)));
        }
        state.edges.push((from, to));
        Ok(())
    }

    fn disconnect(&self, node: NodeId) -> Result<()> {
        let mut state = self.open_state()?;
        state.edges.retain(|(from, _)| *from != node);
        Ok(())
    }

    fn set_value_at(&self, gain: NodeId, value: f64, at: f64) -> Result<()> {
        let mut state = self.open_state()?;
        let gain = state
            .gains
            .get_mut(&gain)
            .ok_or_else(|| Error::Host(format!("node {} is not a gain", gain)))?;
        gain.insert(Automation::Set { time: at, value });
        Ok(())
    }

    fn linear_ramp_to(&self, gain: NodeId, value: f64, end: f64) -> Result<()> {
        let mut state = self.open_state()?;
        let gain = state
            .gains
            .get_mut(&gain)
            .ok_or_else(|| Error::Host(format!("node {} is not a gain", gain)))?;
        gain.insert(Automation::Ramp { time: end, value });
        Ok(())
    }

    fn cancel_scheduled(&self, gain: NodeId, from: f64) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(gain) = state.gains.get_mut(&gain) {
            gain.events.retain(|e| e.time() < from);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::Host("mixing context closed twice".to_string()));
        }
        state.closed = true;
        state.edges.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ramp_interpolates_from_previous_point() {
        let graph = MemoryAudioGraph::new();
        let gain = graph.create_gain(1.0).unwrap();
        graph.set_value_at(gain, 1.0, 2.0).unwrap();
        graph.linear_ramp_to(gain, 0.0, 3.0).unwrap();

        assert_eq!(graph.gain_at(gain, 1.0), 1.0);
        assert_eq!(graph.gain_at(gain, 2.5), 0.5);
        assert_eq!(graph.gain_at(gain, 3.0), 0.0);
        assert_eq!(graph.gain_at(gain, 9.0), 0.0);
    }

    #[test]
    fn test_cancel_scheduled_drops_future_points() {
        let graph = MemoryAudioGraph::new();
        let gain = graph.create_gain(0.0).unwrap();
        graph.set_value_at(gain, 0.5, 1.0).unwrap();
        graph.set_value_at(gain, 0.9, 2.0).unwrap();
        graph.cancel_scheduled(gain, 1.5).unwrap();

        assert_eq!(graph.gain_at(gain, 5.0), 0.5);
    }

    #[test]
    fn test_disconnect_and_close() {
        let graph = MemoryAudioGraph::new();
        let gain = graph.create_gain(1.0).unwrap();
        let source = graph.create_media_source(42).unwrap();
        graph.connect(source, gain).unwrap();
        graph.connect(gain, graph.destination()).unwrap();
        assert_eq!(graph.sources_feeding(gain), vec![42]);

        graph.disconnect(source).unwrap();
        assert!(graph.sources_feeding(gain).is_empty());
        assert!(graph.connect(source, 999).is_err());

        graph.close().unwrap();
        assert!(graph.close().is_err());
        assert!(graph.create_gain(1.0).is_err());
    }
}
