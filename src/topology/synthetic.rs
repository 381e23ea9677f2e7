//! Synthetic topology
//!
//! A [`SyntheticTopology`] describes an imaginary machine whose NUMA nodes and
//! bandwidth attributes are fully specified by the caller. It also counts the
//! queries it receives, so that callers can check how often discovery runs.

use super::TopologySource;
use crate::{errors::MemoryError, memory::nodemask::NodeId};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Caller-specified topology
#[derive(Debug, Default)]
pub struct SyntheticTopology {
    /// NUMA nodes, sorted by OS index
    nodes: Vec<NodeId>,

    /// Bandwidth from each target's best initiator
    best_bandwidth: HashMap<NodeId, u64>,

    /// Bandwidth between (initiator, target) pairs
    pair_bandwidth: HashMap<(NodeId, NodeId), u64>,

    /// Truth that node discovery should fail
    failing_discovery: bool,

    /// Number of numa_nodes() calls so far
    discovery_calls: AtomicUsize,

    /// Number of bandwidth queries so far
    bandwidth_calls: AtomicUsize,
}
//
impl SyntheticTopology {
    /// Machine with the given NUMA nodes and no bandwidth attributes
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut nodes = nodes.into_iter().collect::<Vec<_>>();
        nodes.sort_unstable();
        nodes.dedup();
        Self {
            nodes,
            ..Default::default()
        }
    }

    /// Report `bandwidth` MiB/s from the best initiator of `target`
    pub fn with_best_bandwidth(mut self, target: NodeId, bandwidth: u64) -> Self {
        self.best_bandwidth.insert(target, bandwidth);
        self
    }

    /// Report `bandwidth` MiB/s from `initiator` to `target`
    ///
    /// Unless [`with_best_bandwidth()`](Self::with_best_bandwidth) says
    /// otherwise, the best-initiator bandwidth of `target` is the highest
    /// pairwise bandwidth reported for it.
    pub fn with_bandwidth(mut self, initiator: NodeId, target: NodeId, bandwidth: u64) -> Self {
        self.pair_bandwidth.insert((initiator, target), bandwidth);
        self
    }

    /// Make node discovery fail
    pub fn with_failing_discovery(mut self) -> Self {
        self.failing_discovery = true;
        self
    }

    /// Number of times node discovery was queried
    pub fn discovery_count(&self) -> usize {
        self.discovery_calls.load(Ordering::Relaxed)
    }

    /// Number of times a bandwidth was queried
    pub fn bandwidth_query_count(&self) -> usize {
        self.bandwidth_calls.load(Ordering::Relaxed)
    }
}
//
impl TopologySource for SyntheticTopology {
    fn numa_nodes(&self) -> Result<Vec<NodeId>, MemoryError> {
        self.discovery_calls.fetch_add(1, Ordering::Relaxed);
        if self.failing_discovery {
            return Err(MemoryError::Unknown {
                api: "synthetic NUMA node discovery",
                errno: None,
            });
        }
        Ok(self.nodes.clone())
    }

    fn bandwidth(&self, initiator: NodeId, target: NodeId) -> Result<u64, MemoryError> {
        self.bandwidth_calls.fetch_add(1, Ordering::Relaxed);
        self.pair_bandwidth
            .get(&(initiator, target))
            .copied()
            .ok_or(MemoryError::NotSupported("memory bandwidth attributes"))
    }

    fn best_initiator_bandwidth(&self, target: NodeId) -> Result<u64, MemoryError> {
        self.bandwidth_calls.fetch_add(1, Ordering::Relaxed);
        self.best_bandwidth
            .get(&target)
            .copied()
            .or_else(|| {
                self.pair_bandwidth
                    .iter()
                    .filter(|((_, pair_target), _)| *pair_target == target)
                    .map(|(_, &bandwidth)| bandwidth)
                    .max()
            })
            .ok_or(MemoryError::NotSupported("memory bandwidth attributes"))
    }
}
