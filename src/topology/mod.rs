//! Hardware topology discovery
//!
//! Memspaces only need two things from the hardware topology: the list of
//! NUMA nodes, and the memory bandwidth between those nodes. This module
//! defines the [`TopologySource`] interface through which they are queried,
//! along with a Linux sysfs implementation and a synthetic one.

pub mod synthetic;
pub mod sysfs;

use crate::{errors::MemoryError, memory::nodemask::NodeId};
use std::sync::Arc;

/// Source of NUMA topology information
///
/// Discovery can be slow, so callers are expected to cache the results of
/// [`numa_nodes()`](Self::numa_nodes) rather than query it repeatedly.
pub trait TopologySource: Send + Sync {
    /// Enumerate the NUMA nodes of the machine, by increasing OS index
    ///
    /// # Errors
    ///
    /// [`MemoryError::Unknown`] if the topology cannot be read.
    fn numa_nodes(&self) -> Result<Vec<NodeId>, MemoryError>;

    /// Read bandwidth from NUMA node `initiator` to NUMA node `target`, in
    /// MiB/s
    ///
    /// # Errors
    ///
    /// - [`MemoryError::NotSupported`] if the platform does not report this
    ///   value
    /// - [`MemoryError::Unknown`] if the topology cannot be read
    fn bandwidth(&self, initiator: NodeId, target: NodeId) -> Result<u64, MemoryError>;

    /// Read bandwidth to NUMA node `target` from its best initiator, in MiB/s
    ///
    /// # Errors
    ///
    /// Same as [`bandwidth()`](Self::bandwidth).
    fn best_initiator_bandwidth(&self, target: NodeId) -> Result<u64, MemoryError>;
}
//
impl<T: TopologySource + ?Sized> TopologySource for Arc<T> {
    fn numa_nodes(&self) -> Result<Vec<NodeId>, MemoryError> {
        (**self).numa_nodes()
    }

    fn bandwidth(&self, initiator: NodeId, target: NodeId) -> Result<u64, MemoryError> {
        (**self).bandwidth(initiator, target)
    }

    fn best_initiator_bandwidth(&self, target: NodeId) -> Result<u64, MemoryError> {
        (**self).best_initiator_bandwidth(target)
    }
}
