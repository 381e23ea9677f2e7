//! Predefined memspaces
//!
//! Three memspaces are predefined, and built lazily on first use:
//!
//! - [`host_all()`](PredefinedMemspaces::host_all) holds every NUMA node of
//!   the host, by increasing OS index.
//! - [`hbw()`](PredefinedMemspaces::hbw) holds the NUMA nodes with
//!   high-bandwidth memory.
//! - [`highest_bandwidth()`](PredefinedMemspaces::highest_bandwidth) holds
//!   every NUMA node by decreasing bandwidth, or the nodes listed in the
//!   [`HIGHEST_BANDWIDTH_ENV`] environment variable if it is set.
//!
//! A predefined memspace that cannot be built on this host, e.g. because the
//! firmware does not report memory bandwidth, is `None`.

use super::Memspace;
use crate::{
    config::{ConfigSource, HIGHEST_BANDWIDTH_ENV},
    errors::{InvalidArgument, MemoryError},
    topology::{sysfs::SysfsTopology, TopologySource},
};
use std::{
    fmt::{self, Debug, Formatter},
    sync::OnceLock,
};

/// Lazily built predefined memspaces over some topology
///
/// Each memspace is built at most once, by whichever thread first asks for
/// it, and concurrent callers wait for that construction to complete. The
/// outcome, including `None`, is remembered until [`shutdown()`] is called.
///
/// Most applications will want to use the process-wide [`global()`]
/// instance, which describes the host.
///
/// [`global()`]: PredefinedMemspaces::global
/// [`shutdown()`]: PredefinedMemspaces::shutdown
pub struct PredefinedMemspaces {
    topology: Box<dyn TopologySource>,
    config: ConfigSource,
    host_all: OnceLock<Option<Memspace>>,
    hbw: OnceLock<Option<Memspace>>,
    highest_bandwidth: OnceLock<Option<Memspace>>,
}
//
impl PredefinedMemspaces {
    /// Predefined memspaces over `topology`, configured by the environment
    pub fn new(topology: impl TopologySource + 'static) -> Self {
        Self::with_config(topology, ConfigSource::Environment)
    }

    /// Predefined memspaces over `topology`, with a chosen configuration
    pub fn with_config(topology: impl TopologySource + 'static, config: ConfigSource) -> Self {
        Self {
            topology: Box::new(topology),
            config,
            host_all: OnceLock::new(),
            hbw: OnceLock::new(),
            highest_bandwidth: OnceLock::new(),
        }
    }

    /// Process-wide predefined memspaces of the host
    ///
    /// These are read from sysfs and configured by the process environment.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<PredefinedMemspaces> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(SysfsTopology::new()))
    }

    /// Topology that the memspaces are built from
    pub fn topology(&self) -> &dyn TopologySource {
        &*self.topology
    }

    /// Memspace of every NUMA node, by increasing OS index
    ///
    /// # Panics
    ///
    /// In debug builds, if topology discovery fails.
    pub fn host_all(&self) -> Option<&Memspace> {
        self.host_all
            .get_or_init(|| settle("host_all", self.build_host_all()))
            .as_ref()
    }

    /// Memspace of the NUMA nodes with high-bandwidth memory
    ///
    /// # Panics
    ///
    /// In debug builds, if topology discovery fails.
    pub fn hbw(&self) -> Option<&Memspace> {
        self.hbw
            .get_or_init(|| settle("hbw", self.build_hbw()))
            .as_ref()
    }

    /// Memspace of every NUMA node, by decreasing bandwidth
    ///
    /// The bandwidth of a node is the read bandwidth from its best initiator.
    /// If [`HIGHEST_BANDWIDTH_ENV`] is set, the memspace instead holds the
    /// nodes that it lists, in order, and the topology is not queried.
    ///
    /// This is `None` if node bandwidths are not known, or if the environment
    /// variable is malformed.
    ///
    /// # Panics
    ///
    /// In debug builds, if topology discovery fails.
    pub fn highest_bandwidth(&self) -> Option<&Memspace> {
        self.highest_bandwidth
            .get_or_init(|| settle("highest_bandwidth", self.build_highest_bandwidth()))
            .as_ref()
    }

    /// Destroy the predefined memspaces
    ///
    /// The next call to an accessor builds the corresponding memspace again.
    /// Any memspace obtained before the call must have been released, which
    /// the exclusive borrow enforces.
    pub fn shutdown(&mut self) {
        let destroyed = [
            self.host_all.take(),
            self.hbw.take(),
            self.highest_bandwidth.take(),
        ];
        let live = destroyed.iter().flatten().flatten().count();
        tracing::debug!("shut down {live} predefined memspace(s)");
    }

    /// Build the memspace of all NUMA nodes
    fn build_host_all(&self) -> Result<Memspace, MemoryError> {
        let nodes = self.topology.numa_nodes()?;
        Memspace::create_from_numa_ids(&nodes)
    }

    /// Build the memspace of high-bandwidth NUMA nodes
    fn build_hbw(&self) -> Result<Memspace, MemoryError> {
        // TODO: Only keep nodes with high-bandwidth memory once TopologySource
        //       exposes the HMAT memory kind of each node
        let nodes = self.topology.numa_nodes()?;
        Memspace::create_from_numa_ids(&nodes)
    }

    /// Build the memspace of NUMA nodes by decreasing bandwidth
    fn build_highest_bandwidth(&self) -> Result<Memspace, MemoryError> {
        match self.config.load().highest_bandwidth_override() {
            Ok(nodes) => return Memspace::create_from_numa_ids(&nodes),
            Err(error) if error.is_not_supported() => {}
            Err(error) => return Err(error),
        }
        let host_all = self.host_all().ok_or(MemoryError::Unknown {
            api: "building the host_all memspace",
            errno: None,
        })?;
        let mut memspace = host_all.try_clone()?;
        memspace.sort_desc(|target| target.bandwidth(None, self.topology()))?;
        Ok(memspace)
    }
}
//
impl Debug for PredefinedMemspaces {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredefinedMemspaces")
            .field("config", &self.config)
            .field("host_all", &self.host_all)
            .field("hbw", &self.hbw)
            .field("highest_bandwidth", &self.highest_bandwidth)
            .finish_non_exhaustive()
    }
}

/// Turn the outcome of a predefined memspace construction into its final
/// state
fn settle(name: &'static str, result: Result<Memspace, MemoryError>) -> Option<Memspace> {
    match result {
        Ok(memspace) => {
            tracing::info!(
                "{name} memspace ready with NUMA nodes {:?}",
                memspace.numa_ids()
            );
            Some(memspace)
        }
        Err(error) if error.is_not_supported() => {
            tracing::info!("{name} memspace is unavailable: {error}");
            None
        }
        Err(MemoryError::InvalidArgument(InvalidArgument::NodeList(_))) => {
            tracing::info!("{name} memspace is unavailable: {HIGHEST_BANDWIDTH_ENV} is malformed");
            None
        }
        Err(error) => {
            tracing::error!("failed to build the {name} memspace: {error}");
            if cfg!(debug_assertions) {
                panic!("predefined memspace {name} should always be buildable, but got {error}");
            }
            None
        }
    }
}
