//! Linux sysfs topology
//!
//! NUMA nodes are listed in `/sys/devices/system/node/online`, and firmware
//! memory attributes (ACPI HMAT) are exposed per target node under
//! `node<N>/access0/initiators/`, where `access0` describes accesses from the
//! node's best initiators.

use super::TopologySource;
use crate::{errors::MemoryError, memory::nodemask::NodeId};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// Topology read from the Linux sysfs pseudo-filesystem
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SysfsTopology {
    root: PathBuf,
}
//
impl SysfsTopology {
    /// Location of the NUMA node directory on Linux
    pub const DEFAULT_ROOT: &'static str = "/sys/devices/system/node";

    /// Topology of the host
    pub fn new() -> Self {
        Self::with_root(Self::DEFAULT_ROOT)
    }

    /// Topology described by a sysfs-like directory tree at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory that this topology is read from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory describing the best initiators of `target`
    fn initiators_dir(&self, target: NodeId) -> PathBuf {
        self.root
            .join(format!("node{target}"))
            .join("access0")
            .join("initiators")
    }
}
//
impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}
//
impl TopologySource for SysfsTopology {
    /// NUMA nodes listed as online
    ///
    /// A node directory without any online node is reported as an error,
    /// since every machine has at least one memory node.
    fn numa_nodes(&self) -> Result<Vec<NodeId>, MemoryError> {
        match fs::read_to_string(self.root.join("online")) {
            Ok(list) => parse_node_ranges(&list)
                .filter(|nodes| !nodes.is_empty())
                .ok_or(MemoryError::Unknown {
                    api: "parsing the online NUMA node list",
                    errno: None,
                }),
            // Kernels without NUMA support (and non-Linux OSes) have no node
            // directory, memory then behaves as a single node
            Err(error) if error.kind() == io::ErrorKind::NotFound && !self.root.exists() => {
                Ok(vec![NodeId::new(0)])
            }
            Err(error) => Err(MemoryError::from_io(
                "reading the online NUMA node list",
                &error,
            )),
        }
    }

    /// Bandwidth from `initiator` to `target`
    ///
    /// sysfs only describes accesses from the best initiators of a node
    /// (`access0`), so this is an approximation: every initiator listed there
    /// gets the best-initiator bandwidth, and other initiators are reported
    /// as [`MemoryError::NotSupported`].
    fn bandwidth(&self, initiator: NodeId, target: NodeId) -> Result<u64, MemoryError> {
        let best = self.best_initiator_bandwidth(target)?;
        let initiators = self.initiators_dir(target);
        if initiators.join(format!("node{initiator}")).exists() {
            Ok(best)
        } else {
            Err(MemoryError::NotSupported(
                "bandwidth attributes for non-local initiators",
            ))
        }
    }

    fn best_initiator_bandwidth(&self, target: NodeId) -> Result<u64, MemoryError> {
        let path = self.initiators_dir(target).join("read_bandwidth");
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(MemoryError::NotSupported("memory bandwidth attributes"))
            }
            Err(error) => {
                return Err(MemoryError::from_io(
                    "reading a memory bandwidth attribute",
                    &error,
                ))
            }
        };
        text.trim().parse().map_err(|_| MemoryError::Unknown {
            api: "parsing a memory bandwidth attribute",
            errno: None,
        })
    }
}

/// Parse a node list in the Linux list format, e.g. `0-3,5`
fn parse_node_ranges(list: &str) -> Option<Vec<NodeId>> {
    let mut nodes = Vec::new();
    for range in list.trim().split(',').filter(|range| !range.is_empty()) {
        let (first, last) = match range.split_once('-') {
            Some((first, last)) => (first.parse::<u32>().ok()?, last.parse::<u32>().ok()?),
            None => {
                let node = range.parse::<u32>().ok()?;
                (node, node)
            }
        };
        if first > last {
            return None;
        }
        nodes.extend((first..=last).map(NodeId::new));
    }
    Some(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    #[allow(unused)]
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    fn ids(nodes: &[u32]) -> Vec<NodeId> {
        nodes.iter().copied().map(NodeId::new).collect()
    }

    /// Fake node directory with nodes 0, 1 and 3, where node 3 is memory-only
    /// and reports HMAT attributes with node 1 as its best initiator
    fn fake_sysfs() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("online"), "0-1,3\n").unwrap();
        for node in [0, 1] {
            fs::create_dir(dir.path().join(format!("node{node}"))).unwrap();
        }
        let initiators = dir.path().join("node3/access0/initiators");
        fs::create_dir_all(&initiators).unwrap();
        fs::write(initiators.join("read_bandwidth"), "20480\n").unwrap();
        fs::write(initiators.join("node1"), "").unwrap();
        dir
    }

    #[test]
    fn node_ranges() {
        assert_eq!(parse_node_ranges("0\n"), Some(ids(&[0])));
        assert_eq!(parse_node_ranges("0-2,5,7-8"), Some(ids(&[0, 1, 2, 5, 7, 8])));
        assert_eq!(parse_node_ranges("\n"), Some(Vec::new()));
        assert_eq!(parse_node_ranges("3-1"), None);
        assert_eq!(parse_node_ranges("0,a"), None);
        assert_eq!(parse_node_ranges("-1"), None);
    }

    #[test]
    fn discovery() {
        let dir = fake_sysfs();
        let topology = SysfsTopology::with_root(dir.path());
        assert_eq!(topology.root(), dir.path());
        assert_eq!(topology.numa_nodes().unwrap(), ids(&[0, 1, 3]));
    }

    #[test]
    fn single_node_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let topology = SysfsTopology::with_root(dir.path().join("missing"));
        assert_eq!(topology.numa_nodes().unwrap(), ids(&[0]));
    }

    #[test]
    fn unreadable_node_list() {
        let dir = tempfile::tempdir().unwrap();
        let topology = SysfsTopology::with_root(dir.path());
        assert!(matches!(
            topology.numa_nodes(),
            Err(MemoryError::Unknown { .. })
        ));

        fs::write(dir.path().join("online"), "zero").unwrap();
        assert!(matches!(
            topology.numa_nodes(),
            Err(MemoryError::Unknown { .. })
        ));

        fs::write(dir.path().join("online"), "\n").unwrap();
        assert!(matches!(
            topology.numa_nodes(),
            Err(MemoryError::Unknown { .. })
        ));
    }

    #[test]
    fn bandwidth() {
        let dir = fake_sysfs();
        let topology = SysfsTopology::with_root(dir.path());
        let (node0, node1, node3) = (NodeId::new(0), NodeId::new(1), NodeId::new(3));

        assert_eq!(topology.best_initiator_bandwidth(node3), Ok(20480));
        assert_eq!(topology.bandwidth(node1, node3), Ok(20480));
        assert!(topology
            .bandwidth(node0, node3)
            .unwrap_err()
            .is_not_supported());
        assert!(topology
            .best_initiator_bandwidth(node0)
            .unwrap_err()
            .is_not_supported());

        fs::write(
            dir.path().join("node3/access0/initiators/read_bandwidth"),
            "fast",
        )
        .unwrap();
        assert!(matches!(
            topology.best_initiator_bandwidth(node3),
            Err(MemoryError::Unknown { .. })
        ));
    }
}
