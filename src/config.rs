//! Configuration of the predefined memspaces
//!
//! The only tunable is the `UMF_MEMSPACE_HIGHEST_BANDWIDTH` environment
//! variable, which replaces the topology-based discovery of the
//! [highest bandwidth memspace](crate::memspace::predefined::PredefinedMemspaces::highest_bandwidth)
//! with an explicit list of NUMA nodes, e.g. `UMF_MEMSPACE_HIGHEST_BANDWIDTH="0,2 3"`.

use crate::{
    errors::MemoryError,
    memory::nodemask::{NodeId, NodeMask},
};
use arrayvec::ArrayVec;
use std::env;
use thiserror::Error;

/// Environment variable that overrides the highest bandwidth memspace
pub const HIGHEST_BANDWIDTH_ENV: &str = "UMF_MEMSPACE_HIGHEST_BANDWIDTH";

/// Maximal number of NUMA nodes in an overriding node list
pub const MAX_NUMA_NODES: usize = 512;

/// Node list parsed from an environment variable
pub type NodeList = ArrayVec<NodeId, MAX_NUMA_NODES>;

/// Error while parsing a node list
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum NodeListError {
    /// A token is not a valid NUMA node OS index
    #[error("{0:?} is not a valid NUMA node id")]
    InvalidToken(String),

    /// A node is beyond the highest node that memory can be bound to
    #[error("NUMA node {node} is above the highest supported node {max}")]
    NodeOutOfRange {
        /// Offending node
        node: NodeId,

        /// Highest supported node
        max: NodeId,
    },

    /// The list names more nodes than can be handled
    #[error("node list has {count} entries, but at most {max} are supported")]
    TooManyNodes {
        /// Number of entries in the list
        count: usize,

        /// Maximal supported number of entries
        max: usize,
    },

    /// The list does not name any node
    #[error("node list is empty")]
    Empty,
}

/// Parse a list of NUMA node OS indices separated by spaces and/or commas
///
/// Nodes are returned in the order where they appear in the list.
///
/// # Errors
///
/// - [`InvalidToken`] if a token is not a decimal number that fits in `u32`
/// - [`NodeOutOfRange`] if a node is above [`NodeMask::MAX_NODE`]
/// - [`TooManyNodes`] if the list has more than [`MAX_NUMA_NODES`] entries
/// - [`Empty`] if the list does not contain any token
///
/// [`Empty`]: NodeListError::Empty
/// [`InvalidToken`]: NodeListError::InvalidToken
/// [`NodeOutOfRange`]: NodeListError::NodeOutOfRange
/// [`TooManyNodes`]: NodeListError::TooManyNodes
pub fn parse_node_list(list: &str) -> Result<NodeList, NodeListError> {
    let mut nodes = NodeList::new();
    let mut count = 0;
    for token in list.split([' ', ',']).filter(|token| !token.is_empty()) {
        let invalid = || NodeListError::InvalidToken(token.to_owned());
        if !token.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(invalid());
        }
        let node = NodeId::new(token.parse().map_err(|_| invalid())?);
        if node > NodeMask::MAX_NODE {
            return Err(NodeListError::NodeOutOfRange {
                node,
                max: NodeMask::MAX_NODE,
            });
        }
        // Tokens past the capacity are still validated and counted, so that
        // the error reports the full size of the list
        if count < MAX_NUMA_NODES {
            nodes.push(node);
        }
        count += 1;
    }
    if count > MAX_NUMA_NODES {
        return Err(NodeListError::TooManyNodes {
            count,
            max: MAX_NUMA_NODES,
        });
    }
    if nodes.is_empty() {
        return Err(NodeListError::Empty);
    }
    Ok(nodes)
}

/// Configuration of the predefined memspaces
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct MemspaceConfig {
    /// Raw value of [`HIGHEST_BANDWIDTH_ENV`], if set
    pub highest_bandwidth_nodes: Option<String>,
}
//
impl MemspaceConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Self {
        Self {
            highest_bandwidth_nodes: env::var(HIGHEST_BANDWIDTH_ENV).ok(),
        }
    }

    /// Node list that overrides the highest bandwidth memspace
    ///
    /// # Errors
    ///
    /// - [`MemoryError::NotSupported`] if no override is configured, in which
    ///   case topology discovery should be used
    /// - [`MemoryError::InvalidArgument`] if the override is malformed
    pub fn highest_bandwidth_override(&self) -> Result<NodeList, MemoryError> {
        let Some(list) = &self.highest_bandwidth_nodes else {
            return Err(MemoryError::NotSupported(
                "highest bandwidth memspace override",
            ));
        };
        parse_node_list(list).map_err(|error| {
            tracing::warn!("ignoring malformed {HIGHEST_BANDWIDTH_ENV}={list:?}: {error}");
            error.into()
        })
    }
}

/// Where the predefined memspaces get their configuration from
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum ConfigSource {
    /// Read the process environment when a memspace is first built
    #[default]
    Environment,

    /// Use a fixed configuration
    Fixed(MemspaceConfig),
}
//
impl ConfigSource {
    /// Current configuration
    pub fn load(&self) -> MemspaceConfig {
        match self {
            Self::Environment => MemspaceConfig::from_env(),
            Self::Fixed(config) => config.clone(),
        }
    }
}
