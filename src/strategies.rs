//! Common strategies for property-based testing
//!
//! Every proptest [`Strategy`] which cannot be handled by an [`Arbitrary`] impl
//! and is used by more than one module is centralized here.

use crate::{memory::nodemask::NodeId, memspace::policy::MemspacePolicy};
use proptest::{
    collection::{SizeRange, VecStrategy},
    option::OptionStrategy,
    prelude::*,
    sample::Select,
};
use strum::IntoEnumIterator;

/// Generate a memspace policy, or the lack of one
pub fn memspace_policy() -> MemspacePolicyStrategy {
    prop::option::of(prop::sample::select(
        MemspacePolicy::iter().collect::<Vec<_>>(),
    ))
}

/// Strategy emitted by [`memspace_policy()`]
pub type MemspacePolicyStrategy = OptionStrategy<Select<MemspacePolicy>>;

/// Generate a list of NUMA node ids, which may contain duplicates
pub fn node_ids(len: impl Into<SizeRange>) -> NodeIds {
    prop::collection::vec(any::<NodeId>(), len)
}

/// Strategy emitted by [`node_ids()`]
pub type NodeIds = VecStrategy<<NodeId as Arbitrary>::Strategy>;

/// Generate a textual node list along with the nodes that it names
///
/// Nodes are separated by a random mix of commas and spaces, the way users
/// write them in environment variables.
pub fn node_list(len: impl Into<SizeRange>) -> BoxedStrategy<(Vec<NodeId>, String)> {
    let separator = prop::sample::select(vec![",", " ", ", ", ",,", "  ", " ,"]);
    node_ids(len)
        .prop_flat_map(move |nodes| {
            let separators = prop::collection::vec(separator.clone(), nodes.len());
            (Just(nodes), separators)
        })
        .prop_map(|(nodes, separators)| {
            let list = nodes
                .iter()
                .zip(separators)
                .map(|(node, separator)| format!("{node}{separator}"))
                .collect::<String>();
            (nodes, list)
        })
        .boxed()
}
