//! NUMA node memory targets
//!
//! A NUMA memory target stands for one NUMA node. A set of such targets
//! resolves to the [OS memory provider](crate::provider::os), bound to the
//! node mask of the set.

use super::{
    nodemask::{NodeId, NodeMask},
    target::MemoryTargetOps,
};
use crate::{
    errors::{InvalidArgument, MemoryError},
    memspace::{policy::MemspacePolicy, Memspace},
    pool::{proxy::PROXY_POOL_OPS, MemoryPool},
    provider::{
        os::{NumaMode, OsMemoryProviderParams, OS_MEMORY_PROVIDER_OPS},
        MemoryProvider,
    },
    topology::TopologySource,
};

/// Parameters of a NUMA memory target
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct NumaTargetConfig {
    /// OS index of the NUMA node
    pub id: NodeId,
}

/// State of a NUMA memory target
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct NumaTarget {
    id: NodeId,
}
//
impl NumaTarget {
    /// OS index of the NUMA node
    pub fn id(&self) -> NodeId {
        self.id
    }
}

/// Ops of NUMA memory targets
#[derive(Debug)]
pub struct NumaTargetOps;

/// The one instance of [`NumaTargetOps`]
pub static NUMA_MEMORY_TARGET_OPS: NumaTargetOps = NumaTargetOps;

impl MemoryTargetOps for NumaTargetOps {
    type Params = NumaTargetConfig;
    type State = NumaTarget;

    fn name(&self) -> &'static str {
        "numa"
    }

    fn initialize(&self, config: &NumaTargetConfig) -> Result<NumaTarget, MemoryError> {
        if config.id > NodeMask::MAX_NODE {
            return Err(InvalidArgument::NodeOutOfRange(config.id).into());
        }
        Ok(NumaTarget { id: config.id })
    }

    fn finalize(&self, _state: NumaTarget) {}

    fn clone_state(&self, state: &NumaTarget) -> Result<NumaTarget, MemoryError> {
        self.initialize(&NumaTargetConfig { id: state.id })
    }

    fn pool_create_from_memspace(
        &self,
        _memspace: &Memspace,
        targets: &[&NumaTarget],
        policy: Option<&MemspacePolicy>,
    ) -> Result<MemoryPool<'static>, MemoryError> {
        let params = provider_params(targets, policy)?;
        MemoryPool::create_with_provider(&PROXY_POOL_OPS, &(), &OS_MEMORY_PROVIDER_OPS, &params)
    }

    fn provider_create_from_memspace(
        &self,
        _memspace: &Memspace,
        targets: &[&NumaTarget],
        policy: Option<&MemspacePolicy>,
    ) -> Result<MemoryProvider, MemoryError> {
        let params = provider_params(targets, policy)?;
        MemoryProvider::create(&OS_MEMORY_PROVIDER_OPS, &params)
    }

    fn bandwidth(
        &self,
        state: &NumaTarget,
        initiator: Option<NodeId>,
        topology: &dyn TopologySource,
    ) -> Result<u64, MemoryError> {
        match initiator {
            Some(initiator) => topology.bandwidth(initiator, state.id),
            None => topology.best_initiator_bandwidth(state.id),
        }
    }
}

/// OS provider parameters that bind memory to a set of NUMA targets
///
/// # Errors
///
/// [`EmptyMemspace`] if `targets` is empty, since an empty node mask would
/// silently disable NUMA binding.
///
/// [`EmptyMemspace`]: InvalidArgument::EmptyMemspace
fn provider_params(
    targets: &[&NumaTarget],
    policy: Option<&MemspacePolicy>,
) -> Result<OsMemoryProviderParams, MemoryError> {
    if targets.is_empty() {
        return Err(InvalidArgument::EmptyMemspace.into());
    }
    let nodemask = targets.iter().map(|target| target.id).collect::<NodeMask>();
    let numa_mode = match policy {
        None => NumaMode::Default,
        Some(MemspacePolicy::Bind) => NumaMode::Bind,
        Some(MemspacePolicy::Interleave) => NumaMode::Interleave,
        Some(MemspacePolicy::Preferred) => NumaMode::Preferred,
    };
    Ok(OsMemoryProviderParams {
        numa_mode,
        ..Default::default()
    }
    .with_nodemask(nodemask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::target::MemoryTarget,
        provider::os::{NumaFlags, Protection, Visibility},
        strategies::{memspace_policy, node_ids},
        topology::synthetic::SyntheticTopology,
    };
    use proptest::prelude::*;
    #[allow(unused)]
    use similar_asserts::assert_eq;
    use strum::IntoEnumIterator;

    fn targets(ids: &[u32]) -> Vec<NumaTarget> {
        ids.iter()
            .map(|&id| NumaTarget { id: NodeId::new(id) })
            .collect()
    }

    fn params_of(ids: &[u32], policy: Option<&MemspacePolicy>) -> OsMemoryProviderParams {
        let targets = targets(ids);
        let refs = targets.iter().collect::<Vec<_>>();
        provider_params(&refs, policy).unwrap()
    }

    #[test]
    fn node_masks() {
        for (ids, words, maxnode) in [
            (&[0][..], &[0b1][..], 0),
            (&[0, 3][..], &[0b1001][..], 3),
            (&[5][..], &[0b10_0000][..], 5),
            (&[3, 0, 3][..], &[0b1001][..], 3),
        ] {
            let params = params_of(ids, None);
            assert_eq!(params.nodemask.as_words(), words);
            assert_eq!(params.maxnode, maxnode);
        }
    }

    #[test]
    fn default_params() {
        let params = params_of(&[1], None);
        assert_eq!(params.protection, Protection::READ | Protection::WRITE);
        assert_eq!(params.visibility, Visibility::Private);
        assert_eq!(params.numa_mode, NumaMode::Default);
        assert_eq!(params.numa_flags, NumaFlags::STRICT);
    }

    #[test]
    fn policies() {
        for policy in MemspacePolicy::iter() {
            let expected = match policy {
                MemspacePolicy::Bind => NumaMode::Bind,
                MemspacePolicy::Interleave => NumaMode::Interleave,
                MemspacePolicy::Preferred => NumaMode::Preferred,
            };
            assert_eq!(params_of(&[0, 1], Some(&policy)).numa_mode, expected);
        }
    }

    #[test]
    fn empty_target_set() {
        assert_eq!(
            provider_params(&[], None).unwrap_err(),
            MemoryError::from(InvalidArgument::EmptyMemspace)
        );
    }

    #[test]
    fn targets_and_clones() {
        let config = NumaTargetConfig {
            id: NodeId::new(2),
        };
        let target = MemoryTarget::create(&NUMA_MEMORY_TARGET_OPS, &config).unwrap();
        assert!(target.is_kind::<NumaTargetOps>());
        assert_eq!(target.kind_name(), "numa");
        let clone = target.try_clone().unwrap();
        drop(target);
        assert_eq!(clone.state::<NumaTarget>().map(NumaTarget::id), Some(config.id));

        let too_high = NodeId::new(NodeMask::MAX_NODE.os_index() + 1);
        assert_eq!(
            MemoryTarget::create(&NUMA_MEMORY_TARGET_OPS, &NumaTargetConfig { id: too_high })
                .unwrap_err(),
            MemoryError::from(InvalidArgument::NodeOutOfRange(too_high))
        );
    }

    #[test]
    fn bandwidth_queries() {
        let [node0, node1] = [0, 1].map(NodeId::new);
        let topology = SyntheticTopology::new([node0, node1])
            .with_bandwidth(node0, node1, 100)
            .with_bandwidth(node1, node1, 400);
        let target =
            MemoryTarget::create(&NUMA_MEMORY_TARGET_OPS, &NumaTargetConfig { id: node1 }).unwrap();
        assert_eq!(target.bandwidth(None, &topology), Ok(400));
        assert_eq!(target.bandwidth(Some(node0), &topology), Ok(100));

        let target =
            MemoryTarget::create(&NUMA_MEMORY_TARGET_OPS, &NumaTargetConfig { id: node0 }).unwrap();
        assert!(target
            .bandwidth(None, &topology)
            .unwrap_err()
            .is_not_supported());
    }

    proptest! {
        #[test]
        fn params_cover_every_target(
            nodes in node_ids(1..16),
            policy in memspace_policy(),
        ) {
            let targets = nodes.iter().map(|&id| NumaTarget { id }).collect::<Vec<_>>();
            let refs = targets.iter().collect::<Vec<_>>();
            let params = provider_params(&refs, policy.as_ref()).unwrap();

            let mut distinct = nodes.clone();
            distinct.sort_unstable();
            distinct.dedup();
            prop_assert_eq!(params.nodemask.iter_set().collect::<Vec<_>>(), distinct.clone());
            prop_assert_eq!(params.maxnode, distinct.last().unwrap().bit());
            prop_assert_eq!(params.numa_mode == NumaMode::Default, policy.is_none());
        }
    }
}
