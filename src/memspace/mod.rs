//! Memspaces
//!
//! A memspace is an ordered collection of [memory targets](MemoryTarget) of a
//! single kind. Order is significant: the first targets are the preferred
//! ones, e.g. those with the highest bandwidth.
//!
//! Memspaces are built from NUMA node ids or derived from other memspaces by
//! [cloning](Memspace::try_clone), [sorting](Memspace::sort_desc) or
//! [filtering](Memspace::filter). They are then turned into a
//! [`MemoryPool`] or a [`MemoryProvider`] by the memory targets they contain,
//! through [`Memspace::create_pool()`] and [`Memspace::create_provider()`].

pub mod policy;
pub mod predefined;

use self::policy::MemspacePolicy;
use crate::{
    errors::{InvalidArgument, MemoryError},
    memory::{
        nodemask::NodeId,
        numa::{NumaTarget, NumaTargetConfig, NUMA_MEMORY_TARGET_OPS},
        target::{DynMemoryTargetOps, MemoryTarget, StateRef},
    },
    pool::MemoryPool,
    provider::MemoryProvider,
    topology::TopologySource,
};
use std::{cmp::Reverse, slice};

/// Ordered, homogeneous collection of memory targets
///
/// A memspace exclusively owns its targets, which are destroyed along with
/// it. Memspaces are never empty.
#[derive(Debug)]
pub struct Memspace {
    targets: Vec<MemoryTarget>,
}
//
impl Memspace {
    /// Memspace of NUMA memory targets, one per node of `ids`, in order
    ///
    /// # Errors
    ///
    /// - [`EmptyNodeList`] if `ids` is empty
    /// - [`NodeOutOfRange`] if a node cannot be bound to
    /// - [`MemoryError::OutOfHostMemory`] if the memspace cannot be allocated
    ///
    /// No memspace is built if any target cannot be created.
    ///
    /// [`EmptyNodeList`]: InvalidArgument::EmptyNodeList
    /// [`NodeOutOfRange`]: InvalidArgument::NodeOutOfRange
    pub fn create_from_numa_ids(ids: &[NodeId]) -> Result<Self, MemoryError> {
        if ids.is_empty() {
            return Err(InvalidArgument::EmptyNodeList.into());
        }
        let mut targets = Vec::new();
        targets.try_reserve_exact(ids.len())?;
        for &id in ids {
            targets.push(MemoryTarget::create(
                &NUMA_MEMORY_TARGET_OPS,
                &NumaTargetConfig { id },
            )?);
        }
        tracing::debug!("built a memspace over NUMA nodes {ids:?}");
        Ok(Self { targets })
    }

    /// Memspace made of pre-built memory targets
    ///
    /// Homogeneity is not checked here, but memspace resolution will reject
    /// memspaces that mix targets of different kinds.
    ///
    /// # Errors
    ///
    /// [`EmptyMemspace`] if `targets` is empty
    ///
    /// [`EmptyMemspace`]: InvalidArgument::EmptyMemspace
    pub fn from_targets(targets: Vec<MemoryTarget>) -> Result<Self, MemoryError> {
        if targets.is_empty() {
            return Err(InvalidArgument::EmptyMemspace.into());
        }
        Ok(Self { targets })
    }

    /// Destroy this memspace and its targets
    ///
    /// This is equivalent to dropping it.
    pub fn destroy(self) {}

    /// Number of memory targets
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Memory targets, in order of preference
    pub fn targets(&self) -> &[MemoryTarget] {
        &self.targets
    }

    /// Iterate over the memory targets, in order of preference
    pub fn iter(&self) -> slice::Iter<'_, MemoryTarget> {
        self.targets.iter()
    }

    /// NUMA node of each NUMA memory target, in order of preference
    ///
    /// Targets of other kinds are skipped.
    pub fn numa_ids(&self) -> Vec<NodeId> {
        self.targets
            .iter()
            .filter_map(|target| target.state::<NumaTarget>())
            .map(NumaTarget::id)
            .collect()
    }

    /// Truth that all targets are of the same kind
    ///
    /// An empty memspace is not considered homogeneous.
    pub fn is_homogeneous(&self) -> bool {
        match self.targets.split_first() {
            Some((first, rest)) => rest.iter().all(|target| target.is_same_kind(first)),
            None => false,
        }
    }

    /// Deep copy of this memspace
    ///
    /// Each target of the copy is initialized anew from the configuration of
    /// the matching source target, so the copy does not share anything with
    /// `self`.
    ///
    /// # Errors
    ///
    /// Any error from [`MemoryTarget::try_clone()`], or
    /// [`MemoryError::OutOfHostMemory`]. Clones created before the failure
    /// are destroyed.
    pub fn try_clone(&self) -> Result<Self, MemoryError> {
        let mut targets = Vec::new();
        targets.try_reserve_exact(self.targets.len())?;
        for target in &self.targets {
            targets.push(target.try_clone()?);
        }
        tracing::debug!("cloned a memspace of {} targets", targets.len());
        Ok(Self { targets })
    }

    /// Reorder targets by decreasing `key`
    ///
    /// Keys are computed for every target before anything is reordered, so
    /// if `key` fails for any target, the memspace is left untouched. Targets
    /// with equal keys keep their relative order.
    ///
    /// # Errors
    ///
    /// Any error reported by `key`, or [`MemoryError::OutOfHostMemory`].
    pub fn sort_desc(
        &mut self,
        mut key: impl FnMut(&MemoryTarget) -> Result<u64, MemoryError>,
    ) -> Result<(), MemoryError> {
        let mut keys = Vec::new();
        keys.try_reserve_exact(self.targets.len())?;
        for target in &self.targets {
            keys.push(key(target)?);
        }
        let mut keyed = Vec::new();
        keyed.try_reserve_exact(self.targets.len())?;

        // Nothing can fail past this point
        keyed.extend(
            keys.into_iter()
                .enumerate()
                .zip(self.targets.drain(..))
                .map(|((index, key), target)| (Reverse(key), index, target)),
        );
        keyed.sort_unstable_by_key(|(key, index, _)| (*key, *index));
        self.targets
            .extend(keyed.into_iter().map(|(_, _, target)| target));
        tracing::debug!("sorted a memspace of {} targets", self.targets.len());
        Ok(())
    }

    /// Memspace of the targets picked by `select` for each initiator
    ///
    /// `select` is called once per node of `initiators`, with the targets of
    /// this memspace as candidates, and returns the index of the candidate it
    /// picks. The resulting memspace holds a fresh clone of each picked target,
    /// in order of first selection. A target picked for several initiators
    /// only appears once.
    ///
    /// # Errors
    ///
    /// - [`EmptyNodeList`] if `initiators` is empty
    /// - [`BadSelection`] if `select` returns an out-of-bounds index
    /// - Any error reported by `select` or [`MemoryTarget::try_clone()`]
    ///
    /// [`BadSelection`]: InvalidArgument::BadSelection
    /// [`EmptyNodeList`]: InvalidArgument::EmptyNodeList
    pub fn filter(
        &self,
        initiators: &[NodeId],
        mut select: impl FnMut(NodeId, &[MemoryTarget]) -> Result<usize, MemoryError>,
    ) -> Result<Self, MemoryError> {
        if initiators.is_empty() {
            return Err(InvalidArgument::EmptyNodeList.into());
        }
        let mut picked = Vec::new();
        picked.try_reserve_exact(initiators.len())?;
        for &initiator in initiators {
            let index = select(initiator, &self.targets)?;
            if index >= self.targets.len() {
                return Err(InvalidArgument::BadSelection {
                    index,
                    len: self.targets.len(),
                }
                .into());
            }
            if !picked.contains(&index) {
                picked.push(index);
            }
        }

        let mut targets = Vec::new();
        targets.try_reserve_exact(picked.len())?;
        for index in picked {
            targets.push(self.targets[index].try_clone()?);
        }
        tracing::debug!(
            "filtered a memspace of {} targets down to {} targets",
            self.targets.len(),
            targets.len()
        );
        Ok(Self { targets })
    }

    /// Create a memory pool that allocates from this memspace
    ///
    /// The targets of the memspace decide how `policy` is applied, and use
    /// their own default placement if it is `None`.
    ///
    /// # Errors
    ///
    /// - [`HeterogeneousMemspace`] if the memspace mixes targets of different
    ///   kinds
    /// - [`MemoryError::OutOfHostMemory`] if scratch memory cannot be allocated
    /// - Any error reported by the targets' pool construction
    ///
    /// [`HeterogeneousMemspace`]: InvalidArgument::HeterogeneousMemspace
    pub fn create_pool(
        &self,
        policy: Option<&MemspacePolicy>,
    ) -> Result<MemoryPool<'static>, MemoryError> {
        let (ops, states) = self.resolution_inputs()?;
        ops.pool_create_dyn(self, &states, policy)
    }

    /// Create a memory provider that allocates from this memspace
    ///
    /// See [`create_pool()`](Self::create_pool) for the role of `policy`.
    ///
    /// # Errors
    ///
    /// Same as [`create_pool()`](Self::create_pool).
    pub fn create_provider(
        &self,
        policy: Option<&MemspacePolicy>,
    ) -> Result<MemoryProvider, MemoryError> {
        let (ops, states) = self.resolution_inputs()?;
        ops.provider_create_dyn(self, &states, policy)
    }

    /// Ops of the memspace's targets and their states, in memspace order
    fn resolution_inputs(
        &self,
    ) -> Result<(&'static dyn DynMemoryTargetOps, Vec<StateRef<'_>>), MemoryError> {
        let Some(first) = self.targets.first() else {
            return Err(InvalidArgument::EmptyMemspace.into());
        };
        // Kinds are compared by ops type, since distinct kinds may share a
        // state type and would then pass the state downcast
        if !self.is_homogeneous() {
            return Err(InvalidArgument::HeterogeneousMemspace.into());
        }
        let mut states = Vec::new();
        states.try_reserve_exact(self.targets.len())?;
        states.extend(self.targets.iter().map(MemoryTarget::erased_state));
        Ok((first.ops(), states))
    }
}
//
impl<'memspace> IntoIterator for &'memspace Memspace {
    type Item = &'memspace MemoryTarget;
    type IntoIter = slice::Iter<'memspace, MemoryTarget>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Selection strategy for [`Memspace::filter()`] that picks, for each
/// initiator, the candidate with the highest bandwidth from that initiator
///
/// Candidates whose bandwidth is unknown are skipped. Ties are resolved in
/// favor of the earliest candidate.
///
/// # Errors
///
/// The returned closure fails with [`MemoryError::NotSupported`] if no
/// candidate has a known bandwidth from the initiator, and forwards any other
/// error from [`MemoryTarget::bandwidth()`].
pub fn highest_bandwidth_selection(
    topology: &dyn TopologySource,
) -> impl FnMut(NodeId, &[MemoryTarget]) -> Result<usize, MemoryError> + '_ {
    move |initiator, candidates| {
        let mut best: Option<(usize, u64)> = None;
        for (index, candidate) in candidates.iter().enumerate() {
            let bandwidth = match candidate.bandwidth(Some(initiator), topology) {
                Ok(bandwidth) => bandwidth,
                Err(error) if error.is_not_supported() => continue,
                Err(error) => return Err(error),
            };
            if best.map_or(true, |(_, best_bandwidth)| bandwidth > best_bandwidth) {
                best = Some((index, bandwidth));
            }
        }
        best.map(|(index, _)| index)
            .ok_or(MemoryError::NotSupported("memory bandwidth attributes"))
    }
}
