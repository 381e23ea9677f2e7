//! Memory targets
//!
//! A memory target is a hardware-addressable memory node, such as one NUMA
//! node, hidden behind a capability table that knows how to turn a set of such
//! targets into a memory provider or pool. Concrete kinds of targets implement
//! [`MemoryTargetOps`]; the rest of the crate only manipulates type-erased
//! [`MemoryTarget`] handles.

use crate::{
    errors::{InvalidArgument, MemoryError},
    memory::nodemask::NodeId,
    memspace::{policy::MemspacePolicy, Memspace},
    pool::MemoryPool,
    provider::MemoryProvider,
    topology::TopologySource,
};
use std::{
    any::{Any, TypeId},
    fmt::{self, Debug, Display, Formatter},
};

/// Version of the capability tables of this crate
///
/// Ops tables declare the version they were written against through
/// [`MemoryTargetOps::VERSION`]. Creating a target from a table whose version
/// differs from [`OpsVersion::CURRENT`] is rejected.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OpsVersion(u32);
//
impl OpsVersion {
    /// Version of the ops contract implemented by this crate
    pub const CURRENT: Self = Self::new(0, 1);

    /// Version with the given major and minor numbers
    pub const fn new(major: u16, minor: u16) -> Self {
        Self(((major as u32) << 16) | minor as u32)
    }

    /// Major version number
    pub const fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Minor version number
    pub const fn minor(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}
//
impl Display for OpsVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Capability table of a kind of memory target
///
/// Implementations are expected to be stateless unit structs stored in a
/// `static`, all per-target data living in [`MemoryTargetOps::State`]. Two
/// memory targets are of the same kind if and only if they were created from
/// ops of the same type.
pub trait MemoryTargetOps: Send + Sync + 'static {
    /// Parameters needed to create a target of this kind
    type Params;

    /// Private state of a target of this kind
    type State: Debug + Send + Sync + 'static;

    /// Version of the ops contract this table was written against
    const VERSION: OpsVersion = OpsVersion::CURRENT;

    /// Short name of this kind of target, for logging
    fn name(&self) -> &'static str;

    /// Build the private state of a new target
    ///
    /// # Errors
    ///
    /// If `params` do not describe a valid target, or the state cannot be
    /// allocated. No resource must leak on failure.
    fn initialize(&self, params: &Self::Params) -> Result<Self::State, MemoryError>;

    /// Release the private state of a target
    ///
    /// Called exactly once per successful [`initialize()`](Self::initialize).
    fn finalize(&self, state: Self::State);

    /// Build a pool that allocates from the given targets
    ///
    /// `targets` holds the states of every target of `memspace`, in the
    /// memspace's order. It is never empty.
    ///
    /// # Errors
    ///
    /// Whatever the underlying pool or provider construction reports.
    fn pool_create_from_memspace(
        &self,
        memspace: &Memspace,
        targets: &[&Self::State],
        policy: Option<&MemspacePolicy>,
    ) -> Result<MemoryPool<'static>, MemoryError>;

    /// Build a provider that allocates from the given targets
    ///
    /// Same contract as [`pool_create_from_memspace()`](Self::pool_create_from_memspace).
    ///
    /// # Errors
    ///
    /// Whatever the underlying provider construction reports.
    fn provider_create_from_memspace(
        &self,
        memspace: &Memspace,
        targets: &[&Self::State],
        policy: Option<&MemspacePolicy>,
    ) -> Result<MemoryProvider, MemoryError>;

    /// Build the state of an independent target configured like `state`
    ///
    /// # Errors
    ///
    /// [`MemoryError::NotSupported`] unless the kind of target supports
    /// cloning, otherwise the errors of [`initialize()`](Self::initialize).
    fn clone_state(&self, state: &Self::State) -> Result<Self::State, MemoryError> {
        let _ = state;
        Err(MemoryError::NotSupported("cloning this kind of memory target"))
    }

    /// Bandwidth of accesses to this target, in MiB/s
    ///
    /// With `initiator: None`, this is the bandwidth observed by the
    /// target's best initiator (typically its local CPUs). Otherwise it is
    /// the bandwidth observed from the given initiator node.
    ///
    /// # Errors
    ///
    /// [`MemoryError::NotSupported`] if the value is not known.
    fn bandwidth(
        &self,
        state: &Self::State,
        initiator: Option<NodeId>,
        topology: &dyn TopologySource,
    ) -> Result<u64, MemoryError> {
        let _ = (state, initiator, topology);
        Err(MemoryError::NotSupported(
            "bandwidth queries on this kind of memory target",
        ))
    }
}

/// Type-erased target state
pub(crate) type ErasedState = Box<dyn Any + Send + Sync>;

/// Borrowed type-erased target state
pub(crate) type StateRef<'state> = &'state (dyn Any + Send + Sync);

/// Object-safe projection of [`MemoryTargetOps`]
pub(crate) trait DynMemoryTargetOps: Send + Sync {
    fn ops_name(&self) -> &'static str;

    fn finalize_dyn(&self, state: ErasedState);

    fn clone_state_dyn(&self, state: StateRef<'_>) -> Result<ErasedState, MemoryError>;

    fn pool_create_dyn(
        &self,
        memspace: &Memspace,
        states: &[StateRef<'_>],
        policy: Option<&MemspacePolicy>,
    ) -> Result<MemoryPool<'static>, MemoryError>;

    fn provider_create_dyn(
        &self,
        memspace: &Memspace,
        states: &[StateRef<'_>],
        policy: Option<&MemspacePolicy>,
    ) -> Result<MemoryProvider, MemoryError>;

    fn bandwidth_dyn(
        &self,
        state: StateRef<'_>,
        initiator: Option<NodeId>,
        topology: &dyn TopologySource,
    ) -> Result<u64, MemoryError>;

    fn fmt_state(&self, state: StateRef<'_>, f: &mut Formatter<'_>) -> fmt::Result;
}
//
impl<O: MemoryTargetOps> DynMemoryTargetOps for O {
    fn ops_name(&self) -> &'static str {
        MemoryTargetOps::name(self)
    }

    fn finalize_dyn(&self, state: ErasedState) {
        let state = state
            .downcast::<O::State>()
            .unwrap_or_else(|_| unreachable!("targets only hold states of their own ops"));
        MemoryTargetOps::finalize(self, *state);
    }

    fn clone_state_dyn(&self, state: StateRef<'_>) -> Result<ErasedState, MemoryError> {
        let state = downcast_state::<O>(state)?;
        Ok(Box::new(MemoryTargetOps::clone_state(self, state)?))
    }

    fn pool_create_dyn(
        &self,
        memspace: &Memspace,
        states: &[StateRef<'_>],
        policy: Option<&MemspacePolicy>,
    ) -> Result<MemoryPool<'static>, MemoryError> {
        let states = downcast_states::<O>(states)?;
        self.pool_create_from_memspace(memspace, &states, policy)
    }

    fn provider_create_dyn(
        &self,
        memspace: &Memspace,
        states: &[StateRef<'_>],
        policy: Option<&MemspacePolicy>,
    ) -> Result<MemoryProvider, MemoryError> {
        let states = downcast_states::<O>(states)?;
        self.provider_create_from_memspace(memspace, &states, policy)
    }

    fn bandwidth_dyn(
        &self,
        state: StateRef<'_>,
        initiator: Option<NodeId>,
        topology: &dyn TopologySource,
    ) -> Result<u64, MemoryError> {
        let state = downcast_state::<O>(state)?;
        MemoryTargetOps::bandwidth(self, state, initiator, topology)
    }

    fn fmt_state(&self, state: StateRef<'_>, f: &mut Formatter<'_>) -> fmt::Result {
        match state.downcast_ref::<O::State>() {
            Some(state) => Debug::fmt(state, f),
            None => f.write_str("<foreign state>"),
        }
    }
}

/// Recover the concrete state of a target of kind `O`
///
/// A mismatch means that targets with different state types were mixed
/// together.
fn downcast_state<O: MemoryTargetOps>(state: StateRef<'_>) -> Result<&O::State, MemoryError> {
    state
        .downcast_ref::<O::State>()
        .ok_or(InvalidArgument::HeterogeneousMemspace.into())
}

/// Recover the concrete states of a homogeneous set of targets of kind `O`
fn downcast_states<'state, O: MemoryTargetOps>(
    states: &[StateRef<'state>],
) -> Result<Vec<&'state O::State>, MemoryError> {
    let mut result = Vec::new();
    result.try_reserve_exact(states.len())?;
    for &state in states {
        result.push(downcast_state::<O>(state)?);
    }
    Ok(result)
}

/// Handle to one memory target
///
/// A target is exclusively owned by whichever [`Memspace`] holds it. Its
/// state is released through [`MemoryTargetOps::finalize()`] when the handle
/// is dropped.
pub struct MemoryTarget {
    /// Capability table, fixed at creation
    ops: &'static dyn DynMemoryTargetOps,

    /// Concrete type of `ops`, used to tell kinds of targets apart
    kind: TypeId,

    /// Private state, only taken out when the target is dropped
    state: Option<ErasedState>,
}
//
impl MemoryTarget {
    /// Create a memory target of the kind described by `ops`
    ///
    /// # Errors
    ///
    /// - [`OpsVersionMismatch`] if `ops` targets another version of the ops
    ///   contract
    /// - Any error reported by [`MemoryTargetOps::initialize()`]
    ///
    /// [`OpsVersionMismatch`]: InvalidArgument::OpsVersionMismatch
    pub fn create<O: MemoryTargetOps>(
        ops: &'static O,
        params: &O::Params,
    ) -> Result<Self, MemoryError> {
        if O::VERSION != OpsVersion::CURRENT {
            return Err(InvalidArgument::OpsVersionMismatch {
                expected: OpsVersion::CURRENT,
                found: O::VERSION,
            }
            .into());
        }
        let state = ops.initialize(params)?;
        Ok(Self {
            ops,
            kind: TypeId::of::<O>(),
            state: Some(Box::new(state)),
        })
    }

    /// Destroy this memory target
    ///
    /// This is equivalent to dropping it.
    pub fn destroy(self) {}

    /// Short name of this target's kind
    pub fn kind_name(&self) -> &'static str {
        self.ops.ops_name()
    }

    /// Truth that `self` and `other` were created from the same ops
    pub fn is_same_kind(&self, other: &Self) -> bool {
        self.kind == other.kind
    }

    /// Truth that this target was created from ops of type `O`
    pub fn is_kind<O: MemoryTargetOps>(&self) -> bool {
        self.kind == TypeId::of::<O>()
    }

    /// Private state of this target, if it is of type `T`
    pub fn state<T: Any>(&self) -> Option<&T> {
        self.erased_state().downcast_ref::<T>()
    }

    /// Create an independent target configured like this one
    ///
    /// The clone re-runs the initialization of its kind of target: it does
    /// not share any state with `self`.
    ///
    /// # Errors
    ///
    /// Whatever [`MemoryTargetOps::clone_state()`] reports.
    pub fn try_clone(&self) -> Result<Self, MemoryError> {
        let state = self.ops.clone_state_dyn(self.erased_state())?;
        Ok(Self {
            ops: self.ops,
            kind: self.kind,
            state: Some(state),
        })
    }

    /// Bandwidth of accesses to this target, in MiB/s
    ///
    /// See [`MemoryTargetOps::bandwidth()`] for the meaning of `initiator`.
    ///
    /// # Errors
    ///
    /// [`MemoryError::NotSupported`] if the value is not known.
    pub fn bandwidth(
        &self,
        initiator: Option<NodeId>,
        topology: &dyn TopologySource,
    ) -> Result<u64, MemoryError> {
        self.ops
            .bandwidth_dyn(self.erased_state(), initiator, topology)
    }

    /// Capability table of this target
    pub(crate) fn ops(&self) -> &'static dyn DynMemoryTargetOps {
        self.ops
    }

    /// Type-erased private state of this target
    pub(crate) fn erased_state(&self) -> StateRef<'_> {
        self.state
            .as_deref()
            .expect("target state is only released on drop")
    }
}
//
impl Debug for MemoryTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        struct State<'target>(&'target MemoryTarget);
        impl Debug for State<'_> {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                self.0.ops.fmt_state(self.0.erased_state(), f)
            }
        }
        f.debug_struct("MemoryTarget")
            .field("kind", &self.kind_name())
            .field("state", &State(self))
            .finish()
    }
}
//
impl Drop for MemoryTarget {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.ops.finalize_dyn(state);
        }
    }
}
