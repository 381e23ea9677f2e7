//! Memory providers
//!
//! A memory provider is a low-level allocator that hands out memory from a
//! specific region, e.g. OS virtual memory bound to some NUMA nodes. It only
//! knows about page-granular, size-tracked allocations: finer-grained
//! allocation is the job of [pools](crate::pool) built on top of it.

pub mod os;

use crate::{
    errors::{InvalidArgument, MemoryError},
    memory::target::OpsVersion,
};
use std::{
    fmt::{self, Debug, Formatter},
    ptr::NonNull,
};

/// Capability table of a kind of memory provider
pub trait MemoryProviderOps: Send + Sync + 'static {
    /// Parameters needed to create a provider of this kind
    type Params;

    /// Private state of a provider of this kind
    type State: Send + Sync + 'static;

    /// Version of the ops contract this table was written against
    const VERSION: OpsVersion = OpsVersion::CURRENT;

    /// Short name of this kind of provider, for logging
    fn name(&self) -> &'static str;

    /// Set up a new provider
    ///
    /// # Errors
    ///
    /// If `params` are not valid or the provider cannot be set up. No
    /// resource must leak on failure.
    fn initialize(&self, params: &Self::Params) -> Result<Self::State, MemoryError>;

    /// Tear down a provider
    ///
    /// Called exactly once per successful [`initialize()`](Self::initialize).
    fn finalize(&self, state: Self::State);

    /// Allocate `size` bytes aligned to `alignment`
    ///
    /// `size` is nonzero and `alignment` is a power of two.
    ///
    /// # Errors
    ///
    /// If the memory cannot be allocated or bound as requested.
    fn alloc(
        &self,
        state: &Self::State,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, MemoryError>;

    /// Release memory previously returned by [`alloc()`](Self::alloc)
    ///
    /// # Errors
    ///
    /// If the OS refuses to release the memory.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `alloc()` on the same provider with
    /// the same `size`, and must not be used after this call.
    unsafe fn free(
        &self,
        state: &Self::State,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<(), MemoryError>;

    /// Granularity of the allocations of this provider, in bytes
    fn page_size(&self, state: &Self::State) -> usize;
}

/// A live memory provider
///
/// The provider is torn down through [`MemoryProviderOps::finalize()`] when
/// this handle is dropped.
pub struct MemoryProvider {
    inner: Box<dyn ProviderInstance>,
}
//
impl MemoryProvider {
    /// Create a memory provider of the kind described by `ops`
    ///
    /// # Errors
    ///
    /// - [`OpsVersionMismatch`] if `ops` targets another version of the ops
    ///   contract
    /// - Any error reported by [`MemoryProviderOps::initialize()`]
    ///
    /// [`OpsVersionMismatch`]: InvalidArgument::OpsVersionMismatch
    pub fn create<O: MemoryProviderOps>(
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
        tracing::debug!("created a {} memory provider", ops.name());
        Ok(Self {
            inner: Box::new(Instance {
                ops,
                state: Some(state),
            }),
        })
    }

    /// Destroy this memory provider
    ///
    /// This is equivalent to dropping it.
    pub fn destroy(self) {}

    /// Short name of this provider's kind
    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    /// Allocate `size` bytes aligned to `alignment`
    ///
    /// # Errors
    ///
    /// - [`BadLayout`] if `size` is zero or `alignment` is not a power of two
    /// - Any error reported by the provider
    ///
    /// [`BadLayout`]: InvalidArgument::BadLayout
    pub fn alloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, MemoryError> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(InvalidArgument::BadLayout { size, alignment }.into());
        }
        self.inner.alloc(size, alignment)
    }

    /// Release memory previously returned by [`alloc()`](Self::alloc)
    ///
    /// # Errors
    ///
    /// If the provider fails to release the memory.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `alloc()` on this provider with the
    /// same `size`, and must not be used after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        // SAFETY: Forwarded from the caller
        unsafe { self.inner.free(ptr, size) }
    }

    /// Granularity of the allocations of this provider, in bytes
    pub fn page_size(&self) -> usize {
        self.inner.page_size()
    }
}
//
impl Debug for MemoryProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryProvider")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}

// --- Implementation details ---

/// Object-safe view of a provider with its state
trait ProviderInstance: Send + Sync {
    fn name(&self) -> &'static str;
    fn alloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, MemoryError>;
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError>;
    fn page_size(&self) -> usize;
}

/// Provider ops bundled with the state they initialized
struct Instance<O: MemoryProviderOps> {
    ops: &'static O,
    state: Option<O::State>,
}
//
impl<O: MemoryProviderOps> Instance<O> {
    fn state(&self) -> &O::State {
        self.state
            .as_ref()
            .expect("provider state is only released on drop")
    }
}
//
impl<O: MemoryProviderOps> ProviderInstance for Instance<O> {
    fn name(&self) -> &'static str {
        self.ops.name()
    }

    fn alloc(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, MemoryError> {
        self.ops.alloc(self.state(), size, alignment)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
        // SAFETY: Forwarded from the caller
        unsafe { self.ops.free(self.state(), ptr, size) }
    }

    fn page_size(&self) -> usize {
        self.ops.page_size(self.state())
    }
}
//
impl<O: MemoryProviderOps> Drop for Instance<O> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            self.ops.finalize(state);
        }
    }
}
