//! Memory pools
//!
//! A memory pool is a higher-level allocator that serves arbitrary
//! [`Layout`]s from exactly one [`MemoryProvider`]. Depending on how it was
//! created, the pool either borrows its provider from the caller or owns it.

pub mod proxy;

use crate::{
    errors::{InvalidArgument, MemoryError},
    memory::target::OpsVersion,
    provider::{MemoryProvider, MemoryProviderOps},
};
use std::{
    alloc::Layout,
    fmt::{self, Debug, Formatter},
    ptr::NonNull,
};

/// Capability table of a kind of memory pool
pub trait MemoryPoolOps: Send + Sync + 'static {
    /// Parameters needed to create a pool of this kind
    type Params;

    /// Private state of a pool of this kind
    type State: Send + Sync + 'static;

    /// Version of the ops contract this table was written against
    const VERSION: OpsVersion = OpsVersion::CURRENT;

    /// Short name of this kind of pool, for logging
    fn name(&self) -> &'static str;

    /// Set up a new pool on top of `provider`
    ///
    /// # Errors
    ///
    /// If `params` are not valid or the pool cannot be set up.
    fn initialize(
        &self,
        provider: &MemoryProvider,
        params: &Self::Params,
    ) -> Result<Self::State, MemoryError>;

    /// Tear down a pool
    ///
    /// Called exactly once per successful [`initialize()`](Self::initialize),
    /// while the provider is still alive.
    fn finalize(&self, state: Self::State, provider: &MemoryProvider);

    /// Allocate memory for `layout`
    ///
    /// `layout` has a nonzero size.
    ///
    /// # Errors
    ///
    /// If neither the pool nor its provider can serve the request.
    fn allocate(
        &self,
        state: &Self::State,
        provider: &MemoryProvider,
        layout: Layout,
    ) -> Result<NonNull<u8>, MemoryError>;

    /// Release memory previously returned by [`allocate()`](Self::allocate)
    ///
    /// # Errors
    ///
    /// If the memory cannot be released.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate()` on the same pool with the
    /// same `layout`, and must not be used after this call.
    unsafe fn deallocate(
        &self,
        state: &Self::State,
        provider: &MemoryProvider,
        ptr: NonNull<u8>,
        layout: Layout,
    ) -> Result<(), MemoryError>;
}

/// A live memory pool
///
/// The lifetime parameter is that of the provider, when the pool borrows it.
/// Pools that own their provider are `MemoryPool<'static>`.
pub struct MemoryPool<'provider> {
    /// Pool implementation, dropped before the provider
    inner: Box<dyn PoolInstance>,

    /// Provider that the pool allocates from
    provider: ProviderSlot<'provider>,
}
//
impl<'provider> MemoryPool<'provider> {
    /// Create a pool on top of a caller-provided `provider`
    ///
    /// The pool does not own `provider`, which the caller must keep alive and
    /// destroy after the pool.
    ///
    /// # Errors
    ///
    /// - [`OpsVersionMismatch`] if `ops` targets another version of the ops
    ///   contract
    /// - Any error reported by [`MemoryPoolOps::initialize()`]
    ///
    /// [`OpsVersionMismatch`]: InvalidArgument::OpsVersionMismatch
    pub fn create<O: MemoryPoolOps>(
        ops: &'static O,
        provider: &'provider MemoryProvider,
        params: &O::Params,
    ) -> Result<Self, MemoryError> {
        Self::with_slot(ops, ProviderSlot::Borrowed(provider), params)
    }

    /// Truth that dropping this pool also destroys its provider
    pub fn owns_provider(&self) -> bool {
        matches!(self.provider, ProviderSlot::Owned(_))
    }

    /// Provider that this pool allocates from
    pub fn provider(&self) -> &MemoryProvider {
        self.provider.get()
    }

    /// Short name of this pool's kind
    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    /// Allocate memory for `layout`
    ///
    /// # Errors
    ///
    /// - [`BadLayout`] if `layout` has a zero size
    /// - Any error reported by the pool or its provider
    ///
    /// [`BadLayout`]: InvalidArgument::BadLayout
    pub fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, MemoryError> {
        if layout.size() == 0 {
            return Err(InvalidArgument::BadLayout {
                size: 0,
                alignment: layout.align(),
            }
            .into());
        }
        self.inner.allocate(self.provider.get(), layout)
    }

    /// Release memory previously returned by [`allocate()`](Self::allocate)
    ///
    /// # Errors
    ///
    /// If the memory cannot be released.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate()` on this pool with the
    /// same `layout`, and must not be used after this call.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) -> Result<(), MemoryError> {
        // SAFETY: Forwarded from the caller
        unsafe { self.inner.deallocate(self.provider.get(), ptr, layout) }
    }

    /// Destroy this pool, and its provider if it owns it
    ///
    /// This is equivalent to dropping it.
    pub fn destroy(self) {}

    /// Set up a pool over a provider slot
    fn with_slot<O: MemoryPoolOps>(
        ops: &'static O,
        provider: ProviderSlot<'provider>,
        params: &O::Params,
    ) -> Result<Self, MemoryError> {
        if O::VERSION != OpsVersion::CURRENT {
            return Err(InvalidArgument::OpsVersionMismatch {
                expected: OpsVersion::CURRENT,
                found: O::VERSION,
            }
            .into());
        }
        let state = ops.initialize(provider.get(), params)?;
        tracing::debug!(
            "created a {} pool over a {} provider (owned: {})",
            ops.name(),
            provider.get().name(),
            matches!(provider, ProviderSlot::Owned(_))
        );
        Ok(Self {
            inner: Box::new(Instance {
                ops,
                state: Some(state),
            }),
            provider,
        })
    }
}
//
impl MemoryPool<'static> {
    /// Create a pool together with the provider it allocates from
    ///
    /// The pool owns the provider, which is destroyed when the pool is. If
    /// pool creation fails, the freshly created provider is destroyed before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Any error reported by [`MemoryProvider::create()`] or
    /// [`MemoryPool::create()`].
    pub fn create_with_provider<PoolOps: MemoryPoolOps, ProviderOps: MemoryProviderOps>(
        pool_ops: &'static PoolOps,
        pool_params: &PoolOps::Params,
        provider_ops: &'static ProviderOps,
        provider_params: &ProviderOps::Params,
    ) -> Result<Self, MemoryError> {
        let provider = MemoryProvider::create(provider_ops, provider_params)?;
        Self::with_slot(pool_ops, ProviderSlot::Owned(provider), pool_params)
    }
}
//
impl Debug for MemoryPool<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name())
            .field("provider", self.provider.get())
            .field("owns_provider", &self.owns_provider())
            .finish()
    }
}
//
impl Drop for MemoryPool<'_> {
    fn drop(&mut self) {
        self.inner.finalize(self.provider.get());
    }
}

// --- Implementation details ---

/// Provider of a pool, either borrowed from the caller or owned
enum ProviderSlot<'provider> {
    Owned(MemoryProvider),
    Borrowed(&'provider MemoryProvider),
}
//
impl ProviderSlot<'_> {
    fn get(&self) -> &MemoryProvider {
        match self {
            Self::Owned(provider) => provider,
            Self::Borrowed(provider) => provider,
        }
    }
}

/// Object-safe view of a pool with its state
trait PoolInstance: Send + Sync {
    fn name(&self) -> &'static str;
    fn allocate(&self, provider: &MemoryProvider, layout: Layout)
        -> Result<NonNull<u8>, MemoryError>;
    unsafe fn deallocate(
        &self,
        provider: &MemoryProvider,
        ptr: NonNull<u8>,
        layout: Layout,
    ) -> Result<(), MemoryError>;
    fn finalize(&mut self, provider: &MemoryProvider);
}

/// Pool ops bundled with the state they initialized
struct Instance<O: MemoryPoolOps> {
    ops: &'static O,
    state: Option<O::State>,
}
//
impl<O: MemoryPoolOps> Instance<O> {
    fn state(&self) -> &O::State {
        self.state
            .as_ref()
            .expect("pool state is only released on drop")
    }
}
//
impl<O: MemoryPoolOps> PoolInstance for Instance<O> {
    fn name(&self) -> &'static str {
        self.ops.name()
    }

    fn allocate(
        &self,
        provider: &MemoryProvider,
        layout: Layout,
    ) -> Result<NonNull<u8>, MemoryError> {
        self.ops.allocate(self.state(), provider, layout)
    }

    unsafe fn deallocate(
        &self,
        provider: &MemoryProvider,
        ptr: NonNull<u8>,
        layout: Layout,
    ) -> Result<(), MemoryError> {
        // SAFETY: Forwarded from the caller
        unsafe { self.ops.deallocate(self.state(), provider, ptr, layout) }
    }

    fn finalize(&mut self, provider: &MemoryProvider) {
        if let Some(state) = self.state.take() {
            self.ops.finalize(state, provider);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{proxy::PROXY_POOL_OPS, *};
    use crate::provider::tests::HEAP_PROVIDER_OPS;
    #[allow(unused)]
    use similar_asserts::assert_eq;
    use static_assertions::assert_impl_all;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    assert_impl_all!(MemoryPool<'static>: Debug, Send, Sync);

    /// Pool kind whose initialization always fails
    struct FailingPoolOps;
    //
    static FAILING_POOL_OPS: FailingPoolOps = FailingPoolOps;
    //
    impl MemoryPoolOps for FailingPoolOps {
        type Params = ();
        type State = ();

        fn name(&self) -> &'static str {
            "failing"
        }

        fn initialize(&self, _provider: &MemoryProvider, (): &()) -> Result<(), MemoryError> {
            Err(MemoryError::OutOfHostMemory)
        }

        fn finalize(&self, (): (), _provider: &MemoryProvider) {
            unreachable!("failing pools are never initialized")
        }

        fn allocate(
            &self,
            (): &(),
            _provider: &MemoryProvider,
            _layout: Layout,
        ) -> Result<NonNull<u8>, MemoryError> {
            unreachable!("failing pools are never initialized")
        }

        unsafe fn deallocate(
            &self,
            (): &(),
            _provider: &MemoryProvider,
            _ptr: NonNull<u8>,
            _layout: Layout,
        ) -> Result<(), MemoryError> {
            unreachable!("failing pools are never initialized")
        }
    }

    #[test]
    fn owned_provider() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let pool =
            MemoryPool::create_with_provider(&PROXY_POOL_OPS, &(), &HEAP_PROVIDER_OPS, &finalized)
                .unwrap();
        assert!(pool.owns_provider());
        assert_eq!(pool.provider().name(), "heap");

        let layout = Layout::from_size_align(24, 8).unwrap();
        let ptr = pool.allocate(layout).unwrap();
        // SAFETY: Allocated above with the same layout
        unsafe { pool.deallocate(ptr, layout) }.unwrap();

        assert_eq!(finalized.load(Ordering::Relaxed), 0);
        pool.destroy();
        assert_eq!(finalized.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn borrowed_provider() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let provider = MemoryProvider::create(&HEAP_PROVIDER_OPS, &finalized).unwrap();
        let pool = MemoryPool::create(&PROXY_POOL_OPS, &provider, &()).unwrap();
        assert!(!pool.owns_provider());

        pool.destroy();
        assert_eq!(finalized.load(Ordering::Relaxed), 0);
        assert_eq!(provider.name(), "heap");
        provider.destroy();
        assert_eq!(finalized.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failed_pool_releases_provider() {
        let finalized = Arc::new(AtomicUsize::new(0));
        let result = MemoryPool::create_with_provider(
            &FAILING_POOL_OPS,
            &(),
            &HEAP_PROVIDER_OPS,
            &finalized,
        );
        assert_eq!(result.unwrap_err(), MemoryError::OutOfHostMemory);
        assert_eq!(finalized.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn zero_sized_allocation() {
        let pool = MemoryPool::create_with_provider(
            &PROXY_POOL_OPS,
            &(),
            &HEAP_PROVIDER_OPS,
            &Arc::new(AtomicUsize::new(0)),
        )
        .unwrap();
        assert_eq!(
            pool.allocate(Layout::new::<()>()),
            Err(MemoryError::from(InvalidArgument::BadLayout {
                size: 0,
                alignment: 1
            }))
        );
    }
}
