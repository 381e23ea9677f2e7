//! Proxy pool
//!
//! The simplest possible pool: every request is forwarded to the provider,
//! which makes the pool as fine-grained as the provider is.

use super::MemoryPoolOps;
use crate::{errors::MemoryError, provider::MemoryProvider};
use std::{alloc::Layout, ptr::NonNull};

/// Ops of the proxy pool
#[derive(Debug)]
pub struct ProxyPoolOps;

/// The one instance of [`ProxyPoolOps`]
pub static PROXY_POOL_OPS: ProxyPoolOps = ProxyPoolOps;

impl MemoryPoolOps for ProxyPoolOps {
    type Params = ();
    type State = ();

    fn name(&self) -> &'static str {
        "proxy"
    }

    fn initialize(&self, _provider: &MemoryProvider, (): &()) -> Result<(), MemoryError> {
        Ok(())
    }

    fn finalize(&self, (): (), _provider: &MemoryProvider) {}

    fn allocate(
        &self,
        (): &(),
        provider: &MemoryProvider,
        layout: Layout,
    ) -> Result<NonNull<u8>, MemoryError> {
        provider.alloc(layout.size(), layout.align())
    }

    unsafe fn deallocate(
        &self,
        (): &(),
        provider: &MemoryProvider,
        ptr: NonNull<u8>,
        layout: Layout,
    ) -> Result<(), MemoryError> {
        // SAFETY: Per function precondition, ptr comes from allocate(), hence
        //         from provider.alloc() with the same size
        unsafe { provider.free(ptr, layout.size()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{pool::MemoryPool, provider::tests::HEAP_PROVIDER_OPS};
    #[allow(unused)]
    use similar_asserts::assert_eq;
    use std::sync::{atomic::AtomicUsize, Arc};

    #[test]
    fn forwards_to_provider() {
        let provider =
            MemoryProvider::create(&HEAP_PROVIDER_OPS, &Arc::new(AtomicUsize::new(0))).unwrap();
        let pool = MemoryPool::create(&PROXY_POOL_OPS, &provider, &()).unwrap();
        assert_eq!(pool.name(), "proxy");

        let layouts = [
            Layout::new::<u8>(),
            Layout::new::<[u64; 17]>(),
            Layout::from_size_align(3, 32).unwrap(),
        ];
        let ptrs = layouts
            .iter()
            .map(|&layout| pool.allocate(layout).unwrap())
            .collect::<Vec<_>>();
        for (&ptr, &layout) in ptrs.iter().zip(&layouts) {
            assert_eq!(ptr.as_ptr() as usize % layout.align(), 0);
            // SAFETY: Allocated above with the same layout
            unsafe { pool.deallocate(ptr, layout) }.unwrap();
        }
    }
}
