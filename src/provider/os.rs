//! OS virtual memory provider
//!
//! This provider maps anonymous memory straight from the operating system and
//! optionally binds it to a set of NUMA nodes. It is the provider that NUMA
//! memory targets resolve to.

use crate::{
    errors::{InvalidArgument, MemoryError},
    memory::nodemask::NodeMask,
    provider::MemoryProviderOps,
};
use bitflags::bitflags;
use std::{ffi::c_int, ptr::NonNull};
use strum::{Display, EnumIter};

bitflags! {
    /// Access permissions of the memory of an [`OsMemoryProvider`]
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    pub struct Protection: u32 {
        /// Memory can be read
        const READ = 1 << 0;

        /// Memory can be written
        const WRITE = 1 << 1;

        /// Memory can hold executable code
        const EXEC = 1 << 2;
    }
}
//
impl Default for Protection {
    fn default() -> Self {
        Self::READ | Self::WRITE
    }
}
//
#[cfg(unix)]
impl Protection {
    /// Translate into `mmap()` protection bits
    fn to_prot(self) -> c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Self::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

bitflags! {
    /// Flags that tune NUMA binding
    #[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
    pub struct NumaFlags: u32 {
        /// Fail instead of silently falling back to other nodes
        const STRICT = 1 << 0;
    }
}
//
impl Default for NumaFlags {
    fn default() -> Self {
        Self::STRICT
    }
}

/// Whether mapped memory may be shared with child processes
#[derive(Copy, Clone, Debug, Default, Display, EnumIter, Eq, Hash, PartialEq)]
pub enum Visibility {
    /// Copy-on-write across `fork()`
    #[default]
    Private,

    /// Shared with child processes
    Shared,
}

/// How memory is spread over the nodes of the node mask
#[derive(Copy, Clone, Debug, Default, Display, EnumIter, Eq, Hash, PartialEq)]
pub enum NumaMode {
    /// Bind to the node mask if it is not empty, otherwise leave memory
    /// placement to the OS
    #[default]
    Default,

    /// Only allocate from the nodes of the node mask
    Bind,

    /// Interleave pages over the nodes of the node mask
    Interleave,

    /// Prefer the first node of the node mask, falling back to others
    Preferred,

    /// Allocate on the node of the CPU that first touches the memory
    Local,
}

/// Parameters of an [`OsMemoryProvider`]
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct OsMemoryProviderParams {
    /// Access permissions
    pub protection: Protection,

    /// Sharing with child processes
    pub visibility: Visibility,

    /// NUMA nodes that memory should come from
    pub nodemask: NodeMask,

    /// Highest set bit of `nodemask`, or 0 when it is empty
    pub maxnode: usize,

    /// Placement of memory over `nodemask`
    pub numa_mode: NumaMode,

    /// NUMA binding flags
    pub numa_flags: NumaFlags,
}
//
impl OsMemoryProviderParams {
    /// Replace the node mask, keeping `maxnode` in sync with it
    pub fn with_nodemask(mut self, nodemask: NodeMask) -> Self {
        self.maxnode = nodemask.maxnode();
        self.nodemask = nodemask;
        self
    }
}

/// Ops of the OS memory provider
#[derive(Debug)]
pub struct OsMemoryProviderOps;

/// The one instance of [`OsMemoryProviderOps`]
pub static OS_MEMORY_PROVIDER_OPS: OsMemoryProviderOps = OsMemoryProviderOps;

/// State of an OS memory provider
#[derive(Debug)]
pub struct OsMemoryProvider {
    protection: Protection,
    visibility: Visibility,
    nodemask: NodeMask,
    numa_mode: NumaMode,
    numa_flags: NumaFlags,
    page_size: usize,
}
//
impl OsMemoryProvider {
    /// NUMA nodes that memory comes from
    pub fn nodemask(&self) -> &NodeMask {
        &self.nodemask
    }

    /// Placement of memory over the node mask
    pub fn numa_mode(&self) -> NumaMode {
        self.numa_mode
    }

    /// Linux memory policy mode that allocations are bound with, if any
    fn mbind_mode(&self) -> Option<c_int> {
        match self.numa_mode {
            NumaMode::Default if self.nodemask.is_empty() => None,
            NumaMode::Default | NumaMode::Bind => Some(MPOL_BIND),
            NumaMode::Interleave => Some(MPOL_INTERLEAVE),
            NumaMode::Preferred => Some(MPOL_PREFERRED),
            NumaMode::Local => Some(MPOL_LOCAL),
        }
    }
}
//
impl MemoryProviderOps for OsMemoryProviderOps {
    type Params = OsMemoryProviderParams;
    type State = OsMemoryProvider;

    fn name(&self) -> &'static str {
        "os"
    }

    fn initialize(&self, params: &OsMemoryProviderParams) -> Result<OsMemoryProvider, MemoryError> {
        let expected = params.nodemask.maxnode();
        if params.maxnode != expected {
            return Err(InvalidArgument::InconsistentMaxNode {
                maxnode: params.maxnode,
                expected,
            }
            .into());
        }
        let needs_nodes = matches!(
            params.numa_mode,
            NumaMode::Bind | NumaMode::Interleave | NumaMode::Preferred
        );
        if needs_nodes && params.nodemask.is_empty() {
            return Err(InvalidArgument::EmptyNodeList.into());
        }
        let state = OsMemoryProvider {
            protection: params.protection,
            visibility: params.visibility,
            nodemask: params.nodemask.clone(),
            numa_mode: params.numa_mode,
            numa_flags: params.numa_flags,
            page_size: query_page_size()?,
        };
        tracing::debug!(
            "OS memory provider on nodes [{}] (mode {}, maxnode {})",
            state.nodemask,
            state.numa_mode,
            params.maxnode
        );
        Ok(state)
    }

    fn finalize(&self, _state: OsMemoryProvider) {}

    fn alloc(
        &self,
        state: &OsMemoryProvider,
        size: usize,
        alignment: usize,
    ) -> Result<NonNull<u8>, MemoryError> {
        #[cfg(unix)]
        {
            state.map(size, alignment)
        }
        #[cfg(not(unix))]
        {
            let _ = (state, size, alignment);
            Err(MemoryError::NotSupported("OS memory mapping"))
        }
    }

    unsafe fn free(
        &self,
        state: &OsMemoryProvider,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<(), MemoryError> {
        #[cfg(unix)]
        {
            let len = state.mapped_len(size, 1)?;
            // SAFETY: Per function precondition, ptr comes from map() with
            //         the same size, which mapped exactly len bytes there
            unsafe { unmap(ptr.as_ptr(), len) }
        }
        #[cfg(not(unix))]
        {
            let _ = (state, ptr, size);
            Err(MemoryError::NotSupported("OS memory mapping"))
        }
    }

    fn page_size(&self, state: &OsMemoryProvider) -> usize {
        state.page_size
    }
}

// --- Implementation details ---

// Linux memory policy modes and flags, from <linux/mempolicy.h>
const MPOL_PREFERRED: c_int = 1;
const MPOL_BIND: c_int = 2;
const MPOL_INTERLEAVE: c_int = 3;
const MPOL_LOCAL: c_int = 4;
#[cfg(target_os = "linux")]
const MPOL_MF_STRICT: std::ffi::c_uint = 1 << 0;

/// Size of OS pages
#[cfg(unix)]
fn query_page_size() -> Result<usize, MemoryError> {
    // SAFETY: sysconf has no memory safety preconditions
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(page_size)
        .ok()
        .filter(|&size| size > 0)
        .ok_or(MemoryError::Unknown {
            api: "sysconf",
            errno: None,
        })
}
//
#[cfg(not(unix))]
fn query_page_size() -> Result<usize, MemoryError> {
    Err(MemoryError::NotSupported("OS memory mapping"))
}

/// Unmap memory
///
/// # Safety
///
/// `[ptr, ptr + len)` must be a mapping owned by the caller, which must not
/// be used after this call.
#[cfg(unix)]
unsafe fn unmap(ptr: *mut u8, len: usize) -> Result<(), MemoryError> {
    // SAFETY: Forwarded from the caller
    crate::errors::call_os_int("munmap", || unsafe { libc::munmap(ptr.cast(), len) })
}

#[cfg(unix)]
impl OsMemoryProvider {
    /// Length of the mapping that backs an allocation of `size` bytes
    fn mapped_len(&self, size: usize, alignment: usize) -> Result<usize, MemoryError> {
        size.checked_next_multiple_of(self.page_size)
            .ok_or(InvalidArgument::BadLayout { size, alignment }.into())
    }

    /// Map `size` bytes aligned to `alignment`, then bind them
    fn map(&self, size: usize, alignment: usize) -> Result<NonNull<u8>, MemoryError> {
        let len = self.mapped_len(size, alignment)?;

        // Page alignment comes for free, larger alignments are obtained by
        // over-allocating then trimming
        let slack = if alignment > self.page_size {
            alignment - self.page_size
        } else {
            0
        };
        let map_len = len
            .checked_add(slack)
            .ok_or(InvalidArgument::BadLayout { size, alignment })?;
        let visibility = match self.visibility {
            Visibility::Private => libc::MAP_PRIVATE,
            Visibility::Shared => libc::MAP_SHARED,
        };
        let base = crate::errors::call_os_mmap("mmap", || {
            // SAFETY: Anonymous mapping at an address chosen by the OS
            unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    map_len,
                    self.protection.to_prot(),
                    visibility | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            }
        })?
        .cast::<u8>();

        let head = (base as usize).next_multiple_of(alignment) - base as usize;
        // SAFETY: head <= slack < map_len, so this stays inside the mapping
        let start = unsafe { base.add(head) };
        let tail = map_len - head - len;
        if head > 0 {
            // SAFETY: Leading slack of the mapping created above
            if let Err(error) = unsafe { unmap(base, head) } {
                tracing::warn!("failed to trim {head} leading bytes of an over-aligned mapping: {error}");
            }
        }
        if tail > 0 {
            // SAFETY: Trailing slack of the mapping created above
            if let Err(error) = unsafe { unmap(start.add(len), tail) } {
                tracing::warn!("failed to trim {tail} trailing bytes of an over-aligned mapping: {error}");
            }
        }

        if let Err(error) = self.bind(start, len) {
            // SAFETY: The mapping was created above and never exposed
            if let Err(unmap_error) = unsafe { unmap(start, len) } {
                tracing::warn!("failed to release a mapping that could not be bound: {unmap_error}");
            }
            return Err(error);
        }
        NonNull::new(start).ok_or(MemoryError::Unknown {
            api: "mmap",
            errno: None,
        })
    }

    /// Apply the NUMA policy of this provider to a fresh mapping
    #[cfg(target_os = "linux")]
    fn bind(&self, start: *mut u8, len: usize) -> Result<(), MemoryError> {
        let Some(mode) = self.mbind_mode() else {
            return Ok(());
        };
        let words = self.nodemask.as_words();
        let (mask, maxnode) = if mode == MPOL_LOCAL {
            (std::ptr::null(), 0)
        } else {
            // The kernel reads maxnode - 1 bits
            (
                words.as_ptr(),
                words.len() * std::ffi::c_ulong::BITS as usize + 1,
            )
        };
        let flags = if self.numa_flags.contains(NumaFlags::STRICT) {
            MPOL_MF_STRICT
        } else {
            0
        };
        crate::errors::call_os_int("mbind", || {
            // SAFETY: start..start+len is a mapping owned by this provider and
            //         mask holds at least maxnode - 1 bits
            unsafe { libc::syscall(libc::SYS_mbind, start, len, mode, mask, maxnode, flags) }
        })
    }

    /// Apply the NUMA policy of this provider to a fresh mapping
    #[cfg(not(target_os = "linux"))]
    fn bind(&self, _start: *mut u8, _len: usize) -> Result<(), MemoryError> {
        match self.mbind_mode() {
            Some(_) => Err(MemoryError::NotSupported("NUMA memory binding")),
            None => Ok(()),
        }
    }
}
