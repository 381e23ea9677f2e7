//! NUMA-aware memory spaces
//!
//! This crate describes *where* memory should come from, and turns that
//! description into allocators.
//!
//! - A [`MemoryTarget`] is a place where memory can be allocated, such as a
//!   NUMA node. Each kind of target is implemented by a
//!   [`MemoryTargetOps`](memory::target::MemoryTargetOps) table.
//! - A [`Memspace`] is an ordered set of memory targets of the same kind. It
//!   can be sorted and filtered by target properties like memory bandwidth,
//!   then resolved into a [`MemoryPool`] or a [`MemoryProvider`].
//! - [`PredefinedMemspaces`] gives access to memspaces that describe the host,
//!   like the memspace of all NUMA nodes or the memspace of NUMA nodes by
//!   decreasing bandwidth.
//!
//! Here is how one would allocate some memory from the NUMA nodes of the host:
//!
//! ```no_run
//! use memlocality::{MemoryError, PredefinedMemspaces};
//! use std::alloc::Layout;
//!
//! # fn main() -> Result<(), MemoryError> {
//! if let Some(host_all) = PredefinedMemspaces::global().host_all() {
//!     let pool = host_all.create_pool(None)?;
//!     let layout = Layout::from_size_align(4096, 64).expect("valid layout");
//!     let ptr = pool.allocate(layout)?;
//!     // SAFETY: ptr was allocated from this pool with this layout
//!     unsafe { pool.deallocate(ptr, layout)? };
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The set of NUMA nodes and their bandwidths are read from sysfs on Linux.
//! Other [`TopologySource`]s can be used to build memspaces that describe
//! another machine.

pub mod config;
pub mod errors;
pub mod memory;
pub mod memspace;
pub mod pool;
pub mod provider;
#[cfg(any(test, feature = "proptest"))]
pub mod strategies;
pub mod topology;

pub use crate::{
    errors::MemoryError,
    memory::{nodemask::NodeId, target::MemoryTarget},
    memspace::{policy::MemspacePolicy, predefined::PredefinedMemspaces, Memspace},
    pool::MemoryPool,
    provider::MemoryProvider,
    topology::TopologySource,
};
