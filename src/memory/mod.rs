//! Memory targets and NUMA node sets
//!
//! This module hosts the [`MemoryTarget`](target::MemoryTarget) abstraction,
//! its NUMA node implementation, and the node masks used to describe sets of
//! NUMA nodes to the operating system.

pub mod nodemask;
pub mod numa;
pub mod target;
