//! Memspace allocation policies

use strum::{Display, EnumIter};

/// How allocations should be spread over the targets of a memspace
///
/// Policies are forwarded untouched to the memory targets, which decide what
/// each policy means for them. When no policy is given, targets use their own
/// default placement.
#[derive(Copy, Clone, Debug, Display, EnumIter, Eq, Hash, PartialEq)]
pub enum MemspacePolicy {
    /// Only allocate from the targets of the memspace
    Bind,

    /// Spread allocations evenly over the targets of the memspace
    Interleave,

    /// Allocate from the first target of the memspace when possible
    Preferred,
}
