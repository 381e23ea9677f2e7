//! Error handling primitives
//!
//! Every fallible operation of this crate reports a [`MemoryError`], whose
//! variants form a small closed taxonomy. [`MemoryError::NotSupported`] is
//! special: it signals that an optional platform feature (bandwidth
//! attributes, NUMA binding...) is unavailable, which callers are expected to
//! handle gracefully rather than treat as fatal.
//
// At the implementation level, this is also the place where the low-level
// handling of OS errors (errno) is implemented.

use crate::{config::NodeListError, memory::nodemask::NodeId, memory::target::OpsVersion};
use errno::Errno;
use libc::{EINVAL, ENOMEM, ENOSYS, EPERM};
use std::{collections::TryReserveError, io};
use thiserror::Error;

/// Failure of a memory target, memspace, provider or pool operation
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum MemoryError {
    /// An input of the operation is not valid
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),

    /// Host memory could not be allocated for internal bookkeeping
    #[error("out of host memory")]
    OutOfHostMemory,

    /// An optional feature is not available on this platform
    ///
    /// This is an expected outcome, e.g. on machines whose firmware does not
    /// report memory bandwidth attributes.
    #[error("{0} is not supported on this platform")]
    NotSupported(&'static str),

    /// A collaborator failed in a way that does not map to a more specific
    /// error kind
    #[error("{api} failed unexpectedly (errno {errno:?})")]
    Unknown {
        /// Entry point that failed
        api: &'static str,

        /// Observed errno value, if errno was set
        errno: Option<Errno>,
    },
}
//
impl MemoryError {
    /// Truth that this error reports an unavailable optional feature
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    /// Map an I/O error from a collaborator (e.g. sysfs reads)
    pub(crate) fn from_io(api: &'static str, error: &io::Error) -> Self {
        Self::Unknown {
            api,
            errno: error.raw_os_error().map(Errno),
        }
    }
}
//
impl From<TryReserveError> for MemoryError {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfHostMemory
    }
}
//
impl From<NodeListError> for MemoryError {
    fn from(error: NodeListError) -> Self {
        Self::InvalidArgument(error.into())
    }
}

/// Reason why an input was rejected
#[derive(Clone, Debug, Eq, Error, Hash, PartialEq)]
pub enum InvalidArgument {
    /// The memspace contains no memory target
    #[error("memspace contains no memory target")]
    EmptyMemspace,

    /// The memspace mixes memory targets of different kinds
    #[error("memspace mixes memory targets of different kinds")]
    HeterogeneousMemspace,

    /// A list of NUMA node ids was empty
    #[error("NUMA node id list is empty")]
    EmptyNodeList,

    /// A textual list of NUMA node ids could not be parsed
    #[error(transparent)]
    NodeList(#[from] NodeListError),

    /// The ops table was built against another version of this crate
    #[error("ops version {found} does not match the expected version {expected}")]
    OpsVersionMismatch {
        /// Version this crate expects
        expected: OpsVersion,

        /// Version declared by the ops table
        found: OpsVersion,
    },

    /// A NUMA node id cannot be represented in a node mask
    #[error("NUMA node {0} is out of the supported range")]
    NodeOutOfRange(NodeId),

    /// The `maxnode` of provider parameters does not match their node mask
    #[error("maxnode {maxnode} does not match the highest node of the mask ({expected})")]
    InconsistentMaxNode {
        /// Provided maxnode
        maxnode: usize,

        /// Highest set bit of the node mask
        expected: usize,
    },

    /// A selection callback picked a candidate that does not exist
    #[error("selected candidate #{index} but only {len} candidates exist")]
    BadSelection {
        /// Index returned by the callback
        index: usize,

        /// Number of candidates that were offered
        len: usize,
    },

    /// Allocation size or alignment is not acceptable
    #[error("cannot allocate {size} bytes with alignment {alignment}")]
    BadLayout {
        /// Requested size in bytes
        size: usize,

        /// Requested alignment in bytes
        alignment: usize,
    },

    /// The operating system rejected a parameter of the named call
    #[error("parameters rejected by {0}")]
    RejectedByOs(&'static str),
}

/// Do something with errno checking
///
/// Call a user-provided callback, which tells if symptoms of an OS-side error
/// were observed. If so, check for appearance of nonzero errno values and
/// report them.
///
/// When this function returns, errno is back to the state where it was before
/// the user callback was invoked.
fn check_errno<R>(callback: impl FnOnce() -> (R, bool)) -> (R, Option<Errno>) {
    let old_errno = errno::errno();
    errno::set_errno(Errno(0));

    let (result, should_check_errno) = callback();

    let mut new_errno = None;
    if should_check_errno {
        let errno = errno::errno();
        if errno != Errno(0) {
            new_errno = Some(errno);
        }
    }
    errno::set_errno(old_errno);

    (result, new_errno)
}

/// Translate the errno of a failed OS call into a [`MemoryError`]
fn os_error(api: &'static str, errno: Option<Errno>) -> MemoryError {
    match errno {
        Some(Errno(ENOMEM)) => MemoryError::OutOfHostMemory,
        Some(Errno(EINVAL)) => InvalidArgument::RejectedByOs(api).into(),
        Some(Errno(ENOSYS | EPERM)) => MemoryError::NotSupported(api),
        errno => MemoryError::Unknown { api, errno },
    }
}

/// Call an OS entry point that returns `MAP_FAILED` on failure
///
/// # Errors
///
/// See [`os_error()`] for the errno translation.
#[cfg(unix)]
pub(crate) fn call_os_mmap(
    api: &'static str,
    call: impl FnOnce() -> *mut libc::c_void,
) -> Result<*mut libc::c_void, MemoryError> {
    let (result, errno) = check_errno(|| {
        let result = call();
        (result, result == libc::MAP_FAILED)
    });
    if result == libc::MAP_FAILED {
        Err(os_error(api, errno))
    } else {
        Ok(result)
    }
}

/// Call an OS entry point that returns an integer where negative values
/// signal failure
///
/// # Errors
///
/// See [`os_error()`] for the errno translation.
pub(crate) fn call_os_int<Int: Into<i64> + Copy>(
    api: &'static str,
    call: impl FnOnce() -> Int,
) -> Result<(), MemoryError> {
    let (result, errno) = check_errno(|| {
        let result = call();
        (result, result.into() < 0)
    });
    if result.into() < 0 {
        Err(os_error(api, errno))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[allow(unused)]
    use similar_asserts::assert_eq;

    #[test]
    fn errno_translation() {
        assert_eq!(
            os_error("mbind", Some(Errno(ENOMEM))),
            MemoryError::OutOfHostMemory
        );
        assert_eq!(
            os_error("mbind", Some(Errno(EINVAL))),
            MemoryError::InvalidArgument(InvalidArgument::RejectedByOs("mbind"))
        );
        assert!(os_error("mbind", Some(Errno(ENOSYS))).is_not_supported());
        assert!(os_error("mbind", Some(Errno(EPERM))).is_not_supported());
        assert_eq!(
            os_error("mmap", None),
            MemoryError::Unknown {
                api: "mmap",
                errno: None
            }
        );
    }

    #[test]
    fn errno_is_restored() {
        errno::set_errno(Errno(42));
        let res = call_os_int("fake", || {
            errno::set_errno(Errno(ENOMEM));
            -1i32
        });
        assert_eq!(res, Err(MemoryError::OutOfHostMemory));
        assert_eq!(errno::errno(), Errno(42));

        assert_eq!(call_os_int("fake", || 0i32), Ok(()));
    }

    #[test]
    fn display() {
        assert_eq!(
            MemoryError::NotSupported("memory bandwidth attributes").to_string(),
            "memory bandwidth attributes is not supported on this platform"
        );
        assert_eq!(
            MemoryError::from(InvalidArgument::EmptyMemspace).to_string(),
            "memspace contains no memory target"
        );
    }
}
