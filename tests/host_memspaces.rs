//! Predefined memspaces of the host, resolved into real allocators

use memlocality::{
    memory::numa::NumaTarget, topology::sysfs::SysfsTopology, MemoryError, Memspace,
    MemspacePolicy, PredefinedMemspaces, TopologySource,
};
use std::alloc::Layout;
#[allow(unused)]
use similar_asserts::assert_eq;

/// Memspaces of the host, without any environment override
fn host_memspaces() -> PredefinedMemspaces {
    PredefinedMemspaces::with_config(
        SysfsTopology::new(),
        memlocality::config::ConfigSource::Fixed(Default::default()),
    )
}

/// Allocate and free a few bytes from a memspace, skipping the test when the
/// host does not support the requested binding
fn check_allocation(memspace: &Memspace, policy: Option<&MemspacePolicy>) -> eyre::Result<()> {
    let pool = memspace.create_pool(policy)?;
    assert!(pool.owns_provider());
    let layout = Layout::from_size_align(3 * 4096 + 17, 64)?;
    let ptr = match pool.allocate(layout) {
        Ok(ptr) => ptr,
        Err(MemoryError::NotSupported(what)) => {
            eprintln!("Skipping allocation check, {what} is not supported");
            return Ok(());
        }
        Err(other) => return Err(other.into()),
    };
    assert_eq!(ptr.as_ptr() as usize % layout.align(), 0);
    // SAFETY: ptr was allocated with layout and is not otherwise used
    unsafe {
        ptr.as_ptr().write_bytes(0xa5, layout.size());
        assert_eq!(*ptr.as_ptr().add(layout.size() - 1), 0xa5);
        pool.deallocate(ptr, layout)?;
    }
    Ok(())
}

#[test]
fn host_all() -> eyre::Result<()> {
    let memspaces = host_memspaces();
    let host_all = memspaces
        .host_all()
        .ok_or_else(|| eyre::eyre!("every host has at least one NUMA node"))?;
    let nodes = SysfsTopology::new().numa_nodes()?;
    assert_eq!(host_all.numa_ids(), nodes);
    assert!(host_all.is_homogeneous());
    assert!(host_all
        .iter()
        .all(|target| target.state::<NumaTarget>().is_some()));

    check_allocation(host_all, None)?;
    check_allocation(host_all, Some(&MemspacePolicy::Bind))?;

    let provider = host_all.create_provider(None)?;
    assert!(provider.page_size().is_power_of_two());
    Ok(())
}

#[test]
fn highest_bandwidth() -> eyre::Result<()> {
    let memspaces = host_memspaces();
    let Some(highest) = memspaces.highest_bandwidth() else {
        eprintln!("Skipping test, the host does not report memory bandwidth");
        return Ok(());
    };
    let host_all = memspaces
        .host_all()
        .ok_or_else(|| eyre::eyre!("host_all is required for highest_bandwidth"))?;
    let mut sorted = highest.numa_ids();
    sorted.sort_unstable();
    assert_eq!(sorted, host_all.numa_ids());

    let bandwidths = highest
        .iter()
        .map(|target| target.bandwidth(None, memspaces.topology()))
        .collect::<Result<Vec<_>, _>>()?;
    assert!(bandwidths.windows(2).all(|pair| pair[0] >= pair[1]));

    check_allocation(highest, None)
}
