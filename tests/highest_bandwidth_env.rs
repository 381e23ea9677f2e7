//! Test process for the environment override of the highest bandwidth
//! memspace, which affects the whole process.

// WARNING: DO NOT CREATE ANY OTHER #[test] FUNCTION IN THIS INTEGRATION TEST!
//
// The override is read from the process environment, which is shared by every
// test of a test binary. If you need more tests, create more integration
// tests.

use memlocality::{config::HIGHEST_BANDWIDTH_ENV, NodeId, PredefinedMemspaces};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;

#[test]
fn highest_bandwidth_env() -> eyre::Result<()> {
    // Set up logging and span traces
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(ErrorLayer::default());
    tracing::subscriber::set_global_default(subscriber)?;

    // Must happen before the first access to the global memspaces
    std::env::set_var(HIGHEST_BANDWIDTH_ENV, "1,2");

    let memspaces = PredefinedMemspaces::global();
    let highest = memspaces
        .highest_bandwidth()
        .ok_or_else(|| eyre::eyre!("overridden memspace should always be available"))?;
    assert_eq!(highest.numa_ids(), [NodeId::new(1), NodeId::new(2)]);
    assert_eq!(highest.len(), 2);

    // Repeated accesses observe the same memspace
    let again = memspaces
        .highest_bandwidth()
        .ok_or_else(|| eyre::eyre!("memspace should not disappear"))?;
    assert!(std::ptr::eq(highest, again));

    // Later changes to the environment are not taken into account
    std::env::set_var(HIGHEST_BANDWIDTH_ENV, "0");
    assert_eq!(
        memspaces.highest_bandwidth().map(|memspace| memspace.numa_ids()),
        Some(vec![NodeId::new(1), NodeId::new(2)])
    );
    Ok(())
}

// WARNING: DO NOT CREATE ANY OTHER #[test] FUNCTION IN THIS INTEGRATION TEST!
