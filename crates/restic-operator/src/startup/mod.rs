//! Startup utilities for the restic operator

mod crds;

pub use crds::ensure_crds_installed;
