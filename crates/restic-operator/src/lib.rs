//! Restic backup operator binary support: configuration, CRD install and
//! controller wiring

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod config;
/// Controller construction for the four managed kinds
pub mod controller_runner;
/// Startup utilities (CRD install)
pub mod startup;
