//! Common types for the restic operator: CRDs, conditions, errors, and utilities

#![deny(missing_docs)]

pub mod conditions;
pub mod crd;
pub mod cron;
pub mod duration;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod leader_election;
pub mod registry;
pub mod telemetry;

pub use error::Error;
pub use registry::{KindInfo, ManagedKind, ResourceRegistry};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name of the operator, used in labels and as the event reporter
pub const OPERATOR_NAME: &str = "restic-backup-operator";

/// Field manager for server-side apply and patches
pub const FIELD_MANAGER: &str = "restic-controller";

/// Standard name label
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Standard component label
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

/// Standard managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
