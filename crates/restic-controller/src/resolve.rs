//! Reference resolution between kinds
//!
//! Backups and retention policies point at a repository, restores point at a
//! backup. An empty namespace on a reference means the referrer's own
//! namespace.

use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, warn};

use restic_common::conditions::{is_condition_true, set_condition};
use restic_common::crd::{
    Condition, ConditionStatus, CrossNamespaceObjectReference, NotificationConfig, ResticBackup,
    ResticRepository, CONDITION_READY, CONDITION_REPOSITORY_READY,
};
use restic_common::kube_utils::secret_string;
use restic_common::Error;
use restic_executor::types::{ENV_AWS_ACCESS_KEY_ID, ENV_AWS_SECRET_ACCESS_KEY, ENV_PASSWORD};
use restic_executor::Credentials;
use restic_notify::NotifyTargets;

use crate::client::KubeClient;

/// Secret key holding the ntfy Authorization header when none is named
pub const DEFAULT_NTFY_AUTH_KEY: &str = "auth-header";

/// Why repository credentials could not be loaded
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// The referenced secret does not exist
    #[error("secret {namespace}/{name} not found")]
    SecretNotFound {
        /// Secret name
        name: String,
        /// Secret namespace
        namespace: String,
    },

    /// The secret exists but lacks the password key
    #[error("secret {namespace}/{name} has no key {key}")]
    MissingKey {
        /// Secret name
        name: String,
        /// Secret namespace
        namespace: String,
        /// Missing key
        key: String,
    },

    /// The API call failed
    #[error(transparent)]
    Kube(#[from] Error),
}

/// Look up the repository `reference` points at
pub async fn find_repository(
    kube: &dyn KubeClient,
    reference: &CrossNamespaceObjectReference,
    referrer_namespace: &str,
) -> Result<Option<ResticRepository>, Error> {
    let namespace = reference.namespace_or(referrer_namespace);
    debug!(repository = %reference.name, namespace, "resolving repository reference");
    kube.get_repository(&reference.name, namespace).await
}

/// Look up the backup `reference` points at
pub async fn find_backup(
    kube: &dyn KubeClient,
    reference: &CrossNamespaceObjectReference,
    referrer_namespace: &str,
) -> Result<Option<ResticBackup>, Error> {
    let namespace = reference.namespace_or(referrer_namespace);
    debug!(backup = %reference.name, namespace, "resolving backup reference");
    kube.get_backup(&reference.name, namespace).await
}

/// Secret key holding the repository password
pub fn password_key(repository: &ResticRepository) -> &str {
    repository
        .spec
        .credentials_secret_ref
        .key
        .as_deref()
        .filter(|k| !k.is_empty())
        .unwrap_or(ENV_PASSWORD)
}

/// Build restic credentials from the repository's secret
///
/// The secret lives in the repository's namespace. The password is
/// required; AWS keys are passed through when present.
pub async fn load_credentials(
    kube: &dyn KubeClient,
    repository: &ResticRepository,
) -> Result<Credentials, CredentialsError> {
    let name = &repository.spec.credentials_secret_ref.name;
    let namespace = repository.namespace().unwrap_or_default();

    let secret = kube
        .get_secret(name, &namespace)
        .await?
        .ok_or_else(|| CredentialsError::SecretNotFound {
            name: name.clone(),
            namespace: namespace.clone(),
        })?;

    let key = password_key(repository);
    let password = secret_string(&secret, key)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| CredentialsError::MissingKey {
            name: name.clone(),
            namespace: namespace.clone(),
            key: key.to_string(),
        })?;

    let mut credentials = Credentials::new(repository.spec.repository_url.clone(), password);
    credentials.aws_access_key_id = secret_string(&secret, ENV_AWS_ACCESS_KEY_ID);
    credentials.aws_secret_access_key = secret_string(&secret, ENV_AWS_SECRET_ACCESS_KEY);
    Ok(credentials)
}

/// Enabled notification targets of a resource in `namespace`
///
/// The ntfy Authorization header is read from its credentials secret. A
/// missing secret only drops the header.
pub async fn notification_targets(
    kube: &dyn KubeClient,
    config: Option<&NotificationConfig>,
    namespace: &str,
) -> NotifyTargets {
    let Some(config) = config else {
        return NotifyTargets::default();
    };

    let auth_ref = config
        .ntfy
        .as_ref()
        .filter(|n| n.enabled)
        .and_then(|n| n.credentials_secret_ref.as_ref());

    let auth_header = match auth_ref {
        Some(selector) => {
            let key = selector
                .key
                .as_deref()
                .filter(|k| !k.is_empty())
                .unwrap_or(DEFAULT_NTFY_AUTH_KEY);
            match kube.get_secret(&selector.name, namespace).await {
                Ok(Some(secret)) => secret_string(&secret, key),
                Ok(None) => {
                    warn!(secret = %selector.name, namespace, "ntfy credentials secret not found");
                    None
                }
                Err(e) => {
                    warn!(secret = %selector.name, namespace, error = %e, "failed to read ntfy credentials");
                    None
                }
            }
        }
        None => None,
    };

    NotifyTargets::from_config(config, auth_header)
}

/// Whether a repository reports `Ready=True`
pub fn repository_ready(repository: &ResticRepository) -> bool {
    repository
        .status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, CONDITION_READY))
}

/// Mirror the referenced repository's state as a `RepositoryReady` condition
pub fn set_repository_ready(
    conditions: &mut Vec<Condition>,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    set_condition(
        conditions,
        Condition::new(CONDITION_REPOSITORY_READY, status, reason, message),
    );
}
