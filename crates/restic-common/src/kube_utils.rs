//! Shared Kubernetes helpers using kube-rs

use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from the in-cluster or local config with default timeouts
pub async fn create_client() -> Result<Client, Error> {
    let mut config = Config::infer().await.map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
    })?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// A status write computed from one snapshot of a resource
///
/// The snapshot's resourceVersion travels with the patch, so the API server
/// rejects the write with 409 Conflict once the object has moved on.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate<S> {
    /// resourceVersion of the snapshot `current` was read from
    pub resource_version: Option<String>,
    /// Status as last observed
    pub current: S,
    /// Status to store
    pub desired: S,
}

impl<S: Clone + serde::Serialize> StatusUpdate<S> {
    /// Update of `resource`, whose status was observed as `current`
    pub fn new(resource: &impl kube::Resource, current: &S, desired: &S) -> Self {
        Self {
            resource_version: resource.meta().resource_version.clone(),
            current: current.clone(),
            desired: desired.clone(),
        }
    }

    /// JSON merge patch for the status sub-resource
    ///
    /// A field present in `current` but left out of `desired` is sent as
    /// `null`; a merge patch keeps any key it does not mention.
    pub fn merge_patch(&self) -> Result<serde_json::Value, serde_json::Error> {
        let current = serde_json::to_value(&self.current)?;
        let mut desired = serde_json::to_value(&self.desired)?;
        null_cleared(&current, &mut desired);

        let mut patch = serde_json::json!({ "status": desired });
        if let Some(version) = &self.resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": version });
        }
        Ok(patch)
    }
}

fn null_cleared(current: &serde_json::Value, desired: &mut serde_json::Value) {
    use serde_json::Value;

    let (Value::Object(current), Value::Object(desired)) = (current, desired) else {
        return;
    };
    for (key, old) in current {
        match desired.get_mut(key) {
            Some(new) => null_cleared(old, new),
            None => {
                desired.insert(key.clone(), Value::Null);
            }
        }
    }
}

/// Merge-patch the status sub-resource of a namespaced resource.
///
/// Returns the patched object.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    update: &StatusUpdate<impl Clone + serde::Serialize>,
    field_manager: &str,
) -> Result<T, kube::Error>
where
    T: kube::Resource<Scope = NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = update.merge_patch().map_err(kube::Error::SerdeError)?;
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await
}

/// Merge-patch `metadata.finalizers` of a namespaced resource.
pub async fn patch_finalizers<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    finalizers: Vec<String>,
    field_manager: &str,
) -> Result<(), kube::Error>
where
    T: kube::Resource<Scope = NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Whether `meta` carries `finalizer`
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == finalizer))
}

/// Finalizers of `meta` with `finalizer` appended (no duplicates)
pub fn finalizers_with(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

/// Finalizers of `meta` without `finalizer`
pub fn finalizers_without(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().filter(|s| *s != finalizer).cloned().collect())
        .unwrap_or_default()
}

/// 16-hex-char truncated SHA-256 of `input`
///
/// Stable across toolchains, so it can be persisted in annotations.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    use std::fmt::Write;

    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Read a UTF-8 value from a Secret's `data` (or `stringData`)
pub fn secret_string(secret: &Secret, key: &str) -> Option<String> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(bytes.0.clone()).ok();
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .cloned()
}
