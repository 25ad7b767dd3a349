//! CRD installation
//!
//! The operator applies its own CRDs on startup with server-side apply, so
//! the installed schema always matches the running binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};

use restic_common::{ResourceRegistry, FIELD_MANAGER};

/// Apply every CRD in `registry`
pub async fn ensure_crds_installed(
    client: &Client,
    registry: &ResourceRegistry,
) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for info in registry.iter() {
        let name = info.crd.name_any();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&info.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All CRDs installed/updated");
    Ok(())
}
