//! Restic Operator - Kubernetes-native restic backups, restores and retention

use std::sync::Arc;

use clap::Parser;
use kube::Client;

use restic_common::leader_election::{LeaderElector, Leadership, LEADER_LEASE_NAME};
use restic_common::telemetry::{init_telemetry, TelemetryConfig};
use restic_common::ResourceRegistry;
use restic_controller::Context;
use restic_executor::ProcessExecutor;
use restic_notify::NotificationManager;
use restic_operator::config::Cli;
use restic_operator::controller_runner::build_controllers;
use restic_operator::startup::ensure_crds_installed;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and reqwest both pull in rustls; pin the provider before either builds a client
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    let registry = Arc::new(ResourceRegistry::new());

    if cli.crd {
        println!("{}", registry.crds_yaml()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
    })?;

    run_controller(cli, registry).await
}

async fn run_controller(cli: Cli, registry: Arc<ResourceRegistry>) -> anyhow::Result<()> {
    tracing::info!(
        stale_lock_threshold = ?cli.stale_lock_threshold,
        concurrency = cli.concurrency,
        leader_election = cli.leader_election,
        "Restic operator starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client, &registry).await?;

    let mut guard = None;
    let leadership = if cli.leader_election {
        let identity = pod_identity();
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &cli.namespace,
            &identity,
        ));
        let leadership = elector.leadership();
        guard = Some(elector.acquire().await?);
        leadership
    } else {
        Leadership::always()
    };

    let notifications = NotificationManager::with_default_backends()?;
    let executor = ProcessExecutor::new(cli.restic_binary.clone(), cli.executor_timeout);
    let ctx = Arc::new(
        Context::builder(client.clone())
            .registry(registry)
            .executor(Arc::new(executor))
            .notifications(Arc::new(notifications))
            .leadership(leadership)
            .stale_lock_threshold(cli.stale_lock_threshold)
            .reconcile_timeout(cli.reconcile_timeout)
            .build(),
    );

    let controllers = futures::future::join_all(build_controllers(client, ctx, cli.concurrency));

    match guard.as_mut() {
        Some(guard) => {
            tokio::select! {
                _ = controllers => {
                    tracing::info!("Controllers stopped");
                }
                _ = guard.lost() => {
                    tracing::error!("Leadership lost, exiting so another replica can take over");
                    anyhow::bail!("leadership lost");
                }
            }
            if let Err(e) = guard.release_leadership().await {
                tracing::warn!(error = %e, "Failed to release leadership");
            }
        }
        None => {
            controllers.await;
        }
    }

    tracing::info!("Restic operator shutting down");
    Ok(())
}

/// Lease holder identity: the pod name, falling back to the hostname
fn pod_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("restic-operator-{}", std::process::id()))
}
