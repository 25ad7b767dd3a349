//! Prometheus Pushgateway metrics
//!
//! Metrics are rendered in the text exposition format and PUT to the
//! grouping key `job/<job>/backup/<resource>/namespace/<namespace>`, which
//! replaces the previous push for the same backup.

use std::fmt::Write as _;

use async_trait::async_trait;
use tracing::debug;

use crate::error::NotifyError;
use crate::event::{EventKind, NotificationEvent};
use crate::manager::{Notifier, NotifyTargets};

const DEFAULT_JOB_NAME: &str = "backup";

/// Pushes backup gauges to a Pushgateway
pub struct PushgatewayNotifier {
    client: reqwest::Client,
}

impl PushgatewayNotifier {
    /// Notifier sending through `client`
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn push_url(base: &str, job: &str, event: &NotificationEvent) -> String {
    format!(
        "{}/metrics/job/{}/backup/{}/namespace/{}",
        base.trim_end_matches('/'),
        job,
        event.resource,
        event.namespace
    )
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
    // Writing into a String cannot fail.
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn render_metrics(event: &NotificationEvent) -> String {
    let mut out = String::new();
    gauge(
        &mut out,
        "backup_duration_seconds",
        "Duration of the backup operation in seconds",
        event.duration.as_secs_f64(),
    );
    gauge(
        &mut out,
        "backup_start_timestamp",
        "Unix timestamp when the backup started",
        event.timestamp.timestamp() as f64,
    );
    gauge(
        &mut out,
        "backup_status",
        "Status of the backup (1 = success, 0 = failure)",
        if event.kind == EventKind::Success { 1.0 } else { 0.0 },
    );
    if event.files > 0 {
        gauge(
            &mut out,
            "backup_snapshot_files_total",
            "Number of files in the backup snapshot",
            event.files as f64,
        );
    }
    out
}

#[async_trait]
impl Notifier for PushgatewayNotifier {
    fn name(&self) -> &'static str {
        "pushgateway"
    }

    fn accepts(&self, targets: &NotifyTargets, _event: &NotificationEvent) -> bool {
        targets
            .pushgateway
            .as_ref()
            .is_some_and(|p| !p.url.is_empty())
    }

    async fn send(
        &self,
        targets: &NotifyTargets,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError> {
        let Some(config) = targets.pushgateway.as_ref() else {
            return Ok(());
        };
        let job = config
            .job_name
            .as_deref()
            .filter(|j| !j.is_empty())
            .unwrap_or(DEFAULT_JOB_NAME);
        let url = push_url(&config.url, job, event);

        let response = self
            .client
            .put(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )
            .body(render_metrics(event))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                backend: "pushgateway",
                status: status.as_u16(),
            });
        }

        debug!(url = %url, job, backup = %event.resource, kind = ?event.kind, "Pushed metrics to Pushgateway");
        Ok(())
    }
}
