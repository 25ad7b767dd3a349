//! ntfy push messages

use std::time::Duration;

use async_trait::async_trait;
use restic_common::duration::format_duration;
use serde::Serialize;
use tracing::debug;

use crate::error::NotifyError;
use crate::event::{EventKind, NotificationEvent};
use crate::manager::{Notifier, NotifyTargets, NtfyTarget};

#[derive(Debug, Serialize, PartialEq)]
struct NtfyMessage {
    topic: String,
    message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    title: String,
    #[serde(skip_serializing_if = "is_zero")]
    priority: u8,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tags: Vec<String>,
}

fn is_zero(n: &u8) -> bool {
    *n == 0
}

/// Publishes JSON messages to an ntfy server
pub struct NtfyNotifier {
    client: reqwest::Client,
}

impl NtfyNotifier {
    /// Notifier sending through `client`
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn default_priority(kind: EventKind) -> u8 {
    match kind {
        EventKind::Success => 3,
        EventKind::Failure => 5,
        EventKind::Warning => 4,
    }
}

fn default_tag(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Success => "white_check_mark",
        EventKind::Failure => "x",
        EventKind::Warning => "warning",
    }
}

fn build_message(target: &NtfyTarget, event: &NotificationEvent) -> NtfyMessage {
    let config = &target.config;

    let mut message = event.message.clone();
    if !event.duration.is_zero() {
        let rounded = Duration::from_secs_f64(event.duration.as_secs_f64().round());
        message.push_str(&format!("\nDuration: {}", format_duration(rounded)));
    }
    if let Some(size) = event.size.as_deref().filter(|s| !s.is_empty()) {
        message.push_str(&format!("\nSize: {size}"));
    }
    if event.files > 0 {
        message.push_str(&format!("\nFiles: {}", event.files));
    }

    let tags = if config.tags.is_empty() {
        vec![default_tag(event.kind).to_string()]
    } else {
        config.tags.clone()
    };

    NtfyMessage {
        topic: config.topic.clone(),
        title: format!(
            "{}/{} - Backup {}",
            event.namespace,
            event.resource,
            event.kind.title()
        ),
        message,
        priority: config
            .priority
            .filter(|p| *p > 0)
            .unwrap_or_else(|| default_priority(event.kind)),
        tags,
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    fn name(&self) -> &'static str {
        "ntfy"
    }

    fn accepts(&self, targets: &NotifyTargets, event: &NotificationEvent) -> bool {
        targets.ntfy.as_ref().is_some_and(|t| {
            !t.config.server_url.is_empty() && (!t.config.only_on_failure || event.is_failure())
        })
    }

    async fn send(
        &self,
        targets: &NotifyTargets,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError> {
        let Some(target) = targets.ntfy.as_ref() else {
            return Ok(());
        };
        let body = build_message(target, event);
        let url = target.config.server_url.trim_end_matches('/');

        let mut request = self.client.post(url).json(&body);
        if let Some(auth) = target.auth_header.as_deref().filter(|a| !a.is_empty()) {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                backend: "ntfy",
                status: status.as_u16(),
            });
        }

        debug!(topic = %body.topic, kind = ?event.kind, "Sent ntfy notification");
        Ok(())
    }
}
