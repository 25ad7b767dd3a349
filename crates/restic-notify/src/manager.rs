//! Fan-out of events to notification backends

use std::sync::Arc;

use async_trait::async_trait;
use restic_common::crd::{NotificationConfig, NtfyConfig, PushgatewayConfig};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::NotifyError;
use crate::event::NotificationEvent;
use crate::ntfy::NtfyNotifier;
use crate::pushgateway::PushgatewayNotifier;

/// ntfy target with its resolved Authorization header
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NtfyTarget {
    /// Target as declared on the resource
    pub config: NtfyConfig,
    /// Value read from `credentialsSecretRef`, if any
    pub auth_header: Option<String>,
}

/// Enabled notification targets of one resource
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NotifyTargets {
    /// Pushgateway target
    pub pushgateway: Option<PushgatewayConfig>,
    /// ntfy target
    pub ntfy: Option<NtfyTarget>,
}

impl NotifyTargets {
    /// Keep only the enabled targets of `config`
    pub fn from_config(config: &NotificationConfig, ntfy_auth_header: Option<String>) -> Self {
        Self {
            pushgateway: config.pushgateway.clone().filter(|p| p.enabled),
            ntfy: config
                .ntfy
                .clone()
                .filter(|n| n.enabled)
                .map(|config| NtfyTarget {
                    config,
                    auth_header: ntfy_auth_header,
                }),
        }
    }

    /// Whether no target is enabled
    pub fn is_empty(&self) -> bool {
        self.pushgateway.is_none() && self.ntfy.is_none()
    }
}

/// A notification backend
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Backend name, used to prefix errors
    fn name(&self) -> &'static str;

    /// Whether `event` should go to this backend given `targets`
    fn accepts(&self, targets: &NotifyTargets, event: &NotificationEvent) -> bool;

    /// Deliver `event`
    async fn send(
        &self,
        targets: &NotifyTargets,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError>;
}

/// Sends events to every backend that accepts them
#[derive(Clone)]
pub struct NotificationManager {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotificationManager {
    /// Manager over an explicit backend list
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Manager with the Pushgateway and ntfy backends
    pub fn with_default_backends() -> Result<Self, NotifyError> {
        let client = crate::http_client()?;
        Ok(Self::new(vec![
            Arc::new(PushgatewayNotifier::new(client.clone())),
            Arc::new(NtfyNotifier::new(client)),
        ]))
    }

    /// Manager that sends nothing
    pub fn disabled() -> Self {
        Self::new(Vec::new())
    }

    /// Send `event` to all accepting backends
    ///
    /// Every backend is tried; failures are collected as
    /// `"<backend>: <error>"` and returned together.
    pub async fn notify(
        &self,
        targets: &NotifyTargets,
        event: &NotificationEvent,
    ) -> Result<(), NotifyError> {
        let mut errors = Vec::new();
        for notifier in &self.notifiers {
            if !notifier.accepts(targets, event) {
                continue;
            }
            match notifier.send(targets, event).await {
                Ok(()) => debug!(
                    backend = notifier.name(),
                    resource = %event.resource,
                    namespace = %event.namespace,
                    "Notification sent"
                ),
                Err(e) => {
                    warn!(backend = notifier.name(), error = %e, "Failed to send notification");
                    errors.push(format!("{}: {}", notifier.name(), e));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NotifyError::Aggregate(errors))
        }
    }
}
