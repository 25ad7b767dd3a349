//! Shared reconcile context

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::events::EventType;
use kube::{Client, Resource};
use tracing::warn;

use restic_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use restic_common::leader_election::Leadership;
use restic_common::{ResourceRegistry, OPERATOR_NAME};
use restic_executor::{Executor, ProcessExecutor};
use restic_notify::{NotificationEvent, NotificationManager, NotifyTargets};

use crate::client::{KubeClient, KubeClientImpl};

/// Lock age at which a repository lock is considered abandoned
pub const DEFAULT_STALE_LOCK_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Deadline for one reconcile
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Controller context shared by the four reconcilers
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .registry(registry)
///     .stale_lock_threshold(threshold)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Runs restic against repositories
    pub executor: Arc<dyn Executor>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// Backup and restore notification fan-out
    pub notifications: Arc<NotificationManager>,
    /// Managed kinds with their finalizers, job prefixes and labels
    pub registry: Arc<ResourceRegistry>,
    /// Whether this replica currently leads; unlocks only happen while held
    pub leadership: Leadership,
    /// Minimum lock age before a lock is removed
    pub stale_lock_threshold: Duration,
    /// Deadline applied to each reconcile by the controller runner
    pub reconcile_timeout: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Publish an Event on `obj`
    pub async fn publish<K>(
        &self,
        obj: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let reference = obj.object_ref(&());
        self.events
            .publish(&reference, type_, reason, action, note)
            .await;
    }

    /// Send a notification about `obj`
    ///
    /// Delivery failures never fail the reconcile; they are logged and
    /// surfaced as a Warning event.
    pub async fn notify<K>(&self, obj: &K, targets: &NotifyTargets, event: &NotificationEvent)
    where
        K: Resource<DynamicType = ()>,
    {
        if targets.is_empty() {
            return;
        }
        if let Err(e) = self.notifications.notify(targets, event).await {
            warn!(error = %e, "notification delivery failed");
            self.publish(
                obj,
                EventType::Warning,
                reasons::NOTIFICATION_FAILED,
                actions::NOTIFY,
                Some(e.to_string()),
            )
            .await;
        }
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, executor: Arc<dyn Executor>) -> Self {
        Self {
            kube,
            executor,
            events: Arc::new(restic_common::events::NoopEventPublisher),
            notifications: Arc::new(NotificationManager::disabled()),
            registry: Arc::new(ResourceRegistry::new()),
            leadership: Leadership::always(),
            stale_lock_threshold: DEFAULT_STALE_LOCK_THRESHOLD,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    executor: Option<Arc<dyn Executor>>,
    events: Option<Arc<dyn EventPublisher>>,
    notifications: Option<Arc<NotificationManager>>,
    registry: Option<Arc<ResourceRegistry>>,
    leadership: Leadership,
    stale_lock_threshold: Duration,
    reconcile_timeout: Duration,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            executor: None,
            events: None,
            notifications: None,
            registry: None,
            leadership: Leadership::always(),
            stale_lock_threshold: DEFAULT_STALE_LOCK_THRESHOLD,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Set the restic executor
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Override the Event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the notification manager
    pub fn notifications(mut self, notifications: Arc<NotificationManager>) -> Self {
        self.notifications = Some(notifications);
        self
    }

    /// Set the shared resource registry
    pub fn registry(mut self, registry: Arc<ResourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Follow a leader election flag instead of always leading
    pub fn leadership(mut self, leadership: Leadership) -> Self {
        self.leadership = leadership;
        self
    }

    /// Set the stale lock threshold
    pub fn stale_lock_threshold(mut self, threshold: Duration) -> Self {
        self.stale_lock_threshold = threshold;
        self
    }

    /// Set the per-reconcile deadline
    pub fn reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            executor: self
                .executor
                .unwrap_or_else(|| Arc::new(ProcessExecutor::default())),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(self.client.clone(), OPERATOR_NAME))
            }),
            notifications: self
                .notifications
                .unwrap_or_else(|| Arc::new(NotificationManager::disabled())),
            registry: self.registry.unwrap_or_default(),
            leadership: self.leadership,
            stale_lock_threshold: self.stale_lock_threshold,
            reconcile_timeout: self.reconcile_timeout,
        }
    }
}
