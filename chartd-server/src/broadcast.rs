//! Transition notifications and per-instance subscriber fan-out.

use crate::metrics::Metrics;
use chartd_core::TransitionListener;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A record streamed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Notification {
    #[serde(rename = "stateEntered")]
    StateEntered {
        #[serde(rename = "stateId")]
        state_id: String,
    },
    #[serde(rename = "stateExited")]
    StateExited {
        #[serde(rename = "stateId")]
        state_id: String,
    },
    #[serde(rename = "published")]
    Published { name: String, data: Value },
}

impl Notification {
    pub fn entered(state_id: impl Into<String>) -> Self {
        Notification::StateEntered {
            state_id: state_id.into(),
        }
    }

    pub fn exited(state_id: impl Into<String>) -> Self {
        Notification::StateExited {
            state_id: state_id.into(),
        }
    }

    /// The `kind` tag, also used as the SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::StateEntered { .. } => "stateEntered",
            Notification::StateExited { .. } => "stateExited",
            Notification::Published { .. } => "published",
        }
    }
}

/// Receiving half handed to an observer.
pub type NotificationReceiver = mpsc::UnboundedReceiver<Notification>;

struct Subscriber {
    id: String,
    sender: mpsc::UnboundedSender<Notification>,
}

/// Per-instance subscriber sets.
///
/// An instance must be registered before it can be subscribed to; removing
/// the instance drops every sender, which closes the observers' streams.
pub struct SubscriptionManager {
    instances: DashMap<String, Vec<Subscriber>>,
    metrics: Arc<Metrics>,
}

impl SubscriptionManager {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            instances: DashMap::new(),
            metrics,
        }
    }

    /// Makes an instance subscribable.
    pub fn register(&self, instance_id: &str) {
        self.instances.entry(instance_id.to_string()).or_default();
    }

    /// Forgets an instance and closes all of its subscribers.
    pub fn remove_instance(&self, instance_id: &str) -> usize {
        match self.instances.remove(instance_id) {
            Some((_, subscribers)) => {
                self.metrics.subscribers_active.sub(subscribers.len() as f64);
                subscribers.len()
            }
            None => 0,
        }
    }

    /// Adds a subscriber. Returns `None` if the instance is not registered.
    pub fn subscribe(&self, instance_id: &str) -> Option<(String, NotificationReceiver)> {
        let mut subscribers = self.instances.get_mut(instance_id)?;
        let subscription_id = format!("sub-{}", uuid::Uuid::new_v4());
        let (sender, receiver) = mpsc::unbounded_channel();
        subscribers.push(Subscriber {
            id: subscription_id.clone(),
            sender,
        });
        self.metrics.subscribers_active.inc();
        tracing::debug!("{} subscribed to {}", subscription_id, instance_id);
        Some((subscription_id, receiver))
    }

    /// Removes one subscriber, closing its stream.
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&self, instance_id: &str, subscription_id: &str) -> bool {
        let Some(mut subscribers) = self.instances.get_mut(instance_id) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscription_id);
        let removed = before != subscribers.len();
        if removed {
            self.metrics.subscribers_active.dec();
            tracing::debug!("{} unsubscribed from {}", subscription_id, instance_id);
        }
        removed
    }

    /// Closes every subscriber of an instance, keeping it registered.
    pub fn unsubscribe_all(&self, instance_id: &str) -> usize {
        let Some(mut subscribers) = self.instances.get_mut(instance_id) else {
            return 0;
        };
        let removed = subscribers.len();
        subscribers.clear();
        self.metrics.subscribers_active.sub(removed as f64);
        removed
    }

    /// Forwards a notification to every subscriber of an instance, in
    /// registration order. Subscribers whose receiver is gone are dropped.
    pub fn notify(&self, instance_id: &str, notification: Notification) -> usize {
        let Some(mut subscribers) = self.instances.get_mut(instance_id) else {
            return 0;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.sender.send(notification.clone()).is_ok());
        let delivered = subscribers.len();

        let closed = before - delivered;
        if closed > 0 {
            tracing::debug!("dropped {} closed subscriber(s) of {}", closed, instance_id);
            self.metrics.subscribers_active.sub(closed as f64);
        }
        self.metrics
            .notifications_forwarded_total
            .with_label_values(&[notification.kind()])
            .inc_by(delivered as f64);
        delivered
    }

    pub fn subscriber_count(&self, instance_id: &str) -> usize {
        self.instances
            .get(instance_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn is_registered(&self, instance_id: &str) -> bool {
        self.instances.contains_key(instance_id)
    }

    /// Closes everything.
    pub fn clear(&self) {
        self.instances.clear();
        self.metrics.subscribers_active.set(0.0);
    }
}

/// Bridges a session's transition callbacks into its subscribers.
pub struct BroadcastListener {
    instance_id: String,
    subscriptions: Arc<SubscriptionManager>,
}

impl BroadcastListener {
    pub fn new(instance_id: impl Into<String>, subscriptions: Arc<SubscriptionManager>) -> Self {
        Self {
            instance_id: instance_id.into(),
            subscriptions,
        }
    }
}

impl TransitionListener for BroadcastListener {
    fn on_entry(&self, state_id: &str) {
        self.subscriptions
            .notify(&self.instance_id, Notification::entered(state_id));
    }

    fn on_exit(&self, state_id: &str) {
        self.subscriptions
            .notify(&self.instance_id, Notification::exited(state_id));
    }
}
