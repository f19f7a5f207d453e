//! Outbound event routing and the delayed-send scheduler.
//!
//! Sessions call [`SendHook::on_send`] synchronously in the middle of a step.
//! The router classifies the event, registers a pending entry and spawns a
//! task that waits out the delay and then performs the delivery. Every
//! pending entry carries a cancellation token that is a child of its
//! instance's token, so deleting an instance cancels everything it scheduled.
//!
//! A pending entry is removed exactly once: either by `cancel`, by instance
//! deletion, or by the firing task. Only the party that removes it acts.

use crate::broadcast::{Notification, SubscriptionManager};
use crate::config::RoutingConfig;
use crate::error::ServiceError;
use crate::metrics::Metrics;
use async_trait::async_trait;
use chartd_core::{Event, SendHook, SendOptions};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio_util::sync::CancellationToken;

/// Processor type reserved for publishing to an instance's own subscribers.
pub const PUBLISH_PROCESSOR: &str = "http://scxml.io/scxmld";

/// Target that selects publishing under [`PUBLISH_PROCESSOR`].
pub const PUBLISH_TARGET: &str = "scxml://publish";

/// Processor types delivered as JSON envelopes over HTTP or in-process.
const ROUTABLE_PROCESSORS: &[&str] = &[
    "",
    "http://www.w3.org/TR/scxml/#SCXMLEventProcessor",
    "scxml",
    "http://www.w3.org/TR/scxml/#BasicHTTPEventProcessor",
    "basichttp",
];

/// Where an outbound event goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Back to the sending instance.
    Loopback,
    /// POSTed to an explicit target URL.
    Remote(String),
    /// Fanned out to the sending instance's subscribers.
    Publish,
    /// Not something the router knows how to deliver.
    Unsupported,
}

impl Route {
    pub fn classify(event: &Event) -> Self {
        let processor = event.event_type.as_deref().unwrap_or("");

        if processor == PUBLISH_PROCESSOR {
            return match event.target.as_deref() {
                Some(PUBLISH_TARGET) => Route::Publish,
                _ => Route::Unsupported,
            };
        }

        if !ROUTABLE_PROCESSORS.contains(&processor) {
            return Route::Unsupported;
        }

        match event.target.as_deref() {
            None | Some("") => Route::Loopback,
            Some(target) => Route::Remote(target.to_string()),
        }
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Route::Loopback => "loopback",
            Route::Remote(_) => "remote",
            Route::Publish => "publish",
            Route::Unsupported => "unsupported",
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// A pending send was found and will not fire.
    Canceled,
    /// Nothing was pending under that send-id.
    Miss,
}

impl CancelOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelOutcome::Canceled => "canceled",
            CancelOutcome::Miss => "miss",
        }
    }
}

/// Outbound HTTP delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POSTs the envelope as JSON to `url`.
    async fn post(&self, url: &str, event: &Event) -> Result<(), ServiceError>;
}

/// [`Transport`] over `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &str, event: &Event) -> Result<(), ServiceError> {
        let response = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Transport(format!(
                "POST {} returned {}",
                url, status
            )));
        }
        Ok(())
    }
}

/// In-process delivery of loopback events.
pub trait LocalDelivery: Send + Sync {
    fn deliver_local(&self, instance_id: &str, event: Event) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SendKey {
    Named(String),
    Anonymous(u64),
}

type PendingKey = (String, SendKey);

struct PendingSend {
    seq: u64,
    token: CancellationToken,
}

/// What a fired send does.
#[derive(Debug)]
enum Delivery {
    Post { url: String, route: &'static str },
    Local { instance_id: String },
    Publish { instance_id: String },
}

/// Routes outbound events and owns every pending delayed send.
pub struct EventRouter {
    config: RoutingConfig,
    transport: Arc<dyn Transport>,
    local: OnceLock<Weak<dyn LocalDelivery>>,
    subscriptions: Arc<SubscriptionManager>,
    metrics: Arc<Metrics>,
    root: CancellationToken,
    instance_tokens: DashMap<String, CancellationToken>,
    pending: DashMap<PendingKey, PendingSend>,
    next_seq: AtomicU64,
}

impl EventRouter {
    pub fn new(
        config: RoutingConfig,
        transport: Arc<dyn Transport>,
        subscriptions: Arc<SubscriptionManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            transport,
            local: OnceLock::new(),
            subscriptions,
            metrics,
            root: CancellationToken::new(),
            instance_tokens: DashMap::new(),
            pending: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Sets the target for in-process loopback delivery. Only the first call
    /// takes effect.
    pub fn attach_local(&self, local: Weak<dyn LocalDelivery>) {
        if self.local.set(local).is_err() {
            tracing::warn!("local delivery already attached");
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Starts tracking sends for an instance.
    pub fn register_instance(&self, instance_id: &str) {
        self.instance_tokens
            .insert(instance_id.to_string(), self.root.child_token());
    }

    /// Cancels everything an instance has pending. Returns the number of
    /// pending sends dropped.
    pub fn drop_instance(&self, instance_id: &str) -> usize {
        if let Some((_, token)) = self.instance_tokens.remove(instance_id) {
            token.cancel();
        }

        let mut dropped = 0;
        self.pending.retain(|(owner, _), pending| {
            if owner == instance_id {
                pending.token.cancel();
                dropped += 1;
                false
            } else {
                true
            }
        });

        if dropped > 0 {
            self.metrics.sends_pending.sub(dropped as f64);
            self.metrics.sends_canceled_total.inc_by(dropped as f64);
            tracing::debug!("dropped {} pending send(s) of {}", dropped, instance_id);
        }
        dropped
    }

    /// Number of sends waiting to fire, across all instances.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if `sendid` is pending for the instance.
    pub fn is_pending(&self, instance_id: &str, sendid: &str) -> bool {
        self.pending.contains_key(&(
            instance_id.to_string(),
            SendKey::Named(sendid.to_string()),
        ))
    }

    /// Classifies and schedules an outbound event from `instance_id`.
    pub fn send(self: &Arc<Self>, instance_id: &str, event: Event, options: SendOptions) {
        let route = Route::classify(&event);
        let label = route.label();
        self.metrics.sends_total.with_label_values(&[label]).inc();

        let delivery = match route {
            Route::Unsupported => {
                tracing::warn!(
                    "unsupported send '{}' from {} (type={:?}, target={:?})",
                    event.name,
                    instance_id,
                    event.event_type,
                    event.target
                );
                self.record_failure("unsupported");
                return;
            }
            Route::Loopback | Route::Remote(_) if !self.config.enabled => {
                tracing::warn!(
                    "routing disabled, dropping {} send '{}' from {}",
                    label,
                    event.name,
                    instance_id
                );
                self.record_failure(label);
                return;
            }
            Route::Loopback => {
                let origin = event.origin.as_deref().unwrap_or(instance_id);
                match &self.config.self_endpoint {
                    Some(base) => Delivery::Post {
                        url: format!("{}/{}", base.trim_end_matches('/'), origin),
                        route: "loopback",
                    },
                    None => Delivery::Local {
                        instance_id: origin.to_string(),
                    },
                }
            }
            Route::Remote(url) => Delivery::Post {
                url,
                route: "remote",
            },
            Route::Publish => Delivery::Publish {
                instance_id: instance_id.to_string(),
            },
        };

        // Instances that are gone (or never registered) cannot schedule.
        let Some(token) = self.instance_tokens.get(instance_id).map(|t| t.child_token()) else {
            tracing::warn!(
                "dropping {} send '{}' from unknown instance {}",
                label,
                event.name,
                instance_id
            );
            self.record_failure(label);
            return;
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let send_key = match options.sendid {
            Some(ref sendid) => SendKey::Named(sendid.clone()),
            None => SendKey::Anonymous(seq),
        };
        let key = (instance_id.to_string(), send_key);

        let previous = self.pending.insert(
            key.clone(),
            PendingSend {
                seq,
                token: token.clone(),
            },
        );
        match previous {
            Some(previous) => {
                previous.token.cancel();
                self.metrics.sends_canceled_total.inc();
                tracing::debug!(
                    "send {:?} of {} replaced an earlier pending send",
                    options.sendid,
                    instance_id
                );
            }
            None => self.metrics.sends_pending.inc(),
        }

        tracing::debug!(
            "scheduled {} send '{}' from {} in {:?}",
            label,
            event.name,
            instance_id,
            options.delay
        );

        let router = Arc::clone(self);
        let delay = options.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    router.take_pending(&key, seq);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if !router.take_pending(&key, seq) || token.is_cancelled() {
                return;
            }
            router.deliver(delivery, event).await;
        });
    }

    /// Cancels a pending send of `instance_id`.
    pub fn cancel(&self, instance_id: &str, sendid: &str) -> CancelOutcome {
        let key = (instance_id.to_string(), SendKey::Named(sendid.to_string()));
        match self.pending.remove(&key) {
            Some((_, pending)) => {
                pending.token.cancel();
                self.metrics.sends_pending.dec();
                self.metrics.sends_canceled_total.inc();
                tracing::debug!("canceled send '{}' of {}", sendid, instance_id);
                CancelOutcome::Canceled
            }
            None => {
                self.metrics.cancel_misses_total.inc();
                tracing::debug!("cancel of '{}' by {} matched nothing", sendid, instance_id);
                CancelOutcome::Miss
            }
        }
    }

    /// Cancels every pending send and stops tracking all instances.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.instance_tokens.clear();
        let dropped = self.pending.len();
        self.pending.clear();
        self.metrics.sends_pending.sub(dropped as f64);
    }

    /// Removes the entry if it still belongs to the send with `seq`.
    fn take_pending(&self, key: &PendingKey, seq: u64) -> bool {
        let taken = self.pending.remove_if(key, |_, p| p.seq == seq).is_some();
        if taken {
            self.metrics.sends_pending.dec();
        }
        taken
    }

    async fn deliver(&self, delivery: Delivery, event: Event) {
        match delivery {
            Delivery::Post { url, route } => {
                if let Err(e) = self.transport.post(&url, &event).await {
                    tracing::warn!("{} send '{}' to {} failed: {}", route, event.name, url, e);
                    self.record_failure(route);
                }
            }
            Delivery::Local { instance_id } => {
                let Some(local) = self.local.get().and_then(|w| w.upgrade()) else {
                    tracing::warn!("no local delivery for loopback send to {}", instance_id);
                    self.record_failure("loopback");
                    return;
                };
                if let Err(e) = local.deliver_local(&instance_id, event) {
                    tracing::warn!("loopback delivery to {} failed: {}", instance_id, e);
                    self.record_failure("loopback");
                }
            }
            Delivery::Publish { instance_id } => {
                let notification = Notification::Published {
                    name: event.name,
                    data: event.data,
                };
                self.subscriptions.notify(&instance_id, notification);
            }
        }
    }

    fn record_failure(&self, route: &str) {
        self.metrics
            .send_failures_total
            .with_label_values(&[route])
            .inc();
    }
}

/// The [`SendHook`] handed to one instance's session.
pub struct InstanceHook {
    instance_id: String,
    router: Arc<EventRouter>,
}

impl InstanceHook {
    pub fn new(instance_id: impl Into<String>, router: Arc<EventRouter>) -> Self {
        Self {
            instance_id: instance_id.into(),
            router,
        }
    }
}

impl SendHook for InstanceHook {
    fn on_send(&self, event: Event, options: SendOptions) {
        self.router.send(&self.instance_id, event, options);
    }

    fn on_cancel(&self, sendid: &str) {
        self.router.cancel(&self.instance_id, sendid);
    }
}
