//! Live sessions bound to named definitions.
//!
//! Each instance owns one interpreter session behind a mutex; `start`,
//! `deliver` and `snapshot` serialize on it, so an instance processes one
//! event at a time while different instances proceed independently.

use crate::broadcast::{BroadcastListener, SubscriptionManager};
use crate::error::ServiceError;
use crate::metrics::Metrics;
use crate::models::ModelRegistry;
use crate::router::{EventRouter, InstanceHook, LocalDelivery};
use chartd_core::{Configuration, Event, Model, Session, SessionOptions, TransitionListener};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// One running session.
pub struct Instance {
    id: String,
    definition: String,
    model: Arc<dyn Model>,
    session: Mutex<Box<dyn Session>>,
    listener: Arc<dyn TransitionListener>,
}

impl Instance {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// The model this instance was created from, even if the definition has
    /// since been replaced or deleted.
    pub fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    pub fn is_started(&self) -> bool {
        self.session.lock().is_started()
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Creates, drives and destroys instances.
pub struct InstanceRegistry {
    instances: DashMap<String, Arc<Instance>>,
    models: Arc<ModelRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<EventRouter>,
    metrics: Arc<Metrics>,
}

impl InstanceRegistry {
    pub fn new(
        models: Arc<ModelRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        router: Arc<EventRouter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            instances: DashMap::new(),
            models,
            subscriptions,
            router,
            metrics,
        }
    }

    /// Creates an unstarted instance of `definition` with id
    /// `<definition>/<requested_id or uuid>`.
    pub fn instantiate(
        &self,
        definition: &str,
        requested_id: Option<&str>,
    ) -> Result<String, ServiceError> {
        let model = self
            .models
            .get(definition)
            .ok_or_else(|| ServiceError::DefinitionNotFound(definition.to_string()))?;

        let local_id = match requested_id {
            Some(id) if id.is_empty() || id.starts_with('_') || id.contains('/') => {
                return Err(ServiceError::InvalidRequest(format!(
                    "invalid instance id '{}'",
                    id
                )))
            }
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let id = format!("{}/{}", definition, local_id);

        let vacant = match self.instances.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ServiceError::InstanceExists(id)),
            Entry::Vacant(vacant) => vacant,
        };

        let hook = Arc::new(InstanceHook::new(id.clone(), self.router.clone()));
        let mut session = model.clone().instantiate(SessionOptions {
            session_id: id.clone(),
            hook,
        });

        // Registered before any notification can be emitted.
        let listener: Arc<dyn TransitionListener> =
            Arc::new(BroadcastListener::new(id.clone(), self.subscriptions.clone()));
        session.add_listener(listener.clone());
        self.subscriptions.register(&id);
        self.router.register_instance(&id);

        vacant.insert(Arc::new(Instance {
            id: id.clone(),
            definition: definition.to_string(),
            model,
            session: Mutex::new(session),
            listener,
        }));
        self.metrics.instances_total.inc();

        tracing::info!("instance {} created", id);
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Instance>, ServiceError> {
        self.instances
            .get(id)
            .map(|i| i.value().clone())
            .ok_or_else(|| ServiceError::InstanceNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Runs the initial transition.
    pub fn start(&self, id: &str) -> Result<Configuration, ServiceError> {
        let instance = self.get(id)?;
        let mut session = instance.session.lock();
        self.ensure_current(id, &instance)?;
        let configuration = session.start()?;
        tracing::debug!("instance {} started in {:?}", id, configuration.states());
        Ok(configuration)
    }

    pub fn snapshot(&self, id: &str) -> Result<Configuration, ServiceError> {
        let instance = self.get(id)?;
        let session = instance.session.lock();
        Ok(session.snapshot())
    }

    /// Feeds one event and returns the resulting configuration.
    ///
    /// `system.start` is treated as [`start`](Self::start). Any other event
    /// sent before the instance is started is rejected.
    pub fn deliver(&self, id: &str, event: &Event) -> Result<Configuration, ServiceError> {
        if event.is_start() {
            return self.start(id);
        }

        let instance = self.get(id)?;
        let mut session = instance.session.lock();
        self.ensure_current(id, &instance)?;
        if !session.is_started() {
            return Err(ServiceError::InvalidState(format!(
                "instance '{}' has not been started",
                id
            )));
        }

        tracing::debug!("instance {} <- '{}'", id, event.name);
        Ok(session.feed(event)?)
    }

    /// Fails if `instance` was destroyed (or replaced) while the caller
    /// waited for its session.
    fn ensure_current(&self, id: &str, instance: &Arc<Instance>) -> Result<(), ServiceError> {
        match self.instances.get(id) {
            Some(current) if Arc::ptr_eq(current.value(), instance) => Ok(()),
            _ => Err(ServiceError::InstanceNotFound(id.to_string())),
        }
    }

    /// Removes an instance, cancelling its pending sends and closing its
    /// subscribers.
    ///
    /// Waits for any in-flight step, so nothing can schedule a send for the
    /// instance afterwards. The map entry goes last; until then a concurrent
    /// create of the same id fails with `InstanceExists`.
    pub fn destroy(&self, id: &str) -> Result<(), ServiceError> {
        let instance = self.get(id)?;
        let mut session = instance.session.lock();
        self.ensure_current(id, &instance)?;

        self.router.drop_instance(id);
        session.remove_listener(&instance.listener);
        self.subscriptions.remove_instance(id);
        self.instances
            .remove_if(id, |_, current| Arc::ptr_eq(current, &instance));
        drop(session);

        self.metrics.instances_total.dec();
        tracing::info!("instance {} deleted", id);
        Ok(())
    }

    /// Live instance ids, optionally restricted to one definition, sorted.
    pub fn list(&self, definition: Option<&str>) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .iter()
            .filter(|i| definition.map_or(true, |d| i.definition == d))
            .map(|i| i.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Destroys every instance.
    pub fn clear(&self) {
        let ids: Vec<String> = self.instances.iter().map(|i| i.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.destroy(&id) {
                tracing::debug!("skipping {} during clear: {}", id, e);
            }
        }
    }
}

impl LocalDelivery for InstanceRegistry {
    fn deliver_local(&self, instance_id: &str, event: Event) -> Result<(), ServiceError> {
        self.deliver(instance_id, &event).map(|_| ())
    }
}
