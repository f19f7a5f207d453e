//! The service façade: one object owning every registry.

use crate::broadcast::{NotificationReceiver, SubscriptionManager};
use crate::config::{BackendKind, Config, RoutingConfig};
use crate::error::ServiceError;
use crate::instances::InstanceRegistry;
use crate::metrics::Metrics;
use crate::models::{DefinitionInfo, ModelRegistry, ModelSource};
use crate::router::{CancelOutcome, EventRouter, HttpTransport, LocalDelivery, Transport};
use chartd_core::{Configuration, Event, FlatInterpreter, Interpreter};
use chartd_storage::{
    Backend, HttpFetcher, LocalBackend, ObjectStoreBackend, StorageResolver, Workspace,
};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

/// Builds a [`Service`].
pub struct ServiceBuilder {
    interpreter: Arc<dyn Interpreter>,
    backend: Option<Arc<dyn Backend>>,
    transport: Arc<dyn Transport>,
    routing: RoutingConfig,
    workspace_dir: PathBuf,
    entry_document: String,
    metrics: Option<Arc<Metrics>>,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        Self {
            interpreter: Arc::new(FlatInterpreter::new()),
            backend: None,
            transport: Arc::new(HttpTransport::new()),
            routing: RoutingConfig::default(),
            workspace_dir: PathBuf::from("./tmp"),
            entry_document: "index.json".to_string(),
            metrics: None,
        }
    }
}

impl ServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded from configuration.
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let storage = &config.storage;
        let backend: Option<Arc<dyn Backend>> = match storage.backend {
            BackendKind::None => None,
            BackendKind::Local => {
                let local = LocalBackend::new(storage.local_root.clone());
                Some(Arc::new(local) as Arc<dyn Backend>)
            }
            BackendKind::ObjectStore => {
                let endpoint = storage.object_store.endpoint.as_deref().ok_or_else(|| {
                    ServiceError::InvalidRequest("object store endpoint not set".to_string())
                })?;
                let bucket = storage.object_store.bucket.clone().ok_or_else(|| {
                    ServiceError::InvalidRequest("object store bucket not set".to_string())
                })?;
                Some(Arc::new(ObjectStoreBackend::new(endpoint, bucket)?) as Arc<dyn Backend>)
            }
        };

        Ok(Self {
            backend,
            routing: config.routing.clone(),
            workspace_dir: storage.workspace_dir.clone(),
            entry_document: storage.entry_document.clone(),
            ..Self::default()
        })
    }

    pub fn with_interpreter(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_workspace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    pub fn with_entry_document(mut self, name: impl Into<String>) -> Self {
        self.entry_document = name.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wipes the workspace and wires the registries together.
    pub async fn build(self) -> Result<Service, ServiceError> {
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(
                Metrics::new().map_err(|e| ServiceError::Internal(e.to_string()))?,
            ),
        };

        let workspace = Workspace::new(self.workspace_dir);
        workspace.prepare().await?;

        let resolver = StorageResolver::new(self.backend, HttpFetcher::new());
        tracing::debug!("storage backend: {}", resolver.backend_kind());

        let models = Arc::new(ModelRegistry::new(
            self.interpreter,
            resolver,
            workspace,
            self.entry_document,
            metrics.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(metrics.clone()));
        let router = Arc::new(EventRouter::new(
            self.routing,
            self.transport,
            subscriptions.clone(),
            metrics.clone(),
        ));
        let instances = Arc::new(InstanceRegistry::new(
            models.clone(),
            subscriptions.clone(),
            router.clone(),
            metrics.clone(),
        ));
        let local = Arc::downgrade(&instances) as Weak<dyn LocalDelivery>;
        router.attach_local(local);

        Ok(Service {
            models,
            instances,
            subscriptions,
            router,
            metrics,
        })
    }
}

/// The flat call surface over definitions, instances, subscriptions and sends.
pub struct Service {
    models: Arc<ModelRegistry>,
    instances: Arc<InstanceRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<EventRouter>,
    metrics: Arc<Metrics>,
}

impl Service {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// Builds a service from configuration.
    pub async fn from_config(config: &Config) -> Result<Self, ServiceError> {
        ServiceBuilder::from_config(config)?.build().await
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn create_definition(
        &self,
        name: &str,
        source: ModelSource,
    ) -> Result<DefinitionInfo, ServiceError> {
        self.models.create(name, source).await
    }

    pub async fn delete_definition(&self, name: &str) -> Result<(), ServiceError> {
        if self.models.delete(name).await {
            Ok(())
        } else {
            Err(ServiceError::DefinitionNotFound(name.to_string()))
        }
    }

    pub fn get_definition(&self, name: &str) -> Result<DefinitionInfo, ServiceError> {
        self.models
            .info(name)
            .ok_or_else(|| ServiceError::DefinitionNotFound(name.to_string()))
    }

    pub fn list_definitions(&self) -> Vec<String> {
        self.models.list()
    }

    pub fn create_instance(
        &self,
        definition: &str,
        requested_id: Option<&str>,
    ) -> Result<String, ServiceError> {
        self.instances.instantiate(definition, requested_id)
    }

    pub fn start_instance(&self, id: &str) -> Result<Configuration, ServiceError> {
        self.instances.start(id)
    }

    pub fn get_snapshot(&self, id: &str) -> Result<Configuration, ServiceError> {
        self.instances.snapshot(id)
    }

    /// Delivers one event and returns once the step has completed.
    pub fn send_event(&self, id: &str, event: &Event) -> Result<Configuration, ServiceError> {
        self.instances.deliver(id, event)
    }

    pub fn subscribe(&self, id: &str) -> Result<(String, NotificationReceiver), ServiceError> {
        self.subscriptions
            .subscribe(id)
            .ok_or_else(|| ServiceError::InstanceNotFound(id.to_string()))
    }

    /// Removes one subscriber. Unknown handles are a no-op.
    pub fn unsubscribe(&self, id: &str, handle: &str) -> bool {
        self.subscriptions.unsubscribe(id, handle)
    }

    pub fn delete_instance(&self, id: &str) -> Result<(), ServiceError> {
        self.instances.destroy(id)
    }

    pub fn list_instances(&self, definition: Option<&str>) -> Vec<String> {
        self.instances.list(definition)
    }

    pub fn cancel_send(&self, id: &str, sendid: &str) -> Result<CancelOutcome, ServiceError> {
        if !self.instances.contains(id) {
            return Err(ServiceError::InstanceNotFound(id.to_string()));
        }
        Ok(self.router.cancel(id, sendid))
    }

    /// Cancels all pending sends and drops every instance and definition.
    pub fn shutdown(&self) {
        self.router.shutdown();
        self.instances.clear();
        self.subscriptions.clear();
        self.models.clear();
        tracing::info!("service shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Notification;
    use crate::models::tests::{tar_of, TRAFFIC_LIGHT};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chartd_storage::MemoryBackend;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingTransport {
        posts: Mutex<Vec<(String, Event)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn post(&self, url: &str, event: &Event) -> Result<(), ServiceError> {
            self.posts.lock().push((url.to_string(), event.clone()));
            Ok(())
        }
    }

    const PINGER: &str = r#"{
        "states": ["idle", "waiting", "done"],
        "initial": "idle",
        "transitions": [
            {"from": "idle", "event": "go", "to": "waiting",
             "actions": [
                {"send": {"event": "ping", "delay": 100, "sendid": "s1"}},
                {"send": {"event": "report", "type": "basichttp",
                          "target": "http://collector/api/v1/reports"}},
                {"send": {"event": "progress", "type": "http://scxml.io/scxmld",
                          "target": "scxml://publish", "data": {"pct": 50}}}
             ]},
            {"from": "waiting", "event": "ping", "to": "done"}
        ]
    }"#;

    async fn service(dir: &TempDir) -> (Service, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let service = Service::builder()
            .with_workspace_dir(dir.path().join("ws"))
            .with_transport(transport.clone())
            .build()
            .await
            .unwrap();
        for (name, doc) in [("light", TRAFFIC_LIGHT), ("pinger", PINGER)] {
            service
                .create_definition(name, ModelSource::Document(Bytes::from(doc)))
                .await
                .unwrap();
        }
        (service, transport)
    }

    #[tokio::test]
    async fn test_create_start_snapshot() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;

        let id = service.create_instance("light", None).unwrap();
        let configuration = service.start_instance(&id).unwrap();
        assert!(!configuration.is_empty());
        assert_eq!(service.get_snapshot(&id).unwrap(), configuration);
        assert_eq!(service.list_definitions(), vec!["light", "pinger"]);
        assert_eq!(service.list_instances(None), vec![id]);
    }

    #[tokio::test]
    async fn test_traffic_light_scenario() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;

        let id = service.create_instance("light", Some("main")).unwrap();
        let (_, mut rx) = service.subscribe(&id).unwrap();

        let started = service.send_event(&id, &Event::new("system.start")).unwrap();
        assert_eq!(started.states(), ["red"]);
        assert_eq!(rx.recv().await.unwrap(), Notification::entered("red"));

        let next = service.send_event(&id, &Event::new("timer")).unwrap();
        assert_eq!(next.states(), ["green"]);
        assert_eq!(rx.recv().await.unwrap(), Notification::exited("red"));
        assert_eq!(rx.recv().await.unwrap(), Notification::entered("green"));
    }

    #[tokio::test]
    async fn test_unsubscribe_semantics() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;
        let id = service.create_instance("light", None).unwrap();

        let (h1, mut rx1) = service.subscribe(&id).unwrap();
        let (_, mut rx2) = service.subscribe(&id).unwrap();
        service.start_instance(&id).unwrap();

        assert_eq!(rx1.recv().await.unwrap(), Notification::entered("red"));
        assert_eq!(rx2.recv().await.unwrap(), Notification::entered("red"));

        assert!(service.unsubscribe(&id, &h1));
        assert!(!service.unsubscribe(&id, "sub-unknown"));
        service.send_event(&id, &Event::new("timer")).unwrap();

        assert!(rx1.recv().await.is_none());
        assert_eq!(rx2.recv().await.unwrap(), Notification::exited("red"));
    }

    #[tokio::test]
    async fn test_not_found_paths() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;

        assert!(service.subscribe("light/none").unwrap_err().is_not_found());
        assert!(service.get_snapshot("light/none").unwrap_err().is_not_found());
        assert!(service.delete_instance("light/none").unwrap_err().is_not_found());
        assert!(service.cancel_send("light/none", "s1").unwrap_err().is_not_found());
        assert!(service.delete_definition("nope").await.unwrap_err().is_not_found());
        assert!(service.get_definition("nope").unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_routes() {
        let dir = TempDir::new().unwrap();
        let (service, transport) = service(&dir).await;
        let id = service.create_instance("pinger", Some("p")).unwrap();
        let (_, mut rx) = service.subscribe(&id).unwrap();
        service.start_instance(&id).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Notification::entered("idle"));

        service.send_event(&id, &Event::new("go")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Notification::exited("idle"));
        assert_eq!(rx.recv().await.unwrap(), Notification::entered("waiting"));
        assert_eq!(rx.recv().await.unwrap().kind(), "published");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(service.get_snapshot(&id).unwrap().states(), ["done"]);

        let posts = transport.posts.lock();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].0, "http://collector/api/v1/reports");
        assert_eq!(posts[0].1.origin.as_deref(), Some("pinger/p"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_send_before_fire() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;
        let id = service.create_instance("pinger", None).unwrap();
        service.start_instance(&id).unwrap();
        service.send_event(&id, &Event::new("go")).unwrap();

        assert_eq!(service.cancel_send(&id, "s1").unwrap(), CancelOutcome::Canceled);
        assert_eq!(service.cancel_send(&id, "s1").unwrap(), CancelOutcome::Miss);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(service.get_snapshot(&id).unwrap().states(), ["waiting"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_instance_cancels_and_closes() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;
        let id = service.create_instance("pinger", None).unwrap();
        service.start_instance(&id).unwrap();
        service.send_event(&id, &Event::new("go")).unwrap();
        let (_, mut rx) = service.subscribe(&id).unwrap();

        service.delete_instance(&id).unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(service.router.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(service.list_instances(None).is_empty());
    }

    #[tokio::test]
    async fn test_archive_definition() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;

        let archive = tar_of(&[("index.json", TRAFFIC_LIGHT.as_bytes())]);
        service
            .create_definition("boxed", ModelSource::Archive(Bytes::from(archive)))
            .await
            .unwrap();
        let id = service.create_instance("boxed", None).unwrap();
        assert_eq!(service.start_instance(&id).unwrap().states(), ["red"]);
    }

    #[tokio::test]
    async fn test_store_definition() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.put("stored/index.json", TRAFFIC_LIGHT.as_bytes().to_vec());

        let service = Service::builder()
            .with_workspace_dir(dir.path().join("ws"))
            .with_backend(backend)
            .build()
            .await
            .unwrap();
        let info = service
            .create_definition("stored", ModelSource::Store)
            .await
            .unwrap();
        assert_eq!(info.name, "stored");
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let dir = TempDir::new().unwrap();
        let (service, _) = service(&dir).await;
        let id = service.create_instance("light", None).unwrap();
        let (_, mut rx) = service.subscribe(&id).unwrap();

        service.shutdown();
        assert!(rx.recv().await.is_none());
        assert!(service.list_instances(None).is_empty());
        assert!(service.list_definitions().is_empty());
    }

    #[test]
    fn test_from_config_rejects_bad_object_store() {
        let mut config = Config::default();
        config.storage.backend = BackendKind::ObjectStore;
        assert!(ServiceBuilder::from_config(&config).is_err());
    }

    proptest! {
        #[test]
        fn prop_instances_fed_same_events_agree(
            events in prop::collection::vec(prop::sample::select(vec!["timer", "bogus"]), 0..20)
        ) {
            tokio_test::block_on(async {
                let dir = TempDir::new().unwrap();
                let (service, _) = service(&dir).await;
                let a = service.create_instance("light", None).unwrap();
                let b = service.create_instance("light", None).unwrap();
                assert_eq!(
                    service.start_instance(&a).unwrap(),
                    service.start_instance(&b).unwrap()
                );
                for name in &events {
                    let event = Event::new(*name);
                    assert_eq!(
                        service.send_event(&a, &event).unwrap(),
                        service.send_event(&b, &event).unwrap()
                    );
                }
            });
        }
    }
}
