//! Named, compiled machine definitions.

use crate::error::ServiceError;
use crate::metrics::Metrics;
use bytes::Bytes;
use chartd_core::{Interpreter, Model, ResourceResolver};
use chartd_storage::{is_absolute_url, LocalBackend, StorageResolver, Workspace};
use dashmap::DashMap;
use std::sync::Arc;

/// Where a definition's entry document comes from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// The document itself.
    Document(Bytes),
    /// A tar or tar.gz archive holding the entry document and its resources.
    Archive(Bytes),
    /// The configured storage backend, under the definition's name.
    Store,
    /// An absolute URL.
    Url(String),
}

impl ModelSource {
    pub fn label(&self) -> &'static str {
        match self {
            ModelSource::Document(_) => "document",
            ModelSource::Archive(_) => "archive",
            ModelSource::Store => "store",
            ModelSource::Url(_) => "url",
        }
    }
}

/// Summary of a registered definition.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DefinitionInfo {
    pub name: String,
    pub checksum: String,
    pub states: Vec<String>,
}

impl DefinitionInfo {
    fn of(model: &dyn Model) -> Self {
        Self {
            name: model.name().to_string(),
            checksum: model.checksum().to_string(),
            states: model.state_ids(),
        }
    }
}

/// Validates a definition name: a single non-empty path segment that does
/// not start with `_`.
pub fn validate_name(name: &str) -> Result<(), ServiceError> {
    let valid = !name.is_empty()
        && !name.starts_with('_')
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', ':']);
    if valid {
        Ok(())
    } else {
        Err(ServiceError::InvalidRequest(format!(
            "invalid definition name '{}'",
            name
        )))
    }
}

/// Compiles documents and keeps the resulting models by name.
pub struct ModelRegistry {
    models: DashMap<String, Arc<dyn Model>>,
    interpreter: Arc<dyn Interpreter>,
    resolver: StorageResolver,
    workspace: Workspace,
    entry_document: String,
    metrics: Arc<Metrics>,
}

impl ModelRegistry {
    pub fn new(
        interpreter: Arc<dyn Interpreter>,
        resolver: StorageResolver,
        workspace: Workspace,
        entry_document: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            models: DashMap::new(),
            interpreter,
            resolver,
            workspace,
            entry_document: entry_document.into(),
            metrics,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Creates or replaces `name` from `source`.
    ///
    /// On failure any previous definition under `name` is left in place.
    pub async fn create(
        &self,
        name: &str,
        source: ModelSource,
    ) -> Result<DefinitionInfo, ServiceError> {
        validate_name(name)?;
        tracing::debug!("creating definition '{}' from {}", name, source.label());

        let from_archive = matches!(source, ModelSource::Archive(_));
        let model = match source {
            ModelSource::Document(bytes) => self.create_from_document(name, &bytes).await?,
            ModelSource::Archive(bytes) => self.create_from_archive(name, bytes).await?,
            ModelSource::Store => self.create_from_store(name).await?,
            ModelSource::Url(url) => self.create_from_url(name, &url).await?,
        };

        if !from_archive {
            // A previous archive-backed definition no longer needs its files.
            if let Err(e) = self.workspace.remove(name).await {
                tracing::warn!("failed to clean workspace for '{}': {}", name, e);
            }
        }

        let info = DefinitionInfo::of(model.as_ref());
        if self.models.insert(name.to_string(), model).is_none() {
            self.metrics.definitions_total.inc();
        }
        tracing::info!("definition '{}' registered ({} states)", name, info.states.len());
        Ok(info)
    }

    async fn compile(
        &self,
        name: &str,
        document: &[u8],
        resolver: &dyn ResourceResolver,
    ) -> Result<Arc<dyn Model>, ServiceError> {
        self.interpreter
            .compile(name, document, resolver)
            .await
            .map_err(|e| {
                tracing::debug!("compiling '{}' failed: {}", name, e);
                ServiceError::from(e)
            })
    }

    async fn create_from_document(
        &self,
        name: &str,
        document: &[u8],
    ) -> Result<Arc<dyn Model>, ServiceError> {
        let resolver = self.resolver.scoped(Some(name));
        self.compile(name, document, &resolver).await
    }

    async fn create_from_archive(
        &self,
        name: &str,
        archive: Bytes,
    ) -> Result<Arc<dyn Model>, ServiceError> {
        let dir = self.workspace.unpack(name, archive).await?;
        let resolver = self
            .resolver
            .with_backend(Arc::new(LocalBackend::new(dir.clone())))
            .scoped(None);

        let document = resolver.fetch(&self.entry_document).await.map_err(|_| {
            ServiceError::Extract(format!(
                "archive for '{}' has no '{}'",
                name, self.entry_document
            ))
        })?;
        self.compile(name, &document, &resolver).await
    }

    async fn create_from_store(&self, name: &str) -> Result<Arc<dyn Model>, ServiceError> {
        if !self.resolver.has_backend() {
            return Err(ServiceError::InvalidRequest(
                "no storage backend configured".to_string(),
            ));
        }
        let document = self
            .resolver
            .fetch(Some(name), &self.entry_document)
            .await?;
        let resolver = self.resolver.scoped(Some(name));
        self.compile(name, &document, &resolver).await
    }

    async fn create_from_url(&self, name: &str, url: &str) -> Result<Arc<dyn Model>, ServiceError> {
        if !is_absolute_url(url) {
            return Err(ServiceError::InvalidRequest(format!(
                "'{}' is not an http(s) URL",
                url
            )));
        }
        let document = self.resolver.fetch(None, url).await?;
        let resolver = self.resolver.scoped(Some(name));
        self.compile(name, &document, &resolver).await
    }

    /// Removes a definition. Instances created from it keep running.
    pub async fn delete(&self, name: &str) -> bool {
        let existed = self.models.remove(name).is_some();
        if existed {
            self.metrics.definitions_total.dec();
            if let Err(e) = self.workspace.remove(name).await {
                tracing::warn!("failed to clean workspace for '{}': {}", name, e);
            }
            tracing::info!("definition '{}' deleted", name);
        }
        existed
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Model>> {
        self.models.get(name).map(|m| m.value().clone())
    }

    pub fn info(&self, name: &str) -> Option<DefinitionInfo> {
        self.models.get(name).map(|m| DefinitionInfo::of(m.value().as_ref()))
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.iter().map(|m| m.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn clear(&self) {
        self.models.clear();
        self.metrics.definitions_total.set(0.0);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chartd_core::FlatInterpreter;
    use chartd_storage::{HttpFetcher, MemoryBackend};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    pub(crate) const TRAFFIC_LIGHT: &str = r#"{
        "states": ["red", "green", "yellow"],
        "initial": "red",
        "transitions": [
            {"from": "red", "event": "timer", "to": "green"},
            {"from": "green", "event": "timer", "to": "yellow"},
            {"from": "yellow", "event": "timer", "to": "red"}
        ]
    }"#;

    pub(crate) fn tar_of(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn registry(dir: &TempDir, backend: Option<Arc<MemoryBackend>>) -> ModelRegistry {
        let backend = backend.map(|b| b as Arc<dyn chartd_storage::Backend>);
        ModelRegistry::new(
            Arc::new(FlatInterpreter::new()),
            StorageResolver::new(backend, HttpFetcher::new()),
            Workspace::new(dir.path().join("ws")),
            "index.json",
            Arc::new(Metrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_create_from_document() {
        let dir = TempDir::new().unwrap();
        let models = registry(&dir, None);

        let info = models
            .create("light", ModelSource::Document(Bytes::from(TRAFFIC_LIGHT)))
            .await
            .unwrap();
        assert_eq!(info.name, "light");
        assert_eq!(info.states, vec!["red", "green", "yellow"]);
        assert!(models.get("light").is_some());
        assert_eq!(models.list(), vec!["light"]);
    }

    #[tokio::test]
    async fn test_failed_compile_keeps_previous() {
        let dir = TempDir::new().unwrap();
        let models = registry(&dir, None);
        models
            .create("light", ModelSource::Document(Bytes::from(TRAFFIC_LIGHT)))
            .await
            .unwrap();
        let before = models.get("light").unwrap();

        let err = models
            .create("light", ModelSource::Document(Bytes::from_static(b"{not json")))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "COMPILE_ERROR");

        let after = models.get("light").unwrap();
        assert_eq!(before.checksum(), after.checksum());
    }

    #[tokio::test]
    async fn test_replace_keeps_old_arc_alive() {
        let dir = TempDir::new().unwrap();
        let models = registry(&dir, None);
        models
            .create("light", ModelSource::Document(Bytes::from(TRAFFIC_LIGHT)))
            .await
            .unwrap();
        let old = models.get("light").unwrap();

        let replacement = r#"{"states": ["off"], "initial": "off", "transitions": []}"#;
        models
            .create("light", ModelSource::Document(Bytes::from(replacement)))
            .await
            .unwrap();

        assert_eq!(old.state_ids(), vec!["red", "green", "yellow"]);
        assert_eq!(models.get("light").unwrap().state_ids(), vec!["off"]);
        assert_eq!(models.len(), 1);
    }

    #[tokio::test]
    async fn test_create_from_archive_with_include() {
        let dir = TempDir::new().unwrap();
        let models = registry(&dir, None);

        let root = r#"{
            "states": ["red", "green"],
            "initial": "red",
            "transitions": [{"from": "red", "event": "timer", "to": "green"}],
            "include": ["fragments/yellow.json"]
        }"#;
        let fragment = r#"{
            "states": ["yellow"],
            "transitions": [{"from": "green", "event": "timer", "to": "yellow"}]
        }"#;
        let archive = tar_of(&[
            ("index.json", root.as_bytes()),
            ("fragments/yellow.json", fragment.as_bytes()),
        ]);
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&archive).unwrap();
        let archive = gz.finish().unwrap();

        let info = models
            .create("light", ModelSource::Archive(Bytes::from(archive)))
            .await
            .unwrap();
        assert!(info.states.contains(&"yellow".to_string()));
        assert!(dir.path().join("ws/light/index.json").exists());

        assert!(models.delete("light").await);
        assert!(!dir.path().join("ws/light").exists());
    }

    #[tokio::test]
    async fn test_archive_without_entry_document() {
        let dir = TempDir::new().unwrap();
        let models = registry(&dir, None);

        let archive = tar_of(&[("other.json", b"{}")]);
        let err = models
            .create("light", ModelSource::Archive(Bytes::from(archive)))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "EXTRACT_ERROR");
        assert!(models.get("light").is_none());
    }

    #[tokio::test]
    async fn test_create_from_store() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        backend.put("light/index.json", TRAFFIC_LIGHT.as_bytes().to_vec());
        let models = registry(&dir, Some(backend));

        models.create("light", ModelSource::Store).await.unwrap();
        assert!(models.get("light").is_some());

        let err = models.create("other", ModelSource::Store).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_from_store_without_backend() {
        let dir = TempDir::new().unwrap();
        let models = registry(&dir, None);

        let err = models.create("light", ModelSource::Store).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_create_from_relative_url_rejected() {
        let dir = TempDir::new().unwrap();
        let models = registry(&dir, None);

        let err = models
            .create("light", ModelSource::Url("index.json".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let models = registry(&dir, None);
        models
            .create("light", ModelSource::Document(Bytes::from(TRAFFIC_LIGHT)))
            .await
            .unwrap();

        assert!(models.delete("light").await);
        assert!(!models.delete("light").await);
        assert!(models.is_empty());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("light").is_ok());
        assert!(validate_name("traffic-light.v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("_all_instances").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("..").is_err());
    }
}
