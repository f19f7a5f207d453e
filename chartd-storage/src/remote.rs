//! HTTP-reachable storage: arbitrary URLs and bucket-style object stores.

use crate::backend::{normalize_key, Backend};
use crate::error::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use url::Url;

/// Returns true if `reference` is an absolute `http`/`https` URL.
pub fn is_absolute_url(reference: &str) -> bool {
    match Url::parse(reference) {
        Ok(url) => matches!(url.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// Fetches absolute URLs over HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub async fn fetch(&self, url: &str) -> Result<Bytes, StorageError> {
        if !is_absolute_url(url) {
            return Err(StorageError::InvalidReference(url.to_string()));
        }

        let response = self.client.get(url).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                Err(StorageError::NotFound(url.to_string()))
            }
            status if status.is_success() => Ok(response.bytes().await?),
            status => Err(StorageError::Transport(format!(
                "GET {} returned {}",
                url, status
            ))),
        }
    }
}

/// A bucket on an object store reachable with plain `GET {endpoint}/{bucket}/{key}`.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    fetcher: HttpFetcher,
    endpoint: Url,
    bucket: String,
}

impl ObjectStoreBackend {
    pub fn new(endpoint: &str, bucket: impl Into<String>) -> Result<Self, StorageError> {
        let mut endpoint =
            Url::parse(endpoint).map_err(|e| StorageError::InvalidReference(e.to_string()))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        Ok(Self {
            fetcher: HttpFetcher::new(),
            endpoint,
            bucket: bucket.into(),
        })
    }

    pub fn with_fetcher(mut self, fetcher: HttpFetcher) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Builds the object URL for a key.
    pub fn object_url(&self, key: &str) -> Result<Url, StorageError> {
        let key = normalize_key(key)?.join("/");
        self.endpoint
            .join(&format!("{}/{}", self.bucket, key))
            .map_err(|e| StorageError::InvalidReference(e.to_string()))
    }
}

#[async_trait]
impl Backend for ObjectStoreBackend {
    fn kind(&self) -> &'static str {
        "object_store"
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let url = self.object_url(key)?;
        tracing::debug!("fetching object {}", url);
        self.fetcher.fetch(url.as_str()).await.map_err(|e| match e {
            StorageError::NotFound(_) => StorageError::NotFound(key.to_string()),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_absolute_url() {
        assert!(is_absolute_url("http://example.com/a.json"));
        assert!(is_absolute_url("https://example.com/a.json"));
        assert!(!is_absolute_url("fragments/a.json"));
        assert!(!is_absolute_url("/fragments/a.json"));
        assert!(!is_absolute_url("file:///etc/passwd"));
    }

    #[test]
    fn test_object_url() {
        let store = ObjectStoreBackend::new("http://minio:9000", "charts").unwrap();
        assert_eq!(
            store.object_url("light/index.json").unwrap().as_str(),
            "http://minio:9000/charts/light/index.json"
        );

        let store = ObjectStoreBackend::new("http://gateway/storage", "charts").unwrap();
        assert_eq!(
            store.object_url("light/./a.json").unwrap().as_str(),
            "http://gateway/storage/charts/light/a.json"
        );

        assert!(store.object_url("../other/a.json").is_err());
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(ObjectStoreBackend::new("not a url", "charts").is_err());
    }

    #[tokio::test]
    async fn test_fetcher_rejects_relative_reference() {
        let fetcher = HttpFetcher::new();
        let err = fetcher.fetch("fragments/a.json").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidReference(_)));
    }
}
