//! HTTP adapters
//!
//! REST clients for the document store and the resource host, plus the
//! reachability probe used by the connectivity monitor.
//!
//! ## Endpoints
//!
//! - `POST   {base}/collections/{c}/documents` - create (upsert by `id`)
//! - `PATCH  {base}/collections/{c}/documents/{id}` - partial update
//! - `DELETE {base}/collections/{c}/documents/{id}` - delete
//! - `GET    {base}/collections/{c}/documents` - list
//! - `POST   {base}/uploads[?replace={remote_id}]` - upload raw bytes
//! - `DELETE {base}/uploads/{remote_id}` - delete an upload
//! - `GET    {base}/health` - reachability probe
//!
//! ## Status mapping
//!
//! 408, 429 and 5xx are transient. Any other 4xx is a rejection, except 404
//! on delete which counts as already deleted.

use crate::console::remote::{RemoteStore, ResourceHost, UploadedResource};
use crate::console::sync::network_monitor::ReachabilityProbe;
use crate::shared::{CollectionName, Entity, EntityId, Fields, SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Shared request plumbing
#[derive(Debug, Clone)]
struct Endpoint {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl Endpoint {
    fn new(base_url: &str, token: Option<String>) -> SyncResult<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| SyncError::Config { message: format!("invalid base URL {}: {}", base_url, e) })?;
        Ok(Self {
            client: Client::new(),
            base,
            token,
        })
    }

    fn url(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config { message: format!("URL {} cannot be a base", self.base) })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> SyncResult<Response> {
        self.authorize(request).send().await.map_err(map_transport_error)
    }
}

fn map_transport_error(err: reqwest::Error) -> SyncError {
    if err.is_decode() {
        SyncError::Serialization {
            message: err.to_string(),
        }
    } else {
        SyncError::transient(err.to_string())
    }
}

/// Turn a non-success status into the error taxonomy
async fn check_status(response: Response, allow_not_found: bool) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() || (allow_not_found && status == StatusCode::NOT_FOUND) {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{} {}", status, body.trim());
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(SyncError::transient(message))
    } else {
        Err(SyncError::rejected(message))
    }
}

#[derive(Debug, Deserialize)]
struct CreatedDocument {
    id: String,
}

/// REST client for the document store
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    endpoint: Endpoint,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, token: Option<String>) -> SyncResult<Self> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, token)?,
        })
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn create(&self, collection: &CollectionName, entity: &Entity) -> SyncResult<EntityId> {
        let url = self
            .endpoint
            .url(&["collections", collection.as_str(), "documents"])?;
        let mut body = entity.fields.clone();
        body.insert("id".to_string(), Value::String(entity.id.to_string()));

        let response = self
            .endpoint
            .send(self.endpoint.client.post(url).json(&body))
            .await?;
        let response = check_status(response, false).await?;
        let created: CreatedDocument = response.json().await.map_err(map_transport_error)?;
        Ok(EntityId::new(created.id))
    }

    async fn update(
        &self,
        collection: &CollectionName,
        id: &EntityId,
        patch: &Fields,
    ) -> SyncResult<()> {
        let url = self
            .endpoint
            .url(&["collections", collection.as_str(), "documents", id.as_str()])?;
        let response = self
            .endpoint
            .send(self.endpoint.client.patch(url).json(patch))
            .await?;
        check_status(response, false).await?;
        Ok(())
    }

    async fn delete(&self, collection: &CollectionName, id: &EntityId) -> SyncResult<()> {
        let url = self
            .endpoint
            .url(&["collections", collection.as_str(), "documents", id.as_str()])?;
        let response = self.endpoint.send(self.endpoint.client.delete(url)).await?;
        check_status(response, true).await?;
        Ok(())
    }

    async fn list(&self, collection: &CollectionName) -> SyncResult<Vec<Entity>> {
        let url = self
            .endpoint
            .url(&["collections", collection.as_str(), "documents"])?;
        let response = self.endpoint.send(self.endpoint.client.get(url)).await?;
        let response = check_status(response, false).await?;
        let documents: Vec<Fields> = response.json().await.map_err(map_transport_error)?;

        let mut entities = Vec::with_capacity(documents.len());
        for mut fields in documents {
            let id = match fields.remove("id") {
                Some(Value::String(id)) => id,
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    tracing::warn!("[REMOTE] Skipping {} document without an id", collection);
                    continue;
                }
            };
            entities.push(Entity::new(EntityId::new(id), fields));
        }
        Ok(entities)
    }
}

/// REST client for the resource host
#[derive(Debug, Clone)]
pub struct HttpResourceHost {
    endpoint: Endpoint,
}

impl HttpResourceHost {
    pub fn new(base_url: &str, token: Option<String>) -> SyncResult<Self> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, token)?,
        })
    }
}

#[async_trait]
impl ResourceHost for HttpResourceHost {
    async fn upload(
        &self,
        bytes: Bytes,
        content_type: &str,
        existing_remote_id: Option<&str>,
    ) -> SyncResult<UploadedResource> {
        let mut url = self.endpoint.url(&["uploads"])?;
        if let Some(existing) = existing_remote_id {
            url.query_pairs_mut().append_pair("replace", existing);
        }

        let request = self
            .endpoint
            .client
            .post(url)
            .header("Content-Type", content_type)
            .body(bytes);
        let response = self.endpoint.send(request).await?;
        let response = check_status(response, false).await?;
        response.json().await.map_err(map_transport_error)
    }

    async fn delete(&self, remote_id: &str) -> SyncResult<()> {
        let url = self.endpoint.url(&["uploads", remote_id])?;
        let response = self.endpoint.send(self.endpoint.client.delete(url)).await?;
        check_status(response, true).await?;
        Ok(())
    }
}

/// Probe that times `GET {base}/health`
#[derive(Debug, Clone)]
pub struct HttpProbe {
    endpoint: Endpoint,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        Ok(Self {
            endpoint: Endpoint::new(base_url, None)?,
            timeout,
        })
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self) -> SyncResult<Duration> {
        let url = self.endpoint.url(&["health"])?;
        let started = Instant::now();
        let response = self
            .endpoint
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(map_transport_error)?;
        if response.status().is_server_error() {
            return Err(SyncError::transient(format!("health check returned {}", response.status())));
        }
        Ok(started.elapsed())
    }
}
