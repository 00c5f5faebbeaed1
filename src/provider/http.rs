//! REST client for a remote provisioning service.
//!
//! The service exposes one resource collection:
//!
//! | Operation | Request                               |
//! |-----------|---------------------------------------|
//! | create    | `POST   /v1/resources`                |
//! | update    | `PUT    /v1/resources/{kind}/{id}`    |
//! | delete    | `DELETE /v1/resources/{kind}/{id}`    |
//! | describe  | `GET    /v1/resources/{kind}/{id}`    |
//!
//! Successful create, update and describe calls answer with
//! `{"outputs": {...}}`.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result, StackplanError};
use crate::graph::Outputs;

use super::{Provider, ProviderResult, ResourceRequest, ensure_id};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Wait used when a throttling response carries no `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// HTTP provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Service base URL without trailing slash.
    endpoint: String,
    /// Bearer token.
    token: Option<String>,
}

/// Body returned by the service.
#[derive(Debug, Deserialize)]
struct OutputsResponse {
    outputs: Outputs,
}

impl HttpProvider {
    /// Creates a client for `endpoint` with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                StackplanError::Provider(ProviderError::transient(format!(
                    "Failed to create HTTP client: {e}"
                )))
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn collection_url(&self) -> String {
        format!("{}/v1/resources", self.endpoint)
    }

    fn resource_url(&self, request: &ResourceRequest) -> ProviderResult<String> {
        let id = request.require_physical_id()?;
        Ok(format!("{}/v1/resources/{}/{id}", self.endpoint, request.kind))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json");

        match &self.token {
            Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    /// Sends a request, mapping transport failures.
    async fn send(builder: RequestBuilder) -> ProviderResult<Response> {
        builder
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("Request failed: {e}")))
    }

    /// Maps non-success statuses onto provider errors.
    async fn check(response: Response, request: &ResourceRequest) -> ProviderResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after_secs = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::Throttled { retry_after_secs });
        }

        if status == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound {
                kind: request.kind.to_string(),
                id: request
                    .physical_id
                    .clone()
                    .unwrap_or_else(|| request.node_id.clone()),
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(ProviderError::transient(format!("{status}: {body}")))
        } else {
            Err(ProviderError::rejected(status.as_u16(), body))
        }
    }

    /// Decodes an outputs body.
    async fn outputs(response: Response) -> ProviderResult<Outputs> {
        let body: OutputsResponse = response.json().await.map_err(|e| ProviderError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })?;
        ensure_id(body.outputs)
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<Outputs> {
        trace!("POST {} for {}/{}", self.collection_url(), request.unit, request.node_id);
        let response = Self::send(self.request(Method::POST, &self.collection_url()).json(request)).await?;
        let response = Self::check(response, request).await?;
        Self::outputs(response).await
    }

    async fn update(&self, request: &ResourceRequest) -> ProviderResult<Outputs> {
        let url = self.resource_url(request)?;
        trace!("PUT {url}");
        let response = Self::send(self.request(Method::PUT, &url).json(request)).await?;
        let response = Self::check(response, request).await?;
        Self::outputs(response).await
    }

    async fn delete(&self, request: &ResourceRequest) -> ProviderResult<()> {
        let url = self.resource_url(request)?;
        trace!("DELETE {url}");
        let response = Self::send(self.request(Method::DELETE, &url)).await?;
        Self::check(response, request).await?;
        Ok(())
    }

    async fn describe(&self, request: &ResourceRequest) -> ProviderResult<Option<Outputs>> {
        let url = self.resource_url(request)?;
        trace!("GET {url}");
        let response = Self::send(self.request(Method::GET, &url)).await?;

        match Self::check(response, request).await {
            Ok(response) => Self::outputs(response).await.map(Some),
            Err(ProviderError::NotFound { .. }) => {
                debug!("{}/{} no longer exists", request.unit, request.node_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceKind;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ResourceRequest {
        ResourceRequest::new(
            "storage",
            "fs",
            ResourceKind::FileSystem,
            BTreeMap::from([(String::from("encrypted"), json!(true))]),
        )
    }

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), Some(String::from("secret"))).unwrap()
    }

    #[tokio::test]
    async fn test_create_posts_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "outputs": { "id": "fs-123", "file_system_id": "fs-123" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outputs = provider(&server).create(&request()).await.unwrap();
        assert_eq!(outputs["id"], json!("fs-123"));
    }

    #[tokio::test]
    async fn test_throttling_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = provider(&server).create(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Throttled { retry_after_secs: 7 }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unavailable_without_header_uses_default_wait() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider(&server)
            .update(&request().with_physical_id("fs-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::Throttled { retry_after_secs: DEFAULT_RETRY_AFTER_SECS }
        ));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/file-system/fs-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/file-system/fs-bad"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad attribute"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/file-system/fs-err"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = provider(&server);
        let gone = client.delete(&request().with_physical_id("fs-gone")).await;
        assert!(matches!(gone, Err(ProviderError::NotFound { .. })));

        let bad = client.delete(&request().with_physical_id("fs-bad")).await;
        match bad {
            Err(ProviderError::Rejected { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "bad attribute");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let err = client.delete(&request().with_physical_id("fs-err")).await;
        assert!(matches!(err, Err(ProviderError::Transient { .. })));
    }

    #[tokio::test]
    async fn test_describe_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/file-system/fs-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outputs = provider(&server)
            .describe(&request().with_physical_id("fs-1"))
            .await
            .unwrap();
        assert!(outputs.is_none());
    }

    #[tokio::test]
    async fn test_outputs_without_id_are_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "outputs": {} })))
            .mount(&server)
            .await;

        let err = provider(&server).create(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }
}
