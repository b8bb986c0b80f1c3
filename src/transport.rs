// batch_ingestor/src/transport.rs
// HTTP plumbing shared by the executor and the shard poller.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::auth::{ApiKey, CredentialsProvider, NoAuth};
use crate::config::TransportConfig;
use crate::error::{BatchError, Result};

/// Status and undecoded body of a completed call.
#[derive(Debug, Clone,)]
pub struct RawResponse {
    pub status: u16,
    pub body:   Bytes,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Bytes,>,) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json_body(status: u16, body: &Value,) -> Self {
        Self::new(status, body.to_string(),)
    }

    pub fn is_success(&self,) -> bool {
        (200..300).contains(&self.status,)
    }

    /// Decodes the body as JSON. `None` for an empty or malformed body.
    pub fn json(&self,) -> Option<Value,> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body,).ok()
    }

    pub fn text(&self,) -> String {
        String::from_utf8_lossy(&self.body,).into_owned()
    }

    /// Converts a non-2xx response into the matching error.
    pub fn error_for_status(self,) -> Result<Self,> {
        if self.is_success() {
            Ok(self,)
        } else {
            let text = self.text();
            Err(BatchError::from_status(self.status, text,),)
        }
    }
}

/// The connection to the remote database. Errors mean the call never produced a response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, path: &str, body: &Value,) -> Result<RawResponse,>;

    async fn get(&self, path: &str,) -> Result<RawResponse,>;
}

pub struct HttpTransport {
    client:      Client,
    base_url:    Url,
    credentials: Arc<dyn CredentialsProvider,>,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig,) -> Result<Self,> {
        let base_url = config.parsed_url()?;
        let client = Client::builder()
            .timeout(config.request_timeout,)
            .build()
            .map_err(|e| BatchError::Configuration(format!("Failed to build HTTP client: {}", e),),)?;

        let credentials: Arc<dyn CredentialsProvider,> = match &config.api_key {
            Some(key,) => Arc::new(ApiKey::new(key.clone(),),),
            None => Arc::new(NoAuth,),
        };

        Ok(Self {
            client,
            base_url,
            credentials,
        },)
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialsProvider,>,) -> Self {
        self.credentials = credentials;
        self
    }

    fn url(&self, path: &str,) -> Result<Url,> {
        self.base_url
            .join(path,)
            .map_err(|e| BatchError::Configuration(format!("Invalid request path '{}': {}", path, e),),)
    }

    async fn dispatch(&self, request: reqwest::RequestBuilder,) -> Result<RawResponse,> {
        let mut request = request;
        for (name, value,) in self.credentials.headers() {
            request = request.header(name, value,);
        }

        let response = request.send().await.map_err(|e| {
            BatchError::TransientTransport(format!("Request to remote database failed: {}", e),)
        },)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            BatchError::TransientTransport(format!("Failed to read response body: {}", e),)
        },)?;

        debug!("Received status {} with {} body bytes", status, body.len());
        Ok(RawResponse { status, body, },)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, path: &str, body: &Value,) -> Result<RawResponse,> {
        let url = self.url(path,)?;
        self.dispatch(self.client.post(url,).json(body,),).await
    }

    async fn get(&self, path: &str,) -> Result<RawResponse,> {
        let url = self.url(path,)?;
        self.dispatch(self.client.get(url,),).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn raw_response_helpers() {
        let ok = RawResponse::json_body(200, &json!([{"id": "x"}]));
        assert!(ok.is_success());
        assert_eq!(ok.json().unwrap()[0]["id"], "x");

        let empty = RawResponse::new(503, Bytes::new());
        assert!(empty.json().is_none());
        assert!(empty.error_for_status().unwrap_err().is_transient());

        let rejected = RawResponse::new(422, "bad class");
        match rejected.error_for_status() {
            Err(BatchError::PermanentServer { status, message }) => {
                assert_eq!(status, 422);
                assert_eq!(message, "bad class");
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn joins_paths_against_base_url() {
        let transport = HttpTransport::new(&TransportConfig::new("http://localhost:8080")).unwrap();
        assert_eq!(
            transport.url("/v1/batch/objects").unwrap().as_str(),
            "http://localhost:8080/v1/batch/objects"
        );
    }
}
