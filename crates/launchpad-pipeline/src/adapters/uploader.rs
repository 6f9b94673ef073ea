//! HTTP metadata uploader

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::core::{MetadataUploader, NetworkError, PipelineResult};

#[derive(Debug, Deserialize)]
struct UploadResponse {
    uri: Option<String>,
    cid: Option<String>,
}

impl UploadResponse {
    fn into_uri(self) -> Option<String> {
        self.uri.or_else(|| self.cid.map(|cid| format!("ipfs://{}", cid)))
    }
}

/// Posts raw bytes to a pinning/storage endpoint that answers `{"uri"}` or `{"cid"}`
pub struct HttpUploader {
    endpoint: String,
    auth_token: Option<String>,
    http: reqwest::Client,
}

impl HttpUploader {
    pub fn new(
        endpoint: impl Into<String>,
        auth_token: Option<String>,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            auth_token,
            http,
        })
    }
}

#[async_trait]
impl MetadataUploader for HttpUploader {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> PipelineResult<String> {
        let size = bytes.len();
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NetworkError::Upload(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Upload(format!("endpoint answered {}", status)).into());
        }

        let uri = response
            .json::<UploadResponse>()
            .await
            .map_err(|e| NetworkError::Upload(e.to_string()))?
            .into_uri()
            .ok_or_else(|| NetworkError::Upload("response carried no uri".to_string()))?;

        debug!(size, uri = %uri, "Uploaded metadata");
        Ok(uri)
    }
}
