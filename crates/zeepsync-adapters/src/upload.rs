//! Blob uploads for level archives and thumbnails.

use async_trait::async_trait;
use serde::Deserialize;
use zeepsync_storage::HttpClient;

use crate::{UploadClient, UploadError};

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

#[derive(Debug, Clone)]
pub struct HttpUploadClient {
    http: HttpClient,
    base_url: String,
    token: Option<String>,
}

impl HttpUploadClient {
    pub fn new(http: HttpClient, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn object_url(&self, kind: &str, id: &str) -> String {
        format!("{}/{kind}/{id}", self.base_url)
    }

    async fn put(
        &self,
        kind: &str,
        id: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, UploadError> {
        let url = self.object_url(kind, id);
        let resp = self
            .http
            .send(|client| {
                let builder = client
                    .put(&url)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(bytes.clone());
                match &self.token {
                    Some(token) => builder.bearer_auth(token),
                    None => builder,
                }
            })
            .await?;

        let parsed: UploadResponse =
            serde_json::from_slice(&resp.body).map_err(|source| UploadError::Decode {
                url: resp.url.clone(),
                source,
            })?;
        if parsed.url.trim().is_empty() {
            return Err(UploadError::Rejected(format!("empty url returned for {url}")));
        }
        Ok(parsed.url)
    }
}

#[async_trait]
impl UploadClient for HttpUploadClient {
    async fn upload_payload(&self, id: &str, bytes: Vec<u8>) -> Result<String, UploadError> {
        self.put("levels", id, "application/zip", bytes).await
    }

    async fn upload_thumbnail(
        &self,
        id: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, UploadError> {
        self.put("thumbnails", id, content_type, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeepsync_storage::HttpClientConfig;

    #[test]
    fn object_urls_are_namespaced_by_kind() {
        let http = HttpClient::new(HttpClientConfig::default()).expect("client");
        let uploads = HttpUploadClient::new(http, "https://cdn.example/", None);
        assert_eq!(
            uploads.object_url("thumbnails", "abc"),
            "https://cdn.example/thumbnails/abc"
        );
    }
}
