//! JSON REST client for the level catalog backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::json;
use zeepsync_core::{LevelRecord, NewLevel};
use zeepsync_storage::{HttpClient, HttpError, HttpResponse};

use crate::{BackendError, LevelBackend, Lookup};

const NOT_FOUND: u16 = 404;

#[derive(Debug, Clone)]
pub struct RestLevelBackend {
    http: HttpClient,
    base_url: String,
    token: Option<String>,
}

impl RestLevelBackend {
    pub fn new(http: HttpClient, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn call<F>(&self, build: F) -> Result<HttpResponse, HttpError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        self.http
            .send(|client| self.authorize(build(client)))
            .await
    }

    /// Single attempt; a retried POST could store the same level twice.
    async fn call_once_json<T, F>(&self, build: F) -> Result<T, BackendError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let resp = self
            .http
            .send_once(|client| self.authorize(build(client)))
            .await?;
        decode(&resp)
    }

    async fn call_json<T, F>(&self, build: F) -> Result<T, BackendError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let resp = self.call(build).await?;
        decode(&resp)
    }

    async fn latest(&self, sort: &str) -> Result<Option<LevelRecord>, BackendError> {
        let url = self.url("levels/latest");
        match self
            .call(|client| client.get(&url).query(&[("sort", sort)]))
            .await
        {
            Ok(resp) => decode(&resp).map(Some),
            Err(err) if err.status() == Some(NOT_FOUND) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn decode<T: DeserializeOwned>(resp: &HttpResponse) -> Result<T, BackendError> {
    serde_json::from_slice(&resp.body).map_err(|source| BackendError::Decode {
        url: resp.url.clone(),
        source,
    })
}

#[async_trait]
impl LevelBackend for RestLevelBackend {
    async fn get_by_workshop_id(&self, workshop_id: &str) -> Lookup<Vec<LevelRecord>> {
        let url = self.url(&format!("levels/workshop/{workshop_id}"));
        match self.call(|client| client.get(&url)).await {
            Ok(resp) => match decode::<Vec<LevelRecord>>(&resp) {
                Ok(records) if records.is_empty() => Lookup::NotFound,
                Ok(records) => Lookup::Found(records),
                Err(err) => Lookup::Failure(err),
            },
            Err(err) if err.status() == Some(NOT_FOUND) => Lookup::NotFound,
            Err(err) => Lookup::Failure(err.into()),
        }
    }

    async fn create(&self, level: &NewLevel) -> Result<LevelRecord, BackendError> {
        let url = self.url("levels");
        self.call_once_json(|client| client.post(&url).json(level))
            .await
    }

    async fn update_timestamp(
        &self,
        id: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<LevelRecord, BackendError> {
        let url = self.url(&format!("levels/{id}/updated"));
        let body = json!({ "updatedAt": updated_at.timestamp() });
        self.call_json(|client| client.patch(&url).json(&body)).await
    }

    async fn replace(&self, old_id: i64, new_id: i64) -> Result<LevelRecord, BackendError> {
        let url = self.url(&format!("levels/{old_id}/replace"));
        let body = json!({ "replacedBy": new_id });
        self.call_once_json(|client| client.post(&url).json(&body))
            .await
    }

    async fn delete(&self, id: i64) -> Result<LevelRecord, BackendError> {
        let url = self.url(&format!("levels/{id}"));
        self.call_json(|client| client.delete(&url)).await
    }

    async fn last_created(&self) -> Result<Option<LevelRecord>, BackendError> {
        self.latest("created").await
    }

    async fn last_modified(&self) -> Result<Option<LevelRecord>, BackendError> {
        self.latest("updated").await
    }
}
