//! Steam Workshop listing through `IPublishedFileService/QueryFiles`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use zeepsync_core::{SortOrder, WorkshopItem};
use zeepsync_storage::HttpClient;

use crate::{CatalogClient, CatalogError};

pub const DEFAULT_API_BASE: &str = "https://api.steampowered.com";
pub const ZEEPKIST_APP_ID: u32 = 1440670;

const QUERY_RANKED_BY_PUBLICATION_DATE: u32 = 1;
const QUERY_RANKED_BY_LAST_UPDATED_DATE: u32 = 21;

#[derive(Debug, Clone)]
pub struct SteamCatalogConfig {
    pub api_base: String,
    pub api_key: String,
    pub app_id: u32,
    pub page_size: u32,
}

impl Default for SteamCatalogConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            app_id: ZEEPKIST_APP_ID,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SteamCatalogClient {
    http: HttpClient,
    config: SteamCatalogConfig,
}

#[derive(Debug, Deserialize)]
struct QueryFilesEnvelope {
    response: QueryFilesResponse,
}

#[derive(Debug, Deserialize)]
struct QueryFilesResponse {
    #[serde(default)]
    total: u64,
    #[serde(default)]
    publishedfiledetails: Vec<PublishedFileDetails>,
}

#[derive(Debug, Deserialize)]
struct PublishedFileDetails {
    publishedfileid: String,
    #[serde(default)]
    creator: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    time_created: i64,
    #[serde(default)]
    time_updated: i64,
}

impl PublishedFileDetails {
    fn into_item(self) -> WorkshopItem {
        let created_at = timestamp(self.time_created);
        // Items never edited after publishing report no update time.
        let updated_at = if self.time_updated > 0 {
            timestamp(self.time_updated)
        } else {
            created_at
        };
        WorkshopItem {
            id: self.publishedfileid,
            creator_id: self.creator,
            title: self.title,
            created_at,
            updated_at,
        }
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

pub fn query_type(order: SortOrder) -> u32 {
    match order {
        SortOrder::LastModified => QUERY_RANKED_BY_LAST_UPDATED_DATE,
        SortOrder::Created => QUERY_RANKED_BY_PUBLICATION_DATE,
    }
}

pub fn page_count(total: u64, page_size: u32) -> u32 {
    let page_size = u64::from(page_size.max(1));
    total.div_ceil(page_size).min(u64::from(u32::MAX)) as u32
}

impl SteamCatalogClient {
    pub fn new(http: HttpClient, config: SteamCatalogConfig) -> Self {
        Self { http, config }
    }

    async fn query(
        &self,
        order: SortOrder,
        page: u32,
        total_only: bool,
    ) -> Result<QueryFilesResponse, CatalogError> {
        let url = format!(
            "{}/IPublishedFileService/QueryFiles/v1/",
            self.config.api_base.trim_end_matches('/')
        );
        let params = [
            ("key", self.config.api_key.clone()),
            ("appid", self.config.app_id.to_string()),
            ("query_type", query_type(order).to_string()),
            ("page", page.to_string()),
            ("numperpage", self.config.page_size.to_string()),
            ("return_details", "true".to_string()),
            ("totalonly", total_only.to_string()),
        ];

        let resp = self
            .http
            .send(|client| client.get(&url).query(&params))
            .await?;
        let envelope: QueryFilesEnvelope =
            serde_json::from_slice(&resp.body).map_err(|source| CatalogError::Decode {
                url: resp.url.clone(),
                source,
            })?;
        Ok(envelope.response)
    }
}

#[async_trait]
impl CatalogClient for SteamCatalogClient {
    async fn total_pages(&self, order: SortOrder) -> Result<u32, CatalogError> {
        let response = self.query(order, 1, true).await?;
        let pages = page_count(response.total, self.config.page_size);
        debug!(%order, total = response.total, pages, "queried catalog size");
        Ok(pages)
    }

    async fn page(&self, page: u32, order: SortOrder) -> Result<Vec<WorkshopItem>, CatalogError> {
        let response = self.query(order, page, false).await?;
        Ok(response
            .publishedfiledetails
            .into_iter()
            .map(PublishedFileDetails::into_item)
            .collect())
    }
}
