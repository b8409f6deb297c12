//! Crawl, acquisition and reconciliation engine for workshop levels.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use zeepsync_adapters::{
    AcquisitionClient, CatalogClient, HttpUploadClient, LevelBackend, RestLevelBackend,
    SteamCatalogClient, SteamCatalogConfig, SteamCmdAcquisition, SteamCmdConfig, UploadClient,
};
use zeepsync_storage::{HttpClient, HttpClientConfig, LocalStaging, Staging};

pub mod crawl;
pub mod filter;
pub mod orchestrator;
pub mod reconcile;
pub mod supervisor;

pub use crawl::PassStop;
pub use filter::{filter_candidates, needs_download};
pub use orchestrator::ItemReport;
pub use reconcile::{decide, Decision, FileOutcome, ReconcileError, SkipReason};
pub use supervisor::{CycleBackoff, Phase, Supervisor};

pub const CRATE_NAME: &str = "zeepsync-sync";

pub const DEFAULT_PLACEHOLDER_THUMBNAIL_URL: &str =
    "https://zeepsync.invalid/thumbnails/placeholder.jpg";

#[derive(Clone)]
pub struct SyncConfig {
    pub steam_api_key: String,
    pub app_id: u32,
    pub page_size: u32,
    pub backend_url: String,
    pub backend_token: Option<String>,
    pub upload_url: String,
    pub upload_token: Option<String>,
    pub steamcmd: PathBuf,
    pub steam_user: String,
    pub staging_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub unproductive_page_limit: u32,
    pub backoff_base_secs: u64,
    pub cycle_delay_secs: u64,
    pub placeholder_thumbnail_url: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            steam_api_key: env_or("ZEEPSYNC_STEAM_API_KEY", ""),
            app_id: env_num("ZEEPSYNC_APP_ID", zeepsync_adapters::catalog::ZEEPKIST_APP_ID),
            page_size: env_num("ZEEPSYNC_PAGE_SIZE", 100),
            backend_url: env_or("ZEEPSYNC_BACKEND_URL", ""),
            backend_token: env_opt("ZEEPSYNC_BACKEND_TOKEN"),
            upload_url: env_or("ZEEPSYNC_UPLOAD_URL", ""),
            upload_token: env_opt("ZEEPSYNC_UPLOAD_TOKEN"),
            steamcmd: PathBuf::from(env_or("ZEEPSYNC_STEAMCMD", "steamcmd")),
            steam_user: env_or("ZEEPSYNC_STEAM_USER", "anonymous"),
            staging_dir: PathBuf::from(env_or("ZEEPSYNC_STAGING_DIR", "./staging")),
            user_agent: env_or("ZEEPSYNC_USER_AGENT", "zeepsync/0.1"),
            http_timeout_secs: env_num("ZEEPSYNC_HTTP_TIMEOUT_SECS", 30),
            unproductive_page_limit: env_num("ZEEPSYNC_UNPRODUCTIVE_PAGE_LIMIT", 5),
            backoff_base_secs: env_num("ZEEPSYNC_BACKOFF_BASE_SECS", 300),
            cycle_delay_secs: env_num("ZEEPSYNC_CYCLE_DELAY_SECS", 60),
            placeholder_thumbnail_url: env_or(
                "ZEEPSYNC_PLACEHOLDER_THUMBNAIL_URL",
                DEFAULT_PLACEHOLDER_THUMBNAIL_URL,
            ),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            bail!("ZEEPSYNC_PAGE_SIZE must be greater than zero");
        }
        if self.unproductive_page_limit == 0 {
            bail!("ZEEPSYNC_UNPRODUCTIVE_PAGE_LIMIT must be greater than zero");
        }
        if self.backoff_base_secs == 0 {
            bail!("ZEEPSYNC_BACKOFF_BASE_SECS must be greater than zero");
        }
        if self.backend_url.trim().is_empty() {
            bail!("ZEEPSYNC_BACKEND_URL is not set");
        }
        if self.upload_url.trim().is_empty() {
            bail!("ZEEPSYNC_UPLOAD_URL is not set");
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            unproductive_page_limit: self.unproductive_page_limit,
            placeholder_thumbnail_url: self.placeholder_thumbnail_url.clone(),
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn cycle_delay(&self) -> Duration {
        Duration::from_secs(self.cycle_delay_secs)
    }
}

fn redact(token: &Option<String>) -> &'static str {
    if token.is_some() {
        "<set>"
    } else {
        "<unset>"
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let api_key = Some(self.steam_api_key.clone()).filter(|k| !k.is_empty());
        f.debug_struct("SyncConfig")
            .field("steam_api_key", &redact(&api_key))
            .field("app_id", &self.app_id)
            .field("page_size", &self.page_size)
            .field("backend_url", &self.backend_url)
            .field("backend_token", &redact(&self.backend_token))
            .field("upload_url", &self.upload_url)
            .field("upload_token", &redact(&self.upload_token))
            .field("steamcmd", &self.steamcmd)
            .field("steam_user", &self.steam_user)
            .field("staging_dir", &self.staging_dir)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("unproductive_page_limit", &self.unproductive_page_limit)
            .field("backoff_base_secs", &self.backoff_base_secs)
            .field("cycle_delay_secs", &self.cycle_delay_secs)
            .field("placeholder_thumbnail_url", &self.placeholder_thumbnail_url)
            .finish()
    }
}

/// Knobs the engine reads while crawling and reconciling.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub unproductive_page_limit: u32,
    pub placeholder_thumbnail_url: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            unproductive_page_limit: 5,
            placeholder_thumbnail_url: DEFAULT_PLACEHOLDER_THUMBNAIL_URL.to_string(),
        }
    }
}

/// Counters accumulated over one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub pages: u64,
    pub items_seen: u64,
    pub items_acquired: u64,
    pub created: u64,
    pub replaced: u64,
    pub touched: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub quarantine_touches: u64,
    pub file_failures: u64,
    pub item_failures: u64,
    pub consistency_failures: u64,
}

impl CycleStats {
    pub fn record_outcome(&mut self, outcome: &FileOutcome) {
        match outcome {
            FileOutcome::Created(_) => self.created += 1,
            FileOutcome::Replaced { .. } => self.replaced += 1,
            FileOutcome::Touched(_) => self.touched += 1,
            FileOutcome::Skipped(_) => self.skipped += 1,
        }
    }

    pub fn record_failure(&mut self, err: &ReconcileError) {
        self.file_failures += 1;
        if err.is_critical() {
            self.consistency_failures += 1;
        }
    }
}

/// The four collaborators plus the staging area, shared behind trait objects.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogClient>,
    pub acquisition: Arc<dyn AcquisitionClient>,
    pub backend: Arc<dyn LevelBackend>,
    pub uploads: Arc<dyn UploadClient>,
    pub staging: Arc<dyn Staging>,
}

impl Collaborators {
    /// Production wiring: Steam Web API, steamcmd, REST backend, HTTP uploads.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })
        .context("building http client")?;

        let catalog = SteamCatalogClient::new(
            http.clone(),
            SteamCatalogConfig {
                api_key: config.steam_api_key.clone(),
                app_id: config.app_id,
                page_size: config.page_size,
                ..Default::default()
            },
        );
        let acquisition = SteamCmdAcquisition::new(SteamCmdConfig {
            program: config.steamcmd.clone(),
            username: config.steam_user.clone(),
            app_id: config.app_id,
            session_root: config.staging_dir.join(".steamcmd"),
        });
        let backend = RestLevelBackend::new(
            http.clone(),
            config.backend_url.clone(),
            config.backend_token.clone(),
        );
        let uploads =
            HttpUploadClient::new(http, config.upload_url.clone(), config.upload_token.clone());
        let staging = LocalStaging::new(config.staging_dir.join("items"));

        Ok(Self {
            catalog: Arc::new(catalog),
            acquisition: Arc::new(acquisition),
            backend: Arc::new(backend),
            uploads: Arc::new(uploads),
            staging: Arc::new(staging),
        })
    }
}

/// Single sequential worker driving crawl passes over the collaborators.
#[derive(Clone)]
pub struct SyncEngine {
    collab: Collaborators,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(collab: Collaborators, settings: EngineSettings) -> Self {
        Self { collab, settings }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            Collaborators::from_config(config)?,
            config.engine_settings(),
        ))
    }
}
