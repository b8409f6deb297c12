//! Workshop downloads through an external `steamcmd` process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AcquisitionClient, AcquisitionError};

#[derive(Debug, Clone)]
pub struct SteamCmdConfig {
    pub program: PathBuf,
    pub username: String,
    pub app_id: u32,
    /// Parent of the per-cycle session directories (steamcmd home).
    pub session_root: PathBuf,
}

/// Drives `steamcmd +workshop_download_item` once per item.
///
/// A session is a scratch home directory for steamcmd's own state; it is
/// created by `init_session` and removed by `dispose_session` so nothing
/// leaks from one cycle into the next.
#[derive(Debug)]
pub struct SteamCmdAcquisition {
    config: SteamCmdConfig,
    session: Mutex<Option<PathBuf>>,
}

impl SteamCmdAcquisition {
    pub fn new(config: SteamCmdConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    pub fn download_args(&self, item_id: &str, destination: &Path) -> Vec<String> {
        vec![
            "+force_install_dir".to_string(),
            destination.display().to_string(),
            "+login".to_string(),
            self.config.username.clone(),
            "+workshop_download_item".to_string(),
            self.config.app_id.to_string(),
            item_id.to_string(),
            "+quit".to_string(),
        ]
    }

    async fn session_dir(&self) -> Result<PathBuf, AcquisitionError> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or(AcquisitionError::NoSession)
    }
}

#[async_trait]
impl AcquisitionClient for SteamCmdAcquisition {
    async fn init_session(&self) -> Result<(), AcquisitionError> {
        let mut session = self.session.lock().await;
        let dir = self.config.session_root.join("session");
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        info!(session = %dir.display(), "acquisition session initialised");
        *session = Some(dir);
        Ok(())
    }

    async fn fetch(
        &self,
        item_id: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), AcquisitionError> {
        let home = self.session_dir().await?;
        let program = self.config.program.display().to_string();
        let args = self.download_args(item_id, destination);
        debug!(item_id, %program, "starting workshop download");

        let child = Command::new(&self.config.program)
            .args(&args)
            .env("HOME", &home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AcquisitionError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = cancel.cancelled() => {
                warn!(item_id, "download cancelled");
                return Err(AcquisitionError::Cancelled(item_id.to_string()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(AcquisitionError::Exit {
                item_id: item_id.to_string(),
                status: output.status.to_string(),
                stderr: detail.trim().chars().take(512).collect(),
            });
        }
        Ok(())
    }

    async fn dispose_session(&self) -> Result<(), AcquisitionError> {
        let mut session = self.session.lock().await;
        if let Some(dir) = session.take() {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            info!(session = %dir.display(), "acquisition session disposed");
        }
        Ok(())
    }
}
