//! Platform-specific state directory for the edge

use directories::ProjectDirs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::common::error::Result;

/// Where the edge keeps its ACME account and certificates
#[derive(Debug, Clone)]
pub struct EdgeStateDir {
    /// Project directories from the directories crate
    project_dirs: Option<ProjectDirs>,
    /// Override directory for testing or custom installations
    override_dir: Option<PathBuf>,
}

impl EdgeStateDir {
    pub fn new() -> Self {
        let project_dirs = ProjectDirs::from("org", "Edge", "edge");

        if project_dirs.is_none() {
            warn!("Failed to determine platform-specific directories, will use fallback");
        }

        Self {
            project_dirs,
            override_dir: None,
        }
    }

    /// Use `path` instead of the platform directory
    pub fn with_override(path: impl Into<PathBuf>) -> Self {
        Self {
            project_dirs: None,
            override_dir: Some(path.into()),
        }
    }

    /// Get the data directory for persistent storage
    pub fn data_dir(&self) -> PathBuf {
        if let Some(override_dir) = &self.override_dir {
            return override_dir.clone();
        }

        if let Some(project_dirs) = &self.project_dirs {
            project_dirs.data_dir().to_path_buf()
        } else {
            PathBuf::from("./data")
        }
    }

    pub fn acme_dir(&self) -> PathBuf {
        self.data_dir().join("acme")
    }

    /// ACME account credentials, as JSON
    pub fn account_path(&self) -> PathBuf {
        self.acme_dir().join("account.json")
    }

    /// Root of the per-domain certificate directories
    pub fn certs_dir(&self) -> PathBuf {
        self.data_dir().join("certs")
    }

    /// Create all required directories
    pub async fn create_directories(&self) -> Result<()> {
        for dir in [self.data_dir(), self.acme_dir(), self.certs_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
            debug!("Ensured directory exists: {}", dir.display());
        }

        info!("State directory: {}", self.data_dir().display());
        Ok(())
    }
}

impl Default for EdgeStateDir {
    fn default() -> Self {
        Self::new()
    }
}
