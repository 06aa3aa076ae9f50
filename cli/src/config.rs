use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tidevault_backends::chunked::{UploadConfig, GRAPH_API_BASE};
use tidevault_backends::oauth::{DEFAULT_AUTHORIZE_URL, DEFAULT_SCOPE, DEFAULT_TOKEN_URL};
use tidevault_backends::OAuthConfig;
use tidevault_core::archive::{DEFAULT_PART_CEILING, DEFAULT_WORKERS};
use tidevault_core::BackupConfig;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backup: BackupSection,
    pub onedrive: OneDriveSection,
    pub log: LogSection,
    /// Ledger and credential files. Defaults to the platform data directory.
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    pub root_dir: PathBuf,
    pub output_dir: PathBuf,
    pub password: Option<String>,
    pub force_full_backup: bool,
    pub cron: Option<String>,
    pub part_size_mb: u64,
    pub workers: usize,
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::new(),
            output_dir: PathBuf::new(),
            password: None,
            force_full_backup: false,
            cron: None,
            part_size_mb: DEFAULT_PART_CEILING / MIB,
            workers: DEFAULT_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OneDriveSection {
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub redirect_uri: String,
    /// Remote folder parts are uploaded into.
    pub base_path: String,
    pub api_base: Option<String>,
    pub authorize_url: Option<String>,
    pub token_url: Option<String>,
    /// How long to wait for an authorization code. Unset waits forever.
    pub auth_timeout_secs: Option<u64>,
}

impl Default for OneDriveSection {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            scope: DEFAULT_SCOPE.to_string(),
            redirect_uri: String::new(),
            base_path: String::new(),
            api_base: None,
            authorize_url: None,
            token_url: None,
            auth_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: Option<String>,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "tidevault", "tidevault")
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reads the config file, then applies environment overrides.
    ///
    /// An explicit path must exist. Without one, a missing default file yields
    /// the built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::read(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::read(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = set("CLIENT_ID") {
            self.onedrive.client_id = v;
        }
        if let Some(v) = set("CLIENT_SECRET") {
            self.onedrive.client_secret = v;
        }
        if let Some(v) = set("REDIRECT_URI") {
            self.onedrive.redirect_uri = v;
        }
        if let Some(v) = set("BACKUP_PASSWORD") {
            self.backup.password = Some(v);
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .or_else(|| project_dirs().map(|dirs| dirs.data_dir().to_path_buf()))
            .unwrap_or_else(|| PathBuf::from(".tidevault"))
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.state_dir().join("credentials.json")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.state_dir().join("ledger")
    }

    pub fn upload_enabled(&self) -> bool {
        !self.onedrive.client_id.is_empty()
    }

    pub fn auth_timeout(&self) -> Option<Duration> {
        self.onedrive.auth_timeout_secs.map(Duration::from_secs)
    }

    pub fn backup_config(&self, force_full: bool) -> Result<BackupConfig> {
        if self.backup.part_size_mb == 0 {
            return Err(anyhow!("backup.part_size_mb must be at least 1"));
        }
        let mut config = BackupConfig::new(&self.backup.root_dir, &self.backup.output_dir);
        config.password = self.backup.password.clone().filter(|p| !p.is_empty());
        config.force_full = force_full || self.backup.force_full_backup;
        config.part_ceiling = self.backup.part_size_mb.saturating_mul(MIB);
        config.workers = self.backup.workers.max(1);
        Ok(config)
    }

    pub fn oauth_config(&self) -> OAuthConfig {
        let od = &self.onedrive;
        let mut config = OAuthConfig::new(&od.client_id, &od.client_secret, &od.redirect_uri);
        config.scope = od.scope.clone();
        config.authorize_url = od
            .authorize_url
            .clone()
            .unwrap_or_else(|| DEFAULT_AUTHORIZE_URL.to_string());
        config.token_url = od.token_url.clone().unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string());
        config
    }

    pub fn api_base(&self) -> String {
        self.onedrive
            .api_base
            .clone()
            .unwrap_or_else(|| GRAPH_API_BASE.to_string())
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            remote_folder: self.onedrive.base_path.clone(),
            ..UploadConfig::default()
        }
    }
}
