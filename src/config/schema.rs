use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

pub const CONFIG_DIR_ENV: &str = "SESSIONVAULT_CONFIG_DIR";
const CONFIG_FILE_NAME: &str = "config.toml";
const SUPPORTED_BACKENDS: &[&str] = &["memory", "sqlite", "remote"];

// ── Top-level config ──────────────────────────────────────────────

/// Top-level sessionvault configuration, loaded from `config.toml`.
///
/// Resolution order: `SESSIONVAULT_CONFIG_DIR` env → `~/.sessionvault/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Directory holding config.toml - computed, not serialized
    #[serde(skip)]
    pub config_dir: PathBuf,
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Session storage backend (`[storage]`).
    #[serde(default)]
    pub storage: StorageConfig,

    /// Remote session API (`[remote]`).
    #[serde(default)]
    pub remote: RemoteConfig,
}

// ── Storage ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageConfig {
    /// `"memory"`, `"sqlite"` or `"remote"`. Default: `"sqlite"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// SQLite database file; relative paths resolve against the config dir.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    /// How long SQLite waits on a locked database. Default: `5000`.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Upper bound for a single storage operation. Default: `30`.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
}

fn default_backend() -> String {
    "sqlite".into()
}

fn default_sqlite_path() -> String {
    "sessions.db".into()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_operation_timeout_secs() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

// ── Remote ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Base URL of the session API. Unset means the in-memory fallback serves every call.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_remote_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_remote_timeout_secs() -> u64 {
    30
}

fn default_remote_connect_timeout_secs() -> u64 {
    10
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: default_remote_timeout_secs(),
            connect_timeout_secs: default_remote_connect_timeout_secs(),
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let config_dir = home.join(".sessionvault");

        Self {
            config_path: config_dir.join(CONFIG_FILE_NAME),
            config_dir,
            storage: StorageConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".sessionvault"))
}

fn resolve_config_dir() -> Result<(PathBuf, &'static str)> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        let dir = dir.trim();
        if !dir.is_empty() {
            let expanded = shellexpand::tilde(dir).into_owned();
            return Ok((PathBuf::from(expanded), CONFIG_DIR_ENV));
        }
    }
    Ok((default_config_dir()?, "default"))
}

fn config_dir_creation_error(path: &Path) -> String {
    format!(
        "Failed to create config directory: {}. Set {CONFIG_DIR_ENV} or --config-dir \
         to a writable location.",
        path.display()
    )
}

fn is_http_url(raw: &str) -> bool {
    reqwest::Url::parse(raw)
        .ok()
        .is_some_and(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
}

impl Config {
    pub async fn load_or_init() -> Result<Self> {
        let (config_dir, source) = resolve_config_dir()?;
        let config = Self::load_from_dir(&config_dir).await?;
        tracing::info!(
            path = %config.config_path.display(),
            backend = %config.storage.backend,
            source,
            "Config loaded"
        );
        Ok(config)
    }

    /// Load `config.toml` from `config_dir`, writing defaults when it is missing.
    pub async fn load_from_dir(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        fs::create_dir_all(config_dir)
            .await
            .with_context(|| config_dir_creation_error(config_dir))?;

        let mut config = if config_path.exists() {
            // Warn if config file is world-readable (may contain the remote API key)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = fs::metadata(&config_path).await {
                    if meta.permissions().mode() & 0o004 != 0 {
                        tracing::warn!(
                            "Config file {:?} is world-readable (mode {:o}). \
                             Consider restricting with: chmod 600 {:?}",
                            config_path,
                            meta.permissions().mode() & 0o777,
                            config_path,
                        );
                    }
                }
            }

            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_dir = config_dir.to_path_buf();
            config.config_path = config_path;
            config
        } else {
            let config = Config {
                config_dir: config_dir.to_path_buf(),
                config_path: config_path.clone(),
                ..Config::default()
            };
            config.save().await?;

            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};
                let _ = fs::set_permissions(&config_path, Permissions::from_mode(0o600)).await;
            }
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        // Storage
        let backend = self.storage.backend.trim();
        if !SUPPORTED_BACKENDS.contains(&backend) {
            anyhow::bail!(
                "storage.backend must be one of {} (got {backend:?})",
                SUPPORTED_BACKENDS.join(", ")
            );
        }
        if backend == "sqlite" && self.storage.sqlite_path.trim().is_empty() {
            anyhow::bail!("storage.sqlite_path must not be empty");
        }
        if self.storage.busy_timeout_ms == 0 {
            anyhow::bail!("storage.busy_timeout_ms must be greater than 0");
        }
        if self.storage.operation_timeout_secs == 0 {
            anyhow::bail!("storage.operation_timeout_secs must be greater than 0");
        }

        // Remote
        if let Some(endpoint) = self.remote.endpoint.as_deref() {
            if !endpoint.trim().is_empty() && !is_http_url(endpoint.trim()) {
                anyhow::bail!("remote.endpoint must be an http(s) URL (got {endpoint:?})");
            }
        }
        if self.remote.timeout_secs == 0 || self.remote.connect_timeout_secs == 0 {
            anyhow::bail!("remote.timeout_secs and remote.connect_timeout_secs must be greater than 0");
        }

        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        // Backend: SESSIONVAULT_BACKEND
        if let Some(backend) = non_empty("SESSIONVAULT_BACKEND") {
            self.storage.backend = backend.trim().to_ascii_lowercase();
        }

        // SQLite file: SESSIONVAULT_SQLITE_PATH
        if let Some(path) = non_empty("SESSIONVAULT_SQLITE_PATH") {
            self.storage.sqlite_path = path;
        }

        // Remote endpoint: SESSIONVAULT_REMOTE_ENDPOINT
        if let Some(endpoint) = non_empty("SESSIONVAULT_REMOTE_ENDPOINT") {
            self.remote.endpoint = Some(endpoint);
        }

        // Remote API key: SESSIONVAULT_REMOTE_API_KEY
        if let Some(key) = non_empty("SESSIONVAULT_REMOTE_API_KEY") {
            self.remote.api_key = Some(key);
        }
    }

    /// SQLite database path with `~` expanded and relative paths anchored at the config dir.
    pub fn resolved_sqlite_path(&self) -> PathBuf {
        let expanded = PathBuf::from(shellexpand::tilde(self.storage.sqlite_path.trim()).as_ref());
        if expanded.is_absolute() {
            expanded
        } else {
            self.config_dir.join(expanded)
        }
    }

    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(CONFIG_FILE_NAME);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
