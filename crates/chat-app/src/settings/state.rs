use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use trickle_llm::{Backoff, DEFAULT_STREAM_DURATION_SECS, DispatcherConfig};

use crate::chat::DEFAULT_STORAGE_KEY;

pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000";
pub const SETTINGS_DIRECTORY_NAME: &str = "trickle";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SQLITE_FILE_NAME: &str = "messages.db";
pub const CONFIG_PATH_ENV: &str = "TRICKLE_CONFIG";
pub const ENV_PREFIX: &str = "TRICKLE_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Simulated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Memory,
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    #[serde(default = "default_true")]
    pub jitter: bool,
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            exponential_backoff: true,
            jitter: true,
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

impl DispatchSettings {
    pub fn to_dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            backoff: if self.exponential_backoff {
                Backoff::Exponential
            } else {
                Backoff::Fixed
            },
            jitter: self.jitter,
            jitter_max: Duration::from_millis(self.jitter_max_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackendKind,
    /// Directory for the file backend, database file for sqlite.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_storage_key")]
    pub key: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            path: None,
            key: default_storage_key(),
        }
    }
}

impl StorageSettings {
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        let data_dir = dirs::data_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".trickle"));
        match self.backend {
            StorageBackendKind::Sqlite => data_dir.join(SQLITE_FILE_NAME),
            StorageBackendKind::Memory | StorageBackendKind::File => data_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Seconds the backend should spread each answer over.
    #[serde(default = "default_stream_duration_secs")]
    pub stream_duration_secs: f64,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            stream_duration_secs: default_stream_duration_secs(),
            transport: TransportKind::default(),
            dispatch: DispatchSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.api_base_url = match self.api_base_url.trim().trim_end_matches('/') {
            "" => default_api_base_url(),
            url => url.to_string(),
        };
        if !self.stream_duration_secs.is_finite() || self.stream_duration_secs < 0.0 {
            self.stream_duration_secs = default_stream_duration_secs();
        }
        self.storage.key = match self.storage.key.trim() {
            "" => default_storage_key(),
            key => key.to_string(),
        };
        self.storage.path = self
            .storage
            .path
            .take()
            .filter(|path| !path.as_os_str().is_empty());

        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".trickle"))
    }

    /// `$TRICKLE_CONFIG` when set, the user config directory otherwise.
    pub fn default_config_path() -> PathBuf {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => Self::default_config_dir().join(SETTINGS_FILE_NAME),
        }
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Changes one field, addressed as `dispatch.max_retries`, and saves.
    pub fn set_field(&self, key: &str, raw: &str) -> Result<Arc<AppSettings>, SettingsError> {
        let settings = with_field(&self.settings(), key, raw)?;
        self.update(settings)?;
        Ok(self.settings())
    }

    /// Re-reads the file and environment, keeping the result in place.
    pub fn reload(&self) -> Arc<AppSettings> {
        let settings = Arc::new(Self::load_from_disk(&self.config_path));
        self.settings.store(Arc::clone(&settings));
        settings
    }

    fn load_from_disk(path: &Path) -> AppSettings {
        let mut figment = Figment::from(Serialized::defaults(AppSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<AppSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                AppSettings::default()
            }
        }
    }

    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        let content = serde_json::to_string_pretty(settings).context(EncodeSettingsSnafu {
            stage: "settings-persist-encode",
        })?;
        write_replacing(&self.config_path, &content)?;
        tracing::info!(path = ?self.config_path, "settings saved");
        Ok(())
    }
}

/// Writes next to `path` first so readers never see a half-written file.
fn write_replacing(path: &Path, content: &str) -> Result<(), SettingsError> {
    if let Some(directory) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(directory).context(CreateConfigDirSnafu {
            stage: "settings-create-directory",
            path: directory.to_path_buf(),
        })?;
    }

    let staged = path.with_extension("json.tmp");
    std::fs::write(&staged, content).context(WriteStagedSnafu {
        stage: "settings-write-staged",
        path: staged.clone(),
    })?;
    std::fs::rename(&staged, path).context(ReplaceConfigSnafu {
        stage: "settings-replace-file",
        path: path.to_path_buf(),
    })
}

/// Returns `settings` with the field at the dotted `key` replaced by `raw`.
///
/// `raw` is read as JSON when it parses (`5`, `true`, `"x"`) and as a plain
/// string otherwise, so `/set transport simulated` works unquoted.
fn with_field(
    settings: &AppSettings,
    key: &str,
    raw: &str,
) -> Result<AppSettings, SettingsError> {
    let mut document = serde_json::to_value(settings).context(EncodeSettingsSnafu {
        stage: "settings-field-encode",
    })?;

    let mut slot = &mut document;
    for segment in key.split('.') {
        slot = slot
            .as_object_mut()
            .and_then(|object| object.get_mut(segment))
            .context(UnknownFieldSnafu {
                stage: "settings-field-lookup",
                key,
            })?;
    }
    ensure!(
        !slot.is_object(),
        UnknownFieldSnafu {
            stage: "settings-field-lookup",
            key,
        }
    );
    *slot = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));

    serde_json::from_value(document).context(InvalidFieldSnafu {
        stage: "settings-field-decode",
        key,
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create config directory {path:?} on `{stage}`: {source}"))]
    CreateConfigDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to encode settings on `{stage}`: {source}"))]
    EncodeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write {path:?} on `{stage}`: {source}"))]
    WriteStaged {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to move new settings into {path:?} on `{stage}`: {source}"))]
    ReplaceConfig {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("unknown setting `{key}`"))]
    UnknownField { stage: &'static str, key: String },
    #[snafu(display("invalid value for `{key}`: {source}"))]
    InvalidField {
        stage: &'static str,
        key: String,
        source: serde_json::Error,
    },
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_stream_duration_secs() -> f64 {
    DEFAULT_STREAM_DURATION_SECS
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}

fn default_debounce_ms() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    300
}

fn default_jitter_max_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}
