use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use zova_client::{BackendConfig, DEFAULT_STREAM_SENTINEL, TraceChannelConfig};

use crate::ingest::DEFAULT_USAGE_MARKER_PATTERN;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/api";
pub const SETTINGS_DIRECTORY_NAME: &str = "zova-sync";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "ZOVA_";
pub const DEFAULT_PAGE_SIZE: usize = 30;
pub const MAX_PAGE_SIZE: usize = 200;
pub const DEFAULT_BATCH_DELIMITER: &str = "<|split|>";
pub const DEFAULT_BATCH_STAGGER_MS: u64 = 600;
pub const DEFAULT_LOAD_OLDER_THRESHOLD_PX: f32 = 48.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Every send opens a reply stream right away.
    #[default]
    Immediate,
    /// Sends queue locally until an explicit flush.
    Batched,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub endpoint: String,
    pub api_token: String,
    pub page_size: usize,
    pub delivery_mode: DeliveryMode,
    pub batch_delimiter: String,
    pub batch_stagger_ms: u64,
    pub stream_sentinel: String,
    pub usage_marker_pattern: String,
    /// Off by default; some renderers need a 1px jiggle to repaint after an anchor restore.
    pub scroll_nudge: bool,
    pub load_older_threshold_px: f32,
    pub trace_reconnect_initial_ms: u64,
    pub trace_reconnect_max_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_token: String::new(),
            page_size: DEFAULT_PAGE_SIZE,
            delivery_mode: DeliveryMode::Immediate,
            batch_delimiter: DEFAULT_BATCH_DELIMITER.to_string(),
            batch_stagger_ms: DEFAULT_BATCH_STAGGER_MS,
            stream_sentinel: DEFAULT_STREAM_SENTINEL.to_string(),
            usage_marker_pattern: DEFAULT_USAGE_MARKER_PATTERN.to_string(),
            scroll_nudge: false,
            load_older_threshold_px: DEFAULT_LOAD_OLDER_THRESHOLD_PX,
            trace_reconnect_initial_ms: 200,
            trace_reconnect_max_ms: 30_000,
            request_timeout_secs: 60,
        }
    }
}

impl SyncSettings {
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();

        self.endpoint = self.endpoint.trim().trim_end_matches('/').to_string();
        if self.endpoint.is_empty() {
            self.endpoint = defaults.endpoint;
        }
        self.api_token = self.api_token.trim().to_string();
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        if self.batch_delimiter.is_empty() {
            self.batch_delimiter = defaults.batch_delimiter;
        }
        if self.stream_sentinel.trim().is_empty() {
            self.stream_sentinel = defaults.stream_sentinel;
        }
        if self.usage_marker_pattern.trim().is_empty() {
            self.usage_marker_pattern = defaults.usage_marker_pattern;
        }
        if !self.load_older_threshold_px.is_finite() || self.load_older_threshold_px < 0.0 {
            self.load_older_threshold_px = defaults.load_older_threshold_px;
        }
        self.trace_reconnect_initial_ms = self.trace_reconnect_initial_ms.max(1);
        self.trace_reconnect_max_ms = self
            .trace_reconnect_max_ms
            .max(self.trace_reconnect_initial_ms);
        self.request_timeout_secs = self.request_timeout_secs.max(1);

        self
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.endpoint)
            .with_stream_sentinel(&self.stream_sentinel)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
    }

    pub fn trace_channel_config(&self) -> TraceChannelConfig {
        TraceChannelConfig {
            initial_backoff: Duration::from_millis(self.trace_reconnect_initial_ms),
            max_backoff: Duration::from_millis(self.trace_reconnect_max_ms),
            ..TraceChannelConfig::default()
        }
    }

    pub fn batch_stagger(&self) -> Duration {
        Duration::from_millis(self.batch_stagger_ms)
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<SyncSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".zova-sync"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
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

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<SyncSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: SyncSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> SyncSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        // Environment overrides win over the file, the file over defaults.
        let figment = Figment::from(Serialized::defaults(SyncSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<SyncSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                SyncSettings::default()
            }
        }
    }

    fn persist(&self, settings: &SyncSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
