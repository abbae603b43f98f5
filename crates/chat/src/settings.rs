use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parlor_llm::{
    DEEPSEEK_PROVIDER_ID, DEFAULT_DEEPSEEK_ENDPOINT, DEFAULT_DEEPSEEK_MODEL, ProviderConfig,
    resolve_model, supports_deep_think,
};
use parlor_storage::{JsonFileStore, KeyValueStore, MemoryStore, SqliteStore};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::chat::stream::ModelParams;
use crate::error::{ChatResult, OpenStorageSnafu};

pub const CONFIG_DIRECTORY_NAME: &str = "parlor";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const ENV_PREFIX: &str = "PARLOR_";
/// Environment variables consulted, in order, when no API key has been saved.
pub const API_KEY_ENV_VARS: [&str; 2] = ["PARLOR_API_KEY", "DEEPSEEK_API_KEY"];

/// User-editable settings, read as an immutable snapshot at turn start.
#[derive(Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_key: String,
    pub model_name: String,
    pub deep_think_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model_name: DEFAULT_DEEPSEEK_MODEL.to_string(),
            deep_think_enabled: false,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Settings")
            .field("api_key", &if self.has_api_key() { "<redacted>" } else { "<unset>" })
            .field("model_name", &self.model_name)
            .field("deep_think_enabled", &self.deep_think_enabled)
            .finish()
    }
}

impl Settings {
    pub fn new(api_key: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model_name: model_name.into(),
            deep_think_enabled: false,
        }
        .normalized()
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Picking a model without a reasoning variant switches deep think off.
    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self.normalized()
    }

    pub fn with_deep_think(mut self, enabled: bool) -> Self {
        self.deep_think_enabled = enabled;
        self.normalized()
    }

    pub fn can_deep_think(&self) -> bool {
        supports_deep_think(&self.model_name)
    }

    /// Model actually requested from the provider.
    pub fn effective_model(&self) -> String {
        resolve_model(&self.model_name, self.deep_think_enabled)
    }

    pub fn normalized(mut self) -> Self {
        self.api_key = self.api_key.trim().to_string();
        self.model_name = match self.model_name.trim() {
            "" => DEFAULT_DEEPSEEK_MODEL.to_string(),
            name => name.to_string(),
        };
        self.deep_think_enabled = self.deep_think_enabled && supports_deep_think(&self.model_name);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Json,
    Sqlite,
}

/// Deployment configuration layered from defaults, `config.json` and `PARLOR_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub storage: StorageBackend,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub preamble: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            endpoint: default_endpoint(),
            default_model: default_model(),
            storage: StorageBackend::default(),
            data_dir: None,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

impl AppConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parlor"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        Self::from_figment(
            Figment::from(Serialized::defaults(AppConfig::default()))
                .merge(Json::file(path))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    /// Extracts a config, falling back to defaults when the layers do not parse.
    pub fn from_figment(figment: Figment) -> Self {
        match figment.extract::<AppConfig>() {
            Ok(config) => config.normalized(),
            Err(error) => {
                tracing::warn!("failed to parse configuration: {}. using defaults", error);
                AppConfig::default()
            }
        }
    }

    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.endpoint = non_blank_or(self.endpoint, default_endpoint);
        self.default_model = non_blank_or(self.default_model, default_model);
        self.preamble = self
            .preamble
            .map(|preamble| preamble.trim().to_string())
            .filter(|preamble| !preamble.is_empty());
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|path| path.join(CONFIG_DIRECTORY_NAME))
                .unwrap_or_else(|| PathBuf::from(".parlor"))
        })
    }

    pub fn provider_config(&self, settings: &Settings) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &settings.api_key, &self.endpoint)
    }

    pub fn model_params(&self, settings: &Settings) -> ModelParams {
        ModelParams {
            model_id: settings.effective_model(),
            preamble: self.preamble.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    /// Opens the configured key-value backend under [`AppConfig::data_dir`].
    pub async fn open_store(&self) -> ChatResult<Arc<dyn KeyValueStore>> {
        let data_dir = self.data_dir();
        let store: Arc<dyn KeyValueStore> = match self.storage {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::Json => Arc::new(JsonFileStore::new(data_dir.join("store.json"))),
            StorageBackend::Sqlite => {
                let location = data_dir.join("parlor.db");
                Arc::new(
                    SqliteStore::open(&location.display().to_string())
                        .await
                        .context(OpenStorageSnafu {
                            stage: "open-sqlite-store",
                        })?,
                )
            }
        };
        tracing::info!(backend = ?self.storage, data_dir = %data_dir.display(), "opened key-value store");
        Ok(store)
    }
}

/// Current settings snapshot; swapped wholesale on every change.
pub struct SettingsStore {
    current: ArcSwap<Settings>,
}

impl SettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: ArcSwap::from_pointee(settings.normalized()),
        }
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    pub fn replace(&self, settings: Settings) -> Arc<Settings> {
        let settings = Arc::new(settings.normalized());
        self.current.store(settings.clone());
        settings
    }

    pub fn modify<F>(&self, apply: F) -> Arc<Settings>
    where
        F: Fn(Settings) -> Settings,
    {
        self.current
            .rcu(|current| Arc::new(apply(Settings::clone(current)).normalized()));
        self.current.load_full()
    }
}

/// First non-blank API key found in [`API_KEY_ENV_VARS`].
pub fn api_key_from_env() -> Option<String> {
    API_KEY_ENV_VARS.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    match value.trim() {
        "" => fallback(),
        trimmed => trimmed.to_string(),
    }
}

fn default_provider_id() -> String {
    DEEPSEEK_PROVIDER_ID.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_DEEPSEEK_ENDPOINT.to_string()
}

fn default_model() -> String {
    DEFAULT_DEEPSEEK_MODEL.to_string()
}
