use std::sync::Arc;

use parlor_storage::KeyValueStore;
use snafu::ResultExt;
use tokio::sync::broadcast;

use crate::chat::message::Message;
use crate::chat::transcript::{TranscriptListener, TranscriptSnapshot};
use crate::chat::turn::ChatNotice;
use crate::error::{EncodeTranscriptSnafu, PersistenceResult, StoreSnafu};
use crate::settings::{AppConfig, Settings, api_key_from_env};

pub const HISTORY_KEY: &str = "llm-chat-history";
pub const API_KEY_KEY: &str = "llm-chat-api-key";
pub const MODEL_KEY: &str = "llm-chat-model";

/// Reads and writes chat state through a [`KeyValueStore`].
#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn KeyValueStore>,
    notices: Option<broadcast::Sender<ChatNotice>>,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            notices: None,
        }
    }

    /// Reports failed background saves as [`ChatNotice::PersistenceFailed`].
    pub fn with_notices(mut self, notices: broadcast::Sender<ChatNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Persisted transcript, or an empty one when nothing usable is stored.
    pub fn load_transcript(&self) -> PersistenceResult<Vec<Message>> {
        let Some(raw) = self.store.get(HISTORY_KEY).context(StoreSnafu {
            stage: "load-transcript",
            key: HISTORY_KEY,
        })?
        else {
            return Ok(Vec::new());
        };

        match serde_json::from_str::<Vec<Message>>(&raw) {
            Ok(messages) => Ok(messages),
            Err(error) => {
                tracing::warn!(key = HISTORY_KEY, error = %error, "discarding unreadable chat history");
                Ok(Vec::new())
            }
        }
    }

    /// Stores the transcript; an empty transcript removes the key.
    pub fn save_transcript(&self, messages: &[Message]) -> PersistenceResult<()> {
        if messages.is_empty() {
            return self.store.delete(HISTORY_KEY).context(StoreSnafu {
                stage: "clear-transcript",
                key: HISTORY_KEY,
            });
        }

        let encoded = serde_json::to_string(messages).context(EncodeTranscriptSnafu {
            stage: "encode-transcript",
        })?;
        self.store.set(HISTORY_KEY, &encoded).context(StoreSnafu {
            stage: "save-transcript",
            key: HISTORY_KEY,
        })
    }

    /// Saved settings, seeded from the environment and `config` where nothing is stored.
    pub fn load_settings(&self, config: &AppConfig) -> PersistenceResult<Settings> {
        let api_key = self
            .read_non_blank(API_KEY_KEY, "load-api-key")?
            .or_else(api_key_from_env)
            .unwrap_or_default();
        let model_name = self
            .read_non_blank(MODEL_KEY, "load-model")?
            .unwrap_or_else(|| config.default_model.clone());

        Ok(Settings::new(api_key, model_name))
    }

    /// Persists the API key and model. Deep think lives only in memory.
    pub fn save_settings(&self, settings: &Settings) -> PersistenceResult<()> {
        if settings.has_api_key() {
            self.store
                .set(API_KEY_KEY, settings.api_key.trim())
                .context(StoreSnafu {
                    stage: "save-api-key",
                    key: API_KEY_KEY,
                })?;
        } else {
            self.store.delete(API_KEY_KEY).context(StoreSnafu {
                stage: "clear-api-key",
                key: API_KEY_KEY,
            })?;
        }

        self.store
            .set(MODEL_KEY, &settings.model_name)
            .context(StoreSnafu {
                stage: "save-model",
                key: MODEL_KEY,
            })
    }

    fn read_non_blank(
        &self,
        key: &'static str,
        stage: &'static str,
    ) -> PersistenceResult<Option<String>> {
        Ok(self
            .store
            .get(key)
            .context(StoreSnafu { stage, key })?
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }
}

impl TranscriptListener for PersistenceBridge {
    fn transcript_changed(&self, snapshot: &TranscriptSnapshot) {
        if let Err(error) = self.save_transcript(snapshot) {
            tracing::warn!(messages = snapshot.len(), error = %error, "failed to persist transcript");
            if let Some(notices) = &self.notices {
                let _ = notices.send(ChatNotice::PersistenceFailed {
                    reason: error.to_string(),
                });
            }
        }
    }
}
