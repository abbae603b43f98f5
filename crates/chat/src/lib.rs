pub mod chat;
pub mod error;
pub mod persistence;
pub mod settings;

pub use chat::{
    ChatNotice, ChatSession, Message, MessageId, ProviderConnector, RigConnector, Role,
    TranscriptSnapshot, TranscriptStore, TurnHandle, TurnOutcome, TurnState,
};
pub use error::{ChatError, ChatResult, PersistenceError, PersistenceResult};
pub use persistence::{API_KEY_KEY, HISTORY_KEY, MODEL_KEY, PersistenceBridge};
pub use settings::{AppConfig, Settings, SettingsStore, StorageBackend};
