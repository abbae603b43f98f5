use parlor_storage::StorageError;
use snafu::Snafu;

use crate::chat::transcript::TranscriptError;

pub type ChatResult<T> = Result<T, ChatError>;
pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    /// Missing or unusable credentials. The UI should open the settings prompt.
    #[snafu(display("provider is not configured on `{stage}`: {details}"))]
    Configuration {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("a turn is already in progress on `{stage}`"))]
    ConcurrentTurn { stage: &'static str },
    #[snafu(display("nothing to regenerate on `{stage}`: {details}"))]
    RegenerateUnavailable {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("refusing to send an empty prompt on `{stage}`"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("transcript mutation failed on `{stage}`: {source}"))]
    Transcript {
        stage: &'static str,
        source: TranscriptError,
    },
    #[snafu(display("persistence failed on `{stage}`: {source}"))]
    Persistence {
        stage: &'static str,
        source: PersistenceError,
    },
    #[snafu(display("failed to open storage on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        source: StorageError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PersistenceError {
    #[snafu(display("key-value store failed on `{stage}` for key `{key}`: {source}"))]
    Store {
        stage: &'static str,
        key: &'static str,
        source: StorageError,
    },
    #[snafu(display("failed to encode transcript on `{stage}`: {source}"))]
    EncodeTranscript {
        stage: &'static str,
        source: serde_json::Error,
    },
}
