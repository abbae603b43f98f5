pub mod connector;
pub mod message;
pub mod stream;
pub mod transcript;
pub mod turn;

pub use connector::{ProviderConnector, RigConnector};
pub use message::{Message, MessageId, Role};
pub use stream::{
    ModelParams, SnapshotStream, StreamConsumer, StreamFailure, StreamSnapshot, StreamTermination,
    StreamUpdate,
};
pub use transcript::{
    TranscriptError, TranscriptListener, TranscriptResult, TranscriptSnapshot, TranscriptStore,
};
pub use turn::{ChatNotice, ChatSession, TurnHandle, TurnOutcome, TurnState};
