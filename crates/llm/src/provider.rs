use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// Speaker role as seen by the completion provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Channel tag of one streamed fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Reasoning,
    Text,
    /// Provider content the chat core does not render (tool calls, usage, ...).
    Unrecognized(&'static str),
}

/// One incremental unit of provider output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub text: String,
}

impl Fragment {
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            kind: FragmentKind::Reasoning,
            text: text.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: FragmentKind::Text,
            text: text.into(),
        }
    }

    pub fn unrecognized(kind: &'static str) -> Self {
        Self {
            kind: FragmentKind::Unrecognized(kind),
            text: String::new(),
        }
    }
}

/// Events delivered from a provider worker to its [`ProviderEventStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Fragment(Fragment),
    Done,
    Error(String),
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for model '{model_id}' has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("scripted provider failed on `{stage}`: {message}"))]
    Scripted {
        stage: &'static str,
        message: String,
    },
}

pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: Option<DropGuard>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(events: mpsc::UnboundedReceiver<StreamEvent>, cancel: DropGuard) -> Self {
        Self {
            events,
            cancel: Some(cancel),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Stops the worker. Returns false when it was already stopped.
    pub fn cancel(&mut self) -> bool {
        self.cancel
            .take()
            .map(|guard| {
                let token = guard.disarm();
                let was_live = !token.is_cancelled();
                token.cancel();
                was_live
            })
            .unwrap_or(false)
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    /// Opens one streaming completion. The returned worker must be spawned by the
    /// caller; it stops when `cancel` fires or the event stream is dropped.
    fn stream_chat(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ProviderStreamHandle>;
}

/// Wires a worker channel whose cancellation is a child of `cancel`, so dropping the
/// event stream stops the worker without cancelling the caller's token.
pub(crate) fn make_event_stream(
    cancel: &CancellationToken,
) -> (
    mpsc::UnboundedSender<StreamEvent>,
    ProviderEventStream,
    CancellationToken,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let worker_cancel = cancel.child_token();
    let guard = worker_cancel.clone().drop_guard();
    (
        event_tx,
        ProviderEventStream::new(event_rx, guard),
        worker_cancel,
    )
}
