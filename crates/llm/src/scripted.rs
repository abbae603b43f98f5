//! Deterministic provider that replays prepared fragment scripts.
//!
//! Each call to [`LlmProvider::stream_chat`] consumes the next queued script, so a
//! test (or an offline demo session) can describe several turns up front and later
//! inspect the requests the chat core actually sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::OptionExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::model::DEFAULT_DEEPSEEK_MODEL;
use super::provider::{
    Fragment, LlmProvider, ProviderResult, ProviderStreamHandle, ProviderWorker, ScriptedSnafu,
    StreamEvent, StreamRequest, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Fragment(Fragment),
    /// Ends the stream with a provider error.
    Fail(String),
    /// Blocks until the stream is cancelled.
    Hang,
    /// Closes the transport without a terminal event.
    Disconnect,
    Pause(Duration),
}

pub type Script = Vec<ScriptStep>;

/// Shorthand for a script made of answer-only fragments.
pub fn text_script<I, S>(chunks: I) -> Script
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    chunks
        .into_iter()
        .map(|chunk| ScriptStep::Fragment(Fragment::text(chunk)))
        .collect()
}

#[derive(Default)]
struct ScriptedState {
    scripts: VecDeque<Script>,
    requests: Vec<StreamRequest>,
}

#[derive(Clone, Default)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ScriptedState>>,
}

impl ScriptedProvider {
    pub fn new<I>(scripts: I) -> Self
    where
        I: IntoIterator<Item = Script>,
    {
        Self {
            state: Arc::new(Mutex::new(ScriptedState {
                scripts: scripts.into_iter().collect(),
                requests: Vec::new(),
            })),
        }
    }

    pub fn push_script(&self, script: Script) {
        if let Ok(mut state) = self.state.lock() {
            state.scripts.push_back(script);
        }
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.state
            .lock()
            .map(|state| state.requests.clone())
            .unwrap_or_default()
    }

    fn next_script(&self, request: &StreamRequest) -> ProviderResult<Script> {
        let mut state = self.state.lock().map_err(|_| {
            ScriptedSnafu {
                stage: "scripted-lock-state",
                message: "scripted provider state is poisoned",
            }
            .build()
        })?;
        state.requests.push(request.clone());
        let request_number = state.requests.len();
        state.scripts.pop_front().context(ScriptedSnafu {
            stage: "scripted-next-script",
            message: format!("no script queued for request #{request_number}"),
        })
    }

    async fn run_script(
        script: Script,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        for step in script {
            if cancel.is_cancelled() {
                return;
            }

            match step {
                ScriptStep::Fragment(fragment) => {
                    if event_tx.send(StreamEvent::Fragment(fragment)).is_err() {
                        return;
                    }
                    // Give the consumer a chance to observe each fragment separately.
                    tokio::task::yield_now().await;
                }
                ScriptStep::Fail(message) => {
                    let _ = event_tx.send(StreamEvent::Error(message));
                    return;
                }
                ScriptStep::Hang => {
                    cancel.cancelled().await;
                    return;
                }
                ScriptStep::Disconnect => return,
                ScriptStep::Pause(duration) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
            }
        }

        if !cancel.is_cancelled() {
            let _ = event_tx.send(StreamEvent::Done);
        }
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        DEFAULT_DEEPSEEK_MODEL
    }

    fn stream_chat(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ProviderStreamHandle> {
        let script = self.next_script(&request)?;
        let (event_tx, stream, worker_cancel) = make_event_stream(&cancel);
        let worker: ProviderWorker = Box::pin(Self::run_script(script, event_tx, worker_cancel));
        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, ProviderMessage, Role};

    fn request() -> StreamRequest {
        StreamRequest::new(
            DEFAULT_DEEPSEEK_MODEL,
            vec![ProviderMessage::new(Role::User, "Hi")],
        )
    }

    #[tokio::test]
    async fn replays_fragments_then_done() {
        let provider = ScriptedProvider::new([text_script(["He", "llo"])]);
        let handle = provider
            .stream_chat(request(), CancellationToken::new())
            .expect("script queued");
        let mut stream = handle.stream;
        tokio::spawn(handle.worker);

        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::Fragment(Fragment::text("He")))
        );
        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::Fragment(Fragment::text("llo")))
        );
        assert_eq!(stream.recv().await, Some(StreamEvent::Done));
        assert_eq!(stream.recv().await, None);
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test]
    async fn hang_ends_silently_on_cancel() {
        let provider = ScriptedProvider::new([vec![ScriptStep::Hang]]);
        let cancel = CancellationToken::new();
        let handle = provider
            .stream_chat(request(), cancel.clone())
            .expect("script queued");
        let mut stream = handle.stream;
        let worker = tokio::spawn(handle.worker);

        cancel.cancel();
        worker.await.expect("worker finished");

        assert_eq!(stream.recv().await, None);
    }

    #[test]
    fn exhausted_queue_is_an_error() {
        let provider = ScriptedProvider::default();
        let error = provider
            .stream_chat(request(), CancellationToken::new())
            .err()
            .expect("no script queued");
        assert!(matches!(error, ProviderError::Scripted { .. }));
        assert_eq!(provider.requests().len(), 1);
    }
}
