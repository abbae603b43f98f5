use std::sync::Arc;

use parlor_llm::{
    FragmentKind, LlmProvider, ProviderError, ProviderEventStream, ProviderMessage, StreamEvent,
    StreamRequest,
};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;

/// Model parameters captured from the settings snapshot at turn start.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub model_id: String,
    pub preamble: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl ModelParams {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            preamble: None,
            temperature: None,
            max_tokens: None,
        }
    }

    fn into_request(self, history: Vec<ProviderMessage>) -> StreamRequest {
        let mut request = StreamRequest::new(self.model_id, history);
        if let Some(preamble) = self.preamble {
            request = request.with_preamble(preamble);
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }
}

/// Full accumulated text of both channels, never a delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub reasoning: String,
    pub answer: String,
}

impl StreamSnapshot {
    pub fn new(reasoning: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            reasoning: reasoning.into(),
            answer: answer.into(),
        }
    }

    /// Reasoning as stored on a message: absent until the first reasoning fragment.
    pub fn reasoning_field(&self) -> Option<String> {
        if self.reasoning.is_empty() {
            None
        } else {
            Some(self.reasoning.clone())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdate {
    pub snapshot: StreamSnapshot,
    /// Set on the flush emitted after the provider reported completion.
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTermination {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StreamFailure {
    #[snafu(display("failed to open completion stream on `{stage}`: {source}"))]
    OpenStream {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("provider reported an error on `{stage}`: {reason}"))]
    Provider { stage: &'static str, reason: String },
    #[snafu(display("provider stream ended before a terminal event on `{stage}`"))]
    TransportClosed { stage: &'static str },
}

/// Turns provider fragments into accumulated snapshots.
#[derive(Clone)]
pub struct StreamConsumer {
    provider: Arc<dyn LlmProvider>,
}

impl StreamConsumer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Prepares a stream. Nothing is sent to the provider until the first `next()`.
    pub fn start(
        &self,
        history: Vec<ProviderMessage>,
        params: ModelParams,
        cancel: CancellationToken,
    ) -> SnapshotStream {
        SnapshotStream {
            phase: Phase::Pending {
                provider: self.provider.clone(),
                request: params.into_request(history),
            },
            cancel,
            accumulated: StreamSnapshot::default(),
        }
    }
}

enum Phase {
    Pending {
        provider: Arc<dyn LlmProvider>,
        request: StreamRequest,
    },
    Open(ProviderEventStream),
    Finished(StreamTermination),
}

/// Finite, non-restartable sequence of [`StreamUpdate`]s for one turn.
pub struct SnapshotStream {
    phase: Phase,
    cancel: CancellationToken,
    accumulated: StreamSnapshot,
}

impl SnapshotStream {
    /// Next snapshot, `Some(Err(..))` once on failure, or `None` when the stream is over.
    ///
    /// Cancellation ends the sequence with `None`; it is never reported as an error.
    pub async fn next(&mut self) -> Option<Result<StreamUpdate, StreamFailure>> {
        if matches!(self.phase, Phase::Pending { .. })
            && let Err(failure) = self.open()
        {
            return Some(Err(failure));
        }

        loop {
            let Phase::Open(events) = &mut self.phase else {
                return None;
            };

            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                event = events.recv() => Some(event),
            };

            let Some(event) = event else {
                self.finish_cancelled();
                return None;
            };

            match event {
                Some(StreamEvent::Fragment(fragment)) => {
                    if self.cancel.is_cancelled() {
                        self.finish_cancelled();
                        return None;
                    }
                    let target = match fragment.kind {
                        FragmentKind::Reasoning => &mut self.accumulated.reasoning,
                        FragmentKind::Text => &mut self.accumulated.answer,
                        FragmentKind::Unrecognized(kind) => {
                            tracing::debug!(kind, "ignoring unrecognized stream fragment");
                            continue;
                        }
                    };
                    if fragment.text.is_empty() {
                        continue;
                    }
                    target.push_str(&fragment.text);
                    return Some(Ok(StreamUpdate {
                        snapshot: self.accumulated.clone(),
                        is_final: false,
                    }));
                }
                Some(StreamEvent::Done) => {
                    if self.cancel.is_cancelled() {
                        self.finish_cancelled();
                        return None;
                    }
                    self.finish(StreamTermination::Completed);
                    return Some(Ok(StreamUpdate {
                        snapshot: self.accumulated.clone(),
                        is_final: true,
                    }));
                }
                Some(StreamEvent::Error(reason)) => {
                    if self.cancel.is_cancelled() {
                        self.finish_cancelled();
                        return None;
                    }
                    tracing::warn!(error = %reason, "completion stream failed");
                    self.finish(StreamTermination::Failed);
                    return Some(
                        ProviderSnafu {
                            stage: "stream-provider-error",
                            reason,
                        }
                        .fail(),
                    );
                }
                None => {
                    if self.cancel.is_cancelled() {
                        self.finish_cancelled();
                        return None;
                    }
                    tracing::warn!("completion stream closed without a terminal event");
                    self.finish(StreamTermination::Failed);
                    return Some(
                        TransportClosedSnafu {
                            stage: "stream-transport-closed",
                        }
                        .fail(),
                    );
                }
            }
        }
    }

    /// How the sequence ended, once it has.
    pub fn termination(&self) -> Option<StreamTermination> {
        match self.phase {
            Phase::Finished(termination) => Some(termination),
            _ => None,
        }
    }

    /// Text accumulated so far.
    pub fn accumulated(&self) -> &StreamSnapshot {
        &self.accumulated
    }

    fn open(&mut self) -> Result<(), StreamFailure> {
        let phase = std::mem::replace(&mut self.phase, Phase::Finished(StreamTermination::Failed));
        let (provider, request) = match phase {
            Phase::Pending { provider, request } => (provider, request),
            other => {
                self.phase = other;
                return Ok(());
            }
        };

        if self.cancel.is_cancelled() {
            self.phase = Phase::Finished(StreamTermination::Cancelled);
            return Ok(());
        }

        let model_id = request.model_id.clone();
        tracing::info!(
            provider = provider.id(),
            model_id = %model_id,
            messages = request.messages.len(),
            "opening completion stream"
        );

        let handle = provider
            .stream_chat(request, self.cancel.clone())
            .inspect_err(|error| {
                tracing::warn!(model_id = %model_id, error = %error, "failed to open completion stream");
            })
            .context(OpenStreamSnafu {
                stage: "stream-open",
            })?;

        tokio::spawn(handle.worker);
        self.phase = Phase::Open(handle.stream);
        Ok(())
    }

    fn finish_cancelled(&mut self) {
        tracing::info!("completion stream cancelled");
        self.finish(StreamTermination::Cancelled);
    }

    fn finish(&mut self, termination: StreamTermination) {
        if let Phase::Open(mut events) =
            std::mem::replace(&mut self.phase, Phase::Finished(termination))
        {
            events.cancel();
        }
    }
}

impl Drop for SnapshotStream {
    fn drop(&mut self) {
        if let Phase::Open(events) = &mut self.phase {
            events.cancel();
        }
    }
}
