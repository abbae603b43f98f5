use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::{deepseek, openai};
use rig::streaming::{StreamedAssistantContent, StreamingCompletionResponse};
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::model::{DEFAULT_DEEPSEEK_MODEL, DEFAULT_OPENAI_MODEL};
use super::provider::{
    CompletionsFailedSnafu, EmptyMessageSetSnafu, Fragment, HttpClientSnafu, LlmProvider,
    MissingApiKeySnafu, ProviderConfig, ProviderError, ProviderMessage, ProviderResult,
    ProviderStreamHandle, ProviderWorker, Role, StreamEvent, StreamRequest, make_event_stream,
};

pub const DEEPSEEK_PROVIDER_ID: &str = "deepseek";
pub const OPENAI_PROVIDER_ID: &str = "openai";
pub const DEFAULT_DEEPSEEK_ENDPOINT: &str = "https://api.deepseek.com";
pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";

/// Hosted API family a [`RigProviderAdapter`] talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigFlavor {
    DeepSeek,
    OpenAi,
}

impl RigFlavor {
    pub fn from_provider_id(provider_id: &str) -> Option<Self> {
        match provider_id.trim() {
            "" | "deepseek" | "rig-deepseek" => Some(Self::DeepSeek),
            "openai" | "rig-openai" => Some(Self::OpenAi),
            _ => None,
        }
    }

    pub fn provider_id(self) -> &'static str {
        match self {
            Self::DeepSeek => DEEPSEEK_PROVIDER_ID,
            Self::OpenAi => OPENAI_PROVIDER_ID,
        }
    }

    pub fn default_endpoint(self) -> &'static str {
        match self {
            Self::DeepSeek => DEFAULT_DEEPSEEK_ENDPOINT,
            Self::OpenAi => DEFAULT_OPENAI_ENDPOINT,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::DeepSeek => DEFAULT_DEEPSEEK_MODEL,
            Self::OpenAi => DEFAULT_OPENAI_MODEL,
        }
    }
}

pub struct RigProviderAdapter {
    config: ProviderConfig,
    flavor: RigFlavor,
}

impl RigProviderAdapter {
    pub fn new(mut config: ProviderConfig, flavor: RigFlavor) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        config.provider_id = flavor.provider_id().to_string();
        if config.endpoint.is_empty() {
            config.endpoint = flavor.default_endpoint().to_string();
        }

        Ok(Self { config, flavor })
    }

    pub fn flavor(&self) -> RigFlavor {
        self.flavor
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn deepseek_client(config: &ProviderConfig) -> ProviderResult<deepseek::Client> {
        deepseek::Client::builder()
            .api_key(config.api_key.as_str())
            .base_url(config.endpoint.as_str())
            .build()
            .context(HttpClientSnafu {
                stage: "build-deepseek-client",
            })
    }

    fn openai_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        openai::Client::builder()
            .api_key(config.api_key.as_str())
            .base_url(config.endpoint.as_str())
            .build()
            .context(HttpClientSnafu {
                stage: "build-openai-client",
            })
    }

    fn to_rig_message(message: &ProviderMessage) -> RigMessage {
        match message.role {
            Role::User => RigMessage::user(message.content.clone()),
            Role::Assistant => RigMessage::assistant(message.content.clone()),
        }
    }

    async fn open_stream<M>(
        model: M,
        request: &StreamRequest,
    ) -> ProviderResult<StreamingCompletionResponse<M::StreamingResponse>>
    where
        M: CompletionModel,
    {
        let mut messages = request
            .messages
            .iter()
            .map(Self::to_rig_message)
            .collect::<Vec<_>>();

        // The last history entry is the prompt; everything before it is chat history.
        let Some(prompt) = messages.pop() else {
            tracing::error!(
                model_id = %request.model_id,
                "message list became empty before prompt extraction"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-pop-prompt",
                model_id: request.model_id.clone(),
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = request
            .preamble
            .as_ref()
            .filter(|preamble| !preamble.trim().is_empty())
        {
            builder = builder.preamble(preamble.clone());
        }

        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }

        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn emit_error_event(event_tx: &mpsc::UnboundedSender<StreamEvent>, error: ProviderError) {
        let _ = event_tx.send(StreamEvent::Error(error.to_string()));
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<Fragment>
    where
        R: Clone + Unpin,
    {
        let fragment = match item {
            StreamedAssistantContent::Text(text) => Fragment::text(text.text),
            StreamedAssistantContent::Reasoning(reasoning) => {
                // Rig can split reasoning into multiple fragments; flatten before forwarding.
                let text = reasoning.reasoning.join("");
                if text.is_empty() {
                    return None;
                }
                Fragment::reasoning(text)
            }
            StreamedAssistantContent::ReasoningDelta { reasoning, .. } => {
                if reasoning.is_empty() {
                    return None;
                }
                Fragment::reasoning(reasoning)
            }
            StreamedAssistantContent::Final(_) => Fragment::unrecognized("final"),
            _ => Fragment::unrecognized("tool-call"),
        };

        Some(fragment)
    }

    async fn run_stream_worker<M>(
        model: M,
        provider_id: String,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: CancellationToken,
    ) where
        M: CompletionModel,
    {
        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(model_id = %request.model_id, "stream cancelled before it opened");
                return;
            }
            opened = Self::open_stream(model, &request) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    provider_id = %provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, error);
                return;
            }
        };

        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    // Cancel the upstream Rig stream so provider IO stops promptly.
                    tracing::debug!(model_id = %request.model_id, "provider stream cancelled");
                    stream.cancel();
                    break;
                }
                next_item = stream.next() => {
                    match next_item {
                        Some(Ok(item)) => {
                            if let Some(fragment) = Self::map_stream_item(item)
                                && event_tx.send(StreamEvent::Fragment(fragment)).is_err()
                            {
                                return;
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                model_id = %request.model_id,
                                error = %source,
                                "provider stream emitted an error chunk"
                            );
                            let error = ProviderError::CompletionsFailed {
                                stage: "stream-chunk",
                                source,
                            };
                            Self::emit_error_event(&event_tx, error);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEvent::Done);
        }
    }
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        match self.flavor {
            RigFlavor::DeepSeek => "Rig DeepSeek",
            RigFlavor::OpenAi => "Rig OpenAI",
        }
    }

    fn default_model(&self) -> &str {
        self.flavor.default_model()
    }

    fn stream_chat(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                model_id: request.model_id.clone(),
            }
        );

        let provider_id = self.config.provider_id.clone();
        let (event_tx, stream, worker_cancel) = make_event_stream(&cancel);
        let worker: ProviderWorker = match self.flavor {
            RigFlavor::DeepSeek => {
                let model = Self::deepseek_client(&self.config)?
                    .completion_model(request.model_id.clone());
                Box::pin(Self::run_stream_worker(
                    model,
                    provider_id,
                    request,
                    event_tx,
                    worker_cancel,
                ))
            }
            RigFlavor::OpenAi => {
                let model = Self::openai_client(&self.config)?
                    .completion_model(request.model_id.clone());
                Box::pin(Self::run_stream_worker(
                    model,
                    provider_id,
                    request,
                    event_tx,
                    worker_cancel,
                ))
            }
        };

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use rig::message::Reasoning;
    use rig::streaming::ToolCallDeltaContent;

    use super::*;

    type Content = StreamedAssistantContent<()>;

    fn map(item: Content) -> Option<Fragment> {
        RigProviderAdapter::map_stream_item(item)
    }

    #[test]
    fn text_chunks_become_text_fragments() {
        assert_eq!(map(Content::text("Hel")), Some(Fragment::text("Hel")));
    }

    #[test]
    fn split_reasoning_is_joined_into_one_fragment() {
        let reasoning = Reasoning::multi(vec!["think".to_string(), "ing".to_string()]);
        assert_eq!(
            map(Content::Reasoning(reasoning)),
            Some(Fragment::reasoning("thinking"))
        );
        assert_eq!(map(Content::Reasoning(Reasoning::multi(Vec::new()))), None);
    }

    #[test]
    fn empty_reasoning_deltas_are_dropped() {
        let delta = |text: &str| Content::ReasoningDelta {
            id: None,
            reasoning: text.to_string(),
        };
        assert_eq!(map(delta("")), None);
        assert_eq!(map(delta("hmm")), Some(Fragment::reasoning("hmm")));
    }

    #[test]
    fn final_and_tool_chunks_are_unrecognized() {
        assert_eq!(
            map(Content::final_response(())),
            Some(Fragment::unrecognized("final"))
        );

        let tool_delta = Content::ToolCallDelta {
            id: "call-1".to_string(),
            internal_call_id: "internal-1".to_string(),
            content: ToolCallDeltaContent::Name("search".to_string()),
        };
        assert_eq!(map(tool_delta), Some(Fragment::unrecognized("tool-call")));
    }

    #[test]
    fn flavor_resolves_known_provider_ids() {
        assert_eq!(RigFlavor::from_provider_id(""), Some(RigFlavor::DeepSeek));
        assert_eq!(RigFlavor::from_provider_id("deepseek"), Some(RigFlavor::DeepSeek));
        assert_eq!(RigFlavor::from_provider_id(" openai "), Some(RigFlavor::OpenAi));
        assert_eq!(RigFlavor::from_provider_id("anthropic"), None);
    }

    #[test]
    fn adapter_requires_api_key() {
        let config = ProviderConfig::new("deepseek", "  ", "");
        let error = RigProviderAdapter::new(config, RigFlavor::DeepSeek)
            .err()
            .expect("missing key must be rejected");
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));
    }

    #[test]
    fn adapter_fills_default_endpoint() {
        let config = ProviderConfig::new("rig-deepseek", "sk-test", "");
        let adapter = RigProviderAdapter::new(config, RigFlavor::DeepSeek).expect("adapter");
        assert_eq!(adapter.id(), DEEPSEEK_PROVIDER_ID);
        assert_eq!(adapter.flavor(), RigFlavor::DeepSeek);
        assert_eq!(adapter.endpoint(), DEFAULT_DEEPSEEK_ENDPOINT);
        assert_eq!(adapter.default_model(), DEFAULT_DEEPSEEK_MODEL);
    }

    #[test]
    fn stream_chat_rejects_empty_history() {
        let config = ProviderConfig::new("deepseek", "sk-test", "");
        let adapter = RigProviderAdapter::new(config, RigFlavor::DeepSeek).expect("adapter");
        let request = StreamRequest::new(DEFAULT_DEEPSEEK_MODEL, Vec::new());

        let error = adapter
            .stream_chat(request, CancellationToken::new())
            .err()
            .expect("empty history must be rejected");
        assert!(matches!(error, ProviderError::EmptyMessageSet { .. }));
    }
}
