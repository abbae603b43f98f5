//! Turn coordination for one conversation.
//!
//! [`ChatSession`] is the surface a front end drives: it owns the transcript, the
//! settings snapshot and the single active turn. A turn moves through
//! `Idle -> Sending -> Streaming -> {Completed, Cancelled, Failed} -> Idle`.
//!
//! Snapshot writes and `stop()` both go through the active-turn slot, so once a turn
//! has been stopped no late snapshot can touch the transcript.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use parlor_llm::{LlmProvider, ProviderMessage};
use parlor_storage::KeyValueStore;
use snafu::{ResultExt, ensure};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connector::ProviderConnector;
use super::message::{Message, MessageId};
use super::stream::{ModelParams, SnapshotStream, StreamConsumer, StreamSnapshot, StreamTermination};
use super::transcript::{TranscriptSnapshot, TranscriptStore};
use crate::error::{
    ChatError, ChatResult, ConcurrentTurnSnafu, ConfigurationSnafu, EmptyPromptSnafu,
    PersistenceSnafu, RegenerateUnavailableSnafu, TranscriptSnafu,
};
use crate::persistence::PersistenceBridge;
use crate::settings::{AppConfig, Settings, SettingsStore};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Cancelled,
    Failed { reason: String },
}

impl TurnState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    fn terminal(outcome: &TurnOutcome) -> Self {
        match outcome {
            TurnOutcome::Completed => Self::Completed,
            TurnOutcome::Cancelled => Self::Cancelled,
            TurnOutcome::Failed { reason } => Self::Failed {
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled,
    Failed { reason: String },
}

/// Events for the presentation layer. Delivery is best effort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatNotice {
    /// No usable credentials; the settings prompt should be shown.
    ConfigurationRequired { details: String },
    TurnFinished { outcome: TurnOutcome },
    StreamFailed { reason: String },
    SettingsSaved,
    PersistenceFailed { reason: String },
}

/// Handle to a running turn.
pub struct TurnHandle {
    placeholder_id: MessageId,
    task: JoinHandle<TurnOutcome>,
}

impl TurnHandle {
    /// Id of the assistant message receiving this turn's output.
    pub fn placeholder_id(&self) -> &MessageId {
        &self.placeholder_id
    }

    /// Waits for the terminal outcome.
    pub async fn outcome(self) -> TurnOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(error) => TurnOutcome::Failed {
                reason: format!("turn task ended abnormally: {error}"),
            },
        }
    }
}

struct ActiveTurn {
    turn_id: u64,
    placeholder_id: MessageId,
    cancel: CancellationToken,
}

struct SessionInner {
    config: AppConfig,
    transcript: Arc<TranscriptStore>,
    settings: SettingsStore,
    persistence: PersistenceBridge,
    connector: Arc<dyn ProviderConnector>,
    state: watch::Sender<TurnState>,
    active: Mutex<Option<ActiveTurn>>,
    next_turn_id: AtomicU64,
    notices: broadcast::Sender<ChatNotice>,
}

/// One conversation: transcript, settings and at most one in-flight turn.
///
/// `send` and `regenerate` spawn the turn on the current tokio runtime.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    /// Restores transcript and settings from `store` and starts persisting changes to it.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        config: AppConfig,
        connector: Arc<dyn ProviderConnector>,
    ) -> ChatResult<Self> {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let persistence = PersistenceBridge::new(store).with_notices(notices.clone());

        let messages = persistence.load_transcript().context(PersistenceSnafu {
            stage: "session-load-transcript",
        })?;
        let transcript = TranscriptStore::with_messages(messages).unwrap_or_else(|error| {
            tracing::warn!(error = %error, "discarding inconsistent chat history");
            TranscriptStore::new()
        });
        let transcript = Arc::new(transcript);
        transcript.add_listener(Arc::new(persistence.clone()));

        let settings = persistence
            .load_settings(&config)
            .context(PersistenceSnafu {
                stage: "session-load-settings",
            })?;
        tracing::info!(
            messages = transcript.len(),
            model = %settings.model_name,
            configured = settings.has_api_key(),
            "opened chat session"
        );

        let (state, _) = watch::channel(TurnState::Idle);
        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                transcript,
                settings: SettingsStore::new(settings),
                persistence,
                connector,
                state,
                active: Mutex::new(None),
                next_turn_id: AtomicU64::new(1),
                notices,
            }),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn transcript(&self) -> TranscriptSnapshot {
        self.inner.transcript.snapshot()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<TranscriptSnapshot> {
        self.inner.transcript.subscribe()
    }

    pub fn turn_state(&self) -> TurnState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TurnState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ChatNotice> {
        self.inner.notices.subscribe()
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.inner.settings.snapshot()
    }

    /// True when idle and the final message is an assistant message.
    pub fn can_regenerate(&self) -> bool {
        self.inner.active_slot().is_none()
            && self
                .inner
                .transcript
                .last()
                .is_some_and(|message| message.is_assistant())
    }

    /// Appends `text` as a user message and streams the reply into a new assistant message.
    pub fn send(&self, text: &str) -> ChatResult<TurnHandle> {
        let mut active = self.inner.active_slot();
        ensure!(active.is_none(), ConcurrentTurnSnafu { stage: "turn-send" });

        let prompt = text.trim();
        ensure!(!prompt.is_empty(), EmptyPromptSnafu { stage: "turn-send" });

        let (provider, params) = self.inner.prepare_turn("turn-send")?;
        self.inner
            .transcript
            .append(Message::user(prompt))
            .context(TranscriptSnafu {
                stage: "turn-append-user",
            })?;
        self.inner.state.send_replace(TurnState::Sending);

        self.launch(&mut active, provider, params)
    }

    /// Replaces the final assistant message with a fresh reply to the same history.
    pub fn regenerate(&self) -> ChatResult<TurnHandle> {
        let mut active = self.inner.active_slot();
        ensure!(
            active.is_none(),
            ConcurrentTurnSnafu {
                stage: "turn-regenerate"
            }
        );

        match self.inner.transcript.last() {
            None => {
                return RegenerateUnavailableSnafu {
                    stage: "turn-regenerate",
                    details: "transcript is empty",
                }
                .fail();
            }
            Some(message) if !message.is_assistant() => {
                return RegenerateUnavailableSnafu {
                    stage: "turn-regenerate",
                    details: "last message is not an assistant message",
                }
                .fail();
            }
            Some(_) => {}
        }

        // Checked before removing anything so a missing key keeps the old answer.
        let (provider, params) = self.inner.prepare_turn("turn-regenerate")?;
        self.inner
            .transcript
            .remove_last()
            .context(TranscriptSnafu {
                stage: "turn-remove-last",
            })?;
        self.inner.state.send_replace(TurnState::Sending);

        self.launch(&mut active, provider, params)
    }

    /// Cancels the streaming turn. Returns false when no turn was active.
    ///
    /// The assistant message keeps whatever had been streamed so far.
    pub fn stop(&self) -> bool {
        let mut active = self.inner.active_slot();
        let Some(turn) = active.take() else {
            return false;
        };

        turn.cancel.cancel();
        tracing::info!(turn_id = turn.turn_id, message_id = %turn.placeholder_id, "stopped turn");
        self.inner.publish_terminal(TurnOutcome::Cancelled);
        true
    }

    /// Stops any active turn, empties the transcript and deletes the stored history.
    pub fn clear_history(&self) -> ChatResult<()> {
        self.stop();
        self.inner.transcript.clear().context(TranscriptSnafu {
            stage: "clear-history",
        })?;
        self.inner
            .persistence
            .save_transcript(&[])
            .context(PersistenceSnafu {
                stage: "clear-history",
            })
    }

    /// Persists and applies new settings. An in-flight turn keeps its snapshot.
    pub fn update_settings(&self, settings: Settings) -> ChatResult<Arc<Settings>> {
        let settings = settings.normalized();
        self.inner
            .persistence
            .save_settings(&settings)
            .context(PersistenceSnafu {
                stage: "update-settings",
            })?;

        let stored = self.inner.settings.replace(settings);
        tracing::info!(model = %stored.model_name, deep_think = stored.deep_think_enabled, "saved chat settings");
        let _ = self.inner.notices.send(ChatNotice::SettingsSaved);
        Ok(stored)
    }

    /// Toggles deep think for later turns. Not persisted.
    pub fn set_deep_think(&self, enabled: bool) -> Arc<Settings> {
        self.inner
            .settings
            .modify(|settings| settings.with_deep_think(enabled))
    }

    fn launch(
        &self,
        active: &mut MutexGuard<'_, Option<ActiveTurn>>,
        provider: Arc<dyn LlmProvider>,
        params: ModelParams,
    ) -> ChatResult<TurnHandle> {
        let inner = &self.inner;
        let history: Vec<ProviderMessage> = inner
            .transcript
            .snapshot()
            .iter()
            .map(Message::to_provider_message)
            .collect();

        let placeholder = Message::assistant_placeholder();
        let placeholder_id = placeholder.id.clone();
        if let Err(source) = inner.transcript.append(placeholder) {
            inner.state.send_replace(TurnState::Idle);
            return Err(ChatError::Transcript {
                stage: "turn-append-placeholder",
                source,
            });
        }

        let cancel = CancellationToken::new();
        let turn_id = inner.next_turn_id.fetch_add(1, Ordering::Relaxed);
        **active = Some(ActiveTurn {
            turn_id,
            placeholder_id: placeholder_id.clone(),
            cancel: cancel.clone(),
        });
        inner.state.send_replace(TurnState::Streaming);
        tracing::info!(
            turn_id,
            model_id = %params.model_id,
            history = history.len(),
            "starting turn"
        );

        let stream = StreamConsumer::new(provider).start(history, params, cancel);
        let task = tokio::spawn(run_turn(inner.clone(), turn_id, stream));
        Ok(TurnHandle {
            placeholder_id,
            task,
        })
    }
}

impl SessionInner {
    fn active_slot(&self) -> MutexGuard<'_, Option<ActiveTurn>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Captures settings for a new turn and connects the provider.
    fn prepare_turn(&self, stage: &'static str) -> ChatResult<(Arc<dyn LlmProvider>, ModelParams)> {
        let settings = self.settings.snapshot();
        if !settings.has_api_key() {
            return self.configuration_required(stage, "no API key configured".to_string());
        }

        match self
            .connector
            .connect(self.config.provider_config(&settings))
        {
            Ok(provider) => Ok((provider, self.config.model_params(&settings))),
            Err(error) => self.configuration_required(stage, error.to_string()),
        }
    }

    fn configuration_required<T>(&self, stage: &'static str, details: String) -> ChatResult<T> {
        tracing::warn!(stage, details = %details, "chat provider is not configured");
        let _ = self.notices.send(ChatNotice::ConfigurationRequired {
            details: details.clone(),
        });
        ConfigurationSnafu { stage, details }.fail()
    }

    /// Writes a snapshot into the turn's assistant message. False once the turn is no
    /// longer active.
    fn apply_update(&self, turn_id: u64, snapshot: &StreamSnapshot) -> bool {
        let active = self.active_slot();
        let Some(turn) = active
            .as_ref()
            .filter(|turn| turn.turn_id == turn_id && !turn.cancel.is_cancelled())
        else {
            return false;
        };

        // Overwrite, never append: replaying the same snapshot leaves the text unchanged.
        let result = self.transcript.update_last(|message| {
            if message.id == turn.placeholder_id {
                message.content = snapshot.answer.clone();
                message.reasoning = snapshot.reasoning_field();
            }
        });
        if let Err(error) = result {
            tracing::warn!(turn_id, error = %error, "failed to apply stream snapshot");
        }
        true
    }

    /// Clears the slot if `turn_id` still owns it. A turn that lost its slot was stopped.
    fn finish_turn(&self, turn_id: u64, outcome: TurnOutcome) -> TurnOutcome {
        let mut active = self.active_slot();
        if !active.as_ref().is_some_and(|turn| turn.turn_id == turn_id) {
            return TurnOutcome::Cancelled;
        }

        *active = None;
        self.publish_terminal(outcome.clone());
        outcome
    }

    fn publish_terminal(&self, outcome: TurnOutcome) {
        self.state.send_replace(TurnState::terminal(&outcome));
        self.state.send_replace(TurnState::Idle);

        match &outcome {
            TurnOutcome::Completed => tracing::info!("turn completed"),
            TurnOutcome::Cancelled => tracing::info!("turn cancelled"),
            TurnOutcome::Failed { reason } => {
                tracing::warn!(reason = %reason, "turn failed");
                let _ = self.notices.send(ChatNotice::StreamFailed {
                    reason: reason.clone(),
                });
            }
        }
        let _ = self.notices.send(ChatNotice::TurnFinished { outcome });
    }
}

async fn run_turn(inner: Arc<SessionInner>, turn_id: u64, mut stream: SnapshotStream) -> TurnOutcome {
    let outcome = loop {
        match stream.next().await {
            Some(Ok(update)) => {
                if !inner.apply_update(turn_id, &update.snapshot) {
                    break TurnOutcome::Cancelled;
                }
            }
            Some(Err(failure)) => {
                break TurnOutcome::Failed {
                    reason: failure.to_string(),
                };
            }
            None => {
                break match stream.termination() {
                    Some(StreamTermination::Completed) => TurnOutcome::Completed,
                    Some(StreamTermination::Failed) => TurnOutcome::Failed {
                        reason: "completion stream failed".to_string(),
                    },
                    Some(StreamTermination::Cancelled) | None => TurnOutcome::Cancelled,
                };
            }
        }
    };

    inner.finish_turn(turn_id, outcome)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parlor_llm::scripted::{Script, text_script};
    use parlor_llm::{Fragment, ProviderMessage, Role as ProviderRole, ScriptStep, ScriptedProvider};
    use parlor_storage::MemoryStore;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::chat::message::Role;
    use crate::persistence::{API_KEY_KEY, HISTORY_KEY};
    use crate::settings::StorageBackend;

    struct Harness {
        session: ChatSession,
        provider: ScriptedProvider,
        store: Arc<MemoryStore>,
    }

    fn harness(scripts: Vec<Script>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        store.set(API_KEY_KEY, "sk-test").expect("seed api key");
        harness_with_store(store, scripts)
    }

    fn harness_with_store(store: Arc<MemoryStore>, scripts: Vec<Script>) -> Harness {
        let provider = ScriptedProvider::new(scripts);
        let config = AppConfig {
            storage: StorageBackend::Memory,
            ..AppConfig::default()
        };
        let session =
            ChatSession::open(store.clone(), config, Arc::new(provider.clone())).expect("open");
        Harness {
            session,
            provider,
            store,
        }
    }

    fn pairs(session: &ChatSession) -> Vec<(Role, String)> {
        session
            .transcript()
            .iter()
            .map(|message| (message.role, message.content.clone()))
            .collect()
    }

    fn user(content: &str) -> (Role, String) {
        (Role::User, content.to_string())
    }

    fn assistant(content: &str) -> (Role, String) {
        (Role::Assistant, content.to_string())
    }

    async fn wait_for_last_content(session: &ChatSession, expected: &str) {
        let mut transcript = session.subscribe_transcript();
        let wait = transcript.wait_for(|messages| {
            messages
                .last()
                .is_some_and(|message| message.is_assistant() && message.content == expected)
        });
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("snapshot arrived in time")
            .expect("transcript sender alive");
    }

    #[tokio::test]
    async fn send_streams_answer_into_placeholder() {
        let Harness {
            session, provider, ..
        } = harness(vec![text_script(["He", "llo"])]);

        let handle = session.send("Hi").expect("send accepted");
        assert_eq!(session.turn_state(), TurnState::Streaming);
        let placeholder_id = handle.placeholder_id().clone();

        assert_eq!(handle.outcome().await, TurnOutcome::Completed);
        assert_eq!(pairs(&session), vec![user("Hi"), assistant("Hello")]);
        assert_eq!(
            session.transcript().last().map(|message| message.id.clone()),
            Some(placeholder_id)
        );
        assert_eq!(session.turn_state(), TurnState::Idle);

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].messages,
            vec![ProviderMessage::new(ProviderRole::User, "Hi")]
        );
        assert_eq!(requests[0].model_id, "deepseek-chat");
    }

    #[tokio::test]
    async fn regenerate_replaces_the_last_answer() {
        let Harness {
            session, provider, ..
        } = harness(vec![text_script(["Hello"]), text_script(["Hey"])]);
        session
            .send("Hi")
            .expect("send accepted")
            .outcome()
            .await;
        let before = session.transcript().len();

        let handle = session.regenerate().expect("regenerate accepted");
        assert_eq!(handle.outcome().await, TurnOutcome::Completed);

        assert_eq!(pairs(&session), vec![user("Hi"), assistant("Hey")]);
        assert_eq!(session.transcript().len(), before);
        assert_eq!(
            provider.requests()[1].messages,
            vec![ProviderMessage::new(ProviderRole::User, "Hi")]
        );
    }

    #[tokio::test]
    async fn stop_keeps_partial_content() {
        let Harness { session, .. } = harness(vec![vec![
            ScriptStep::Fragment(Fragment::text("partial")),
            ScriptStep::Hang,
        ]]);

        let handle = session.send("X").expect("send accepted");
        wait_for_last_content(&session, "partial").await;

        assert!(session.stop());
        assert_eq!(session.turn_state(), TurnState::Idle);
        assert_eq!(handle.outcome().await, TurnOutcome::Cancelled);
        assert_eq!(pairs(&session), vec![user("X"), assistant("partial")]);
        assert!(!session.stop());
    }

    #[tokio::test]
    async fn concurrent_turns_are_rejected() {
        let Harness { session, .. } = harness(vec![vec![ScriptStep::Hang]]);
        let _handle = session.send("first").expect("send accepted");
        let before = session.transcript();

        let send = session.send("second").err().expect("second send rejected");
        assert!(matches!(send, ChatError::ConcurrentTurn { .. }));
        let regenerate = session.regenerate().err().expect("regenerate rejected");
        assert!(matches!(regenerate, ChatError::ConcurrentTurn { .. }));
        assert!(!session.can_regenerate());
        let blank = session.send("   ").err().expect("blank send rejected");
        assert!(matches!(blank, ChatError::ConcurrentTurn { .. }));

        assert_eq!(session.transcript(), before);
        assert_eq!(session.turn_state(), TurnState::Streaming);
        session.stop();
    }

    #[tokio::test]
    async fn missing_api_key_requests_configuration() {
        let Harness { session, .. } = harness(vec![text_script(["unused"])]);
        session
            .update_settings(Settings::new("", "deepseek-chat"))
            .expect("clear key");
        let mut notices = session.subscribe_notices();

        let error = session.send("Hi").err().expect("not configured");

        assert!(matches!(error, ChatError::Configuration { .. }));
        assert!(session.transcript().is_empty());
        assert_eq!(session.turn_state(), TurnState::Idle);
        assert!(matches!(
            notices.try_recv(),
            Ok(ChatNotice::ConfigurationRequired { .. })
        ));
    }

    #[tokio::test]
    async fn regenerate_requires_an_assistant_tail() {
        let store = Arc::new(MemoryStore::new());
        store.set(API_KEY_KEY, "sk-test").expect("seed api key");
        let Harness { session, .. } = harness_with_store(store.clone(), Vec::new());

        let empty = session.regenerate().err().expect("empty transcript");
        assert!(matches!(empty, ChatError::RegenerateUnavailable { .. }));

        store
            .set(HISTORY_KEY, r#"[{"id":"1","role":"user","content":"Hi"}]"#)
            .expect("seed history");
        let Harness { session, .. } = harness_with_store(store, Vec::new());
        assert!(!session.can_regenerate());
        let user_tail = session.regenerate().err().expect("user tail");
        assert!(matches!(user_tail, ChatError::RegenerateUnavailable { .. }));
        assert_eq!(pairs(&session), vec![user("Hi")]);
    }

    #[tokio::test]
    async fn regenerate_without_key_keeps_the_answer() {
        let Harness { session, .. } = harness(vec![text_script(["Hello"])]);
        session.send("Hi").expect("send").outcome().await;
        assert!(session.can_regenerate());
        session
            .update_settings(Settings::new("", "deepseek-chat"))
            .expect("clear key");

        let error = session.regenerate().err().expect("not configured");

        assert!(matches!(error, ChatError::Configuration { .. }));
        assert_eq!(pairs(&session), vec![user("Hi"), assistant("Hello")]);
    }

    #[tokio::test]
    async fn failure_keeps_partial_content_and_is_announced() {
        let Harness { session, .. } = harness(vec![vec![
            ScriptStep::Fragment(Fragment::text("par")),
            ScriptStep::Fail("upstream reset".to_string()),
        ]]);
        let mut notices = session.subscribe_notices();

        let outcome = session.send("X").expect("send").outcome().await;

        let reason = match outcome {
            TurnOutcome::Failed { reason } => reason,
            other => panic!("expected failure, got {other:?}"),
        };
        assert!(reason.contains("upstream reset"));
        assert_eq!(pairs(&session), vec![user("X"), assistant("par")]);
        assert_eq!(session.turn_state(), TurnState::Idle);
        assert!(matches!(
            notices.try_recv(),
            Ok(ChatNotice::StreamFailed { .. })
        ));
        assert!(matches!(
            notices.try_recv(),
            Ok(ChatNotice::TurnFinished {
                outcome: TurnOutcome::Failed { .. }
            })
        ));
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected() {
        let Harness { session, provider, .. } = harness(vec![]);
        let error = session.send("   ").err().expect("blank prompt");
        assert!(matches!(error, ChatError::EmptyPrompt { .. }));
        assert!(session.transcript().is_empty());
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn each_send_adds_two_messages() {
        let Harness { session, .. } = harness(vec![
            text_script(["one"]),
            text_script(["two"]),
            text_script(["three"]),
        ]);

        for (turn, prompt) in ["a", "b", "c"].into_iter().enumerate() {
            session.send(prompt).expect("send").outcome().await;
            assert_eq!(session.transcript().len(), 2 * (turn + 1));
        }
    }

    #[tokio::test]
    async fn reasoning_lands_in_its_own_field() {
        let Harness { session, .. } = harness(vec![vec![
            ScriptStep::Fragment(Fragment::reasoning("6 times 7")),
            ScriptStep::Fragment(Fragment::text("42")),
        ]]);

        session.send("6*7?").expect("send").outcome().await;

        let transcript = session.transcript();
        let answer = transcript.last().expect("assistant message");
        assert_eq!(answer.content, "42");
        assert_eq!(answer.reasoning.as_deref(), Some("6 times 7"));
    }

    #[tokio::test]
    async fn settings_change_mid_turn_does_not_affect_the_turn() {
        let Harness {
            session, provider, ..
        } = harness(vec![vec![
            ScriptStep::Pause(Duration::from_millis(10)),
            ScriptStep::Fragment(Fragment::text("ok")),
        ]]);

        let handle = session.send("Hi").expect("send");
        session.set_deep_think(true);
        assert_eq!(handle.outcome().await, TurnOutcome::Completed);

        assert_eq!(provider.requests()[0].model_id, "deepseek-chat");
        assert!(session.settings().deep_think_enabled);
    }

    #[tokio::test]
    async fn transcript_is_persisted_and_cleared() {
        let Harness { session, store, .. } = harness(vec![text_script(["Hello"])]);
        session.send("Hi").expect("send").outcome().await;

        let raw = store.get(HISTORY_KEY).expect("get").expect("history stored");
        let stored: Vec<Message> = serde_json::from_str(&raw).expect("valid history");
        assert_eq!(stored.as_slice(), session.transcript().as_slice());

        session.clear_history().expect("clear");
        assert!(session.transcript().is_empty());
        assert_eq!(store.get(HISTORY_KEY).expect("get"), None);
    }

    #[tokio::test]
    async fn history_is_restored_on_open() {
        let Harness { session, store, .. } = harness(vec![text_script(["Hello"])]);
        session.send("Hi").expect("send").outcome().await;
        drop(session);

        let Harness { session, .. } = harness_with_store(store, Vec::new());
        assert_eq!(pairs(&session), vec![user("Hi"), assistant("Hello")]);
        assert!(session.can_regenerate());
    }

    #[tokio::test]
    async fn clear_history_stops_the_active_turn() {
        let Harness { session, .. } = harness(vec![vec![ScriptStep::Hang]]);
        let handle = session.send("Hi").expect("send");

        session.clear_history().expect("clear");

        assert_eq!(handle.outcome().await, TurnOutcome::Cancelled);
        assert!(session.transcript().is_empty());
        assert_eq!(session.turn_state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn saving_settings_is_announced() {
        let Harness { session, store, .. } = harness(vec![]);
        let mut notices = session.subscribe_notices();

        let saved = session
            .update_settings(Settings::new("sk-new", "gpt-5-mini"))
            .expect("save");

        assert_eq!(saved.model_name, "gpt-5-mini");
        assert_eq!(store.get(API_KEY_KEY).expect("get").as_deref(), Some("sk-new"));
        assert_eq!(notices.try_recv().ok(), Some(ChatNotice::SettingsSaved));
    }
}
