use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use snafu::{Snafu, ensure};
use tokio::sync::watch;

use super::message::Message;

/// Immutable, ordered view of the transcript at one point in time.
pub type TranscriptSnapshot = Arc<Vec<Message>>;

pub type TranscriptResult<T> = Result<T, TranscriptError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TranscriptError {
    #[snafu(display("invalid transcript state on `{stage}`: {details}"))]
    InvalidState {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("transcript write lock is poisoned on `{stage}`"))]
    LockPoisoned { stage: &'static str },
}

/// Observer called after every mutation that changed the transcript.
///
/// Listeners run synchronously on the mutating thread, in mutation order.
pub trait TranscriptListener: Send + Sync {
    fn transcript_changed(&self, snapshot: &TranscriptSnapshot);
}

/// Ordered message list with stable identities.
///
/// Each mutation copies the current list, applies the change and publishes the result
/// as a new snapshot, so readers never observe a half-applied change.
pub struct TranscriptStore {
    published: watch::Sender<TranscriptSnapshot>,
    write_lock: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn TranscriptListener>>>,
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::from_snapshot(Arc::new(Vec::new()))
    }
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with previously persisted messages.
    pub fn with_messages(messages: Vec<Message>) -> TranscriptResult<Self> {
        let mut seen = HashSet::with_capacity(messages.len());
        for message in &messages {
            ensure!(
                seen.insert(message.id.clone()),
                InvalidStateSnafu {
                    stage: "transcript-seed",
                    details: format!("duplicate message id {}", message.id),
                }
            );
        }

        Ok(Self::from_snapshot(Arc::new(messages)))
    }

    fn from_snapshot(snapshot: TranscriptSnapshot) -> Self {
        let (published, _) = watch::channel(snapshot);
        Self {
            published,
            write_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn TranscriptListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TranscriptSnapshot> {
        self.published.subscribe()
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        self.published.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.published.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.borrow().is_empty()
    }

    pub fn last(&self) -> Option<Message> {
        self.published.borrow().last().cloned()
    }

    pub fn append(&self, message: Message) -> TranscriptResult<()> {
        self.mutate("transcript-append", |messages| {
            ensure!(
                messages.iter().all(|existing| existing.id != message.id),
                InvalidStateSnafu {
                    stage: "transcript-append",
                    details: format!("message id {} already exists", message.id),
                }
            );
            messages.push(message);
            Ok(true)
        })
    }

    /// Applies `mutator` to the final message, which must be an assistant message.
    ///
    /// The mutator may only change content and reasoning. Leaving the message as it
    /// was is not an error and publishes nothing.
    pub fn update_last<F>(&self, mutator: F) -> TranscriptResult<()>
    where
        F: FnOnce(&mut Message),
    {
        self.mutate("transcript-update-last", |messages| {
            let Some(last) = messages.last_mut() else {
                return InvalidStateSnafu {
                    stage: "transcript-update-last",
                    details: "transcript is empty".to_string(),
                }
                .fail();
            };
            ensure!(
                last.is_assistant(),
                InvalidStateSnafu {
                    stage: "transcript-update-last",
                    details: format!("final message {} is not an assistant message", last.id),
                }
            );

            let before = last.clone();
            mutator(last);
            ensure!(
                last.id == before.id && last.role == before.role,
                InvalidStateSnafu {
                    stage: "transcript-update-last",
                    details: format!("message {} identity must not change", before.id),
                }
            );
            Ok(*last != before)
        })
    }

    /// Removes and returns the final message. Empty transcripts are left alone.
    pub fn remove_last(&self) -> TranscriptResult<Option<Message>> {
        let mut removed = None;
        self.mutate("transcript-remove-last", |messages| {
            removed = messages.pop();
            Ok(removed.is_some())
        })?;
        Ok(removed)
    }

    pub fn clear(&self) -> TranscriptResult<()> {
        self.mutate("transcript-clear", |messages| {
            let changed = !messages.is_empty();
            messages.clear();
            Ok(changed)
        })
    }

    fn mutate<F>(&self, stage: &'static str, apply: F) -> TranscriptResult<()>
    where
        F: FnOnce(&mut Vec<Message>) -> TranscriptResult<bool>,
    {
        let _guard = self.lock_writes(stage)?;

        let mut messages = Vec::clone(&self.published.borrow());
        if !apply(&mut messages)? {
            return Ok(());
        }

        let snapshot: TranscriptSnapshot = Arc::new(messages);
        self.published.send_replace(snapshot.clone());

        // Still under the write lock, so listeners see snapshots in mutation order.
        if let Ok(listeners) = self.listeners.read() {
            for listener in listeners.iter() {
                listener.transcript_changed(&snapshot);
            }
        }

        Ok(())
    }

    fn lock_writes(&self, stage: &'static str) -> TranscriptResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| LockPoisonedSnafu { stage }.build())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::chat::message::{MessageId, Role};

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
        last_len: AtomicUsize,
    }

    impl TranscriptListener for CountingListener {
        fn transcript_changed(&self, snapshot: &TranscriptSnapshot) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_len.store(snapshot.len(), Ordering::SeqCst);
        }
    }

    fn assistant(id: &str, content: &str) -> Message {
        Message::new(MessageId::from_raw(id), Role::Assistant, content)
    }

    fn user(id: &str, content: &str) -> Message {
        Message::new(MessageId::from_raw(id), Role::User, content)
    }

    #[test]
    fn append_rejects_duplicate_ids() {
        let store = TranscriptStore::new();
        store.append(user("1", "Hi")).expect("first append");

        let error = store.append(user("1", "again")).expect_err("duplicate");
        assert!(matches!(error, TranscriptError::InvalidState { .. }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_last_requires_assistant_tail() {
        let store = TranscriptStore::new();
        let empty = store
            .update_last(|message| message.content.push('x'))
            .expect_err("empty transcript");
        assert!(matches!(empty, TranscriptError::InvalidState { .. }));

        store.append(user("1", "Hi")).expect("append");
        let not_assistant = store
            .update_last(|message| message.content.push('x'))
            .expect_err("user tail");
        assert!(matches!(not_assistant, TranscriptError::InvalidState { .. }));
        assert_eq!(store.snapshot()[0].content, "Hi");
    }

    #[test]
    fn update_last_cannot_change_identity() {
        let store = TranscriptStore::new();
        store.append(assistant("1", "")).expect("append");

        let error = store
            .update_last(|message| message.role = Role::User)
            .expect_err("role change");
        assert!(matches!(error, TranscriptError::InvalidState { .. }));
        assert_eq!(store.snapshot()[0].role, Role::Assistant);
    }

    #[test]
    fn overwriting_with_same_snapshot_does_not_duplicate() {
        let store = TranscriptStore::new();
        store.append(assistant("1", "")).expect("append");

        for _ in 0..2 {
            store
                .update_last(|message| message.content = "Hello".to_string())
                .expect("overwrite");
        }

        assert_eq!(store.snapshot()[0].content, "Hello");
    }

    #[test]
    fn remove_last_and_clear_on_empty_are_noops() {
        let store = TranscriptStore::new();
        assert_eq!(store.remove_last().expect("remove"), None);
        store.clear().expect("clear");

        store.append(user("1", "Hi")).expect("append");
        store.append(assistant("2", "Hello")).expect("append");
        let removed = store.remove_last().expect("remove").expect("had a message");
        assert_eq!(removed.content, "Hello");
        assert_eq!(*store.snapshot(), vec![user("1", "Hi")]);
    }

    #[test]
    fn snapshots_are_isolated_from_later_mutations() {
        let store = TranscriptStore::new();
        store.append(user("1", "Hi")).expect("append");
        let before = store.snapshot();

        store.append(assistant("2", "Hello")).expect("append");

        assert_eq!(before.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn listeners_fire_only_on_real_changes() {
        let store = TranscriptStore::new();
        let listener = Arc::new(CountingListener::default());
        store.add_listener(listener.clone());

        store.append(assistant("1", "")).expect("append");
        store
            .update_last(|message| message.content = "same".to_string())
            .expect("update");
        store
            .update_last(|message| message.content = "same".to_string())
            .expect("repeat update");
        store.clear().expect("clear");
        store.clear().expect("clear again");

        assert_eq!(listener.calls.load(Ordering::SeqCst), 3);
        assert_eq!(listener.last_len.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribers_see_the_latest_snapshot() {
        let store = TranscriptStore::new();
        let mut receiver = store.subscribe();

        store.append(user("1", "Hi")).expect("append");

        assert!(receiver.has_changed().expect("sender alive"));
        assert_eq!(receiver.borrow_and_update().len(), 1);
    }

    #[test]
    fn seeding_rejects_duplicate_ids() {
        let result = TranscriptStore::with_messages(vec![user("1", "a"), assistant("1", "b")]);
        assert!(matches!(result, Err(TranscriptError::InvalidState { .. })));
    }
}
