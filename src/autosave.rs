//! Debounced auto-save.
//!
//! One Tokio task owns the per-document state machine:
//!
//! ```text
//! Idle -> Scheduled -> Saving -> Saved -> Idle
//!                             -> Error (retrying) -> Scheduled
//!                             -> Error (halted until resume)
//!                             -> Conflict (until resolve)
//! ```
//!
//! Mutations arrive as commands over an unbounded channel. Each mutation aborts the
//! document's pending timer and arms a new one, so a burst of edits inside one debounce
//! window ends in a single save of the latest working copy. Saves run on the scheduler
//! task itself, one at a time, which is what keeps two timers of one document from
//! interleaving.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::AutoSaveConfig;
use crate::error::{ApdError, ApdResult, ErrorContext, ErrorKind, Operation};
use crate::ids::{DocumentId, VersionId};
use crate::version_repository::CommitOutcome;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SaveState {
    Idle,
    /// `attempt` is 0 for a debounce and counts retries after that.
    Scheduled { attempt: u32 },
    Saving,
    #[serde(rename_all = "camelCase")]
    Saved { version_id: VersionId },
    Error {
        kind: ErrorKind,
        message: String,
        retrying: bool,
    },
    Conflict { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStatusEvent {
    pub document_id: DocumentId,
    pub state: SaveState,
    pub at: DateTime<Utc>,
}

/// The explicit user choice that ends a [`SaveState::Conflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Drop the draft and continue from the current head.
    Reload,
    /// Keep the draft and save it on top of the current head.
    Overwrite,
}

/// What the scheduler persists through.
pub trait DocumentSaver: Send + Sync + 'static {
    fn save(&self, document_id: &DocumentId) -> ApdResult<CommitOutcome>;

    fn resolve_conflict(
        &self,
        document_id: &DocumentId,
        resolution: ConflictResolution,
    ) -> ApdResult<()>;
}

type Callback = Arc<dyn Fn(&SaveStatusEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    by_document: HashMap<DocumentId, Vec<(u64, Callback)>>,
}

impl Subscribers {
    fn callbacks(&self, document_id: &DocumentId) -> Vec<Callback> {
        self.by_document
            .get(document_id)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

fn lock(subscribers: &Mutex<Subscribers>) -> std::sync::MutexGuard<'_, Subscribers> {
    subscribers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes its subscription when dropped or when [`Unsubscribe::unsubscribe`] is called.
#[must_use = "dropping the guard ends the subscription"]
pub struct Unsubscribe {
    subscribers: Weak<Mutex<Subscribers>>,
    document_id: DocumentId,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {}
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return;
        };
        let mut subscribers = lock(&subscribers);
        if let Some(entries) = subscribers.by_document.get_mut(&self.document_id) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                subscribers.by_document.remove(&self.document_id);
            }
        }
    }
}

enum Command {
    Notify(DocumentId),
    Fire {
        document_id: DocumentId,
        generation: u64,
    },
    SetOnline(bool),
    Flush {
        document_id: DocumentId,
        reply: oneshot::Sender<ApdResult<Option<CommitOutcome>>>,
    },
    Resolve {
        document_id: DocumentId,
        resolution: ConflictResolution,
        reply: oneshot::Sender<ApdResult<()>>,
    },
    Resume(DocumentId),
    Status {
        document_id: DocumentId,
        reply: oneshot::Sender<SaveState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap to clone; every clone talks to the same scheduler task.
#[derive(Clone)]
pub struct AutoSaveHandle {
    commands: UnboundedSender<Command>,
    subscribers: Arc<Mutex<Subscribers>>,
}

pub struct AutoSaveScheduler;

impl AutoSaveScheduler {
    /// Starts the scheduler task. Must be called from within a Tokio runtime.
    ///
    /// The task stops after [`AutoSaveHandle::shutdown`] or once every handle is dropped.
    pub fn spawn<S: DocumentSaver>(saver: Arc<S>, config: AutoSaveConfig) -> AutoSaveHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let subscribers = Arc::new(Mutex::new(Subscribers::default()));
        let actor = Actor {
            saver,
            config,
            online: true,
            documents: HashMap::new(),
            commands: commands.downgrade(),
            subscribers: Arc::clone(&subscribers),
        };
        tokio::spawn(actor.run(receiver));
        AutoSaveHandle {
            commands,
            subscribers,
        }
    }
}

impl AutoSaveHandle {
    /// The document's working copy changed; (re)arm its debounce timer.
    pub fn notify_mutation(&self, document_id: &DocumentId) {
        self.send(Command::Notify(document_id.clone()));
    }

    /// While offline nothing leaves `Idle`. Coming back online schedules one save per
    /// document that changed in the meantime.
    pub fn set_online(&self, online: bool) {
        self.send(Command::SetOnline(online));
    }

    /// Clears a halted `Error` state, re-arming the save if edits are waiting.
    pub fn resume(&self, document_id: &DocumentId) {
        self.send(Command::Resume(document_id.clone()));
    }

    pub fn subscribe(
        &self,
        document_id: &DocumentId,
        callback: impl Fn(&SaveStatusEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let mut subscribers = lock(&self.subscribers);
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers
            .by_document
            .entry(document_id.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        Unsubscribe {
            subscribers: Arc::downgrade(&self.subscribers),
            document_id: document_id.clone(),
            id,
        }
    }

    pub async fn status(&self, document_id: &DocumentId) -> SaveState {
        let (reply, response) = oneshot::channel();
        self.send(Command::Status {
            document_id: document_id.clone(),
            reply,
        });
        response.await.unwrap_or(SaveState::Idle)
    }

    /// Saves now instead of waiting for the timer. `None` when saving is suspended.
    pub async fn flush(&self, document_id: &DocumentId) -> ApdResult<Option<CommitOutcome>> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Flush {
            document_id: document_id.clone(),
            reply,
        });
        response.await.map_err(|_| stopped(document_id))?
    }

    pub async fn resolve(
        &self,
        document_id: &DocumentId,
        resolution: ConflictResolution,
    ) -> ApdResult<()> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Resolve {
            document_id: document_id.clone(),
            resolution,
            reply,
        });
        response.await.map_err(|_| stopped(document_id))?
    }

    /// Saves every document with unsaved edits, then stops the scheduler.
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        self.send(Command::Shutdown { reply });
        let _ = response.await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Auto-save scheduler already stopped; command dropped");
        }
    }
}

fn stopped(document_id: &DocumentId) -> ApdError {
    ApdError::TransientStorage {
        context: ErrorContext::for_document(Operation::AutoSave, document_id),
        detail: "auto-save scheduler is not running".to_owned(),
    }
}

struct Slot {
    state: SaveState,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    attempt: u32,
    /// Edits not yet covered by a successful save.
    dirty: bool,
    /// Set by a non-retryable error; cleared by `resume`.
    halted: bool,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: SaveState::Idle,
            timer: None,
            generation: 0,
            attempt: 0,
            dirty: false,
            halted: false,
        }
    }
}

impl Slot {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }

    fn blocked(&self) -> bool {
        self.halted || matches!(self.state, SaveState::Conflict { .. })
    }
}

struct Actor<S> {
    saver: Arc<S>,
    config: AutoSaveConfig,
    online: bool,
    documents: HashMap<DocumentId, Slot>,
    commands: WeakUnboundedSender<Command>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl<S: DocumentSaver> Actor<S> {
    async fn run(mut self, mut receiver: UnboundedReceiver<Command>) {
        while let Some(command) = receiver.recv().await {
            match command {
                Command::Notify(document_id) => self.on_mutation(document_id),
                Command::Fire {
                    document_id,
                    generation,
                } => self.on_fire(document_id, generation),
                Command::SetOnline(online) => self.on_online(online),
                Command::Flush { document_id, reply } => {
                    let _ = reply.send(self.on_flush(&document_id));
                }
                Command::Resolve {
                    document_id,
                    resolution,
                    reply,
                } => {
                    let _ = reply.send(self.on_resolve(&document_id, resolution));
                }
                Command::Resume(document_id) => self.on_resume(&document_id),
                Command::Status { document_id, reply } => {
                    let state = self
                        .documents
                        .get(&document_id)
                        .map(|slot| slot.state.clone())
                        .unwrap_or(SaveState::Idle);
                    let _ = reply.send(state);
                }
                Command::Shutdown { reply } => {
                    self.flush_all();
                    let _ = reply.send(());
                    info!("Auto-save scheduler stopped");
                    return;
                }
            }
        }
        for slot in self.documents.values_mut() {
            slot.cancel_timer();
        }
        debug!("Auto-save scheduler stopped: every handle dropped");
    }

    fn on_mutation(&mut self, document_id: DocumentId) {
        let slot = self.documents.entry(document_id.clone()).or_default();
        slot.dirty = true;
        if slot.blocked() || !self.online {
            return;
        }
        slot.attempt = 0;
        let delay = self.config.debounce();
        self.arm(&document_id, delay);
    }

    fn on_fire(&mut self, document_id: DocumentId, generation: u64) {
        let Some(slot) = self.documents.get_mut(&document_id) else {
            return;
        };
        if slot.generation != generation || !self.online || slot.blocked() {
            debug!("Dropping stale auto-save timer for document {document_id}");
            return;
        }
        slot.timer = None;
        self.save(&document_id);
    }

    fn on_online(&mut self, online: bool) {
        if self.online == online {
            return;
        }
        self.online = online;
        info!("Auto-save {}", if online { "resumed: online" } else { "suspended: offline" });

        let ids: Vec<DocumentId> = self.documents.keys().cloned().collect();
        for document_id in ids {
            let Some(slot) = self.documents.get_mut(&document_id) else {
                continue;
            };
            if online {
                if slot.dirty && !slot.blocked() {
                    slot.attempt = 0;
                    let delay = self.config.debounce();
                    self.arm(&document_id, delay);
                }
            } else if slot.timer.is_some() {
                slot.cancel_timer();
                self.transition(&document_id, SaveState::Idle);
            }
        }
    }

    fn on_flush(&mut self, document_id: &DocumentId) -> ApdResult<Option<CommitOutcome>> {
        let slot = self.documents.entry(document_id.clone()).or_default();
        slot.cancel_timer();
        if slot.blocked() || !self.online {
            return Ok(None);
        }
        slot.attempt = 0;
        self.save(document_id).map(Some)
    }

    fn on_resolve(
        &mut self,
        document_id: &DocumentId,
        resolution: ConflictResolution,
    ) -> ApdResult<()> {
        self.saver.resolve_conflict(document_id, resolution)?;
        info!("Conflict on document {document_id} resolved by {resolution:?}");

        let slot = self.documents.entry(document_id.clone()).or_default();
        slot.cancel_timer();
        slot.halted = false;
        slot.attempt = 0;
        slot.dirty = resolution == ConflictResolution::Overwrite;
        self.transition(document_id, SaveState::Idle);
        if resolution == ConflictResolution::Overwrite && self.online {
            let delay = self.config.debounce();
            self.arm(document_id, delay);
        }
        Ok(())
    }

    fn on_resume(&mut self, document_id: &DocumentId) {
        let Some(slot) = self.documents.get_mut(document_id) else {
            return;
        };
        if !slot.halted {
            return;
        }
        slot.halted = false;
        slot.attempt = 0;
        let rearm = slot.dirty && self.online;
        self.transition(document_id, SaveState::Idle);
        if rearm {
            let delay = self.config.debounce();
            self.arm(document_id, delay);
        }
    }

    fn flush_all(&mut self) {
        let ids: Vec<DocumentId> = self.documents.keys().cloned().collect();
        for document_id in ids {
            let Some(slot) = self.documents.get_mut(&document_id) else {
                continue;
            };
            slot.cancel_timer();
            if slot.dirty && !slot.blocked() && self.online {
                let _ = self.save(&document_id);
            }
        }
    }

    fn arm(&mut self, document_id: &DocumentId, delay: Duration) {
        let slot = self.documents.entry(document_id.clone()).or_default();
        slot.cancel_timer();
        let generation = slot.generation;
        let attempt = slot.attempt;
        let commands = self.commands.clone();
        let fire_for = document_id.clone();
        slot.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Fire {
                    document_id: fire_for,
                    generation,
                });
            }
        }));
        self.transition(document_id, SaveState::Scheduled { attempt });
    }

    fn save(&mut self, document_id: &DocumentId) -> ApdResult<CommitOutcome> {
        self.transition(document_id, SaveState::Saving);
        let result = self.saver.save(document_id);
        match &result {
            Ok(outcome) => {
                if let Some(slot) = self.documents.get_mut(document_id) {
                    slot.dirty = false;
                    slot.attempt = 0;
                }
                let version_id = outcome.head_version_id().clone();
                info!("Auto-saved document {document_id} at version {version_id}");
                self.transition(document_id, SaveState::Saved { version_id });
                self.transition(document_id, SaveState::Idle);
            }
            Err(err) => self.on_save_error(document_id, err),
        }
        result
    }

    fn on_save_error(&mut self, document_id: &DocumentId, err: &ApdError) {
        let max_retries = self.config.max_retries;
        let slot = self.documents.entry(document_id.clone()).or_default();

        if let ApdError::Conflict { .. } = err {
            warn!("Auto-save of document {document_id} hit a conflict: {err}");
            self.transition(
                document_id,
                SaveState::Conflict {
                    message: err.to_string(),
                },
            );
            return;
        }

        let retrying = err.is_retryable() && slot.attempt < max_retries;
        if !err.is_retryable() {
            slot.halted = true;
        }
        warn!(
            "Auto-save of document {document_id} failed (attempt {}): {err}",
            slot.attempt + 1
        );
        self.transition(
            document_id,
            SaveState::Error {
                kind: err.kind(),
                message: err.to_string(),
                retrying,
            },
        );

        if retrying {
            let slot = self.documents.entry(document_id.clone()).or_default();
            slot.attempt += 1;
            let delay = self.config.backoff(slot.attempt);
            self.arm(document_id, delay);
        }
    }

    fn transition(&mut self, document_id: &DocumentId, state: SaveState) {
        let slot = self.documents.entry(document_id.clone()).or_default();
        if slot.state == state {
            return;
        }
        debug!("Auto-save state of document {document_id}: {:?} -> {state:?}", slot.state);
        slot.state = state.clone();

        let event = SaveStatusEvent {
            document_id: document_id.clone(),
            state,
            at: Utc::now(),
        };
        let callbacks = lock(&self.subscribers).callbacks(document_id);
        for callback in callbacks {
            callback(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct ScriptedSaver {
        saves: AtomicUsize,
        resolutions: Mutex<Vec<ConflictResolution>>,
        script: Mutex<VecDeque<ApdResult<CommitOutcome>>>,
    }

    impl ScriptedSaver {
        fn new(script: Vec<ApdResult<CommitOutcome>>) -> Arc<Self> {
            Arc::new(Self {
                saves: AtomicUsize::new(0),
                resolutions: Mutex::new(Vec::new()),
                script: Mutex::new(script.into()),
            })
        }

        fn saves(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }
    }

    impl DocumentSaver for ScriptedSaver {
        fn save(&self, _document_id: &DocumentId) -> ApdResult<CommitOutcome> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(committed()))
        }

        fn resolve_conflict(
            &self,
            _document_id: &DocumentId,
            resolution: ConflictResolution,
        ) -> ApdResult<()> {
            self.resolutions.lock().unwrap().push(resolution);
            Ok(())
        }
    }

    fn doc() -> DocumentId {
        DocumentId::new("apd-1").unwrap()
    }

    fn committed() -> CommitOutcome {
        CommitOutcome::Unchanged {
            head_version_id: VersionId::new("v1").unwrap(),
        }
    }

    fn ctx() -> ErrorContext {
        ErrorContext::for_document(Operation::AutoSave, &doc())
    }

    fn transient() -> ApdResult<CommitOutcome> {
        Err(ApdError::TransientStorage {
            context: ctx(),
            detail: "reader slot busy".into(),
        })
    }

    fn config() -> AutoSaveConfig {
        AutoSaveConfig {
            debounce_ms: 1000,
            max_retries: 2,
            backoff_base_ms: 100,
            backoff_max_ms: 1000,
        }
    }

    fn record(handle: &AutoSaveHandle) -> (Arc<Mutex<Vec<SaveState>>>, Unsubscribe) {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&states);
        let guard = handle.subscribe(&doc(), move |event| {
            sink.lock().unwrap().push(event.state.clone());
        });
        (states, guard)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_edits_saves_once() {
        let saver = ScriptedSaver::new(vec![]);
        let handle = AutoSaveScheduler::spawn(Arc::clone(&saver), config());
        let (states, _guard) = record(&handle);

        for _ in 0..5 {
            handle.notify_mutation(&doc());
            sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(saver.saves(), 0);

        sleep(Duration::from_millis(1100)).await;
        assert_eq!(saver.saves(), 1);
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                SaveState::Scheduled { attempt: 0 },
                SaveState::Saving,
                SaveState::Saved {
                    version_id: VersionId::new("v1").unwrap()
                },
                SaveState::Idle,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_backoff() {
        let saver = ScriptedSaver::new(vec![transient(), transient()]);
        let handle = AutoSaveScheduler::spawn(Arc::clone(&saver), config());

        handle.notify_mutation(&doc());
        sleep(Duration::from_millis(1050)).await;
        assert_eq!(saver.saves(), 1);
        assert_eq!(handle.status(&doc()).await, SaveState::Scheduled { attempt: 1 });

        // 100ms then 200ms of backoff.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(saver.saves(), 2);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(saver.saves(), 3);
        assert_eq!(handle.status(&doc()).await, SaveState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_wait_for_the_next_edit() {
        let saver = ScriptedSaver::new(vec![transient(), transient(), transient()]);
        let handle = AutoSaveScheduler::spawn(Arc::clone(&saver), config());

        handle.notify_mutation(&doc());
        sleep(Duration::from_secs(10)).await;
        assert_eq!(saver.saves(), 3);
        assert!(matches!(
            handle.status(&doc()).await,
            SaveState::Error { retrying: false, kind: ErrorKind::TransientStorage, .. }
        ));

        handle.notify_mutation(&doc());
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(saver.saves(), 4);
        assert_eq!(handle.status(&doc()).await, SaveState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn quota_errors_halt_until_resume() {
        let quota = Err(ApdError::QuotaExceeded {
            context: ctx(),
            detail: "map full".into(),
        });
        let saver = ScriptedSaver::new(vec![quota]);
        let handle = AutoSaveScheduler::spawn(Arc::clone(&saver), config());

        handle.notify_mutation(&doc());
        sleep(Duration::from_millis(1100)).await;
        handle.notify_mutation(&doc());
        sleep(Duration::from_secs(5)).await;
        assert_eq!(saver.saves(), 1);
        assert!(matches!(
            handle.status(&doc()).await,
            SaveState::Error { retrying: false, kind: ErrorKind::QuotaExceeded, .. }
        ));

        handle.resume(&doc());
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(saver.saves(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_stops_until_user_resolves() {
        let conflict = Err(ApdError::Conflict {
            context: ctx(),
            base_version_id: VersionId::new("v1").unwrap(),
            current_version_id: VersionId::new("v2").unwrap(),
        });
        let saver = ScriptedSaver::new(vec![conflict]);
        let handle = AutoSaveScheduler::spawn(Arc::clone(&saver), config());

        handle.notify_mutation(&doc());
        sleep(Duration::from_millis(1100)).await;
        assert!(matches!(handle.status(&doc()).await, SaveState::Conflict { .. }));

        handle.notify_mutation(&doc());
        sleep(Duration::from_secs(5)).await;
        assert_eq!(saver.saves(), 1);

        handle
            .resolve(&doc(), ConflictResolution::Overwrite)
            .await
            .unwrap();
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(saver.saves(), 2);
        assert_eq!(
            *saver.resolutions.lock().unwrap(),
            vec![ConflictResolution::Overwrite]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn offline_suspends_and_reconnect_saves_latest_state_once() {
        let saver = ScriptedSaver::new(vec![]);
        let handle = AutoSaveScheduler::spawn(Arc::clone(&saver), config());

        handle.notify_mutation(&doc());
        handle.set_online(false);
        assert_eq!(handle.status(&doc()).await, SaveState::Idle);
        for _ in 0..3 {
            handle.notify_mutation(&doc());
        }
        sleep(Duration::from_secs(30)).await;
        assert_eq!(saver.saves(), 0);

        handle.set_online(true);
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(saver.saves(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_subscription_receives_nothing() {
        let saver = ScriptedSaver::new(vec![]);
        let handle = AutoSaveScheduler::spawn(Arc::clone(&saver), config());
        let (states, guard) = record(&handle);
        guard.unsubscribe();

        handle.notify_mutation(&doc());
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(saver.saves(), 1);
        assert!(states.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_saves_immediately_and_cancels_the_timer() {
        let saver = ScriptedSaver::new(vec![]);
        let handle = AutoSaveScheduler::spawn(Arc::clone(&saver), config());

        handle.notify_mutation(&doc());
        let outcome = handle.flush(&doc()).await.unwrap();
        assert_eq!(outcome, Some(committed()));
        sleep(Duration::from_secs(5)).await;
        assert_eq!(saver.saves(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_pending_documents() {
        let saver = ScriptedSaver::new(vec![]);
        let handle = AutoSaveScheduler::spawn(Arc::clone(&saver), config());

        handle.notify_mutation(&doc());
        handle.shutdown().await;
        assert_eq!(saver.saves(), 1);

        handle.notify_mutation(&doc());
        sleep(Duration::from_secs(5)).await;
        assert_eq!(saver.saves(), 1);
        assert!(handle.flush(&doc()).await.is_err());
    }
}
