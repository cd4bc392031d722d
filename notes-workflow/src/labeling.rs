use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventSender, WorkflowEvent};
use crate::service::InferenceService;
use crate::types::{LabelableItem, Result, SentenceLabel, WorkflowError};

/// Where an entry's label stands relative to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Confirmed,
    /// Shown locally, submit still in flight. `previous` is the last label the server holds.
    Optimistic { previous: Option<SentenceLabel> },
    /// The last submit failed and the label was put back.
    RolledBack { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub item: LabelableItem,
    pub sync: SyncState,
    // Label of the last submit the server acknowledged, or the loaded label.
    server_label: Option<SentenceLabel>,
    // 0 until decided; decisions draw from a counter that survives reloads.
    revision: u64,
}

impl QueueEntry {
    fn new(item: LabelableItem) -> Self {
        Self {
            server_label: item.last_label,
            item,
            sync: SyncState::Confirmed,
            revision: 0,
        }
    }

    pub fn server_label(&self) -> Option<SentenceLabel> {
        self.server_label
    }

    pub fn is_labeled(&self) -> bool {
        self.item.last_label.is_some()
    }

    pub fn is_flagged(&self) -> bool {
        matches!(self.sync, SyncState::RolledBack { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Confirmed,
    RolledBack { reason: String },
    /// The entry was decided again (or reloaded) before this submit finished.
    Superseded,
    /// The submit task did not run to completion.
    Abandoned,
}

/// The in-flight remote submit started by [`OptimisticQueueController::decide`].
pub struct SubmitHandle {
    handle: JoinHandle<SubmitOutcome>,
}

impl SubmitHandle {
    pub async fn outcome(self) -> SubmitOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Label submit task ended abnormally: {}", e);
                SubmitOutcome::Abandoned
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInput {
    Char(char),
    ArrowUp,
    ArrowDown,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFocus {
    Document,
    /// A free-text field has focus; shortcuts belong to it.
    TextInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCommand {
    Decide(SentenceLabel),
    MoveUp,
    MoveDown,
}

pub fn command_for_key(key: KeyInput, focus: InputFocus) -> Option<QueueCommand> {
    if focus == InputFocus::TextInput {
        return None;
    }
    match key {
        KeyInput::Char('k' | 'K') => Some(QueueCommand::Decide(SentenceLabel::Keep)),
        KeyInput::Char('r' | 'R') => Some(QueueCommand::Decide(SentenceLabel::Remove)),
        KeyInput::ArrowUp => Some(QueueCommand::MoveUp),
        KeyInput::ArrowDown => Some(QueueCommand::MoveDown),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<QueueEntry>,
    cursor: Option<usize>,
}

impl QueueState {
    fn from_items(mut items: Vec<LabelableItem>) -> Self {
        items.sort_by_key(|item| item.ordinal_position);
        let entries: Vec<QueueEntry> = items.into_iter().map(QueueEntry::new).collect();
        let cursor = (!entries.is_empty()).then_some(0);
        Self { entries, cursor }
    }

    fn labeled(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_labeled()).count()
    }
}

/// A labeling session over an ordered run of sentences.
pub struct OptimisticQueueController {
    service: Arc<dyn InferenceService>,
    state: Arc<RwLock<QueueState>>,
    events: EventSender,
    in_flight: Arc<AtomicUsize>,
    revisions: AtomicU64,
}

impl OptimisticQueueController {
    pub fn from_items(service: Arc<dyn InferenceService>, items: Vec<LabelableItem>, events: EventSender) -> Self {
        Self {
            service,
            state: Arc::new(RwLock::new(QueueState::from_items(items))),
            events,
            in_flight: Arc::new(AtomicUsize::new(0)),
            revisions: AtomicU64::new(0),
        }
    }

    /// Start a session from the service's current sentence list.
    pub async fn load(service: Arc<dyn InferenceService>, events: EventSender) -> Result<Self> {
        let items = service.list_labelable_items().await?;
        info!("Loaded {} sentences for labeling from {}", items.len(), service.service_name());
        Ok(Self::from_items(service, items, events))
    }

    /// Replace the session contents with a fresh list from the service.
    /// Submits still in flight settle against the fresh entries by item id.
    pub async fn reload(&self) -> Result<usize> {
        let items = self.service.list_labelable_items().await?;
        let mut state = self.state.write().await;
        *state = QueueState::from_items(items);
        Ok(state.entries.len())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn cursor(&self) -> Option<usize> {
        self.state.read().await.cursor
    }

    pub async fn entries(&self) -> Vec<QueueEntry> {
        self.state.read().await.entries.clone()
    }

    pub async fn entry(&self, index: usize) -> Option<QueueEntry> {
        self.state.read().await.entries.get(index).cloned()
    }

    pub async fn active_entry(&self) -> Option<QueueEntry> {
        let state = self.state.read().await;
        state.cursor.and_then(|cursor| state.entries.get(cursor).cloned())
    }

    pub fn pending_submissions(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn labeled_count(&self) -> usize {
        self.state.read().await.labeled()
    }

    /// Share of labeled entries, rounded to a whole percent. Zero for an empty session.
    pub async fn progress_percent(&self) -> u8 {
        let state = self.state.read().await;
        let total = state.entries.len();
        if total == 0 {
            return 0;
        }
        (100.0 * state.labeled() as f64 / total as f64).round() as u8
    }

    pub async fn move_up(&self) -> Option<usize> {
        let mut state = self.state.write().await;
        if let Some(cursor) = state.cursor {
            state.cursor = Some(cursor.saturating_sub(1));
        }
        state.cursor
    }

    pub async fn move_down(&self) -> Option<usize> {
        let mut state = self.state.write().await;
        let last = state.entries.len().saturating_sub(1);
        if let Some(cursor) = state.cursor {
            state.cursor = Some((cursor + 1).min(last));
        }
        state.cursor
    }

    /// Label the entry at `index` right away and submit it in the background.
    pub async fn decide(&self, index: usize, label: SentenceLabel) -> Result<SubmitHandle> {
        let revision = self.revisions.fetch_add(1, Ordering::SeqCst) + 1;
        let item_id = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let len = state.entries.len();
            let entry = state.entries.get_mut(index).ok_or_else(|| {
                WorkflowError::Validation(format!("index {} is outside a session of {} sentences", index, len))
            })?;

            entry.revision = revision;
            entry.item.last_label = Some(label);
            entry.sync = SyncState::Optimistic {
                previous: entry.server_label,
            };

            if state.cursor == Some(index) && index + 1 < len {
                state.cursor = Some(index + 1);
            }
            entry.item.id.clone()
        };

        debug!("Submitting {} for sentence {} (revision {})", label, item_id, revision);
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let service = self.service.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let in_flight = self.in_flight.clone();
        let handle = tokio::spawn(async move {
            let result = service.submit_label(&item_id, label).await;
            let outcome = settle(&state, &events, &item_id, label, revision, result).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome
        });
        Ok(SubmitHandle { handle })
    }

    /// Decide the entry under the cursor. `None` for an empty session.
    pub async fn decide_active(&self, label: SentenceLabel) -> Result<Option<SubmitHandle>> {
        match self.cursor().await {
            Some(cursor) => self.decide(cursor, label).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn handle_key(&self, key: KeyInput, focus: InputFocus) -> Result<Option<SubmitHandle>> {
        match command_for_key(key, focus) {
            Some(QueueCommand::Decide(label)) => self.decide_active(label).await,
            Some(QueueCommand::MoveUp) => {
                self.move_up().await;
                Ok(None)
            }
            Some(QueueCommand::MoveDown) => {
                self.move_down().await;
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Reconcile a finished submit against whatever the entry looks like now.
async fn settle(
    state: &RwLock<QueueState>,
    events: &EventSender,
    item_id: &str,
    label: SentenceLabel,
    revision: u64,
    result: Result<()>,
) -> SubmitOutcome {
    let mut state = state.write().await;
    let entry = state.entries.iter_mut().find(|entry| entry.item.id == item_id);

    match result {
        Ok(()) => {
            events.emit(WorkflowEvent::LabelConfirmed {
                item_id: item_id.to_string(),
                label,
            });
            let Some(entry) = entry else {
                return SubmitOutcome::Superseded;
            };
            entry.server_label = Some(label);

            if entry.revision == revision {
                entry.item.last_label = Some(label);
                entry.sync = SyncState::Confirmed;
                return SubmitOutcome::Confirmed;
            }
            if matches!(entry.sync, SyncState::Optimistic { .. }) {
                // A newer decision is still in flight and will settle the entry itself.
                entry.sync = SyncState::Optimistic { previous: Some(label) };
            } else {
                // Nothing newer is pending, so show what the server now holds.
                entry.item.last_label = Some(label);
                entry.sync = SyncState::Confirmed;
            }
            SubmitOutcome::Superseded
        }
        Err(e) => {
            let reason = e.to_string();
            let rolled_back = match entry {
                Some(entry) if entry.revision == revision => {
                    entry.item.last_label = entry.server_label;
                    entry.sync = SyncState::RolledBack { reason: reason.clone() };
                    true
                }
                _ => false,
            };
            warn!(
                "Label {} for sentence {} failed: {}{}",
                label,
                item_id,
                reason,
                if rolled_back { ", rolled back" } else { "" }
            );
            events.emit(WorkflowEvent::LabelSubmitFailed {
                item_id: item_id.to_string(),
                label,
                rolled_back,
                reason: reason.clone(),
            });
            if rolled_back {
                SubmitOutcome::RolledBack { reason }
            } else {
                SubmitOutcome::Superseded
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shortcuts_are_ignored_while_typing() {
        assert_eq!(
            command_for_key(KeyInput::Char('K'), InputFocus::Document),
            Some(QueueCommand::Decide(SentenceLabel::Keep))
        );
        assert_eq!(
            command_for_key(KeyInput::Char('r'), InputFocus::Document),
            Some(QueueCommand::Decide(SentenceLabel::Remove))
        );
        assert_eq!(command_for_key(KeyInput::ArrowUp, InputFocus::Document), Some(QueueCommand::MoveUp));
        assert_eq!(command_for_key(KeyInput::Char('x'), InputFocus::Document), None);
        assert_eq!(command_for_key(KeyInput::Char('k'), InputFocus::TextInput), None);
        assert_eq!(command_for_key(KeyInput::ArrowDown, InputFocus::TextInput), None);
    }

    #[test]
    fn session_orders_by_position() {
        let items = vec![
            LabelableItem {
                id: "b".to_string(),
                text: "Second.".to_string(),
                last_label: None,
                ordinal_position: 1,
            },
            LabelableItem {
                id: "a".to_string(),
                text: "First.".to_string(),
                last_label: None,
                ordinal_position: 0,
            },
        ];
        let state = QueueState::from_items(items);
        assert_eq!(state.entries[0].item.id, "a");
        assert_eq!(state.cursor, Some(0));
        assert_eq!(QueueState::from_items(Vec::new()).cursor, None);
    }
}
