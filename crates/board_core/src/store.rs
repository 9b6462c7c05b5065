//! In-memory authoritative view of one board session.
//!
//! Every mutation is applied to local state before the call returns and is then
//! persisted by a detached task. Failures never roll back local state; they are
//! reported through the returned [`MutationTicket`] and the store event bus.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use shared::domain::{
    Board, BoardId, BoardSnapshot, Card, CardId, CardPatch, List, ListId, Priority, UserId,
};
use tokio::{
    runtime::Handle,
    sync::{broadcast, oneshot},
};
use tracing::{debug, info, warn};

use crate::{
    error::{BoardError, PersistenceError},
    rank, BoardDataService,
};

const STORE_EVENT_CAPACITY: usize = 256;

/// What a reconciliation does with local mutations whose persistence has not completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconcilePolicy {
    /// The fetched snapshot replaces local state wholesale; unconfirmed local
    /// mutations are overwritten.
    #[default]
    ReplaceSnapshot,
    /// Unconfirmed local mutations are re-applied, in sequence order, on top of
    /// the fetched snapshot.
    ReplayPending,
}

impl ReconcilePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReplaceSnapshot => "replace",
            Self::ReplayPending => "replay",
        }
    }
}

impl FromStr for ReconcilePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" | "replace_snapshot" => Ok(Self::ReplaceSnapshot),
            "replay" | "replay_pending" => Ok(Self::ReplayPending),
            other => Err(format!("unknown reconcile policy '{other}'")),
        }
    }
}

impl fmt::Display for ReconcilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    AddList,
    AddCard,
    EditCard,
    DeleteCard,
    MoveCard,
    MoveList,
    RankList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Changed,
    Persisted { seq: u64 },
    PersistFailed(PersistenceError),
    Reconciled { replayed: usize },
}

/// Handle on the remote write issued for one optimistic mutation.
#[derive(Debug)]
pub struct MutationTicket {
    pub seq: u64,
    pub kind: MutationKind,
    outcome: oneshot::Receiver<Result<(), PersistenceError>>,
}

impl MutationTicket {
    /// Waits for the remote write to finish. Local state is unaffected either way.
    pub async fn outcome(self) -> Result<(), PersistenceError> {
        let Self { seq, kind, outcome } = self;
        outcome.await.unwrap_or_else(|_| {
            Err(PersistenceError {
                seq,
                kind,
                message: "persistence task ended without reporting".to_string(),
            })
        })
    }
}

#[derive(Debug, Clone)]
enum LocalMutation {
    AddList(List),
    AddCard(Card),
    EditCard {
        card_id: CardId,
        patch: CardPatch,
    },
    DeleteCard {
        card_id: CardId,
    },
    MoveCard {
        card_id: CardId,
        list_id: ListId,
        order: i64,
    },
    MoveList {
        list_id: ListId,
        order: i64,
    },
    RankList {
        list_id: ListId,
        order: i64,
    },
}

impl LocalMutation {
    fn kind(&self) -> MutationKind {
        match self {
            Self::AddList(_) => MutationKind::AddList,
            Self::AddCard(_) => MutationKind::AddCard,
            Self::EditCard { .. } => MutationKind::EditCard,
            Self::DeleteCard { .. } => MutationKind::DeleteCard,
            Self::MoveCard { .. } => MutationKind::MoveCard,
            Self::MoveList { .. } => MutationKind::MoveList,
            Self::RankList { .. } => MutationKind::RankList,
        }
    }

    /// Applies the mutation to `state`. Returns false when its target is gone.
    fn apply(&self, state: &mut StoreState) -> bool {
        match self {
            Self::AddList(list) => {
                state
                    .lists
                    .entry(list.id.clone())
                    .or_insert_with(|| list.clone());
                true
            }
            Self::AddCard(card) => {
                if !state.lists.contains_key(&card.list_id) {
                    return false;
                }
                state
                    .cards
                    .entry(card.id.clone())
                    .or_insert_with(|| card.clone());
                true
            }
            Self::EditCard { card_id, patch } => match state.cards.get_mut(card_id) {
                Some(card) => {
                    patch.apply_to(card);
                    true
                }
                None => false,
            },
            Self::DeleteCard { card_id } => state.cards.remove(card_id).is_some(),
            Self::MoveCard {
                card_id,
                list_id,
                order,
            } => {
                if !state.lists.contains_key(list_id) {
                    return false;
                }
                match state.cards.get_mut(card_id) {
                    Some(card) => {
                        card.list_id = list_id.clone();
                        card.order = *order;
                        true
                    }
                    None => false,
                }
            }
            // Persist-only: the local sequence is re-sorted once the change comes back.
            Self::MoveList { list_id, .. } => state.lists.contains_key(list_id),
            Self::RankList { list_id, order } => match state.lists.get_mut(list_id) {
                Some(list) => {
                    list.order = *order;
                    true
                }
                None => false,
            },
        }
    }

    async fn persist(&self, service: &dyn BoardDataService) -> Result<(), BoardError> {
        match self {
            Self::AddList(list) => service.create_list(list).await,
            Self::AddCard(card) => service.create_card(card).await,
            Self::EditCard { card_id, patch } => service.update_card(card_id, patch).await,
            Self::DeleteCard { card_id } => service.delete_card(card_id).await,
            Self::MoveCard {
                card_id,
                list_id,
                order,
            } => service.update_card_position(card_id, list_id, *order).await,
            Self::MoveList { list_id, order } | Self::RankList { list_id, order } => {
                service.update_list_order(list_id, *order).await
            }
        }
    }
}

struct StoreState {
    boards: HashMap<BoardId, Board>,
    lists: HashMap<ListId, List>,
    cards: HashMap<CardId, Card>,
    next_seq: u64,
    pending: BTreeMap<u64, LocalMutation>,
    /// Bumped every time a pending mutation's persistence call completes.
    ack_epoch: u64,
    /// Mark of the newest snapshot applied so far.
    applied_mark: u64,
    /// Persisted mutations keyed by seq, tagged with the epoch of their
    /// acknowledgement. A snapshot marked before that epoch may predate them.
    settled: BTreeMap<u64, (u64, LocalMutation)>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            boards: HashMap::new(),
            lists: HashMap::new(),
            cards: HashMap::new(),
            next_seq: 1,
            pending: BTreeMap::new(),
            ack_epoch: 0,
            applied_mark: 0,
            settled: BTreeMap::new(),
        }
    }

    fn load(&mut self, snapshot: BoardSnapshot) {
        self.boards = snapshot
            .board
            .into_iter()
            .map(|board| (board.id.clone(), board))
            .collect();
        self.lists = snapshot
            .lists
            .into_iter()
            .map(|list| (list.id.clone(), list))
            .collect();
        self.cards = snapshot
            .cards
            .into_iter()
            .map(|card| (card.id.clone(), card))
            .collect();
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn sorted_lists(&self, board_id: &BoardId) -> Vec<List> {
        let mut lists = self
            .lists
            .values()
            .filter(|list| &list.board_id == board_id)
            .cloned()
            .collect::<Vec<_>>();
        lists.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        lists
    }

    fn sorted_cards(&self, list_id: &ListId) -> Vec<Card> {
        let mut cards = self
            .cards
            .values()
            .filter(|card| &card.list_id == list_id)
            .cloned()
            .collect::<Vec<_>>();
        cards.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        cards
    }

    fn card_count(&self, list_id: &ListId) -> usize {
        self.cards
            .values()
            .filter(|card| &card.list_id == list_id)
            .count()
    }

    fn list_count(&self, board_id: &BoardId) -> usize {
        self.lists
            .values()
            .filter(|list| &list.board_id == board_id)
            .count()
    }
}

/// Acknowledgement epoch observed when a snapshot fetch started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotMark(u64);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardFilter {
    pub priority: Option<Priority>,
    pub assignee: Option<UserId>,
    pub overdue: bool,
}

impl BoardFilter {
    pub fn is_active(&self) -> bool {
        self.priority.is_some() || self.assignee.is_some() || self.overdue
    }

    pub fn matches(&self, card: &Card, today: NaiveDate) -> bool {
        if self.priority.is_some_and(|priority| card.priority != priority) {
            return false;
        }
        if self
            .assignee
            .as_ref()
            .is_some_and(|assignee| card.assignee.as_ref() != Some(assignee))
        {
            return false;
        }
        !self.overdue || card.is_overdue(today)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListView {
    pub list: List,
    pub cards: Vec<Card>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoardView {
    pub board: Option<Board>,
    pub lists: Vec<ListView>,
}

struct StoreInner {
    board_id: BoardId,
    service: Arc<dyn BoardDataService>,
    runtime: Handle,
    policy: ReconcilePolicy,
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl StoreInner {
    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State container for one board session. Cloning shares the same state.
#[derive(Clone)]
pub struct OrderingStore {
    inner: Arc<StoreInner>,
}

impl OrderingStore {
    /// Creates an empty store. Must be called from within a tokio runtime, which
    /// is used to run persistence tasks.
    pub fn new(
        board_id: BoardId,
        service: Arc<dyn BoardDataService>,
        policy: ReconcilePolicy,
    ) -> Result<Self, BoardError> {
        let runtime =
            Handle::try_current().map_err(|err| BoardError::RuntimeUnavailable(err.to_string()))?;
        let (events, _) = broadcast::channel(STORE_EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                board_id,
                service,
                runtime,
                policy,
                state: Mutex::new(StoreState::new()),
                events,
            }),
        })
    }

    /// Creates a store seeded with the current remote snapshot of `board_id`.
    pub async fn load(
        board_id: BoardId,
        service: Arc<dyn BoardDataService>,
        policy: ReconcilePolicy,
    ) -> Result<Self, BoardError> {
        let snapshot = service.fetch_snapshot(&board_id).await?;
        let store = Self::new(board_id, service, policy)?;
        info!(
            board_id = %store.inner.board_id,
            lists = snapshot.lists.len(),
            cards = snapshot.cards.len(),
            "store: loaded board snapshot"
        );
        store.inner.lock_state().load(snapshot);
        Ok(store)
    }

    pub fn board_id(&self) -> &BoardId {
        &self.inner.board_id
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.inner.policy
    }

    pub fn service(&self) -> Arc<dyn BoardDataService> {
        Arc::clone(&self.inner.service)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn board(&self) -> Option<Board> {
        self.inner
            .lock_state()
            .boards
            .get(&self.inner.board_id)
            .cloned()
    }

    /// Lists of the session board, sorted by rank.
    pub fn lists(&self) -> Vec<List> {
        self.inner.lock_state().sorted_lists(&self.inner.board_id)
    }

    pub fn list(&self, list_id: &ListId) -> Option<List> {
        self.inner.lock_state().lists.get(list_id).cloned()
    }

    /// Cards of `list_id`, sorted by rank.
    pub fn cards_in_list(&self, list_id: &ListId) -> Vec<Card> {
        self.inner.lock_state().sorted_cards(list_id)
    }

    pub fn card(&self, card_id: &CardId) -> Option<Card> {
        self.inner.lock_state().cards.get(card_id).cloned()
    }

    pub fn card_count(&self, list_id: &ListId) -> usize {
        self.inner.lock_state().card_count(list_id)
    }

    /// Number of mutations whose remote write has not completed yet.
    pub fn pending_mutations(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    pub fn view(&self, filter: &BoardFilter) -> BoardView {
        self.view_on(filter, Utc::now().date_naive())
    }

    pub fn view_on(&self, filter: &BoardFilter, today: NaiveDate) -> BoardView {
        let state = self.inner.lock_state();
        let lists = state
            .sorted_lists(&self.inner.board_id)
            .into_iter()
            .map(|list| {
                let cards = state
                    .sorted_cards(&list.id)
                    .into_iter()
                    .filter(|card| filter.matches(card, today))
                    .collect();
                ListView { list, cards }
            })
            .collect();
        BoardView {
            board: state.boards.get(&self.inner.board_id).cloned(),
            lists,
        }
    }

    pub fn add_list(&self, board_id: &BoardId, title: &str) -> Option<MutationTicket> {
        let title = title.trim();
        self.commit(|state| {
            if title.is_empty() {
                debug!(%board_id, "store: ignoring list with empty title");
                return None;
            }
            if board_id != &self.inner.board_id && !state.boards.contains_key(board_id) {
                debug!(%board_id, "store: ignoring list for unknown board");
                return None;
            }
            Some(LocalMutation::AddList(List {
                id: ListId::generate(),
                board_id: board_id.clone(),
                title: title.to_string(),
                order: state.list_count(board_id) as i64,
            }))
        })
    }

    pub fn add_card(&self, list_id: &ListId, content: &str) -> Option<MutationTicket> {
        let content = content.trim();
        self.commit(|state| {
            if content.is_empty() {
                debug!(%list_id, "store: ignoring card with empty content");
                return None;
            }
            if !state.lists.contains_key(list_id) {
                debug!(%list_id, "store: ignoring card for unknown list");
                return None;
            }
            let order = state.card_count(list_id) as i64;
            Some(LocalMutation::AddCard(Card::new(
                list_id.clone(),
                content,
                order,
            )))
        })
    }

    pub fn edit_card(&self, card_id: &CardId, patch: CardPatch) -> Option<MutationTicket> {
        self.commit(|state| {
            if patch.is_empty() {
                return None;
            }
            if patch
                .content
                .as_deref()
                .is_some_and(|content| content.trim().is_empty())
            {
                debug!(%card_id, "store: ignoring edit with empty content");
                return None;
            }
            if !state.cards.contains_key(card_id) {
                debug!(%card_id, "store: ignoring edit for unknown card");
                return None;
            }
            Some(LocalMutation::EditCard {
                card_id: card_id.clone(),
                patch,
            })
        })
    }

    pub fn delete_card(&self, card_id: &CardId) -> Option<MutationTicket> {
        self.commit(|state| {
            if !state.cards.contains_key(card_id) {
                debug!(%card_id, "store: ignoring delete for unknown card");
                return None;
            }
            Some(LocalMutation::DeleteCard {
                card_id: card_id.clone(),
            })
        })
    }

    /// Rewrites only this card's list and rank. Siblings keep their ranks; ties are
    /// broken by id when sorting.
    pub fn move_card(
        &self,
        card_id: &CardId,
        list_id: &ListId,
        order: i64,
    ) -> Option<MutationTicket> {
        self.commit(|state| {
            if !state.cards.contains_key(card_id) || !state.lists.contains_key(list_id) {
                debug!(%card_id, %list_id, "store: ignoring move for unknown card or list");
                return None;
            }
            Some(LocalMutation::MoveCard {
                card_id: card_id.clone(),
                list_id: list_id.clone(),
                order,
            })
        })
    }

    /// Persists a new rank for `list_id` without touching the local sequence; the
    /// local order follows once reconciliation brings the change back.
    pub fn move_list(&self, list_id: &ListId, order: i64) -> Option<MutationTicket> {
        self.commit(|state| {
            if !state.lists.contains_key(list_id) {
                debug!(%list_id, "store: ignoring move for unknown list");
                return None;
            }
            Some(LocalMutation::MoveList {
                list_id: list_id.clone(),
                order,
            })
        })
    }

    /// Moves `card_id` to the position currently held by `over_id` within the same
    /// list, re-ranking as few cards as possible.
    pub fn reorder_card(&self, card_id: &CardId, over_id: &CardId) -> Vec<MutationTicket> {
        let (list_id, assignments) = {
            let state = self.inner.lock_state();
            let (Some(card), Some(over)) = (state.cards.get(card_id), state.cards.get(over_id))
            else {
                return Vec::new();
            };
            if card_id == over_id || card.list_id != over.list_id {
                return Vec::new();
            }
            let mut siblings = state.sorted_cards(&card.list_id);
            let (Some(from), Some(to)) = (
                siblings.iter().position(|c| &c.id == card_id),
                siblings.iter().position(|c| &c.id == over_id),
            ) else {
                return Vec::new();
            };
            rank::move_item(&mut siblings, from, to);
            let ranks = siblings.iter().map(|c| c.order).collect::<Vec<_>>();
            let assignments = rank::plan(&ranks, to)
                .into_iter()
                .map(|(idx, order)| (siblings[idx].id.clone(), order))
                .collect::<Vec<_>>();
            (card.list_id.clone(), assignments)
        };

        debug!(%card_id, %over_id, reranked = assignments.len(), "store: reordering card within list");
        assignments
            .into_iter()
            .filter_map(|(id, order)| self.move_card(&id, &list_id, order))
            .collect()
    }

    /// Moves `list_id` to the position currently held by `over_id`, applying the new
    /// ranks locally and persisting each one.
    pub fn reorder_list(&self, list_id: &ListId, over_id: &ListId) -> Vec<MutationTicket> {
        let assignments = {
            let state = self.inner.lock_state();
            let (Some(list), Some(over)) = (state.lists.get(list_id), state.lists.get(over_id))
            else {
                return Vec::new();
            };
            if list_id == over_id || list.board_id != over.board_id {
                return Vec::new();
            }
            let mut lists = state.sorted_lists(&list.board_id);
            let (Some(from), Some(to)) = (
                lists.iter().position(|l| &l.id == list_id),
                lists.iter().position(|l| &l.id == over_id),
            ) else {
                return Vec::new();
            };
            rank::move_item(&mut lists, from, to);
            let ranks = lists.iter().map(|l| l.order).collect::<Vec<_>>();
            rank::plan(&ranks, to)
                .into_iter()
                .map(|(idx, order)| (lists[idx].id.clone(), order))
                .collect::<Vec<_>>()
        };

        debug!(%list_id, %over_id, reranked = assignments.len(), "store: reordering list");
        assignments
            .into_iter()
            .filter_map(|(id, order)| {
                self.commit(|_| {
                    Some(LocalMutation::RankList {
                        list_id: id.clone(),
                        order,
                    })
                })
            })
            .collect()
    }

    /// Acknowledgement position to capture right before fetching a snapshot.
    pub fn snapshot_mark(&self) -> SnapshotMark {
        SnapshotMark(self.inner.lock_state().ack_epoch)
    }

    /// Replaces local state with a snapshot fetched just now.
    /// Returns the number of local mutations re-applied.
    pub fn apply_snapshot(&self, snapshot: BoardSnapshot) -> usize {
        let mark = self.snapshot_mark();
        self.apply_snapshot_from(mark, snapshot)
    }

    /// Replaces local state with `snapshot`, whose fetch started at `mark`, then
    /// applies the reconcile policy. Under `ReplayPending` this re-applies every
    /// unacknowledged mutation plus those acknowledged after `mark`. A snapshot
    /// marked older than one already applied is discarded.
    pub fn apply_snapshot_from(&self, mark: SnapshotMark, snapshot: BoardSnapshot) -> usize {
        let (replayed, unconfirmed) = {
            let mut state = self.inner.lock_state();
            if mark.0 < state.applied_mark {
                debug!(
                    board_id = %self.inner.board_id,
                    mark = mark.0,
                    applied = state.applied_mark,
                    "store: discarding snapshot older than the last one applied"
                );
                return 0;
            }
            state.applied_mark = mark.0;
            state.settled.retain(|_, (epoch, _)| *epoch > mark.0);
            state.load(snapshot);

            let unconfirmed = state.pending.len() + state.settled.len();
            let replayed = match self.inner.policy {
                ReconcilePolicy::ReplaceSnapshot => 0,
                ReconcilePolicy::ReplayPending => {
                    let mut mutations = state
                        .settled
                        .iter()
                        .map(|(seq, (_, mutation))| (*seq, mutation.clone()))
                        .collect::<BTreeMap<_, _>>();
                    mutations.extend(
                        state
                            .pending
                            .iter()
                            .map(|(seq, mutation)| (*seq, mutation.clone())),
                    );
                    mutations
                        .values()
                        .filter(|mutation| mutation.apply(&mut *state))
                        .count()
                }
            };
            (replayed, unconfirmed)
        };

        if unconfirmed > replayed {
            info!(
                board_id = %self.inner.board_id,
                unconfirmed,
                replayed,
                policy = %self.inner.policy,
                "store: snapshot overwrote unconfirmed local mutations"
            );
        }
        let _ = self.inner.events.send(StoreEvent::Reconciled { replayed });
        replayed
    }

    fn commit<F>(&self, build: F) -> Option<MutationTicket>
    where
        F: FnOnce(&StoreState) -> Option<LocalMutation>,
    {
        let (seq, mutation) = {
            let mut state = self.inner.lock_state();
            let mutation = build(&*state)?;
            if !mutation.apply(&mut *state) {
                return None;
            }
            let seq = state.take_seq();
            state.pending.insert(seq, mutation.clone());
            (seq, mutation)
        };

        debug!(seq, kind = ?mutation.kind(), "store: applied optimistic mutation");
        if mutation.kind() != MutationKind::MoveList {
            let _ = self.inner.events.send(StoreEvent::Changed);
        }
        Some(self.spawn_persist(seq, mutation))
    }

    fn spawn_persist(&self, seq: u64, mutation: LocalMutation) -> MutationTicket {
        let kind = mutation.kind();
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let result = mutation.persist(inner.service.as_ref()).await;
            {
                let mut state = inner.lock_state();
                if let Some(mutation) = state.pending.remove(&seq) {
                    state.ack_epoch += 1;
                    if result.is_ok() && inner.policy == ReconcilePolicy::ReplayPending {
                        let epoch = state.ack_epoch;
                        state.settled.insert(seq, (epoch, mutation));
                    }
                }
            }
            let outcome = match result {
                Ok(()) => {
                    debug!(seq, ?kind, "store: mutation persisted");
                    let _ = inner.events.send(StoreEvent::Persisted { seq });
                    Ok(())
                }
                Err(err) => {
                    warn!(
                        seq,
                        ?kind,
                        error = %err,
                        "store: failed to persist mutation; keeping optimistic state"
                    );
                    let failure = PersistenceError {
                        seq,
                        kind,
                        message: err.to_string(),
                    };
                    let _ = inner.events.send(StoreEvent::PersistFailed(failure.clone()));
                    Err(failure)
                }
            };
            let _ = tx.send(outcome);
        });
        MutationTicket {
            seq,
            kind,
            outcome: rx,
        }
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
