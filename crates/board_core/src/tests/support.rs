//! In-memory fakes for the remote seams, shared by the unit tests.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shared::{
    domain::{
        Board, BoardId, BoardSnapshot, Card, CardId, CardPatch, Comment, CommentId, List, ListId,
        NewComment, UserId,
    },
    error::{ApiException, ErrorCode},
    protocol::ChangeNotification,
};
use tokio::sync::{broadcast, mpsc, Semaphore};

use crate::{
    store::{OrderingStore, ReconcilePolicy, StoreEvent},
    BoardDataService, BoardError, PushChannel, PushSubscription, SubscriptionHandle,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    CreateList { list_id: ListId, order: i64 },
    CreateCard { card_id: CardId, list_id: ListId, order: i64 },
    UpdateCard { card_id: CardId, patch: CardPatch },
    UpdateCardPosition { card_id: CardId, list_id: ListId, order: i64 },
    UpdateListOrder { list_id: ListId, order: i64 },
    DeleteCard { card_id: CardId },
    CreateComment { task_id: CardId },
}

pub struct FakeService {
    snapshot: Mutex<BoardSnapshot>,
    comments: Mutex<Vec<Comment>>,
    calls: Mutex<Vec<RemoteCall>>,
    fetches: AtomicU64,
    fail_writes_with: Option<String>,
    fail_fetches: bool,
    write_gate: Option<Arc<Semaphore>>,
}

impl FakeService {
    pub fn new(snapshot: BoardSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
            comments: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fetches: AtomicU64::new(0),
            fail_writes_with: None,
            fail_fetches: false,
            write_gate: None,
        }
    }

    pub fn failing_writes(mut self, message: impl Into<String>) -> Self {
        self.fail_writes_with = Some(message.into());
        self
    }

    pub fn failing_fetches(mut self) -> Self {
        self.fail_fetches = true;
        self
    }

    /// Writes block until a permit is released on the returned semaphore.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.write_gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn with_comments(self, comments: Vec<Comment>) -> Self {
        *self.comments.lock().expect("comments") = comments;
        self
    }

    pub fn set_snapshot(&self, snapshot: BoardSnapshot) {
        *self.snapshot.lock().expect("snapshot") = snapshot;
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    async fn write(&self, call: RemoteCall) -> Result<(), BoardError> {
        self.calls.lock().expect("calls").push(call);
        if let Some(gate) = &self.write_gate {
            gate.acquire()
                .await
                .map_err(|err| BoardError::Push(err.to_string()))?
                .forget();
        }
        match &self.fail_writes_with {
            Some(message) => Err(ApiException::new(ErrorCode::Internal, message.clone()).into()),
            None => Ok(()),
        }
    }

    fn read_snapshot(&self) -> Result<BoardSnapshot, BoardError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetches {
            return Err(ApiException::new(ErrorCode::Internal, "snapshot unavailable").into());
        }
        Ok(self.snapshot.lock().expect("snapshot").clone())
    }
}

#[async_trait]
impl BoardDataService for FakeService {
    async fn fetch_board(&self, board_id: &BoardId) -> Result<Option<Board>, BoardError> {
        Ok(self
            .snapshot
            .lock()
            .expect("snapshot")
            .board
            .clone()
            .filter(|board| &board.id == board_id))
    }

    async fn fetch_lists(&self, board_id: &BoardId) -> Result<Vec<List>, BoardError> {
        Ok(self
            .snapshot
            .lock()
            .expect("snapshot")
            .lists
            .iter()
            .filter(|list| &list.board_id == board_id)
            .cloned()
            .collect())
    }

    async fn fetch_cards(&self, list_ids: &[ListId]) -> Result<Vec<Card>, BoardError> {
        Ok(self
            .snapshot
            .lock()
            .expect("snapshot")
            .cards
            .iter()
            .filter(|card| list_ids.contains(&card.list_id))
            .cloned()
            .collect())
    }

    async fn fetch_comments(&self, card_id: &CardId) -> Result<Vec<Comment>, BoardError> {
        Ok(self
            .comments
            .lock()
            .expect("comments")
            .iter()
            .filter(|comment| &comment.task_id == card_id)
            .cloned()
            .collect())
    }

    async fn create_list(&self, list: &List) -> Result<(), BoardError> {
        self.write(RemoteCall::CreateList {
            list_id: list.id.clone(),
            order: list.order,
        })
        .await
    }

    async fn create_card(&self, card: &Card) -> Result<(), BoardError> {
        self.write(RemoteCall::CreateCard {
            card_id: card.id.clone(),
            list_id: card.list_id.clone(),
            order: card.order,
        })
        .await
    }

    async fn update_card(&self, card_id: &CardId, patch: &CardPatch) -> Result<(), BoardError> {
        self.write(RemoteCall::UpdateCard {
            card_id: card_id.clone(),
            patch: patch.clone(),
        })
        .await
    }

    async fn update_card_position(
        &self,
        card_id: &CardId,
        list_id: &ListId,
        order: i64,
    ) -> Result<(), BoardError> {
        self.write(RemoteCall::UpdateCardPosition {
            card_id: card_id.clone(),
            list_id: list_id.clone(),
            order,
        })
        .await
    }

    async fn update_list_order(&self, list_id: &ListId, order: i64) -> Result<(), BoardError> {
        self.write(RemoteCall::UpdateListOrder {
            list_id: list_id.clone(),
            order,
        })
        .await
    }

    async fn delete_card(&self, card_id: &CardId) -> Result<(), BoardError> {
        self.write(RemoteCall::DeleteCard {
            card_id: card_id.clone(),
        })
        .await
    }

    async fn create_comment(&self, comment: &NewComment) -> Result<Comment, BoardError> {
        self.write(RemoteCall::CreateComment {
            task_id: comment.task_id.clone(),
        })
        .await?;
        let mut comments = self.comments.lock().expect("comments");
        let created_at = Utc::now();
        let created = Comment {
            id: CommentId::from(format!("c{}", comments.len() + 1)),
            task_id: comment.task_id.clone(),
            user_id: comment.user_id.clone(),
            content: comment.content.clone(),
            parent_id: comment.parent_id.clone(),
            created_at,
            updated_at: created_at,
        };
        comments.push(created.clone());
        Ok(created)
    }

    async fn fetch_snapshot(&self, board_id: &BoardId) -> Result<BoardSnapshot, BoardError> {
        let mut snapshot = self.read_snapshot()?;
        snapshot.lists.retain(|list| &list.board_id == board_id);
        Ok(snapshot)
    }
}

/// Push channel whose notifications are fed by the test through [`FakePush::sender`].
pub struct FakePush {
    senders: Mutex<Vec<mpsc::Sender<ChangeNotification>>>,
    subscribed: Mutex<Vec<BoardId>>,
    unsubscribed: Mutex<Vec<SubscriptionHandle>>,
    next_handle: AtomicU64,
    unsubscribe_signal: broadcast::Sender<SubscriptionHandle>,
}

impl FakePush {
    pub fn new() -> Self {
        let (unsubscribe_signal, _) = broadcast::channel(8);
        Self {
            senders: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            unsubscribe_signal,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<ChangeNotification> {
        self.senders
            .lock()
            .expect("senders")
            .last()
            .cloned()
            .expect("subscribe must be called first")
    }

    pub fn subscribed(&self) -> Vec<BoardId> {
        self.subscribed.lock().expect("subscribed").clone()
    }

    pub fn unsubscribed(&self) -> Vec<SubscriptionHandle> {
        self.unsubscribed.lock().expect("unsubscribed").clone()
    }

    pub fn watch_unsubscribes(&self) -> broadcast::Receiver<SubscriptionHandle> {
        self.unsubscribe_signal.subscribe()
    }
}

#[async_trait]
impl PushChannel for FakePush {
    async fn subscribe(&self, board_id: &BoardId) -> Result<PushSubscription, BoardError> {
        let (tx, notifications) = mpsc::channel(16);
        self.senders.lock().expect("senders").push(tx);
        self.subscribed
            .lock()
            .expect("subscribed")
            .push(board_id.clone());
        Ok(PushSubscription {
            handle: SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)),
            notifications,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BoardError> {
        self.unsubscribed
            .lock()
            .expect("unsubscribed")
            .push(handle);
        let _ = self.unsubscribe_signal.send(handle);
        Ok(())
    }
}

pub fn board_id() -> BoardId {
    BoardId::from("B1")
}

pub fn list(id: &str, order: i64) -> List {
    List {
        id: ListId::from(id),
        board_id: board_id(),
        title: format!("List {id}"),
        order,
    }
}

pub fn card(id: &str, list_id: &str, order: i64) -> Card {
    let mut card = Card::new(ListId::from(list_id), format!("Card {id}"), order);
    card.id = CardId::from(id);
    card
}

pub fn comment(id: &str, parent: Option<&str>, minute: u32) -> Comment {
    let created_at = Utc
        .with_ymd_and_hms(2026, 1, 5, 9, minute, 0)
        .single()
        .expect("timestamp");
    Comment {
        id: CommentId::from(id),
        task_id: CardId::from("C1"),
        user_id: UserId::from("u1"),
        content: format!("comment {id}"),
        parent_id: parent.map(CommentId::from),
        created_at,
        updated_at: created_at,
    }
}

pub fn snapshot(lists: Vec<List>, cards: Vec<Card>) -> BoardSnapshot {
    BoardSnapshot {
        board: Some(Board {
            id: board_id(),
            title: "Launch".to_string(),
            workspace_id: None,
        }),
        lists,
        cards,
    }
}

pub async fn seeded_store(
    service: Arc<FakeService>,
    policy: ReconcilePolicy,
) -> OrderingStore {
    OrderingStore::load(board_id(), service, policy)
        .await
        .expect("load store")
}

pub async fn next_event(events: &mut broadcast::Receiver<StoreEvent>) -> StoreEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("store event timeout")
        .expect("store event")
}

/// Skips events until one matching `predicate` arrives.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<StoreEvent>, predicate: F) -> StoreEvent
where
    F: Fn(&StoreEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if predicate(&event) {
            return event;
        }
    }
}
