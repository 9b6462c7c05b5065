use async_trait::async_trait;
use shared::domain::{
    Board, BoardId, BoardSnapshot, Card, CardId, CardPatch, Comment, List, ListId, NewComment,
};
use shared::protocol::ChangeNotification;
use tokio::sync::mpsc;

pub mod comments;
pub mod drag;
pub mod error;
pub mod http;
pub mod push;
pub mod rank;
pub mod reconcile;
pub mod store;

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

pub use comments::{build_comment_tree, fetch_comment_tree, flatten, post_comment, CommentNode};
pub use drag::{DragOutcome, DragReorderController, DragState, ItemKind};
pub use error::{BoardError, PersistenceError};
pub use http::HttpBoardService;
pub use push::{push_url_from_api_url, WsPushChannel};
pub use reconcile::{ReconcilerGuard, RemoteChangeReconciler};
pub use store::{
    BoardFilter, BoardView, ListView, MutationKind, MutationTicket, OrderingStore,
    ReconcilePolicy, SnapshotMark, StoreEvent,
};

/// Remote source of truth for boards, lists, cards and comments.
#[async_trait]
pub trait BoardDataService: Send + Sync {
    async fn fetch_board(&self, board_id: &BoardId) -> Result<Option<Board>, BoardError>;
    async fn fetch_lists(&self, board_id: &BoardId) -> Result<Vec<List>, BoardError>;
    async fn fetch_cards(&self, list_ids: &[ListId]) -> Result<Vec<Card>, BoardError>;
    async fn fetch_comments(&self, card_id: &CardId) -> Result<Vec<Comment>, BoardError>;
    async fn create_list(&self, list: &List) -> Result<(), BoardError>;
    async fn create_card(&self, card: &Card) -> Result<(), BoardError>;
    async fn update_card(&self, card_id: &CardId, patch: &CardPatch) -> Result<(), BoardError>;
    async fn update_card_position(
        &self,
        card_id: &CardId,
        list_id: &ListId,
        order: i64,
    ) -> Result<(), BoardError>;
    async fn update_list_order(&self, list_id: &ListId, order: i64) -> Result<(), BoardError>;
    async fn delete_card(&self, card_id: &CardId) -> Result<(), BoardError>;
    async fn create_comment(&self, comment: &NewComment) -> Result<Comment, BoardError>;

    async fn fetch_snapshot(&self, board_id: &BoardId) -> Result<BoardSnapshot, BoardError> {
        let board = self.fetch_board(board_id).await?;
        let lists = self.fetch_lists(board_id).await?;
        let list_ids = lists.iter().map(|list| list.id.clone()).collect::<Vec<_>>();
        let cards = self.fetch_cards(&list_ids).await?;
        Ok(BoardSnapshot {
            board,
            lists,
            cards,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

pub struct PushSubscription {
    pub handle: SubscriptionHandle,
    pub notifications: mpsc::Receiver<ChangeNotification>,
}

/// Board-scoped change feed.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(&self, board_id: &BoardId) -> Result<PushSubscription, BoardError>;
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BoardError>;
}
