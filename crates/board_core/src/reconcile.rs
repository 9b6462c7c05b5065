//! Keeps an [`OrderingStore`] in step with the remote source of truth.
//!
//! Every change notification for the board triggers a full snapshot refetch that is
//! handed to [`OrderingStore::apply_snapshot`]; notification payloads are never
//! inspected.

use std::sync::Arc;

use shared::domain::BoardId;
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    store::OrderingStore, BoardError, PushChannel, PushSubscription, SubscriptionHandle,
};

pub struct RemoteChangeReconciler {
    store: OrderingStore,
    push: Arc<dyn PushChannel>,
}

impl RemoteChangeReconciler {
    pub fn new(store: OrderingStore, push: Arc<dyn PushChannel>) -> Self {
        Self { store, push }
    }

    pub fn store(&self) -> &OrderingStore {
        &self.store
    }

    /// Subscribes to the board's change feed. The subscription lives as long as the
    /// returned guard.
    pub async fn mount(&self) -> Result<ReconcilerGuard, BoardError> {
        let board_id = self.store.board_id().clone();
        let PushSubscription {
            handle,
            mut notifications,
        } = self.push.subscribe(&board_id).await?;
        info!(%board_id, handle = handle.0, "reconcile: subscribed to board changes");

        let store = self.store.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                debug!(
                    board_id = %store.board_id(),
                    entity = ?notification.entity,
                    event = ?notification.event,
                    "reconcile: change notification"
                );
                if let Err(err) = refresh_store(&store).await {
                    warn!(
                        board_id = %store.board_id(),
                        error = %err,
                        "reconcile: snapshot refetch failed; keeping current state"
                    );
                }
            }
            debug!(board_id = %store.board_id(), "reconcile: change feed closed");
        });

        Ok(ReconcilerGuard {
            board_id,
            handle: Some(handle),
            push: Arc::clone(&self.push),
            runtime: Handle::current(),
            task,
        })
    }

    /// Refetches the board once, outside of any notification.
    pub async fn refresh(&self) -> Result<usize, BoardError> {
        refresh_store(&self.store).await
    }
}

async fn refresh_store(store: &OrderingStore) -> Result<usize, BoardError> {
    let mark = store.snapshot_mark();
    let snapshot = store.service().fetch_snapshot(store.board_id()).await?;
    let replayed = store.apply_snapshot_from(mark, snapshot);
    debug!(board_id = %store.board_id(), replayed, "reconcile: snapshot applied");
    Ok(replayed)
}

/// Mounted subscription. Released by [`ReconcilerGuard::teardown`] or, failing that,
/// on drop; never both.
pub struct ReconcilerGuard {
    board_id: BoardId,
    handle: Option<SubscriptionHandle>,
    push: Arc<dyn PushChannel>,
    runtime: Handle,
    task: JoinHandle<()>,
}

impl ReconcilerGuard {
    pub fn board_id(&self) -> &BoardId {
        &self.board_id
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some() && !self.task.is_finished()
    }

    pub async fn teardown(mut self) -> Result<(), BoardError> {
        self.task.abort();
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        info!(board_id = %self.board_id, handle = handle.0, "reconcile: unsubscribing");
        self.push.unsubscribe(handle).await
    }
}

impl Drop for ReconcilerGuard {
    fn drop(&mut self) {
        self.task.abort();
        let Some(handle) = self.handle.take() else {
            return;
        };
        let push = Arc::clone(&self.push);
        let board_id = self.board_id.clone();
        self.runtime.spawn(async move {
            if let Err(err) = push.unsubscribe(handle).await {
                warn!(%board_id, handle = handle.0, error = %err, "reconcile: unsubscribe on drop failed");
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
