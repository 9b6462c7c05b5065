//! [`PushChannel`] over a websocket change feed.
//!
//! Each subscription opens `{push_url}/boards/{board_id}/changes` and runs a reader
//! task that forwards recognised frames as [`ChangeNotification`]s.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use futures::StreamExt;
use shared::{
    domain::BoardId,
    protocol::{ChangeFrame, ChangeNotification},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{BoardError, PushChannel, PushSubscription, SubscriptionHandle};

const NOTIFICATION_BUFFER: usize = 64;

/// Derives the websocket base from an `http(s)://` API base.
pub fn push_url_from_api_url(api_url: &str) -> Result<String, BoardError> {
    let api_url = api_url.trim_end_matches('/');
    if api_url.starts_with("https://") {
        Ok(api_url.replacen("https://", "wss://", 1))
    } else if api_url.starts_with("http://") {
        Ok(api_url.replacen("http://", "ws://", 1))
    } else {
        Err(BoardError::Push(format!(
            "api url must start with http:// or https://: {api_url}"
        )))
    }
}

pub struct WsPushChannel {
    push_url: String,
    next_handle: AtomicU64,
    readers: Mutex<HashMap<SubscriptionHandle, JoinHandle<()>>>,
}

impl WsPushChannel {
    pub fn new(push_url: impl Into<String>) -> Self {
        Self {
            push_url: push_url.into().trim_end_matches('/').to_string(),
            next_handle: AtomicU64::new(1),
            readers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn active_subscriptions(&self) -> usize {
        self.readers.lock().await.len()
    }
}

#[async_trait]
impl PushChannel for WsPushChannel {
    async fn subscribe(&self, board_id: &BoardId) -> Result<PushSubscription, BoardError> {
        let ws_url = format!("{}/boards/{board_id}/changes", self.push_url);
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|err| BoardError::Push(format!("failed to connect websocket {ws_url}: {err}")))?;
        let (_, mut ws_reader) = ws_stream.split();

        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, notifications) = mpsc::channel(NOTIFICATION_BUFFER);
        let board = board_id.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let notification = serde_json::from_str::<ChangeFrame>(&text)
                            .ok()
                            .and_then(ChangeFrame::into_notification);
                        let Some(notification) = notification else {
                            warn!(board_id = %board, frame = %text, "push: ignoring unrecognised frame");
                            continue;
                        };
                        if tx.send(notification).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(board_id = %board, error = %err, "push: websocket read failed");
                        break;
                    }
                }
            }
            debug!(board_id = %board, "push: reader stopped");
        });

        self.readers.lock().await.insert(handle, reader);
        info!(%board_id, handle = handle.0, "push: subscribed");
        Ok(PushSubscription {
            handle,
            notifications,
        })
    }

    /// Unknown or already released handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BoardError> {
        if let Some(reader) = self.readers.lock().await.remove(&handle) {
            reader.abort();
            info!(handle = handle.0, "push: unsubscribed");
        }
        Ok(())
    }
}

impl Drop for WsPushChannel {
    fn drop(&mut self) {
        for (_, reader) in self.readers.get_mut().drain() {
            reader.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/push_tests.rs"]
mod tests;
