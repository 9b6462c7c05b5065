//! [`BoardDataService`] over a PostgREST-style HTTP API.
//!
//! Each entity is a table endpoint (`/boards`, `/lists`, `/cards`, `/comments`)
//! filtered with `column=op.value` query parameters.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{Board, BoardId, Card, CardId, CardPatch, Comment, List, ListId, NewComment},
    error::{ApiException, ErrorCode},
    protocol::{
        BoardRow, CardPatchRow, CardPositionRow, CardRow, CommentRow, ListOrderRow, ListRow,
        NewCardRow, NewCommentRow, NewListRow,
    },
};
use tracing::{debug, warn};

use crate::{BoardDataService, BoardError};

const PREFER_MINIMAL: &str = "return=minimal";
const PREFER_REPRESENTATION: &str = "return=representation";

#[derive(Clone)]
pub struct HttpBoardService {
    http: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
}

impl HttpBoardService {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    /// Sent both as the `apikey` header and as a bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let mut request = self.http.request(method, format!("{}/{table}", self.api_url));
        if let Some(api_key) = &self.api_key {
            request = request.header("apikey", api_key).bearer_auth(api_key);
        }
        request
    }

    async fn select<T, R>(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<R>, BoardError>
    where
        T: DeserializeOwned + Into<R>,
    {
        debug!(table, ?query, "http: select");
        let response = self.request(Method::GET, table).query(query).send().await?;
        let body = ensure_success(response).await?.text().await?;
        let rows: Vec<T> = serde_json::from_str(&body)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert<B: Serialize + ?Sized>(&self, table: &str, body: &B) -> Result<(), BoardError> {
        debug!(table, "http: insert");
        let response = self
            .request(Method::POST, table)
            .header("Prefer", PREFER_MINIMAL)
            .json(body)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn update<B: Serialize + ?Sized>(
        &self,
        table: &str,
        id: &str,
        body: &B,
    ) -> Result<(), BoardError> {
        debug!(table, id, "http: update");
        let response = self
            .request(Method::PATCH, table)
            .query(&[("id", eq(id))])
            .header("Prefer", PREFER_MINIMAL)
            .json(body)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

fn in_list<'a>(values: impl IntoIterator<Item = &'a str>) -> String {
    let quoted = values
        .into_iter()
        .map(|value| format!("\"{value}\""))
        .collect::<Vec<_>>();
    format!("in.({})", quoted.join(","))
}

/// Turns a non-2xx response into [`BoardError::Api`], preferring the `message`
/// field of a JSON error body.
async fn ensure_success(response: Response) -> Result<Response, BoardError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            }
        });
    warn!(status = status.as_u16(), %message, "http: request rejected");
    Err(ApiException::new(ErrorCode::from_http_status(status.as_u16()), message).into())
}

#[async_trait]
impl BoardDataService for HttpBoardService {
    async fn fetch_board(&self, board_id: &BoardId) -> Result<Option<Board>, BoardError> {
        let boards = self
            .select::<BoardRow, Board>(
                "boards",
                &[("id", eq(board_id.as_str())), ("limit", "1".to_string())],
            )
            .await?;
        Ok(boards.into_iter().next())
    }

    async fn fetch_lists(&self, board_id: &BoardId) -> Result<Vec<List>, BoardError> {
        self.select::<ListRow, List>(
            "lists",
            &[
                ("board_id", eq(board_id.as_str())),
                ("order", "order.asc".to_string()),
            ],
        )
        .await
    }

    async fn fetch_cards(&self, list_ids: &[ListId]) -> Result<Vec<Card>, BoardError> {
        if list_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.select::<CardRow, Card>(
            "cards",
            &[
                ("list_id", in_list(list_ids.iter().map(ListId::as_str))),
                ("order", "order.asc".to_string()),
            ],
        )
        .await
    }

    async fn fetch_comments(&self, card_id: &CardId) -> Result<Vec<Comment>, BoardError> {
        self.select::<CommentRow, Comment>(
            "comments",
            &[
                ("task_id", eq(card_id.as_str())),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }

    async fn create_list(&self, list: &List) -> Result<(), BoardError> {
        self.insert("lists", &NewListRow::from(list)).await
    }

    async fn create_card(&self, card: &Card) -> Result<(), BoardError> {
        self.insert("cards", &NewCardRow::from(card)).await
    }

    async fn update_card(&self, card_id: &CardId, patch: &CardPatch) -> Result<(), BoardError> {
        self.update("cards", card_id.as_str(), &CardPatchRow::from(patch))
            .await
    }

    async fn update_card_position(
        &self,
        card_id: &CardId,
        list_id: &ListId,
        order: i64,
    ) -> Result<(), BoardError> {
        let row = CardPositionRow {
            list_id: list_id.to_string(),
            order,
        };
        self.update("cards", card_id.as_str(), &row).await
    }

    async fn update_list_order(&self, list_id: &ListId, order: i64) -> Result<(), BoardError> {
        self.update("lists", list_id.as_str(), &ListOrderRow { order })
            .await
    }

    async fn delete_card(&self, card_id: &CardId) -> Result<(), BoardError> {
        debug!(%card_id, "http: delete");
        let response = self
            .request(Method::DELETE, "cards")
            .query(&[("id", eq(card_id.as_str()))])
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn create_comment(&self, comment: &NewComment) -> Result<Comment, BoardError> {
        let response = self
            .request(Method::POST, "comments")
            .header("Prefer", PREFER_REPRESENTATION)
            .json(&NewCommentRow::from(comment))
            .send()
            .await?;
        let body = ensure_success(response).await?.text().await?;
        let rows: Vec<CommentRow> = serde_json::from_str(&body)?;
        rows.into_iter()
            .next()
            .map(Comment::from)
            .ok_or_else(|| BoardError::Decode("comment insert returned no rows".to_string()))
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
