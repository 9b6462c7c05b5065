//! Typed records exchanged with the remote data service and the push channel.
//!
//! Remote rows arrive with loosely typed columns (ids may be numbers or strings,
//! optional columns may be missing or null). They are decoded into the `*Row`
//! records here and converted into domain types at the boundary, so nothing
//! open-ended travels further inward.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{
    Board, BoardId, Card, CardId, CardPatch, Comment, CommentId, List, ListId, NewComment,
    Priority, UserId, WorkspaceId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    List,
    Card,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventCategory {
    Insert,
    Update,
    Delete,
}

/// A board-scoped change notice. Carries no record payload; receivers refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub entity: EntityKind,
    pub event: EventCategory,
}

impl ChangeNotification {
    pub fn new(entity: EntityKind, event: EventCategory) -> Self {
        Self { entity, event }
    }
}

/// Raw push frame. Accepts both the plain `entity`/`event` names and the
/// `table`/`eventType` names emitted by database change feeds.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeFrame {
    #[serde(alias = "table")]
    pub entity: String,
    #[serde(alias = "eventType", alias = "type")]
    pub event: String,
}

impl ChangeFrame {
    pub fn into_notification(self) -> Option<ChangeNotification> {
        let entity = match self.entity.trim().to_ascii_lowercase().as_str() {
            "list" | "lists" | "column" | "columns" => EntityKind::List,
            "card" | "cards" | "task" | "tasks" => EntityKind::Card,
            _ => return None,
        };
        let event = match self.event.trim().to_ascii_uppercase().as_str() {
            "INSERT" => EventCategory::Insert,
            "UPDATE" => EventCategory::Update,
            "DELETE" => EventCategory::Delete,
            _ => return None,
        };
        Some(ChangeNotification { entity, event })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl From<RawId> for String {
    fn from(value: RawId) -> Self {
        match value {
            RawId::Text(text) => text,
            RawId::Number(number) => number.to_string(),
        }
    }
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

fn optional_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<RawId>::deserialize(deserializer)?.map(String::from))
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoardRow {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub workspace_id: Option<String>,
}

impl From<BoardRow> for Board {
    fn from(row: BoardRow) -> Self {
        Self {
            id: BoardId(row.id),
            title: row.title,
            workspace_id: row.workspace_id.map(WorkspaceId),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListRow {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub board_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub order: i64,
}

impl From<ListRow> for List {
    fn from(row: ListRow) -> Self {
        Self {
            id: ListId(row.id),
            board_id: BoardId(row.board_id),
            title: row.title,
            order: row.order,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardRow {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub list_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub assignee_id: Option<String>,
}

impl From<CardRow> for Card {
    fn from(row: CardRow) -> Self {
        Self {
            id: CardId(row.id),
            list_id: ListId(row.list_id),
            content: row.content,
            description: row.description,
            order: row.order,
            due_date: row.due_date.as_deref().and_then(parse_due_date),
            priority: row
                .priority
                .as_deref()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or_default(),
            assignee: row.assignee_id.map(UserId),
        }
    }
}

/// Accepts a bare date or a full timestamp; anything else is treated as no due date.
fn parse_due_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|ts| ts.with_timezone(&Utc).date_naive())
        })
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentRow {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    #[serde(deserialize_with = "id_string")]
    pub task_id: String,
    #[serde(deserialize_with = "id_string")]
    pub user_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "optional_id_string")]
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Self {
            id: CommentId(row.id),
            task_id: CardId(row.task_id),
            user_id: UserId(row.user_id),
            content: row.content,
            parent_id: row.parent_id.map(CommentId),
            created_at: row.created_at,
            updated_at: row.updated_at.unwrap_or(row.created_at),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewListRow<'a> {
    pub id: &'a str,
    pub board_id: &'a str,
    pub title: &'a str,
    pub order: i64,
}

impl<'a> From<&'a List> for NewListRow<'a> {
    fn from(list: &'a List) -> Self {
        Self {
            id: list.id.as_str(),
            board_id: list.board_id.as_str(),
            title: &list.title,
            order: list.order,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewCardRow<'a> {
    pub id: &'a str,
    pub list_id: &'a str,
    pub content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
    pub order: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<&'a str>,
}

impl<'a> From<&'a Card> for NewCardRow<'a> {
    fn from(card: &'a Card) -> Self {
        Self {
            id: card.id.as_str(),
            list_id: card.list_id.as_str(),
            content: &card.content,
            description: card.description.as_deref(),
            order: card.order,
            due_date: card.due_date,
            priority: card.priority,
            assignee_id: card.assignee.as_ref().map(UserId::as_str),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CardPatchRow<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<&'a str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<Option<NaiveDate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<Option<&'a str>>,
}

impl<'a> From<&'a CardPatch> for CardPatchRow<'a> {
    fn from(patch: &'a CardPatch) -> Self {
        Self {
            content: patch.content.as_deref(),
            description: patch.description.as_ref().map(Option::as_deref),
            due_date: patch.due_date,
            priority: patch.priority,
            assignee_id: patch
                .assignee
                .as_ref()
                .map(|assignee| assignee.as_ref().map(UserId::as_str)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardPositionRow {
    pub list_id: String,
    pub order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListOrderRow {
    pub order: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewCommentRow<'a> {
    pub task_id: &'a str,
    pub user_id: &'a str,
    pub content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<&'a str>,
}

impl<'a> From<&'a NewComment> for NewCommentRow<'a> {
    fn from(comment: &'a NewComment) -> Self {
        Self {
            task_id: comment.task_id.as_str(),
            user_id: comment.user_id.as_str(),
            content: &comment.content,
            parent_id: comment.parent_id.as_ref().map(CommentId::as_str),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_row_defaults_missing_and_unknown_fields() {
        let row: CardRow = serde_json::from_str(
            r#"{"id": 42, "list_id": "L1", "content": "ship it", "priority": "urgent"}"#,
        )
        .expect("row");
        let card = Card::from(row);

        assert_eq!(card.id, CardId::from("42"));
        assert_eq!(card.order, 0);
        assert_eq!(card.priority, Priority::Medium);
        assert_eq!(card.due_date, None);
        assert_eq!(card.assignee, None);
    }

    #[test]
    fn card_row_accepts_timestamp_due_dates() {
        let row: CardRow = serde_json::from_str(
            r#"{"id": "c1", "list_id": 7, "order": 3, "due_date": "2026-03-01T12:00:00+00:00", "priority": "High"}"#,
        )
        .expect("row");
        let card = Card::from(row);

        assert_eq!(card.list_id, ListId::from("7"));
        assert_eq!(card.due_date, NaiveDate::from_ymd_opt(2026, 3, 1));
        assert_eq!(card.priority, Priority::High);
    }

    #[test]
    fn list_row_requires_board_reference() {
        let err = serde_json::from_str::<ListRow>(r#"{"id": "L1", "title": "Todo"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn change_frame_maps_feed_aliases() {
        let frame: ChangeFrame =
            serde_json::from_str(r#"{"table": "tasks", "eventType": "update"}"#).expect("frame");
        assert_eq!(
            frame.into_notification(),
            Some(ChangeNotification::new(EntityKind::Card, EventCategory::Update))
        );

        let frame: ChangeFrame =
            serde_json::from_str(r#"{"entity": "labels", "event": "INSERT"}"#).expect("frame");
        assert_eq!(frame.into_notification(), None);
    }

    #[test]
    fn patch_row_serializes_cleared_fields_as_null() {
        let patch = CardPatch {
            assignee: Some(None),
            priority: Some(Priority::Low),
            ..CardPatch::default()
        };
        let json = serde_json::to_value(CardPatchRow::from(&patch)).expect("json");

        assert_eq!(
            json,
            serde_json::json!({"priority": "low", "assignee_id": null})
        );
    }
}
