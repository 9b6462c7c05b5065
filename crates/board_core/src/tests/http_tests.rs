use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use axum::{
    extract::{Query, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use shared::domain::{Priority, UserId};
use tokio::net::TcpListener;

use super::*;

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Value,
}

#[derive(Clone, Default)]
struct ServerState {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl ServerState {
    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().expect("requests").clone()
    }
}

async fn handle_table(
    State(state): State<ServerState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let path = uri.path().to_string();
    state.requests.lock().expect("requests").push(Recorded {
        method: method.clone(),
        path: path.clone(),
        query,
        headers,
        body: serde_json::from_str(&body).unwrap_or(Value::Null),
    });

    match (method, path.as_str()) {
        (Method::GET, "/boards") => {
            Json(json!([{ "id": "B1", "title": "Launch", "workspace_id": 3 }])).into_response()
        }
        (Method::GET, "/lists") => Json(json!([
            { "id": "L2", "board_id": "B1", "title": "Doing", "order": 1 },
            { "id": "L1", "board_id": "B1", "title": "Todo", "order": 0 }
        ]))
        .into_response(),
        (Method::GET, "/cards") => Json(json!([{
            "id": 7,
            "list_id": "L1",
            "content": "Write launch notes",
            "order": 0,
            "priority": "high",
            "due_date": "2026-03-01",
            "assignee_id": "u9"
        }]))
        .into_response(),
        (Method::GET, "/comments") => Json(json!([])).into_response(),
        (Method::POST, "/comments") => (
            StatusCode::CREATED,
            Json(json!([{
                "id": 41,
                "task_id": "C1",
                "user_id": "u1",
                "content": "looks good",
                "parent_id": null,
                "created_at": "2026-01-05T09:00:00Z"
            }])),
        )
            .into_response(),
        (Method::POST, _) => StatusCode::CREATED.into_response(),
        (Method::PATCH, _) | (Method::DELETE, _) => StatusCode::NO_CONTENT.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn spawn_table_server() -> (String, ServerState) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = ServerState::default();
    let app = Router::new()
        .fallback(handle_table)
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

async fn spawn_failing_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route(
            "/lists",
            get(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "code": "PGRST301", "message": "JWT expired" })),
                )
            }),
        )
        .route(
            "/cards",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable") }),
        )
        .route("/comments", get(|| async { "not json" }));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn fetch_snapshot_filters_by_board_then_lists() {
    let (url, state) = spawn_table_server().await;
    let service = HttpBoardService::new(format!("{url}/"));

    let snapshot = service
        .fetch_snapshot(&BoardId::from("B1"))
        .await
        .expect("snapshot");

    let board = snapshot.board.expect("board");
    assert_eq!(board.title, "Launch");
    assert_eq!(board.workspace_id.map(|id| id.to_string()), Some("3".to_string()));
    assert_eq!(snapshot.lists.len(), 2);
    let card = &snapshot.cards[0];
    assert_eq!(card.id, CardId::from("7"));
    assert_eq!(card.priority, Priority::High);
    assert_eq!(card.assignee, Some(UserId::from("u9")));
    assert_eq!(card.due_date.map(|d| d.to_string()), Some("2026-03-01".to_string()));

    let requests = state.requests();
    let paths = requests.iter().map(|r| r.path.as_str()).collect::<Vec<_>>();
    assert_eq!(paths, vec!["/boards", "/lists", "/cards"]);
    assert_eq!(requests[0].query.get("id").map(String::as_str), Some("eq.B1"));
    assert_eq!(requests[1].query.get("board_id").map(String::as_str), Some("eq.B1"));
    assert_eq!(requests[1].query.get("order").map(String::as_str), Some("order.asc"));
    assert_eq!(
        requests[2].query.get("list_id").map(String::as_str),
        Some(r#"in.("L2","L1")"#)
    );
    assert!(requests[0].headers.get("apikey").is_none());
}

#[tokio::test]
async fn writes_target_rows_by_id_with_credentials() {
    let (url, state) = spawn_table_server().await;
    let service = HttpBoardService::new(url).with_api_key("anon-key");

    let mut card = Card::new(ListId::from("L1"), "Ship it", 2);
    card.id = CardId::from("C1");
    service.create_card(&card).await.expect("create");
    service
        .update_card_position(&CardId::from("C1"), &ListId::from("L2"), 3)
        .await
        .expect("move");
    service
        .update_list_order(&ListId::from("L2"), 5)
        .await
        .expect("rank");
    service
        .update_card(&CardId::from("C1"), &CardPatch::content("Ship it today"))
        .await
        .expect("edit");
    service
        .delete_card(&CardId::from("C1"))
        .await
        .expect("delete");

    let requests = state.requests();
    assert_eq!(requests.len(), 5);

    let create = &requests[0];
    assert_eq!((create.method.clone(), create.path.as_str()), (Method::POST, "/cards"));
    assert_eq!(create.body["id"], "C1");
    assert_eq!(create.body["list_id"], "L1");
    assert_eq!(create.body["order"], 2);
    assert_eq!(create.body["priority"], "medium");
    assert_eq!(create.headers["apikey"], "anon-key");
    assert_eq!(create.headers["authorization"], "Bearer anon-key");
    assert_eq!(create.headers["prefer"], "return=minimal");

    let position = &requests[1];
    assert_eq!(position.method, Method::PATCH);
    assert_eq!(position.query.get("id").map(String::as_str), Some("eq.C1"));
    assert_eq!(position.body, json!({ "list_id": "L2", "order": 3 }));

    let rank = &requests[2];
    assert_eq!(rank.path, "/lists");
    assert_eq!(rank.query.get("id").map(String::as_str), Some("eq.L2"));
    assert_eq!(rank.body, json!({ "order": 5 }));

    assert_eq!(requests[3].body, json!({ "content": "Ship it today" }));

    let delete = &requests[4];
    assert_eq!(delete.method, Method::DELETE);
    assert_eq!(delete.query.get("id").map(String::as_str), Some("eq.C1"));
}

#[tokio::test]
async fn create_comment_returns_inserted_row() {
    let (url, state) = spawn_table_server().await;
    let service = HttpBoardService::new(url);

    let created = service
        .create_comment(&NewComment {
            task_id: CardId::from("C1"),
            user_id: UserId::from("u1"),
            content: "looks good".to_string(),
            parent_id: None,
        })
        .await
        .expect("comment");

    assert_eq!(created.id.as_str(), "41");
    assert_eq!(created.updated_at, created.created_at);
    let request = &state.requests()[0];
    assert_eq!(request.headers["prefer"], "return=representation");
    assert_eq!(
        request.body,
        json!({ "task_id": "C1", "user_id": "u1", "content": "looks good" })
    );
}

#[tokio::test]
async fn fetch_cards_without_lists_skips_the_request() {
    // Nothing listens here; any request would fail.
    let service = HttpBoardService::new("http://127.0.0.1:9");
    let cards = service.fetch_cards(&[]).await.expect("cards");
    assert!(cards.is_empty());
}

#[tokio::test]
async fn rejected_requests_map_to_api_errors() {
    let url = spawn_failing_server().await;
    let service = HttpBoardService::new(url);

    let err = service
        .fetch_lists(&BoardId::from("B1"))
        .await
        .expect_err("unauthorized");
    assert_eq!(err.code(), ErrorCode::Unauthorized);
    assert!(matches!(&err, BoardError::Api(api) if api.message == "JWT expired"));

    let err = service
        .fetch_cards(&[ListId::from("L1")])
        .await
        .expect_err("server error");
    assert!(matches!(&err, BoardError::Api(api) if api.message == "database unavailable"));
    assert_eq!(err.code(), ErrorCode::Internal);

    let err = service
        .fetch_comments(&CardId::from("C1"))
        .await
        .expect_err("bad body");
    assert!(matches!(err, BoardError::Decode(_)));
}
