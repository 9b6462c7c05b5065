mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use board_core::{
    fetch_comment_tree, post_comment, BoardFilter, BoardView, CommentNode, HttpBoardService,
    OrderingStore, RemoteChangeReconciler, StoreEvent, WsPushChannel,
};
use clap::{Parser, Subcommand};
use shared::domain::{BoardId, CardId, CommentId, ListId, NewComment, Priority, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Settings;

#[derive(Parser, Debug)]
#[command(name = "board", about = "Kanban board client")]
struct Args {
    /// Config file; defaults to ./board.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[arg(long, global = true)]
    board: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the board, optionally filtered.
    Show {
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long)]
        assignee: Option<String>,
        #[arg(long)]
        overdue: bool,
        #[arg(long)]
        json: bool,
    },
    /// Follow remote changes until interrupted.
    Watch,
    AddList {
        title: String,
    },
    AddCard {
        #[arg(long)]
        list: String,
        content: String,
    },
    /// Move a card; without --order it is appended to the target list.
    MoveCard {
        card: String,
        #[arg(long)]
        list: String,
        #[arg(long)]
        order: Option<i64>,
    },
    Comments {
        #[arg(long)]
        card: String,
    },
    Comment {
        #[arg(long)]
        card: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        parent: Option<String>,
        content: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = match &args.config {
        Some(path) => config::load_settings_from(path, |key| std::env::var(key).ok())?,
        None => config::load_settings()?,
    };
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    if let Some(board) = args.board {
        settings.board_id = Some(board);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let service = build_service(&settings);

    match args.command {
        Command::Show {
            priority,
            assignee,
            overdue,
            json,
        } => {
            let store = load_store(&settings, &service).await?;
            let filter = BoardFilter {
                priority,
                assignee: assignee.map(UserId::from),
                overdue,
            };
            let view = store.view(&filter);
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_board(&view);
            }
        }
        Command::Watch => watch(&settings, &service).await?,
        Command::AddList { title } => {
            let store = load_store(&settings, &service).await?;
            let ticket = store
                .add_list(store.board_id(), &title)
                .context("list rejected: title is empty")?;
            ticket.outcome().await?;
            println!("added list '{}'", title.trim());
        }
        Command::AddCard { list, content } => {
            let store = load_store(&settings, &service).await?;
            let list_id = ListId::from(list);
            let ticket = store
                .add_card(&list_id, &content)
                .context("card rejected: content is empty or the list is not on this board")?;
            ticket.outcome().await?;
            println!("added card to {list_id}");
        }
        Command::MoveCard { card, list, order } => {
            let store = load_store(&settings, &service).await?;
            let card_id = CardId::from(card);
            let list_id = ListId::from(list);
            let order = order.unwrap_or_else(|| store.card_count(&list_id) as i64);
            let ticket = store
                .move_card(&card_id, &list_id, order)
                .with_context(|| format!("card {card_id} or list {list_id} is not on this board"))?;
            ticket.outcome().await?;
            println!("moved {card_id} to {list_id} at {order}");
        }
        Command::Comments { card } => {
            let forest = fetch_comment_tree(service.as_ref(), &CardId::from(card)).await?;
            if forest.is_empty() {
                println!("no comments");
            }
            print_thread(&forest, 0);
        }
        Command::Comment {
            card,
            user,
            parent,
            content,
        } => {
            let created = post_comment(
                service.as_ref(),
                NewComment {
                    task_id: CardId::from(card),
                    user_id: UserId::from(user),
                    content,
                    parent_id: parent.map(CommentId::from),
                },
            )
            .await?;
            println!("posted comment {}", created.id);
        }
    }

    Ok(())
}

fn build_service(settings: &Settings) -> Arc<HttpBoardService> {
    let mut service = HttpBoardService::new(&settings.api_url);
    if let Some(api_key) = &settings.api_key {
        service = service.with_api_key(api_key);
    }
    Arc::new(service)
}

async fn load_store(settings: &Settings, service: &Arc<HttpBoardService>) -> Result<OrderingStore> {
    let board_id = settings
        .board_id
        .clone()
        .map(BoardId::from)
        .context("no board selected; pass --board or set BOARD_ID")?;
    let store = OrderingStore::load(board_id.clone(), service.clone(), settings.reconcile_policy)
        .await
        .with_context(|| format!("failed to load board {board_id}"))?;
    if store.board().is_none() {
        warn!(%board_id, "board row not found; showing lists only");
    }
    Ok(store)
}

async fn watch(settings: &Settings, service: &Arc<HttpBoardService>) -> Result<()> {
    let store = load_store(settings, service).await?;
    let push = Arc::new(WsPushChannel::new(settings.push_url()?));
    let reconciler = RemoteChangeReconciler::new(store.clone(), push);
    let mut events = store.subscribe_events();
    let guard = reconciler.mount().await?;

    print_board(&store.view(&BoardFilter::default()));
    info!(board_id = %store.board_id(), "watch: waiting for changes, ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(StoreEvent::Reconciled { .. }) => print_board(&store.view(&BoardFilter::default())),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "watch: missed store events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    guard.teardown().await?;
    Ok(())
}

fn print_board(view: &BoardView) {
    if let Some(board) = &view.board {
        println!("{}", board.title);
    }
    for list in &view.lists {
        println!("== {} ({}) [{}]", list.list.title, list.cards.len(), list.list.id);
        for card in &list.cards {
            let mut line = format!("  [{}] {}", card.priority, card.content);
            if let Some(due) = card.due_date {
                line.push_str(&format!(" due {due}"));
            }
            if let Some(assignee) = &card.assignee {
                line.push_str(&format!(" @{assignee}"));
            }
            println!("{line}  ({})", card.id);
        }
    }
}

fn print_thread(nodes: &[CommentNode], depth: usize) {
    for node in nodes {
        println!(
            "{}{} ({}): {}",
            "  ".repeat(depth),
            node.comment.user_id,
            node.comment.created_at.format("%Y-%m-%d %H:%M"),
            node.comment.content
        );
        print_thread(&node.replies, depth + 1);
    }
}
