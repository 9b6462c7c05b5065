//! Threaded comments for a card.
//!
//! The tree is rebuilt from the flat record set on every fetch. Replies keep the
//! input (creation-time) order, and every record ends up in the forest exactly once.

use std::collections::HashMap;

use serde::Serialize;
use shared::domain::{CardId, Comment, CommentId, NewComment};
use tracing::{debug, info};

use crate::{BoardDataService, BoardError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentNode {
    pub comment: Comment,
    pub replies: Vec<CommentNode>,
}

impl CommentNode {
    /// Number of comments in this subtree, including this one.
    pub fn count(&self) -> usize {
        let mut total = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            total += 1;
            stack.extend(node.replies.iter());
        }
        total
    }
}

/// Depth-first, parents before their replies.
pub fn flatten(forest: &[CommentNode]) -> Vec<&Comment> {
    let mut out = Vec::new();
    let mut stack = forest.iter().rev().collect::<Vec<_>>();
    while let Some(node) = stack.pop() {
        out.push(&node.comment);
        stack.extend(node.replies.iter().rev());
    }
    out
}

/// Builds the reply forest for `comments`, given in creation-time order.
///
/// A comment whose parent is unknown, is itself, or would close a cycle becomes a
/// root. When ids repeat, the first record with that id is the one replies attach to.
pub fn build_comment_tree(comments: Vec<Comment>) -> Vec<CommentNode> {
    let mut index: HashMap<&CommentId, usize> = HashMap::with_capacity(comments.len());
    for (idx, comment) in comments.iter().enumerate() {
        index.entry(&comment.id).or_insert(idx);
    }

    let mut parent_of: Vec<Option<usize>> = vec![None; comments.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); comments.len()];
    let mut roots = Vec::new();

    for (idx, comment) in comments.iter().enumerate() {
        let parent = comment
            .parent_id
            .as_ref()
            .and_then(|parent_id| index.get(parent_id).copied())
            .filter(|&parent| !closes_cycle(&parent_of, idx, parent));
        match parent {
            Some(parent) => {
                parent_of[idx] = Some(parent);
                children[parent].push(idx);
            }
            None => {
                if comment.parent_id.is_some() {
                    debug!(comment_id = %comment.id, "comments: reply without a usable parent kept as root");
                }
                roots.push(idx);
            }
        }
    }

    let mut records = comments.into_iter().map(Some).collect::<Vec<_>>();
    let mut built: Vec<Option<CommentNode>> = (0..records.len()).map(|_| None).collect();
    let mut stack = roots.iter().rev().map(|&idx| (idx, false)).collect::<Vec<_>>();
    while let Some((idx, expanded)) = stack.pop() {
        if expanded {
            let replies = children[idx]
                .iter()
                .filter_map(|&child| built[child].take())
                .collect();
            if let Some(comment) = records[idx].take() {
                built[idx] = Some(CommentNode { comment, replies });
            }
        } else {
            stack.push((idx, true));
            stack.extend(children[idx].iter().map(|&child| (child, false)));
        }
    }

    roots
        .into_iter()
        .filter_map(|idx| built[idx].take())
        .collect()
}

fn closes_cycle(parent_of: &[Option<usize>], child: usize, parent: usize) -> bool {
    let mut cursor = Some(parent);
    while let Some(current) = cursor {
        if current == child {
            return true;
        }
        cursor = parent_of[current];
    }
    false
}

pub async fn fetch_comment_tree(
    service: &dyn BoardDataService,
    card_id: &CardId,
) -> Result<Vec<CommentNode>, BoardError> {
    let comments = service.fetch_comments(card_id).await?;
    debug!(%card_id, comments = comments.len(), "comments: fetched");
    Ok(build_comment_tree(comments))
}

/// Creates a comment or reply. Blank content is rejected before any remote call.
pub async fn post_comment(
    service: &dyn BoardDataService,
    mut comment: NewComment,
) -> Result<Comment, BoardError> {
    let content = comment.content.trim();
    if content.is_empty() {
        return Err(BoardError::Validation("comment content is empty".to_string()));
    }
    comment.content = content.to_string();

    let created = service.create_comment(&comment).await?;
    info!(
        card_id = %created.task_id,
        comment_id = %created.id,
        reply = created.parent_id.is_some(),
        "comments: posted"
    );
    Ok(created)
}
