use std::collections::HashSet;

use serde_json::Value;

use crate::api::{ChangeEvent, ChangeKind, CommentId, Reaction, ReviewId, Table, UserId, Uuid};

/// Identity of a vote row: one user's vote of one kind on one target
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct VoteKey {
    pub review_id: ReviewId,
    pub comment_id: Option<CommentId>,
    pub user_id: UserId,
    pub vote_type: Reaction,
}

impl VoteKey {
    pub fn from_row(row: &Value) -> Option<VoteKey> {
        let uuid = |field: &str| -> Option<Uuid> { row.get(field)?.as_str()?.parse().ok() };
        Some(VoteKey {
            review_id: ReviewId(uuid("review_id")?),
            comment_id: uuid("comment_id").map(CommentId),
            user_id: UserId(uuid("user_id")?),
            vote_type: Reaction::parse(row.get("vote_type")?.as_str()?)?,
        })
    }
}

/// Drops redelivered inserts
///
/// Comment inserts are recognized by id, vote inserts by `VoteKey`. Updates
/// and deletes always go through; a vote update or delete forgets the key of
/// the old row, so that voting again is delivered.
#[derive(Debug, Default)]
pub struct Deduplicator {
    comments: HashSet<CommentId>,
    votes: HashSet<VoteKey>,
}

impl Deduplicator {
    pub fn new() -> Deduplicator {
        Deduplicator::default()
    }

    /// Returns false if `event` was already delivered
    pub fn first_delivery(&mut self, event: &ChangeEvent) -> bool {
        match (event.table, event.kind) {
            (Table::Comments, ChangeKind::Insert) => {
                match event
                    .new
                    .get("id")
                    .and_then(|id| id.as_str())
                    .and_then(|id| id.parse().ok())
                {
                    Some(id) => self.comments.insert(CommentId(id)),
                    None => true,
                }
            }
            (Table::Votes, ChangeKind::Insert) => match VoteKey::from_row(&event.new) {
                Some(key) => self.votes.insert(key),
                None => true,
            },
            (Table::Votes, ChangeKind::Update | ChangeKind::Delete) => {
                if let Some(key) = VoteKey::from_row(&event.old) {
                    self.votes.remove(&key);
                }
                if let Some(key) = VoteKey::from_row(&event.new) {
                    self.votes.insert(key);
                }
                true
            }
            _ => true,
        }
    }
}
