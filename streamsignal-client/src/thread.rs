use serde_json::Value;

use crate::{
    api::{
        ChangeEvent, ChangeKind, Comment, CommentId, Filter, NewComment, Reaction, Review,
        ReviewId, Table, UserId, UserReactions, VoteOutcome,
    },
    normalize_comment, normalize_rows,
    realtime::VoteKey,
    tree::{self, move_vote},
};

/// Client-side state of one review and its comments
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReviewThread {
    review_id: ReviewId,
    user: Option<UserId>,
    comments: Vec<Comment>,
    likes: u64,
    dislikes: u64,
    reaction: Option<Reaction>,
}

impl ReviewThread {
    /// Builds the thread from raw backend rows
    ///
    /// `reactions` is the current user's reaction map, including their
    /// reaction on the review itself.
    pub fn load(
        review: &Review,
        user: Option<UserId>,
        top_level: &Value,
        replies: &Value,
        reactions: &Value,
    ) -> ReviewThread {
        let reactions = UserReactions::from_value(reactions);
        let comments = tree::assemble_comment_tree(
            normalize_rows(top_level),
            normalize_rows(replies),
            &reactions,
        );
        ReviewThread::from_tree(review, user, comments, reactions.review)
    }

    /// Builds the thread from an already-assembled comment tree
    ///
    /// `reaction` is the current user's stored reaction on the review, which
    /// `review`'s counters already include.
    pub fn from_tree(
        review: &Review,
        user: Option<UserId>,
        comments: Vec<Comment>,
        reaction: Option<Reaction>,
    ) -> ReviewThread {
        ReviewThread {
            review_id: review.id,
            user,
            comments,
            likes: review.likes,
            dislikes: review.dislikes,
            reaction,
        }
    }

    pub fn review_id(&self) -> ReviewId {
        self.review_id
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn likes(&self) -> u64 {
        self.likes
    }

    pub fn dislikes(&self) -> u64 {
        self.dislikes
    }

    /// The current user's reaction on the review itself
    pub fn reaction(&self) -> Option<Reaction> {
        self.reaction
    }

    pub fn set_reaction(&mut self, reaction: Option<Reaction>) {
        self.reaction = reaction;
    }

    /// Scope of the realtime channels following this thread
    pub fn channel_scope(&self) -> Filter {
        Filter::eq("review_id", self.review_id.0)
    }

    /// Shows `new` right away, before the backend stored it
    ///
    /// Returns the pending comment, whose id is to be passed to `confirm` or
    /// `rollback` once the backend answered.
    pub fn insert_pending(&mut self, new: &NewComment, author_name: &str) -> Comment {
        let pending = Comment {
            id: new.id,
            parent_comment_id: new.parent_comment_id,
            review_id: new.review_id,
            user_id: self.user,
            author_name: String::from(author_name),
            author_avatar: String::new(),
            content: new.content.clone(),
            likes: 0,
            dislikes: 0,
            created_at: chrono::Utc::now().to_rfc3339(),
            nesting_level: 1,
            replies: Vec::new(),
            user_reaction: None,
        };
        match new.parent_comment_id {
            Some(parent) => {
                self.comments = tree::add_reply(&self.comments, &parent, pending.clone());
            }
            None => self.comments.push(pending.clone()),
        }
        pending
    }

    /// Replaces the pending comment with the row the backend stored
    pub fn confirm(&mut self, pending: &CommentId, stored: Comment) {
        if stored.id != *pending && tree::find_comment(&self.comments, &stored.id).is_some() {
            // the realtime feed was faster
            self.comments = tree::remove_comment(&self.comments, pending);
            return;
        }
        self.comments = tree::replace_comment(&self.comments, pending, stored);
    }

    pub fn rollback(&mut self, pending: &CommentId) {
        self.comments = tree::remove_comment(&self.comments, pending);
    }

    /// Sets the current user's reaction on comment `id`
    ///
    /// Returns the previous reaction, to be passed back to `react` if the
    /// backend refuses the vote.
    pub fn react(&mut self, id: &CommentId, new: Option<Reaction>) -> Option<Reaction> {
        let previous = tree::find_comment(&self.comments, id)?.user_reaction;
        self.comments = tree::update_comment_reaction(&self.comments, id, previous, new);
        previous
    }

    /// Sets the current user's reaction on the review, returning the previous
    /// one
    pub fn react_to_review(&mut self, new: Option<Reaction>) -> Option<Reaction> {
        let previous = self.reaction;
        if previous != new {
            move_vote(&mut self.likes, &mut self.dislikes, previous, new);
        }
        self.reaction = new;
        previous
    }

    /// Applies a click on the like or dislike button of the review, the way
    /// the backend resolves the vote
    pub fn toggle_review(&mut self, requested: Reaction) -> VoteOutcome {
        let outcome = VoteOutcome::toggle(self.reaction, requested);
        self.react_to_review(outcome.current);
        outcome
    }

    /// Same as `toggle_review`, for comment `id`
    pub fn toggle(&mut self, id: &CommentId, requested: Reaction) -> Option<VoteOutcome> {
        let previous = tree::find_comment(&self.comments, id)?.user_reaction;
        let outcome = VoteOutcome::toggle(previous, requested);
        self.react(id, outcome.current);
        Some(outcome)
    }

    /// Applies a change pushed by the realtime feed
    ///
    /// Returns whether the thread changed.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> bool {
        match event.table {
            Table::Comments => self.apply_comment_change(event),
            Table::Votes => self.apply_vote_change(event),
            Table::Reviews => false,
        }
    }

    fn apply_comment_change(&mut self, event: &ChangeEvent) -> bool {
        let comment = match normalize_comment(event.row()) {
            Some(c) if c.review_id == self.review_id => c,
            Some(_) => return false,
            None => return false,
        };
        let existing = tree::find_comment(&self.comments, &comment.id);
        match (event.kind, existing) {
            (ChangeKind::Insert, Some(_)) => false,
            (ChangeKind::Insert, None) => match comment.parent_comment_id {
                None => {
                    self.comments.push(comment);
                    true
                }
                Some(parent) if tree::find_comment(&self.comments, &parent).is_some() => {
                    self.comments = tree::add_reply(&self.comments, &parent, comment);
                    true
                }
                Some(parent) => {
                    tracing::warn!(id = ?comment.id, ?parent, "realtime reply to an unknown comment");
                    false
                }
            },
            (ChangeKind::Update, Some(old)) => {
                let updated = Comment {
                    replies: old.replies.clone(),
                    user_reaction: old.user_reaction,
                    nesting_level: old.nesting_level,
                    ..comment
                };
                if updated == *old {
                    return false;
                }
                let id = updated.id;
                self.comments = tree::replace_comment(&self.comments, &id, updated);
                true
            }
            (ChangeKind::Update, None) => {
                tracing::debug!(id = ?comment.id, "update for a comment not in the thread");
                false
            }
            (ChangeKind::Delete, Some(_)) => {
                self.comments = tree::remove_comment(&self.comments, &comment.id);
                true
            }
            (ChangeKind::Delete, None) => false,
        }
    }

    fn apply_vote_change(&mut self, event: &ChangeEvent) -> bool {
        let old = VoteKey::from_row(&event.old);
        let new = VoteKey::from_row(&event.new);
        let (previous, current) = match event.kind {
            ChangeKind::Insert => (None, new),
            ChangeKind::Delete => (old, None),
            ChangeKind::Update => match old {
                Some(old) => (Some(old), new),
                None => {
                    tracing::warn!("vote update without the previous row, ignoring it");
                    return false;
                }
            },
        };
        let key = match current.or(previous) {
            Some(key) => key,
            None => {
                tracing::warn!(?event, "ignoring unreadable vote row");
                return false;
            }
        };
        if key.review_id != self.review_id || key.comment_id.is_some() {
            // comment counters come with the comment row update
            return false;
        }
        if self.user == Some(key.user_id) {
            // already applied when voting
            return false;
        }
        let previous = previous.map(|k| k.vote_type);
        let current = current.map(|k| k.vote_type);
        if previous == current {
            return false;
        }
        move_vote(&mut self.likes, &mut self.dislikes, previous, current);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{Ratings, ServiceId, Uuid};
    use serde_json::json;

    fn cid(n: u128) -> CommentId {
        CommentId(Uuid::from_u128(n))
    }

    fn review() -> Review {
        Review {
            id: ReviewId::stub(),
            service_id: ServiceId(Uuid::from_u128(7)),
            user_id: UserId(Uuid::from_u128(8)),
            author_name: String::from("reviewer"),
            ratings: Ratings {
                overall: 4,
                content: 4,
                value: 3,
                usability: 5,
                streaming_quality: 4,
            },
            content: String::from("fine"),
            likes: 2,
            dislikes: 1,
            created_at: chrono::Utc::now(),
        }
    }

    fn row(n: u128, parent: Option<u128>, minute: u32) -> Value {
        json!({
            "id": cid(n).0.to_string(),
            "parent_comment_id": parent.map(|p| cid(p).0.to_string()),
            "review_id": ReviewId::stub().0.to_string(),
            "content": format!("comment {n}"),
            "likes": 0,
            "dislikes": 0,
            "created_at": format!("2024-01-01T00:{minute:02}:00Z"),
        })
    }

    fn change(table: Table, kind: ChangeKind, new: Value, old: Value) -> ChangeEvent {
        ChangeEvent {
            table,
            kind,
            new,
            old,
            commit_timestamp: chrono::Utc::now(),
        }
    }

    fn vote_row(user: UserId, comment: Option<CommentId>, kind: &str) -> Value {
        json!({
            "review_id": ReviewId::stub().0.to_string(),
            "comment_id": comment.map(|c| c.0.to_string()),
            "user_id": user.0.to_string(),
            "vote_type": kind,
        })
    }

    fn thread() -> ReviewThread {
        ReviewThread::load(
            &review(),
            Some(UserId::stub()),
            &json!([row(1, None, 0)]),
            &json!([row(2, Some(1), 1)]),
            &json!({}),
        )
    }

    fn ids(t: &ReviewThread) -> Vec<CommentId> {
        tree::flatten(t.comments()).into_iter().map(|c| c.id).collect()
    }

    #[test]
    fn load_builds_tree() {
        let t = thread();
        assert_eq!(ids(&t), vec![cid(1), cid(2)]);
        assert_eq!((t.likes(), t.dislikes()), (2, 1));
        assert_eq!(
            t.channel_scope().to_string(),
            format!("review_id=eq.{}", ReviewId::stub().0)
        );
    }

    #[test]
    fn pending_reply_confirmed() {
        let mut t = thread();
        let new = NewComment {
            id: cid(100),
            review_id: ReviewId::stub(),
            parent_comment_id: Some(cid(2)),
            content: String::from("hi"),
        };
        let pending = t.insert_pending(&new, "me");
        assert_eq!(ids(&t), vec![cid(1), cid(2), cid(100)]);
        assert_eq!(tree::find_comment(t.comments(), &cid(100)).unwrap().nesting_level, 3);

        let mut stored = normalize_comment(&row(3, Some(2), 5)).unwrap();
        stored.content = String::from("hi");
        t.confirm(&pending.id, stored);
        assert_eq!(ids(&t), vec![cid(1), cid(2), cid(3)]);
        let three = tree::find_comment(t.comments(), &cid(3)).unwrap();
        assert_eq!((three.nesting_level, three.content.as_str()), (3, "hi"));
    }

    #[test]
    fn confirm_after_realtime_insert() {
        let mut t = thread();
        let new = NewComment {
            id: cid(100),
            review_id: ReviewId::stub(),
            parent_comment_id: None,
            content: String::from("hi"),
        };
        t.insert_pending(&new, "me");
        assert!(t.apply_change(&change(
            Table::Comments,
            ChangeKind::Insert,
            row(3, None, 5),
            Value::Null,
        )));
        t.confirm(&cid(100), normalize_comment(&row(3, None, 5)).unwrap());
        assert_eq!(ids(&t), vec![cid(1), cid(2), cid(3)]);
    }

    #[test]
    fn pending_rolled_back() {
        let mut t = thread();
        let before = t.clone();
        let new = NewComment {
            id: cid(100),
            review_id: ReviewId::stub(),
            parent_comment_id: None,
            content: String::from("hi"),
        };
        t.insert_pending(&new, "me");
        assert_ne!(t, before);
        t.rollback(&cid(100));
        assert_eq!(t, before);
    }

    #[test]
    fn reaction_and_its_rollback() {
        let mut t = thread();
        let before = t.clone();
        let previous = t.react(&cid(2), Some(Reaction::Like));
        assert_eq!(previous, None);
        let two = tree::find_comment(t.comments(), &cid(2)).unwrap();
        assert_eq!((two.likes, two.user_reaction), (1, Some(Reaction::Like)));
        assert_eq!(t.react(&cid(2), previous), Some(Reaction::Like));
        assert_eq!(t, before);
        assert_eq!(t.react(&cid(99), Some(Reaction::Like)), None);
        assert_eq!(t, before);
    }

    #[test]
    fn review_reaction() {
        let mut t = thread();
        assert_eq!(t.react_to_review(Some(Reaction::Dislike)), None);
        assert_eq!((t.likes(), t.dislikes()), (2, 2));
        assert_eq!(t.react_to_review(Some(Reaction::Like)), Some(Reaction::Dislike));
        assert_eq!((t.likes(), t.dislikes()), (3, 1));
        assert_eq!(t.react_to_review(None), Some(Reaction::Like));
        assert_eq!((t.likes(), t.dislikes()), (2, 1));
    }

    #[test]
    fn stored_review_reaction_is_loaded() {
        // the review's 2 likes include the current user's
        let mut t = ReviewThread::load(
            &review(),
            Some(UserId::stub()),
            &json!([row(1, None, 0)]),
            &json!([]),
            &json!({ "review": "like", (UserReactions::key(&cid(1))): "dislike" }),
        );
        assert_eq!(t.reaction(), Some(Reaction::Like));
        assert_eq!(t.comments()[0].user_reaction, Some(Reaction::Dislike));

        let outcome = t.toggle_review(Reaction::Like);
        assert_eq!(outcome, VoteOutcome { previous: Some(Reaction::Like), current: None });
        assert_eq!((t.likes(), t.dislikes(), t.reaction()), (1, 1, None));

        let outcome = t.toggle_review(Reaction::Dislike);
        assert_eq!(outcome.current, Some(Reaction::Dislike));
        assert_eq!((t.likes(), t.dislikes()), (1, 2));
        let outcome = t.toggle_review(Reaction::Like);
        assert_eq!(outcome.previous, Some(Reaction::Dislike));
        assert_eq!((t.likes(), t.dislikes(), t.reaction()), (2, 1, Some(Reaction::Like)));
    }

    #[test]
    fn toggling_comment_reactions() {
        let mut t = thread();
        let outcome = t.toggle(&cid(2), Reaction::Like).unwrap();
        assert_eq!(outcome, VoteOutcome { previous: None, current: Some(Reaction::Like) });
        let outcome = t.toggle(&cid(2), Reaction::Like).unwrap();
        assert_eq!(outcome.current, None);
        let two = tree::find_comment(t.comments(), &cid(2)).unwrap();
        assert_eq!((two.likes, two.user_reaction), (0, None));
        assert_eq!(t.toggle(&cid(99), Reaction::Like), None);
    }

    #[test]
    fn realtime_inserts_are_idempotent() {
        let mut t = thread();
        let insert = change(Table::Comments, ChangeKind::Insert, row(3, Some(2), 2), Value::Null);
        assert!(t.apply_change(&insert));
        assert!(!t.apply_change(&insert));
        assert_eq!(ids(&t), vec![cid(1), cid(2), cid(3)]);
        let orphan = change(Table::Comments, ChangeKind::Insert, row(4, Some(50), 2), Value::Null);
        assert!(!t.apply_change(&orphan));
        let mut other = row(5, None, 2);
        other["review_id"] = json!(Uuid::new_v4().to_string());
        assert!(!t.apply_change(&change(Table::Comments, ChangeKind::Insert, other, Value::Null)));
        assert_eq!(ids(&t), vec![cid(1), cid(2), cid(3)]);
    }

    #[test]
    fn realtime_update_keeps_replies_and_reaction() {
        let mut t = thread();
        t.react(&cid(1), Some(Reaction::Dislike));
        let mut updated = row(1, None, 0);
        updated["content"] = json!("edited");
        updated["likes"] = json!(4);
        updated["dislikes"] = json!(1);
        assert!(t.apply_change(&change(Table::Comments, ChangeKind::Update, updated.clone(), row(1, None, 0))));
        let one = &t.comments()[0];
        assert_eq!(one.content, "edited");
        assert_eq!((one.likes, one.dislikes), (4, 1));
        assert_eq!(one.user_reaction, Some(Reaction::Dislike));
        assert_eq!(one.replies.len(), 1);
        assert!(!t.apply_change(&change(Table::Comments, ChangeKind::Update, updated, Value::Null)));
    }

    #[test]
    fn realtime_delete() {
        let mut t = thread();
        assert!(t.apply_change(&change(Table::Comments, ChangeKind::Delete, Value::Null, row(1, None, 0))));
        assert!(t.comments().is_empty());
        assert!(!t.apply_change(&change(Table::Comments, ChangeKind::Delete, Value::Null, row(1, None, 0))));
    }

    #[test]
    fn votes_of_other_users_on_the_review() {
        let mut t = thread();
        let other = UserId(Uuid::from_u128(42));
        let like = vote_row(other, None, "like");
        let dislike = vote_row(other, None, "dislike");
        assert!(t.apply_change(&change(Table::Votes, ChangeKind::Insert, like.clone(), Value::Null)));
        assert_eq!((t.likes(), t.dislikes()), (3, 1));
        assert!(t.apply_change(&change(Table::Votes, ChangeKind::Update, dislike.clone(), like)));
        assert_eq!((t.likes(), t.dislikes()), (2, 2));
        assert!(t.apply_change(&change(Table::Votes, ChangeKind::Delete, Value::Null, dislike)));
        assert_eq!((t.likes(), t.dislikes()), (2, 1));
    }

    #[test]
    fn ignored_votes() {
        let mut t = thread();
        let before = t.clone();
        let own = vote_row(UserId::stub(), None, "like");
        assert!(!t.apply_change(&change(Table::Votes, ChangeKind::Insert, own, Value::Null)));
        let on_comment = vote_row(UserId(Uuid::from_u128(42)), Some(cid(1)), "like");
        assert!(!t.apply_change(&change(Table::Votes, ChangeKind::Insert, on_comment, Value::Null)));
        let mut elsewhere = vote_row(UserId(Uuid::from_u128(42)), None, "like");
        elsewhere["review_id"] = json!(Uuid::new_v4().to_string());
        assert!(!t.apply_change(&change(Table::Votes, ChangeKind::Insert, elsewhere, Value::Null)));
        assert!(!t.apply_change(&change(Table::Votes, ChangeKind::Insert, json!({}), Value::Null)));
        assert_eq!(t, before);
    }
}
