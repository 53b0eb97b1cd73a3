use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;
use streamsignal_client::{
    api::{
        self, to_row, AuthToken, ChangeEvent, ChannelSpec, Comment, Error, NewComment, NewReview,
        NewVote, Reaction, Review, ReviewId, Service, ServiceId, SubscribeStatus, Table, UserId,
        UserReactions, Uuid, Vote, VoteOutcome, MAX_NESTING_LEVEL,
    },
    realtime::{ChannelMessage, Realtime, Subscription},
    tree::move_vote,
};

/// In-memory stand-in for both the database and the realtime service
///
/// Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct MockServer(Arc<Mutex<Db>>);

#[derive(Debug, Default)]
struct Db {
    services: Vec<Service>,
    users: HashMap<UserId, String>,
    sessions: HashMap<AuthToken, UserId>,
    reviews: Vec<Review>,
    comments: Vec<Comment>,
    votes: Vec<Vote>,
    feeds: Vec<Feed>,
    failing_subscriptions: usize,
    last_event: Option<ChangeEvent>,
}

#[derive(Debug)]
struct Feed {
    channel: String,
    spec: ChannelSpec,
    sender: mpsc::UnboundedSender<ChannelMessage>,
}

impl Db {
    fn relay(&mut self, events: &[ChangeEvent]) {
        for e in events {
            self.feeds.retain(|f| {
                if !f.spec.matches(e) {
                    return !f.sender.is_closed();
                }
                f.sender
                    .unbounded_send(ChannelMessage::Change(e.clone()))
                    .is_ok()
            });
            self.last_event = Some(e.clone());
        }
    }

    fn author_name(&self, user: UserId) -> String {
        self.users
            .get(&user)
            .cloned()
            .unwrap_or_else(|| String::from("Anonymous"))
    }

    /// Level comment `id` sits at in its review's tree
    fn nesting_level(&self, mut id: api::CommentId) -> u32 {
        let mut level = 1;
        while let Some(parent) = self
            .comments
            .iter()
            .find(|c| c.id == id)
            .and_then(|c| c.parent_comment_id)
        {
            level += 1;
            id = parent;
            if level > MAX_NESTING_LEVEL {
                break;
            }
        }
        level
    }

    fn review_mut(&mut self, id: ReviewId) -> Result<&mut Review, Error> {
        self.reviews
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(Error::NotFound(id.0))
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer::default()
    }

    pub fn test_add_service(&self, slug: &str, name: &str) -> Service {
        let s = Service {
            id: ServiceId(Uuid::new_v4()),
            slug: String::from(slug),
            name: String::from(name),
            description: format!("{name} streaming service"),
        };
        self.0.lock().services.push(s.clone());
        s
    }

    /// Creates a user and returns a session token for them
    pub fn test_add_user(&self, name: &str) -> (UserId, AuthToken) {
        let user = UserId(Uuid::new_v4());
        let token = AuthToken(Uuid::new_v4());
        let mut db = self.0.lock();
        db.users.insert(user, String::from(name));
        db.sessions.insert(token, user);
        (user, token)
    }

    /// Makes the next `n` subscriptions fail with a channel error
    pub fn test_fail_next_subscriptions(&self, n: usize) {
        self.0.lock().failing_subscriptions = n;
    }

    /// Sends the last change event again, as the realtime service sometimes
    /// does
    pub fn test_redeliver_last(&self) {
        let mut db = self.0.lock();
        if let Some(e) = db.last_event.clone() {
            db.relay(&[e]);
        }
    }

    /// Sends `event` to the matching subscriptions, as if another server
    /// committed it
    pub fn test_push(&self, event: ChangeEvent) {
        self.0.lock().relay(&[event]);
    }

    /// Drops every open subscription from the server side
    pub fn test_close_subscriptions(&self) {
        self.0.lock().feeds.clear();
    }

    /// Names of the currently open channels
    pub fn test_open_channels(&self) -> Vec<String> {
        let mut db = self.0.lock();
        db.feeds.retain(|f| !f.sender.is_closed());
        db.feeds.iter().map(|f| f.channel.clone()).collect()
    }
}

#[async_trait]
impl Realtime for MockServer {
    async fn subscribe(&self, channel: &str, spec: ChannelSpec) -> anyhow::Result<Subscription> {
        let (sender, sub) = Subscription::channel();
        let mut db = self.0.lock();
        if db.failing_subscriptions > 0 {
            db.failing_subscriptions -= 1;
            tracing::debug!(channel, "failing subscription on request");
            sender.unbounded_send(ChannelMessage::Status(SubscribeStatus::ChannelError))?;
            return Ok(sub);
        }
        sender.unbounded_send(ChannelMessage::Status(SubscribeStatus::Subscribed))?;
        db.feeds.push(Feed {
            channel: String::from(channel),
            spec,
            sender,
        });
        Ok(sub)
    }
}

#[async_trait]
impl api::Store for MockServer {
    async fn recover_session(&self, token: AuthToken) -> Result<UserId, Error> {
        self.0
            .lock()
            .sessions
            .get(&token)
            .copied()
            .ok_or(Error::PermissionDenied)
    }

    async fn fetch_services(&self) -> Result<Vec<Service>, Error> {
        let mut res = self.0.lock().services.clone();
        res.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(res)
    }

    async fn fetch_service(&self, slug: &str) -> Result<Option<Service>, Error> {
        Ok(self
            .0
            .lock()
            .services
            .iter()
            .find(|s| s.slug == slug)
            .cloned())
    }

    async fn fetch_reviews(&self, service: ServiceId) -> Result<Vec<Review>, Error> {
        let db = self.0.lock();
        if !db.services.iter().any(|s| s.id == service) {
            return Err(Error::NotFound(service.0));
        }
        let mut res = db
            .reviews
            .iter()
            .filter(|r| r.service_id == service)
            .cloned()
            .collect::<Vec<_>>();
        res.reverse();
        Ok(res)
    }

    async fn submit_review(
        &self,
        user: UserId,
        review: NewReview,
    ) -> Result<(Review, Vec<ChangeEvent>), Error> {
        review.validate()?;
        let mut db = self.0.lock();
        if !db.services.iter().any(|s| s.id == review.service_id) {
            return Err(Error::NotFound(review.service_id.0));
        }
        if db.reviews.iter().any(|r| r.id == review.id) {
            return Err(Error::UuidAlreadyUsed(review.id.0));
        }
        let stored = Review {
            id: review.id,
            service_id: review.service_id,
            user_id: user,
            author_name: db.author_name(user),
            ratings: review.ratings,
            content: review.content,
            likes: 0,
            dislikes: 0,
            created_at: chrono::Utc::now(),
        };
        db.reviews.push(stored.clone());
        let events = vec![ChangeEvent::insert(Table::Reviews, to_row(&stored))];
        db.relay(&events);
        Ok((stored, events))
    }

    async fn fetch_comments(&self, review: ReviewId) -> Result<(Vec<Comment>, Vec<Comment>), Error> {
        let db = self.0.lock();
        if !db.reviews.iter().any(|r| r.id == review) {
            return Err(Error::NotFound(review.0));
        }
        Ok(db
            .comments
            .iter()
            .filter(|c| c.review_id == review)
            .cloned()
            .partition(|c| c.is_top_level()))
    }

    async fn fetch_user_reactions(
        &self,
        user: UserId,
        review: ReviewId,
    ) -> Result<UserReactions, Error> {
        let db = self.0.lock();
        let mut res = UserReactions::default();
        for v in db.votes.iter().filter(|v| v.user_id == user && v.review_id == review) {
            match v.comment_id {
                Some(c) => {
                    res.comments.insert(c, v.vote_type);
                }
                None => res.review = Some(v.vote_type),
            }
        }
        Ok(res)
    }

    async fn submit_comment(
        &self,
        user: UserId,
        comment: NewComment,
    ) -> Result<(Comment, Vec<ChangeEvent>), Error> {
        comment.validate()?;
        let mut db = self.0.lock();
        db.review_mut(comment.review_id)?;
        if db.comments.iter().any(|c| c.id == comment.id) {
            return Err(Error::UuidAlreadyUsed(comment.id.0));
        }
        if let Some(parent) = comment.parent_comment_id {
            match db.comments.iter().find(|c| c.id == parent) {
                None => return Err(Error::NotFound(parent.0)),
                Some(p) if p.review_id != comment.review_id => {
                    return Err(Error::ParentInOtherReview(parent.0))
                }
                Some(_) => (),
            }
            if db.nesting_level(parent) >= MAX_NESTING_LEVEL {
                return Err(Error::ReplyTooDeep(parent.0));
            }
        }
        let stored = Comment {
            id: comment.id,
            parent_comment_id: comment.parent_comment_id,
            review_id: comment.review_id,
            user_id: Some(user),
            author_name: db.author_name(user),
            author_avatar: String::new(),
            content: comment.content,
            likes: 0,
            dislikes: 0,
            created_at: chrono::Utc::now().to_rfc3339(),
            nesting_level: 1,
            replies: Vec::new(),
            user_reaction: None,
        };
        db.comments.push(stored.clone());
        let events = vec![ChangeEvent::insert(Table::Comments, to_row(&stored))];
        db.relay(&events);
        Ok((stored, events))
    }

    async fn submit_vote(
        &self,
        user: UserId,
        vote: NewVote,
    ) -> Result<(VoteOutcome, Vec<ChangeEvent>), Error> {
        let mut db = self.0.lock();
        db.review_mut(vote.review_id)?;
        if let Some(c) = vote.comment_id {
            if !db
                .comments
                .iter()
                .any(|x| x.id == c && x.review_id == vote.review_id)
            {
                return Err(Error::NotFound(c.0));
            }
        }

        let existing = db.votes.iter().position(|v| {
            v.user_id == user && v.review_id == vote.review_id && v.comment_id == vote.comment_id
        });
        let outcome = VoteOutcome::toggle(
            existing.map(|i| db.votes[i].vote_type),
            vote.vote_type,
        );
        let mut events = Vec::with_capacity(2);
        match (existing, outcome.current) {
            (Some(i), None) => {
                let old = db.votes.remove(i);
                events.push(ChangeEvent::delete(Table::Votes, to_row(&old)));
            }
            (Some(i), Some(current)) => {
                let old = to_row(&db.votes[i]);
                db.votes[i].vote_type = current;
                events.push(ChangeEvent::update(Table::Votes, to_row(&db.votes[i]), old));
            }
            (None, Some(current)) => {
                let new = Vote {
                    review_id: vote.review_id,
                    comment_id: vote.comment_id,
                    user_id: user,
                    vote_type: current,
                    created_at: chrono::Utc::now(),
                };
                events.push(ChangeEvent::insert(Table::Votes, to_row(&new)));
                db.votes.push(new);
            }
            (None, None) => (),
        }

        match vote.comment_id {
            Some(id) => {
                if let Some(c) = db.comments.iter_mut().find(|c| c.id == id) {
                    let old = to_row(&*c);
                    move_vote(&mut c.likes, &mut c.dislikes, outcome.previous, outcome.current);
                    events.push(ChangeEvent::update(Table::Comments, to_row(&*c), old));
                }
            }
            None => {
                let r = db.review_mut(vote.review_id)?;
                let old = to_row(&*r);
                move_vote(&mut r.likes, &mut r.dislikes, outcome.previous, outcome.current);
                events.push(ChangeEvent::update(Table::Reviews, to_row(&*r), old));
            }
        }
        db.relay(&events);
        Ok((outcome, events))
    }
}
