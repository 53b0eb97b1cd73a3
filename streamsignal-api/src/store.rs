use async_trait::async_trait;

use crate::{
    AuthToken, ChangeEvent, Comment, Error, NewComment, NewReview, NewVote, Review, ReviewId,
    Service, ServiceId, UserId, UserReactions, VoteOutcome,
};

/// Backing storage of the server actions
///
/// Mutations return the row change events they committed, for relaying to
/// realtime subscribers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn recover_session(&self, token: AuthToken) -> Result<UserId, Error>;

    async fn fetch_services(&self) -> Result<Vec<Service>, Error>;
    async fn fetch_service(&self, slug: &str) -> Result<Option<Service>, Error>;

    async fn fetch_reviews(&self, service: ServiceId) -> Result<Vec<Review>, Error>;
    async fn submit_review(
        &self,
        user: UserId,
        review: NewReview,
    ) -> Result<(Review, Vec<ChangeEvent>), Error>;

    /// Returns the top-level comments and all the replies of a review, both
    /// flat, with empty `replies` and `nesting_level` left to the tree builder
    async fn fetch_comments(&self, review: ReviewId) -> Result<(Vec<Comment>, Vec<Comment>), Error>;
    async fn fetch_user_reactions(
        &self,
        user: UserId,
        review: ReviewId,
    ) -> Result<UserReactions, Error>;
    async fn submit_comment(
        &self,
        user: UserId,
        comment: NewComment,
    ) -> Result<(Comment, Vec<ChangeEvent>), Error>;

    async fn submit_vote(
        &self,
        user: UserId,
        vote: NewVote,
    ) -> Result<(VoteOutcome, Vec<ChangeEvent>), Error>;
}
