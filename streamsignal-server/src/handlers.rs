use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    Json,
};
use futures::StreamExt;
use streamsignal_api::{
    ActionResult, Comment, NewComment, NewReview, NewVote, Review, ReviewId, Service, ServiceId,
    Store, UserReactions, Uuid, VoteOutcome,
};
use streamsignal_client::tree;

use crate::{extractors::*, Error, Feeds};

pub async fn fetch_services(
    State(store): State<Arc<dyn Store>>,
) -> Result<Json<Vec<Service>>, Error> {
    Ok(Json(store.fetch_services().await?))
}

pub async fn fetch_service(
    State(store): State<Arc<dyn Store>>,
    Path(slug): Path<String>,
) -> Result<Json<Service>, Error> {
    match store.fetch_service(&slug).await? {
        Some(s) => Ok(Json(s)),
        None => Err(Error::service_not_found(slug)),
    }
}

pub async fn fetch_reviews(
    State(store): State<Arc<dyn Store>>,
    Path(service): Path<Uuid>,
) -> Result<Json<Vec<Review>>, Error> {
    Ok(Json(store.fetch_reviews(ServiceId(service)).await?))
}

pub async fn submit_review(
    Auth(user): Auth,
    State(store): State<Arc<dyn Store>>,
    State(feeds): State<Feeds>,
    Json(review): Json<NewReview>,
) -> Result<Json<ActionResult<Review>>, Error> {
    review.validate()?;
    let (review, events) = store.submit_review(user, review).await?;
    tracing::info!(review = ?review.id, ?user, "review submitted");
    feeds.relay(&events).await;
    Ok(Json(ActionResult::ok(review)))
}

/// The comment tree of a review, with the reactions of the current user if
/// the request is authenticated
pub async fn fetch_comments(
    MaybeAuth(user): MaybeAuth,
    State(store): State<Arc<dyn Store>>,
    Path(review): Path<Uuid>,
) -> Result<Json<Vec<Comment>>, Error> {
    let review = ReviewId(review);
    let (top_level, replies) = store.fetch_comments(review).await?;
    let reactions = match user {
        Some(user) => store.fetch_user_reactions(user, review).await?,
        None => UserReactions::default(),
    };
    Ok(Json(tree::assemble_comment_tree(
        top_level, replies, &reactions,
    )))
}

/// The current user's reactions on a review and its comments
pub async fn fetch_reactions(
    Auth(user): Auth,
    State(store): State<Arc<dyn Store>>,
    Path(review): Path<Uuid>,
) -> Result<Json<UserReactions>, Error> {
    Ok(Json(store.fetch_user_reactions(user, ReviewId(review)).await?))
}

pub async fn submit_comment(
    Auth(user): Auth,
    State(store): State<Arc<dyn Store>>,
    State(feeds): State<Feeds>,
    Json(comment): Json<NewComment>,
) -> Result<Json<ActionResult<Comment>>, Error> {
    comment.validate()?;
    let (comment, events) = store.submit_comment(user, comment).await?;
    tracing::info!(comment = ?comment.id, review = ?comment.review_id, ?user, "comment submitted");
    feeds.relay(&events).await;
    Ok(Json(ActionResult::ok(comment)))
}

pub async fn submit_vote(
    Auth(user): Auth,
    State(store): State<Arc<dyn Store>>,
    State(feeds): State<Feeds>,
    Json(vote): Json<NewVote>,
) -> Result<Json<ActionResult<VoteOutcome>>, Error> {
    let (outcome, events) = store.submit_vote(user, vote).await?;
    feeds.relay(&events).await;
    Ok(Json(ActionResult::ok(outcome)))
}

pub async fn realtime_feed(
    ws: WebSocketUpgrade,
    State(feeds): State<Feeds>,
) -> Result<axum::response::Response, Error> {
    Ok(ws.on_upgrade(move |sock| {
        let (write, read) = sock.split();
        feeds.serve(write, read)
    }))
}
