use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::TryStreamExt;
use streamsignal_api::{
    to_row, AuthToken, ChangeEvent, Comment, CommentId, Error, NewComment, NewReview, NewVote,
    Ratings, Reaction, Review, ReviewId, Service, ServiceId, Store, Table, Time, UserId,
    UserReactions, Uuid, Vote, VoteOutcome, MAX_NESTING_LEVEL,
};

/// `Store` backed by the Postgres schema in `migrations/`
#[derive(Clone)]
pub struct PostgresStore(sqlx::PgPool);

impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> PostgresStore {
        PostgresStore(pool)
    }
}

fn internal(err: anyhow::Error) -> Error {
    tracing::error!(?err, "database failure");
    Error::Unknown(String::from("Internal server error, see logs for details"))
}

fn counter(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn rating(r: i16) -> Result<u8, Error> {
    u8::try_from(r).map_err(|_| internal(anyhow!("rating {r} out of range in database")))
}

fn reaction(kind: &str) -> Result<Reaction, Error> {
    Reaction::parse(kind).ok_or_else(|| internal(anyhow!("unknown vote type {kind:?} in database")))
}

/// Counter increments for moving a vote from `previous` to `current`
fn deltas(previous: Option<Reaction>, current: Option<Reaction>) -> (i64, i64) {
    let weight = |r: Option<Reaction>| match r {
        Some(Reaction::Like) => (1, 0),
        Some(Reaction::Dislike) => (0, 1),
        None => (0, 0),
    };
    let (pl, pd) = weight(previous);
    let (cl, cd) = weight(current);
    (cl - pl, cd - pd)
}

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: Uuid,
    slug: String,
    name: String,
    description: String,
}

impl From<ServiceRow> for Service {
    fn from(s: ServiceRow) -> Service {
        Service {
            id: ServiceId(s.id),
            slug: s.slug,
            name: s.name,
            description: s.description,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReviewRow {
    id: Uuid,
    service_id: Uuid,
    user_id: Uuid,
    author_name: Option<String>,
    overall_rating: i16,
    content_rating: i16,
    value_rating: i16,
    usability_rating: i16,
    streaming_quality_rating: i16,
    content: String,
    likes: i64,
    dislikes: i64,
    created_at: Time,
}

impl ReviewRow {
    fn into_review(self) -> Result<Review, Error> {
        Ok(Review {
            id: ReviewId(self.id),
            service_id: ServiceId(self.service_id),
            user_id: UserId(self.user_id),
            author_name: self.author_name.unwrap_or_else(|| String::from("Anonymous")),
            ratings: Ratings {
                overall: rating(self.overall_rating)?,
                content: rating(self.content_rating)?,
                value: rating(self.value_rating)?,
                usability: rating(self.usability_rating)?,
                streaming_quality: rating(self.streaming_quality_rating)?,
            },
            content: self.content,
            likes: counter(self.likes),
            dislikes: counter(self.dislikes),
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CommentRow {
    id: Uuid,
    review_id: Uuid,
    parent_comment_id: Option<Uuid>,
    user_id: Option<Uuid>,
    author_name: Option<String>,
    author_avatar: Option<String>,
    content: String,
    likes: i64,
    dislikes: i64,
    created_at: Time,
}

impl From<CommentRow> for Comment {
    fn from(c: CommentRow) -> Comment {
        Comment {
            id: CommentId(c.id),
            parent_comment_id: c.parent_comment_id.map(CommentId),
            review_id: ReviewId(c.review_id),
            user_id: c.user_id.map(UserId),
            author_name: c.author_name.unwrap_or_else(|| String::from("Anonymous")),
            author_avatar: c.author_avatar.unwrap_or_default(),
            content: c.content,
            likes: counter(c.likes),
            dislikes: counter(c.dislikes),
            created_at: c.created_at.to_rfc3339(),
            nesting_level: 1,
            replies: Vec::new(),
            user_reaction: None,
        }
    }
}

async fn fetch_review(
    conn: &mut sqlx::PgConnection,
    id: ReviewId,
) -> Result<Option<Review>, Error> {
    sqlx::query_as::<_, ReviewRow>(
        "
            SELECT
                r.id, r.service_id, r.user_id,
                COALESCE(p.display_name, p.username) AS author_name,
                r.overall_rating, r.content_rating, r.value_rating,
                r.usability_rating, r.streaming_quality_rating,
                r.content, r.likes, r.dislikes, r.created_at
            FROM reviews r
            LEFT JOIN profiles p
                ON p.id = r.user_id
            WHERE r.id = $1
        ",
    )
    .bind(id.0)
    .fetch_optional(conn)
    .await
    .with_context(|| format!("fetching review {id:?}"))
    .map_err(internal)?
    .map(ReviewRow::into_review)
    .transpose()
}

async fn fetch_comment(
    conn: &mut sqlx::PgConnection,
    id: CommentId,
) -> Result<Option<Comment>, Error> {
    Ok(sqlx::query_as::<_, CommentRow>(
        "
            SELECT
                c.id, c.review_id, c.parent_comment_id, c.user_id,
                COALESCE(p.display_name, p.username) AS author_name,
                p.avatar_url AS author_avatar,
                c.content, c.likes, c.dislikes, c.created_at
            FROM comments c
            LEFT JOIN profiles p
                ON p.id = c.user_id
            WHERE c.id = $1
        ",
    )
    .bind(id.0)
    .fetch_optional(conn)
    .await
    .with_context(|| format!("fetching comment {id:?}"))
    .map_err(internal)?
    .map(Comment::from))
}

async fn service_exists(conn: &mut sqlx::PgConnection, id: ServiceId) -> Result<bool, Error> {
    Ok(sqlx::query("SELECT 1 FROM services WHERE id = $1")
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .context("checking service existence")
        .map_err(internal)?
        .is_some())
}

/// Review the comment `id` belongs to, if it exists
async fn comment_review(
    conn: &mut sqlx::PgConnection,
    id: CommentId,
) -> Result<Option<ReviewId>, Error> {
    Ok(
        sqlx::query_scalar::<_, Uuid>("SELECT review_id FROM comments WHERE id = $1")
            .bind(id.0)
            .fetch_optional(conn)
            .await
            .context("fetching review of comment")
            .map_err(internal)?
            .map(ReviewId),
    )
}

/// Review and nesting level of the comment `id`, if it exists
async fn comment_placement(
    conn: &mut sqlx::PgConnection,
    id: CommentId,
) -> Result<Option<(ReviewId, u32)>, Error> {
    sqlx::query_as::<_, (Uuid, i32)>("SELECT review_id, nesting_level FROM comments WHERE id = $1")
        .bind(id.0)
        .fetch_optional(conn)
        .await
        .context("fetching placement of comment")
        .map_err(internal)?
        .map(|(review, level)| {
            let level = u32::try_from(level)
                .map_err(|_| internal(anyhow!("nesting level {level} out of range in database")))?;
            Ok((ReviewId(review), level))
        })
        .transpose()
}

/// Advisory lock key serializing the votes of `user` on one target
///
/// Row locks are not enough, as there is no row to lock before the first
/// vote.
fn vote_lock_key(user: UserId, review: ReviewId, comment: Option<CommentId>) -> String {
    match comment {
        Some(c) => format!("vote:{}:{}:{}", user.0, review.0, c.0),
        None => format!("vote:{}:{}", user.0, review.0),
    }
}

async fn begin(pool: &sqlx::PgPool) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, Error> {
    pool.begin()
        .await
        .context("starting transaction")
        .map_err(internal)
}

async fn commit(tx: sqlx::Transaction<'static, sqlx::Postgres>) -> Result<(), Error> {
    tx.commit()
        .await
        .context("committing transaction")
        .map_err(internal)
}

#[async_trait]
impl Store for PostgresStore {
    async fn recover_session(&self, token: AuthToken) -> Result<UserId, Error> {
        sqlx::query_scalar::<_, Uuid>("SELECT user_id FROM sessions WHERE id = $1")
            .bind(token.0)
            .fetch_optional(&self.0)
            .await
            .context("recovering session")
            .map_err(internal)?
            .map(UserId)
            .ok_or(Error::PermissionDenied)
    }

    async fn fetch_services(&self) -> Result<Vec<Service>, Error> {
        sqlx::query_as::<_, ServiceRow>(
            "SELECT id, slug, name, description FROM services ORDER BY name",
        )
        .fetch(&self.0)
        .map_ok(Service::from)
        .try_collect()
        .await
        .context("querying services table")
        .map_err(internal)
    }

    async fn fetch_service(&self, slug: &str) -> Result<Option<Service>, Error> {
        Ok(sqlx::query_as::<_, ServiceRow>(
            "SELECT id, slug, name, description FROM services WHERE slug = $1",
        )
        .bind(slug)
        .fetch_optional(&self.0)
        .await
        .with_context(|| format!("fetching service {slug:?}"))
        .map_err(internal)?
        .map(Service::from))
    }

    async fn fetch_reviews(&self, service: ServiceId) -> Result<Vec<Review>, Error> {
        let mut conn = self
            .0
            .acquire()
            .await
            .context("acquiring db connection")
            .map_err(internal)?;
        if !service_exists(&mut *conn, service).await? {
            return Err(Error::NotFound(service.0));
        }
        sqlx::query_as::<_, ReviewRow>(
            "
                SELECT
                    r.id, r.service_id, r.user_id,
                    COALESCE(p.display_name, p.username) AS author_name,
                    r.overall_rating, r.content_rating, r.value_rating,
                    r.usability_rating, r.streaming_quality_rating,
                    r.content, r.likes, r.dislikes, r.created_at
                FROM reviews r
                LEFT JOIN profiles p
                    ON p.id = r.user_id
                WHERE r.service_id = $1
                ORDER BY r.created_at DESC
            ",
        )
        .bind(service.0)
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("fetching reviews of service {service:?}"))
        .map_err(internal)?
        .into_iter()
        .map(ReviewRow::into_review)
        .collect()
    }

    async fn submit_review(
        &self,
        user: UserId,
        review: NewReview,
    ) -> Result<(Review, Vec<ChangeEvent>), Error> {
        review.validate()?;
        let mut tx = begin(&self.0).await?;
        if !service_exists(&mut *tx, review.service_id).await? {
            return Err(Error::NotFound(review.service_id.0));
        }
        if fetch_review(&mut *tx, review.id).await?.is_some() {
            return Err(Error::UuidAlreadyUsed(review.id.0));
        }
        let r = &review.ratings;
        sqlx::query(
            "
                INSERT INTO reviews (
                    id, service_id, user_id,
                    overall_rating, content_rating, value_rating,
                    usability_rating, streaming_quality_rating,
                    content
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(review.id.0)
        .bind(review.service_id.0)
        .bind(user.0)
        .bind(i16::from(r.overall))
        .bind(i16::from(r.content))
        .bind(i16::from(r.value))
        .bind(i16::from(r.usability))
        .bind(i16::from(r.streaming_quality))
        .bind(&review.content)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting review {:?}", review.id))
        .map_err(internal)?;
        let stored = fetch_review(&mut *tx, review.id)
            .await?
            .ok_or_else(|| internal(anyhow!("review {:?} vanished after insert", review.id)))?;
        commit(tx).await?;
        let events = vec![ChangeEvent::insert(Table::Reviews, to_row(&stored))];
        Ok((stored, events))
    }

    async fn fetch_comments(&self, review: ReviewId) -> Result<(Vec<Comment>, Vec<Comment>), Error> {
        let mut conn = self
            .0
            .acquire()
            .await
            .context("acquiring db connection")
            .map_err(internal)?;
        if fetch_review(&mut *conn, review).await?.is_none() {
            return Err(Error::NotFound(review.0));
        }
        Ok(sqlx::query_as::<_, CommentRow>(
            "
                SELECT
                    c.id, c.review_id, c.parent_comment_id, c.user_id,
                    COALESCE(p.display_name, p.username) AS author_name,
                    p.avatar_url AS author_avatar,
                    c.content, c.likes, c.dislikes, c.created_at
                FROM comments c
                LEFT JOIN profiles p
                    ON p.id = c.user_id
                WHERE c.review_id = $1
                ORDER BY c.created_at
            ",
        )
        .bind(review.0)
        .fetch_all(&mut *conn)
        .await
        .with_context(|| format!("fetching comments of review {review:?}"))
        .map_err(internal)?
        .into_iter()
        .map(Comment::from)
        .partition(|c| c.is_top_level()))
    }

    async fn fetch_user_reactions(
        &self,
        user: UserId,
        review: ReviewId,
    ) -> Result<UserReactions, Error> {
        let rows = sqlx::query_as::<_, (Option<Uuid>, String)>(
            "
                SELECT comment_id, vote_type
                FROM votes
                WHERE user_id = $1
                    AND review_id = $2
            ",
        )
        .bind(user.0)
        .bind(review.0)
        .fetch_all(&self.0)
        .await
        .context("fetching user reactions")
        .map_err(internal)?;
        let mut res = UserReactions::default();
        for (comment, kind) in rows {
            match comment {
                Some(c) => {
                    res.comments.insert(CommentId(c), reaction(&kind)?);
                }
                None => res.review = Some(reaction(&kind)?),
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
        let mut tx = begin(&self.0).await?;
        if fetch_review(&mut *tx, comment.review_id).await?.is_none() {
            return Err(Error::NotFound(comment.review_id.0));
        }
        if comment_review(&mut *tx, comment.id).await?.is_some() {
            return Err(Error::UuidAlreadyUsed(comment.id.0));
        }
        let level = match comment.parent_comment_id {
            None => 1,
            Some(parent) => match comment_placement(&mut *tx, parent).await? {
                None => return Err(Error::NotFound(parent.0)),
                Some((r, _)) if r != comment.review_id => {
                    return Err(Error::ParentInOtherReview(parent.0))
                }
                Some((_, level)) if level >= MAX_NESTING_LEVEL => {
                    return Err(Error::ReplyTooDeep(parent.0))
                }
                Some((_, level)) => level + 1,
            },
        };
        sqlx::query(
            "
                INSERT INTO comments (
                    id, review_id, parent_comment_id, nesting_level, user_id, content
                )
                VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(comment.id.0)
        .bind(comment.review_id.0)
        .bind(comment.parent_comment_id.map(|p| p.0))
        .bind(level as i32)
        .bind(user.0)
        .bind(&comment.content)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("inserting comment {:?}", comment.id))
        .map_err(internal)?;
        let stored = fetch_comment(&mut *tx, comment.id)
            .await?
            .ok_or_else(|| internal(anyhow!("comment {:?} vanished after insert", comment.id)))?;
        commit(tx).await?;
        let events = vec![ChangeEvent::insert(Table::Comments, to_row(&stored))];
        Ok((stored, events))
    }

    async fn submit_vote(
        &self,
        user: UserId,
        vote: NewVote,
    ) -> Result<(VoteOutcome, Vec<ChangeEvent>), Error> {
        let mut tx = begin(&self.0).await?;
        if fetch_review(&mut *tx, vote.review_id).await?.is_none() {
            return Err(Error::NotFound(vote.review_id.0));
        }
        if let Some(c) = vote.comment_id {
            if comment_review(&mut *tx, c).await? != Some(vote.review_id) {
                return Err(Error::NotFound(c.0));
            }
        }
        let comment_id = vote.comment_id.map(|c| c.0);

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(vote_lock_key(user, vote.review_id, vote.comment_id))
            .execute(&mut *tx)
            .await
            .context("locking vote target")
            .map_err(internal)?;
        let existing = sqlx::query_as::<_, (String, Time)>(
            "
                SELECT vote_type, created_at
                FROM votes
                WHERE user_id = $1
                    AND review_id = $2
                    AND comment_id IS NOT DISTINCT FROM $3
            ",
        )
        .bind(user.0)
        .bind(vote.review_id.0)
        .bind(comment_id)
        .fetch_optional(&mut *tx)
        .await
        .context("fetching previous vote")
        .map_err(internal)?;
        let existing = match existing {
            Some((kind, created_at)) => Some((reaction(&kind)?, created_at)),
            None => None,
        };
        let outcome = VoteOutcome::toggle(existing.map(|(k, _)| k), vote.vote_type);
        let row = |vote_type: Reaction, created_at: Time| {
            to_row(&Vote {
                review_id: vote.review_id,
                comment_id: vote.comment_id,
                user_id: user,
                vote_type,
                created_at,
            })
        };

        let mut events = Vec::with_capacity(2);
        match (existing, outcome.current) {
            (Some((previous, created_at)), None) => {
                sqlx::query(
                    "
                        DELETE FROM votes
                        WHERE user_id = $1
                            AND review_id = $2
                            AND comment_id IS NOT DISTINCT FROM $3
                    ",
                )
                .bind(user.0)
                .bind(vote.review_id.0)
                .bind(comment_id)
                .execute(&mut *tx)
                .await
                .context("deleting vote")
                .map_err(internal)?;
                events.push(ChangeEvent::delete(Table::Votes, row(previous, created_at)));
            }
            (Some((previous, created_at)), Some(current)) => {
                sqlx::query(
                    "
                        UPDATE votes
                        SET vote_type = $4
                        WHERE user_id = $1
                            AND review_id = $2
                            AND comment_id IS NOT DISTINCT FROM $3
                    ",
                )
                .bind(user.0)
                .bind(vote.review_id.0)
                .bind(comment_id)
                .bind(current.as_str())
                .execute(&mut *tx)
                .await
                .context("updating vote")
                .map_err(internal)?;
                events.push(ChangeEvent::update(
                    Table::Votes,
                    row(current, created_at),
                    row(previous, created_at),
                ));
            }
            (None, Some(current)) => {
                let created_at = sqlx::query_scalar::<_, Time>(
                    "
                        INSERT INTO votes (review_id, comment_id, user_id, vote_type)
                        VALUES ($1, $2, $3, $4)
                        RETURNING created_at
                    ",
                )
                .bind(vote.review_id.0)
                .bind(comment_id)
                .bind(user.0)
                .bind(current.as_str())
                .fetch_one(&mut *tx)
                .await
                .context("inserting vote")
                .map_err(internal)?;
                events.push(ChangeEvent::insert(Table::Votes, row(current, created_at)));
            }
            (None, None) => (),
        }

        let (likes, dislikes) = deltas(outcome.previous, outcome.current);
        match vote.comment_id {
            Some(id) => {
                let old = fetch_comment(&mut *tx, id).await?;
                sqlx::query(
                    "
                        UPDATE comments
                        SET likes = GREATEST(likes + $2, 0),
                            dislikes = GREATEST(dislikes + $3, 0)
                        WHERE id = $1
                    ",
                )
                .bind(id.0)
                .bind(likes)
                .bind(dislikes)
                .execute(&mut *tx)
                .await
                .context("updating comment counters")
                .map_err(internal)?;
                let new = fetch_comment(&mut *tx, id).await?;
                events.push(ChangeEvent::update(Table::Comments, to_row(&new), to_row(&old)));
            }
            None => {
                let old = fetch_review(&mut *tx, vote.review_id).await?;
                sqlx::query(
                    "
                        UPDATE reviews
                        SET likes = GREATEST(likes + $2, 0),
                            dislikes = GREATEST(dislikes + $3, 0)
                        WHERE id = $1
                    ",
                )
                .bind(vote.review_id.0)
                .bind(likes)
                .bind(dislikes)
                .execute(&mut *tx)
                .await
                .context("updating review counters")
                .map_err(internal)?;
                let new = fetch_review(&mut *tx, vote.review_id).await?;
                events.push(ChangeEvent::update(Table::Reviews, to_row(&new), to_row(&old)));
            }
        }
        commit(tx).await?;
        Ok((outcome, events))
    }
}
