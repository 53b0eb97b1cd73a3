use chrono::Utc;

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

mod error;
pub use error::{ActionResult, Error};

mod comment;
pub use comment::{Comment, NewComment, Reaction, UserReactions, MAX_NESTING_LEVEL};

mod review;
pub use review::{NewReview, Ratings, Review, Service};

mod vote;
pub use vote::{NewVote, Vote, VoteOutcome};

mod realtime;
pub use realtime::{
    to_row, ChangeEvent, ChangeKind, ChannelSpec, ClientMessage, FeedMessage, Filter,
    SubscribeStatus, Table,
};

mod store;
pub use store::Store;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthToken(pub Uuid);

impl AuthToken {
    pub fn stub() -> AuthToken {
        AuthToken(STUB_UUID)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct ServiceId(pub Uuid);

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct ReviewId(pub Uuid);

impl ReviewId {
    pub fn stub() -> ReviewId {
        ReviewId(STUB_UUID)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

impl std::fmt::Display for CommentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(String::from(s)));
    }
    Ok(())
}

pub fn validate_content(s: &str) -> Result<(), Error> {
    validate_string(s)?;
    if s.trim().is_empty() {
        return Err(Error::EmptyContent);
    }
    Ok(())
}
