use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Uuid already used {0}")]
    UuidAlreadyUsed(Uuid),

    #[error("Object not found {0}")]
    NotFound(Uuid),

    #[error("No service with slug {0:?}")]
    ServiceNotFound(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Content must not be empty")]
    EmptyContent,

    #[error("Rating out of range {0}")]
    InvalidRating(u8),

    #[error("Parent comment {0} belongs to another review")]
    ParentInOtherReview(Uuid),

    #[error("Replies to comment {0} would nest deeper than {} levels", crate::MAX_NESTING_LEVEL)]
    ReplyTooDeep(Uuid),
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::UuidAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::ServiceNotFound(_) => StatusCode::NOT_FOUND,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
            Error::EmptyContent => StatusCode::BAD_REQUEST,
            Error::InvalidRating(_) => StatusCode::BAD_REQUEST,
            Error::ParentInOtherReview(_) => StatusCode::BAD_REQUEST,
            Error::ReplyTooDeep(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Body of a failed action, in the `{ success: false, error }` shape
    /// that every action result uses
    pub fn contents(&self) -> Vec<u8> {
        let mut body = match self {
            Error::Unknown(msg) => json!({
                "type": "unknown",
                "message": msg,
            }),
            Error::PermissionDenied => json!({
                "type": "permission-denied",
            }),
            Error::UuidAlreadyUsed(u) => json!({
                "type": "conflict-uuid",
                "uuid": u,
            }),
            Error::NotFound(u) => json!({
                "type": "not-found",
                "uuid": u,
            }),
            Error::ServiceNotFound(slug) => json!({
                "type": "service-not-found",
                "slug": slug,
            }),
            Error::NullByteInString(s) => json!({
                "type": "null-byte",
                "string": s,
            }),
            Error::EmptyContent => json!({
                "type": "empty-content",
            }),
            Error::InvalidRating(r) => json!({
                "type": "invalid-rating",
                "rating": r,
            }),
            Error::ParentInOtherReview(u) => json!({
                "type": "parent-in-other-review",
                "uuid": u,
            }),
            Error::ReplyTooDeep(u) => json!({
                "type": "reply-too-deep",
                "uuid": u,
            }),
        };
        body["success"] = json!(false);
        body["error"] = json!(self.to_string());
        serde_json::to_vec(&body).expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let uuid = || {
            data.get("uuid")
                .and_then(|uuid| uuid.as_str())
                .and_then(|uuid| Uuid::from_str(uuid).ok())
                .ok_or_else(|| anyhow!("error is missing a proper uuid"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "permission-denied" => Error::PermissionDenied,
                "conflict-uuid" => Error::UuidAlreadyUsed(uuid()?),
                "not-found" => Error::NotFound(uuid()?),
                "service-not-found" => Error::ServiceNotFound(String::from(
                    data.get("slug").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is a service-not-found without a slug")
                    })?,
                )),
                "null-byte" => Error::NullByteInString(String::from(
                    data.get("string").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is a null-byte-in-string without a string")
                    })?,
                )),
                "empty-content" => Error::EmptyContent,
                "invalid-rating" => Error::InvalidRating(
                    data.get("rating")
                        .and_then(|r| r.as_u64())
                        .and_then(|r| u8::try_from(r).ok())
                        .ok_or_else(|| anyhow!("error is an invalid rating without a rating"))?,
                ),
                "parent-in-other-review" => Error::ParentInOtherReview(uuid()?),
                "reply-too-deep" => Error::ReplyTooDeep(uuid()?),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

/// Result shape returned by every mutating action
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(bound(
    serialize = "T: serde::Serialize",
    deserialize = "T: serde::Deserialize<'de>"
))]
pub struct ActionResult<T> {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ActionResult<T> {
    pub fn ok(data: T) -> ActionResult<T> {
        ActionResult {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn into_result(self) -> anyhow::Result<T> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (true, None) => Err(anyhow!("successful action result without data")),
            (false, _) => Err(anyhow!(
                "action failed: {}",
                self.error.as_deref().unwrap_or("no error message")
            )),
        }
    }
}
