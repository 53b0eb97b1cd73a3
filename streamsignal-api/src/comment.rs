use std::collections::HashMap;

use crate::{CommentId, ReviewId, Time, UserId};

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Reaction {
    Like,
    Dislike,
}

impl Reaction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reaction::Like => "like",
            Reaction::Dislike => "dislike",
        }
    }

    pub fn parse(s: &str) -> Option<Reaction> {
        match s {
            "like" => Some(Reaction::Like),
            "dislike" => Some(Reaction::Dislike),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,

    /// None for top-level comments
    pub parent_comment_id: Option<CommentId>,

    pub review_id: ReviewId,

    pub user_id: Option<UserId>,
    pub author_name: String,
    pub author_avatar: String,

    pub content: String,
    pub likes: u64,
    pub dislikes: u64,

    /// Creation timestamp as stored by the backend, see `created_time`
    pub created_at: String,

    /// 1 for top-level comments, parent's level + 1 for replies
    pub nesting_level: u32,

    /// Child comments, ordered by creation time
    pub replies: Vec<Comment>,

    /// Reaction of the current user, if any
    pub user_reaction: Option<Reaction>,
}

impl Comment {
    /// Parses `created_at`, returning None if the backend sent garbage
    pub fn created_time(&self) -> Option<Time> {
        chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|t| t.with_timezone(&chrono::Utc))
    }

    pub fn is_top_level(&self) -> bool {
        self.parent_comment_id.is_none()
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    pub id: CommentId,
    pub review_id: ReviewId,
    pub parent_comment_id: Option<CommentId>,
    pub content: String,
}

impl NewComment {
    pub fn validate(&self) -> Result<(), crate::Error> {
        crate::validate_content(&self.content)
    }
}

/// Deepest level a reply may be posted at
///
/// A serialized comment tree nests two JSON levels per comment level, and
/// must stay within the recursion limit of 128 that serde_json applies when
/// reading it back.
pub const MAX_NESTING_LEVEL: u32 = 32;

/// Reactions of one user to one review and its comments
///
/// On the wire this is a JSON object mapping `"comment_{id}"` to `"like"` or
/// `"dislike"`, plus a `"review"` entry for the review itself.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UserReactions {
    pub review: Option<Reaction>,
    pub comments: HashMap<CommentId, Reaction>,
}

impl UserReactions {
    pub fn key(id: &CommentId) -> String {
        format!("comment_{}", id.0)
    }

    pub fn get(&self, id: &CommentId) -> Option<Reaction> {
        self.comments.get(id).copied()
    }

    /// Anything that does not look like a reaction map is read as empty, and
    /// unparseable entries are skipped
    pub fn from_value(v: &serde_json::Value) -> UserReactions {
        let map = match v.as_object() {
            Some(map) => map,
            None => return UserReactions::default(),
        };
        UserReactions {
            review: map
                .get("review")
                .and_then(|r| r.as_str())
                .and_then(Reaction::parse),
            comments: map
                .iter()
                .filter_map(|(k, v)| {
                    let id = k.strip_prefix("comment_")?.parse().ok()?;
                    let reaction = Reaction::parse(v.as_str()?)?;
                    Some((CommentId(id), reaction))
                })
                .collect(),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        let mut map = self
            .comments
            .iter()
            .map(|(id, r)| (Self::key(id), serde_json::Value::from(r.as_str())))
            .collect::<serde_json::Map<_, _>>();
        if let Some(r) = self.review {
            map.insert(String::from("review"), serde_json::Value::from(r.as_str()));
        }
        serde_json::Value::Object(map)
    }
}

impl serde::Serialize for UserReactions {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(s)
    }
}

impl<'de> serde::Deserialize<'de> for UserReactions {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(d)?;
        Ok(UserReactions::from_value(&v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn user_reactions_from_wire() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let v = json!({
            format!("comment_{a}"): "like",
            format!("comment_{b}"): "dislike",
            "comment_not-a-uuid": "like",
            "review_1": "like",
            "review": "dislike",
            format!("comment_{}", Uuid::new_v4()): "meh",
        });
        let r = UserReactions::from_value(&v);
        assert_eq!(r.comments.len(), 2);
        assert_eq!(r.get(&CommentId(a)), Some(Reaction::Like));
        assert_eq!(r.get(&CommentId(b)), Some(Reaction::Dislike));
        assert_eq!(r.review, Some(Reaction::Dislike));
        assert_eq!(UserReactions::from_value(&r.to_value()), r);

        let r = UserReactions::from_value(&json!({ "review": "meh" }));
        assert_eq!(r, UserReactions::default());
        assert_eq!(r.to_value(), json!({}));
    }

    #[test]
    fn malformed_user_reactions_are_empty() {
        assert_eq!(UserReactions::from_value(&json!(null)), UserReactions::default());
        assert_eq!(UserReactions::from_value(&json!([1, 2])), UserReactions::default());
        assert_eq!(UserReactions::from_value(&json!("x")), UserReactions::default());
    }

    #[test]
    fn created_time_tolerates_garbage() {
        let mut c = Comment {
            id: CommentId(Uuid::new_v4()),
            parent_comment_id: None,
            review_id: ReviewId::stub(),
            user_id: None,
            author_name: String::from("Anonymous"),
            author_avatar: String::new(),
            content: String::new(),
            likes: 0,
            dislikes: 0,
            created_at: String::from("2024-03-01T10:00:00+02:00"),
            nesting_level: 1,
            replies: Vec::new(),
            user_reaction: None,
        };
        assert_eq!(
            c.created_time().map(|t| t.to_rfc3339()),
            Some(String::from("2024-03-01T08:00:00+00:00"))
        );
        c.created_at = String::from("yesterday");
        assert_eq!(c.created_time(), None);
    }
}
