use serde_json::Value;

use crate::api::{Comment, CommentId, Reaction, ReviewId, UserId, Uuid};

const ANONYMOUS: &str = "Anonymous";

fn uuid_field(row: &Value, field: &str) -> Option<Uuid> {
    row.get(field)?.as_str()?.parse().ok()
}

fn string_field(row: &Value, field: &str) -> Option<String> {
    match row.get(field)? {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn counter_field(row: &Value, field: &str) -> u64 {
    match row.get(field) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Author fields come either flattened on the row or from a joined `profiles`
/// object
fn author_field(row: &Value, flat: &str, profile: &[&str]) -> Option<String> {
    string_field(row, flat)
        .or_else(|| {
            let p = row.get("profiles")?;
            profile.iter().find_map(|f| string_field(p, f))
        })
        .filter(|s| !s.is_empty())
}

/// Turns a raw backend row into a safe comment record
///
/// Missing or ill-typed fields get defaults. Returns None if the row has no
/// usable id or review id.
pub fn normalize_comment(row: &Value) -> Option<Comment> {
    let id = match uuid_field(row, "id") {
        Some(id) => CommentId(id),
        None => {
            tracing::warn!(?row, "dropping comment row without a usable id");
            return None;
        }
    };
    let review_id = match uuid_field(row, "review_id") {
        Some(r) => ReviewId(r),
        None => {
            tracing::warn!(?id, "dropping comment row without a usable review id");
            return None;
        }
    };
    Some(Comment {
        id,
        parent_comment_id: uuid_field(row, "parent_comment_id").map(CommentId),
        review_id,
        user_id: uuid_field(row, "user_id").map(UserId),
        author_name: author_field(row, "author_name", &["display_name", "username"])
            .unwrap_or_else(|| String::from(ANONYMOUS)),
        author_avatar: author_field(row, "author_avatar", &["avatar_url"]).unwrap_or_default(),
        content: string_field(row, "content").unwrap_or_default(),
        likes: counter_field(row, "likes"),
        dislikes: counter_field(row, "dislikes"),
        created_at: string_field(row, "created_at").unwrap_or_default(),
        nesting_level: 1,
        replies: Vec::new(),
        user_reaction: string_field(row, "user_reaction").and_then(|r| Reaction::parse(&r)),
    })
}

/// Normalizes an array of rows, reading anything else as an empty array
pub fn normalize_rows(rows: &Value) -> Vec<Comment> {
    match rows.as_array() {
        Some(rows) => rows.iter().filter_map(normalize_comment).collect(),
        None => {
            if !rows.is_null() {
                tracing::warn!("expected an array of comment rows, ignoring {rows:?}");
            }
            Vec::new()
        }
    }
}
