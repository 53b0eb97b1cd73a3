use std::{fmt, str::FromStr};

use anyhow::anyhow;

use crate::Time;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Reviews,
    Comments,
    Votes,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One committed row change, as pushed to realtime subscribers
///
/// Rows are kept as raw JSON: subscribers normalize them on their side.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub kind: ChangeKind,

    /// Row after the change, `null` for deletes
    #[serde(default)]
    pub new: serde_json::Value,

    /// Row before the change, `null` for inserts
    #[serde(default)]
    pub old: serde_json::Value,

    pub commit_timestamp: Time,
}

impl ChangeEvent {
    pub fn insert(table: Table, new: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            table,
            kind: ChangeKind::Insert,
            new,
            old: serde_json::Value::Null,
            commit_timestamp: chrono::Utc::now(),
        }
    }

    pub fn update(table: Table, new: serde_json::Value, old: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            table,
            kind: ChangeKind::Update,
            new,
            old,
            commit_timestamp: chrono::Utc::now(),
        }
    }

    pub fn delete(table: Table, old: serde_json::Value) -> ChangeEvent {
        ChangeEvent {
            table,
            kind: ChangeKind::Delete,
            new: serde_json::Value::Null,
            old,
            commit_timestamp: chrono::Utc::now(),
        }
    }

    /// The row this event is about: the new one, or the old one for deletes
    pub fn row(&self) -> &serde_json::Value {
        match self.kind {
            ChangeKind::Delete => &self.old,
            ChangeKind::Insert | ChangeKind::Update => &self.new,
        }
    }
}

/// Serializes a record the way it appears in change events
pub fn to_row<T: serde::Serialize>(record: &T) -> serde_json::Value {
    serde_json::to_value(record).expect("serializing row")
}

/// Row filter in the `column=eq.value` syntax
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: String,
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl fmt::Display) -> Filter {
        Filter {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn matches(&self, row: &serde_json::Value) -> bool {
        match row.get(&self.column) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(serde_json::Value::Null) | None => false,
            Some(v) => v.to_string() == self.value,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

impl FromStr for Filter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Filter> {
        let (column, value) = s
            .split_once("=eq.")
            .ok_or_else(|| anyhow!("filter {s:?} is not of the form column=eq.value"))?;
        if column.is_empty() {
            return Err(anyhow!("filter {s:?} has an empty column"));
        }
        Ok(Filter::eq(column, value))
    }
}

impl serde::Serialize for Filter {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Filter {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// What a realtime channel listens to
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ChannelSpec {
    pub table: Table,
    pub filter: Filter,
}

impl ChannelSpec {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.table == event.table && self.filter.matches(event.row())
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum SubscribeStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// Realtime websocket messages from the client
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ClientMessage {
    Subscribe { channel: String, spec: ChannelSpec },
    Unsubscribe { channel: String },
    Ping,
}

/// Realtime websocket messages from the server
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum FeedMessage {
    Pong,
    Status {
        channel: String,
        status: SubscribeStatus,
    },
    Change {
        channel: String,
        event: ChangeEvent,
    },
}
