use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Canonical row change published to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub database: String,
    pub table: String,
    pub action: Action,
    /// Column name to captured value. For updates this is the post-image.
    pub payload: Map<String, Value>,
    /// Capture time, Unix seconds.
    pub timestamp: i64,
}

impl Event {
    /// Routing key shared by every event of a table, so a partitioned bus
    /// keeps per-table ordering.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.database, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Row operation as reported by the replication source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
    /// Anything else the source reports; never captured.
    Other(String),
}

impl RowAction {
    pub fn action(&self) -> Option<Action> {
        match self {
            RowAction::Insert => Some(Action::Insert),
            RowAction::Update => Some(Action::Update),
            RowAction::Delete => Some(Action::Delete),
            RowAction::Other(_) => None,
        }
    }
}

/// Raw rows event handed over by a replication source.
///
/// Inserts and deletes carry one image per affected row. Updates carry
/// images pairwise: `[before0, after0, before1, after1, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub schema: String,
    pub table: String,
    pub action: RowAction,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowsEvent {
    pub fn new(
        schema: impl Into<String>,
        table: impl Into<String>,
        action: RowAction,
        columns: Vec<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            action,
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_row(mut self, row: Vec<Value>) -> Self {
        self.rows.push(row);
        self
    }
}

/// JSON form of a raw column value: UTF-8 text stays a string, anything
/// else is base64 encoded.
pub fn bytes_value(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) => Value::String(text.to_string()),
        Err(_) => Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
    }
}
