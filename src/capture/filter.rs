use super::types::{Action, Event, RowsEvent};
use serde_json::Map;
use std::collections::{BTreeMap, HashSet};
use tracing::{trace, warn};

/// Allow-list of `database.table` pairs and the mapping from raw rows
/// events to canonical [`Event`]s.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    tables: HashSet<String>,
}

impl TableFilter {
    /// Flattens `database -> [table]` into the allow-list.
    pub fn new(tables: &BTreeMap<String, Vec<String>>) -> Self {
        Self::from_names(qualified_names(tables))
    }

    /// Builds the filter from already flattened `database.table` names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, schema: &str, table: &str) -> bool {
        self.tables.contains(&format!("{}.{}", schema, table))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Events for `rows`, stamped with the current time.
    pub fn events(&self, rows: &RowsEvent) -> Vec<Event> {
        self.events_at(rows, chrono::Utc::now().timestamp())
    }

    /// Events for `rows`: nothing for tables outside the allow-list or for
    /// unknown actions, otherwise one event per affected row. Updates only
    /// contribute their after-images.
    pub fn events_at(&self, rows: &RowsEvent, timestamp: i64) -> Vec<Event> {
        if !self.contains(&rows.schema, &rows.table) {
            return Vec::new();
        }

        let Some(action) = rows.action.action() else {
            trace!(
                "Skipping {:?} on {}.{}",
                rows.action,
                rows.schema,
                rows.table
            );
            return Vec::new();
        };

        let (from, step) = match action {
            Action::Update => (1, 2),
            Action::Insert | Action::Delete => (0, 1),
        };

        rows.rows
            .iter()
            .skip(from)
            .step_by(step)
            .map(|row| {
                if row.len() != rows.columns.len() {
                    warn!(
                        "Row of {}.{} has {} values for {} columns",
                        rows.schema,
                        rows.table,
                        row.len(),
                        rows.columns.len()
                    );
                }

                let payload: Map<_, _> = rows
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();

                Event {
                    database: rows.schema.clone(),
                    table: rows.table.clone(),
                    action,
                    payload,
                    timestamp,
                }
            })
            .collect()
    }
}

/// `database.table` for every configured table.
pub fn qualified_names(
    tables: &BTreeMap<String, Vec<String>>,
) -> impl Iterator<Item = String> + '_ {
    tables
        .iter()
        .flat_map(|(db, names)| names.iter().map(move |name| format!("{}.{}", db, name)))
}
