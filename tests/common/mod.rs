#![allow(dead_code)]

use binlog_hub::capture::{RowAction, RowsEvent};
use binlog_hub::hub::Message;
use binlog_hub::Config;
use serde_json::{json, Value};
use std::path::Path;

/// Pipeline configuration for tests: `shop.orders` and `shop.customers`
/// are captured, batches of `max_events`, 5s flush interval, 1s checkpoint tick.
pub fn test_config(position_dir: &Path, max_events: usize) -> Config {
    let yaml = format!(
        r#"
connection:
  mysql:
    address: 127.0.0.1:3306
    user: replicator
  eventhub:
    connectionUrl: Endpoint=sb://test.servicebus.windows.net/;SharedAccessKeyName=k;SharedAccessKey=s;EntityPath=changes
    publishing:
      maxEvents: {max_events}
      interval: 5s
binlogReader:
  tables:
    shop: [orders, customers]
  position:
    directory: {dir}
    name: test
    interval: 1s
"#,
        max_events = max_events,
        dir = position_dir.display(),
    );

    Config::from_yaml(&yaml).expect("test config is valid")
}

pub fn order_insert(ids: &[i64]) -> RowsEvent {
    ids.iter().fold(
        RowsEvent::new(
            "shop",
            "orders",
            RowAction::Insert,
            vec!["id".to_string(), "status".to_string()],
        ),
        |rows, id| rows.with_row(vec![json!(id), json!("new")]),
    )
}

/// `id` values of a published batch, in order.
pub fn ids(batch: &[Message]) -> Vec<i64> {
    batch
        .iter()
        .map(|message| {
            let value: Value = serde_json::from_slice(&message.payload).unwrap();
            value["payload"]["id"].as_i64().unwrap()
        })
        .collect()
}
