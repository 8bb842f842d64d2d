use super::publisher::Message;
use crate::{capture::Event, Result};
use bytes::Bytes;

pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize(event: &Event) -> Result<Bytes> {
        serde_json::to_vec(event).map(Bytes::from).map_err(Into::into)
    }

    /// Serialized event keyed by `database:table`.
    pub fn to_message(event: &Event) -> Result<Message> {
        Ok(Message::new(
            Some(event.partition_key()),
            Self::serialize(event)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Action;
    use serde_json::{json, Map, Value};

    #[test]
    fn test_message_is_keyed_by_table() {
        let mut payload = Map::new();
        payload.insert("id".to_string(), json!(1));
        let event = Event {
            database: "shop".to_string(),
            table: "orders".to_string(),
            action: Action::Insert,
            payload,
            timestamp: 10,
        };

        let message = JsonSerializer::to_message(&event).unwrap();

        assert_eq!(message.key.as_deref(), Some("shop:orders"));
        let decoded: Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(decoded["action"], "insert");
        assert_eq!(decoded["payload"]["id"], 1);
    }
}
