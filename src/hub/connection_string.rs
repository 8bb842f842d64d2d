use crate::{Error, Result};
use std::fmt;

/// Kafka endpoint port exposed by every Event Hubs namespace.
const KAFKA_PORT: u16 = 9093;

/// Parsed Event Hubs connection string:
/// `Endpoint=sb://<namespace>.servicebus.windows.net/;SharedAccessKeyName=..;SharedAccessKey=..;EntityPath=<hub>`.
#[derive(Clone)]
pub struct EventHubConnection {
    host: String,
    entity_path: String,
    raw: String,
}

impl EventHubConnection {
    pub fn parse(connection_string: &str) -> Result<Self> {
        let mut endpoint = None;
        let mut entity_path = None;

        for (index, part) in connection_string.split(';').map(str::trim).enumerate() {
            if part.is_empty() {
                continue;
            }
            // Segments may hold the access key, so errors only name the index.
            let Some((key, value)) = part.split_once('=') else {
                return Err(Error::Config(format!(
                    "malformed connection string segment #{}",
                    index + 1
                )));
            };
            match key.trim() {
                "Endpoint" => endpoint = Some(value.trim().to_string()),
                "EntityPath" => entity_path = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let endpoint =
            endpoint.ok_or_else(|| Error::Config("connection string has no Endpoint".into()))?;
        let host = endpoint
            .strip_prefix("sb://")
            .ok_or_else(|| Error::Config(format!("unsupported endpoint '{}'", endpoint)))?
            .trim_end_matches('/')
            .to_string();
        if host.is_empty() {
            return Err(Error::Config("connection string has an empty Endpoint".into()));
        }

        let entity_path = entity_path
            .filter(|path| !path.is_empty())
            .ok_or_else(|| Error::Config("connection string has no EntityPath".into()))?;

        Ok(Self {
            host,
            entity_path,
            raw: connection_string.trim().to_string(),
        })
    }

    /// `<namespace host>:9093`.
    pub fn bootstrap_servers(&self) -> String {
        format!("{}:{}", self.host, KAFKA_PORT)
    }

    /// The event hub name, used as the Kafka topic.
    pub fn entity_path(&self) -> &str {
        &self.entity_path
    }

    /// Full connection string, the SASL password for the Kafka endpoint.
    pub fn connection_string(&self) -> &str {
        &self.raw
    }
}

impl fmt::Debug for EventHubConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHubConnection")
            .field("host", &self.host)
            .field("entity_path", &self.entity_path)
            .finish()
    }
}
