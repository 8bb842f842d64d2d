use crate::capture::filter::qualified_names;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Immutable runtime configuration, loaded once at startup and passed by
/// reference into every component constructor.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub connection: ConnectionConfig,
    pub binlog_reader: BinlogReaderConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub mysql: MySqlConfig,
    pub eventhub: EventHubConfig,
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MySqlConfig {
    /// `host:port` of the MySQL primary.
    pub address: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "enabledSSL", default)]
    pub enabled_ssl: bool,
    /// Replica server id announced to the primary; must be unique among replicas.
    #[serde(default = "default_server_id")]
    pub server_id: u32,
    /// Ignore any persisted position and start from the head of the current binlog file.
    #[serde(default)]
    pub from_begin: bool,
}

impl fmt::Debug for MySqlConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlConfig")
            .field("address", &self.address)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("enabled_ssl", &self.enabled_ssl)
            .field("server_id", &self.server_id)
            .field("from_begin", &self.from_begin)
            .finish()
    }
}

#[derive(Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHubConfig {
    pub connection_url: String,
    #[serde(default)]
    pub publishing: PublishingConfig,
}

impl fmt::Debug for EventHubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The connection string embeds the shared access key.
        f.debug_struct("EventHubConfig")
            .field("connection_url", &"[REDACTED]")
            .field("publishing", &self.publishing)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishingConfig {
    /// Buffer length at which a flush is triggered.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Maximum time the first buffered event waits before a flush.
    #[serde(default = "default_publish_interval", with = "duration")]
    pub interval: Duration,
}

impl Default for PublishingConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            interval: default_publish_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinlogReaderConfig {
    /// Database name to the list of its captured tables.
    pub tables: BTreeMap<String, Vec<String>>,
    pub position: PositionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionConfig {
    pub directory: PathBuf,
    pub name: String,
    /// Checkpoint persistence tick.
    #[serde(default = "default_position_interval", with = "duration")]
    pub interval: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_backoff", with = "duration")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "duration")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl Config {
    /// Reads a YAML file, expands `$VAR` / `${VAR}` references from the
    /// environment, and validates the result.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;

        Self::from_yaml(&raw)
    }

    /// Parses configuration from YAML text. Environment references are
    /// expanded before parsing.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env(raw);
        let config: Config =
            serde_yaml::from_str(&expanded).map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mysql = &self.connection.mysql;
        if mysql.address.trim().is_empty() {
            return Err(Error::Config("connection.mysql.address is required".into()));
        }
        if mysql.user.trim().is_empty() {
            return Err(Error::Config("connection.mysql.user is required".into()));
        }

        let eventhub = &self.connection.eventhub;
        if eventhub.connection_url.trim().is_empty() {
            return Err(Error::Config(
                "connection.eventhub.connectionUrl is required".into(),
            ));
        }
        if eventhub.publishing.max_events == 0 {
            return Err(Error::Config(
                "connection.eventhub.publishing.maxEvents must be at least 1".into(),
            ));
        }
        if eventhub.publishing.interval.is_zero() {
            return Err(Error::Config(
                "connection.eventhub.publishing.interval must be positive".into(),
            ));
        }

        let reader = &self.binlog_reader;
        if self.allowed_tables().is_empty() {
            return Err(Error::Config(
                "binlogReader.tables must list at least one table".into(),
            ));
        }
        if reader.position.directory.as_os_str().is_empty() || reader.position.name.is_empty() {
            return Err(Error::Config(
                "binlogReader.position.directory and name are required".into(),
            ));
        }
        if reader.position.interval.is_zero() {
            return Err(Error::Config(
                "binlogReader.position.interval must be positive".into(),
            ));
        }
        if reader.retry.initial_backoff > reader.retry.max_backoff {
            return Err(Error::Config(
                "binlogReader.retry.initialBackoff exceeds maxBackoff".into(),
            ));
        }

        Ok(())
    }

    /// The flattened `database.table` allow-list.
    pub fn allowed_tables(&self) -> BTreeSet<String> {
        qualified_names(&self.binlog_reader.tables).collect()
    }

    /// Location of the checkpoint file.
    pub fn position_path(&self) -> PathBuf {
        let position = &self.binlog_reader.position;
        position.directory.join(format!("{}.json", position.name))
    }
}

/// Replaces `$NAME` and `${NAME}` with the value of the environment
/// variable, or the empty string when unset. A `$` that does not start a
/// reference is kept as is.
pub fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        if chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            let mut closed = false;
            for next in chars.by_ref() {
                if next == '}' {
                    closed = true;
                    break;
                }
                name.push(next);
            }
            if closed {
                out.push_str(&std::env::var(&name).unwrap_or_default());
            } else {
                out.push_str("${");
                out.push_str(&name);
            }
            continue;
        }

        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }

    out
}

/// Durations are written the humantime way (`"250ms"`, `"5s"`, `"1m 30s"`).
/// A bare integer is read as seconds.
mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        humantime_serde::serialize(value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(|e| {
                serde::de::Error::custom(format!("invalid duration '{}': {}", text, e))
            }),
        }
    }
}

fn default_server_id() -> u32 {
    1001
}

fn default_max_events() -> usize {
    100
}

fn default_publish_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_position_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
connection:
  mysql:
    address: 127.0.0.1:3306
    user: replicator
    password: secret
    enabledSSL: true
  eventhub:
    connectionUrl: Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=abc;EntityPath=changes
    publishing:
      maxEvents: 50
      interval: 250ms
binlogReader:
  tables:
    shop:
      - orders
      - customers
    billing:
      - invoices
  position:
    directory: /var/lib/binlog-hub
    name: primary
"#;

    #[test]
    fn test_parse_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.connection.mysql.address, "127.0.0.1:3306");
        assert!(config.connection.mysql.enabled_ssl);
        assert_eq!(config.connection.mysql.server_id, 1001);
        assert_eq!(config.connection.eventhub.publishing.max_events, 50);
        assert_eq!(
            config.connection.eventhub.publishing.interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.binlog_reader.position.interval, Duration::from_secs(1));
        assert_eq!(config.binlog_reader.retry.attempts, 5);
        assert_eq!(
            config.position_path(),
            PathBuf::from("/var/lib/binlog-hub/primary.json")
        );
    }

    #[test]
    fn test_allowed_tables_are_flattened() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let tables: Vec<String> = config.allowed_tables().into_iter().collect();

        assert_eq!(
            tables,
            vec!["billing.invoices", "shop.customers", "shop.orders"]
        );
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("BINLOG_HUB_TEST_PASSWORD", "from-env");
        std::env::set_var("BINLOG_HUB_TEST_USER", "envuser");

        let expanded = expand_env("p: ${BINLOG_HUB_TEST_PASSWORD} u: $BINLOG_HUB_TEST_USER!");
        assert_eq!(expanded, "p: from-env u: envuser!");

        assert_eq!(expand_env("a $ b $"), "a $ b $");
        assert_eq!(expand_env("x ${BINLOG_HUB_TEST_UNSET_VAR} y"), "x  y");
        assert_eq!(expand_env("broken ${OPEN"), "broken ${OPEN");
    }

    #[test]
    fn test_duration_formats() {
        for (raw, expected) in [
            ("5s", Duration::from_secs(5)),
            ("750ms", Duration::from_millis(750)),
            ("2m", Duration::from_secs(120)),
            ("1h", Duration::from_secs(3600)),
            ("1m 30s", Duration::from_secs(90)),
        ] {
            let yaml = SAMPLE.replace("interval: 250ms", &format!("interval: {}", raw));
            let config = Config::from_yaml(&yaml).unwrap();
            assert_eq!(config.connection.eventhub.publishing.interval, expected, "{}", raw);
        }
    }

    #[test]
    fn test_invalid_duration_is_config_error() {
        for raw in ["fast", "5 parsecs", "999999999999999999h"] {
            let yaml = SAMPLE.replace("interval: 250ms", &format!("interval: {}", raw));
            let err = Config::from_yaml(&yaml).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{}", raw);
        }
    }

    #[test]
    fn test_integer_interval_is_seconds() {
        let yaml = SAMPLE.replace("interval: 250ms", "interval: 3");
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(
            config.connection.eventhub.publishing.interval,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_zero_max_events_rejected() {
        let yaml = SAMPLE.replace("maxEvents: 50", "maxEvents: 0");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("maxEvents")));
    }

    #[test]
    fn test_missing_tables_rejected() {
        let yaml = SAMPLE
            .replace("    shop:\n      - orders\n      - customers\n", "")
            .replace("    billing:\n      - invoices\n", "    billing: []\n");
        assert!(matches!(Config::from_yaml(&yaml), Err(Error::Config(_))));
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        assert!(matches!(
            Config::from_yaml("connection: ["),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let debug = format!("{:?}", config);

        assert!(!debug.contains("secret"));
        assert!(!debug.contains("SharedAccessKey=abc"));
        assert!(debug.contains("[REDACTED]"));
    }
}
