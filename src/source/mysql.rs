//! Binlog replication client on top of `mysql_async`.
//!
//! Requires row based logging on the primary (`binlog_format=ROW`) and, for
//! real column names in the payload, `binlog_row_metadata=FULL`.

use super::{retry, Handlers, ReplicationSource};
use crate::capture::{bytes_value, RowAction, RowsEvent};
use crate::config::{MySqlConfig, RetryConfig};
use crate::position::Position;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use mysql_async::binlog::events::{Event, EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, OptsBuilder, Row, SslOpts, Value};
use serde_json::{json, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Offset of the first event in every binlog file, right after the magic header.
const FIRST_EVENT_OFFSET: u32 = 4;
const DEFAULT_PORT: u16 = 3306;

/// Streams row changes from a MySQL primary, posing as a replica.
pub struct BinlogSource {
    config: MySqlConfig,
    retry: RetryConfig,
}

enum Step {
    Rows(RowsEvent),
    Synced(Position),
    Skip,
}

/// Where the stream currently is: the binlog file being read and the GTID
/// of the transaction in progress, if the primary uses GTIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Cursor {
    file: String,
    gtid: Option<String>,
}

impl Cursor {
    fn new(start: Position) -> Self {
        Self {
            file: start.name,
            gtid: start.gtid,
        }
    }

    fn at(&self, pos: u32) -> Position {
        Position {
            name: self.file.clone(),
            pos,
            gtid: self.gtid.clone(),
        }
    }
}

impl BinlogSource {
    pub fn new(config: &MySqlConfig, retry: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            retry: retry.clone(),
        }
    }

    fn opts(&self) -> Result<OptsBuilder> {
        let (host, port) = match self.config.address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::Config(format!("invalid MySQL port in '{}'", self.config.address))
                })?;
                (host.to_string(), port)
            }
            None => (self.config.address.clone(), DEFAULT_PORT),
        };

        let mut opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(self.config.user.clone()))
            .pass(Some(self.config.password.clone()));

        if self.config.enabled_ssl {
            opts = opts.ssl_opts(Some(
                SslOpts::default().with_danger_accept_invalid_certs(true),
            ));
        }

        Ok(opts)
    }

    async fn connect(&self) -> Result<Conn> {
        let opts = self.opts()?;
        Conn::new(opts).await.map_err(|e| {
            Error::Connection(format!("cannot connect to {}: {}", self.config.address, e))
        })
    }

    /// Current binlog file of the primary, from its first event.
    async fn head_of_current_file(conn: &mut Conn) -> Result<Position> {
        let row: Option<Row> = conn
            .query_first("SHOW MASTER STATUS")
            .await
            .map_err(|e| Error::Connection(format!("SHOW MASTER STATUS failed: {}", e)))?;

        let file = row
            .and_then(|row| row.get::<String, _>(0))
            .filter(|file| !file.is_empty())
            .ok_or_else(|| Error::Replication {
                message: "binary logging is disabled on the primary".into(),
            })?;

        Ok(Position::new(file, FIRST_EVENT_OFFSET))
    }

    async fn open(&self, start: Option<Position>) -> Result<(BinlogStream, Position)> {
        let mut conn = self.connect().await?;

        let start = match start {
            Some(position) if !self.config.from_begin => position,
            _ => Self::head_of_current_file(&mut conn).await?,
        };

        info!(
            address = %self.config.address,
            server_id = self.config.server_id,
            "Starting binlog stream at {}",
            start
        );

        let request = BinlogStreamRequest::new(self.config.server_id)
            .with_filename(start.name.as_bytes())
            .with_pos(start.pos as u64);

        let stream = conn
            .get_binlog_stream(request)
            .await
            .map_err(|e| Error::Connection(format!("cannot start binlog stream: {}", e)))?;

        Ok((stream, start))
    }

    fn decode(stream: &BinlogStream, event: &Event, cursor: &mut Cursor) -> Result<Step> {
        let data = event.read_data().map_err(|e| Error::Replication {
            message: format!("undecodable binlog event: {}", e),
        })?;

        let step = match data {
            Some(EventData::RowsEvent(rows)) => {
                let tme = stream.get_tme(rows.table_id()).ok_or_else(|| Error::Replication {
                    message: format!("rows event for unknown table id {}", rows.table_id()),
                })?;

                let mut raw = RowsEvent::new(
                    tme.database_name(),
                    tme.table_name(),
                    row_action(&rows),
                    Vec::new(),
                );

                for row in rows.rows(tme) {
                    let (before, after) = row.map_err(|e| Error::Replication {
                        message: format!("undecodable row of {}.{}: {}", raw.schema, raw.table, e),
                    })?;

                    for image in [before, after].into_iter().flatten() {
                        if raw.columns.is_empty() {
                            raw.columns = image
                                .columns_ref()
                                .iter()
                                .map(|column| column.name_str().into_owned())
                                .collect();
                        }
                        raw.rows.push(row_values(&image));
                    }
                }

                Step::Rows(raw)
            }
            Some(EventData::RotateEvent(rotate)) => {
                cursor.file = rotate.name().into_owned();
                Step::Synced(cursor.at(rotate.position() as u32))
            }
            Some(EventData::GtidEvent(gtid)) => {
                cursor.gtid = Some(format_gtid(&gtid.sid(), gtid.gno()));
                Step::Skip
            }
            Some(EventData::XidEvent(_)) => Step::Synced(cursor.at(event.header().log_pos())),
            // DDL and statements on non-transactional tables commit without an XID.
            Some(EventData::QueryEvent(query)) if is_sync_query(&query.query()) => {
                Step::Synced(cursor.at(event.header().log_pos()))
            }
            _ => Step::Skip,
        };

        Ok(step)
    }
}

#[async_trait]
impl ReplicationSource for BinlogSource {
    async fn run(
        &self,
        start: Option<Position>,
        handlers: Handlers,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let (mut stream, start) = retry(&self.retry, &shutdown, || self.open(start.clone())).await?;
        let mut cursor = Cursor::new(start);

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("Binlog stream stopping");
                    return Err(Error::Shutdown);
                }
                next = stream.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    return Err(Error::Replication {
                        message: format!("binlog stream failed: {}", e),
                    })
                }
                None => return Err(Error::Connection("binlog stream closed by the primary".into())),
            };

            match Self::decode(&stream, &event, &mut cursor)? {
                Step::Rows(rows) => {
                    trace!(
                        "{} row images for {}.{}",
                        rows.rows.len(),
                        rows.schema,
                        rows.table
                    );
                    handlers.row(rows).await?;
                }
                Step::Synced(position) => handlers.position_synced(position).await?,
                Step::Skip => {}
            }
        }
    }
}

/// `server_uuid:transaction_id`, the textual form of a single GTID.
fn format_gtid(sid: &[u8; 16], gno: u64) -> String {
    let hex: String = sid.iter().map(|byte| format!("{:02x}", byte)).collect();
    format!(
        "{}-{}-{}-{}-{}:{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32],
        gno
    )
}

/// Whether a query event ends a unit of work. `BEGIN` only opens one.
fn is_sync_query(query: &str) -> bool {
    !query.trim().eq_ignore_ascii_case("BEGIN")
}

fn row_action(rows: &RowsEventData<'_>) -> RowAction {
    match rows {
        RowsEventData::WriteRowsEventV1(_) | RowsEventData::WriteRowsEvent(_) => RowAction::Insert,
        RowsEventData::UpdateRowsEventV1(_)
        | RowsEventData::UpdateRowsEvent(_)
        | RowsEventData::PartialUpdateRowsEvent(_) => RowAction::Update,
        RowsEventData::DeleteRowsEventV1(_) | RowsEventData::DeleteRowsEvent(_) => {
            RowAction::Delete
        }
    }
}

fn row_values(row: &BinlogRow) -> Vec<JsonValue> {
    (0..row.len())
        .map(|index| match row.as_ref(index) {
            Some(BinlogValue::Value(value)) => json_value(value),
            // JSON columns arrive as binary documents or partial diffs.
            Some(other) => JsonValue::String(format!("{:?}", other)),
            None => JsonValue::Null,
        })
        .collect()
}

fn json_value(value: &Value) -> JsonValue {
    match value {
        Value::NULL => JsonValue::Null,
        Value::Bytes(bytes) => bytes_value(bytes),
        Value::Int(v) => json!(v),
        Value::UInt(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let mut text = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            );
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            JsonValue::String(text)
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let hours = *days * 24 + u32::from(*hours);
            let mut text = format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds);
            if *micros > 0 {
                text.push_str(&format!(".{:06}", micros));
            }
            JsonValue::String(text)
        }
    }
}
