use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    level TEXT NOT NULL,
    target TEXT NOT NULL,
    message TEXT NOT NULL,
    fields TEXT,
    participant_id TEXT,
    connection_id INTEGER,
    worker TEXT,
    tenant_id TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_logs_participant ON logs(participant_id);
CREATE INDEX IF NOT EXISTS idx_logs_worker ON logs(worker);
";

fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Ids that tie a log line to a connection, participant, worker or tenant.
///
/// Picked out of event fields by name, falling back to enclosing spans.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub participant_id: Option<String>,
    pub connection_id: Option<i64>,
    pub worker: Option<String>,
    pub tenant_id: Option<String>,
}

impl Correlation {
    /// Claim `value` if `name` is a correlation key.
    fn take(&mut self, name: &str, value: &Value) -> bool {
        let text = || match value {
            Value::String(s) => s.trim_matches('"').to_string(),
            other => other.to_string(),
        };
        match name {
            "participant_id" => self.participant_id = Some(text()),
            "worker" => self.worker = Some(text()),
            "tenant_id" => self.tenant_id = Some(text()),
            "connection_id" => {
                self.connection_id = match value {
                    Value::Number(n) => n.as_i64(),
                    _ => text().parse().ok(),
                }
            }
            _ => return false,
        }
        true
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fill the ids still missing here from `outer`.
    fn inherit(&mut self, outer: &Correlation) {
        if self.participant_id.is_none() {
            self.participant_id.clone_from(&outer.participant_id);
        }
        if self.connection_id.is_none() {
            self.connection_id = outer.connection_id;
        }
        if self.worker.is_none() {
            self.worker.clone_from(&outer.worker);
        }
        if self.tenant_id.is_none() {
            self.tenant_id.clone_from(&outer.tenant_id);
        }
    }
}

/// A persisted warn+ event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    #[serde(flatten)]
    pub correlation: Correlation,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring match on the event target.
    pub target: Option<String>,
    pub participant_id: Option<String>,
    pub connection_id: Option<i64>,
    pub worker: Option<String>,
    pub tenant_id: Option<String>,
    /// RFC 3339 lower bound.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// `WHERE` clause with positional parameters.
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl Filter {
    fn add(&mut self, column: &str, op: &str, value: Option<impl ToSql + 'static>) {
        if let Some(value) = value {
            self.params.push(Box::new(value));
            self.clauses.push(format!("{column} {op} ?{}", self.params.len()));
        }
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// SQLite store for warn+ events.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write(&self, level: Level, target: &str, event: EventFields) {
        let fields = (!event.extra.is_empty()).then(|| Value::Object(event.extra).to_string());
        let ids = event.correlation;
        let conn = self.conn.lock();
        // Logging must never fail the caller.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, participant_id, connection_id, worker, tenant_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                stamp(Utc::now()),
                level.as_str(),
                target,
                event.message.unwrap_or_default(),
                fields,
                ids.participant_id,
                ids.connection_id,
                ids.worker,
                ids.tenant_id,
            ],
        );
    }

    /// Newest first, at most `limit` (default 100) rows.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut filter = Filter::default();
        filter.add("level", "=", q.level.clone());
        filter.add("target", "LIKE", q.target.as_ref().map(|t| format!("%{t}%")));
        filter.add("participant_id", "=", q.participant_id.clone());
        filter.add("connection_id", "=", q.connection_id);
        filter.add("worker", "=", q.worker.clone());
        filter.add("tenant_id", "=", q.tenant_id.clone());
        filter.add("timestamp", ">=", q.since.clone());

        let sql = format!(
            "SELECT id, timestamp, level, target, message, fields, participant_id, connection_id, worker, tenant_id
             FROM logs{} ORDER BY id DESC LIMIT {}",
            filter.sql(),
            q.limit.unwrap_or(100)
        );
        let params: Vec<&dyn ToSql> = filter.params.iter().map(|p| p.as_ref()).collect();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                correlation: Correlation {
                    participant_id: row.get(6)?,
                    connection_id: row.get(7)?,
                    worker: row.get(8)?,
                    tenant_id: row.get(9)?,
                },
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }

    /// Delete records older than `cutoff`; returns how many were removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        self.conn
            .lock()
            .execute("DELETE FROM logs WHERE timestamp < ?1", [stamp(cutoff)])
    }
}

/// Message, correlation ids and everything else recorded on an event or span.
#[derive(Default)]
struct EventFields {
    message: Option<String>,
    correlation: Correlation,
    extra: Map<String, Value>,
}

impl EventFields {
    fn put(&mut self, field: &Field, value: Value) {
        let name = field.name();
        if name == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else if !self.correlation.take(name, &value) {
            self.extra.insert(name.to_string(), value);
        }
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

/// tracing layer persisting warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        attrs.record(&mut fields);
        if fields.correlation.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.correlation);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        values.record(&mut fields);
        if fields.correlation.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<Correlation>() {
            Some(existing) => {
                let mut updated = fields.correlation;
                updated.inherit(existing);
                *existing = updated;
            }
            None => {
                extensions.insert(fields.correlation);
            }
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    fields.correlation.inherit(outer);
                }
            }
        }

        self.sink.write(level, event.metadata().target(), fields);
    }
}
