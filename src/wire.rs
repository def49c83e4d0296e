use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::cleanup::{Cleanup, CleanupReport, CleanupStatus};
use crate::directory::{Directory, validate_room};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct RoomBookHandler {
    engine: Arc<Engine>,
    cleanup: Arc<Cleanup>,
    directory: Arc<dyn Directory>,
    query_parser: Arc<RoomBookQueryParser>,
}

impl RoomBookHandler {
    pub fn new(engine: Arc<Engine>, cleanup: Arc<Cleanup>, directory: Arc<dyn Directory>) -> Self {
        Self {
            engine,
            cleanup,
            directory,
            query_parser: Arc::new(RoomBookQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run_query(&self, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "invalid", "status" => "error")
                    .increment(1);
                tracing::debug!("rejected query {query:?}: {e}");
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertBooking(req) => {
                validate_room(self.directory.as_ref(), &req.room_id, req.attendees)
                    .await
                    .map_err(engine_err)?;
                let booking = engine.create_booking(req).await.map_err(engine_err)?;
                Ok(booking_response(&[booking]))
            }
            Command::Approve {
                id,
                cancel_conflicts,
            } => {
                let approval = engine
                    .approve_booking(&id, cancel_conflicts)
                    .await
                    .map_err(engine_err)?;
                let mut rows = Vec::with_capacity(approval.cancelled.len() + 1);
                rows.push(approval.approved);
                rows.extend(approval.cancelled);
                Ok(booking_response(&rows))
            }
            Command::Reject { id, reason } => {
                let booking = engine.reject_booking(&id, reason).await.map_err(engine_err)?;
                Ok(booking_response(&[booking]))
            }
            Command::Cancel { id, reason } => {
                let booking = engine.cancel_booking(&id, reason).await.map_err(engine_err)?;
                Ok(booking_response(&[booking]))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(&id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(&id).await.map_err(engine_err)?;
                Ok(booking_response(&[booking]))
            }
            Command::SelectBookings { filter } => {
                let bookings = engine.list_bookings(&filter).await;
                Ok(booking_response(&bookings))
            }
            Command::SelectConflicts { id } => {
                let conflicts = engine.list_conflicts(&id).await.map_err(engine_err)?;
                Ok(conflict_response(&conflicts))
            }
            Command::SelectCleanupStatus => Ok(cleanup_status_response(self.cleanup.status())),
            Command::SetCleanupEnabled { enabled } => {
                self.cleanup.set_enabled(enabled);
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::RunCleanup { retention_days } => {
                let report = match retention_days {
                    Some(days) => self.cleanup.run(days).await,
                    None => self.cleanup.run_now().await,
                }
                .map_err(engine_err)?;
                Ok(cleanup_run_response(&report))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn typed_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("room_id"),
        text_field("user_id"),
        text_field("date"),
        text_field("start_time"),
        text_field("end_time"),
        text_field("title"),
        typed_field("attendees", Type::INT4),
        text_field("description"),
        text_field("priority"),
        text_field("equipment"),
        text_field("status"),
        text_field("notes"),
        text_field("created_at"),
        text_field("updated_at"),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        text_field("booking_id"),
        text_field("user_id"),
        text_field("user_name"),
        text_field("start_time"),
        text_field("end_time"),
    ]
}

fn cleanup_status_schema() -> Vec<FieldInfo> {
    vec![
        typed_field("enabled", Type::BOOL),
        typed_field("retention_days", Type::INT4),
        typed_field("cleanup_hour", Type::INT4),
        typed_field("auto_enabled", Type::BOOL),
    ]
}

fn cleanup_run_schema() -> Vec<FieldInfo> {
    vec![
        typed_field("skipped", Type::BOOL),
        typed_field("approved_deleted", Type::INT8),
        typed_field("rejected_deleted", Type::INT8),
        typed_field("cancelled_deleted", Type::INT8),
        typed_field("total", Type::INT8),
        text_field("cutoff"),
    ]
}

/// Schema a statement will produce, judged from the table it targets.
/// Writes to bookings and its status tables return the affected rows.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let is_delete = sql.trim_start().to_lowercase().starts_with("delete");
    match target_table(sql).as_deref() {
        Some("bookings") if !is_delete => booking_schema(),
        Some("approvals" | "rejections" | "cancellations") => booking_schema(),
        Some("conflicts") => conflict_schema(),
        Some("cleanup_status") => cleanup_status_schema(),
        Some("cleanup_runs") => cleanup_run_schema(),
        _ => vec![],
    }
}

/// Table named after the first INTO or FROM keyword.
fn target_table(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty());
    while let Some(word) = words.next() {
        if word == "into" || word == "from" {
            return words.next().map(|w| w.trim_matches('"').to_string());
        }
    }
    None
}

fn hhmm(t: &chrono::NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn booking_response(bookings: &[Booking]) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.room_id)?;
            encoder.encode_field(&b.user_id)?;
            encoder.encode_field(&b.date.format("%Y-%m-%d").to_string())?;
            encoder.encode_field(&hhmm(&b.start_time))?;
            encoder.encode_field(&hhmm(&b.end_time))?;
            encoder.encode_field(&b.title)?;
            encoder.encode_field(&i32::try_from(b.attendees).unwrap_or(i32::MAX))?;
            encoder.encode_field(&b.description)?;
            encoder.encode_field(&b.priority.as_str().to_string())?;
            encoder.encode_field(&b.equipment.join(","))?;
            encoder.encode_field(&b.status.as_str().to_string())?;
            encoder.encode_field(&b.notes)?;
            encoder.encode_field(&b.created_at.to_rfc3339())?;
            encoder.encode_field(&b.updated_at.to_rfc3339())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn conflict_response(conflicts: &[ConflictInfo]) -> Response {
    let schema = Arc::new(conflict_schema());
    let rows: Vec<PgWireResult<_>> = conflicts
        .iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.user_id)?;
            encoder.encode_field(&c.user_name)?;
            encoder.encode_field(&hhmm(&c.slot.start))?;
            encoder.encode_field(&hhmm(&c.slot.end))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn cleanup_status_response(status: CleanupStatus) -> Response {
    let schema = Arc::new(cleanup_status_schema());
    let rows: Vec<PgWireResult<_>> = std::iter::once(status)
        .map(|status| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&status.enabled)?;
            encoder.encode_field(&(status.retention_days as i32))?;
            encoder.encode_field(&(status.cleanup_hour as i32))?;
            encoder.encode_field(&status.auto_enabled)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn cleanup_run_response(report: &CleanupReport) -> Response {
    let schema = Arc::new(cleanup_run_schema());
    let rows: Vec<PgWireResult<_>> = std::iter::once(report)
        .map(|report| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&report.skipped)?;
            encoder.encode_field(&(report.approved_deleted as i64))?;
            encoder.encode_field(&(report.rejected_deleted as i64))?;
            encoder.encode_field(&(report.cancelled_deleted as i64))?;
            encoder.encode_field(&(report.total as i64))?;
            encoder.encode_field(&report.cutoff.to_rfc3339())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for RoomBookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run_query(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomBookQueryParser;

#[async_trait]
impl QueryParser for RoomBookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomBookHandler {
    type Statement = String;
    type QueryParser = RoomBookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run_query(&sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password for every user name.
#[derive(Debug)]
pub struct PasswordSource {
    password: String,
}

#[async_trait]
impl AuthSource for PasswordSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomBookFactory {
    handler: Arc<RoomBookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<PasswordSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RoomBookFactory {
    pub fn new(
        engine: Arc<Engine>,
        cleanup: Arc<Cleanup>,
        directory: Arc<dyn Directory>,
        password: String,
    ) -> Self {
        Self {
            handler: Arc::new(RoomBookHandler::new(engine, cleanup, directory)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                PasswordSource { password },
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomBookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<RoomBookFactory>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

pub fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::BadRequest(_) => "22023",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Conflict(_) => "23P01",
        EngineError::StoreUnavailable(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::StoreUnavailable(_) = &e {
        tracing::error!("{e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}
