use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking(NewBooking),
    Approve {
        id: BookingId,
        cancel_conflicts: bool,
    },
    Reject {
        id: BookingId,
        reason: Option<String>,
    },
    Cancel {
        id: BookingId,
        reason: Option<String>,
    },
    DeleteBooking {
        id: BookingId,
    },
    SelectBooking {
        id: BookingId,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectConflicts {
        id: BookingId,
    },
    SelectCleanupStatus,
    SetCleanupEnabled {
        enabled: bool,
    },
    RunCleanup {
        /// `None` uses the configured retention.
        retention_days: Option<u32>,
    },
}

/// Column order assumed when `INSERT INTO bookings VALUES (...)` omits the column list.
const BOOKING_COLUMNS: &[&str] = &[
    "user_id",
    "room_id",
    "date",
    "start_time",
    "end_time",
    "title",
    "attendees",
    "description",
    "priority",
    "equipment",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "bookings" => {
            let row = InsertRow::new(insert, BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking(NewBooking {
                user_id: parse_string(row.required("user_id")?)?,
                room_id: parse_string(row.required("room_id")?)?,
                date: parse_date(row.required("date")?)?,
                start_time: parse_time(row.required("start_time")?)?,
                end_time: parse_time(row.required("end_time")?)?,
                title: parse_string(row.required("title")?)?,
                attendees: parse_u32(row.required("attendees")?)?,
                description: row.optional("description", parse_string_or_null)?.flatten(),
                priority: row
                    .optional("priority", parse_priority)?
                    .unwrap_or_default(),
                equipment: row
                    .optional("equipment", parse_string_list)?
                    .unwrap_or_default(),
            }))
        }
        "approvals" => {
            let row = InsertRow::new(insert, &["booking_id", "cancel_conflicts"])?;
            Ok(Command::Approve {
                id: parse_booking_id(row.required("booking_id")?)?,
                cancel_conflicts: row.optional("cancel_conflicts", parse_bool)?.unwrap_or(false),
            })
        }
        "rejections" => {
            let row = InsertRow::new(insert, &["booking_id", "reason"])?;
            Ok(Command::Reject {
                id: parse_booking_id(row.required("booking_id")?)?,
                reason: row.optional("reason", parse_string_or_null)?.flatten(),
            })
        }
        "cancellations" => {
            let row = InsertRow::new(insert, &["booking_id", "reason"])?;
            Ok(Command::Cancel {
                id: parse_booking_id(row.required("booking_id")?)?,
                reason: row.optional("reason", parse_string_or_null)?.flatten(),
            })
        }
        "cleanup_settings" => {
            let row = InsertRow::new(insert, &["enabled"])?;
            Ok(Command::SetCleanupEnabled {
                enabled: parse_bool(row.required("enabled")?)?,
            })
        }
        "cleanup_runs" => {
            let row = InsertRow::new(insert, &["retention_days"])?;
            Ok(Command::RunCleanup {
                retention_days: row.optional("retention_days", parse_u32_or_null)?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking {
            id: extract_where_eq(&delete.selection, "id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut predicates)?;
    }

    match table.as_str() {
        "bookings" => parse_booking_filters(&predicates),
        "conflicts" => {
            let id = predicates
                .iter()
                .find(|(col, op, _)| col == "booking_id" && **op == BinaryOperator::Eq)
                .ok_or(SqlError::MissingFilter("booking_id"))?;
            Ok(Command::SelectConflicts {
                id: parse_booking_id(id.2)?,
            })
        }
        "cleanup_status" => Ok(Command::SelectCleanupStatus),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_booking_filters(predicates: &[(String, &BinaryOperator, &Expr)]) -> Result<Command, SqlError> {
    let mut filter = BookingFilter::default();
    for (col, op, value) in predicates {
        match (col.as_str(), op) {
            ("id", BinaryOperator::Eq) => {
                return Ok(Command::SelectBooking {
                    id: parse_booking_id(value)?,
                });
            }
            ("user_id", BinaryOperator::Eq) => filter.user_id = Some(parse_string(value)?),
            ("room_id", BinaryOperator::Eq) => filter.room_id = Some(parse_string(value)?),
            ("status", BinaryOperator::Eq) => {
                let s = parse_string(value)?;
                filter.status = Some(s.parse().map_err(SqlError::InvalidValue)?);
            }
            ("date", BinaryOperator::Eq) => {
                let d = parse_date(value)?;
                filter.date_from = Some(d);
                filter.date_to = Some(d);
            }
            ("date", BinaryOperator::GtEq) => filter.date_from = Some(parse_date(value)?),
            ("date", BinaryOperator::LtEq) => filter.date_to = Some(parse_date(value)?),
            _ => {
                return Err(SqlError::Unsupported(format!(
                    "filter on bookings: {col} {op}"
                )));
            }
        }
    }
    Ok(Command::SelectBookings { filter })
}

/// Flatten an AND-chain of `column <op> value` comparisons.
fn collect_predicates<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, &'a BinaryOperator, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((col, op, right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// The single VALUES row of an INSERT, keyed by column name.
struct InsertRow {
    values: Vec<(String, Expr)>,
}

impl InsertRow {
    fn new(insert: &ast::Insert, default_columns: &[&str]) -> Result<Self, SqlError> {
        let rows = extract_insert_rows(insert)?;
        let [row] = rows else {
            return Err(SqlError::Unsupported("multi-row INSERT".into()));
        };
        let columns: Vec<String> = if insert.columns.is_empty() {
            default_columns.iter().map(|c| c.to_string()).collect()
        } else {
            insert
                .columns
                .iter()
                .map(|c| c.to_string().trim_matches('"').to_lowercase())
                .collect()
        };
        if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
            return Err(SqlError::Parse(format!(
                "{} column(s) but {} value(s)",
                columns.len(),
                row.len()
            )));
        }
        for col in &columns {
            if !default_columns.contains(&col.as_str()) {
                return Err(SqlError::UnknownColumn(col.clone()));
            }
        }
        Ok(Self {
            values: columns.into_iter().zip(row.iter().cloned()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.values.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }

    fn optional<T>(
        &self,
        column: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        self.get(column).map(parse).transpose()
    }
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.as_slice())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_eq(selection: &Option<Expr>, column: &'static str) -> Result<BookingId, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some(column) => parse_booking_id(right),
        _ => Err(SqlError::MissingFilter(column)),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_booking_id(expr: &Expr) -> Result<BookingId, SqlError> {
    let s = parse_string(expr)?;
    BookingId::parse(&s).ok_or_else(|| SqlError::InvalidValue(format!("bad booking id: {s}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::InvalidValue(format!("bad date {s}: {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::InvalidValue(format!("bad time {s}: {e}")))
}

fn parse_priority(expr: &Expr) -> Result<Priority, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(Priority::default()),
        _ => parse_string(expr)?.parse().map_err(SqlError::InvalidValue),
    }
}

/// `ARRAY['a', 'b']`, a comma-separated string, or NULL.
fn parse_string_list(expr: &Expr) -> Result<Vec<String>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_string).collect();
    }
    match parse_string_or_null(expr)? {
        None => Ok(Vec::new()),
        Some(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(String::from)
            .collect()),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_u32(expr).map(Some),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the domain cannot accept.
    InvalidValue(String),
}

impl SqlError {
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::InvalidValue(_) => "22P02",
            SqlError::Unsupported(_) => "0A000",
            SqlError::Parse(_)
            | SqlError::Empty
            | SqlError::MissingColumn(_)
            | SqlError::MissingFilter(_) => "42601",
        }
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
