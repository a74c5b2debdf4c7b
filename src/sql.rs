use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{BookingRequest, GuestDetails};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterResource {
        id: String,
        name: Option<String>,
        hourly_price: Price,
        slot_minutes: Option<u32>,
    },
    SetSchedule {
        resource_id: String,
        weekday: u8,
        opening: TimeOfDay,
        closing: TimeOfDay,
    },
    /// Rows are applied in statement order, which is also their precedence.
    AddPriceRanges {
        rows: Vec<PriceRangeRow>,
    },
    ClearSchedule {
        resource_id: String,
        weekday: u8,
    },
    SelectAvailability {
        resource_id: String,
        date: String,
    },
    CreateReservation(BookingRequest),
    TransitionStatus {
        id: Ulid,
        status: ReservationStatus,
        actor: Actor,
        payment_ref: Option<String>,
    },
    FindReservation {
        code: String,
        contact: Option<String>,
    },
    GetReservation {
        id: Ulid,
    },
    ListReservations(ReservationQuery),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceRangeRow {
    pub resource_id: String,
    pub weekday: u8,
    pub range: PriceRange,
}

// ── Display labels ───────────────────────────────────────────────

const STATUS_LABELS: [(ReservationStatus, &str); 5] = [
    (ReservationStatus::Pending, "En attente"),
    (ReservationStatus::Confirmed, "Confirmé"),
    (ReservationStatus::Paid, "Payé"),
    (ReservationStatus::Completed, "Utilisé"),
    (ReservationStatus::Cancelled, "Annulé"),
];

const ROLE_ALIASES: [(&str, Role); 3] = [
    ("gerant", Role::Manager),
    ("gérant", Role::Manager),
    ("proprio", Role::Owner),
];

/// Marketplace label for a status, as shown to staff.
pub fn status_label(status: ReservationStatus) -> &'static str {
    STATUS_LABELS
        .iter()
        .find(|(s, _)| *s == status)
        .map_or(status.as_str(), |(_, label)| *label)
}

/// Canonical name or display label, case-insensitive.
pub fn parse_status(raw: &str) -> Result<ReservationStatus, SqlError> {
    let raw = raw.trim();
    if let Ok(status) = raw.parse() {
        return Ok(status);
    }
    let lowered = raw.to_lowercase();
    STATUS_LABELS
        .iter()
        .find(|(_, label)| label.to_lowercase() == lowered)
        .map(|(s, _)| *s)
        .ok_or_else(|| SqlError::invalid("status", format!("unknown status {raw:?}")))
}

pub fn parse_role(raw: &str) -> Result<Role, SqlError> {
    let lowered = raw.trim().to_lowercase();
    [Role::Guest, Role::Manager, Role::Owner, Role::Admin]
        .into_iter()
        .map(|r| (r.as_str(), r))
        .chain(ROLE_ALIASES)
        .find(|(name, _)| *name == lowered)
        .map(|(_, r)| r)
        .ok_or_else(|| SqlError::invalid("role", format!("unknown role {raw:?}")))
}

// ── Entry point ──────────────────────────────────────────────────

/// Parse exactly one statement.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut commands = parse_batch(sql)?;
    match commands.len() {
        1 => Ok(commands.remove(0)),
        _ => Err(SqlError::Unsupported("one statement per query".into())),
    }
}

/// Parse a `;`-separated script, as sent over the simple query protocol.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, columns): (&'static str, &[&'static str]) = match table.as_str() {
        "resources" => ("resources", &["id", "name", "hourly_price", "slot_minutes"]),
        "schedules" => ("schedules", &["resource_id", "weekday", "opening", "closing"]),
        "price_ranges" => (
            "price_ranges",
            &["resource_id", "weekday", "start_time", "end_time", "multiplier"],
        ),
        "reservations" => (
            "reservations",
            &[
                "resource_id",
                "date",
                "start_time",
                "first_name",
                "last_name",
                "phone",
                "email",
                "total_price",
            ],
        ),
        "status_changes" => (
            "status_changes",
            &["reservation_id", "status", "actor", "role", "payment_ref"],
        ),
        _ => return Err(SqlError::UnknownTable(table)),
    };

    let rows = insert_rows(insert, table, columns)?;
    if table == "price_ranges" {
        let rows: Vec<PriceRangeRow> = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                price_range_row(row).map_err(|e| SqlError::Parse(format!("row {}: {e}", i + 1)))
            })
            .collect::<Result<_, SqlError>>()?;
        return Ok(Command::AddPriceRanges { rows });
    }
    let [row] = rows.as_slice() else {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    };

    match table {
        "resources" => Ok(Command::RegisterResource {
            id: row.required::<String>("id")?,
            name: row.optional("name")?,
            hourly_price: row.required("hourly_price")?,
            slot_minutes: row.optional("slot_minutes")?,
        }),
        "schedules" => Ok(Command::SetSchedule {
            resource_id: row.required("resource_id")?,
            weekday: row.weekday()?,
            opening: row.required("opening")?,
            closing: row.required("closing")?,
        }),
        "reservations" => Ok(Command::CreateReservation(BookingRequest {
            resource_id: row.required("resource_id")?,
            date: row.required("date")?,
            start: row.required("start_time")?,
            guest: GuestDetails {
                first_name: row.required("first_name")?,
                last_name: row.required("last_name")?,
                phone: row.optional("phone")?,
                email: row.optional("email")?,
            },
            expected_price: row.optional("total_price")?,
        })),
        _ => Ok(Command::TransitionStatus {
            id: row.required("reservation_id")?,
            status: parse_status(&row.required::<String>("status")?)?,
            actor: Actor::new(
                row.required::<String>("actor")?,
                parse_role(&row.required::<String>("role")?)?,
            ),
            payment_ref: row.optional("payment_ref")?,
        }),
    }
}

fn price_range_row(row: &Fields<'_>) -> Result<PriceRangeRow, SqlError> {
    Ok(PriceRangeRow {
        resource_id: row.required("resource_id")?,
        weekday: row.weekday()?,
        range: PriceRange {
            start: row.required("start_time")?,
            end: row.required("end_time")?,
            multiplier: row.required("multiplier")?,
        },
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "schedules" => {
            let filters = where_filters(delete.selection.as_ref(), &["resource_id", "weekday"])?;
            Ok(Command::ClearSchedule {
                resource_id: filters.required("resource_id")?,
                weekday: filters.weekday()?,
            })
        }
        "reservations" => Err(SqlError::Unsupported(
            "reservations cannot be deleted, cancel them through status_changes".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

const RESERVATION_FILTERS: &[&str] = &[
    "id",
    "booking_code",
    "contact",
    "resource_id",
    "date",
    "status",
    "search",
    "page",
    "page_size",
];

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    match table.as_str() {
        "availability" => {
            let filters = where_filters(select.selection.as_ref(), &["resource_id", "date"])?;
            Ok(Command::SelectAvailability {
                resource_id: filters.required("resource_id")?,
                date: filters.required("date")?,
            })
        }
        "reservations" => {
            let filters = where_filters(select.selection.as_ref(), RESERVATION_FILTERS)?;
            reservation_select(&filters)
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Row shape a statement answers with, decided from its tables and filter
/// columns alone so unbound `$n` parameters are fine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Empty,
    Availability,
    Reservation,
    ReservationPage,
}

pub fn result_shape(sql: &str) -> ResultShape {
    let dialect = PostgreSqlDialect {};
    let Ok(stmts) = Parser::parse_sql(&dialect, sql) else {
        return ResultShape::Empty;
    };
    match stmts.first() {
        Some(Statement::Insert(insert)) => match insert_table_name(insert).as_deref() {
            Ok("reservations" | "status_changes") => ResultShape::Reservation,
            _ => ResultShape::Empty,
        },
        Some(Statement::Query(query)) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return ResultShape::Empty;
            };
            let Some(from) = select.from.first() else {
                return ResultShape::Empty;
            };
            match table_factor_name(&from.relation).as_deref() {
                Ok("availability") => ResultShape::Availability,
                Ok("reservations") => {
                    let mut columns = HashMap::new();
                    if let Some(expr) = &select.selection {
                        let _ = collect_equalities(expr, RESERVATION_FILTERS, &mut columns);
                    }
                    if columns.contains_key("id") || columns.contains_key("booking_code") {
                        ResultShape::Reservation
                    } else {
                        ResultShape::ReservationPage
                    }
                }
                _ => ResultShape::Empty,
            }
        }
        _ => ResultShape::Empty,
    }
}

fn reservation_select(filters: &Fields<'_>) -> Result<Command, SqlError> {
    if filters.has("booking_code") {
        return Ok(Command::FindReservation {
            code: filters.required("booking_code")?,
            contact: filters.optional("contact")?,
        });
    }
    if filters.has("contact") {
        return Err(SqlError::MissingFilter("booking_code"));
    }
    if filters.has("id") {
        return Ok(Command::GetReservation {
            id: filters.required("id")?,
        });
    }
    Ok(Command::ListReservations(ReservationQuery {
        resource_id: filters.optional("resource_id")?,
        date: filters.optional("date")?,
        status: filters
            .optional::<String>("status")?
            .map(|s| parse_status(&s))
            .transpose()?,
        search: filters.optional("search")?,
        page: filters.optional("page")?.unwrap_or(0),
        page_size: filters.optional("page_size")?.unwrap_or(0),
    }))
}

// ── Column/value extraction ──────────────────────────────────────

/// Named values of one INSERT row or one WHERE clause.
struct Fields<'a> {
    values: HashMap<String, &'a Expr>,
    /// Missing-field error for a WHERE clause rather than an INSERT row.
    is_filter: bool,
}

impl Fields<'_> {
    fn has(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    fn optional<T>(&self, column: &'static str) -> Result<Option<T>, SqlError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(expr) = self.values.get(column) else {
            return Ok(None);
        };
        literal(expr)?
            .map(|text| {
                text.trim()
                    .parse()
                    .map_err(|e: T::Err| SqlError::invalid(column, e.to_string()))
            })
            .transpose()
    }

    fn required<T>(&self, column: &'static str) -> Result<T, SqlError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.optional(column)?.ok_or(if self.is_filter {
            SqlError::MissingFilter(column)
        } else {
            SqlError::MissingColumn(column)
        })
    }

    fn weekday(&self) -> Result<u8, SqlError> {
        let weekday: u8 = self.required("weekday")?;
        if weekday > 6 {
            return Err(SqlError::invalid("weekday", "expected 0 (Sunday) to 6 (Saturday)"));
        }
        Ok(weekday)
    }
}

fn insert_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    defaults: &[&'static str],
) -> Result<Vec<Fields<'a>>, SqlError> {
    let names: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if let Some(unknown) = names.iter().find(|n| !defaults.contains(&n.as_str())) {
        return Err(SqlError::Unsupported(format!("unknown column {table}.{unknown}")));
    }

    insert_values(insert)?
        .iter()
        .map(|row| {
            let expected = if insert.columns.is_empty() {
                required_len(table)..=names.len()
            } else {
                names.len()..=names.len()
            };
            if !expected.contains(&row.len()) {
                return Err(SqlError::WrongArity(table, names.len(), row.len()));
            }
            Ok(Fields {
                values: names.iter().cloned().zip(row.iter()).collect(),
                is_filter: false,
            })
        })
        .collect()
}

/// Positional inserts may omit trailing optional columns.
fn required_len(table: &str) -> usize {
    match table {
        "resources" => 3,
        "price_ranges" => 5,
        // phone is positional; email and total_price may be left off
        "reservations" => 6,
        _ => 4,
    }
}

fn insert_values(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Flatten `a = x AND b = y` into named values. Anything else is refused so a
/// filter is never silently ignored.
fn where_filters<'a>(
    selection: Option<&'a Expr>,
    allowed: &[&str],
) -> Result<Fields<'a>, SqlError> {
    let mut values = HashMap::new();
    if let Some(expr) = selection {
        collect_equalities(expr, allowed, &mut values)?;
    }
    Ok(Fields {
        values,
        is_filter: true,
    })
}

fn collect_equalities<'a>(
    expr: &'a Expr,
    allowed: &[&str],
    out: &mut HashMap<String, &'a Expr>,
) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, allowed, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, allowed, out)?;
            collect_equalities(right, allowed, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            if !allowed.contains(&column.as_str()) {
                return Err(SqlError::Unsupported(format!("filter on {column}")));
            }
            out.insert(column, right.as_ref());
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!(
            "only AND-ed equality filters are supported, got {other}"
        ))),
    }
}

/// Text of a literal, `None` for NULL. Bound parameters arrive quoted, so
/// numbers are accepted in either form.
fn literal(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(literal(expr)?.map(|v| format!("-{v}"))),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid {column}: {reason}")]
    InvalidValue { column: &'static str, reason: String },
}

impl SqlError {
    fn invalid(column: &'static str, reason: impl Into<String>) -> Self {
        SqlError::InvalidValue {
            column,
            reason: reason.into(),
        }
    }
}
