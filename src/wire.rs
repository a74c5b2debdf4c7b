use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotkeeperAuthSource;
use crate::engine::{Engine, EngineError, slot_price};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ResultShape, SqlError};
use crate::tenant::{DEFAULT_TENANT, TenantManager};

pub struct SlotkeeperHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotkeeperQueryParser>,
}

impl SlotkeeperHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotkeeperQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TENANT.to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::RegisterResource {
                id,
                name,
                hourly_price,
                slot_minutes,
            } => {
                engine
                    .register_resource(id, name, hourly_price, slot_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetSchedule {
                resource_id,
                weekday,
                opening,
                closing,
            } => {
                engine
                    .set_schedule(resource_id, weekday, opening, closing)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::AddPriceRanges { rows } => {
                let count = rows.len();
                // Each row commits on its own; a failing row leaves the earlier ones in place.
                for row in rows {
                    engine
                        .add_price_range(row.resource_id, row.weekday, row.range)
                        .await
                        .map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::ClearSchedule {
                resource_id,
                weekday,
            } => {
                engine
                    .clear_schedule(resource_id, weekday)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectAvailability { resource_id, date } => {
                let slots = engine
                    .get_availability(&resource_id, &date)
                    .await
                    .map_err(engine_err)?;
                let hourly_price = engine
                    .directory()
                    .resource(&resource_id)
                    .map_or(0, |info| info.hourly_price);
                availability_response(&resource_id, &date, hourly_price, slots)
            }
            Command::CreateReservation(request) => {
                let reservation = engine
                    .create_reservation(request)
                    .await
                    .map_err(engine_err)?;
                reservation_response(vec![reservation], None)
            }
            Command::TransitionStatus {
                id,
                status,
                actor,
                payment_ref,
            } => {
                let reservation = engine
                    .transition_status(id, status, actor, payment_ref)
                    .await
                    .map_err(engine_err)?;
                reservation_response(vec![reservation], None)
            }
            Command::FindReservation { code, contact } => {
                let reservation = engine
                    .find_reservation(&code, contact.as_deref())
                    .await
                    .map_err(engine_err)?;
                reservation_response(vec![reservation], None)
            }
            Command::GetReservation { id } => {
                let reservation = engine.get_reservation(id).await.map_err(engine_err)?;
                reservation_response(vec![reservation], None)
            }
            Command::ListReservations(query) => {
                let page = engine.list_reservations(query).await.map_err(engine_err)?;
                reservation_response(page.reservations, Some(page.total))
            }
        }
    }
}

// ── Result rows ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("price_multiplier", Type::FLOAT8),
        text_field("price", Type::INT8),
        text_field("available", Type::BOOL),
    ]
}

fn reservation_schema(with_total: bool) -> Vec<FieldInfo> {
    let mut fields = vec![
        text_field("id", Type::VARCHAR),
        text_field("booking_code", Type::VARCHAR),
        text_field("resource_id", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("start_time", Type::VARCHAR),
        text_field("end_time", Type::VARCHAR),
        text_field("duration_minutes", Type::INT8),
        text_field("total_price", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("status_label", Type::VARCHAR),
        text_field("first_name", Type::VARCHAR),
        text_field("last_name", Type::VARCHAR),
        text_field("phone", Type::VARCHAR),
        text_field("email", Type::VARCHAR),
        text_field("booked_at", Type::INT8),
        text_field("payment_ref", Type::VARCHAR),
        text_field("history", Type::VARCHAR),
    ];
    if with_total {
        fields.push(text_field("total_count", Type::INT8));
    }
    fields
}

fn shape_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::result_shape(sql) {
        ResultShape::Empty => vec![],
        ResultShape::Availability => availability_schema(),
        ResultShape::Reservation => reservation_schema(false),
        ResultShape::ReservationPage => reservation_schema(true),
    }
}

fn availability_response(
    resource_id: &str,
    date: &str,
    hourly_price: Price,
    slots: Vec<SlotAvailability>,
) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema());
    let resource_id = resource_id.to_string();
    let date = date.to_string();
    let rows: Vec<PgWireResult<_>> = slots
        .into_iter()
        .map(|SlotAvailability { slot, available }| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&resource_id)?;
            encoder.encode_field(&date)?;
            encoder.encode_field(&slot.start_time().to_string())?;
            encoder.encode_field(&slot.end_time().to_string())?;
            encoder.encode_field(&slot.price_multiplier)?;
            encoder.encode_field(&slot_price(
                hourly_price,
                slot.duration(),
                slot.price_multiplier,
            ))?;
            encoder.encode_field(&available)?;
            Ok(encoder.take_row())
        })
        .collect();

    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn history_json(history: &[StatusChange]) -> String {
    let entries: Vec<_> = history
        .iter()
        .map(|change| {
            serde_json::json!({
                "from": change.from.as_str(),
                "to": change.to.as_str(),
                "actor": change.actor.id,
                "role": change.actor.role.as_str(),
                "at": change.at,
            })
        })
        .collect();
    serde_json::Value::Array(entries).to_string()
}

fn reservation_response(
    reservations: Vec<Reservation>,
    total: Option<usize>,
) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema(total.is_some()));
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.booking_code.as_str().to_string())?;
            encoder.encode_field(&r.resource_id)?;
            encoder.encode_field(&r.date)?;
            encoder.encode_field(&r.start.to_string())?;
            encoder.encode_field(&r.end.to_string())?;
            encoder.encode_field(&i64::from(r.duration_minutes))?;
            encoder.encode_field(&r.total_price)?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&sql::status_label(r.status).to_string())?;
            encoder.encode_field(&r.guest.first_name)?;
            encoder.encode_field(&r.guest.last_name)?;
            encoder.encode_field(&r.guest.contact.phone().map(str::to_string))?;
            encoder.encode_field(&r.guest.contact.email().map(str::to_string))?;
            encoder.encode_field(&r.booked_at)?;
            encoder.encode_field(&r.payment_ref)?;
            encoder.encode_field(&history_json(&r.history))?;
            if let Some(total) = total {
                encoder.encode_field(&(total as i64))?;
            }
            Ok(encoder.take_row())
        })
        .collect();

    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for SlotkeeperHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeeperQueryParser;

#[async_trait]
impl QueryParser for SlotkeeperQueryParser {
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
        Ok(shape_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotkeeperHandler {
    type Statement = String;
    type QueryParser = SlotkeeperQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
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
            shape_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(shape_schema(
            &target.statement.statement,
        )))
    }
}

/// Byte range and 1-based index of each `$N` placeholder outside quoted text.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits = bytes[i + 1..]
                    .iter()
                    .take_while(|c| c.is_ascii_digit())
                    .count();
                if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
                    found.push((i..i + 1 + digits, n));
                    i += 1 + digits;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Inline text-format parameters as quoted literals in one pass over the
/// statement. Substituted text is never rescanned.
fn inline_params(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        out.push_str(&sql[copied..range.start]);
        match param {
            Some(text) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            None => out.push_str("NULL"),
        }
        copied = range.end;
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| {
            p.as_ref()
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        })
        .collect();
    inline_params(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotkeeperFactory {
    handler: Arc<SlotkeeperHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotkeeperAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotkeeperFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotkeeperAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotkeeperHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeeperFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotkeeperFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

pub(crate) fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine failure.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict { .. } => "23505",
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::ContactMismatch(_) | EngineError::Forbidden { .. } => "42501",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::InvalidSchedule(_) => "XX001",
        EngineError::CodeExhaustion(_) => "53000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
        EngineError::StoreUnavailable(_) => "57P03",
        EngineError::Internal(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
