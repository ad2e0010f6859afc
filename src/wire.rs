use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::MedbookAuthSource;
use crate::engine::{BookAppointment, Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::schedule::{self, Actor, Rejection};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct MedbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<MedbookQueryParser>,
}

/// Who the session acts as, from the login user name. Anything that is not
/// `admin`, `provider:<ulid>` or `patient:<ulid>` is anonymous.
fn session_actor<C: ClientInfo>(client: &C) -> Option<Actor> {
    client.metadata().get("user").and_then(|u| u.parse().ok())
}

impl MedbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(MedbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, run and record one statement.
    async fn run<C: ClientInfo>(&self, client: &C, sql_text: &str, format: &Format) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let actor = session_actor(client);
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = command_label(&cmd);
        debug!("{label} as {}", actor.as_ref().map_or("anonymous".to_string(), Actor::to_string));

        let started = Instant::now();
        let result = self.execute_command(&engine, actor.as_ref(), cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        actor: Option<&Actor>,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertClinic { id, name, timezone, address } => {
                schedule::authorize_admin(actor).map_err(rejection_err)?;
                engine
                    .create_clinic(id, name, timezone, address)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertProvider { id, clinic_id, name, speciality } => {
                schedule::authorize_admin(actor).map_err(rejection_err)?;
                engine
                    .create_provider(id, clinic_id, name, speciality)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            // Registration is open to any session.
            Command::InsertPatient { id, name, phone } => {
                engine.create_patient(id, name, phone).await.map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertService { id, clinic_id, name, duration_min } => {
                schedule::authorize_admin(actor).map_err(rejection_err)?;
                engine
                    .create_service(id, clinic_id, name, duration_min)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::InsertAvailability { id, provider_id, weekday, start, end } => {
                schedule::authorize_availability_edit(actor, provider_id).map_err(rejection_err)?;
                engine
                    .add_availability(id, provider_id, weekday, &start, &end)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteAvailability { id } => {
                let provider_id = engine
                    .get_provider_for_entity(&id)
                    .ok_or(EngineError::not_found("availability", id))
                    .map_err(engine_err)?;
                schedule::authorize_availability_edit(actor, provider_id).map_err(rejection_err)?;
                engine.remove_availability(id).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::InsertAppointment {
                id,
                provider_id,
                patient_id,
                service_id,
                start_time,
                notes,
            } => {
                schedule::authorize_booking(actor, patient_id).map_err(rejection_err)?;
                let requested_start = schedule::parse_requested_start(&start_time).map_err(rejection_err)?;
                engine
                    .book_appointment(BookAppointment {
                        id,
                        provider_id,
                        patient_id,
                        service_id,
                        requested_start,
                        notes,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted())
            }
            Command::DeleteAppointment { id } => {
                engine.cancel_appointment(id, actor).await.map_err(engine_err)?;
                Ok(deleted())
            }
            Command::SelectSlots { provider_id, service_id, date } => {
                let slots = engine
                    .list_slots(provider_id, service_id, date)
                    .await
                    .map_err(engine_err)?;
                let (p, s) = (provider_id.to_string(), service_id.to_string());
                Ok(query_response(slots_schema(format), &slots, |enc, slot| {
                    enc.encode_field(&p)?;
                    enc.encode_field(&s)?;
                    enc.encode_field(&rfc3339(&slot.start))?;
                    enc.encode_field(&rfc3339(&slot.end))
                }))
            }
            Command::SelectClinics => {
                let clinics = engine.list_clinics();
                Ok(query_response(clinics_schema(format), &clinics, |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&c.name)?;
                    enc.encode_field(&c.timezone_name().map(str::to_string))?;
                    enc.encode_field(&c.address)
                }))
            }
            Command::SelectServices { clinic_id } => {
                let services = engine.list_services(clinic_id);
                Ok(query_response(services_schema(format), &services, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.clinic_id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&s.duration_min)
                }))
            }
            Command::SelectProviders { clinic_id } => {
                let providers = engine.list_providers(clinic_id).await;
                Ok(query_response(providers_schema(format), &providers, |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.clinic_id.to_string())?;
                    enc.encode_field(&p.name)?;
                    enc.encode_field(&p.speciality)
                }))
            }
            Command::SelectAvailability { provider_id } => {
                let windows = engine.list_availability(provider_id).await.map_err(engine_err)?;
                Ok(query_response(availability_schema(format), &windows, |enc, w| {
                    enc.encode_field(&w.id.to_string())?;
                    enc.encode_field(&w.provider_id.to_string())?;
                    enc.encode_field(&i32::from(w.weekday))?;
                    enc.encode_field(&w.start.to_string())?;
                    enc.encode_field(&w.end.to_string())
                }))
            }
            Command::SelectProviderSchedule { provider_id, date } => {
                let rows = engine
                    .provider_schedule(provider_id, date, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(appointments_response(engine, rows, format))
            }
            Command::SelectAppointmentsOn { date } => {
                let rows = engine.appointments_on(date, actor).await.map_err(engine_err)?;
                Ok(appointments_response(engine, rows, format))
            }
            Command::SelectMyAppointments => {
                let patient_id = schedule::authorize_own_appointments(actor).map_err(rejection_err)?;
                let rows = engine.upcoming_for_patient(patient_id).await.map_err(engine_err)?;
                Ok(appointments_response(engine, rows, format))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn rfc3339<Z: TimeZone>(t: &DateTime<Z>) -> String
where
    Z::Offset: std::fmt::Display,
{
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Appointment instants are rendered in the clinic's zone when it has one.
fn local_rfc3339(t: DateTime<Utc>, zone: Option<Tz>) -> String {
    match zone {
        Some(z) => rfc3339(&t.with_timezone(&z)),
        None => rfc3339(&t),
    }
}

fn appointments_response(engine: &Engine, rows: Vec<AppointmentInfo>, format: &Format) -> Response {
    query_response(appointments_schema(format), &rows, |enc, a| {
        let zone = engine.clinic(&a.clinic_id).and_then(|c| c.zone);
        enc.encode_field(&a.id.to_string())?;
        enc.encode_field(&a.clinic_id.to_string())?;
        enc.encode_field(&a.provider_id.to_string())?;
        enc.encode_field(&a.patient_id.to_string())?;
        enc.encode_field(&a.service_id.to_string())?;
        enc.encode_field(&local_rfc3339(a.start, zone))?;
        enc.encode_field(&local_rfc3339(a.end, zone))?;
        enc.encode_field(&a.status.to_string())?;
        enc.encode_field(&a.notes)
    })
}

fn query_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn fields(format: &Format, columns: &[(&str, Type)]) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new(name.to_string(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

fn slots_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("provider_id", Type::VARCHAR),
            ("service_id", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
        ],
    )
}

fn clinics_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("timezone", Type::VARCHAR),
            ("address", Type::VARCHAR),
        ],
    )
}

fn services_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("id", Type::VARCHAR),
            ("clinic_id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("duration_min", Type::INT8),
        ],
    )
}

fn providers_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("id", Type::VARCHAR),
            ("clinic_id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("speciality", Type::VARCHAR),
        ],
    )
}

fn availability_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("id", Type::VARCHAR),
            ("provider_id", Type::VARCHAR),
            ("weekday", Type::INT4),
            ("start_hhmm", Type::VARCHAR),
            ("end_hhmm", Type::VARCHAR),
        ],
    )
}

fn appointments_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("id", Type::VARCHAR),
            ("clinic_id", Type::VARCHAR),
            ("provider_id", Type::VARCHAR),
            ("patient_id", Type::VARCHAR),
            ("service_id", Type::VARCHAR),
            ("start_time", Type::VARCHAR),
            ("end_time", Type::VARCHAR),
            ("status", Type::VARCHAR),
            ("notes", Type::VARCHAR),
        ],
    )
}

/// Result columns of a statement, by the table it selects from.
fn result_schema(sql_text: &str, format: &Format) -> Vec<FieldInfo> {
    match sql::select_table(sql_text).as_deref() {
        Some("slots") => slots_schema(format),
        Some("clinics") => clinics_schema(format),
        Some("services") => services_schema(format),
        Some("providers") => providers_schema(format),
        Some("availability") => availability_schema(format),
        Some("appointments") | Some("my_appointments") => appointments_schema(format),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for MedbookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let response = self.run(client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct MedbookQueryParser;

#[async_trait]
impl QueryParser for MedbookQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for MedbookHandler {
    type Statement = String;
    type QueryParser = MedbookQueryParser;

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
        let sql_text = substitute_params(portal);
        self.run(client, &sql_text, &portal.result_column_format).await
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
            result_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

enum Piece<'a> {
    Text(&'a str),
    /// Digits of a `$N` placeholder.
    Param(&'a str),
}

/// Split `sql` into plain text and `$N` placeholders. Placeholders inside a
/// quoted literal stay text.
fn split_placeholders(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut in_literal = false;
    let mut text_from = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            in_literal = !in_literal;
        } else if bytes[i] == b'$' && !in_literal {
            let digits_from = i + 1;
            let mut j = digits_from;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > digits_from {
                pieces.push(Piece::Text(&sql[text_from..i]));
                pieces.push(Piece::Param(&sql[digits_from..j]));
                text_from = j;
                i = j;
                continue;
            }
        }
        i += 1;
    }
    pieces.push(Piece::Text(&sql[text_from..]));
    pieces
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    split_placeholders(sql)
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Param(n) => n.parse::<usize>().ok(),
            Piece::Text(_) => None,
        })
        .max()
        .unwrap_or(0)
}

/// Replace `$1`, `$2`, ... with bound values as quoted text in one pass over
/// the statement, so a bound value is never searched for placeholders.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    for piece in split_placeholders(sql) {
        let digits = match piece {
            Piece::Text(text) => {
                out.push_str(text);
                continue;
            }
            Piece::Param(digits) => digits,
        };
        let bound = digits
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        match bound {
            Some(Some(bytes)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => {
                out.push('$');
                out.push_str(digits);
            }
        }
    }
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct MedbookFactory {
    handler: Arc<MedbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<MedbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl MedbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(MedbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                MedbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for MedbookFactory {
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
) -> io::Result<()> {
    let factory = MedbookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for a scheduling rejection.
pub fn rejection_sqlstate(r: &Rejection) -> &'static str {
    match r {
        Rejection::InvalidTimeOfDay(_) | Rejection::AmbiguousTimestamp(_) => "22007",
        Rejection::PastBooking => "22008",
        Rejection::InvalidWindow { .. }
        | Rejection::InvalidWeekday(_)
        | Rejection::InvalidDuration(_)
        | Rejection::InvalidServiceDuration(_)
        | Rejection::MissingTimezone
        | Rejection::OutsideAvailability => "22023",
        Rejection::BookingConflict => "23P01",
        Rejection::NotCancellable => "55000",
        Rejection::Forbidden => "42501",
        Rejection::Unauthenticated => "28000",
    }
}

pub fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Rejected(r) => rejection_sqlstate(r),
        EngineError::NotFound { .. } => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidTimezone(_) | EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

pub fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn { .. } => "42703",
        SqlError::BadLiteral { .. } => "22P02",
        SqlError::TooLong => "54000",
        SqlError::Unsupported(_) => "0A000",
        SqlError::Parse(_)
        | SqlError::Empty
        | SqlError::MissingColumn { .. }
        | SqlError::MissingFilter(_)
        | SqlError::UnexpectedFilter(_) => "42601",
    }
}

fn rejection_err(r: Rejection) -> PgWireError {
    user_error(rejection_sqlstate(&r), format!("{}: {r}", r.reason_code()))
}

fn engine_err(e: EngineError) -> PgWireError {
    match e {
        EngineError::Rejected(r) => rejection_err(r),
        other => user_error(engine_sqlstate(&other), other.to_string()),
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}
