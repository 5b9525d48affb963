use std::fmt::Debug;
use std::sync::Arc;

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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::CampusAuthSource;
use crate::campus::{Campus, CampusManager};
use crate::catalog::FacilityInfo;
use crate::engine::LedgerError;
use crate::identity::{IdentityProvider, Principal};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command};

pub struct CampusHandler {
    campuses: Arc<CampusManager>,
    identity: Arc<dyn IdentityProvider>,
    query_parser: Arc<CampusQueryParser>,
}

impl CampusHandler {
    pub fn new(campuses: Arc<CampusManager>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            campuses,
            identity,
            query_parser: Arc::new(CampusQueryParser),
        }
    }

    /// Campus from the connection's database, principal from its user.
    fn resolve_session<C: ClientInfo>(&self, client: &C) -> PgWireResult<(Arc<Campus>, Principal)> {
        let metadata = client.metadata();
        let login = metadata.get("user").cloned().unwrap_or_default();
        let principal = self.identity.resolve(&login).ok_or_else(|| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("28000", format!("unknown user: {login:?}"))
        })?;
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let campus = self
            .campuses
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("campus error: {e}")))?;
        Ok((campus, principal))
    }

    async fn run_query<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let (campus, principal) = self.resolve_session(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let started = std::time::Instant::now();
        let result = self.execute_command(&campus, &principal, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(
        &self,
        campus: &Campus,
        principal: &Principal,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let ledger = &campus.ledger;
        match cmd {
            Command::InsertBooking { id, facility_id, slot } => {
                let outcome = ledger
                    .request_booking(principal, id, facility_id, slot)
                    .await
                    .map_err(ledger_err)?;
                let status = if outcome.is_confirmed() { "confirmed" } else { "waitlisted" };
                let schema = Arc::new(outcome_schema());
                let row = encode_outcome(&schema, outcome.id(), &principal.login, status, None);
                Ok(vec![query_response(schema, vec![row])])
            }
            Command::DeleteBooking { id } => {
                let outcome = ledger.cancel_booking(principal, id).await.map_err(ledger_err)?;
                let schema = Arc::new(outcome_schema());
                let mut rows = vec![encode_outcome(
                    &schema,
                    outcome.cancelled.id,
                    &outcome.cancelled.owner,
                    outcome.cancelled.status.as_str(),
                    None,
                )];
                for p in &outcome.promoted {
                    rows.push(encode_outcome(
                        &schema,
                        p.booking.id,
                        &p.booking.owner,
                        p.booking.status.as_str(),
                        Some(p.entry_id.to_string()),
                    ));
                }
                Ok(vec![query_response(schema, rows)])
            }
            Command::InsertApproval { id } => {
                let booking = ledger.approve_waitlisted(principal, id).await.map_err(ledger_err)?;
                let schema = Arc::new(outcome_schema());
                let row = encode_outcome(
                    &schema,
                    booking.id,
                    &booking.owner,
                    booking.status.as_str(),
                    Some(id.to_string()),
                );
                Ok(vec![query_response(schema, vec![row])])
            }
            Command::DeleteWaitlist { id } => {
                ledger.withdraw_waitlisted(principal, id).await.map_err(ledger_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings { filter } => {
                let (bookings, waitlist) = match filter {
                    BookingFilter::Own => {
                        let h = ledger.list_bookings_for(&principal.login).await;
                        (h.bookings, h.waitlist)
                    }
                    BookingFilter::User(user) => {
                        if !principal.may_manage(&user) {
                            return Err(user_error(
                                "42501",
                                format!("only admins may list bookings of {user}"),
                            ));
                        }
                        let h = ledger.list_bookings_for(&user).await;
                        (h.bookings, h.waitlist)
                    }
                    BookingFilter::Day { facility_id, date } => {
                        let day = ledger.facility_schedule(facility_id, date).await;
                        (day.bookings, day.waitlist)
                    }
                };
                let schema = Arc::new(booking_schema());
                let mut rows: Vec<_> = bookings.iter().map(|b| encode_booking(&schema, b)).collect();
                rows.extend(waitlist.iter().map(|e| encode_waitlisted(&schema, e)));
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectWaitlist { user_id } => {
                let entries = match user_id {
                    Some(user) if !principal.may_manage(&user) => {
                        return Err(user_error(
                            "42501",
                            format!("only admins may list the waitlist of {user}"),
                        ));
                    }
                    Some(user) => ledger.list_bookings_for(&user).await.waitlist,
                    // Admins see the whole queue they approve from.
                    None if principal.is_admin() => ledger.list_all().await.waitlist,
                    None => ledger.list_bookings_for(&principal.login).await.waitlist,
                };
                let schema = Arc::new(waitlist_schema());
                let rows = entries.iter().map(|e| encode_entry(&schema, e)).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectFacilities => {
                let schema = Arc::new(facility_schema());
                let rows = campus
                    .facilities
                    .list()
                    .iter()
                    .map(|f| encode_facility(&schema, f))
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAvailability { facility_id, date, window } => {
                let free = ledger
                    .availability(facility_id, date, window)
                    .await
                    .map_err(ledger_err)?;
                let schema = Arc::new(availability_schema());
                let fid = facility_id.to_string();
                let rows = free
                    .iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&fid)?;
                        encoder.encode_field(&slot.date.to_string())?;
                        encoder.encode_field(&hhmm(slot.start))?;
                        encoder.encode_field(&hhmm(slot.end))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

/// Result of a mutation: the record it created or changed.
fn outcome_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("user_id"), text("status"), text("promoted_from")]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("user_id"),
        text("facility_id"),
        text("date"),
        text("start"),
        text("end"),
        text("status"),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("user_id"),
        text("facility_id"),
        text("date"),
        text("start"),
        text("end"),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn facility_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        text("kind"),
        FieldInfo::new("capacity".into(), None, None, Type::INT4, FieldFormat::Text),
        FieldInfo::new("active".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("facility_id"), text("date"), text("start"), text("end")]
}

/// Schema a statement will return, for Describe in the extended protocol.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("SELECT") {
        if upper.contains("AVAILABILITY") {
            availability_schema()
        } else if upper.contains("FACILITIES") {
            facility_schema()
        } else if upper.contains("WAITLIST") {
            waitlist_schema()
        } else if upper.contains("BOOKINGS") {
            booking_schema()
        } else {
            vec![]
        }
    } else if (upper.starts_with("INSERT") && (upper.contains("BOOKINGS") || upper.contains("APPROVALS")))
        || (upper.starts_with("DELETE") && upper.contains("BOOKINGS"))
    {
        outcome_schema()
    } else {
        vec![]
    }
}

// ── Row encoding ─────────────────────────────────────────────────

/// `HH:MM`, or `HH:MM:SS` when the time has seconds.
fn hhmm(t: chrono::NaiveTime) -> String {
    use chrono::Timelike;
    if t.second() == 0 {
        t.format("%H:%M").to_string()
    } else {
        t.format("%H:%M:%S").to_string()
    }
}

fn encode_outcome(
    schema: &Arc<Vec<FieldInfo>>,
    id: ulid::Ulid,
    user: &str,
    status: &str,
    promoted_from: Option<String>,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&id.to_string())?;
    encoder.encode_field(&user)?;
    encoder.encode_field(&status)?;
    encoder.encode_field(&promoted_from)?;
    Ok(encoder.take_row())
}

fn encode_slot_fields(
    encoder: &mut DataRowEncoder,
    id: ulid::Ulid,
    owner: &str,
    facility: FacilityId,
    slot: &Slot,
) -> PgWireResult<()> {
    encoder.encode_field(&id.to_string())?;
    encoder.encode_field(&owner)?;
    encoder.encode_field(&facility.to_string())?;
    encoder.encode_field(&slot.date.to_string())?;
    encoder.encode_field(&hhmm(slot.start))?;
    encoder.encode_field(&hhmm(slot.end))
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, b: &Booking) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_slot_fields(&mut encoder, b.id, &b.owner, b.facility, &b.slot)?;
    encoder.encode_field(&b.status.as_str())?;
    Ok(encoder.take_row())
}

fn encode_waitlisted(schema: &Arc<Vec<FieldInfo>>, e: &WaitlistEntry) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_slot_fields(&mut encoder, e.id, &e.owner, e.facility, &e.slot)?;
    encoder.encode_field(&"waitlisted")?;
    Ok(encoder.take_row())
}

fn encode_entry(schema: &Arc<Vec<FieldInfo>>, e: &WaitlistEntry) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encode_slot_fields(&mut encoder, e.id, &e.owner, e.facility, &e.slot)?;
    encoder.encode_field(&e.created_at)?;
    Ok(encoder.take_row())
}

fn encode_facility(schema: &Arc<Vec<FieldInfo>>, f: &FacilityInfo) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&f.id.to_string())?;
    encoder.encode_field(&f.name)?;
    encoder.encode_field(&f.kind.as_str())?;
    encoder.encode_field(&(f.capacity as i32))?;
    encoder.encode_field(&f.active)?;
    Ok(encoder.take_row())
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for CampusHandler {
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
        self.run_query(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CampusQueryParser;

#[async_trait]
impl QueryParser for CampusQueryParser {
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
impl ExtendedQueryHandler for CampusHandler {
    type Statement = String;
    type QueryParser = CampusQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let mut responses = self.run_query(client, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
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

/// Inline bound text parameters as quoted literals in one left-to-right pass,
/// so text inside a bound value is never substituted again.
fn substitute_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let index = after[..digits].parse::<usize>().ok().and_then(|n| n.checked_sub(1));
        match index.and_then(|i| params.get(i)) {
            Some(Some(bytes)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CampusFactory {
    handler: Arc<CampusHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CampusAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CampusFactory {
    pub fn new(
        campuses: Arc<CampusManager>,
        identity: Arc<dyn IdentityProvider>,
        password: String,
    ) -> Self {
        Self {
            handler: Arc::new(CampusHandler::new(campuses, identity)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                CampusAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CampusFactory {
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
    campuses: Arc<CampusManager>,
    identity: Arc<dyn IdentityProvider>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(CampusFactory::new(campuses, identity, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE per ledger error, so clients can branch without parsing text.
fn sqlstate(e: &LedgerError) -> &'static str {
    match e {
        LedgerError::InvalidInterval { .. } => "22023",
        LedgerError::PastDate(_) => "22008",
        LedgerError::NotFound(_) => "P0002",
        LedgerError::Forbidden(_) => "42501",
        LedgerError::InvalidState { .. } => "55000",
        LedgerError::FacilityUnknown(_) => "23503",
        LedgerError::FacilityInactive(_) => "23514",
        LedgerError::AlreadyExists(_) => "23505",
        LedgerError::LimitExceeded(_) => "54000",
        LedgerError::WalError(_) => "58030",
    }
}

fn ledger_err(e: LedgerError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    let code = match e {
        sql::SqlError::UnknownTable(_) => "42P01",
        sql::SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
