use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::auth::ToolSyncAuthSource;
use crate::engine::{ActivationReport, Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};

pub struct ToolSyncHandler {
    engine: Arc<Engine>,
    /// Session users treated as admins without being registered.
    admins: Arc<Vec<String>>,
    query_parser: Arc<ToolSyncQueryParser>,
}

impl ToolSyncHandler {
    pub fn new(engine: Arc<Engine>, admins: Arc<Vec<String>>) -> Self {
        Self {
            engine,
            admins,
            query_parser: Arc::new(ToolSyncQueryParser),
        }
    }

    /// The session user is the acting identity for every statement on the connection.
    fn actor<C: ClientInfo>(&self, client: &C) -> Actor {
        let name = client.metadata().get("user").cloned().unwrap_or_default();
        self.engine.resolve_actor(&name, &self.admins)
    }

    async fn run(&self, actor: &Actor, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(|e| {
            observability::record_rejection(label, &e);
            engine_err(e)
        })
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command) -> Result<Vec<Response>, EngineError> {
        let engine = &self.engine;
        let response = match cmd {
            Command::InsertTool {
                id,
                name,
                quantity,
                condition,
                category_id,
            } => {
                engine
                    .create_tool(id, name, category_id, quantity, condition, actor)
                    .await?;
                inserted()
            }
            Command::UpdateTool {
                id,
                name,
                condition,
                category_id,
            } => {
                engine.update_tool(id, name, category_id, condition, actor).await?;
                inserted()
            }
            Command::DeleteTool { id } => {
                engine.delete_tool(id, actor).await?;
                deleted()
            }
            Command::SetMaintenance { tool_id, on } => {
                engine.set_maintenance(tool_id, on, actor).await?;
                if on { inserted() } else { deleted() }
            }
            Command::InsertUser {
                id,
                name,
                role,
                department,
            } => {
                engine.register_user(id, name, role, department, actor).await?;
                inserted()
            }
            Command::InsertAllocation {
                id,
                tool_id,
                user_id,
                window,
            } => {
                engine.borrow(id, tool_id, user_id, window, actor).await?;
                inserted()
            }
            Command::InsertReturn { allocation_id } => {
                engine.return_allocation(allocation_id, actor).await?;
                inserted()
            }
            Command::InsertReturnRequest { allocation_id } => {
                engine.request_return(allocation_id, actor).await?;
                inserted()
            }
            Command::DeleteReturnRequest { allocation_id } => {
                engine.decline_return(allocation_id, actor).await?;
                deleted()
            }
            Command::InsertReservation {
                id,
                tool_id,
                user_id,
                window,
                recurrence,
            } => {
                engine
                    .reserve(id, tool_id, user_id, window, recurrence, actor)
                    .await?;
                inserted()
            }
            Command::DeleteReservation { id } => {
                engine.cancel_reservation(id, actor).await?;
                deleted()
            }
            Command::ApproveReservation { reservation_id } => {
                let allocation = engine.approve_reservation(reservation_id, actor).await?;
                rows(allocation_schema(), vec![allocation], encode_allocation)
            }
            Command::ConfirmReservation { reservation_id } => {
                engine.confirm_reservation(reservation_id, actor).await?;
                inserted()
            }
            Command::DeclineReservation { reservation_id } => {
                engine.decline_reservation(reservation_id, actor).await?;
                inserted()
            }
            Command::Activate { as_of } => {
                if !actor.is_admin() {
                    return Err(EngineError::Unauthorized(format!(
                        "activation requires the admin role ({} is a {})",
                        actor.name,
                        actor.role.as_str()
                    )));
                }
                let as_of = as_of.unwrap_or_else(|| engine.today());
                let report = engine.activate_due_reservations(as_of).await;
                activation_rows(report)
            }
            Command::SelectAvailability { tool_id, window } => {
                let a = engine.get_availability(tool_id, window).await?;
                rows(availability_schema(), vec![a], encode_availability)
            }
            Command::SelectTools { id } => {
                let tools = match id {
                    Some(id) => vec![engine.get_tool(id).await?],
                    None => engine.list_tools().await,
                };
                rows(tool_schema(), tools, encode_tool)
            }
            Command::SelectAllocations { tool_id } => {
                rows(allocation_schema(), engine.allocations(tool_id).await?, encode_allocation)
            }
            Command::SelectReservations { tool_id } => rows(
                reservation_schema(),
                engine.reservations(tool_id).await?,
                encode_reservation,
            ),
            Command::SelectUsers => rows(user_schema(), engine.list_users(), encode_user),
            Command::SelectOverdue { as_of } => {
                let as_of = as_of.unwrap_or_else(|| engine.today());
                rows(allocation_schema(), engine.overdue_allocations(as_of).await, encode_allocation)
            }
            Command::SelectDashboard { as_of } => {
                let as_of = as_of.unwrap_or_else(|| engine.today());
                rows(dashboard_schema(), vec![engine.dashboard(as_of).await], encode_dashboard)
            }
        };
        Ok(vec![response])
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
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

fn opt_string<T: ToString>(value: Option<T>) -> Option<String> {
    value.map(|v| v.to_string())
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("tool_id", Type::VARCHAR),
        field("total", Type::INT8),
        field("borrowed", Type::INT8),
        field("reserved", Type::INT8),
        field("available", Type::INT8),
    ]
}

fn encode_availability(e: &mut DataRowEncoder, a: &Availability) -> PgWireResult<()> {
    e.encode_field(&a.tool_id.to_string())?;
    e.encode_field(&i64::from(a.total))?;
    e.encode_field(&i64::from(a.borrowed))?;
    e.encode_field(&i64::from(a.reserved))?;
    e.encode_field(&i64::from(a.available))
}

fn tool_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("category_id", Type::VARCHAR),
        field("quantity", Type::INT8),
        field("condition", Type::VARCHAR),
        field("status", Type::VARCHAR),
    ]
}

fn encode_tool(e: &mut DataRowEncoder, t: &Tool) -> PgWireResult<()> {
    e.encode_field(&t.id.to_string())?;
    e.encode_field(&t.name)?;
    e.encode_field(&opt_string(t.category_id))?;
    e.encode_field(&i64::from(t.quantity))?;
    e.encode_field(&t.condition.as_str().to_string())?;
    e.encode_field(&t.status().as_str().to_string())
}

fn allocation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tool_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("borrow_date", Type::VARCHAR),
        field("expected_return_date", Type::VARCHAR),
        field("actual_return_date", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("reservation_id", Type::VARCHAR),
        field("return_requested", Type::BOOL),
    ]
}

fn encode_allocation(e: &mut DataRowEncoder, a: &Allocation) -> PgWireResult<()> {
    e.encode_field(&a.id.to_string())?;
    e.encode_field(&a.tool_id.to_string())?;
    e.encode_field(&a.user_id.to_string())?;
    e.encode_field(&a.window.start.to_string())?;
    e.encode_field(&a.window.end.to_string())?;
    e.encode_field(&opt_string(a.actual_return_date))?;
    e.encode_field(&a.status.as_str().to_string())?;
    e.encode_field(&opt_string(a.reservation_id))?;
    e.encode_field(&a.return_requested)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("tool_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("start_date", Type::VARCHAR),
        field("end_date", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("recurrence", Type::VARCHAR),
        field("allocation_id", Type::VARCHAR),
    ]
}

fn encode_reservation(e: &mut DataRowEncoder, r: &Reservation) -> PgWireResult<()> {
    let recurrence = r
        .recurrence
        .as_ref()
        .and_then(|rec| serde_json::to_string(rec).ok());
    e.encode_field(&r.id.to_string())?;
    e.encode_field(&r.tool_id.to_string())?;
    e.encode_field(&r.user_id.to_string())?;
    e.encode_field(&r.window.start.to_string())?;
    e.encode_field(&r.window.end.to_string())?;
    e.encode_field(&r.status.as_str().to_string())?;
    e.encode_field(&recurrence)?;
    e.encode_field(&opt_string(r.allocation_id))
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("role", Type::VARCHAR),
        field("department", Type::VARCHAR),
    ]
}

fn encode_user(e: &mut DataRowEncoder, u: &User) -> PgWireResult<()> {
    e.encode_field(&u.id.to_string())?;
    e.encode_field(&u.name)?;
    e.encode_field(&u.role.as_str().to_string())?;
    e.encode_field(&u.department)
}

fn dashboard_schema() -> Vec<FieldInfo> {
    vec![
        field("tools", Type::INT8),
        field("units_total", Type::INT8),
        field("units_available", Type::INT8),
        field("tools_in_maintenance", Type::INT8),
        field("active_allocations", Type::INT8),
        field("overdue_allocations", Type::INT8),
        field("pending_reservations", Type::INT8),
        field("upcoming_reservations", Type::INT8),
    ]
}

fn encode_dashboard(e: &mut DataRowEncoder, d: &DashboardSummary) -> PgWireResult<()> {
    let counts = [
        d.tools as i64,
        d.units_total as i64,
        d.units_available as i64,
        d.tools_in_maintenance as i64,
        d.active_allocations as i64,
        d.overdue_allocations as i64,
        d.pending_reservations as i64,
        d.upcoming_reservations as i64,
    ];
    for count in &counts {
        e.encode_field(count)?;
    }
    Ok(())
}

fn activation_schema() -> Vec<FieldInfo> {
    vec![
        field("reservation_id", Type::VARCHAR),
        field("tool_id", Type::VARCHAR),
        field("outcome", Type::VARCHAR),
        field("allocation_id", Type::VARCHAR),
        field("reason", Type::VARCHAR),
    ]
}

/// One row per reservation the sweep looked at.
struct ActivationRow {
    reservation_id: String,
    tool_id: String,
    outcome: &'static str,
    allocation_id: Option<String>,
    reason: Option<String>,
}

fn activation_rows(report: ActivationReport) -> Response {
    let activated = report.activated.into_iter().map(|a| ActivationRow {
        reservation_id: a.reservation_id.to_string(),
        tool_id: a.tool_id.to_string(),
        outcome: "activated",
        allocation_id: Some(a.allocation_id.to_string()),
        reason: None,
    });
    let skipped = report.skipped.into_iter().map(|s| ActivationRow {
        reservation_id: s.reservation_id.to_string(),
        tool_id: s.tool_id.to_string(),
        outcome: "skipped",
        allocation_id: None,
        reason: Some(s.reason),
    });
    rows(activation_schema(), activated.chain(skipped).collect(), |e, r| {
        e.encode_field(&r.reservation_id)?;
        e.encode_field(&r.tool_id)?;
        e.encode_field(&r.outcome.to_string())?;
        e.encode_field(&r.allocation_id)?;
        e.encode_field(&r.reason)
    })
}

/// Result columns for a statement, known before it runs. Empty for plain writes.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|t| !t.is_empty())
        .collect();
    let after = |keyword: &str| {
        tokens
            .iter()
            .position(|t| *t == keyword)
            .and_then(|i| tokens.get(i + 1))
            .map(|t| t.trim_matches('"'))
    };
    match tokens.first().copied() {
        Some("select") => match after("from") {
            Some("availability") => availability_schema(),
            Some("tools") => tool_schema(),
            Some("allocations") | Some("overdue") => allocation_schema(),
            Some("reservations") => reservation_schema(),
            Some("users") => user_schema(),
            Some("dashboard") => dashboard_schema(),
            _ => vec![],
        },
        Some("insert") => match after("into") {
            Some("approvals") => allocation_schema(),
            Some("activations") => activation_schema(),
            _ => vec![],
        },
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ToolSyncHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.actor(client);
        self.run(&actor, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ToolSyncQueryParser;

#[async_trait]
impl QueryParser for ToolSyncQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ToolSyncHandler {
    type Statement = String;
    type QueryParser = ToolSyncQueryParser;

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
        let actor = self.actor(client);
        let sql = substitute_params(portal);
        let responses = self.run(&actor, &sql).await?;
        Ok(responses
            .into_iter()
            .next()
            .unwrap_or(Response::EmptyQuery))
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
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Walks backwards so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ToolSyncFactory {
    handler: Arc<ToolSyncHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<ToolSyncAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ToolSyncFactory {
    pub fn new(engine: Arc<Engine>, password: String, admins: Arc<Vec<String>>) -> Self {
        let auth_source = ToolSyncAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ToolSyncHandler::new(engine, admins)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ToolSyncFactory {
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
pub async fn process_connection(socket: TcpStream, factory: Arc<ToolSyncFactory>) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound { .. } => "02000",
        EngineError::Conflict(_) => "23P01",
        EngineError::Unauthorized(_) => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), e.to_string())))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::InvalidValue(_) => "22023",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), e.to_string())))
}
