use std::fmt::Debug;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::BayflowAuthSource;
use crate::model::*;
use crate::observability::{self, command_label};
use crate::orchestrator::Workflow;
use crate::service::{ErrorKind, WorkflowError};
use crate::sql::{self, Command, SqlError};

pub struct BayflowHandler {
    workflow: Workflow,
    query_parser: Arc<BayflowQueryParser>,
}

impl BayflowHandler {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            query_parser: Arc::new(BayflowQueryParser),
        }
    }

    /// The login user is the identity, the database the role. Both were
    /// vetted by the auth source during startup.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let metadata = client.metadata();
        let identity = metadata.get("user").cloned().unwrap_or_default();
        let database = metadata.get("database").cloned().unwrap_or_default();
        let role: Role = database
            .parse()
            .map_err(|_| user_error("3D000", format!("unknown database {database:?}")))?;
        Ok(Actor::new(identity, role))
    }

    /// `format` is the result column format the client asked for.
    async fn run(&self, actor: &Actor, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd, format).await;

        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);

        result.map_err(|e| {
            metrics::counter!(observability::WORKFLOW_ERRORS_TOTAL, "code" => e.code()).increment(1);
            if e.kind() == ErrorKind::Internal {
                tracing::error!("{label} by {} failed: {e:?}", actor.identity);
            } else {
                tracing::debug!("{label} by {} rejected: {e}", actor.identity);
            }
            workflow_err(e)
        })
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command, format: &Format) -> Result<Response, WorkflowError> {
        let wf = &self.workflow;
        let response = match cmd {
            Command::BookAppointment(new) => one(&wf.appointments.book(actor, new).await?, format),
            Command::SelectAppointments { filter, page } => {
                listing(&wf.appointments.list(actor, &filter, page).await?, format)
            }
            Command::GetAppointment { id } => one(&wf.appointments.get(actor, id).await?, format),
            Command::SetAppointmentStatus { id, status, note } => {
                one(&wf.appointments.set_status(actor, id, &status, note).await?, format)
            }
            Command::InsertBay(new) => one(&wf.bays.create_bay(actor, new).await?, format),
            Command::SelectBays { filter, page } => listing(&wf.bays.list_bays(actor, &filter, page).await?, format),
            Command::GetBay { id } => one(&wf.bays.get_bay(actor, id).await?, format),
            Command::UpdateBay { id, update } => one(&wf.bays.update_bay(actor, id, update).await?, format),
            Command::DeleteBay { id } => one(&wf.bays.delete(actor, id).await?, format),
            Command::InsertProgress(new) => one(&wf.progress.create(actor, new).await?, format),
            Command::SelectProgress { filter, page } => {
                listing(&wf.progress.list(actor, &filter, page).await?, format)
            }
            Command::UpdateProgress { id, update } => one(&wf.progress.update(actor, id, update).await?, format),
            Command::DeleteProgress { id } => one(&wf.progress.delete(actor, id).await?, format),
            Command::SelectNotifications { page } => listing(&wf.inbox.list(actor, page).await?, format),
            Command::MarkNotificationRead { id } => one(&wf.inbox.mark_read(actor, id).await?, format),
        };
        Ok(response)
    }
}

// ── Row encoding ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Appointments,
    Bays,
    RepairProgress,
    Notifications,
}

impl Table {
    fn named(name: &str) -> Option<Table> {
        match name {
            "appointments" => Some(Table::Appointments),
            "bays" => Some(Table::Bays),
            "repair_progress" => Some(Table::RepairProgress),
            "notifications" => Some(Table::Notifications),
            _ => None,
        }
    }

    fn columns(&self) -> &'static [(&'static str, Col)] {
        match self {
            Table::Appointments => &[
                ("id", Col::Text),
                ("kind", Col::Text),
                ("status", Col::Text),
                ("scheduled_date", Col::Text),
                ("time_slot", Col::Text),
                ("subject_id", Col::Text),
                ("customer_account", Col::Text),
                ("customer_name", Col::Text),
                ("customer_email", Col::Text),
                ("customer_phone", Col::Text),
                ("note", Col::Text),
                ("created_at", Col::Int),
                ("updated_at", Col::Int),
            ],
            Table::Bays => &[
                ("id", Col::Text),
                ("number", Col::Int),
                ("status", Col::Text),
                ("current_booking", Col::Text),
                ("last_maintenance", Col::Int),
                ("notes", Col::Text),
                ("updated_at", Col::Int),
            ],
            Table::RepairProgress => &[
                ("id", Col::Text),
                ("appointment_id", Col::Text),
                ("staff_id", Col::Text),
                ("status", Col::Text),
                ("notes", Col::Text),
                ("estimated_completion", Col::Int),
                ("created_at", Col::Int),
                ("updated_at", Col::Int),
            ],
            Table::Notifications => &[
                ("id", Col::Text),
                ("recipient", Col::Text),
                ("message", Col::Text),
                ("read", Col::Bool),
                ("created_at", Col::Int),
            ],
        }
    }

    /// Listings carry a trailing `total_count` column with the unpaged total.
    fn schema(&self, with_total: bool, format: &Format) -> Vec<FieldInfo> {
        let total = with_total.then_some(("total_count", Col::Int));
        self.columns()
            .iter()
            .copied()
            .chain(total)
            .enumerate()
            .map(|(idx, (name, col))| FieldInfo::new(name.into(), None, None, col.pg_type(), format.format_for(idx)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Col {
    Text,
    Int,
    Bool,
}

impl Col {
    fn pg_type(self) -> Type {
        match self {
            Col::Text => Type::VARCHAR,
            Col::Int => Type::INT8,
            Col::Bool => Type::BOOL,
        }
    }
}

/// A document that goes out as one row of its table.
trait Tabular {
    const TABLE: Table;

    fn encode(&self, encoder: &mut DataRowEncoder) -> PgWireResult<()>;
}

fn text(ulid: Option<ulid::Ulid>) -> Option<String> {
    ulid.map(|u| u.to_string())
}

impl Tabular for Appointment {
    const TABLE: Table = Table::Appointments;

    fn encode(&self, e: &mut DataRowEncoder) -> PgWireResult<()> {
        e.encode_field(&self.id.to_string())?;
        e.encode_field(&self.kind.as_str())?;
        e.encode_field(&self.status.as_str())?;
        e.encode_field(&self.scheduled_date.format("%Y-%m-%d").to_string())?;
        e.encode_field(&self.time_slot)?;
        e.encode_field(&self.subject_id.to_string())?;
        e.encode_field(&self.customer.account_id.to_string())?;
        e.encode_field(&self.customer.name)?;
        e.encode_field(&self.customer.email)?;
        e.encode_field(&self.customer.phone)?;
        e.encode_field(&self.note)?;
        e.encode_field(&self.created_at)?;
        e.encode_field(&self.updated_at)
    }
}

impl Tabular for Bay {
    const TABLE: Table = Table::Bays;

    fn encode(&self, e: &mut DataRowEncoder) -> PgWireResult<()> {
        e.encode_field(&self.id.to_string())?;
        e.encode_field(&i64::from(self.number))?;
        e.encode_field(&self.status.as_str())?;
        e.encode_field(&text(self.current_booking))?;
        e.encode_field(&self.last_maintenance)?;
        e.encode_field(&self.notes)?;
        e.encode_field(&self.updated_at)
    }
}

impl Tabular for RepairProgress {
    const TABLE: Table = Table::RepairProgress;

    fn encode(&self, e: &mut DataRowEncoder) -> PgWireResult<()> {
        e.encode_field(&self.id.to_string())?;
        e.encode_field(&self.appointment_id.to_string())?;
        e.encode_field(&self.staff_id)?;
        e.encode_field(&self.status.as_str())?;
        e.encode_field(&self.notes)?;
        e.encode_field(&self.estimated_completion)?;
        e.encode_field(&self.created_at)?;
        e.encode_field(&self.updated_at)
    }
}

impl Tabular for Notification {
    const TABLE: Table = Table::Notifications;

    fn encode(&self, e: &mut DataRowEncoder) -> PgWireResult<()> {
        e.encode_field(&self.id.to_string())?;
        e.encode_field(&self.recipient.to_string())?;
        e.encode_field(&self.message)?;
        e.encode_field(&self.read)?;
        e.encode_field(&self.created_at)
    }
}

fn encode_rows<T: Tabular>(items: &[T], total: Option<usize>, format: &Format) -> Response {
    let schema = Arc::new(T::TABLE.schema(total.is_some(), format));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            item.encode(&mut encoder)?;
            if let Some(total) = total {
                encoder.encode_field(&(total as i64))?;
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// A write's result: the document as it now stands.
fn one<T: Tabular>(item: &T, format: &Format) -> Response {
    encode_rows(std::slice::from_ref(item), None, format)
}

fn listing<T: Tabular>(page: &Page<T>, format: &Format) -> Response {
    encode_rows(&page.items, Some(page.total), format)
}

/// Result columns for Describe. Must agree with what `run` sends for the
/// same statement once bound.
fn describe(sql: &str, format: &Format) -> Vec<FieldInfo> {
    sql::result_shape(sql)
        .and_then(|shape| Some(Table::named(&shape.table)?.schema(shape.listing, format)))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for BayflowHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        Ok(vec![self.run(&actor, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BayflowQueryParser;

#[async_trait]
impl QueryParser for BayflowQueryParser {
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

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BayflowHandler {
    type Statement = String;
    type QueryParser = BayflowQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        self.run(&actor, &sql, &portal.result_column_format).await
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
        Ok(DescribeStatementResponse::new(param_types, describe(&target.statement, &Format::UnifiedText)))
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
        Ok(DescribePortalResponse::new(describe(
            &target.statement.statement,
            &target.result_column_format,
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
/// Highest index first so `$1` never eats the prefix of `$10`.
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

#[derive(Clone)]
pub struct BayflowFactory {
    handler: Arc<BayflowHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<BayflowAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BayflowFactory {
    pub fn new(workflow: Workflow, staff_password: String, customer_password: String) -> Self {
        let auth_source = BayflowAuthSource::new(staff_password, customer_password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BayflowHandler::new(workflow)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BayflowFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: BayflowFactory,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "P0002",
        ErrorKind::InvalidInput => "22023",
        ErrorKind::InvalidStatus => "22P02",
        ErrorKind::IllegalTransition => "55000",
        ErrorKind::Forbidden => "42501",
        ErrorKind::Conflict => "23505",
        ErrorKind::PartialSuccess => "P0003",
        ErrorKind::Internal => "XX000",
    }
}

/// Message is `<code>: <text>`. A partial success carries a JSON body
/// after the code so clients can tell which writes to retry.
fn workflow_err(e: WorkflowError) -> PgWireError {
    let message = match &e {
        WorkflowError::PartialSuccess {
            committed,
            pending,
            cause,
        } => {
            let detail = serde_json::json!({
                "committed": committed,
                "pending": pending,
                "cause": cause.code(),
                "message": cause.to_string(),
            });
            format!("{}: {detail}", e.code())
        }
        _ => format!("{}: {e}", e.code()),
    };
    user_error(sqlstate(e.kind()), message)
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn { .. } => "42703",
        SqlError::Status(_) => "22P02",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
