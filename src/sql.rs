use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;
use crate::service::{
    AppointmentFilter, BayFilter, BayUpdate, NewAppointment, NewBay, NewProgress, ProgressFilter, ProgressUpdate,
};

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    BookAppointment(NewAppointment),
    SelectAppointments {
        filter: AppointmentFilter,
        page: PageRequest,
    },
    GetAppointment {
        id: Ulid,
    },
    SetAppointmentStatus {
        id: Ulid,
        status: String,
        note: Option<String>,
    },
    InsertBay(NewBay),
    SelectBays {
        filter: BayFilter,
        page: PageRequest,
    },
    GetBay {
        id: Ulid,
    },
    UpdateBay {
        id: Ulid,
        update: BayUpdate,
    },
    DeleteBay {
        id: Ulid,
    },
    InsertProgress(NewProgress),
    SelectProgress {
        filter: ProgressFilter,
        page: PageRequest,
    },
    UpdateProgress {
        id: Ulid,
        update: ProgressUpdate,
    },
    DeleteProgress {
        id: Ulid,
    },
    SelectNotifications {
        page: PageRequest,
    },
    MarkNotificationRead {
        id: Ulid,
    },
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.len() {
        0 => Err(SqlError::Empty),
        1 => Ok(stmts.remove(0)),
        _ => Err(SqlError::Unsupported("one statement per query".into())),
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match &parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The rows a statement will send back, worked out before its `$n`
/// parameters are bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultShape {
    pub table: String,
    /// Listings carry a page of rows plus a total; everything else returns
    /// the one document it read or wrote.
    pub listing: bool,
}

pub fn result_shape(sql: &str) -> Option<ResultShape> {
    let (table, listing) = match &parse_statement(sql).ok()? {
        Statement::Insert(insert) => (insert_table_name(insert).ok()?, false),
        Statement::Update { table, .. } => (table_factor_name(&table.relation).ok()?, false),
        Statement::Delete(delete) => (delete_table_name(delete).ok()?, false),
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            let table = table_factor_name(&select.from.first()?.relation).ok()?;
            let mut conds = Vec::new();
            if let Some(selection) = &select.selection {
                conjuncts(selection, &mut conds).ok()?;
            }
            let listing = !reads_by_id(&table, &conds);
            (table, listing)
        }
        _ => return None,
    };
    Some(ResultShape { table, listing })
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let mut row = insert_row(&table, insert)?;

    let cmd = match table.as_str() {
        "appointments" => Command::BookAppointment(NewAppointment {
            id: row.take("id").map(|e| parse_ulid_expr(&e)).transpose()?,
            kind: parse_text(&row.require("kind")?)?.parse()?,
            subject_id: parse_ulid_expr(&row.require("subject_id")?)?,
            scheduled_date: parse_date(&row.require("scheduled_date")?)?,
            time_slot: row.take_map("time_slot", parse_text_or_null)?,
            customer_name: parse_text(&row.require("customer_name")?)?,
            customer_email: parse_text(&row.require("customer_email")?)?,
            customer_phone: row.take_map("customer_phone", parse_text_or_null)?,
        }),
        "bays" => Command::InsertBay(NewBay {
            id: row.take("id").map(|e| parse_ulid_expr(&e)).transpose()?,
            number: parse_u32(&row.require("number")?)?,
            notes: row.take_map("notes", parse_text_or_null)?,
            last_maintenance: row.take_map("last_maintenance", parse_i64_or_null)?,
        }),
        "repair_progress" => Command::InsertProgress(NewProgress {
            id: row.take("id").map(|e| parse_ulid_expr(&e)).transpose()?,
            appointment_id: parse_ulid_expr(&row.require("appointment_id")?)?,
            status: parse_text(&row.require("status")?)?,
            notes: row.take_map("notes", parse_text_or_null)?,
            estimated_completion: row.take_map("estimated_completion", parse_i64_or_null)?,
        }),
        _ => return Err(SqlError::UnknownTable(table)),
    };
    row.finish()?;
    Ok(cmd)
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut cells = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        cells.push((column, assignment.value.clone()));
    }
    let mut row = Row {
        table: table.clone(),
        cells,
    };

    let cmd = match table.as_str() {
        "appointments" => Command::SetAppointmentStatus {
            id,
            status: parse_text(&row.require("status")?)?,
            note: row.take_map("note", parse_text_or_null)?,
        },
        "bays" => Command::UpdateBay {
            id,
            update: BayUpdate {
                status: row.take("status").map(|e| parse_status(&e)).transpose()?,
                // NULL clears the occupant, absent leaves it alone
                current_booking: row
                    .take("current_booking")
                    .map(|e| parse_ulid_or_null(&e))
                    .transpose()?,
                last_maintenance: row.take_map("last_maintenance", parse_i64_or_null)?,
                notes: row.take_map("notes", parse_text_or_null)?,
            },
        },
        "repair_progress" => Command::UpdateProgress {
            id,
            update: ProgressUpdate {
                status: row.take_map("status", parse_text_or_null)?,
                notes: row.take_map("notes", parse_text_or_null)?,
                estimated_completion: row.take_map("estimated_completion", parse_i64_or_null)?,
                free_bay: row.take("free_bay").map(|e| parse_bool(&e)).transpose()?.unwrap_or(false),
            },
        },
        "notifications" => {
            if !parse_bool(&row.require("read")?)? {
                return Err(SqlError::Unsupported("notifications cannot be marked unread".into()));
            }
            Command::MarkNotificationRead { id }
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    row.finish()?;
    Ok(cmd)
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bays" => Ok(Command::DeleteBay { id }),
        "repair_progress" => Ok(Command::DeleteProgress { id }),
        _ => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut conds = Vec::new();
    if let Some(selection) = &select.selection {
        conjuncts(selection, &mut conds)?;
    }
    let page = take_page(&mut conds)?;

    let cmd = match table.as_str() {
        "appointments" => {
            if reads_by_id(&table, &conds) {
                let id = take_id(&mut conds)?;
                no_more(&table, conds)?;
                return Ok(Command::GetAppointment { id });
            }
            let mut filter = AppointmentFilter::default();
            for cond in conds {
                match cond {
                    Cond::Eq(col, e) if col == "status" => filter.status = Some(parse_text(&e)?.parse()?),
                    Cond::Eq(col, e) if col == "scheduled_date" => {
                        let date = parse_date(&e)?;
                        filter.date_from = Some(date);
                        filter.date_to = Some(date);
                    }
                    Cond::Ge(col, e) if col == "scheduled_date" => filter.date_from = Some(parse_date(&e)?),
                    Cond::Le(col, e) if col == "scheduled_date" => filter.date_to = Some(parse_date(&e)?),
                    Cond::Like(col, e) | Cond::Eq(col, e) if col == "customer" => {
                        filter.customer = Some(like_needle(&parse_text(&e)?));
                    }
                    other => return Err(unsupported_filter(&table, &other)),
                }
            }
            Command::SelectAppointments { filter, page }
        }
        "bays" => {
            if reads_by_id(&table, &conds) {
                let id = take_id(&mut conds)?;
                no_more(&table, conds)?;
                return Ok(Command::GetBay { id });
            }
            let mut filter = BayFilter::default();
            for cond in conds {
                match cond {
                    Cond::Eq(col, e) if col == "status" => filter.status = Some(parse_text(&e)?.parse()?),
                    other => return Err(unsupported_filter(&table, &other)),
                }
            }
            Command::SelectBays { filter, page }
        }
        "repair_progress" => {
            let mut filter = ProgressFilter::default();
            for cond in conds {
                match cond {
                    Cond::Eq(col, e) if col == "appointment_id" => {
                        filter.appointment_id = Some(parse_ulid_expr(&e)?)
                    }
                    Cond::Eq(col, e) if col == "status" => filter.status = Some(parse_text(&e)?.parse()?),
                    other => return Err(unsupported_filter(&table, &other)),
                }
            }
            Command::SelectProgress { filter, page }
        }
        "notifications" => {
            no_more(&table, conds)?;
            Command::SelectNotifications { page }
        }
        _ => return Err(SqlError::UnknownTable(table)),
    };
    Ok(cmd)
}

/// One comparison out of an AND-only WHERE clause.
#[derive(Debug)]
enum Cond {
    Eq(String, Expr),
    Ge(String, Expr),
    Le(String, Expr),
    Like(String, Expr),
}

impl Cond {
    fn column(&self) -> &str {
        match self {
            Cond::Eq(c, _) | Cond::Ge(c, _) | Cond::Le(c, _) | Cond::Like(c, _) => c,
        }
    }
}

fn conjuncts(expr: &Expr, out: &mut Vec<Cond>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => conjuncts(inner, out),
        Expr::BinaryOp { left, op, right } => {
            if *op == ast::BinaryOperator::And {
                conjuncts(left, out)?;
                return conjuncts(right, out);
            }
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("WHERE {expr}")))?;
            let value = right.as_ref().clone();
            match op {
                ast::BinaryOperator::Eq => out.push(Cond::Eq(col, value)),
                ast::BinaryOperator::GtEq => out.push(Cond::Ge(col, value)),
                ast::BinaryOperator::LtEq => out.push(Cond::Le(col, value)),
                _ => return Err(SqlError::Unsupported(format!("WHERE {expr}"))),
            }
            Ok(())
        }
        Expr::Like {
            negated: false,
            expr: left,
            pattern,
            ..
        }
        | Expr::ILike {
            negated: false,
            expr: left,
            pattern,
            ..
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("WHERE {expr}")))?;
            out.push(Cond::Like(col, pattern.as_ref().clone()));
            Ok(())
        }
        _ => Err(SqlError::Unsupported(format!("WHERE {expr}"))),
    }
}

fn take_page(conds: &mut Vec<Cond>) -> Result<PageRequest, SqlError> {
    let mut page = PageRequest::default();
    let mut rest = Vec::with_capacity(conds.len());
    for cond in conds.drain(..) {
        match cond {
            Cond::Eq(col, e) if col == "page" => page.page = parse_u32(&e)?,
            Cond::Eq(col, e) if col == "page_size" => page.page_size = parse_u32(&e)?,
            other => rest.push(other),
        }
    }
    *conds = rest;
    Ok(page)
}

fn is_id_match(cond: &Cond) -> bool {
    matches!(cond, Cond::Eq(col, _) if col == "id")
}

/// Appointments and bays can be read one at a time by `id = ..`.
fn reads_by_id(table: &str, conds: &[Cond]) -> bool {
    matches!(table, "appointments" | "bays") && conds.iter().any(is_id_match)
}

fn take_id(conds: &mut Vec<Cond>) -> Result<Ulid, SqlError> {
    match conds.iter().position(is_id_match).map(|pos| conds.remove(pos)) {
        Some(Cond::Eq(_, e)) => parse_ulid_expr(&e),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn no_more(table: &str, conds: Vec<Cond>) -> Result<(), SqlError> {
    match conds.first() {
        Some(cond) => Err(unsupported_filter(table, cond)),
        None => Ok(()),
    }
}

fn unsupported_filter(table: &str, cond: &Cond) -> SqlError {
    SqlError::UnknownColumn {
        table: table.to_string(),
        column: cond.column().to_string(),
    }
}

/// `'%tom%'` searches for `tom`.
fn like_needle(pattern: &str) -> String {
    pattern.trim_matches('%').to_string()
}

// ── Column/value rows ─────────────────────────────────────────

/// Named cells of an INSERT row or an UPDATE's SET list. Every cell must
/// be consumed; a leftover one is an unknown column.
struct Row {
    table: String,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn take(&mut self, column: &str) -> Option<Expr> {
        let pos = self.cells.iter().position(|(c, _)| c == column)?;
        Some(self.cells.remove(pos).1)
    }

    fn require(&mut self, column: &'static str) -> Result<Expr, SqlError> {
        self.take(column).ok_or(SqlError::MissingColumn(column))
    }

    /// Parse a nullable column if present. Absent and NULL both yield `None`.
    fn take_map<T>(
        &mut self,
        column: &str,
        parse: fn(&Expr) -> Result<Option<T>, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.take(column) {
            Some(e) => parse(&e),
            None => Ok(None),
        }
    }

    fn finish(self) -> Result<(), SqlError> {
        match self.cells.into_iter().next() {
            Some((column, _)) => Err(SqlError::UnknownColumn {
                table: self.table,
                column,
            }),
            None => Ok(()),
        }
    }
}

fn insert_row(table: &str, insert: &ast::Insert) -> Result<Row, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse(format!("INSERT INTO {table} needs a column list")));
    }
    let values = extract_insert_values(insert)?;
    if values.len() != insert.columns.len() {
        return Err(SqlError::WrongArity {
            columns: insert.columns.len(),
            values: values.len(),
        });
    }
    let cells = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .zip(values)
        .collect();
    Ok(Row {
        table: table.to_string(),
        cells,
    })
}

// ── Helpers ───────────────────────────────────────────────────

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

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("expected ULID, got NULL".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match parse_text_or_null(expr)? {
        Some(s) => Ulid::from_string(&s)
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))),
        None => Ok(None),
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    parse_text_or_null(expr)?.ok_or_else(|| SqlError::Parse("expected text, got NULL".into()))
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_status<T>(expr: &Expr) -> Result<T, SqlError>
where
    T: std::str::FromStr<Err = UnknownStatus>,
{
    Ok(parse_text(expr)?.parse()?)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_text(expr)?;
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {text:?} (want YYYY-MM-DD): {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
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

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_i64_expr(expr).map(Some),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{table}: unknown or unsupported column {column}")]
    UnknownColumn { table: String, column: String },
    #[error("{columns} columns but {values} values")]
    WrongArity { columns: usize, values: usize },
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error(transparent)]
    Status(#[from] UnknownStatus),
}
