use chrono::NaiveDate;
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertTool {
        id: Ulid,
        name: String,
        quantity: u32,
        condition: ToolCondition,
        category_id: Option<Ulid>,
    },
    UpdateTool {
        id: Ulid,
        name: String,
        condition: ToolCondition,
        category_id: Option<Ulid>,
    },
    DeleteTool {
        id: Ulid,
    },
    SetMaintenance {
        tool_id: Ulid,
        on: bool,
    },
    InsertUser {
        id: Ulid,
        name: String,
        role: Role,
        department: Option<String>,
    },
    InsertAllocation {
        id: Ulid,
        tool_id: Ulid,
        user_id: Ulid,
        window: DateWindow,
    },
    InsertReturn {
        allocation_id: Ulid,
    },
    InsertReturnRequest {
        allocation_id: Ulid,
    },
    DeleteReturnRequest {
        allocation_id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        tool_id: Ulid,
        user_id: Ulid,
        window: DateWindow,
        recurrence: Option<Recurrence>,
    },
    DeleteReservation {
        id: Ulid,
    },
    ApproveReservation {
        reservation_id: Ulid,
    },
    ConfirmReservation {
        reservation_id: Ulid,
    },
    DeclineReservation {
        reservation_id: Ulid,
    },
    Activate {
        as_of: Option<NaiveDate>,
    },
    SelectAvailability {
        tool_id: Ulid,
        window: Option<DateWindow>,
    },
    SelectTools {
        id: Option<Ulid>,
    },
    SelectAllocations {
        tool_id: Option<Ulid>,
    },
    SelectReservations {
        tool_id: Option<Ulid>,
    },
    SelectUsers,
    SelectOverdue {
        as_of: Option<NaiveDate>,
    },
    SelectDashboard {
        as_of: Option<NaiveDate>,
    },
}

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

/// One VALUES row, addressed by column name when the INSERT lists columns,
/// otherwise by position.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn get(&self, name: &str, position: usize) -> Option<&'a Expr> {
        if self.columns.is_empty() {
            return self.values.get(position);
        }
        let i = self.columns.iter().position(|c| c == name)?;
        self.values.get(i)
    }

    fn required(&self, name: &'static str, position: usize) -> Result<&'a Expr, SqlError> {
        self.get(name, position)
            .ok_or(SqlError::MissingColumn(self.table, name))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if !columns.is_empty() && columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    let row = |table: &'static str| Row {
        table,
        columns: columns.clone(),
        values: &values,
    };

    match table.as_str() {
        "tools" => {
            let r = row("tools");
            Ok(Command::InsertTool {
                id: parse_ulid(r.required("id", 0)?)?,
                name: parse_text(r.required("name", 1)?)?,
                quantity: match r.get("quantity", 2) {
                    Some(e) => parse_u32(e)?,
                    None => 1,
                },
                condition: match r.get("condition", 3) {
                    Some(e) => parse_condition(e)?,
                    None => ToolCondition::Good,
                },
                category_id: r.get("category_id", 4).map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        "tool_updates" => {
            let r = row("tool_updates");
            Ok(Command::UpdateTool {
                id: parse_ulid(r.required("id", 0)?)?,
                name: parse_text(r.required("name", 1)?)?,
                condition: parse_condition(r.required("condition", 2)?)?,
                category_id: r.get("category_id", 3).map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        "maintenance" => {
            let r = row("maintenance");
            Ok(Command::SetMaintenance {
                tool_id: parse_ulid(r.required("tool_id", 0)?)?,
                on: true,
            })
        }
        "users" => {
            let r = row("users");
            Ok(Command::InsertUser {
                id: parse_ulid(r.required("id", 0)?)?,
                name: parse_text(r.required("name", 1)?)?,
                role: match r.get("role", 2) {
                    Some(e) => parse_text(e)?.parse().map_err(SqlError::InvalidValue)?,
                    None => Role::Member,
                },
                department: r.get("department", 3).map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "allocations" => {
            let r = row("allocations");
            Ok(Command::InsertAllocation {
                id: parse_ulid(r.required("id", 0)?)?,
                tool_id: parse_ulid(r.required("tool_id", 1)?)?,
                user_id: parse_ulid(r.required("user_id", 2)?)?,
                window: parse_window(
                    r.required("borrow_date", 3)?,
                    r.required("expected_return_date", 4)?,
                )?,
            })
        }
        "returns" => Ok(Command::InsertReturn {
            allocation_id: parse_ulid(row("returns").required("allocation_id", 0)?)?,
        }),
        "return_requests" => Ok(Command::InsertReturnRequest {
            allocation_id: parse_ulid(row("return_requests").required("allocation_id", 0)?)?,
        }),
        "reservations" => {
            let r = row("reservations");
            let recurrence = match r.get("recurrence", 5).map(parse_text_or_null).transpose()?.flatten() {
                Some(json) => Some(
                    serde_json::from_str::<Recurrence>(&json)
                        .map_err(|e| SqlError::InvalidValue(format!("bad recurrence: {e}")))?,
                ),
                None => None,
            };
            Ok(Command::InsertReservation {
                id: parse_ulid(r.required("id", 0)?)?,
                tool_id: parse_ulid(r.required("tool_id", 1)?)?,
                user_id: parse_ulid(r.required("user_id", 2)?)?,
                window: parse_window(r.required("start_date", 3)?, r.required("end_date", 4)?)?,
                recurrence,
            })
        }
        "approvals" => Ok(Command::ApproveReservation {
            reservation_id: parse_ulid(row("approvals").required("reservation_id", 0)?)?,
        }),
        "confirmations" => Ok(Command::ConfirmReservation {
            reservation_id: parse_ulid(row("confirmations").required("reservation_id", 0)?)?,
        }),
        "declines" => Ok(Command::DeclineReservation {
            reservation_id: parse_ulid(row("declines").required("reservation_id", 0)?)?,
        }),
        "activations" => Ok(Command::Activate {
            as_of: row("activations").get("as_of", 0).map(parse_date_or_null).transpose()?.flatten(),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = collect_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "tools" => Ok(Command::DeleteTool {
            id: required_eq(&filters, "id")?,
        }),
        "maintenance" => Ok(Command::SetMaintenance {
            tool_id: required_eq(&filters, "tool_id")?,
            on: false,
        }),
        "return_requests" => Ok(Command::DeleteReturnRequest {
            allocation_id: required_eq(&filters, "allocation_id")?,
        }),
        "reservations" => Ok(Command::DeleteReservation {
            id: required_eq(&filters, "id")?,
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
    let filters = collect_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => {
            let tool_id = required_eq(&filters, "tool_id")?;
            let start = find_filter(&filters, "start_date", &[BinaryOperator::GtEq, BinaryOperator::Eq]);
            let end = find_filter(&filters, "end_date", &[BinaryOperator::LtEq, BinaryOperator::Eq]);
            let window = match (start, end) {
                (Some(s), Some(e)) => Some(parse_window(s, e)?),
                (None, None) => None,
                (Some(_), None) => return Err(SqlError::MissingFilter("end_date")),
                (None, Some(_)) => return Err(SqlError::MissingFilter("start_date")),
            };
            Ok(Command::SelectAvailability { tool_id, window })
        }
        "tools" => Ok(Command::SelectTools {
            id: optional_eq(&filters, "id")?,
        }),
        "allocations" => Ok(Command::SelectAllocations {
            tool_id: optional_eq(&filters, "tool_id")?,
        }),
        "reservations" => Ok(Command::SelectReservations {
            tool_id: optional_eq(&filters, "tool_id")?,
        }),
        "users" => Ok(Command::SelectUsers),
        "overdue" => Ok(Command::SelectOverdue {
            as_of: find_filter(&filters, "as_of", &[BinaryOperator::Eq]).map(parse_date).transpose()?,
        }),
        "dashboard" => Ok(Command::SelectDashboard {
            as_of: find_filter(&filters, "as_of", &[BinaryOperator::Eq]).map(parse_date).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// `column <op> value` terms of an AND-chain.
type Filter = (String, BinaryOperator, Expr);

fn collect_filters(selection: Option<&Expr>) -> Result<Vec<Filter>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        push_filters(expr, &mut out)?;
    }
    Ok(out)
}

fn push_filters(expr: &Expr, out: &mut Vec<Filter>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => push_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            push_filters(left, out)?;
            push_filters(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, op.clone(), (**right).clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn find_filter<'a>(filters: &'a [Filter], column: &str, ops: &[BinaryOperator]) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|(c, op, _)| c == column && ops.contains(op))
        .map(|(_, _, value)| value)
}

fn required_eq(filters: &[Filter], column: &'static str) -> Result<Ulid, SqlError> {
    let value = find_filter(filters, column, &[BinaryOperator::Eq]).ok_or(SqlError::MissingFilter(column))?;
    parse_ulid(value)
}

fn optional_eq(filters: &[Filter], column: &str) -> Result<Option<Ulid>, SqlError> {
    find_filter(filters, column, &[BinaryOperator::Eq])
        .map(parse_ulid)
        .transpose()
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
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::InvalidValue(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => Ok(-parse_i64(expr)?),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of range")))
}

/// `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_text(expr)?;
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::InvalidValue(format!("bad date {text}: {e}")))
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_date(expr).map(Some)
}

fn parse_window(start: &Expr, end: &Expr) -> Result<DateWindow, SqlError> {
    let (start, end) = (parse_date(start)?, parse_date(end)?);
    DateWindow::try_new(start, end)
        .ok_or_else(|| SqlError::InvalidValue(format!("window ends {end}, before it starts {start}")))
}

fn parse_condition(expr: &Expr) -> Result<ToolCondition, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::InvalidValue)
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
    #[error("{0}: {1} columns but {2} values")]
    WrongArity(String, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed SQL carrying a value the domain rejects.
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
