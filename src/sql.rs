use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertClinic {
        id: Ulid,
        name: String,
        timezone: Option<String>,
        address: Option<String>,
    },
    InsertProvider {
        id: Ulid,
        clinic_id: Ulid,
        name: String,
        speciality: Option<String>,
    },
    InsertPatient {
        id: Ulid,
        name: String,
        phone: Option<String>,
    },
    InsertService {
        id: Ulid,
        clinic_id: Ulid,
        name: String,
        duration_min: i64,
    },
    InsertAvailability {
        id: Ulid,
        provider_id: Ulid,
        weekday: i64,
        start: String,
        end: String,
    },
    DeleteAvailability {
        id: Ulid,
    },
    /// `start_time` is kept as the caller wrote it; offset handling belongs
    /// to the booking validator.
    InsertAppointment {
        id: Ulid,
        provider_id: Ulid,
        patient_id: Ulid,
        service_id: Ulid,
        start_time: String,
        notes: Option<String>,
    },
    /// Cancels; appointments are never physically removed.
    DeleteAppointment {
        id: Ulid,
    },
    SelectSlots {
        provider_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
    },
    SelectClinics,
    SelectServices {
        clinic_id: Option<Ulid>,
    },
    SelectProviders {
        clinic_id: Option<Ulid>,
    },
    SelectAvailability {
        provider_id: Ulid,
    },
    SelectProviderSchedule {
        provider_id: Ulid,
        date: NaiveDate,
    },
    SelectAppointmentsOn {
        date: NaiveDate,
    },
    SelectMyAppointments,
}

const CLINIC_COLUMNS: &[&str] = &["id", "name", "timezone", "address"];
const PROVIDER_COLUMNS: &[&str] = &["id", "clinic_id", "name", "speciality"];
const PATIENT_COLUMNS: &[&str] = &["id", "name", "phone"];
const SERVICE_COLUMNS: &[&str] = &["id", "clinic_id", "name", "duration_min"];
const AVAILABILITY_COLUMNS: &[&str] = &["id", "provider_id", "weekday", "start_hhmm", "end_hhmm"];
const APPOINTMENT_COLUMNS: &[&str] =
    &["id", "provider_id", "patient_id", "service_id", "start_time", "notes"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [one] => one,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a SELECT reads from, without binding any parameters. Used to
/// describe result columns for prepared statements.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── INSERT ────────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's declared order applies.
struct Row<'a> {
    table: &'static str,
    columns: Vec<String>,
    values: &'a [Expr],
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        declared: &[&str],
        listed: &[ast::Ident],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if listed.is_empty() {
            declared.iter().map(|c| c.to_string()).collect()
        } else {
            listed.iter().map(|i| i.value.to_lowercase()).collect()
        };
        if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn {
                table,
                column: unknown.clone(),
            });
        }
        if values.len() > columns.len() {
            return Err(SqlError::Parse(format!(
                "{table}: {} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        Ok(Self { table, columns, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn {
            table: self.table,
            column,
        })
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid(self.required(column)?)
    }

    fn text(&self, column: &'static str) -> Result<String, SqlError> {
        parse_text(self.required(column)?)?.ok_or(SqlError::MissingColumn {
            table: self.table,
            column,
        })
    }

    fn optional_text(&self, column: &str) -> Result<Option<String>, SqlError> {
        match self.get(column) {
            Some(expr) => parse_text(expr),
            None => Ok(None),
        }
    }

    fn int(&self, column: &'static str) -> Result<i64, SqlError> {
        parse_i64(self.required(column)?)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = single_insert_row(insert)?;
    let row = |name: &'static str, declared: &'static [&'static str]| Row::new(name, declared, &insert.columns, values);

    match table.as_str() {
        "clinics" => {
            let r = row("clinics", CLINIC_COLUMNS)?;
            Ok(Command::InsertClinic {
                id: r.ulid("id")?,
                name: r.text("name")?,
                timezone: r.optional_text("timezone")?,
                address: r.optional_text("address")?,
            })
        }
        "providers" => {
            let r = row("providers", PROVIDER_COLUMNS)?;
            Ok(Command::InsertProvider {
                id: r.ulid("id")?,
                clinic_id: r.ulid("clinic_id")?,
                name: r.text("name")?,
                speciality: r.optional_text("speciality")?,
            })
        }
        "patients" => {
            let r = row("patients", PATIENT_COLUMNS)?;
            Ok(Command::InsertPatient {
                id: r.ulid("id")?,
                name: r.text("name")?,
                phone: r.optional_text("phone")?,
            })
        }
        "services" => {
            let r = row("services", SERVICE_COLUMNS)?;
            Ok(Command::InsertService {
                id: r.ulid("id")?,
                clinic_id: r.ulid("clinic_id")?,
                name: r.text("name")?,
                duration_min: r.int("duration_min")?,
            })
        }
        "availability" => {
            let r = row("availability", AVAILABILITY_COLUMNS)?;
            Ok(Command::InsertAvailability {
                id: r.ulid("id")?,
                provider_id: r.ulid("provider_id")?,
                weekday: r.int("weekday")?,
                start: r.text("start_hhmm")?,
                end: r.text("end_hhmm")?,
            })
        }
        "appointments" => {
            let r = row("appointments", APPOINTMENT_COLUMNS)?;
            Ok(Command::InsertAppointment {
                id: r.ulid("id")?,
                provider_id: r.ulid("provider_id")?,
                patient_id: r.ulid("patient_id")?,
                service_id: r.ulid("service_id")?,
                start_time: r.text("start_time")?,
                notes: r.optional_text("notes")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = Filters::from_selection(delete.selection.as_ref())?;
    let id = filters.ulid("id")?;
    let cmd = match table.as_str() {
        "availability" => Command::DeleteAvailability { id },
        "appointments" => Command::DeleteAppointment { id },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(cmd)
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let mut f = Filters::from_selection(select.selection.as_ref())?;

    let cmd = match table.as_str() {
        "slots" => Command::SelectSlots {
            provider_id: f.ulid("provider_id")?,
            service_id: f.ulid("service_id")?,
            date: f.date("date")?,
        },
        "clinics" => Command::SelectClinics,
        "services" => Command::SelectServices {
            clinic_id: f.optional_ulid("clinic_id")?,
        },
        "providers" => Command::SelectProviders {
            clinic_id: f.optional_ulid("clinic_id")?,
        },
        "availability" => Command::SelectAvailability {
            provider_id: f.ulid("provider_id")?,
        },
        "appointments" => {
            let date = f.date("date")?;
            match f.optional_ulid("provider_id")? {
                Some(provider_id) => Command::SelectProviderSchedule { provider_id, date },
                None => Command::SelectAppointmentsOn { date },
            }
        }
        "my_appointments" => Command::SelectMyAppointments,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    f.finish()?;
    Ok(cmd)
}

/// `col = value` terms of a WHERE clause joined by AND.
struct Filters(Vec<(String, Expr)>);

impl Filters {
    fn from_selection(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_equalities(expr, &mut terms)?;
        }
        Ok(Self(terms))
    }

    fn take(&mut self, column: &str) -> Option<Expr> {
        let i = self.0.iter().position(|(c, _)| c == column)?;
        Some(self.0.remove(i).1)
    }

    fn ulid(&mut self, column: &'static str) -> Result<Ulid, SqlError> {
        let expr = self.take(column).ok_or(SqlError::MissingFilter(column))?;
        parse_ulid(&expr)
    }

    fn optional_ulid(&mut self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.take(column).map(|e| parse_ulid(&e)).transpose()
    }

    fn date(&mut self, column: &'static str) -> Result<NaiveDate, SqlError> {
        let expr = self.take(column).ok_or(SqlError::MissingFilter(column))?;
        parse_date(&expr)
    }

    /// Anything left over was not understood for this table.
    fn finish(self) -> Result<(), SqlError> {
        match self.0.into_iter().next() {
            Some((column, _)) => Err(SqlError::UnexpectedFilter(column)),
            None => Ok(()),
        }
    }
}

fn collect_equalities(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right.as_ref().clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
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

fn single_insert_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
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

fn bad(what: &'static str, expr: &Expr) -> SqlError {
    SqlError::BadLiteral {
        what,
        value: expr.to_string(),
    }
}

/// String literal, NULL as `None`. Bare numbers are accepted as text.
fn parse_text(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        _ => Err(bad("text", expr)),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s.trim()).map_err(|_| bad("ULID", expr))
        }
        _ => Err(bad("ULID", expr)),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr: inner,
    } = expr
    {
        return parse_i64(inner).map(|v| -v);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => {
            s.trim().parse().map_err(|_| bad("integer", expr))
        }
        _ => Err(bad("integer", expr)),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| bad("date", expr))
        }
        _ => Err(bad("date", expr)),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("query longer than {} bytes", MAX_SQL_LEN)]
    TooLong,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{table}: unknown column {column}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("{table}: missing value for {column}")]
    MissingColumn { table: &'static str, column: &'static str },
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("unexpected filter: {0}")]
    UnexpectedFilter(String),
    #[error("bad {what} literal: {value}")]
    BadLiteral { what: &'static str, value: String },
}
