use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking {
        id: Ulid,
        facility_id: FacilityId,
        slot: Slot,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertApproval {
        id: Ulid,
    },
    DeleteWaitlist {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectWaitlist {
        user_id: Option<String>,
    },
    SelectFacilities,
    SelectAvailability {
        facility_id: FacilityId,
        date: NaiveDate,
        window: Option<(NaiveTime, NaiveTime)>,
    },
}

/// Row selection for `SELECT ... FROM bookings`.
#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    /// The session user's own bookings.
    Own,
    User(String),
    Day { facility_id: FacilityId, date: NaiveDate },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "bookings" => {
            let row = values_by_column(insert, &values, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                id: parse_ulid_expr(row[0])?,
                facility_id: parse_ulid_expr(row[1])?,
                slot: Slot::new(
                    parse_date_expr(row[2])?,
                    parse_time_expr(row[3])?,
                    parse_time_expr(row[4])?,
                ),
            })
        }
        "approvals" => {
            let row = values_by_column(insert, &values, "approvals", &["id"])?;
            Ok(Command::InsertApproval {
                id: parse_ulid_expr(row[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

const BOOKING_COLUMNS: &[&str] = &["id", "facility_id", "date", "start", "end"];

/// Row values reordered to `expected`. Without a column list the values must
/// already come in that order.
fn values_by_column<'a>(
    insert: &ast::Insert,
    values: &'a [Expr],
    table: &'static str,
    expected: &[&'static str],
) -> Result<Vec<&'a Expr>, SqlError> {
    if values.len() != expected.len() {
        return Err(SqlError::WrongArity(table, expected.len(), values.len()));
    }
    if insert.columns.is_empty() {
        return Ok(values.iter().collect());
    }
    if insert.columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
    }
    let names: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if let Some(unknown) = names.iter().find(|n| !expected.iter().any(|e| *e == n.as_str())) {
        return Err(SqlError::Unsupported(format!("column {unknown} in {table}")));
    }
    expected
        .iter()
        .map(|col| {
            names
                .iter()
                .position(|n| n.as_str() == *col)
                .map(|i| &values[i])
                .ok_or(SqlError::MissingColumn(*col))
        })
        .collect()
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "bookings" => Ok(Command::DeleteBooking { id }),
        "waitlist" => Ok(Command::DeleteWaitlist { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality and range filters collected from a WHERE clause.
#[derive(Default)]
struct Filters {
    user_id: Option<String>,
    facility_id: Option<Ulid>,
    date: Option<NaiveDate>,
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "bookings" => {
            let filter = match (filters.user_id, filters.facility_id, filters.date) {
                (Some(user), _, _) => BookingFilter::User(user),
                (None, Some(facility_id), Some(date)) => BookingFilter::Day { facility_id, date },
                (None, Some(_), None) => return Err(SqlError::MissingFilter("date")),
                (None, None, Some(_)) => return Err(SqlError::MissingFilter("facility_id")),
                (None, None, None) => BookingFilter::Own,
            };
            Ok(Command::SelectBookings { filter })
        }
        "waitlist" => Ok(Command::SelectWaitlist {
            user_id: filters.user_id,
        }),
        "facilities" => Ok(Command::SelectFacilities),
        "availability" => {
            let window = match (filters.start, filters.end) {
                (Some(start), Some(end)) => Some((start, end)),
                (None, None) => None,
                (Some(_), None) => return Err(SqlError::MissingFilter("end")),
                (None, Some(_)) => return Err(SqlError::MissingFilter("start")),
            };
            Ok(Command::SelectAvailability {
                facility_id: filters.facility_id.ok_or(SqlError::MissingFilter("facility_id"))?,
                date: filters.date.ok_or(SqlError::MissingFilter("date"))?,
                window,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("user_id") => filters.user_id = Some(parse_string_expr(right)?),
                Some("facility_id") => filters.facility_id = Some(parse_ulid_expr(right)?),
                Some("date") => filters.date = Some(parse_date_expr(right)?),
                Some(other) => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                None => return Err(SqlError::Parse(format!("expected column, got {left}"))),
            },
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_time_expr(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_time_expr(right)?);
                }
            }
            other => return Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
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

/// First VALUES row; one request per statement.
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

/// `'YYYY-MM-DD'`.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

/// `'HH:MM'` or `'HH:MM:SS'`.
fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveTime::parse_from_str(&s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const LAB: &str = "01HV4Z7T00000000000000FAC1";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            r#"INSERT INTO bookings (id, facility_id, date, start, "end") VALUES ('{ID}', '{LAB}', '2030-03-04', '09:00', '10:30')"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertBooking { id, facility_id, slot } => {
                assert_eq!(id.to_string(), ID);
                assert_eq!(facility_id.to_string(), LAB);
                assert_eq!(slot, Slot::new(date(2030, 3, 4), time(9, 0), time(10, 30)));
            }
            _ => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_with_seconds() {
        let sql = format!(
            r#"INSERT INTO bookings (id, facility_id, date, start, "end") VALUES ('{ID}', '{LAB}', '2030-03-04', '09:00:00', '09:45:30')"#
        );
        let Command::InsertBooking { slot, .. } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertBooking");
        };
        assert_eq!(slot.end, NaiveTime::from_hms_opt(9, 45, 30).unwrap());
    }

    #[test]
    fn parse_insert_booking_wrong_arity() {
        let sql = format!("INSERT INTO bookings (id, facility_id) VALUES ('{ID}', '{LAB}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("bookings", 5, 2))));
    }

    #[test]
    fn parse_insert_booking_columns_by_name() {
        let sql = format!(
            r#"INSERT INTO bookings (facility_id, "end", start, date, id) VALUES ('{LAB}', '10:30', '09:00', '2030-03-04', '{ID}')"#
        );
        let Command::InsertBooking { id, facility_id, slot } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertBooking");
        };
        assert_eq!(id.to_string(), ID);
        assert_eq!(facility_id.to_string(), LAB);
        assert_eq!(slot, Slot::new(date(2030, 3, 4), time(9, 0), time(10, 30)));
    }

    #[test]
    fn parse_insert_booking_without_column_list() {
        let sql = format!("INSERT INTO bookings VALUES ('{ID}', '{LAB}', '2030-03-04', '09:00', '10:30')");
        let Command::InsertBooking { id, .. } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertBooking");
        };
        assert_eq!(id.to_string(), ID);
    }

    #[test]
    fn parse_insert_booking_unknown_or_repeated_column() {
        let unknown = format!(
            r#"INSERT INTO bookings (id, room, date, start, "end") VALUES ('{ID}', '{LAB}', '2030-03-04', '09:00', '10:30')"#
        );
        assert!(matches!(parse_sql(&unknown), Err(SqlError::Unsupported(_))));
        let repeated = format!(
            r#"INSERT INTO bookings (id, id, date, start, "end") VALUES ('{ID}', '{LAB}', '2030-03-04', '09:00', '10:30')"#
        );
        assert!(matches!(parse_sql(&repeated), Err(SqlError::MissingColumn("facility_id"))));
    }

    #[test]
    fn parse_insert_booking_bad_date() {
        let sql = format!(
            r#"INSERT INTO bookings (id, facility_id, date, start, "end") VALUES ('{ID}', '{LAB}', '2030-02-30', '09:00', '10:00')"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_multi_row_insert_rejected() {
        let sql = format!("INSERT INTO approvals (id) VALUES ('{ID}'), ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_insert_approval() {
        let sql = format!("INSERT INTO approvals (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertApproval { .. }));
    }

    #[test]
    fn parse_deletes() {
        let cmd = parse_sql(&format!("DELETE FROM bookings WHERE id = '{ID}'")).unwrap();
        assert_eq!(cmd, Command::DeleteBooking { id: Ulid::from_string(ID).unwrap() });
        let cmd = parse_sql(&format!("DELETE FROM waitlist WHERE id = '{ID}'")).unwrap();
        assert_eq!(cmd, Command::DeleteWaitlist { id: Ulid::from_string(ID).unwrap() });
    }

    #[test]
    fn parse_delete_requires_id() {
        assert!(matches!(
            parse_sql("DELETE FROM bookings"),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(matches!(
            parse_sql("DELETE FROM bookings WHERE user_id = 'alice'"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_select_bookings_filters() {
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings { filter: BookingFilter::Own }
        );
        assert_eq!(
            parse_sql("SELECT * FROM bookings WHERE user_id = 'bob'").unwrap(),
            Command::SelectBookings { filter: BookingFilter::User("bob".into()) }
        );
        let cmd = parse_sql(&format!(
            "SELECT * FROM bookings WHERE facility_id = '{LAB}' AND date = '2030-03-04'"
        ))
        .unwrap();
        assert_eq!(
            cmd,
            Command::SelectBookings {
                filter: BookingFilter::Day {
                    facility_id: Ulid::from_string(LAB).unwrap(),
                    date: date(2030, 3, 4),
                }
            }
        );
        assert!(matches!(
            parse_sql(&format!("SELECT * FROM bookings WHERE facility_id = '{LAB}'")),
            Err(SqlError::MissingFilter("date"))
        ));
    }

    #[test]
    fn parse_select_waitlist_and_facilities() {
        assert_eq!(
            parse_sql("SELECT * FROM waitlist").unwrap(),
            Command::SelectWaitlist { user_id: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM waitlist WHERE user_id = 'carol'").unwrap(),
            Command::SelectWaitlist { user_id: Some("carol".into()) }
        );
        assert_eq!(parse_sql("SELECT * FROM facilities").unwrap(), Command::SelectFacilities);
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            "SELECT * FROM availability WHERE facility_id = '{LAB}' AND date = '2030-03-04' AND start >= '08:00' AND \"end\" <= '18:00'"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SelectAvailability { facility_id, date: d, window } => {
                assert_eq!(facility_id.to_string(), LAB);
                assert_eq!(d, date(2030, 3, 4));
                assert_eq!(window, Some((time(8, 0), time(18, 0))));
            }
            _ => panic!("expected SelectAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_availability_whole_day() {
        let sql = format!("SELECT * FROM availability WHERE facility_id = '{LAB}' AND date = '2030-03-04'");
        let Command::SelectAvailability { window, .. } = parse_sql(&sql).unwrap() else {
            panic!("expected SelectAvailability");
        };
        assert_eq!(window, None);
    }

    #[test]
    fn parse_select_availability_missing_filters() {
        assert!(matches!(
            parse_sql("SELECT * FROM availability WHERE date = '2030-03-04'"),
            Err(SqlError::MissingFilter("facility_id"))
        ));
        let half_window = format!(
            "SELECT * FROM availability WHERE facility_id = '{LAB}' AND date = '2030-03-04' AND start >= '08:00'"
        );
        assert!(matches!(parse_sql(&half_window), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
        assert!(matches!(parse_sql("SELECT * FROM students"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_unsupported_statement() {
        assert!(matches!(parse_sql("DROP TABLE bookings"), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
