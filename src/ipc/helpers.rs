use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

use crate::datatable::Datatable;
use crate::enroll::{self, UserRow};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

/// Handler-side failure carried up to the response builder.
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<rusqlite::Error> for HandlerErr {
    fn from(e: rusqlite::Error) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }
}

impl From<anyhow::Error> for HandlerErr {
    fn from(e: anyhow::Error) -> Self {
        HandlerErr::new("db_query_failed", format!("{e:#}"))
    }
}

impl From<crate::grading::GradingError> for HandlerErr {
    fn from(e: crate::grading::GradingError) -> Self {
        let code = match e.code.as_str() {
            "bad_grading_policy" => "bad_params",
            "no_offline_grades" => "not_found",
            _ => "db_query_failed",
        };
        HandlerErr::new(code, e.message)
    }
}

impl From<crate::tasks::TaskError> for HandlerErr {
    fn from(e: crate::tasks::TaskError) -> Self {
        let code = match e.code.as_str() {
            "task_submission_failed" => "task_submission_failed",
            "db_update_failed" => "db_update_failed",
            _ => "db_query_failed",
        };
        HandlerErr::new(code, e.message)
    }
}

impl From<crate::remote_gradebook::RemoteError> for HandlerErr {
    fn from(e: crate::remote_gradebook::RemoteError) -> Self {
        HandlerErr::new("external_service_error", e.message)
    }
}

impl From<crate::analytics::AnalyticsError> for HandlerErr {
    fn from(e: crate::analytics::AnalyticsError) -> Self {
        HandlerErr::new("external_service_error", e.message)
    }
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn optional_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn optional_bool(params: &Value, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub fn required_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn db_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

#[derive(Debug, Clone)]
pub struct CourseRow {
    pub id: String,
    pub course_key: String,
    pub display_name: String,
    pub remote_gradebook_name: Option<String>,
}

pub fn find_course(conn: &Connection, course_key: &str) -> Result<CourseRow, HandlerErr> {
    conn.query_row(
        "SELECT id, course_key, display_name, remote_gradebook_name
         FROM courses WHERE course_key = ?1",
        [course_key],
        |row| {
            Ok(CourseRow {
                id: row.get(0)?,
                course_key: row.get(1)?,
                display_name: row.get(2)?,
                remote_gradebook_name: row.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::new("not_found", format!("course {} not found", course_key)))
}

/// Course named by the `courseKey` param.
pub fn course_from_params(conn: &Connection, params: &Value) -> Result<CourseRow, HandlerErr> {
    let key = required_str(params, "courseKey")?;
    find_course(conn, &key)
}

pub fn resolve_user(conn: &Connection, identifier: &str) -> Result<UserRow, HandlerErr> {
    enroll::find_user_by_identifier(conn, identifier)?.ok_or_else(|| {
        HandlerErr::new("not_found", format!("user {} does not exist", identifier))
    })
}

/// Datatable response convention: with a `csvPath` param the table is
/// written out and only the export receipt is returned.
pub fn respond_table(req: &Request, table: &Datatable) -> Value {
    match req.params.get("csvPath").and_then(|v| v.as_str()) {
        Some(path) => match table.write_csv(Path::new(path)) {
            Ok(rows) => ok(
                &req.id,
                json!({
                    "ok": true,
                    "rowsExported": rows,
                    "path": path,
                    "title": table.title,
                }),
            ),
            Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
        },
        None => ok(&req.id, table.to_json()),
    }
}
