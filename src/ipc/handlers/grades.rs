use std::path::Path;

use rusqlite::Connection;
use serde_json::{json, Value};

use crate::datatable::Datatable;
use crate::enroll;
use crate::gradetable::GradeTable;
use crate::grading::{self, GradingCtx};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_from_params, db_conn, optional_bool, optional_str, required_str, respond_table,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::tasks::{TaskRunner, TaskSpec};

const IDENTITY_COLUMNS: [&str; 5] = ["ID", "Username", "Full Name", "Site email", "External email"];

/// Two-pass summary build: first pass walks every enrollee's gradeset and
/// accumulates scores per discovered component, second pass reads the
/// rectangular table back out. Any student's grading failure aborts the
/// whole summary. Returns the table plus the discovered component names.
fn summary_table(conn: &Connection, params: &Value) -> Result<(Datatable, Vec<String>), HandlerErr> {
    let course = course_from_params(conn, params)?;
    let raw = optional_bool(params, "raw");
    let use_offline = optional_bool(params, "useOffline");

    let enrollees = enroll::list_active_enrollees(conn, &course.id)?;
    let gctx = GradingCtx {
        conn,
        course_id: &course.id,
    };

    let mut grade_table = GradeTable::new();
    for student in &enrollees {
        let gradeset = grading::student_gradeset(&gctx, &student.user_id, use_offline)?;
        let mut row = grade_table.row(student.user_id.clone());
        if raw {
            for score in &gradeset.raw_scores {
                row.add(&score.section, score.earned);
            }
        } else {
            for section in &gradeset.section_breakdown {
                row.add(&section.label, section.percent);
            }
        }
    }

    let assignments = grade_table.get_graded_components();
    let mut header: Vec<String> = IDENTITY_COLUMNS.iter().map(|s| s.to_string()).collect();
    header.extend(assignments.iter().cloned());
    let title = if raw {
        format!("Raw grades of students enrolled in {}", course.course_key)
    } else {
        format!("Grades of students enrolled in {}", course.course_key)
    };

    let mut table = Datatable::new(title, header);
    for student in &enrollees {
        let mut cells = vec![
            json!(student.user_id),
            json!(student.username),
            json!(student.full_name),
            json!(student.email),
            student
                .external_email
                .as_ref()
                .map(|e| json!(e))
                .unwrap_or(Value::Null),
        ];
        for grade in grade_table.get_grade(&student.user_id) {
            cells.push(grade.map(|g| json!(g)).unwrap_or(Value::Null));
        }
        table.push_row(cells);
    }
    Ok((table, assignments))
}

/// Inline summary responses carry the component names alongside the table;
/// a `csvPath` request degrades to the plain export receipt.
fn summary_response(req: &Request, table: &Datatable, assignments: &[String]) -> Value {
    if req.params.get("csvPath").and_then(|v| v.as_str()).is_some() {
        return respond_table(req, table);
    }
    let mut body = table.to_json();
    body["assignments"] = json!(assignments);
    ok(&req.id, body)
}

fn export_csv(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let path = required_str(params, "path")?;
    let (table, _) = summary_table(conn, params)?;
    let rows = table
        .write_csv(Path::new(&path))
        .map_err(|e| HandlerErr::new("io_failed", format!("{e:#}")))?;
    Ok(json!({
        "ok": true,
        "rowsExported": rows,
        "path": path,
        "title": table.title,
    }))
}

fn grading_config(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let text = grading::grading_config_text(conn, &course.id, &course.course_key)?;
    Ok(json!({ "courseKey": course.course_key, "text": text }))
}

/// Recomputes and stores the gradeset of every active enrollee, through
/// the task runner so the run shows up in history and duplicate runs are
/// rejected. Per-student failures are tolerated and counted.
fn cache_all(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let requester = optional_str(params, "requester").unwrap_or_else(|| "instructor".to_string());

    let runner = TaskRunner {
        conn,
        course_id: &course.id,
    };
    let spec = TaskSpec {
        task_type: "cache_grades",
        problem: None,
        student: None,
        requester: &requester,
    };
    let task = runner.submit(&spec, || {
        let enrollees =
            enroll::list_active_enrollees(conn, &course.id).map_err(|e| format!("{e:#}"))?;
        let gctx = GradingCtx {
            conn,
            course_id: &course.id,
        };
        let mut succeeded = 0usize;
        for student in &enrollees {
            let stored = grading::compute_gradeset(&gctx, &student.user_id)
                .and_then(|gradeset| grading::store_cached_gradeset(&gctx, &student.user_id, &gradeset));
            if let Err(e) = stored {
                tracing::warn!(user = %student.username, error = %e, "grade caching failed");
            } else {
                succeeded += 1;
            }
        }
        Ok(json!({ "attempted": enrollees.len(), "succeeded": succeeded }))
    })?;

    Ok(json!({
        "ok": true,
        "taskId": task.id,
        "state": task.state,
        "output": task.output,
    }))
}

fn handle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state) {
        Ok(conn) => conn,
        Err(e) => return e.response(&req.id),
    };
    match req.method.as_str() {
        "grades.summary" => match summary_table(conn, &req.params) {
            Ok((table, assignments)) => summary_response(req, &table, &assignments),
            Err(e) => e.response(&req.id),
        },
        "grades.export_csv" => match export_csv(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        },
        "grades.grading_config" => match grading_config(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        },
        _ => match cache_all(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        },
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.summary" | "grades.export_csv" | "grades.grading_config" | "grades.cache_all" => {
            Some(handle(state, req))
        }
        _ => None,
    }
}
