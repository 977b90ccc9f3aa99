use std::path::Path;

use rusqlite::Connection;
use serde_json::{json, Value};

use crate::config::Config;
use crate::datatable::Datatable;
use crate::enroll;
use crate::grading::{self, GradingCtx};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    course_from_params, db_conn, optional_str, required_str, respond_table, CourseRow, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::remote_gradebook::{RemoteGradebook, RemoteReply};

/// Course-level gradebook name, falling back to the workspace default.
fn gradebook_name(course: &CourseRow, config: &Config) -> Result<String, HandlerErr> {
    let name = course
        .remote_gradebook_name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| config.remote_gradebook_default_name.clone());
    if name.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            "no remote gradebook name configured",
        ));
    }
    Ok(name)
}

fn remote_action(
    state: &AppState,
    conn: &Connection,
    req: &Request,
    action: &str,
    title: &str,
) -> Result<RemoteReply, HandlerErr> {
    let course = course_from_params(conn, &req.params)?;
    let name = gradebook_name(&course, &state.config)?;
    let remote = RemoteGradebook {
        client: &state.http,
        endpoint: &state.config.remote_gradebook_url,
        gradebook_name: &name,
    };
    let section = optional_str(&req.params, "section");
    let mut extra: Vec<(&str, &str)> = Vec::new();
    if action == "get-membership" {
        if let Some(s) = section.as_deref() {
            extra.push(("section", s));
        }
    }
    Ok(remote.fetch_table(action, &extra, title)?)
}

fn remote_response(req: &Request, reply: &RemoteReply) -> serde_json::Value {
    let Some(table) = &reply.table else {
        return ok(
            &req.id,
            json!({ "message": reply.message, "table": Value::Null }),
        );
    };
    match req.params.get("csvPath").and_then(|v| v.as_str()) {
        Some(path) => match table.write_csv(Path::new(path)) {
            Ok(rows) => ok(
                &req.id,
                json!({
                    "ok": true,
                    "message": reply.message,
                    "rowsExported": rows,
                    "path": path,
                    "title": table.title,
                }),
            ),
            Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
        },
        None => ok(
            &req.id,
            json!({ "message": reply.message, "table": table.to_json() }),
        ),
    }
}

/// One column of the percent-mode grade summary, keyed by external email
/// for matching against the remote roster.
fn assignment_grades_table(
    conn: &Connection,
    course: &CourseRow,
    assignment: &str,
) -> Result<Datatable, HandlerErr> {
    let enrollees = enroll::list_active_enrollees(conn, &course.id)?;
    let gctx = GradingCtx {
        conn,
        course_id: &course.id,
    };
    let mut table = Datatable::new(
        format!("Grades for assignment \"{}\"", assignment),
        vec!["External email".to_string(), assignment.to_string()],
    );
    let mut found = false;
    for student in &enrollees {
        let gradeset = grading::student_gradeset(&gctx, &student.user_id, false)?;
        let score = gradeset
            .section_breakdown
            .iter()
            .find(|s| s.label == assignment)
            .map(|s| s.percent);
        if score.is_some() {
            found = true;
        }
        let email = student
            .external_email
            .clone()
            .unwrap_or_else(|| student.email.clone());
        table.push_row(vec![
            json!(email),
            score.map(|s| json!(s)).unwrap_or(Value::Null),
        ]);
    }
    if !found && !enrollees.is_empty() {
        return Err(HandlerErr::new(
            "not_found",
            format!("assignment {} not found", assignment),
        ));
    }
    Ok(table)
}

fn post_grades(state: &AppState, conn: &Connection, req: &Request) -> Result<Value, HandlerErr> {
    let course = course_from_params(conn, &req.params)?;
    let assignment = required_str(&req.params, "assignment")?;
    let table = assignment_grades_table(conn, &course, &assignment)?;

    let name = gradebook_name(&course, &state.config)?;
    let remote = RemoteGradebook {
        client: &state.http,
        endpoint: &state.config.remote_gradebook_url,
        gradebook_name: &name,
    };
    let message = remote.post_grades(&assignment, &table.to_csv())?;
    Ok(json!({
        "ok": true,
        "message": message,
        "rowsExported": table.data.len(),
    }))
}

fn handle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state) {
        Ok(conn) => conn,
        Err(e) => return e.response(&req.id),
    };
    match req.method.as_str() {
        "gradebook.assignments" => {
            match remote_action(state, conn, req, "get-assignments", "Remote gradebook assignments")
            {
                Ok(reply) => remote_response(req, &reply),
                Err(e) => e.response(&req.id),
            }
        }
        "gradebook.sections" => {
            match remote_action(state, conn, req, "get-sections", "Remote gradebook sections") {
                Ok(reply) => remote_response(req, &reply),
                Err(e) => e.response(&req.id),
            }
        }
        "gradebook.membership" => {
            match remote_action(state, conn, req, "get-membership", "Remote gradebook membership") {
                Ok(reply) => remote_response(req, &reply),
                Err(e) => e.response(&req.id),
            }
        }
        "gradebook.assignment_grades" => {
            let result = course_from_params(conn, &req.params).and_then(|course| {
                let assignment = required_str(&req.params, "assignment")?;
                assignment_grades_table(conn, &course, &assignment)
            });
            match result {
                Ok(table) => respond_table(req, &table),
                Err(e) => e.response(&req.id),
            }
        }
        _ => match post_grades(state, conn, req) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        },
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradebook.assignments"
        | "gradebook.sections"
        | "gradebook.membership"
        | "gradebook.assignment_grades"
        | "gradebook.post_grades" => Some(handle(state, req)),
        _ => None,
    }
}
