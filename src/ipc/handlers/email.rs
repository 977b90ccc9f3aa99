use rusqlite::Connection;
use serde_json::json;

use crate::config::Config;
use crate::enroll;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_from_params, db_conn, optional_str, required_str, resolve_user, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify;
use crate::tasks::{TaskRunner, TaskSpec};

fn recipients(
    conn: &Connection,
    course_id: &str,
    send_to: &str,
    requester: &str,
) -> Result<Vec<String>, HandlerErr> {
    match send_to {
        "myself" => {
            let user = resolve_user(conn, requester)?;
            Ok(vec![user.email])
        }
        "staff" => {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT u.email
                 FROM course_roles r JOIN users u ON u.id = r.user_id
                 WHERE r.course_id = ?1 AND r.role IN ('staff', 'instructor')
                 ORDER BY u.email",
            )?;
            let emails = stmt
                .query_map([course_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(emails)
        }
        "all" => {
            let enrollees = enroll::list_active_enrollees(conn, course_id)?;
            Ok(enrollees.into_iter().map(|e| e.email).collect())
        }
        other => Err(HandlerErr::new(
            "bad_params",
            format!("sendTo must be myself, staff or all, got {}", other),
        )),
    }
}

/// Queues one outbox message per recipient, through the task runner so the
/// send is visible in history.
fn send_bulk(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    if !config.email_enabled {
        return Err(HandlerErr::new(
            "feature_disabled",
            "bulk email is disabled for this workspace",
        ));
    }
    let course = course_from_params(conn, params)?;
    let subject = required_str(params, "subject")?;
    let body = required_str(params, "body")?;
    let send_to = required_str(params, "sendTo")?;
    let requester = optional_str(params, "requester").unwrap_or_else(|| "instructor".to_string());

    let to = recipients(conn, &course.id, &send_to, &requester)?;

    let runner = TaskRunner {
        conn,
        course_id: &course.id,
    };
    let spec = TaskSpec {
        task_type: "bulk_email",
        problem: None,
        student: None,
        requester: &requester,
    };
    let task = runner.submit(&spec, || {
        let mut succeeded = 0usize;
        for email in &to {
            match notify::queue_raw(conn, "bulk_email", email, &subject, &body) {
                Ok(()) => succeeded += 1,
                Err(e) => tracing::warn!(recipient = %email, error = %e, "outbox insert failed"),
            }
        }
        Ok(json!({ "attempted": to.len(), "succeeded": succeeded, "sendTo": send_to }))
    })?;

    Ok(json!({
        "ok": true,
        "taskId": task.id,
        "state": task.state,
        "output": task.output,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method != "email.send_bulk" {
        return None;
    }
    let conn = match db_conn(state) {
        Ok(conn) => conn,
        Err(e) => return Some(e.response(&req.id)),
    };
    Some(match send_bulk(conn, &state.config, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
