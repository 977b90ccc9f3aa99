use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::config::Config;
use crate::enroll;
use crate::grading::{self, GradingPolicy};
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_from_params, db_conn, optional_str, required_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

const STANDARD_SECTIONS: [&str; 5] = ["Grades", "Admin", "Forum Admin", "Enrollment", "DataDump"];
const METRICS_SECTIONS: [&str; 1] = ["Metrics"];

fn courses_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_key = required_str(params, "courseKey")?;
    let display_name = required_str(params, "displayName")?;
    let remote_gradebook_name = optional_str(params, "remoteGradebookName");

    let policy_json = match params.get("gradingPolicy") {
        Some(v) if !v.is_null() => {
            let policy: GradingPolicy = serde_json::from_value(v.clone())
                .map_err(|e| HandlerErr::new("bad_params", format!("gradingPolicy: {}", e)))?;
            grading::validate_policy(&policy)
                .map_err(|e| HandlerErr::new("bad_params", e.message))?;
            v.to_string()
        }
        _ => serde_json::to_string(&grading::default_policy())
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?,
    };

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, course_key, display_name, grading_policy,
                             remote_gradebook_name, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        (
            &course_id,
            &course_key,
            &display_name,
            &policy_json,
            &remote_gradebook_name,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "courseId": course_id }))
}

fn courses_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt =
        conn.prepare("SELECT id, course_key, display_name FROM courses ORDER BY course_key")?;
    let courses = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "courseKey": row.get::<_, String>(1)?,
                "displayName": row.get::<_, String>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "courses": courses }))
}

/// Landing view for one course: enrollment count plus which dashboard
/// sections the requested mode offers. `largeCourse` marks courses whose
/// grade dumps must go through the task runner.
fn dashboard_overview(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let mode = optional_str(params, "mode").unwrap_or_else(|| "standard".to_string());
    let sections: Vec<&str> = match mode.as_str() {
        "standard" => STANDARD_SECTIONS.to_vec(),
        "metrics" => METRICS_SECTIONS.to_vec(),
        other => {
            return Err(HandlerErr::new(
                "bad_params",
                format!("mode must be standard or metrics, got {}", other),
            ))
        }
    };

    let enrollment_count = enroll::active_enrollment_count(conn, &course.id)?;
    Ok(json!({
        "courseKey": course.course_key,
        "displayName": course.display_name,
        "mode": mode,
        "sections": sections,
        "enrollmentCount": enrollment_count,
        "largeCourse": enrollment_count >= config.max_enrollment_for_dumps,
    }))
}

fn handle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| match req.method.as_str() {
        "courses.create" => courses_create(conn, &req.params),
        "courses.list" => courses_list(conn),
        _ => dashboard_overview(conn, &state.config, &req.params),
    });
    match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" | "courses.list" | "dashboard.overview" => Some(handle(state, req)),
        _ => None,
    }
}
