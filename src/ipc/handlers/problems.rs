use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_from_params, db_conn, optional_str, required_f64, required_str, resolve_user,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::tasks::{TaskRunner, TaskSpec};

struct ProblemRef {
    id: String,
    name: String,
    max_points: f64,
}

fn find_problem(
    conn: &Connection,
    course_id: &str,
    name: &str,
) -> Result<ProblemRef, HandlerErr> {
    conn.query_row(
        "SELECT id, name, max_points FROM problems WHERE course_id = ?1 AND name = ?2",
        (course_id, name),
        |row| {
            Ok(ProblemRef {
                id: row.get(0)?,
                name: row.get(1)?,
                max_points: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::new("not_found", format!("problem {} not found", name)))
}

fn problems_create(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let name = required_str(params, "name")?;
    let display_name = optional_str(params, "displayName").unwrap_or_else(|| name.clone());
    let category = optional_str(params, "category").unwrap_or_else(|| "Homework".to_string());
    let max_points = params
        .get("maxPoints")
        .and_then(|v| v.as_f64())
        .unwrap_or(1.0);
    if !max_points.is_finite() || max_points < 0.0 {
        return Err(HandlerErr::new("bad_params", "maxPoints must be >= 0"));
    }
    let sort_order = match params.get("sortOrder").and_then(|v| v.as_i64()) {
        Some(n) => n,
        None => conn.query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM problems WHERE course_id = ?1",
            [&course.id],
            |row| row.get(0),
        )?,
    };

    let problem_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO problems(id, course_id, name, display_name, category, max_points, sort_order)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        (
            &problem_id,
            &course.id,
            &name,
            &display_name,
            &category,
            max_points,
            sort_order,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true, "problemId": problem_id }))
}

fn problems_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let mut stmt = conn.prepare(
        "SELECT id, name, display_name, category, max_points, sort_order
         FROM problems WHERE course_id = ?1 ORDER BY sort_order, name",
    )?;
    let problems = stmt
        .query_map([&course.id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "displayName": row.get::<_, String>(2)?,
                "category": row.get::<_, String>(3)?,
                "maxPoints": row.get::<_, f64>(4)?,
                "sortOrder": row.get::<_, i64>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "courseKey": course.course_key, "problems": problems }))
}

/// Records one student response. Repeat submissions bump the attempt
/// counter unless an explicit `attempts` value is given.
fn record_response(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let problem = find_problem(conn, &course.id, &required_str(params, "problem")?)?;
    let user = resolve_user(conn, &required_str(params, "identifier")?)?;
    let earned = required_f64(params, "earned")?;
    let answer = optional_str(params, "answer");
    let now = Utc::now().to_rfc3339();

    let result = match params.get("attempts").and_then(|v| v.as_i64()) {
        Some(attempts) => conn.execute(
            "INSERT INTO problem_states(problem_id, user_id, earned, attempts, answer, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(problem_id, user_id) DO UPDATE SET
               earned = excluded.earned,
               attempts = excluded.attempts,
               answer = COALESCE(excluded.answer, answer),
               updated_at = excluded.updated_at",
            (&problem.id, &user.id, earned, attempts, &answer, &now),
        ),
        None => conn.execute(
            "INSERT INTO problem_states(problem_id, user_id, earned, attempts, answer, updated_at)
             VALUES(?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT(problem_id, user_id) DO UPDATE SET
               earned = excluded.earned,
               attempts = attempts + 1,
               answer = COALESCE(excluded.answer, answer),
               updated_at = excluded.updated_at",
            (&problem.id, &user.id, earned, &answer, &now),
        ),
    };
    result.map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

/// Resets one student's attempt counter immediately, or every student's
/// through the task runner when no `identifier` is given.
fn reset_attempts(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let problem = find_problem(conn, &course.id, &required_str(params, "problem")?)?;
    let Some(identifier) = optional_str(params, "identifier") else {
        return reset_all_attempts(conn, &course.id, &problem, params);
    };
    let user = resolve_user(conn, &identifier)?;

    let changed = conn
        .execute(
            "UPDATE problem_states SET attempts = 0, updated_at = ?1
             WHERE problem_id = ?2 AND user_id = ?3",
            (Utc::now().to_rfc3339(), &problem.id, &user.id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::new(
            "not_found",
            format!("no state for {} on {}", user.username, problem.name),
        ));
    }
    Ok(json!({
        "ok": true,
        "message": format!("Reset attempts of {} on {}", user.username, problem.name),
    }))
}

fn reset_all_attempts(
    conn: &Connection,
    course_id: &str,
    problem: &ProblemRef,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let requester = optional_str(params, "requester").unwrap_or_else(|| "instructor".to_string());
    let runner = TaskRunner { conn, course_id };
    let spec = TaskSpec {
        task_type: "reset_attempts",
        problem: Some(&problem.name),
        student: None,
        requester: &requester,
    };
    let task = runner.submit(&spec, || {
        let changed = conn
            .execute(
                "UPDATE problem_states SET attempts = 0, updated_at = ?1 WHERE problem_id = ?2",
                (Utc::now().to_rfc3339(), &problem.id),
            )
            .map_err(|e| e.to_string())?;
        Ok(json!({ "attempted": changed, "succeeded": changed }))
    })?;
    Ok(json!({
        "ok": true,
        "taskId": task.id,
        "state": task.state,
        "output": task.output,
    }))
}

fn delete_state(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let problem = find_problem(conn, &course.id, &required_str(params, "problem")?)?;
    let user = resolve_user(conn, &required_str(params, "identifier")?)?;

    let changed = conn
        .execute(
            "DELETE FROM problem_states WHERE problem_id = ?1 AND user_id = ?2",
            (&problem.id, &user.id),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if changed == 0 {
        return Err(HandlerErr::new(
            "not_found",
            format!("no state for {} on {}", user.username, problem.name),
        ));
    }
    Ok(json!({
        "ok": true,
        "message": format!("Deleted state of {} on {}", user.username, problem.name),
    }))
}

/// Rescore through the task runner: recomputes stored scores against the
/// current maximum, for one student or the whole course.
fn rescore(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let problem = find_problem(conn, &course.id, &required_str(params, "problem")?)?;
    let student = match optional_str(params, "identifier") {
        Some(identifier) => Some(resolve_user(conn, &identifier)?),
        None => None,
    };
    let requester = optional_str(params, "requester").unwrap_or_else(|| "instructor".to_string());

    let runner = TaskRunner {
        conn,
        course_id: &course.id,
    };
    let spec = TaskSpec {
        task_type: "rescore",
        problem: Some(&problem.name),
        student: student.as_ref().map(|u| u.username.as_str()),
        requester: &requester,
    };
    let task = runner.submit(&spec, || {
        let mut stmt = conn
            .prepare(
                "SELECT user_id, earned FROM problem_states
                 WHERE problem_id = ?1 AND (?2 IS NULL OR user_id = ?2)",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(
                (&problem.id, student.as_ref().map(|u| u.id.as_str())),
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| e.to_string())?;

        let mut succeeded = 0usize;
        let now = Utc::now().to_rfc3339();
        for (user_id, earned) in &rows {
            let rescored = earned.clamp(0.0, problem.max_points);
            let updated = conn.execute(
                "UPDATE problem_states SET earned = ?1, updated_at = ?2
                 WHERE problem_id = ?3 AND user_id = ?4",
                (rescored, &now, &problem.id, user_id),
            );
            match updated {
                Ok(_) => succeeded += 1,
                Err(e) => tracing::warn!(user = %user_id, error = %e, "rescore failed"),
            }
        }
        Ok(json!({ "attempted": rows.len(), "succeeded": succeeded }))
    })?;

    Ok(json!({
        "ok": true,
        "taskId": task.id,
        "state": task.state,
        "output": task.output,
    }))
}

fn handle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| match req.method.as_str() {
        "problems.create" => problems_create(conn, &req.params),
        "problems.list" => problems_list(conn, &req.params),
        "problems.record_response" => record_response(conn, &req.params),
        "problems.reset_attempts" => reset_attempts(conn, &req.params),
        "problems.delete_state" => delete_state(conn, &req.params),
        _ => rescore(conn, &req.params),
    });
    match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "problems.create"
        | "problems.list"
        | "problems.record_response"
        | "problems.reset_attempts"
        | "problems.delete_state"
        | "problems.rescore" => Some(handle(state, req)),
        _ => None,
    }
}
