use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::ok;
use crate::ipc::helpers::{db_conn, optional_str, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn users_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let username = required_str(params, "username")?;
    let email = required_str(params, "email")?;
    let full_name = optional_str(params, "fullName").unwrap_or_default();
    let external_email = optional_str(params, "externalEmail");
    let gender = optional_str(params, "gender");
    let level_of_education = optional_str(params, "levelOfEducation");
    let year_of_birth = params.get("yearOfBirth").and_then(|v| v.as_i64());
    let is_global_staff = params
        .get("isGlobalStaff")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let user_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, username, email, full_name, external_email, is_global_staff,
                           gender, level_of_education, year_of_birth, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        (
            &user_id,
            &username,
            &email,
            &full_name,
            &external_email,
            is_global_staff as i64,
            &gender,
            &level_of_education,
            year_of_birth,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "userId": user_id }))
}

fn users_list(conn: &Connection) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, username, email, full_name, is_global_staff
         FROM users ORDER BY username",
    )?;
    let users = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "username": row.get::<_, String>(1)?,
                "email": row.get::<_, String>(2)?,
                "fullName": row.get::<_, String>(3)?,
                "isGlobalStaff": row.get::<_, i64>(4)? != 0,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "users": users }))
}

fn handle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = db_conn(state).and_then(|conn| match req.method.as_str() {
        "users.create" => users_create(conn, &req.params),
        _ => users_list(conn),
    });
    match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" | "users.list" => Some(handle(state, req)),
        _ => None,
    }
}
