use rusqlite::Connection;
use serde_json::json;

use crate::datatable::Datatable;
use crate::ipc::error::ok;
use crate::ipc::helpers::{
    course_from_params, db_conn, required_str, resolve_user, respond_table, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

const COURSE_ROLES: [&str; 3] = ["staff", "instructor", "beta_tester"];
const FORUM_ROLES: [&str; 3] = ["administrator", "moderator", "community_ta"];

struct RoleTarget {
    table: &'static str,
    role: &'static str,
}

fn role_target(method: &str, params: &serde_json::Value) -> Result<RoleTarget, HandlerErr> {
    let raw = required_str(params, "role")?;
    let (table, allowed): (&'static str, &[&'static str]) = if method.starts_with("forum.") {
        ("forum_roles", &FORUM_ROLES)
    } else {
        ("course_roles", &COURSE_ROLES)
    };
    match allowed.iter().find(|r| **r == raw) {
        Some(role) => Ok(RoleTarget { table, role }),
        None => Err(HandlerErr::new(
            "bad_params",
            format!("role must be one of {}", allowed.join(", ")),
        )),
    }
}

fn has_staff_access(conn: &Connection, course_id: &str, user_id: &str) -> Result<bool, HandlerErr> {
    let global: bool = conn.query_row(
        "SELECT is_global_staff FROM users WHERE id = ?1",
        [user_id],
        |row| row.get::<_, i64>(0).map(|v| v != 0),
    )?;
    if global {
        return Ok(true);
    }
    let held: i64 = conn.query_row(
        "SELECT COUNT(*) FROM course_roles
         WHERE course_id = ?1 AND user_id = ?2 AND role IN ('staff', 'instructor')",
        (course_id, user_id),
        |row| row.get(0),
    )?;
    Ok(held > 0)
}

fn role_list(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Result<Datatable, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let target = role_target(method, params)?;
    let mut table = Datatable::new(
        format!("List of {} in course {}", target.role, course.course_key),
        vec!["username".to_string(), "email".to_string()],
    );
    let mut stmt = conn.prepare(&format!(
        "SELECT u.username, u.email
         FROM {} r JOIN users u ON u.id = r.user_id
         WHERE r.course_id = ?1 AND r.role = ?2
         ORDER BY u.username",
        target.table
    ))?;
    let rows = stmt
        .query_map((&course.id, target.role), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (username, email) in rows {
        table.push_row(vec![json!(username), json!(email)]);
    }
    Ok(table)
}

/// Grants a role. Failures that are user-correctable (missing staff
/// access, role already held) come back as messages, not errors.
fn role_add(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let target = role_target(method, params)?;
    let identifier = required_str(params, "identifier")?;
    let user = resolve_user(conn, &identifier)?;

    if target.table == "forum_roles"
        && target.role == "administrator"
        && !has_staff_access(conn, &course.id, &user.id)?
    {
        return Ok(json!({
            "ok": true,
            "added": false,
            "message": format!(
                "Error: user {} should first be added as staff before adding \
                 as a forum administrator, cancelled",
                user.username
            ),
        }));
    }

    let changed = conn
        .execute(
            &format!(
                "INSERT OR IGNORE INTO {}(course_id, user_id, role) VALUES(?1, ?2, ?3)",
                target.table
            ),
            (&course.id, &user.id, target.role),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let message = if changed == 0 {
        format!("{} already holds {}", user.username, target.role)
    } else {
        format!("Added {} to {}", user.username, target.role)
    };
    Ok(json!({ "ok": true, "added": changed > 0, "message": message }))
}

fn role_remove(
    conn: &Connection,
    method: &str,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let target = role_target(method, params)?;
    let identifier = required_str(params, "identifier")?;
    let user = resolve_user(conn, &identifier)?;

    let changed = conn
        .execute(
            &format!(
                "DELETE FROM {} WHERE course_id = ?1 AND user_id = ?2 AND role = ?3",
                target.table
            ),
            (&course.id, &user.id, target.role),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    let message = if changed == 0 {
        format!("{} does not hold {}", user.username, target.role)
    } else {
        format!("Removed {} from {}", user.username, target.role)
    };
    Ok(json!({ "ok": true, "removed": changed > 0, "message": message }))
}

fn handle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state) {
        Ok(conn) => conn,
        Err(e) => return e.response(&req.id),
    };
    match req.method.as_str() {
        "roles.list" | "forum.list" => match role_list(conn, &req.method, &req.params) {
            Ok(table) => respond_table(req, &table),
            Err(e) => e.response(&req.id),
        },
        "roles.add" | "forum.add" => match role_add(conn, &req.method, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        },
        _ => match role_remove(conn, &req.method, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        },
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "roles.list" | "roles.add" | "roles.remove" | "forum.list" | "forum.add"
        | "forum.remove" => Some(handle(state, req)),
        _ => None,
    }
}
