use rusqlite::Connection;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::datatable::Datatable;
use crate::ipc::helpers::{
    course_from_params, db_conn, optional_bool, optional_str, required_str, respond_table,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};

/// Salted, truncated digest; the same inputs always map to the same id so
/// exports stay joinable across runs.
fn anon_id(salt: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    for part in parts {
        hasher.update(b"|");
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn students(conn: &Connection, params: &Value) -> Result<Datatable, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let with_profile = optional_bool(params, "withProfile");

    let mut header: Vec<String> = ["ID", "Username", "Full Name", "Site email", "External email"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if with_profile {
        header.extend(
            ["Gender", "Level of Education", "Year of Birth"]
                .iter()
                .map(|s| s.to_string()),
        );
    }
    let mut table = Datatable::new(
        format!("Students enrolled in {}", course.course_key),
        header,
    );

    let mut stmt = conn.prepare(
        "SELECT u.id, u.username, u.full_name, u.email, u.external_email,
                u.gender, u.level_of_education, u.year_of_birth
         FROM enrollments e
         JOIN users u ON u.id = e.user_id
         WHERE e.course_id = ?1 AND e.is_active = 1
         ORDER BY u.username",
    )?;
    let rows = stmt
        .query_map([&course.id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<i64>>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (id, username, full_name, email, external, gender, education, year) in rows {
        let mut cells = vec![
            json!(id),
            json!(username),
            json!(full_name),
            json!(email),
            external.map(|v| json!(v)).unwrap_or(Value::Null),
        ];
        if with_profile {
            cells.push(gender.map(|v| json!(v)).unwrap_or(Value::Null));
            cells.push(education.map(|v| json!(v)).unwrap_or(Value::Null));
            cells.push(year.map(|v| json!(v)).unwrap_or(Value::Null));
        }
        table.push_row(cells);
    }
    Ok(table)
}

fn anon_ids(conn: &Connection, salt: &str, params: &Value) -> Result<Datatable, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let mut table = Datatable::new(
        format!("Anonymized user IDs for {}", course.course_key),
        vec![
            "User ID".to_string(),
            "Anonymized User ID".to_string(),
            "Course Specific Anonymized User ID".to_string(),
        ],
    );

    let mut stmt = conn.prepare(
        "SELECT u.id FROM enrollments e
         JOIN users u ON u.id = e.user_id
         WHERE e.course_id = ?1 AND e.is_active = 1
         ORDER BY u.username",
    )?;
    let ids = stmt
        .query_map([&course.id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    for user_id in ids {
        table.push_row(vec![
            json!(user_id),
            json!(anon_id(salt, &[&user_id])),
            json!(anon_id(salt, &[&user_id, &course.course_key])),
        ]);
    }
    Ok(table)
}

fn responses(conn: &Connection, params: &Value) -> Result<Datatable, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let problem = required_str(params, "problem")?;
    let mut table = Datatable::new(
        format!("Student state for problem {}", problem),
        vec![
            "Username".to_string(),
            "Earned".to_string(),
            "Attempts".to_string(),
            "Answer".to_string(),
            "Updated".to_string(),
        ],
    );

    let mut stmt = conn.prepare(
        "SELECT u.username, ps.earned, ps.attempts, ps.answer, ps.updated_at
         FROM problem_states ps
         JOIN problems p ON p.id = ps.problem_id
         JOIN users u ON u.id = ps.user_id
         WHERE p.course_id = ?1 AND p.name = ?2
         ORDER BY u.username",
    )?;
    let rows = stmt
        .query_map((&course.id, &problem), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (username, earned, attempts, answer, updated) in rows {
        table.push_row(vec![
            json!(username),
            json!(earned),
            json!(attempts),
            answer.map(|v| json!(v)).unwrap_or(Value::Null),
            updated.map(|v| json!(v)).unwrap_or(Value::Null),
        ]);
    }
    Ok(table)
}

fn answer_distributions(conn: &Connection, params: &Value) -> Result<Datatable, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let problem = optional_str(params, "problem");
    let title = match &problem {
        Some(p) => format!("Answer distribution for problem {}", p),
        None => format!("Answer distributions for {}", course.course_key),
    };
    let mut table = Datatable::new(
        title,
        vec![
            "Problem".to_string(),
            "Display Name".to_string(),
            "Answer".to_string(),
            "Count".to_string(),
        ],
    );

    let mut stmt = conn.prepare(
        "SELECT p.name, p.display_name, COALESCE(ps.answer, ''), COUNT(*)
         FROM problem_states ps
         JOIN problems p ON p.id = ps.problem_id
         WHERE p.course_id = ?1 AND (?2 IS NULL OR p.name = ?2)
         GROUP BY p.name, p.display_name, COALESCE(ps.answer, '')
         ORDER BY p.name, COUNT(*) DESC, COALESCE(ps.answer, '')",
    )?;
    let rows = stmt
        .query_map((&course.id, problem.as_deref()), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (name, display_name, answer, count) in rows {
        table.push_row(vec![
            json!(name),
            json!(display_name),
            json!(answer),
            json!(count),
        ]);
    }
    Ok(table)
}

fn item_statistics(conn: &Connection, params: &Value) -> Result<Datatable, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let mut table = Datatable::new(
        format!("Item statistics for {}", course.course_key),
        vec![
            "Problem".to_string(),
            "Display Name".to_string(),
            "Max Points".to_string(),
            "Attempted By".to_string(),
            "Average Score".to_string(),
            "Average Attempts".to_string(),
        ],
    );

    let mut stmt = conn.prepare(
        "SELECT p.name, p.display_name, p.max_points,
                COUNT(ps.user_id), AVG(ps.earned), AVG(ps.attempts)
         FROM problems p
         LEFT JOIN problem_states ps ON ps.problem_id = p.id
         WHERE p.course_id = ?1
         GROUP BY p.id
         ORDER BY p.sort_order, p.name",
    )?;
    let rows = stmt
        .query_map([&course.id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<f64>>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (name, display_name, max_points, attempted, avg_score, avg_attempts) in rows {
        table.push_row(vec![
            json!(name),
            json!(display_name),
            json!(max_points),
            json!(attempted),
            avg_score.map(|v| json!(v)).unwrap_or(Value::Null),
            avg_attempts.map(|v| json!(v)).unwrap_or(Value::Null),
        ]);
    }
    Ok(table)
}

fn feature_column(feature: &str) -> Result<(&'static str, &'static str), HandlerErr> {
    match feature {
        "gender" => Ok(("gender", "Gender")),
        "level_of_education" => Ok(("level_of_education", "Level of Education")),
        "year_of_birth" => Ok(("year_of_birth", "Year of Birth")),
        _ => Err(HandlerErr::new(
            "bad_params",
            "feature must be one of gender, level_of_education, year_of_birth",
        )),
    }
}

fn course_stats(conn: &Connection, params: &Value) -> Result<Datatable, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let feature = required_str(params, "feature")?;
    let (column, label) = feature_column(&feature)?;

    let mut table = Datatable::new(
        format!("Distribution of {} in {}", feature, course.course_key),
        vec![label.to_string(), "Count".to_string()],
    );
    let mut stmt = conn.prepare(&format!(
        "SELECT COALESCE(CAST(u.{} AS TEXT), ''), COUNT(*)
         FROM enrollments e
         JOIN users u ON u.id = e.user_id
         WHERE e.course_id = ?1 AND e.is_active = 1
         GROUP BY 1
         ORDER BY COUNT(*) DESC, 1",
        column
    ))?;
    let rows = stmt
        .query_map([&course.id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (value, count) in rows {
        table.push_row(vec![json!(value), json!(count)]);
    }
    Ok(table)
}

fn handle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state) {
        Ok(conn) => conn,
        Err(e) => return e.response(&req.id),
    };
    let result = match req.method.as_str() {
        "reports.students" => students(conn, &req.params),
        "reports.anon_ids" => anon_ids(conn, &state.config.anon_salt, &req.params),
        "reports.responses" => responses(conn, &req.params),
        "reports.answer_distributions" => answer_distributions(conn, &req.params),
        "reports.item_statistics" => item_statistics(conn, &req.params),
        _ => course_stats(conn, &req.params),
    };
    match result {
        Ok(table) => respond_table(req, &table),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.students"
        | "reports.anon_ids"
        | "reports.responses"
        | "reports.answer_distributions"
        | "reports.item_statistics"
        | "reports.course_stats" => Some(handle(state, req)),
        _ => None,
    }
}
