use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::config::Config;
use crate::datatable::Datatable;
use crate::enroll::{self, EnrollOptions, EnrollmentCtx, ReconcileOutcome};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    course_from_params, db_conn, optional_bool, required_str, respond_table, CourseRow, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::notify::{MailParams, NullNotifier, OutboxNotifier};

fn mail_base(config: &Config, course: &CourseRow, auto_enroll: bool) -> MailParams {
    MailParams {
        site_name: config.site_name.clone(),
        registration_url: config.registration_url(),
        course_display_name: course.display_name.clone(),
        course_key: course.course_key.clone(),
        course_url: config.course_url(&course.course_key),
        course_about_url: config.course_about_url(&course.course_key),
        auto_enroll,
        email_address: String::new(),
        full_name: None,
    }
}

fn run_enroll(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<ReconcileOutcome, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let students = required_str(params, "students")?;
    let opts = EnrollOptions {
        overload: optional_bool(params, "overload"),
        auto_enroll: optional_bool(params, "autoEnroll"),
        email_students: optional_bool(params, "emailStudents"),
    };
    let base = mail_base(config, &course, opts.auto_enroll);
    let ctx = EnrollmentCtx {
        conn,
        course_id: &course.id,
    };
    let outcome = if config.email_enabled {
        let mut notifier = OutboxNotifier { conn };
        enroll::enroll_students(ctx, &students, opts, &base, &mut notifier)?
    } else {
        let mut notifier = NullNotifier;
        enroll::enroll_students(ctx, &students, opts, &base, &mut notifier)?
    };
    Ok(outcome)
}

fn run_unenroll(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<ReconcileOutcome, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let students = required_str(params, "students")?;
    let email_students = optional_bool(params, "emailStudents");
    let base = mail_base(config, &course, false);
    let ctx = EnrollmentCtx {
        conn,
        course_id: &course.id,
    };
    let outcome = if config.email_enabled {
        let mut notifier = OutboxNotifier { conn };
        enroll::unenroll_students(ctx, &students, email_students, &base, &mut notifier)?
    } else {
        let mut notifier = NullNotifier;
        enroll::unenroll_students(ctx, &students, email_students, &base, &mut notifier)?
    };
    Ok(outcome)
}

/// The reconciliation response carries the partition lists either way;
/// `csvPath` swaps the inline table for an export receipt.
fn reconcile_response(req: &Request, outcome: &ReconcileOutcome, title: &str) -> serde_json::Value {
    let table = enroll::status_datatable(title, &outcome.status);
    let mut body = json!({
        "ok": true,
        "added": outcome.added,
        "rejected": outcome.rejected,
        "deleted": outcome.deleted,
    });
    match req.params.get("csvPath").and_then(|v| v.as_str()) {
        Some(path) => match table.write_csv(Path::new(path)) {
            Ok(rows) => {
                body["rowsExported"] = json!(rows);
                body["path"] = json!(path);
                body["title"] = json!(table.title);
            }
            Err(e) => return err(&req.id, "io_failed", format!("{e:#}"), None),
        },
        None => body["table"] = table.to_json(),
    }
    ok(&req.id, body)
}

fn enrollment_count(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let count = enroll::active_enrollment_count(conn, &course.id)?;
    Ok(json!({ "courseKey": course.course_key, "count": count }))
}

fn enrollment_pending(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<Datatable, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let mut table = Datatable::new(
        format!("Students allowed to enroll in {}", course.course_key),
        vec!["StudentEmail".to_string()],
    );
    let mut stmt = conn.prepare(
        "SELECT email FROM enrollment_allowances WHERE course_id = ?1 ORDER BY email",
    )?;
    let emails = stmt
        .query_map([&course.id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for email in emails {
        table.push_row(vec![json!(email)]);
    }
    Ok(table)
}

fn enrollment_status(
    conn: &Connection,
    config: &Config,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let identifier = required_str(params, "identifier")?;
    let user = enroll::find_user_by_identifier(conn, &identifier)?;
    let ctx = EnrollmentCtx {
        conn,
        course_id: &course.id,
    };
    let (enrolled, email) = match &user {
        Some(u) => (enroll::is_actively_enrolled(ctx, &u.id)?, u.email.clone()),
        None => (false, identifier.clone()),
    };
    let auto_enroll: Option<bool> = conn
        .query_row(
            "SELECT auto_enroll FROM enrollment_allowances
             WHERE course_id = ?1 AND email = ?2",
            (&course.id, &email),
            |row| row.get::<_, i64>(0).map(|v| v != 0),
        )
        .optional()?;

    let message = if enrolled {
        format!("{} is enrolled in {}", identifier, course.course_key)
    } else if let Some(auto) = auto_enroll {
        format!(
            "{} is allowed to enroll in {}, auto enrollment {}",
            identifier,
            course.course_key,
            if auto { "on" } else { "off" }
        )
    } else if user.is_some() {
        format!("{} is not enrolled in {}", identifier, course.course_key)
    } else {
        format!("{} does not have an account", identifier)
    };

    // Link to the student's progress page on the LMS, for accounts only.
    let progress_url = user
        .as_ref()
        .map(|u| config.progress_url(&course.course_key, &u.id));

    Ok(json!({
        "identifier": identifier,
        "userExists": user.is_some(),
        "enrolled": enrolled,
        "allowed": auto_enroll.is_some(),
        "autoEnroll": auto_enroll,
        "progressUrl": progress_url,
        "message": message,
    }))
}

fn handle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state) {
        Ok(conn) => conn,
        Err(e) => return e.response(&req.id),
    };
    match req.method.as_str() {
        "enrollment.enroll" => match run_enroll(conn, &state.config, &req.params) {
            Ok(outcome) => reconcile_response(req, &outcome, "Enrollment of students"),
            Err(e) => e.response(&req.id),
        },
        "enrollment.unenroll" => match run_unenroll(conn, &state.config, &req.params) {
            Ok(outcome) => reconcile_response(req, &outcome, "Un-enrollment of students"),
            Err(e) => e.response(&req.id),
        },
        "enrollment.count" => match enrollment_count(conn, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        },
        "enrollment.pending" => match enrollment_pending(conn, &req.params) {
            Ok(table) => respond_table(req, &table),
            Err(e) => e.response(&req.id),
        },
        _ => match enrollment_status(conn, &state.config, &req.params) {
            Ok(result) => ok(&req.id, result),
            Err(e) => e.response(&req.id),
        },
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollment.enroll"
        | "enrollment.unenroll"
        | "enrollment.count"
        | "enrollment.pending"
        | "enrollment.status" => Some(handle(state, req)),
        _ => None,
    }
}
