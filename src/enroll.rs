use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::warn;

use crate::datatable::Datatable;
use crate::notify::{MailParams, Notifier, Template};

/// Store handle for one course's enrollment records.
#[derive(Clone, Copy)]
pub struct EnrollmentCtx<'a> {
    pub conn: &'a Connection,
    pub course_id: &'a str,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnrollOptions {
    pub overload: bool,
    pub auto_enroll: bool,
    pub email_students: bool,
}

/// Outcome of one reconciliation pass. Every input identifier lands in
/// `status` exactly once (later duplicates overwrite earlier ones);
/// overload-phase entries are keyed by the stored record email, list-phase
/// entries by the raw input identifier.
#[derive(Debug)]
pub struct ReconcileOutcome {
    pub status: HashMap<String, String>,
    pub added: Vec<String>,
    pub rejected: Vec<String>,
    pub deleted: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub full_name: String,
    pub email: String,
}

/// One roster entry for an actively enrolled student.
#[derive(Debug, Clone)]
pub struct Enrollee {
    pub user_id: String,
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub external_email: Option<String>,
}

/// Splits a pasted identifier blob on commas and whitespace, trimming and
/// dropping empties. Duplicates survive; each gets processed, and the last
/// processed status wins the identifier's row.
pub fn split_identifiers(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Bulk enroll. Processes identifiers sequentially and independently; only
/// the enrollment activation itself is caught per identifier ("rejected"),
/// store lookup failures abort the whole request.
pub fn enroll_students(
    ctx: EnrollmentCtx<'_>,
    raw_list: &str,
    opts: EnrollOptions,
    mail_base: &MailParams,
    notifier: &mut dyn Notifier,
) -> anyhow::Result<ReconcileOutcome> {
    let new_students = split_identifiers(raw_list);
    let new_students_lc: Vec<String> = new_students.iter().map(|s| s.to_lowercase()).collect();
    let mut status: HashMap<String, String> = HashMap::new();

    if opts.overload {
        overload_reset(ctx, &new_students_lc, &mut status)?;
    }

    for student in &new_students {
        let Some(user) = find_user_by_email(ctx.conn, student)? else {
            // No account yet: park the email in the pending allowance table.
            let existing = allowance_auto_enroll(ctx, student)?;
            if existing.is_some() {
                ctx.conn.execute(
                    "UPDATE enrollment_allowances SET auto_enroll = ?1
                     WHERE course_id = ?2 AND email = ?3",
                    (opts.auto_enroll, ctx.course_id, student),
                )?;
                status.insert(
                    student.clone(),
                    format!(
                        "user does not exist, enrollment already allowed, pending with auto enrollment {}",
                        on_off(opts.auto_enroll)
                    ),
                );
                continue;
            }
            ctx.conn.execute(
                "INSERT INTO enrollment_allowances(course_id, email, auto_enroll, created_at)
                 VALUES(?1, ?2, ?3, ?4)",
                (
                    ctx.course_id,
                    student,
                    opts.auto_enroll,
                    Utc::now().to_rfc3339(),
                ),
            )?;
            let mut entry = format!(
                "user does not exist, enrollment allowed, pending with auto enrollment {}",
                on_off(opts.auto_enroll)
            );
            if opts.email_students {
                let params = MailParams {
                    email_address: student.clone(),
                    full_name: None,
                    auto_enroll: opts.auto_enroll,
                    ..mail_base.clone()
                };
                if notifier.send(Template::AllowedEnroll, &params) {
                    entry.push_str(", email sent");
                }
            }
            status.insert(student.clone(), entry);
            continue;
        };

        if is_actively_enrolled(ctx, &user.id)? {
            status.insert(student.clone(), "already enrolled".to_string());
            continue;
        }

        match activate_enrollment(ctx, &user.id) {
            Ok(()) => {
                let mut entry = "added".to_string();
                if opts.email_students {
                    let params = MailParams {
                        email_address: student.clone(),
                        full_name: Some(user.full_name.clone()),
                        auto_enroll: opts.auto_enroll,
                        ..mail_base.clone()
                    };
                    if notifier.send(Template::EnrolledEnroll, &params) {
                        entry.push_str(", email sent");
                    }
                }
                status.insert(student.clone(), entry);
            }
            Err(e) => {
                warn!("enrollment activation failed for {}: {}", student, e);
                status.insert(student.clone(), "rejected".to_string());
            }
        }
    }

    Ok(partition(status))
}

/// Bulk unenroll. Allowance deletion counts as an un-enrollment even when
/// no account exists yet; a user with no enrollment record at all and no
/// allowance reports a swallowed failure and the batch continues.
pub fn unenroll_students(
    ctx: EnrollmentCtx<'_>,
    raw_list: &str,
    email_students: bool,
    mail_base: &MailParams,
    notifier: &mut dyn Notifier,
) -> anyhow::Result<ReconcileOutcome> {
    let old_students = split_identifiers(raw_list);
    let mut status: HashMap<String, String> = HashMap::new();

    for student in &old_students {
        let mut isok = false;
        if delete_allowance(ctx, student)? {
            status.insert(student.clone(), "un-enrolled".to_string());
            isok = true;
        }

        let Some(user) = find_user_by_email(ctx.conn, student)? else {
            if isok && email_students {
                // Invited but never signed up.
                let params = MailParams {
                    email_address: student.clone(),
                    full_name: None,
                    ..mail_base.clone()
                };
                if notifier.send(Template::AllowedUnenroll, &params) {
                    if let Some(entry) = status.get_mut(student.as_str()) {
                        entry.push_str(", email sent");
                    }
                }
            }
            continue;
        };

        match deactivate_enrollment_record(ctx, &user.id) {
            Ok(was_active) => {
                let mut entry = "un-enrolled".to_string();
                if was_active && email_students {
                    let params = MailParams {
                        email_address: student.clone(),
                        full_name: Some(user.full_name.clone()),
                        ..mail_base.clone()
                    };
                    if notifier.send(Template::EnrolledUnenroll, &params) {
                        entry.push_str(", email sent");
                    }
                }
                status.insert(student.clone(), entry);
            }
            Err(e) => {
                if !isok {
                    warn!("un-enroll failed for {}: {}", student, e);
                    status.insert(student.clone(), "Error! Failed to un-enroll".to_string());
                }
            }
        }
    }

    Ok(partition(status))
}

/// (identifier, status) table for display/export, sorted by identifier.
pub fn status_datatable(title: &str, status: &HashMap<String, String>) -> Datatable {
    let mut rows: Vec<(&String, &String)> = status.iter().collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    let mut dt = Datatable::new(title, vec!["StudentEmail".to_string(), "action".to_string()]);
    for (email, action) in rows {
        dt.push_row(vec![json!(email), json!(action)]);
    }
    dt
}

/// Overload pre-pass: deactivate active enrollments held by non-staff and
/// absent (case-insensitively) from the new list, then clear the whole
/// pending allowance table for the course. The full allowance reset is kept
/// as-is from the behavior this replaces; the list phase re-creates
/// allowances for emails it still wants.
fn overload_reset(
    ctx: EnrollmentCtx<'_>,
    new_students_lc: &[String],
    status: &mut HashMap<String, String>,
) -> anyhow::Result<()> {
    let mut stmt = ctx.conn.prepare(
        "SELECT e.user_id, u.email,
                (u.is_global_staff OR EXISTS(
                    SELECT 1 FROM course_roles r
                    WHERE r.course_id = e.course_id AND r.user_id = e.user_id
                      AND r.role IN ('staff', 'instructor')
                )) AS is_staff
         FROM enrollments e
         JOIN users u ON u.id = e.user_id
         WHERE e.course_id = ?1 AND e.is_active = 1
         ORDER BY u.email",
    )?;
    let enrolled = stmt
        .query_map([ctx.course_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (user_id, email, is_staff) in enrolled {
        if !is_staff && !new_students_lc.contains(&email.to_lowercase()) {
            status.insert(email, "deleted".to_string());
            ctx.conn.execute(
                "UPDATE enrollments SET is_active = 0 WHERE course_id = ?1 AND user_id = ?2",
                (ctx.course_id, &user_id),
            )?;
        } else {
            status.insert(email, "is staff".to_string());
        }
    }

    let mut stmt = ctx
        .conn
        .prepare("SELECT email FROM enrollment_allowances WHERE course_id = ?1")?;
    let pending = stmt
        .query_map([ctx.course_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    for email in pending {
        status.insert(email, "removed from pending enrollment list".to_string());
    }
    ctx.conn.execute(
        "DELETE FROM enrollment_allowances WHERE course_id = ?1",
        [ctx.course_id],
    )?;

    Ok(())
}

fn partition(status: HashMap<String, String>) -> ReconcileOutcome {
    let mut bucket = |wanted: &str| -> Vec<String> {
        let mut v: Vec<String> = status
            .iter()
            .filter(|(_, s)| s.as_str() == wanted)
            .map(|(k, _)| k.clone())
            .collect();
        v.sort();
        v
    };
    let added = bucket("added");
    let rejected = bucket("rejected");
    let deleted = bucket("deleted");
    ReconcileOutcome {
        status,
        added,
        rejected,
        deleted,
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

pub fn find_user_by_email(conn: &Connection, email: &str) -> anyhow::Result<Option<UserRow>> {
    let row = conn
        .query_row(
            "SELECT id, username, full_name, email FROM users WHERE email = ?1",
            [email],
            user_from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn find_user_by_username(conn: &Connection, username: &str) -> anyhow::Result<Option<UserRow>> {
    let row = conn
        .query_row(
            "SELECT id, username, full_name, email FROM users WHERE username = ?1",
            [username],
            user_from_row,
        )
        .optional()?;
    Ok(row)
}

/// An identifier containing `@` is an email, anything else a username.
pub fn find_user_by_identifier(
    conn: &Connection,
    identifier: &str,
) -> anyhow::Result<Option<UserRow>> {
    if identifier.contains('@') {
        find_user_by_email(conn, identifier)
    } else {
        find_user_by_username(conn, identifier)
    }
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        full_name: row.get(2)?,
        email: row.get(3)?,
    })
}

/// Roster source: active enrollees ordered by username.
pub fn list_active_enrollees(conn: &Connection, course_id: &str) -> anyhow::Result<Vec<Enrollee>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.username, u.full_name, u.email, u.external_email
         FROM enrollments e
         JOIN users u ON u.id = e.user_id
         WHERE e.course_id = ?1 AND e.is_active = 1
         ORDER BY u.username",
    )?;
    let rows = stmt
        .query_map([course_id], |row| {
            Ok(Enrollee {
                user_id: row.get(0)?,
                username: row.get(1)?,
                full_name: row.get(2)?,
                email: row.get(3)?,
                external_email: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn active_enrollment_count(conn: &Connection, course_id: &str) -> anyhow::Result<i64> {
    let n = conn.query_row(
        "SELECT COUNT(*) FROM enrollments WHERE course_id = ?1 AND is_active = 1",
        [course_id],
        |row| row.get(0),
    )?;
    Ok(n)
}

pub fn is_actively_enrolled(ctx: EnrollmentCtx<'_>, user_id: &str) -> anyhow::Result<bool> {
    let active: Option<bool> = ctx
        .conn
        .query_row(
            "SELECT is_active FROM enrollments WHERE course_id = ?1 AND user_id = ?2",
            (ctx.course_id, user_id),
            |row| row.get(0),
        )
        .optional()?;
    Ok(active.unwrap_or(false))
}

/// Creates or reactivates the enrollment record.
fn activate_enrollment(ctx: EnrollmentCtx<'_>, user_id: &str) -> anyhow::Result<()> {
    ctx.conn.execute(
        "INSERT INTO enrollments(course_id, user_id, is_active, created_at)
         VALUES(?1, ?2, 1, ?3)
         ON CONFLICT(course_id, user_id) DO UPDATE SET is_active = 1",
        (ctx.course_id, user_id, Utc::now().to_rfc3339()),
    )?;
    Ok(())
}

/// Deactivates the enrollment record, reporting whether it was active.
/// Fails when no record exists at all; deactivating an inactive record is
/// an idempotent no-op.
fn deactivate_enrollment_record(ctx: EnrollmentCtx<'_>, user_id: &str) -> anyhow::Result<bool> {
    let active: Option<bool> = ctx
        .conn
        .query_row(
            "SELECT is_active FROM enrollments WHERE course_id = ?1 AND user_id = ?2",
            (ctx.course_id, user_id),
            |row| row.get(0),
        )
        .optional()?;
    let Some(was_active) = active else {
        anyhow::bail!("no enrollment record");
    };
    ctx.conn.execute(
        "UPDATE enrollments SET is_active = 0 WHERE course_id = ?1 AND user_id = ?2",
        (ctx.course_id, user_id),
    )?;
    Ok(was_active)
}

fn allowance_auto_enroll(ctx: EnrollmentCtx<'_>, email: &str) -> anyhow::Result<Option<bool>> {
    let flag: Option<bool> = ctx
        .conn
        .query_row(
            "SELECT auto_enroll FROM enrollment_allowances WHERE course_id = ?1 AND email = ?2",
            (ctx.course_id, email),
            |row| row.get(0),
        )
        .optional()?;
    Ok(flag)
}

fn delete_allowance(ctx: EnrollmentCtx<'_>, email: &str) -> anyhow::Result<bool> {
    let n = ctx.conn.execute(
        "DELETE FROM enrollment_allowances WHERE course_id = ?1 AND email = ?2",
        (ctx.course_id, email),
    )?;
    Ok(n > 0)
}
