use rusqlite::Connection;

use crate::datatable::Datatable;
use crate::ipc::helpers::{course_from_params, db_conn, optional_str, respond_table, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::tasks;

fn task_history(conn: &Connection, params: &serde_json::Value) -> Result<Datatable, HandlerErr> {
    let course = course_from_params(conn, params)?;
    let problem = optional_str(params, "problem");
    let student = optional_str(params, "student");
    let title = match (&problem, &student) {
        (Some(p), _) => format!("Task history for problem {} in {}", p, course.course_key),
        (None, Some(s)) => format!("Task history for student {} in {}", s, course.course_key),
        (None, None) => format!("Task history for {}", course.course_key),
    };
    Ok(tasks::history(
        conn,
        &course.id,
        problem.as_deref(),
        student.as_deref(),
        &title,
    )?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    if req.method != "tasks.history" {
        return None;
    }
    let conn = match db_conn(state) {
        Ok(conn) => conn,
        Err(e) => return Some(e.response(&req.id)),
    };
    Some(match task_history(conn, &req.params) {
        Ok(table) => respond_table(req, &table),
        Err(e) => e.response(&req.id),
    })
}
