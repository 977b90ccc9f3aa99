use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::datatable::Datatable;

pub const STATE_PROGRESS: &str = "PROGRESS";
pub const STATE_SUCCESS: &str = "SUCCESS";
pub const STATE_FAILURE: &str = "FAILURE";

#[derive(Debug, Clone)]
pub struct TaskError {
    pub code: String,
    pub message: String,
}

impl TaskError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<rusqlite::Error> for TaskError {
    fn from(e: rusqlite::Error) -> Self {
        TaskError::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct TaskSpec<'a> {
    pub task_type: &'a str,
    pub problem: Option<&'a str>,
    pub student: Option<&'a str>,
    pub requester: &'a str,
}

#[derive(Debug, Clone)]
pub struct SubmittedTask {
    pub id: String,
    pub state: String,
    pub output: Value,
}

pub struct TaskRunner<'a> {
    pub conn: &'a Connection,
    pub course_id: &'a str,
}

impl<'a> TaskRunner<'a> {
    /// Runs `work` under a recorded task. A task with the same type and
    /// scope still in progress rejects the submission; a failing `work`
    /// is not an error here, it lands in history as FAILURE.
    pub fn submit<F>(&self, spec: &TaskSpec<'_>, work: F) -> Result<SubmittedTask, TaskError>
    where
        F: FnOnce() -> Result<Value, String>,
    {
        let active: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tasks
             WHERE course_id = ?1 AND task_type = ?2 AND state = ?3
               AND COALESCE(problem, '') = COALESCE(?4, '')
               AND COALESCE(student, '') = COALESCE(?5, '')",
            (
                self.course_id,
                spec.task_type,
                STATE_PROGRESS,
                spec.problem,
                spec.student,
            ),
            |row| row.get(0),
        )?;
        if active > 0 {
            return Err(TaskError::new(
                "task_submission_failed",
                format!("a {} task is already running for this scope", spec.task_type),
            ));
        }

        let task_id = Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO tasks(id, course_id, task_type, problem, student, requester,
                                   state, submitted_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                (
                    &task_id,
                    self.course_id,
                    spec.task_type,
                    spec.problem,
                    spec.student,
                    spec.requester,
                    STATE_PROGRESS,
                    Utc::now().to_rfc3339(),
                ),
            )
            .map_err(|e| TaskError::new("db_update_failed", e.to_string()))?;

        let started = Instant::now();
        let (state, output) = match work() {
            Ok(output) => (STATE_SUCCESS, output),
            Err(message) => (STATE_FAILURE, serde_json::json!({ "error": message })),
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        let raw_output = output.to_string();
        self.conn
            .execute(
                "UPDATE tasks SET state = ?1, duration_ms = ?2, task_output = ?3 WHERE id = ?4",
                (state, duration_ms, &raw_output, &task_id),
            )
            .map_err(|e| TaskError::new("db_update_failed", e.to_string()))?;
        info!(task_id = %task_id, task_type = spec.task_type, state, "task finished");

        Ok(SubmittedTask {
            id: task_id,
            state: state.to_string(),
            output,
        })
    }
}

/// Task history table, newest first, optionally narrowed to one problem
/// and/or one student.
pub fn history(
    conn: &Connection,
    course_id: &str,
    problem: Option<&str>,
    student: Option<&str>,
    title: &str,
) -> Result<Datatable, TaskError> {
    let mut table = Datatable::new(
        title,
        vec![
            "Task Type".to_string(),
            "Task Id".to_string(),
            "Requester".to_string(),
            "Submitted".to_string(),
            "Duration (sec)".to_string(),
            "Task State".to_string(),
            "Task Status".to_string(),
            "Task Output".to_string(),
        ],
    );

    let mut stmt = conn.prepare(
        "SELECT task_type, id, requester, submitted_at, duration_ms, state, task_output
         FROM tasks
         WHERE course_id = ?1
           AND (?2 IS NULL OR problem = ?2)
           AND (?3 IS NULL OR student = ?3)
         ORDER BY submitted_at DESC, id",
    )?;
    let rows = stmt
        .query_map((course_id, problem, student), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<i64>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (task_type, id, requester, submitted_at, duration_ms, state, raw_output) in rows {
        let output: Value = raw_output
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or(Value::Null);
        table.push_row(vec![
            Value::from(task_type),
            Value::from(id),
            Value::from(requester),
            Value::from(render_submitted(&submitted_at)),
            duration_ms
                .map(|ms| Value::from(ms as f64 / 1000.0))
                .unwrap_or(Value::Null),
            Value::from(state.clone()),
            Value::from(status_message(&state, &output)),
            output,
        ]);
    }
    Ok(table)
}

fn render_submitted(raw: &str) -> String {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => ts
            .with_timezone(&Utc)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        Err(_) => raw.to_string(),
    }
}

fn status_message(state: &str, output: &Value) -> String {
    if let Some(message) = output.get("error").and_then(Value::as_str) {
        return message.to_string();
    }
    match (
        output.get("succeeded").and_then(Value::as_i64),
        output.get("attempted").and_then(Value::as_i64),
    ) {
        (Some(succeeded), Some(attempted)) => {
            format!("Processed {} of {}", succeeded, attempted)
        }
        _ => state.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO courses(id, course_key, display_name, grading_policy)
             VALUES('c1', 'TestX/101/2026', 'Test Course', '{}')",
            [],
        )
        .unwrap();
        conn
    }

    fn spec<'a>(problem: Option<&'a str>, student: Option<&'a str>) -> TaskSpec<'a> {
        TaskSpec {
            task_type: "rescore",
            problem,
            student,
            requester: "staff",
        }
    }

    #[test]
    fn submit_records_a_success_row() {
        let conn = setup();
        let runner = TaskRunner {
            conn: &conn,
            course_id: "c1",
        };
        let task = runner
            .submit(&spec(Some("hw1"), None), || {
                Ok(serde_json::json!({ "attempted": 4, "succeeded": 4 }))
            })
            .unwrap();
        assert_eq!(task.state, STATE_SUCCESS);

        let (state, output): (String, String) = conn
            .query_row(
                "SELECT state, task_output FROM tasks WHERE id = ?1",
                [&task.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(state, STATE_SUCCESS);
        assert!(output.contains("\"succeeded\":4"));
    }

    #[test]
    fn failing_work_lands_in_history_as_failure() {
        let conn = setup();
        let runner = TaskRunner {
            conn: &conn,
            course_id: "c1",
        };
        let task = runner
            .submit(&spec(Some("hw1"), Some("ada")), || {
                Err("problem state missing".to_string())
            })
            .unwrap();
        assert_eq!(task.state, STATE_FAILURE);

        let table = history(&conn, "c1", None, None, "history").unwrap();
        assert_eq!(table.data.len(), 1);
        assert_eq!(table.data[0][5], Value::from(STATE_FAILURE));
        assert_eq!(table.data[0][6], Value::from("problem state missing"));
    }

    #[test]
    fn duplicate_active_scope_is_rejected() {
        let conn = setup();
        conn.execute(
            "INSERT INTO tasks(id, course_id, task_type, problem, student, requester,
                               state, submitted_at)
             VALUES('t-stuck', 'c1', 'rescore', 'hw1', NULL, 'staff', 'PROGRESS',
                    '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let runner = TaskRunner {
            conn: &conn,
            course_id: "c1",
        };

        let err = runner
            .submit(&spec(Some("hw1"), None), || Ok(Value::Null))
            .unwrap_err();
        assert_eq!(err.code, "task_submission_failed");

        // A different problem scope is a different task.
        let ok = runner.submit(&spec(Some("hw2"), None), || Ok(Value::Null));
        assert!(ok.is_ok());
    }

    #[test]
    fn history_filters_and_column_shape() {
        let conn = setup();
        let runner = TaskRunner {
            conn: &conn,
            course_id: "c1",
        };
        runner
            .submit(&spec(Some("hw1"), Some("ada")), || {
                Ok(serde_json::json!({ "attempted": 1, "succeeded": 1 }))
            })
            .unwrap();
        runner
            .submit(&spec(Some("hw2"), None), || Ok(Value::Null))
            .unwrap();

        let all = history(&conn, "c1", None, None, "history").unwrap();
        assert_eq!(all.header.len(), 8);
        assert_eq!(all.data.len(), 2);

        let narrowed = history(&conn, "c1", Some("hw1"), Some("ada"), "history").unwrap();
        assert_eq!(narrowed.data.len(), 1);
        assert_eq!(narrowed.data[0][6], Value::from("Processed 1 of 1"));
    }
}
