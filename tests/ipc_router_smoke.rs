use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_instructord");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn instructord");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("instructord-router-smoke");
    let csv_out = workspace.join("smoke-grades.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health.check", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({ "username": "smokeuser", "email": "smoke@campus.test", "fullName": "Smoke User" }),
    );
    let _ = request(&mut stdin, &mut reader, "4", "users.list", json!({}));
    let created = request(
        &mut stdin,
        &mut reader,
        "5",
        "courses.create",
        json!({ "courseKey": "Smoke/101/2026", "displayName": "Smoke Course" }),
    );
    assert!(created
        .get("result")
        .and_then(|v| v.get("courseId"))
        .and_then(|v| v.as_str())
        .is_some());

    let _ = request(&mut stdin, &mut reader, "6", "courses.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "dashboard.overview",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "enrollment.enroll",
        json!({ "courseKey": "Smoke/101/2026", "students": "smoke@campus.test" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "enrollment.count",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "enrollment.pending",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "enrollment.status",
        json!({ "courseKey": "Smoke/101/2026", "identifier": "smokeuser" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "problems.create",
        json!({ "courseKey": "Smoke/101/2026", "name": "hw1", "maxPoints": 10.0 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "problems.list",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "problems.record_response",
        json!({
            "courseKey": "Smoke/101/2026",
            "problem": "hw1",
            "identifier": "smokeuser",
            "earned": 8.0
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "grades.summary",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "grades.export_csv",
        json!({ "courseKey": "Smoke/101/2026", "path": csv_out.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "grades.grading_config",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "grades.cache_all",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "roles.add",
        json!({ "courseKey": "Smoke/101/2026", "role": "staff", "identifier": "smokeuser" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "roles.list",
        json!({ "courseKey": "Smoke/101/2026", "role": "staff" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "forum.add",
        json!({ "courseKey": "Smoke/101/2026", "role": "moderator", "identifier": "smokeuser" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "forum.remove",
        json!({ "courseKey": "Smoke/101/2026", "role": "moderator", "identifier": "smokeuser" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "reports.students",
        json!({ "courseKey": "Smoke/101/2026", "withProfile": true }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "reports.anon_ids",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "reports.responses",
        json!({ "courseKey": "Smoke/101/2026", "problem": "hw1" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "reports.answer_distributions",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "reports.item_statistics",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "reports.course_stats",
        json!({ "courseKey": "Smoke/101/2026", "feature": "gender" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "29",
        "problems.rescore",
        json!({ "courseKey": "Smoke/101/2026", "problem": "hw1" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "30",
        "tasks.history",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    // No analytics endpoint configured: dashboard degrades to an empty
    // query map instead of failing.
    let _ = request(
        &mut stdin,
        &mut reader,
        "31",
        "analytics.dashboard",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    // Remote gradebook and bulk email are unconfigured here; the calls
    // must still route to their handlers.
    let _ = request(
        &mut stdin,
        &mut reader,
        "32",
        "gradebook.assignments",
        json!({ "courseKey": "Smoke/101/2026" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "33",
        "email.send_bulk",
        json!({
            "courseKey": "Smoke/101/2026",
            "sendTo": "all",
            "subject": "hello",
            "body": "smoke"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "34",
        "problems.reset_attempts",
        json!({ "courseKey": "Smoke/101/2026", "problem": "hw1", "identifier": "smokeuser" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "35",
        "problems.delete_state",
        json!({ "courseKey": "Smoke/101/2026", "problem": "hw1", "identifier": "smokeuser" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "36",
        "enrollment.unenroll",
        json!({ "courseKey": "Smoke/101/2026", "students": "smoke@campus.test" }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
