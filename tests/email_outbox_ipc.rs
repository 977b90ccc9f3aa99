
use serde_json::json;
use test_support::{error_code, request, request_ok, rows, spawn_sidecar, temp_dir};

const COURSE: &str = "Campus/EM101/2026";

fn outbox_count(workspace: &std::path::Path, template: &str) -> i64 {
    let conn = rusqlite::Connection::open(workspace.join("instructord.sqlite3"))
        .expect("open workspace db");
    conn.query_row(
        "SELECT COUNT(*) FROM mail_outbox WHERE template = ?1",
        [template],
        |row| row.get(0),
    )
    .expect("count outbox rows")
}

fn write_mail_config(workspace: &std::path::Path) {
    std::fs::write(
        workspace.join("instructord.toml"),
        "site_name = \"Campus Online\"\nemail_enabled = true\n",
    )
    .expect("write workspace config");
}

#[test]
fn enrollment_mail_flows_through_the_outbox() {
    let workspace = temp_dir("instructord-email-enroll");
    write_mail_config(&workspace);
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({ "username": "ada", "email": "ada@campus.test", "fullName": "Ada Lovelace" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({ "courseKey": COURSE, "displayName": "Email 101" }),
    );

    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollment.enroll",
        json!({
            "courseKey": COURSE,
            "students": "ada@campus.test, ghost@campus.test",
            "emailStudents": true,
            "autoEnroll": true
        }),
    );
    let data = rows(enrolled.get("table").expect("status table"));
    assert_eq!(
        data[0],
        vec![json!("ada@campus.test"), json!("added, email sent")]
    );
    assert_eq!(
        data[1],
        vec![
            json!("ghost@campus.test"),
            json!("user does not exist, enrollment allowed, pending with auto enrollment on, email sent")
        ]
    );
    assert_eq!(outbox_count(&workspace, "enrolled_enroll"), 1);
    assert_eq!(outbox_count(&workspace, "allowed_enroll"), 1);

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollment.unenroll",
        json!({
            "courseKey": COURSE,
            "students": "ghost@campus.test",
            "emailStudents": true
        }),
    );
    let data = rows(removed.get("table").expect("status table"));
    assert_eq!(
        data[0],
        vec![json!("ghost@campus.test"), json!("un-enrolled, email sent")]
    );
    assert_eq!(outbox_count(&workspace, "allowed_unenroll"), 1);
}

#[test]
fn bulk_email_resolves_audiences_and_queues_one_message_each() {
    let workspace = temp_dir("instructord-email-bulk");
    write_mail_config(&workspace);
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    for (id, username) in [("2", "ada"), ("3", "bob")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "users.create",
            json!({
                "username": username,
                "email": format!("{}@campus.test", username),
                "fullName": username
            }),
        );
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "courses.create",
        json!({ "courseKey": COURSE, "displayName": "Email 101" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "enrollment.enroll",
        json!({ "courseKey": COURSE, "students": "ada@campus.test, bob@campus.test" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "roles.add",
        json!({ "courseKey": COURSE, "role": "staff", "identifier": "ada" }),
    );

    let staff = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "email.send_bulk",
        json!({
            "courseKey": COURSE,
            "sendTo": "staff",
            "subject": "Staff note",
            "body": "meeting at noon"
        }),
    );
    assert_eq!(staff.get("state"), Some(&json!("SUCCESS")));
    assert_eq!(
        staff.get("output"),
        Some(&json!({ "attempted": 1, "succeeded": 1, "sendTo": "staff" }))
    );

    let everyone = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "email.send_bulk",
        json!({
            "courseKey": COURSE,
            "sendTo": "all",
            "subject": "Course note",
            "body": "welcome"
        }),
    );
    assert_eq!(
        everyone.get("output"),
        Some(&json!({ "attempted": 2, "succeeded": 2, "sendTo": "all" }))
    );

    let myself = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "email.send_bulk",
        json!({
            "courseKey": COURSE,
            "sendTo": "myself",
            "subject": "Draft",
            "body": "to me",
            "requester": "bob"
        }),
    );
    assert_eq!(
        myself.get("output"),
        Some(&json!({ "attempted": 1, "succeeded": 1, "sendTo": "myself" }))
    );

    let bad = request(
        &mut stdin,
        &mut reader,
        "10",
        "email.send_bulk",
        json!({
            "courseKey": COURSE,
            "sendTo": "everyone",
            "subject": "x",
            "body": "y"
        }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    assert_eq!(outbox_count(&workspace, "bulk_email"), 4);

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "tasks.history",
        json!({ "courseKey": COURSE }),
    );
    let sends = rows(&history)
        .into_iter()
        .filter(|row| row[0] == json!("bulk_email"))
        .count();
    assert_eq!(sends, 3);
}

#[test]
fn bulk_email_is_disabled_without_workspace_opt_in() {
    let workspace = temp_dir("instructord-email-disabled");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "courseKey": COURSE, "displayName": "Email 101" }),
    );

    let refused = request(
        &mut stdin,
        &mut reader,
        "3",
        "email.send_bulk",
        json!({ "courseKey": COURSE, "sendTo": "all", "subject": "x", "body": "y" }),
    );
    assert_eq!(error_code(&refused), "feature_disabled");
    assert_eq!(
        refused
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str()),
        Some("bulk email is disabled for this workspace")
    );
}
