
use serde_json::json;
use test_support::{error_code, request, request_ok, rows, spawn_sidecar, temp_dir};

const COURSE: &str = "Campus/RO101/2026";

fn seed(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    workspace: &std::path::Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s2",
        "users.create",
        json!({ "username": "ada", "email": "ada@campus.test", "fullName": "Ada Lovelace" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s3",
        "courses.create",
        json!({ "courseKey": COURSE, "displayName": "Roles 101" }),
    );
}

#[test]
fn course_role_grant_and_revoke_messages() {
    let workspace = temp_dir("instructord-roles-grant");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    let added = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "roles.add",
        json!({ "courseKey": COURSE, "role": "staff", "identifier": "ada" }),
    );
    assert_eq!(added.get("added"), Some(&json!(true)));
    assert_eq!(
        added.get("message").and_then(|v| v.as_str()),
        Some("Added ada to staff")
    );

    let repeat = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "roles.add",
        json!({ "courseKey": COURSE, "role": "staff", "identifier": "ada" }),
    );
    assert_eq!(repeat.get("added"), Some(&json!(false)));
    assert_eq!(
        repeat.get("message").and_then(|v| v.as_str()),
        Some("ada already holds staff")
    );

    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "roles.list",
        json!({ "courseKey": COURSE, "role": "staff" }),
    );
    assert_eq!(
        listing.get("title").and_then(|v| v.as_str()),
        Some(format!("List of staff in course {}", COURSE).as_str())
    );
    assert_eq!(
        rows(&listing),
        vec![vec![json!("ada"), json!("ada@campus.test")]]
    );

    let bad = request(
        &mut stdin,
        &mut reader,
        "4",
        "roles.add",
        json!({ "courseKey": COURSE, "role": "czar", "identifier": "ada" }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "roles.remove",
        json!({ "courseKey": COURSE, "role": "staff", "identifier": "ada" }),
    );
    assert_eq!(removed.get("removed"), Some(&json!(true)));
    assert_eq!(
        removed.get("message").and_then(|v| v.as_str()),
        Some("Removed ada from staff")
    );

    let nothing = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "roles.remove",
        json!({ "courseKey": COURSE, "role": "staff", "identifier": "ada" }),
    );
    assert_eq!(nothing.get("removed"), Some(&json!(false)));
    assert_eq!(
        nothing.get("message").and_then(|v| v.as_str()),
        Some("ada does not hold staff")
    );
}

#[test]
fn forum_administrator_requires_staff_access_first() {
    let workspace = temp_dir("instructord-roles-forum");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    seed(&mut stdin, &mut reader, &workspace);

    // Refusal comes back as a message, not an error.
    let refused = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "forum.add",
        json!({ "courseKey": COURSE, "role": "administrator", "identifier": "ada" }),
    );
    assert_eq!(refused.get("added"), Some(&json!(false)));
    assert_eq!(
        refused.get("message").and_then(|v| v.as_str()),
        Some(
            "Error: user ada should first be added as staff before adding \
             as a forum administrator, cancelled"
        )
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "roles.add",
        json!({ "courseKey": COURSE, "role": "staff", "identifier": "ada" }),
    );
    let granted = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "forum.add",
        json!({ "courseKey": COURSE, "role": "administrator", "identifier": "ada" }),
    );
    assert_eq!(granted.get("added"), Some(&json!(true)));

    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "forum.list",
        json!({ "courseKey": COURSE, "role": "administrator" }),
    );
    assert_eq!(rows(&listing).len(), 1);

    // Global staff bypasses the course role requirement.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "users.create",
        json!({
            "username": "root",
            "email": "root@campus.test",
            "fullName": "Root",
            "isGlobalStaff": true
        }),
    );
    let global = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "forum.add",
        json!({ "courseKey": COURSE, "role": "administrator", "identifier": "root" }),
    );
    assert_eq!(global.get("added"), Some(&json!(true)));

    // Moderators need no staff standing.
    let moderator = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "forum.add",
        json!({ "courseKey": COURSE, "role": "moderator", "identifier": "ada" }),
    );
    assert_eq!(moderator.get("added"), Some(&json!(true)));
}
