use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("instructord.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            external_email TEXT,
            is_global_staff INTEGER NOT NULL DEFAULT 0,
            gender TEXT,
            level_of_education TEXT,
            year_of_birth INTEGER,
            created_at TEXT
        )",
        [],
    )?;
    // Profile fields arrived after the first cut of the users table.
    ensure_users_profile_columns(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            course_key TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            grading_policy TEXT NOT NULL,
            remote_gradebook_name TEXT,
            created_at TEXT
        )",
        [],
    )?;
    ensure_courses_remote_gradebook(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            course_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            is_active INTEGER NOT NULL,
            created_at TEXT,
            PRIMARY KEY(course_id, user_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_user ON enrollments(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollment_allowances(
            course_id TEXT NOT NULL,
            email TEXT NOT NULL,
            auto_enroll INTEGER NOT NULL DEFAULT 0,
            created_at TEXT,
            PRIMARY KEY(course_id, email),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_roles(
            course_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            PRIMARY KEY(course_id, user_id, role),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_roles_course ON course_roles(course_id, role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS forum_roles(
            course_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            PRIMARY KEY(course_id, user_id, role),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_forum_roles_course ON forum_roles(course_id, role)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS problems(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            display_name TEXT NOT NULL,
            category TEXT NOT NULL,
            max_points REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            UNIQUE(course_id, name),
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_problems_course ON problems(course_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS problem_states(
            problem_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            earned REAL NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            answer TEXT,
            updated_at TEXT,
            PRIMARY KEY(problem_id, user_id),
            FOREIGN KEY(problem_id) REFERENCES problems(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_problem_states_user ON problem_states(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_cache(
            course_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            gradeset TEXT NOT NULL,
            computed_at TEXT NOT NULL,
            PRIMARY KEY(course_id, user_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tasks(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            task_type TEXT NOT NULL,
            problem TEXT,
            student TEXT,
            requester TEXT NOT NULL,
            state TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            duration_ms INTEGER,
            task_output TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tasks_course ON tasks(course_id, submitted_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mail_outbox(
            id TEXT PRIMARY KEY,
            template TEXT NOT NULL,
            recipient TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            sent_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mail_outbox_recipient ON mail_outbox(recipient)",
        [],
    )?;

    Ok(())
}

fn ensure_users_profile_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "users", "gender")? {
        conn.execute("ALTER TABLE users ADD COLUMN gender TEXT", [])?;
    }
    if !table_has_column(conn, "users", "level_of_education")? {
        conn.execute("ALTER TABLE users ADD COLUMN level_of_education TEXT", [])?;
    }
    if !table_has_column(conn, "users", "year_of_birth")? {
        conn.execute("ALTER TABLE users ADD COLUMN year_of_birth INTEGER", [])?;
    }
    Ok(())
}

fn ensure_courses_remote_gradebook(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "courses", "remote_gradebook_name")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE courses ADD COLUMN remote_gradebook_name TEXT",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
