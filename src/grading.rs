use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct GradingError {
    pub code: String,
    pub message: String,
}

impl GradingError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for GradingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for GradingError {}

impl From<rusqlite::Error> for GradingError {
    fn from(e: rusqlite::Error) -> Self {
        GradingError::new("db_query_failed", e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct GradingCtx<'a> {
    pub conn: &'a Connection,
    pub course_id: &'a str,
}

/// Course grading policy: weighted categories over the course's problems,
/// plus letter-grade cutoffs. Stored as JSON on the course record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingPolicy {
    #[serde(default)]
    pub categories: Vec<GradeCategory>,
    #[serde(default)]
    pub cutoffs: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeCategory {
    pub label: String,
    /// Column prefix in breakdowns; falls back to `label` when empty.
    #[serde(default)]
    pub short_label: String,
    pub weight: f64,
    /// How many lowest-scoring problems in the category are ignored.
    #[serde(default)]
    pub drop_lowest: usize,
}

impl GradeCategory {
    fn short(&self) -> &str {
        if self.short_label.is_empty() {
            &self.label
        } else {
            &self.short_label
        }
    }
}

/// Per-student computed grade breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gradeset {
    pub percent: f64,
    pub grade: Option<String>,
    pub section_breakdown: Vec<SectionScore>,
    pub raw_scores: Vec<RawScore>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionScore {
    pub label: String,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawScore {
    pub section: String,
    pub earned: f64,
    pub possible: f64,
}

pub fn default_policy() -> GradingPolicy {
    GradingPolicy {
        categories: vec![
            GradeCategory {
                label: "Homework".to_string(),
                short_label: "HW".to_string(),
                weight: 0.15,
                drop_lowest: 2,
            },
            GradeCategory {
                label: "Lab".to_string(),
                short_label: "Lab".to_string(),
                weight: 0.15,
                drop_lowest: 2,
            },
            GradeCategory {
                label: "Midterm Exam".to_string(),
                short_label: "Midterm".to_string(),
                weight: 0.3,
                drop_lowest: 0,
            },
            GradeCategory {
                label: "Final Exam".to_string(),
                short_label: "Final".to_string(),
                weight: 0.4,
                drop_lowest: 0,
            },
        ],
        cutoffs: BTreeMap::from([
            ("A".to_string(), 0.87),
            ("B".to_string(), 0.7),
            ("C".to_string(), 0.6),
        ]),
    }
}

pub fn parse_grading_policy(raw: &str) -> Result<GradingPolicy, GradingError> {
    let policy: GradingPolicy = serde_json::from_str(raw)
        .map_err(|e| GradingError::new("bad_grading_policy", e.to_string()))?;
    validate_policy(&policy)?;
    Ok(policy)
}

pub fn validate_policy(policy: &GradingPolicy) -> Result<(), GradingError> {
    for cat in &policy.categories {
        if cat.label.trim().is_empty() {
            return Err(GradingError::new(
                "bad_grading_policy",
                "category label must not be empty",
            ));
        }
        if !cat.weight.is_finite() || cat.weight < 0.0 {
            return Err(GradingError::new(
                "bad_grading_policy",
                format!("bad weight for category {}", cat.label),
            ));
        }
    }
    for (letter, cutoff) in &policy.cutoffs {
        if !cutoff.is_finite() || *cutoff <= 0.0 || *cutoff > 1.0 {
            return Err(GradingError::new(
                "bad_grading_policy",
                format!("cutoff for {} must be in (0, 1]", letter),
            ));
        }
    }
    Ok(())
}

pub fn course_policy(conn: &Connection, course_id: &str) -> Result<GradingPolicy, GradingError> {
    let raw: String = conn.query_row(
        "SELECT grading_policy FROM courses WHERE id = ?1",
        [course_id],
        |row| row.get(0),
    )?;
    parse_grading_policy(&raw)
}

struct ProblemRow {
    id: String,
    display_name: String,
    category: String,
    max_points: f64,
}

/// Live gradeset for one student: raw per-problem scores plus the weighted
/// category breakdown. Unattempted problems count as zero in the breakdown
/// but are absent from `raw_scores`.
pub fn compute_gradeset(ctx: &GradingCtx<'_>, user_id: &str) -> Result<Gradeset, GradingError> {
    let policy = course_policy(ctx.conn, ctx.course_id)?;

    let mut stmt = ctx.conn.prepare(
        "SELECT id, display_name, category, max_points
         FROM problems WHERE course_id = ?1
         ORDER BY sort_order, name",
    )?;
    let problems = stmt
        .query_map([ctx.course_id], |row| {
            Ok(ProblemRow {
                id: row.get(0)?,
                display_name: row.get(1)?,
                category: row.get(2)?,
                max_points: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = ctx.conn.prepare(
        "SELECT ps.problem_id, ps.earned
         FROM problem_states ps
         JOIN problems p ON p.id = ps.problem_id
         WHERE p.course_id = ?1 AND ps.user_id = ?2",
    )?;
    let earned: HashMap<String, f64> = stmt
        .query_map((ctx.course_id, user_id), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;

    let raw_scores: Vec<RawScore> = problems
        .iter()
        .filter_map(|p| {
            earned.get(&p.id).map(|&e| RawScore {
                section: p.display_name.clone(),
                earned: e,
                possible: p.max_points,
            })
        })
        .collect();

    let mut section_breakdown = Vec::new();
    let mut total = 0.0;
    for cat in &policy.categories {
        let members: Vec<&ProblemRow> =
            problems.iter().filter(|p| p.category == cat.label).collect();
        if members.is_empty() {
            continue;
        }
        let fractions: Vec<f64> = members
            .iter()
            .map(|p| {
                let e = earned.get(&p.id).copied().unwrap_or(0.0);
                if p.max_points > 0.0 {
                    e / p.max_points
                } else {
                    0.0
                }
            })
            .collect();

        let cat_avg = if members.len() == 1 {
            section_breakdown.push(SectionScore {
                label: cat.short().to_string(),
                percent: fractions[0],
            });
            fractions[0]
        } else {
            for (i, fraction) in fractions.iter().enumerate() {
                section_breakdown.push(SectionScore {
                    label: format!("{} {:02}", cat.short(), i + 1),
                    percent: *fraction,
                });
            }
            let avg = average_with_drops(&fractions, cat.drop_lowest);
            section_breakdown.push(SectionScore {
                label: format!("{} Avg", cat.short()),
                percent: avg,
            });
            avg
        };
        total += cat.weight * cat_avg;
    }

    Ok(Gradeset {
        percent: total,
        grade: letter_grade(&policy.cutoffs, total),
        section_breakdown,
        raw_scores,
    })
}

fn average_with_drops(fractions: &[f64], drop_lowest: usize) -> f64 {
    let mut sorted: Vec<f64> = fractions.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let kept = &sorted[drop_lowest.min(sorted.len())..];
    if kept.is_empty() {
        return 0.0;
    }
    kept.iter().sum::<f64>() / kept.len() as f64
}

fn letter_grade(cutoffs: &BTreeMap<String, f64>, percent: f64) -> Option<String> {
    cutoffs
        .iter()
        .filter(|(_, cutoff)| percent >= **cutoff)
        .max_by(|a, b| {
            a.1.partial_cmp(b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.0.cmp(a.0))
        })
        .map(|(letter, _)| letter.clone())
}

/// Cached gradeset read for offline mode, `None` when never computed.
pub fn cached_gradeset(
    ctx: &GradingCtx<'_>,
    user_id: &str,
) -> Result<Option<Gradeset>, GradingError> {
    let raw: Option<String> = ctx
        .conn
        .query_row(
            "SELECT gradeset FROM grade_cache WHERE course_id = ?1 AND user_id = ?2",
            (ctx.course_id, user_id),
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        None => Ok(None),
        Some(raw) => {
            let gradeset: Gradeset = serde_json::from_str(&raw)
                .map_err(|e| GradingError::new("bad_grade_cache", e.to_string()))?;
            Ok(Some(gradeset))
        }
    }
}

pub fn store_cached_gradeset(
    ctx: &GradingCtx<'_>,
    user_id: &str,
    gradeset: &Gradeset,
) -> Result<(), GradingError> {
    let raw = serde_json::to_string(gradeset)
        .map_err(|e| GradingError::new("bad_grade_cache", e.to_string()))?;
    ctx.conn.execute(
        "INSERT INTO grade_cache(course_id, user_id, gradeset, computed_at)
         VALUES(?1, ?2, ?3, ?4)
         ON CONFLICT(course_id, user_id) DO UPDATE SET gradeset = excluded.gradeset,
             computed_at = excluded.computed_at",
        (ctx.course_id, user_id, raw, Utc::now().to_rfc3339()),
    )?;
    Ok(())
}

/// Gradeset with source selection: live computation, or the offline cache
/// when `use_offline` is set. A cache miss is an error the caller surfaces.
pub fn student_gradeset(
    ctx: &GradingCtx<'_>,
    user_id: &str,
    use_offline: bool,
) -> Result<Gradeset, GradingError> {
    if use_offline {
        match cached_gradeset(ctx, user_id)? {
            Some(g) => Ok(g),
            None => Err(GradingError::new(
                "no_offline_grades",
                format!("no cached gradeset for user {}", user_id),
            )),
        }
    } else {
        compute_gradeset(ctx, user_id)
    }
}

/// Human-readable dump of the course's grading configuration.
pub fn grading_config_text(
    conn: &Connection,
    course_id: &str,
    course_key: &str,
) -> Result<String, GradingError> {
    let policy = course_policy(conn, course_id)?;

    let mut counts: HashMap<String, i64> = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT category, COUNT(*) FROM problems WHERE course_id = ?1 GROUP BY category",
    )?;
    let rows = stmt
        .query_map([course_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (category, n) in rows {
        counts.insert(category, n);
    }

    let mut text = format!("Grading configuration for {}\n", course_key);
    text.push_str("Graded categories:\n");
    for cat in &policy.categories {
        text.push_str(&format!(
            "  category={}, short={}, weight={}, drop_lowest={}, problems={}\n",
            cat.label,
            cat.short(),
            cat.weight,
            cat.drop_lowest,
            counts.get(&cat.label).copied().unwrap_or(0)
        ));
    }
    let mut cutoffs: Vec<(&String, &f64)> = policy.cutoffs.iter().collect();
    cutoffs.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
    let rendered: Vec<String> = cutoffs
        .iter()
        .map(|(letter, cutoff)| format!("{} >= {}", letter, cutoff))
        .collect();
    text.push_str(&format!("Grade cutoffs: {}\n", rendered.join(", ")));
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        let policy = serde_json::to_string(&GradingPolicy {
            categories: vec![
                GradeCategory {
                    label: "Homework".to_string(),
                    short_label: "HW".to_string(),
                    weight: 0.4,
                    drop_lowest: 1,
                },
                GradeCategory {
                    label: "Final Exam".to_string(),
                    short_label: "Final".to_string(),
                    weight: 0.6,
                    drop_lowest: 0,
                },
            ],
            cutoffs: BTreeMap::from([
                ("A".to_string(), 0.87),
                ("B".to_string(), 0.7),
                ("C".to_string(), 0.6),
            ]),
        })
        .unwrap();
        conn.execute(
            "INSERT INTO courses(id, course_key, display_name, grading_policy)
             VALUES('c1', 'TestX/101/2026', 'Test Course', ?1)",
            [policy],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO users(id, username, email, full_name)
             VALUES('u1', 'ada', 'ada@x.com', 'Ada')",
            [],
        )
        .unwrap();
        for (i, (name, category, max)) in [
            ("hw1", "Homework", 10.0),
            ("hw2", "Homework", 10.0),
            ("hw3", "Homework", 10.0),
            ("final", "Final Exam", 100.0),
        ]
        .iter()
        .enumerate()
        {
            conn.execute(
                "INSERT INTO problems(id, course_id, name, display_name, category, max_points, sort_order)
                 VALUES(?1, 'c1', ?2, ?3, ?4, ?5, ?6)",
                (format!("p-{}", name), name, format!("Problem {}", name), category, max, i as i64),
            )
            .unwrap();
        }
        conn
    }

    fn record(conn: &Connection, problem: &str, earned: f64) {
        conn.execute(
            "INSERT INTO problem_states(problem_id, user_id, earned, attempts)
             VALUES(?1, 'u1', ?2, 1)",
            (format!("p-{}", problem), earned),
        )
        .unwrap();
    }

    #[test]
    fn drop_lowest_ignores_the_worst_homework() {
        let conn = setup();
        record(&conn, "hw1", 10.0);
        record(&conn, "hw2", 5.0);
        // hw3 never attempted: a zero, and the dropped one.
        record(&conn, "final", 80.0);

        let ctx = GradingCtx {
            conn: &conn,
            course_id: "c1",
        };
        let gradeset = compute_gradeset(&ctx, "u1").unwrap();

        let labels: Vec<&str> = gradeset
            .section_breakdown
            .iter()
            .map(|s| s.label.as_str())
            .collect();
        assert_eq!(labels, vec!["HW 01", "HW 02", "HW 03", "HW Avg", "Final"]);

        let hw_avg = gradeset
            .section_breakdown
            .iter()
            .find(|s| s.label == "HW Avg")
            .unwrap();
        assert!((hw_avg.percent - 0.75).abs() < 1e-9);

        // 0.4 * 0.75 + 0.6 * 0.8 = 0.78
        assert!((gradeset.percent - 0.78).abs() < 1e-9);
        assert_eq!(gradeset.grade.as_deref(), Some("B"));
    }

    #[test]
    fn raw_scores_cover_only_attempted_problems() {
        let conn = setup();
        record(&conn, "hw2", 7.0);

        let ctx = GradingCtx {
            conn: &conn,
            course_id: "c1",
        };
        let gradeset = compute_gradeset(&ctx, "u1").unwrap();
        assert_eq!(gradeset.raw_scores.len(), 1);
        assert_eq!(gradeset.raw_scores[0].section, "Problem hw2");
        assert_eq!(gradeset.raw_scores[0].earned, 7.0);
        assert_eq!(gradeset.raw_scores[0].possible, 10.0);
    }

    #[test]
    fn below_every_cutoff_means_no_letter() {
        let conn = setup();
        let ctx = GradingCtx {
            conn: &conn,
            course_id: "c1",
        };
        let gradeset = compute_gradeset(&ctx, "u1").unwrap();
        assert_eq!(gradeset.percent, 0.0);
        assert_eq!(gradeset.grade, None);
    }

    #[test]
    fn offline_mode_reads_the_cache_and_misses_are_errors() {
        let conn = setup();
        record(&conn, "final", 90.0);
        let ctx = GradingCtx {
            conn: &conn,
            course_id: "c1",
        };

        let miss = student_gradeset(&ctx, "u1", true).unwrap_err();
        assert_eq!(miss.code, "no_offline_grades");

        let live = compute_gradeset(&ctx, "u1").unwrap();
        store_cached_gradeset(&ctx, "u1", &live).unwrap();

        let cached = student_gradeset(&ctx, "u1", true).unwrap();
        assert_eq!(cached.percent, live.percent);
        assert_eq!(cached.section_breakdown.len(), live.section_breakdown.len());
    }

    #[test]
    fn policy_parsing_rejects_bad_cutoffs() {
        let err = parse_grading_policy("{\"cutoffs\": {\"A\": 1.5}}").unwrap_err();
        assert_eq!(err.code, "bad_grading_policy");

        let empty = parse_grading_policy("{}").unwrap();
        assert!(empty.categories.is_empty());
    }
}
