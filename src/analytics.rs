use reqwest::blocking::Client;
use serde_json::{Map, Value};
use tracing::warn;

/// Queries the course dashboard aggregates when rendering in metrics mode.
pub const DASHBOARD_QUERIES: [&str; 5] = [
    "StudentsActive",
    "StudentsEnrolled",
    "StudentsDropoffPerDay",
    "StudentsDailyActivity",
    "ProblemGradeDistribution",
];

#[derive(Debug, Clone)]
pub struct AnalyticsError {
    pub message: String,
}

impl AnalyticsError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AnalyticsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AnalyticsError {}

/// One named query against the analytics service. The service answers
/// `{"payload": ...}`; anything else is an error.
pub fn run_query(
    client: &Client,
    base_url: &str,
    api_key: &str,
    course_key: &str,
    name: &str,
) -> Result<Value, AnalyticsError> {
    if base_url.is_empty() {
        return Err(AnalyticsError::new("analytics endpoint is not configured"));
    }
    let url = format!("{}/get", base_url.trim_end_matches('/'));
    let resp = client
        .get(&url)
        .query(&[
            ("aname", name),
            ("course_id", course_key),
            ("apikey", api_key),
        ])
        .send()
        .map_err(|e| AnalyticsError::new(format!("analytics request failed: {}", e)))?;
    if !resp.status().is_success() {
        return Err(AnalyticsError::new(format!(
            "analytics query {} returned HTTP {}",
            name,
            resp.status().as_u16()
        )));
    }
    let body: Value = resp
        .json()
        .map_err(|e| AnalyticsError::new(format!("bad analytics response: {}", e)))?;
    match body.get("payload") {
        Some(payload) => Ok(payload.clone()),
        None => Err(AnalyticsError::new(format!(
            "analytics query {} answered without a payload",
            name
        ))),
    }
}

/// All dashboard queries at once. A failing query is logged and left out;
/// the dashboard renders with whatever answered.
pub fn dashboard(client: &Client, base_url: &str, api_key: &str, course_key: &str) -> Value {
    let mut results = Map::new();
    if base_url.is_empty() {
        warn!("analytics endpoint is not configured; dashboard metrics are empty");
        return Value::Object(results);
    }
    for name in DASHBOARD_QUERIES {
        match run_query(client, base_url, api_key, course_key, name) {
            Ok(payload) => {
                results.insert(name.to_string(), payload);
            }
            Err(e) => warn!(query = name, error = %e, "analytics query failed"),
        }
    }
    Value::Object(results)
}
