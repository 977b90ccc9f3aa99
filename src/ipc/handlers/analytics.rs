use serde_json::json;

use crate::analytics;
use crate::ipc::error::ok;
use crate::ipc::helpers::{course_from_params, db_conn, required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn query(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let course = course_from_params(conn, &req.params)?;
    let name = required_str(&req.params, "name")?;
    let payload = analytics::run_query(
        &state.http,
        &state.config.analytics_url,
        &state.config.analytics_api_key,
        &course.course_key,
        &name,
    )?;
    Ok(json!({ "query": name, "payload": payload }))
}

/// Aggregate for the metrics dashboard. Individual query failures are
/// logged and omitted; the response itself always succeeds.
fn dashboard(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let course = course_from_params(conn, &req.params)?;
    let queries = analytics::dashboard(
        &state.http,
        &state.config.analytics_url,
        &state.config.analytics_api_key,
        &course.course_key,
    );
    Ok(json!({ "courseKey": course.course_key, "queries": queries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "analytics.query" => query(state, req),
        "analytics.dashboard" => dashboard(state, req),
        _ => return None,
    };
    Some(match result {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    })
}
