//! Alert rule administration.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use tracing::info;

use super::{envelope, ApiResult, AppState};
use crate::alert::AlertRule;
use crate::error::CoreError;
use crate::models::AlertRuleDefinition;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/rules", get(list_rules).post(register_rule))
        .route("/rules/{id}", get(get_rule).delete(remove_rule))
}

/// Effective rule settings after defaults are applied.
fn rule_view(rule: &AlertRule) -> Value {
    // ---
    json!({
        "id": rule.id,
        "station": rule.station,
        "condition": rule.condition,
        "expression": rule.condition.to_string(),
        "topic": rule.topic,
        "hysteresis": rule.hysteresis,
        "suppression": rule.suppression.map(|s| json!({
            "after": s.after,
            "cooldown_secs": s.cooldown.num_seconds(),
        })),
    })
}

async fn list_rules(State(engine): State<AppState>) -> ApiResult {
    // ---
    let rules: Vec<Value> = engine.list_rules().iter().map(|r| rule_view(r)).collect();
    let meta = json!({ "count": rules.len() });
    Ok(envelope(StatusCode::OK, rules, meta))
}

async fn register_rule(State(engine): State<AppState>, body: Bytes) -> ApiResult {
    // ---
    let definition: AlertRuleDefinition = serde_json::from_slice(&body)
        .map_err(|e| CoreError::invalid_rule(format!("invalid rule body: {e}")))?;

    let rule = engine.register_rule(definition).await?;
    info!(rule_id = %rule.id, "POST /rules registered");
    Ok(envelope(StatusCode::CREATED, rule_view(&rule), json!({})))
}

async fn get_rule(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult {
    // ---
    let rule = engine.get_rule(&id)?;
    let states = engine.rule_states(&id)?;
    let meta = json!({ "states": states });
    Ok(envelope(StatusCode::OK, rule_view(&rule), meta))
}

async fn remove_rule(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult {
    // ---
    engine.remove_rule(&id).await?;
    info!(rule_id = %id, "DELETE /rules removed");
    Ok(StatusCode::NO_CONTENT.into_response())
}
