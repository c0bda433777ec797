//! JSON API endpoints: token counting, health, current-selection
//! management, history and summary queries

use crate::config::Tier;
use crate::protocol::claude::ClaudeRequest;
use crate::server::error::ProxyError;
use crate::server::state::{validate_client, AppState};
use crate::tokens::estimate_request_tokens;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

// ─────────────────────────────────────────────────────────────────────────────
// POST /v1/messages/count_tokens
// ─────────────────────────────────────────────────────────────────────────────

/// Same request shape as /v1/messages, but max_tokens is not required here
pub async fn count_tokens_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ProxyError> {
    validate_client(&headers, &state.config)?;

    let mut value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid count_tokens request: {e}")))?;
    if let Some(obj) = value.as_object_mut() {
        obj.entry("max_tokens").or_insert(json!(1));
    }
    let req: ClaudeRequest = serde_json::from_value(value)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid count_tokens request: {e}")))?;

    Ok(Json(json!({ "input_tokens": estimate_request_tokens(&req) })))
}

// ─────────────────────────────────────────────────────────────────────────────
// GET /health
// ─────────────────────────────────────────────────────────────────────────────

pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let providers = &state.config.providers;
    let any_key = providers.iter().any(|p| p.resolve_key().is_some());

    Json(json!({
        "status": "ok",
        "openai_api_configured": !providers.is_empty(),
        "api_key_valid": any_key,
        "client_api_key_validation": state.config.api_key.is_some(),
        "provider_count": providers.len(),
        "history_db": state.history.db_path().display().to_string(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// GET /api/config/get, POST /api/config/update
// ─────────────────────────────────────────────────────────────────────────────

pub async fn config_get_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let selections = state.router.snapshot();

    let catalog: Vec<serde_json::Value> = state
        .config
        .providers
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "big_models": p.big_models,
                "middle_models": p.middle_models,
                "small_models": p.small_models,
            })
        })
        .collect();

    Json(json!({
        "BIG_MODEL": selections.get("BIG_MODEL").cloned().flatten(),
        "MIDDLE_MODEL": selections.get("MIDDLE_MODEL").cloned().flatten(),
        "SMALL_MODEL": selections.get("SMALL_MODEL").cloned().flatten(),
        "providers": catalog,
    }))
}

/// Any subset of the three tier keys
#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    #[serde(rename = "BIG_MODEL")]
    big_model: Option<String>,
    #[serde(rename = "MIDDLE_MODEL")]
    middle_model: Option<String>,
    #[serde(rename = "SMALL_MODEL")]
    small_model: Option<String>,
}

pub async fn config_update_handler(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let changes = [
        (Tier::Big, update.big_model),
        (Tier::Middle, update.middle_model),
        (Tier::Small, update.small_model),
    ];

    let mut applied = Vec::new();
    for (tier, selection) in changes {
        let Some(selection) = selection else { continue };
        let canonical = state
            .router
            .update(tier, &selection)
            .map_err(ProxyError::from_router)?;
        state.history.set_config(tier.config_key(), &canonical).await;
        tracing::info!(tier = tier.as_str(), selection = %canonical, "Selection updated");
        applied.push(json!({ "tier": tier.as_str(), "selection": canonical }));
    }

    let selections = state.router.snapshot();
    Ok(Json(json!({
        "updated": applied,
        "BIG_MODEL": selections.get("BIG_MODEL").cloned().flatten(),
        "MIDDLE_MODEL": selections.get("MIDDLE_MODEL").cloned().flatten(),
        "SMALL_MODEL": selections.get("SMALL_MODEL").cloned().flatten(),
    })))
}

// ─────────────────────────────────────────────────────────────────────────────
// GET /api/history, GET /api/summary
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    limit: Option<u32>,
    date: Option<String>,
    hour: Option<u32>,
}

pub async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let limit = params.limit.unwrap_or(50).min(1000);
    let date = parse_date(params.date.as_deref())?;
    let hour = params.hour;
    if let Some(h) = hour {
        if h > 23 {
            return Err(ProxyError::InvalidRequest("hour must be 0-23".to_string()));
        }
    }

    let query = state.query.clone();
    let records = tokio::task::spawn_blocking(move || query.recent(limit, date, hour))
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?
        .map_err(|e| ProxyError::Internal(format!("history query failed: {e}")))?;

    Ok(Json(json!({ "count": records.len(), "history": records })))
}

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    start_date: Option<String>,
    end_date: Option<String>,
}

pub async fn summary_handler(
    State(state): State<AppState>,
    Query(params): Query<SummaryParams>,
) -> Result<Json<serde_json::Value>, ProxyError> {
    let start = parse_date(params.start_date.as_deref())?;
    let end = parse_date(params.end_date.as_deref())?;

    let query = state.query.clone();
    let summaries = tokio::task::spawn_blocking(move || query.summary(start, end))
        .await
        .map_err(|e| ProxyError::Internal(e.to_string()))?
        .map_err(|e| ProxyError::Internal(format!("summary query failed: {e}")))?;

    Ok(Json(json!({ "models": summaries })))
}

fn parse_date(input: Option<&str>) -> Result<Option<NaiveDate>, ProxyError> {
    input
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| ProxyError::InvalidRequest(format!("invalid date: {s}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date() {
        assert_eq!(parse_date(None).unwrap(), None);
        assert_eq!(
            parse_date(Some("2026-08-01")).unwrap(),
            NaiveDate::from_ymd_opt(2026, 8, 1)
        );
        assert!(parse_date(Some("08/01/2026")).is_err());
    }
}
