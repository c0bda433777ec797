//! Read-side queries over the history database
//!
//! Uses a small r2d2 pool of read-only connections. WAL mode lets these
//! readers run while the writer thread is active; each query sees either
//! the previous or next committed snapshot, never a torn row.

use crate::config::Tier;
use chrono::NaiveDate;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Row};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// A full history row as returned by the API
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub ts: String,
    pub claimed_model: String,
    pub concrete_model: Option<String>,
    pub provider: Option<String>,
    pub is_streaming: bool,
    pub status: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub stop_reason: Option<String>,
    pub duration_ms: Option<i64>,
    pub request: serde_json::Value,
    pub openai_request: Option<serde_json::Value>,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Aggregate counters for one concrete model
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub model: String,
    pub requests: i64,
    pub completed: i64,
    pub partial: i64,
    pub pending: i64,
    pub errors: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub success_rate: f64,
    pub last_request_at: Option<String>,
}

/// Query interface over the history database
pub struct HistoryQuery {
    pool: Pool<SqliteConnectionManager>,
}

impl HistoryQuery {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder().max_size(4).build(manager)?;

        // Verify the database is reachable before serving queries
        let conn = pool.get()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;

        Ok(Self { pool })
    }

    /// Recent history, newest first, optionally filtered to a date and hour
    pub fn recent(
        &self,
        limit: u32,
        date: Option<NaiveDate>,
        hour: Option<u32>,
    ) -> anyhow::Result<Vec<HistoryRecord>> {
        let conn = self.pool.get()?;

        let mut sql = String::from(
            "SELECT id, ts, claimed_model, concrete_model, provider, is_streaming, status,
                    input_tokens, output_tokens, total_tokens, stop_reason, duration_ms,
                    request_json, openai_request_json, response_json, error
             FROM history",
        );
        let mut clauses = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(date) = date {
            clauses.push("date(ts) = ?");
            args.push(SqlValue::Text(date.format("%Y-%m-%d").to_string()));
        }
        if let Some(hour) = hour {
            clauses.push("CAST(strftime('%H', ts) AS INTEGER) = ?");
            args.push(SqlValue::Integer(hour as i64));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        args.push(SqlValue::Integer(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), record_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Aggregate counters per concrete model over an inclusive date range
    pub fn summary(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> anyhow::Result<Vec<ModelSummary>> {
        let conn = self.pool.get()?;

        let mut sql = String::from(
            "SELECT COALESCE(concrete_model, claimed_model) AS model,
                    COUNT(*) AS requests,
                    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
                    SUM(CASE WHEN status = 'partial' THEN 1 ELSE 0 END) AS partial,
                    SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending,
                    SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END) AS errors,
                    SUM(input_tokens) AS input_tokens,
                    SUM(output_tokens) AS output_tokens,
                    SUM(total_tokens) AS total_tokens,
                    MAX(ts) AS last_request_at
             FROM history",
        );
        let mut clauses = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(start) = start_date {
            clauses.push("date(ts) >= ?");
            args.push(SqlValue::Text(start.format("%Y-%m-%d").to_string()));
        }
        if let Some(end) = end_date {
            clauses.push("date(ts) <= ?");
            args.push(SqlValue::Text(end.format("%Y-%m-%d").to_string()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" GROUP BY model ORDER BY requests DESC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            let requests: i64 = row.get("requests")?;
            let completed: i64 = row.get("completed")?;
            Ok(ModelSummary {
                model: row.get("model")?,
                requests,
                completed,
                partial: row.get("partial")?,
                pending: row.get("pending")?,
                errors: row.get("errors")?,
                input_tokens: row.get("input_tokens")?,
                output_tokens: row.get("output_tokens")?,
                total_tokens: row.get("total_tokens")?,
                success_rate: if requests > 0 {
                    completed as f64 / requests as f64
                } else {
                    0.0
                },
                last_request_at: row.get("last_request_at")?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Read a persisted config value
    pub fn config_get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT value FROM config WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        Ok(match rows.next()? {
            Some(row) => Some(row.get(0)?),
            None => None,
        })
    }

    /// Persisted tier selections, for router restoration at startup
    pub fn tier_selections(&self) -> anyhow::Result<HashMap<Tier, String>> {
        let mut selections = HashMap::new();
        for tier in [Tier::Big, Tier::Middle, Tier::Small] {
            if let Some(value) = self.config_get(tier.config_key())? {
                selections.insert(tier, value);
            }
        }
        Ok(selections)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let request_json: String = row.get("request_json")?;
    let openai_request_json: Option<String> = row.get("openai_request_json")?;
    let response_json: Option<String> = row.get("response_json")?;

    Ok(HistoryRecord {
        id: row.get("id")?,
        ts: row.get("ts")?,
        claimed_model: row.get("claimed_model")?,
        concrete_model: row.get("concrete_model")?,
        provider: row.get("provider")?,
        is_streaming: row.get::<_, i64>("is_streaming")? != 0,
        status: row.get("status")?,
        input_tokens: row.get("input_tokens")?,
        output_tokens: row.get("output_tokens")?,
        total_tokens: row.get("total_tokens")?,
        stop_reason: row.get("stop_reason")?,
        duration_ms: row.get("duration_ms")?,
        request: serde_json::from_str(&request_json).unwrap_or(serde_json::Value::Null),
        openai_request: openai_request_json.and_then(|s| serde_json::from_str(&s).ok()),
        response: response_json.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get("error")?,
    })
}
