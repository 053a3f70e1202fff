//! Plan storage
//!
//! One row per plan in `plans` holding the full plan as JSON, and one row per
//! plan in `plan_results` holding its outcome record. The two are written and
//! pruned independently.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use serde_json::Value;

use super::database::Database;
use crate::plan::{PlanResults, PlanStatus, TaskPlan};

/// SQLite-backed plan storage
pub struct PlanStore<'a> {
    db: &'a Database,
}

impl<'a> PlanStore<'a> {
    /// Create a new plan store with database reference
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert or replace the plan record, keeping the original `created_at`
    pub fn upsert_plan(&self, plan: &TaskPlan) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let content = serde_json::to_string(plan).context("Failed to serialize plan")?;

        self.db.conn().execute(
            "INSERT INTO plans (id, title, status, content, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 status = excluded.status,
                 content = excluded.content,
                 updated_at = excluded.updated_at",
            params![
                plan.id,
                plan.title,
                plan.status.as_str(),
                content,
                plan.created.to_rfc3339(),
                now
            ],
        )?;

        tracing::debug!(plan_id = %plan.id, status = %plan.status, "Stored plan");
        Ok(())
    }

    /// Load and decode a plan. A corrupt record is an error.
    pub fn get_plan(&self, plan_id: &str) -> Result<Option<TaskPlan>> {
        let result = self.db.conn().query_row(
            "SELECT content FROM plans WHERE id = ?1",
            [plan_id],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(content) => decode_plan(&content)
                .with_context(|| format!("Corrupt plan record {}", plan_id))
                .map(Some),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Plan ids, most recently updated first
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT id FROM plans ORDER BY updated_at DESC")?;
        let ids = stmt.query_map([], |row| row.get(0))?;
        ids.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Row-level summaries without decoding plan content
    pub fn list_summaries(&self) -> Result<Vec<PlanSummary>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, status, created_at, updated_at
             FROM plans ORDER BY updated_at DESC",
        )?;

        let plans = stmt.query_map([], |row| {
            Ok(PlanSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                status: row.get::<_, String>(2)?.parse().ok(),
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        })?;

        plans.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Delete plan by ID. Returns whether a row was removed.
    pub fn delete_plan(&self, plan_id: &str) -> Result<bool> {
        let rows = self
            .db
            .conn()
            .execute("DELETE FROM plans WHERE id = ?1", [plan_id])?;
        if rows > 0 {
            tracing::info!(plan_id = %plan_id, "Deleted plan");
        }
        Ok(rows > 0)
    }

    pub fn upsert_results(&self, results: &PlanResults) -> Result<()> {
        let content = serde_json::to_string(results).context("Failed to serialize plan results")?;
        self.db.conn().execute(
            "INSERT OR REPLACE INTO plan_results (plan_id, content, updated_at)
             VALUES (?1, ?2, ?3)",
            params![results.plan_id, content, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn get_results(&self, plan_id: &str) -> Result<Option<PlanResults>> {
        let result = self.db.conn().query_row(
            "SELECT content FROM plan_results WHERE plan_id = ?1",
            [plan_id],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(content) => {
                let mut value: Value = serde_json::from_str(&content)
                    .with_context(|| format!("Corrupt results record {}", plan_id))?;
                unwrap_legacy_dates(&mut value);
                Ok(Some(serde_json::from_value(value)?))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_results(&self, plan_id: &str) -> Result<bool> {
        let rows = self
            .db
            .conn()
            .execute("DELETE FROM plan_results WHERE plan_id = ?1", [plan_id])?;
        Ok(rows > 0)
    }
}

/// Summary of a plan for listing
#[derive(Debug, Clone)]
pub struct PlanSummary {
    pub id: String,
    pub title: String,
    /// `None` when the stored status string is unrecognized
    pub status: Option<PlanStatus>,
    pub created_at: String,
    pub updated_at: String,
}

fn decode_plan(content: &str) -> Result<TaskPlan> {
    let mut value: Value = serde_json::from_str(content)?;
    unwrap_legacy_dates(&mut value);
    Ok(serde_json::from_value(value)?)
}

/// Replace `{"type": "Date", "value": "<iso>"}` wrappers written by older
/// versions with the bare timestamp string.
fn unwrap_legacy_dates(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let is_wrapper = map.len() == 2
                && map.get("type").and_then(Value::as_str) == Some("Date")
                && map.get("value").is_some_and(Value::is_string);
            if is_wrapper {
                if let Some(inner) = map.remove("value") {
                    *value = inner;
                }
                return;
            }
            for child in map.values_mut() {
                unwrap_legacy_dates(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                unwrap_legacy_dates(item);
            }
        }
        _ => {}
    }
}
