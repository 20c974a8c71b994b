//! Execution History Service (C8): list/get/annotate queries over the
//! `execution_history` table. Filters are combined with AND; unfiltered list
//! calls always order by `created_at DESC` (§4.6).

use diesel::prelude::*;

use crate::database::models::{ExecType, ExecutionHistoryRow};
use crate::database::schema::execution_history;
use crate::database::DbPool;
use crate::error::BayError;

#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub exec_type: Option<ExecType>,
    pub success_only: Option<bool>,
    pub tags: Option<String>,
    pub has_notes: Option<bool>,
    pub has_description: Option<bool>,
    pub limit: i64,
    pub offset: i64,
}

impl HistoryFilter {
    pub fn with_paging(limit: i64, offset: i64) -> Self {
        Self {
            limit,
            offset,
            ..Default::default()
        }
    }
}

pub struct HistoryService {
    pool: DbPool,
}

impl HistoryService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn list(
        &self,
        session_id: &str,
        filter: HistoryFilter,
    ) -> Result<Vec<ExecutionHistoryRow>, BayError> {
        let pool = self.pool.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<ExecutionHistoryRow>, BayError> {
            let mut conn = pool.get()?;
            let mut query = execution_history::table
                .filter(execution_history::session_id.eq(&session_id))
                .into_boxed();

            if let Some(exec_type) = filter.exec_type {
                query = query.filter(execution_history::exec_type.eq(exec_type.as_str()));
            }
            if let Some(success_only) = filter.success_only {
                query = query.filter(execution_history::success.eq(if success_only { 1 } else { 0 }));
            }
            if let Some(tag) = &filter.tags {
                query = query.filter(execution_history::tags.like(format!("%{tag}%")));
            }
            if let Some(true) = filter.has_notes {
                query = query.filter(execution_history::notes.is_not_null());
            }
            if let Some(true) = filter.has_description {
                query = query.filter(execution_history::description.is_not_null());
            }

            let limit = filter.limit.clamp(1, 1000);
            let rows = query
                .order(execution_history::created_at.desc())
                .limit(limit)
                .offset(filter.offset.max(0))
                .select(ExecutionHistoryRow::as_select())
                .load(&mut conn)?;
            Ok(rows)
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
    }

    pub async fn get(&self, entry_id: &str) -> Result<ExecutionHistoryRow, BayError> {
        let pool = self.pool.clone();
        let entry_id = entry_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<ExecutionHistoryRow, BayError> {
            let mut conn = pool.get()?;
            execution_history::table
                .find(&entry_id)
                .select(ExecutionHistoryRow::as_select())
                .first(&mut conn)
                .optional()?
                .ok_or_else(|| BayError::NotFound(format!("execution history entry {entry_id}")))
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
    }

    pub async fn get_last(
        &self,
        session_id: &str,
        exec_type: Option<ExecType>,
    ) -> Result<Option<ExecutionHistoryRow>, BayError> {
        let pool = self.pool.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<ExecutionHistoryRow>, BayError> {
            let mut conn = pool.get()?;
            let mut query = execution_history::table
                .filter(execution_history::session_id.eq(&session_id))
                .into_boxed();
            if let Some(exec_type) = exec_type {
                query = query.filter(execution_history::exec_type.eq(exec_type.as_str()));
            }
            Ok(query
                .order(execution_history::created_at.desc())
                .select(ExecutionHistoryRow::as_select())
                .first(&mut conn)
                .optional()?)
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
    }

    /// Sets `description`/`tags`/`notes` on an entry. `tags` is stored as a
    /// comma-joined string, matching [`crate::database::models::execution_history::split_tags`].
    pub async fn annotate(
        &self,
        entry_id: &str,
        description: Option<String>,
        tags: Option<Vec<String>>,
        notes: Option<String>,
    ) -> Result<ExecutionHistoryRow, BayError> {
        let pool = self.pool.clone();
        let entry_id = entry_id.to_string();
        let tags_joined = tags.map(|t| t.join(","));
        tokio::task::spawn_blocking(move || -> Result<ExecutionHistoryRow, BayError> {
            let mut conn = pool.get()?;
            diesel::update(execution_history::table.find(&entry_id))
                .set((
                    description.map(|d| execution_history::description.eq(d)),
                    tags_joined.map(|t| execution_history::tags.eq(t)),
                    notes.map(|n| execution_history::notes.eq(n)),
                ))
                .execute(&mut conn)?;
            execution_history::table
                .find(&entry_id)
                .select(ExecutionHistoryRow::as_select())
                .first(&mut conn)
                .optional()?
                .ok_or_else(|| BayError::NotFound(format!("execution history entry {entry_id}")))
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
    }
}
