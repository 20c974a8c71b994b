//! Session Service (C7): Session lifecycle independent of Ship allocation.
//!
//! Sessions are created as a side effect of [`crate::ship_service::ShipService::acquire`];
//! this module covers the read side (`GET /session/{id}`) and the narrow
//! write it owns directly — touching `last_activity` for calls that don't
//! otherwise go through `acquire`/`execute`.

use diesel::prelude::*;

use crate::database::models::SessionRow;
use crate::database::schema::sessions;
use crate::database::DbPool;
use crate::error::BayError;

pub struct SessionService {
    pool: DbPool,
}

impl SessionService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionRow, BayError> {
        let pool = self.pool.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<SessionRow, BayError> {
            let mut conn = pool.get()?;
            sessions::table
                .find(&session_id)
                .select(SessionRow::as_select())
                .first(&mut conn)
                .optional()?
                .ok_or_else(|| BayError::NotFound(format!("session {session_id}")))
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
    }

    pub async fn touch(&self, session_id: &str) -> Result<(), BayError> {
        let pool = self.pool.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            diesel::update(sessions::table.find(&session_id))
                .set(sessions::last_activity.eq(chrono::Utc::now().to_rfc3339()))
                .execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;
        Ok(())
    }

    pub async fn list_for_ship(&self, ship_id: &str) -> Result<Vec<SessionRow>, BayError> {
        let pool = self.pool.clone();
        let ship_id = ship_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<SessionRow>, BayError> {
            let mut conn = pool.get()?;
            Ok(sessions::table
                .filter(sessions::ship_id.eq(&ship_id))
                .select(SessionRow::as_select())
                .load(&mut conn)?)
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
    }

    pub async fn list(&self) -> Result<Vec<SessionRow>, BayError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<SessionRow>, BayError> {
            let mut conn = pool.get()?;
            Ok(sessions::table
                .order(sessions::created_at.desc())
                .select(SessionRow::as_select())
                .load(&mut conn)?)
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
    }

    /// `DELETE /sessions/{id}`: removes the session binding only. The Ship
    /// it pointed at is untouched — it keeps running until stopped or
    /// reaped on its own TTL.
    pub async fn delete(&self, session_id: &str) -> Result<(), BayError> {
        let pool = self.pool.clone();
        let session_id = session_id.to_string();
        let deleted = tokio::task::spawn_blocking(move || -> Result<usize, diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            diesel::delete(sessions::table.find(&session_id)).execute(&mut conn)
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        if deleted == 0 {
            return Err(BayError::NotFound("session".into()));
        }
        Ok(())
    }
}
