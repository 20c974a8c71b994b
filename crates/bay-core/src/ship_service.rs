//! Ship Service (C6) — the allocation core (§4.2).
//!
//! `acquire` is the system's single load-bearing operation: every
//! concurrency invariant in §5 is a consequence of how it serializes access
//! to the store. The row-level decisions run inside a `BEGIN IMMEDIATE`
//! transaction (SQLite's single-writer mode); the budget itself is tracked
//! with a `tokio::sync::Semaphore`, whose `acquire` preserves FIFO order
//! across waiters — exactly the fairness §4.2's `wait` policy requires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use diesel::prelude::*;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use uuid::Uuid;

use crate::config::{BayConfig, CapacityBehavior};
use crate::database::models::{
    ExecType, NewExecutionHistory, NewSession, NewShip, SessionRow, ShipRow, ShipStatus,
};
use crate::database::schema::{execution_history, sessions, ships};
use crate::database::{immediate_transaction, DbPool};
use crate::driver::{ContainerDriver, ContainerInfo, ResourceSpec};
use crate::error::BayError;
use crate::ship_client::{ExecRequest, ExecResponse, ShipClient};

pub struct ShipService {
    pool: DbPool,
    driver: Arc<dyn ContainerDriver>,
    ship_client: Arc<ShipClient>,
    config: Arc<BayConfig>,
    /// Permits == `MAX_SHIP_NUM` minus the current count of non-Stopped
    /// Ships. Acquired when a Ship transitions into the counted set
    /// (Creating/Running), released when it leaves it (Stopped/deleted).
    capacity: Arc<Semaphore>,
    /// One async lock per `session_id`, held for the full duration of
    /// `acquire`. Without this, two concurrent first-time requests for the
    /// same session both miss steps 1-3, both run `create_fresh`, and both
    /// end up with their own Ship — only one of which any Session row ends
    /// up pointing at (§4.2/§5, Testable Property 1).
    session_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

impl ShipService {
    pub fn new(
        pool: DbPool,
        driver: Arc<dyn ContainerDriver>,
        ship_client: Arc<ShipClient>,
        config: Arc<BayConfig>,
    ) -> Result<Self, BayError> {
        let mut conn = pool.get()?;
        let in_use: i64 = ships::table
            .filter(ships::status.ne(ShipStatus::Stopped.as_str()))
            .count()
            .get_result(&mut conn)?;
        let permits = (config.max_ship_num as i64 - in_use).max(0) as usize;
        Ok(Self {
            pool,
            driver,
            ship_client,
            config,
            capacity: Arc::new(Semaphore::new(permits)),
            session_locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Returns the per-session lock, creating it if this is the first
    /// waiter. Call `unlock_session` once the returned guard has been
    /// dropped to prune the entry when no one else is waiting on it.
    fn lock_handle(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.session_locks.lock().unwrap();
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drops the map's reference to `session_id`'s lock if nothing else is
    /// holding or waiting on it, so the map doesn't grow unbounded.
    fn unlock_session(&self, session_id: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.session_locks.lock().unwrap();
        if let Some(entry) = locks.get(session_id) {
            // Our local `lock` plus the map's own entry == 2; a higher
            // count means another caller is already queued on it.
            if Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) <= 2 {
                locks.remove(session_id);
            }
        }
    }

    pub fn capacity_available(&self) -> usize {
        self.capacity.available_permits()
    }

    /// Exposes the shared capacity budget so C4 (warm pool) can gate its own
    /// creations against the same `MAX_SHIP_NUM` ceiling C6 enforces.
    pub fn capacity_handle(&self) -> Arc<Semaphore> {
        self.capacity.clone()
    }

    pub fn driver(&self) -> Arc<dyn ContainerDriver> {
        self.driver.clone()
    }

    pub fn ship_client(&self) -> Arc<ShipClient> {
        self.ship_client.clone()
    }

    pub fn pool(&self) -> DbPool {
        self.pool.clone()
    }

    fn load_session(conn: &mut SqliteConnectionAlias, session_id: &str) -> Result<Option<SessionRow>, diesel::result::Error> {
        sessions::table
            .find(session_id)
            .select(SessionRow::as_select())
            .first(conn)
            .optional()
    }

    fn load_ship(conn: &mut SqliteConnectionAlias, ship_id: &str) -> Result<Option<ShipRow>, diesel::result::Error> {
        ships::table
            .find(ship_id)
            .select(ShipRow::as_select())
            .first(conn)
            .optional()
    }

    /// §4.2: the public allocation contract. Serialized per `session_id` —
    /// see `session_locks` — so two concurrent first-time requests for the
    /// same session can't both slip past steps 1-3 and each create their
    /// own Ship.
    pub async fn acquire(
        &self,
        session_id: &str,
        ttl_secs: i64,
        spec: ResourceSpec,
        force_create: bool,
    ) -> Result<ShipRow, BayError> {
        let lock = self.lock_handle(session_id);
        let guard = lock.clone().lock_owned().await;
        let result = self.acquire_locked(session_id, ttl_secs, spec, force_create).await;
        drop(guard);
        self.unlock_session(session_id, lock);
        result
    }

    async fn acquire_locked(
        &self,
        session_id: &str,
        ttl_secs: i64,
        spec: ResourceSpec,
        force_create: bool,
    ) -> Result<ShipRow, BayError> {
        if !force_create {
            if let Some(bound) = self.try_existing_binding(session_id, ttl_secs).await? {
                return Ok(bound);
            }
            if let Some(recovered) = self.try_recover_stopped(session_id, ttl_secs, &spec).await? {
                return Ok(recovered);
            }
            if let Some(claimed) = self.try_claim_pool(session_id, ttl_secs).await? {
                return Ok(claimed);
            }
        }
        self.create_fresh(session_id, ttl_secs, spec).await
    }

    /// Step 1.
    async fn try_existing_binding(
        &self,
        session_id: &str,
        ttl_secs: i64,
    ) -> Result<Option<ShipRow>, BayError> {
        let pool = self.pool.clone();
        let session_id_owned = session_id.to_string();
        let found = tokio::task::spawn_blocking(move || -> Result<_, BayError> {
            let mut conn = pool.get()?;
            let session = Self::load_session(&mut conn, &session_id_owned)?;
            let Some(session) = session else { return Ok(None) };
            let ship = Self::load_ship(&mut conn, &session.ship_id)?;
            Ok(ship.map(|s| (session, s)))
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        let Some((session, ship)) = found else {
            return Ok(None);
        };
        if ship.status != ShipStatus::Running.as_str() {
            return Ok(None);
        }
        let Some(container_id) = ship.container_id.clone() else {
            return Ok(None);
        };
        if !self.driver.is_running(&container_id).await? {
            return Ok(None);
        }

        let pool = self.pool.clone();
        let ship_id = ship.id.clone();
        let updated = tokio::task::spawn_blocking(move || -> Result<ShipRow, diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            immediate_transaction(&mut conn, |conn| {
                let new_expiry = monotonic_expiry(ship.expires_at.as_deref(), ttl_secs);
                diesel::update(ships::table.find(&ship_id))
                    .set((ships::expires_at.eq(&new_expiry), ships::updated_at.eq(now())))
                    .execute(conn)?;
                diesel::update(sessions::table.find(&session.id))
                    .set((
                        sessions::last_activity.eq(now()),
                        sessions::expires_at.eq(&new_expiry),
                    ))
                    .execute(conn)?;
                ships::table.find(&ship_id).select(ShipRow::as_select()).first(conn)
            })
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        Ok(Some(updated))
    }

    /// Step 2: best-effort revival of a Stopped Ship with surviving data.
    async fn try_recover_stopped(
        &self,
        session_id: &str,
        ttl_secs: i64,
        spec: &ResourceSpec,
    ) -> Result<Option<ShipRow>, BayError> {
        let pool = self.pool.clone();
        let session_id_owned = session_id.to_string();
        let candidate = tokio::task::spawn_blocking(move || -> Result<_, BayError> {
            let mut conn = pool.get()?;
            let session = Self::load_session(&mut conn, &session_id_owned)?;
            let Some(session) = session else { return Ok(None) };
            let ship = Self::load_ship(&mut conn, &session.ship_id)?;
            Ok(ship.filter(|s| s.status == ShipStatus::Stopped.as_str()).map(|s| (session, s)))
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        let Some((session, ship)) = candidate else {
            return Ok(None);
        };
        if !self.driver.data_exists(&ship.id).await? {
            return Ok(None);
        }
        let Ok(permit) = self.capacity.clone().try_acquire_owned() else {
            return Ok(None);
        };

        let info = match self.driver.create(&ship.id, spec).await {
            Ok(info) => info,
            Err(_) => {
                drop(permit);
                return Ok(None);
            }
        };

        if self
            .ship_client
            .wait_until_ready(
                &info.endpoint,
                self.config.ship_health_check_interval,
                self.config.ship_health_check_timeout,
            )
            .await
            .is_err()
        {
            let _ = self.driver.stop(&info.container_id).await;
            drop(permit);
            return Ok(None);
        }

        permit.forget();
        let expiry = (Utc::now() + chrono::Duration::seconds(ttl_secs)).to_rfc3339();
        let pool = self.pool.clone();
        let ship_id = ship.id.clone();
        let info_clone = info.clone();
        let updated = tokio::task::spawn_blocking(move || -> Result<ShipRow, diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            immediate_transaction(&mut conn, |conn| {
                diesel::update(ships::table.find(&ship_id))
                    .set((
                        ships::status.eq(ShipStatus::Running.as_str()),
                        ships::container_id.eq(&info_clone.container_id),
                        ships::endpoint.eq(&info_clone.endpoint),
                        ships::expires_at.eq(&expiry),
                        ships::updated_at.eq(now()),
                    ))
                    .execute(conn)?;
                diesel::update(sessions::table.find(&session.id))
                    .set((sessions::last_activity.eq(now()), sessions::expires_at.eq(&expiry)))
                    .execute(conn)?;
                ships::table.find(&ship_id).select(ShipRow::as_select()).first(conn)
            })
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        tracing::info!(ship_id = %updated.id, "ship recovered from stopped state");
        Ok(Some(updated))
    }

    /// Step 3: atomic warm-pool claim.
    async fn try_claim_pool(&self, session_id: &str, ttl_secs: i64) -> Result<Option<ShipRow>, BayError> {
        let pool = self.pool.clone();
        let session_id_owned = session_id.to_string();
        let result = tokio::task::spawn_blocking(move || -> Result<Option<ShipRow>, diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            immediate_transaction(&mut conn, |conn| {
                let candidate = ships::table
                    .filter(ships::warm_pool.eq(1))
                    .filter(ships::status.eq(ShipStatus::Running.as_str()))
                    .order(ships::created_at.asc())
                    .select(ShipRow::as_select())
                    .first(conn)
                    .optional()?;
                let Some(candidate) = candidate else { return Ok(None) };

                let expiry = (Utc::now() + chrono::Duration::seconds(ttl_secs)).to_rfc3339();
                let rows = diesel::update(
                    ships::table.filter(ships::id.eq(&candidate.id)).filter(ships::warm_pool.eq(1)),
                )
                .set((ships::warm_pool.eq(0), ships::expires_at.eq(&expiry), ships::updated_at.eq(now())))
                .execute(conn)?;
                if rows == 0 {
                    // Raced with the replenisher's shrink branch or another claimant.
                    return Ok(None);
                }

                diesel::delete(sessions::table.filter(sessions::id.eq(&session_id_owned))).execute(conn)?;
                diesel::insert_into(sessions::table)
                    .values(NewSession::new(session_id_owned.clone(), candidate.id.clone(), ttl_secs))
                    .execute(conn)?;

                ships::table.find(&candidate.id).select(ShipRow::as_select()).first(conn).map(Some)
            })
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        if let Some(ship) = &result {
            tracing::info!(ship_id = %ship.id, session_id, "claimed warm-pool ship");
        }
        Ok(result)
    }

    /// Step 4: fresh creation, respecting the capacity policy.
    async fn create_fresh(
        &self,
        session_id: &str,
        ttl_secs: i64,
        spec: ResourceSpec,
    ) -> Result<ShipRow, BayError> {
        let permit = match self.config.behavior_after_max_ship {
            CapacityBehavior::Reject => self
                .capacity
                .clone()
                .try_acquire_owned()
                .map_err(|_| BayError::CapacityExhausted)?,
            CapacityBehavior::Wait => {
                let wait_deadline = Duration::from_secs(ttl_secs.max(1) as u64).min(Duration::from_secs(300));
                tokio::time::timeout(wait_deadline, self.capacity.clone().acquire_owned())
                    .await
                    .map_err(|_| BayError::CapacityWaitTimeout)?
                    .map_err(|_| BayError::Internal("capacity semaphore closed".into()))?
            }
        };

        let ship_id = Uuid::new_v4().to_string();
        let pool = self.pool.clone();
        let ship_id_owned = ship_id.clone();
        let driver_name = self.config.container_driver.as_str().to_string();
        let image = self.config.docker_image.clone();
        let spec_clone = spec.clone();
        tokio::task::spawn_blocking(move || -> Result<(), diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            diesel::insert_into(ships::table)
                .values(NewShip::creating(
                    ship_id_owned,
                    driver_name,
                    image,
                    spec_clone.cpus,
                    spec_clone.memory.clone(),
                    spec_clone.disk.clone(),
                    ttl_secs as i32,
                    false,
                ))
                .execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        let create_result = self.driver.create(&ship_id, &spec).await;
        let info = match create_result {
            Ok(info) => info,
            Err(e) => {
                self.mark_stopped(&ship_id, None).await?;
                drop(permit);
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .ship_client
            .wait_until_ready(
                &info.endpoint,
                self.config.ship_health_check_interval,
                self.config.ship_health_check_timeout,
            )
            .await
        {
            let _ = self.driver.stop(&info.container_id).await;
            self.mark_stopped(&ship_id, Some(&info.container_id)).await?;
            drop(permit);
            return Err(e.into());
        }

        permit.forget();
        self.finalize_running(&ship_id, session_id, ttl_secs, &info).await
    }

    async fn finalize_running(
        &self,
        ship_id: &str,
        session_id: &str,
        ttl_secs: i64,
        info: &ContainerInfo,
    ) -> Result<ShipRow, BayError> {
        let expiry = (Utc::now() + chrono::Duration::seconds(ttl_secs)).to_rfc3339();
        let pool = self.pool.clone();
        let ship_id = ship_id.to_string();
        let session_id = session_id.to_string();
        let info = info.clone();
        tokio::task::spawn_blocking(move || -> Result<ShipRow, diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            immediate_transaction(&mut conn, |conn| {
                diesel::update(ships::table.find(&ship_id))
                    .set((
                        ships::status.eq(ShipStatus::Running.as_str()),
                        ships::container_id.eq(&info.container_id),
                        ships::endpoint.eq(&info.endpoint),
                        ships::expires_at.eq(&expiry),
                        ships::updated_at.eq(now()),
                    ))
                    .execute(conn)?;

                diesel::delete(sessions::table.filter(sessions::id.eq(&session_id))).execute(conn)?;
                diesel::insert_into(sessions::table)
                    .values(NewSession::new(session_id, ship_id.clone(), ttl_secs))
                    .execute(conn)?;

                ships::table.find(&ship_id).select(ShipRow::as_select()).first(conn)
            })
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
        .map_err(BayError::from)
    }

    async fn mark_stopped(&self, ship_id: &str, container_id: Option<&str>) -> Result<(), BayError> {
        let pool = self.pool.clone();
        let ship_id = ship_id.to_string();
        let container_id = container_id.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || -> Result<(), diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            diesel::update(ships::table.find(&ship_id))
                .set((
                    ships::status.eq(ShipStatus::Stopped.as_str()),
                    ships::endpoint.eq(None::<String>),
                    ships::expires_at.eq(None::<String>),
                    ships::container_id.eq(container_id),
                    ships::updated_at.eq(now()),
                ))
                .execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;
        Ok(())
    }

    /// `extend_ttl ← max(current, now+ttl)`. §9: on a Stopped Ship this is a
    /// no-op (not an error) — extending the lifetime of something that is
    /// not running and has no `expires_at` to extend is harmless, and a
    /// client racing a reaper sweep should not see a spurious 404/400.
    pub async fn extend_ttl(&self, ship_id: &str, ttl_secs: i64) -> Result<ShipRow, BayError> {
        let pool = self.pool.clone();
        let ship_id = ship_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<ShipRow, BayError> {
            let mut conn = pool.get()?;
            let ship = ships::table
                .find(&ship_id)
                .select(ShipRow::as_select())
                .first(&mut conn)
                .optional()?
                .ok_or_else(|| BayError::NotFound(format!("ship {ship_id}")))?;

            if ship.status != ShipStatus::Running.as_str() {
                return Ok(ship);
            }

            let new_expiry = monotonic_expiry(ship.expires_at.as_deref(), ttl_secs);
            diesel::update(ships::table.find(&ship_id))
                .set((ships::expires_at.eq(&new_expiry), ships::updated_at.eq(now())))
                .execute(&mut conn)?;
            Ok(ships::table.find(&ship_id).select(ShipRow::as_select()).first(&mut conn)?)
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
    }

    /// `DELETE /ship/{id}`: graceful stop, row kept, data volume kept.
    pub async fn stop(&self, ship_id: &str) -> Result<(), BayError> {
        let pool = self.pool.clone();
        let ship_id_owned = ship_id.to_string();
        let ship = tokio::task::spawn_blocking(move || -> Result<Option<ShipRow>, BayError> {
            let mut conn = pool.get()?;
            Ok(ships::table
                .find(&ship_id_owned)
                .select(ShipRow::as_select())
                .first(&mut conn)
                .optional()?)
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        let ship = ship.ok_or_else(|| BayError::NotFound(format!("ship {ship_id}")))?;
        let was_running = ship.status == ShipStatus::Running.as_str();

        if let Some(container_id) = &ship.container_id {
            let _ = self.driver.stop(container_id).await;
        }

        self.mark_stopped(ship_id, None).await?;

        let pool = self.pool.clone();
        let ship_id_owned = ship_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            diesel::delete(sessions::table.filter(sessions::ship_id.eq(&ship_id_owned))).execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        if was_running {
            self.capacity.add_permits(1);
        }
        tracing::info!(ship_id, "ship stopped");
        Ok(())
    }

    /// `DELETE /ship/{id}/permanent`: as `stop`, then delete the row and all
    /// dependent Sessions. The data volume is *not* auto-deleted (§9).
    pub async fn delete_permanent(&self, ship_id: &str) -> Result<(), BayError> {
        let pool = self.pool.clone();
        let ship_id_owned = ship_id.to_string();
        let ship = tokio::task::spawn_blocking(move || -> Result<Option<ShipRow>, BayError> {
            let mut conn = pool.get()?;
            Ok(ships::table
                .find(&ship_id_owned)
                .select(ShipRow::as_select())
                .first(&mut conn)
                .optional()?)
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        let ship = ship.ok_or_else(|| BayError::NotFound(format!("ship {ship_id}")))?;
        let was_running = ship.status == ShipStatus::Running.as_str();

        if let Some(container_id) = &ship.container_id {
            let _ = self.driver.stop(container_id).await;
        }

        let pool = self.pool.clone();
        let ship_id_owned = ship_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            immediate_transaction(&mut conn, |conn| {
                diesel::delete(sessions::table.filter(sessions::ship_id.eq(&ship_id_owned))).execute(conn)?;
                diesel::delete(ships::table.find(&ship_id_owned)).execute(conn)?;
                Ok(())
            })
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        if was_running {
            self.capacity.add_permits(1);
        }
        tracing::info!(ship_id, "ship permanently deleted (data volume retained)");
        Ok(())
    }

    /// Authorizes the session↔ship pair, forwards the exec call, records
    /// the outcome in C8, and returns the Ship's response.
    pub async fn execute(
        &self,
        ship_id: &str,
        session_id: &str,
        exec_type: ExecType,
        code: String,
        request: ExecRequest,
    ) -> Result<ExecResponse, BayError> {
        let pool = self.pool.clone();
        let ship_id_owned = ship_id.to_string();
        let session_id_owned = session_id.to_string();
        let (session, ship) = tokio::task::spawn_blocking(
            move || -> Result<(SessionRow, ShipRow), BayError> {
                let mut conn = pool.get()?;
                let session = sessions::table
                    .find(&session_id_owned)
                    .select(SessionRow::as_select())
                    .first(&mut conn)
                    .optional()?
                    .ok_or_else(|| BayError::NotFound(format!("session {session_id_owned}")))?;
                if session.ship_id != ship_id_owned {
                    return Err(BayError::Forbidden);
                }
                let ship = ships::table
                    .find(&ship_id_owned)
                    .select(ShipRow::as_select())
                    .first(&mut conn)
                    .optional()?
                    .ok_or_else(|| BayError::NotFound(format!("ship {ship_id_owned}")))?;
                diesel::update(sessions::table.find(&session.id))
                    .set(sessions::last_activity.eq(now()))
                    .execute(&mut conn)?;
                Ok((session, ship))
            },
        )
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;

        if ship.status != ShipStatus::Running.as_str() {
            return Err(BayError::ShipUnready(format!("ship {ship_id} is not running")));
        }
        let endpoint = ship.endpoint.clone().ok_or(BayError::ShipUnready(format!("ship {ship_id} has no endpoint")))?;

        let started = std::time::Instant::now();
        let response = tokio::time::timeout(
            self.config.exec_timeout,
            self.ship_client.exec(&endpoint, &session.id, &request),
        )
        .await
        .map_err(|_| BayError::BackendTimeout(format!("exec on ship {ship_id} timed out")))?;
        let elapsed_ms = started.elapsed().as_millis() as i32;

        let (success, output, error) = match &response {
            Ok(r) => (
                r.success,
                r.data.as_ref().map(|d| d.to_string()),
                r.error.clone(),
            ),
            Err(e) => (false, None, Some(e.to_string())),
        };

        if let Err(e) = self
            .record_history(&session.id, ship_id, exec_type, code, success, elapsed_ms, output, error)
            .await
        {
            tracing::warn!(error = %e, "failed to record execution history");
        }

        response.map_err(BayError::from)
    }

    async fn record_history(
        &self,
        session_id: &str,
        ship_id: &str,
        exec_type: ExecType,
        code: String,
        success: bool,
        execution_time_ms: i32,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<(), BayError> {
        let pool = self.pool.clone();
        let id = Uuid::new_v4().to_string();
        let session_id = session_id.to_string();
        let ship_id = ship_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            diesel::insert_into(execution_history::table)
                .values(NewExecutionHistory::new(
                    id,
                    session_id,
                    ship_id,
                    exec_type,
                    code,
                    success,
                    execution_time_ms,
                    output,
                    error,
                ))
                .execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))??;
        Ok(())
    }

    pub async fn get(&self, ship_id: &str) -> Result<ShipRow, BayError> {
        let pool = self.pool.clone();
        let ship_id = ship_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<ShipRow, BayError> {
            let mut conn = pool.get()?;
            ships::table
                .find(&ship_id)
                .select(ShipRow::as_select())
                .first(&mut conn)
                .optional()?
                .ok_or_else(|| BayError::NotFound(format!("ship {ship_id}")))
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
    }

    pub async fn logs(&self, ship_id: &str, tail: Option<u32>) -> Result<String, BayError> {
        let ship = self.get(ship_id).await?;
        let container_id = ship
            .container_id
            .ok_or_else(|| BayError::NotFound(format!("ship {ship_id} has no container")))?;
        Ok(self.driver.logs(&container_id, tail).await?)
    }

    /// `POST /ship/{id}/start`: recover a Stopped Ship outside the normal
    /// session-bound acquisition path (no session to rebind).
    pub async fn start(&self, ship_id: &str) -> Result<ShipRow, BayError> {
        let ship = self.get(ship_id).await?;
        if ship.status != ShipStatus::Stopped.as_str() {
            return Ok(ship);
        }

        let permit = self
            .capacity
            .clone()
            .try_acquire_owned()
            .map_err(|_| BayError::CapacityExhausted)?;

        let spec = ResourceSpec {
            cpus: ship.cpus,
            memory: ship.memory.clone(),
            disk: ship.disk.clone(),
        };
        let info = self.driver.create(&ship.id, &spec).await?;

        if let Err(e) = self
            .ship_client
            .wait_until_ready(
                &info.endpoint,
                self.config.ship_health_check_interval,
                self.config.ship_health_check_timeout,
            )
            .await
        {
            let _ = self.driver.stop(&info.container_id).await;
            self.mark_stopped(&ship.id, Some(&info.container_id)).await?;
            drop(permit);
            return Err(e.into());
        }

        permit.forget();
        let expiry = (Utc::now() + chrono::Duration::seconds(ship.ttl_secs as i64)).to_rfc3339();
        let pool = self.pool.clone();
        let ship_id = ship.id.clone();
        tokio::task::spawn_blocking(move || -> Result<ShipRow, diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            diesel::update(ships::table.find(&ship_id))
                .set((
                    ships::status.eq(ShipStatus::Running.as_str()),
                    ships::container_id.eq(&info.container_id),
                    ships::endpoint.eq(&info.endpoint),
                    ships::expires_at.eq(&expiry),
                    ships::updated_at.eq(now()),
                ))
                .execute(&mut conn)?;
            ships::table.find(&ship_id).select(ShipRow::as_select()).first(&mut conn)
        })
        .await
        .map_err(|e| BayError::Internal(e.to_string()))?
        .map_err(BayError::from)
    }
}

fn monotonic_expiry(current: Option<&str>, ttl_secs: i64) -> String {
    let candidate = Utc::now() + chrono::Duration::seconds(ttl_secs);
    match current.and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) {
        Some(current) if current.with_timezone(&Utc) >= candidate => current.to_rfc3339(),
        _ => candidate.to_rfc3339(),
    }
}

type SqliteConnectionAlias = diesel::sqlite::SqliteConnection;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_expiry_never_shortens() {
        let far_future = (Utc::now() + chrono::Duration::days(1)).to_rfc3339();
        let result = monotonic_expiry(Some(&far_future), 10);
        assert_eq!(result, far_future);
    }

    #[test]
    fn monotonic_expiry_extends_when_shorter() {
        let past = (Utc::now() - chrono::Duration::days(1)).to_rfc3339();
        let result = monotonic_expiry(Some(&past), 3600);
        assert!(chrono::DateTime::parse_from_rfc3339(&result).unwrap() > chrono::DateTime::parse_from_rfc3339(&past).unwrap());
    }

    use crate::config::{CapacityBehavior, DriverKind, KubeConfig, WarmPoolConfig};
    use crate::database::test_support::test_pool;
    use crate::driver::test_support::FakeDriver;

    fn test_config() -> BayConfig {
        BayConfig {
            max_ship_num: 10,
            behavior_after_max_ship: CapacityBehavior::Reject,
            access_token: "test-token".into(),
            container_driver: DriverKind::DockerAttached,
            docker_image: "shipyard/ship:test".into(),
            docker_network: "bridge".into(),
            ship_container_port: 8123,
            ship_health_check_timeout: Duration::from_millis(500),
            ship_health_check_interval: Duration::from_millis(10),
            ship_data_dir: "/tmp/shipyard-test".into(),
            database_url: ":memory:".into(),
            kube: KubeConfig {
                namespace: "default".into(),
                kubeconfig_path: None,
                image_pull_policy: "IfNotPresent".into(),
                pvc_size: "1Gi".into(),
                storage_class: None,
            },
            warm_pool: WarmPoolConfig {
                enabled: false,
                min_size: 0,
                max_size: 0,
                replenish_interval: Duration::from_secs(3600),
            },
            reaper_interval: Duration::from_secs(3600),
            exec_timeout: Duration::from_secs(30),
            bind_addr: "127.0.0.1:0".into(),
        }
    }

    /// Minimal HTTP server that answers `200 OK` to anything, so
    /// `ShipClient::wait_until_ready` succeeds against a real socket instead
    /// of looping out to its timeout.
    async fn spawn_fake_health_server() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n").await;
                });
            }
        });
        addr.to_string()
    }

    fn seed_ship(conn: &mut SqliteConnectionAlias, id: &str, warm_pool: bool, status: ShipStatus) {
        diesel::insert_into(ships::table)
            .values(NewShip::creating(id, "docker", "img", 1.0, "512m", None, 3600, warm_pool))
            .execute(conn)
            .unwrap();
        diesel::update(ships::table.find(id))
            .set((
                ships::status.eq(status.as_str()),
                ships::container_id.eq(format!("fake-{id}")),
                ships::expires_at.eq(Some((Utc::now() + chrono::Duration::hours(1)).to_rfc3339())),
            ))
            .execute(conn)
            .unwrap();
    }

    #[tokio::test]
    async fn try_claim_pool_is_atomic_under_concurrency() {
        let (pool, _tmp) = test_pool();
        {
            let mut conn = pool.get().unwrap();
            seed_ship(&mut conn, "pool-ship-1", true, ShipStatus::Running);
        }

        let driver: Arc<dyn ContainerDriver> = Arc::new(FakeDriver::default());
        let ship_client = Arc::new(ShipClient::new("token".into()));
        let config = Arc::new(test_config());
        let service = Arc::new(ShipService::new(pool, driver, ship_client, config).unwrap());

        let mut tasks = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            tasks.push(tokio::spawn(async move {
                service.try_claim_pool(&format!("session-{i}"), 60).await.unwrap()
            }));
        }

        let mut claims = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                claims += 1;
            }
        }
        assert_eq!(claims, 1, "exactly one concurrent claimant should win the single pool ship");
    }

    #[tokio::test]
    async fn acquire_serializes_concurrent_first_time_requests_for_one_session() {
        let (pool, _tmp) = test_pool();
        let endpoint = spawn_fake_health_server().await;

        let driver = Arc::new(FakeDriver::default());
        *driver.endpoint.lock().unwrap() = Some(endpoint);
        let driver: Arc<dyn ContainerDriver> = driver;
        let ship_client = Arc::new(ShipClient::new("token".into()));
        let config = Arc::new(test_config());
        let service = Arc::new(ShipService::new(pool, driver, ship_client, config).unwrap());

        let spec = ResourceSpec {
            cpus: 1.0,
            memory: "512m".into(),
            disk: None,
        };

        let (a, b) = tokio::join!(
            service.acquire("session-new", 60, spec.clone(), false),
            service.acquire("session-new", 60, spec.clone(), false),
        );
        let ship_a = a.unwrap();
        let ship_b = b.unwrap();

        // Without per-session serialization both calls would race past
        // steps 1-3 and create two different Ships; with it, the second
        // caller observes the first caller's finished Session binding.
        assert_eq!(ship_a.id, ship_b.id);
    }

    #[tokio::test]
    async fn acquire_step1_reuses_existing_binding_without_creating() {
        let (pool, _tmp) = test_pool();
        {
            let mut conn = pool.get().unwrap();
            seed_ship(&mut conn, "bound-ship", false, ShipStatus::Running);
            diesel::insert_into(sessions::table)
                .values(NewSession::new("session-a", "bound-ship", 60))
                .execute(&mut conn)
                .unwrap();
        }

        let driver = Arc::new(FakeDriver::default());
        driver.running.lock().unwrap().insert("fake-bound-ship".into());
        let driver: Arc<dyn ContainerDriver> = driver;
        let ship_client = Arc::new(ShipClient::new("token".into()));
        let config = Arc::new(test_config());
        let service = ShipService::new(pool, driver, ship_client, config).unwrap();

        let spec = ResourceSpec { cpus: 1.0, memory: "512m".into(), disk: None };
        let ship = service.acquire("session-a", 60, spec, false).await.unwrap();
        assert_eq!(ship.id, "bound-ship");
    }

    #[tokio::test]
    async fn acquire_step3_claims_pool_ship_for_new_session() {
        let (pool, _tmp) = test_pool();
        {
            let mut conn = pool.get().unwrap();
            seed_ship(&mut conn, "pool-ship-2", true, ShipStatus::Running);
        }

        let driver: Arc<dyn ContainerDriver> = Arc::new(FakeDriver::default());
        let ship_client = Arc::new(ShipClient::new("token".into()));
        let config = Arc::new(test_config());
        let service = ShipService::new(pool, driver, ship_client, config).unwrap();

        let spec = ResourceSpec { cpus: 1.0, memory: "512m".into(), disk: None };
        let ship = service.acquire("session-b", 60, spec, false).await.unwrap();
        assert_eq!(ship.id, "pool-ship-2");
    }
}
