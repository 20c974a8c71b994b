//! Reaper (C5): periodically sweeps expired Ships. One tick every
//! `reaper_interval` (§4.5); structured the same way as [`crate::warm_pool::WarmPool`].

use std::sync::Arc;
use std::time::Duration;

use diesel::prelude::*;
use tokio::sync::{watch, Semaphore};

use crate::config::BayConfig;
use crate::database::models::{ShipRow, ShipStatus};
use crate::database::schema::{sessions, ships};
use crate::database::DbPool;
use crate::driver::ContainerDriver;

/// Bound on how long a single driver.stop may run before the reaper gives up
/// on that row for this tick and retries next time.
const STOP_TIMEOUT: Duration = Duration::from_secs(20);

pub struct Reaper {
    pool: DbPool,
    driver: Arc<dyn ContainerDriver>,
    capacity: Arc<Semaphore>,
    config: Arc<BayConfig>,
}

impl Reaper {
    pub fn new(pool: DbPool, driver: Arc<dyn ContainerDriver>, capacity: Arc<Semaphore>, config: Arc<BayConfig>) -> Self {
        Self {
            pool,
            driver,
            capacity,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>) -> watch::Sender<bool> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let this = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.reaper_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.sweep().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            tracing::info!("reaper stopping");
                            break;
                        }
                    }
                }
            }
        });
        stop_tx
    }

    async fn sweep(&self) {
        let expired = match self.expired_rows().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "reaper failed to query expired ships");
                return;
            }
        };

        for ship in expired {
            if let Some(container_id) = &ship.container_id {
                match tokio::time::timeout(STOP_TIMEOUT, self.driver.stop(container_id)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(ship_id = %ship.id, error = %e, "reaper: driver stop failed, retrying next tick");
                        continue;
                    }
                    Err(_) => {
                        tracing::warn!(ship_id = %ship.id, "reaper: driver stop timed out, retrying next tick");
                        continue;
                    }
                }
            }

            if let Err(e) = self.mark_stopped_and_unbind(&ship.id).await {
                tracing::warn!(ship_id = %ship.id, error = %e, "reaper: failed to update row, retrying next tick");
                continue;
            }

            self.capacity.add_permits(1);
            tracing::info!(ship_id = %ship.id, "reaper: ship expired and stopped");
        }
    }

    async fn expired_rows(&self) -> Result<Vec<ShipRow>, diesel::result::Error> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ShipRow>, diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            let now = chrono::Utc::now().to_rfc3339();
            ships::table
                .filter(ships::status.eq(ShipStatus::Running.as_str()))
                .filter(ships::expires_at.lt(&now))
                .select(ShipRow::as_select())
                .load(&mut conn)
        })
        .await
        .map_err(|_| diesel::result::Error::RollbackTransaction)?
    }

    async fn mark_stopped_and_unbind(&self, ship_id: &str) -> Result<(), diesel::result::Error> {
        let pool = self.pool.clone();
        let ship_id = ship_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            crate::database::immediate_transaction(&mut conn, |conn| {
                diesel::update(ships::table.find(&ship_id))
                    .set((
                        ships::status.eq(ShipStatus::Stopped.as_str()),
                        ships::endpoint.eq(None::<String>),
                        ships::expires_at.eq(None::<String>),
                        ships::updated_at.eq(chrono::Utc::now().to_rfc3339()),
                    ))
                    .execute(conn)?;
                diesel::delete(sessions::table.filter(sessions::ship_id.eq(&ship_id))).execute(conn)?;
                Ok(())
            })
        })
        .await
        .map_err(|_| diesel::result::Error::RollbackTransaction)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BayConfig, CapacityBehavior, DriverKind, KubeConfig, WarmPoolConfig};
    use crate::database::models::{NewSession, NewShip};
    use crate::database::test_support::test_pool;
    use crate::driver::test_support::FakeDriver;
    use diesel::prelude::*;

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

    #[tokio::test]
    async fn sweep_stops_and_unbinds_expired_ships_only() {
        let (pool, _tmp) = test_pool();
        {
            let mut conn = pool.get().unwrap();
            let past = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
            let future = (chrono::Utc::now() + chrono::Duration::hours(1)).to_rfc3339();

            diesel::insert_into(ships::table)
                .values(NewShip::creating("expired-ship", "docker", "img", 1.0, "512m", None, 60, false))
                .execute(&mut conn)
                .unwrap();
            diesel::update(ships::table.find("expired-ship"))
                .set((
                    ships::status.eq(ShipStatus::Running.as_str()),
                    ships::container_id.eq("fake-expired-ship"),
                    ships::expires_at.eq(Some(past)),
                ))
                .execute(&mut conn)
                .unwrap();
            diesel::insert_into(sessions::table)
                .values(NewSession::new("session-expired", "expired-ship", 60))
                .execute(&mut conn)
                .unwrap();

            diesel::insert_into(ships::table)
                .values(NewShip::creating("alive-ship", "docker", "img", 1.0, "512m", None, 3600, false))
                .execute(&mut conn)
                .unwrap();
            diesel::update(ships::table.find("alive-ship"))
                .set((
                    ships::status.eq(ShipStatus::Running.as_str()),
                    ships::container_id.eq("fake-alive-ship"),
                    ships::expires_at.eq(Some(future)),
                ))
                .execute(&mut conn)
                .unwrap();
        }

        let driver = Arc::new(FakeDriver::default());
        driver.running.lock().unwrap().insert("fake-expired-ship".into());
        driver.running.lock().unwrap().insert("fake-alive-ship".into());
        let driver: Arc<dyn ContainerDriver> = driver;

        let capacity = Arc::new(Semaphore::new(0));
        let config = Arc::new(test_config());
        let reaper = Reaper::new(pool.clone(), driver.clone(), capacity.clone(), config);

        reaper.sweep().await;

        let mut conn = pool.get().unwrap();
        let expired: ShipRow = ships::table
            .find("expired-ship")
            .select(ShipRow::as_select())
            .first(&mut conn)
            .unwrap();
        assert_eq!(expired.status, ShipStatus::Stopped.as_str());
        assert!(expired.expires_at.is_none());

        let remaining_sessions: i64 = sessions::table
            .filter(sessions::ship_id.eq("expired-ship"))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(remaining_sessions, 0, "session bound to a reaped ship must be unbound");

        let alive: ShipRow = ships::table
            .find("alive-ship")
            .select(ShipRow::as_select())
            .first(&mut conn)
            .unwrap();
        assert_eq!(alive.status, ShipStatus::Running.as_str(), "non-expired ship must survive a sweep");

        assert_eq!(capacity.available_permits(), 1, "one permit released for the one reaped ship");
    }
}
