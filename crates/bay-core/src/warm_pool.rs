//! Warm Pool (C4): keeps a standby supply of pre-started Ships so an
//! allocation can skip the create+readiness-probe latency (§4.4). The
//! replenish loop is a ticking background task with a `watch`-channel stop
//! signal, generalized from "run due jobs" to "count, top up, or trim the
//! pool".

use std::sync::Arc;

use diesel::prelude::*;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use crate::config::BayConfig;
use crate::database::models::{NewShip, ShipRow, ShipStatus};
use crate::database::schema::ships;
use crate::database::DbPool;
use crate::driver::{ContainerDriver, ResourceSpec};
use crate::ship_client::ShipClient;

/// Long default TTL for pool Ships (§4.4): expiry should be rare, not
/// impossible — the Reaper still sweeps them like any other Ship.
const POOL_SHIP_TTL_SECS: i64 = 6 * 60 * 60;

pub struct WarmPool {
    pool: DbPool,
    driver: Arc<dyn ContainerDriver>,
    ship_client: Arc<ShipClient>,
    capacity: Arc<Semaphore>,
    config: Arc<BayConfig>,
}

impl WarmPool {
    pub fn new(
        pool: DbPool,
        driver: Arc<dyn ContainerDriver>,
        ship_client: Arc<ShipClient>,
        capacity: Arc<Semaphore>,
        config: Arc<BayConfig>,
    ) -> Self {
        Self {
            pool,
            driver,
            ship_client,
            capacity,
            config,
        }
    }

    /// Spawns the replenish loop; returns a sender that stops it when dropped
    /// or sent `true`.
    pub fn spawn(self: Arc<Self>) -> watch::Sender<bool> {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        if !self.config.warm_pool.enabled {
            return stop_tx;
        }

        let this = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.warm_pool.replenish_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.tick().await {
                            tracing::warn!(error = %e, "warm pool tick failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            tracing::info!("warm pool replenisher stopping");
                            break;
                        }
                    }
                }
            }
        });
        stop_tx
    }

    async fn tick(&self) -> Result<(), diesel::result::Error> {
        let warm_pool_cfg = &self.config.warm_pool;

        let (pool_count, total_count): (i64, i64) = {
            let pool = self.pool.clone();
            tokio::task::spawn_blocking({
                let pool = pool.clone();
                move || -> Result<(i64, i64), diesel::result::Error> {
                    let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
                    let pool_count = ships::table
                        .filter(ships::warm_pool.eq(1))
                        .filter(ships::status.eq(ShipStatus::Running.as_str()))
                        .count()
                        .get_result(&mut conn)?;
                    let total_count = ships::table
                        .filter(ships::status.ne(ShipStatus::Stopped.as_str()))
                        .count()
                        .get_result(&mut conn)?;
                    Ok((pool_count, total_count))
                }
            })
            .await
            .map_err(|_| diesel::result::Error::RollbackTransaction)??
        };

        if pool_count < warm_pool_cfg.min_size as i64 {
            let budget = (self.config.max_ship_num as i64 - total_count).max(0);
            let want = (warm_pool_cfg.max_size as i64 - pool_count).min(budget);
            for _ in 0..want.max(0) {
                if let Err(e) = self.create_one().await {
                    tracing::warn!(error = %e, "warm pool failed to create standby ship");
                    break;
                }
            }
        } else if pool_count > warm_pool_cfg.max_size as i64 {
            let excess = pool_count - warm_pool_cfg.max_size as i64;
            self.evict_oldest(excess).await?;
        }

        Ok(())
    }

    async fn create_one(&self) -> Result<(), diesel::result::Error> {
        let Ok(permit) = self.capacity.clone().try_acquire_owned() else {
            return Ok(());
        };

        let ship_id = Uuid::new_v4().to_string();
        let spec = ResourceSpec {
            cpus: 1.0,
            memory: "512m".to_string(),
            disk: None,
        };

        let pool = self.pool.clone();
        let new_row = NewShip::creating(
            ship_id.clone(),
            self.config.container_driver.as_str(),
            self.config.docker_image.clone(),
            spec.cpus,
            spec.memory.clone(),
            spec.disk.clone(),
            POOL_SHIP_TTL_SECS as i32,
            true,
        );
        tokio::task::spawn_blocking(move || -> Result<(), diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            diesel::insert_into(ships::table).values(new_row).execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|_| diesel::result::Error::RollbackTransaction)??;

        let info = match self.driver.create(&ship_id, &spec).await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(ship_id, error = %e, "warm pool ship creation failed");
                drop(permit);
                return self.delete_failed(&ship_id).await;
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
            tracing::warn!(ship_id, error = %e, "warm pool ship never became ready");
            let _ = self.driver.stop(&info.container_id).await;
            drop(permit);
            return self.delete_failed(&ship_id).await;
        }

        permit.forget();
        let expiry = (chrono::Utc::now() + chrono::Duration::seconds(POOL_SHIP_TTL_SECS)).to_rfc3339();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<(), diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            diesel::update(ships::table.find(&ship_id))
                .set((
                    ships::status.eq(ShipStatus::Running.as_str()),
                    ships::container_id.eq(&info.container_id),
                    ships::endpoint.eq(&info.endpoint),
                    ships::expires_at.eq(&expiry),
                    ships::updated_at.eq(chrono::Utc::now().to_rfc3339()),
                ))
                .execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|_| diesel::result::Error::RollbackTransaction)??;

        tracing::info!("warm pool replenished one standby ship");
        Ok(())
    }

    async fn delete_failed(&self, ship_id: &str) -> Result<(), diesel::result::Error> {
        let pool = self.pool.clone();
        let ship_id = ship_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), diesel::result::Error> {
            let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
            diesel::delete(ships::table.find(&ship_id)).execute(&mut conn)?;
            Ok(())
        })
        .await
        .map_err(|_| diesel::result::Error::RollbackTransaction)?
    }

    async fn evict_oldest(&self, count: i64) -> Result<(), diesel::result::Error> {
        let pool = self.pool.clone();
        let victims = tokio::task::spawn_blocking({
            let pool = pool.clone();
            move || -> Result<Vec<ShipRow>, diesel::result::Error> {
                let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
                ships::table
                    .filter(ships::warm_pool.eq(1))
                    .filter(ships::status.eq(ShipStatus::Running.as_str()))
                    .order(ships::created_at.asc())
                    .limit(count)
                    .select(ShipRow::as_select())
                    .load(&mut conn)
            }
        })
        .await
        .map_err(|_| diesel::result::Error::RollbackTransaction)??;

        for victim in victims {
            let pool = self.pool.clone();
            let victim_id = victim.id.clone();
            let deleted = tokio::task::spawn_blocking(move || -> Result<usize, diesel::result::Error> {
                let mut conn = pool.get().map_err(|_| diesel::result::Error::BrokenTransactionManager)?;
                diesel::delete(
                    ships::table
                        .filter(ships::id.eq(&victim_id))
                        .filter(ships::warm_pool.eq(1)),
                )
                .execute(&mut conn)
            })
            .await
            .map_err(|_| diesel::result::Error::RollbackTransaction)??;

            if deleted == 0 {
                // Claimed by try_claim_pool between our SELECT and this DELETE —
                // it's someone's Ship now, leave it running.
                continue;
            }

            if let Some(container_id) = &victim.container_id {
                let _ = self.driver.stop(container_id).await;
            }
            self.capacity.add_permits(1);
            tracing::info!(ship_id = %victim.id, "warm pool evicted oldest standby ship");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BayConfig, CapacityBehavior, DriverKind, KubeConfig, WarmPoolConfig};
    use crate::database::test_support::test_pool;
    use crate::driver::test_support::FakeDriver;
    use std::time::Duration;

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

    fn seed_pool_ship(pool: &DbPool, id: &str) {
        let mut conn = pool.get().unwrap();
        diesel::insert_into(ships::table)
            .values(NewShip::creating(id, "docker", "img", 1.0, "512m", None, POOL_SHIP_TTL_SECS as i32, true))
            .execute(&mut conn)
            .unwrap();
        diesel::update(ships::table.find(id))
            .set((
                ships::status.eq(ShipStatus::Running.as_str()),
                ships::container_id.eq(format!("fake-{id}")),
            ))
            .execute(&mut conn)
            .unwrap();
    }

    /// Races `evict_oldest` against a `try_claim_pool`-shaped guarded update
    /// for the same row. Exactly one of the two may win; the row must never
    /// end up deleted *and* claimed, nor left behind still marked warm_pool=1.
    #[tokio::test]
    async fn evict_oldest_does_not_steal_a_ship_claimed_mid_flight() {
        let (db_pool, _tmp) = test_pool();
        seed_pool_ship(&db_pool, "race-ship");

        let driver: Arc<dyn ContainerDriver> = Arc::new(FakeDriver::default());
        let ship_client = Arc::new(ShipClient::new("token".into()));
        let capacity = Arc::new(Semaphore::new(0));
        let config = Arc::new(test_config());
        let warm_pool = Arc::new(WarmPool::new(db_pool.clone(), driver, ship_client, capacity.clone(), config));

        let claim_pool = db_pool.clone();
        let claim = tokio::task::spawn_blocking(move || -> usize {
            let mut conn = claim_pool.get().unwrap();
            diesel::update(
                ships::table
                    .filter(ships::id.eq("race-ship"))
                    .filter(ships::warm_pool.eq(1)),
            )
            .set(ships::warm_pool.eq(0))
            .execute(&mut conn)
            .unwrap()
        });

        let evict = warm_pool.evict_oldest(1);

        let (claimed, evict_result) = tokio::join!(claim, evict);
        let claimed = claimed.unwrap();
        evict_result.unwrap();

        let mut conn = db_pool.get().unwrap();
        let remaining: Vec<ShipRow> = ships::table
            .filter(ships::id.eq("race-ship"))
            .select(ShipRow::as_select())
            .load(&mut conn)
            .unwrap();

        if claimed == 1 {
            // The claim won: the row must survive, still belonging to whoever
            // claimed it, not stopped out from under them.
            assert_eq!(remaining.len(), 1, "a claimed ship must not be evicted");
            assert_eq!(remaining[0].warm_pool, 0);
            assert_eq!(capacity.available_permits(), 0);
        } else {
            // The eviction won: the claim found nothing left to claim, and the
            // row is gone with its capacity permit released.
            assert!(remaining.is_empty(), "eviction must remove the row once it wins the race");
            assert_eq!(capacity.available_permits(), 1);
        }
    }

    #[tokio::test]
    async fn evict_oldest_removes_uncontended_standby_ship() {
        let (db_pool, _tmp) = test_pool();
        seed_pool_ship(&db_pool, "standby-ship");

        let driver: Arc<dyn ContainerDriver> = Arc::new(FakeDriver::default());
        let ship_client = Arc::new(ShipClient::new("token".into()));
        let capacity = Arc::new(Semaphore::new(0));
        let config = Arc::new(test_config());
        let warm_pool = WarmPool::new(db_pool.clone(), driver, ship_client, capacity.clone(), config);

        warm_pool.evict_oldest(1).await.unwrap();

        let mut conn = db_pool.get().unwrap();
        let remaining: i64 = ships::table
            .filter(ships::id.eq("standby-ship"))
            .count()
            .get_result(&mut conn)
            .unwrap();
        assert_eq!(remaining, 0);
        assert_eq!(capacity.available_permits(), 1);
    }
}
