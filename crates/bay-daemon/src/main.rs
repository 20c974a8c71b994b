//! Bay daemon entry point: loads configuration, opens the database, builds
//! the driver and service layer, spawns the Warm Pool and Reaper background
//! loops, then serves the HTTP façade until it exits.

use std::sync::Arc;

use bay_core::config::BayConfig;
use bay_core::database;
use bay_core::driver::build_driver;
use bay_core::gateway::{start_gateway, GatewayState};
use bay_core::history::HistoryService;
use bay_core::reaper::Reaper;
use bay_core::session_service::SessionService;
use bay_core::ship_client::ShipClient;
use bay_core::ship_service::ShipService;
use bay_core::warm_pool::WarmPool;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Arc::new(BayConfig::from_env()?);
    tracing::info!(driver = config.container_driver.as_str(), max_ship_num = config.max_ship_num, "starting bay daemon");

    let pool = database::init(&config.database_url)?;
    let driver = build_driver(&config).await?;
    let ship_client = Arc::new(ShipClient::new(config.access_token.clone()));

    let ships = Arc::new(ShipService::new(pool.clone(), driver.clone(), ship_client.clone(), config.clone())?);
    let sessions = Arc::new(SessionService::new(pool.clone()));
    let history = Arc::new(HistoryService::new(pool.clone()));

    let warm_pool = Arc::new(WarmPool::new(
        pool.clone(),
        driver.clone(),
        ship_client.clone(),
        ships.capacity_handle(),
        config.clone(),
    ));
    let _warm_pool_stop = warm_pool.spawn();

    let reaper = Arc::new(Reaper::new(pool.clone(), driver.clone(), ships.capacity_handle(), config.clone()));
    let _reaper_stop = reaper.spawn();

    let state = GatewayState {
        ships,
        sessions,
        history,
        ship_client,
        config,
    };

    start_gateway(state).await.map_err(|e| e.into())
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}
