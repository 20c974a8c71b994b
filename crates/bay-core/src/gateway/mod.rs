//! HTTP Façade (C9): bearer-auth REST + WebSocket surface over the service
//! layer (§4.7/§6).

pub mod auth;
pub mod daemon;
pub mod routes;
pub mod ws;

pub use daemon::start_gateway;

use std::sync::Arc;

use crate::config::BayConfig;
use crate::history::HistoryService;
use crate::session_service::SessionService;
use crate::ship_client::ShipClient;
use crate::ship_service::ShipService;

/// Shared state handed to every axum handler.
#[derive(Clone)]
pub struct GatewayState {
    pub ships: Arc<ShipService>,
    pub sessions: Arc<SessionService>,
    pub history: Arc<HistoryService>,
    pub ship_client: Arc<ShipClient>,
    pub config: Arc<BayConfig>,
}
