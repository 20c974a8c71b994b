pub mod config;
pub mod database;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod history;
pub mod reaper;
pub mod session_service;
pub mod ship_client;
pub mod ship_service;
pub mod warm_pool;

/// Convenience re-exports for the most commonly used types across the Bay
/// codebase.
///
/// ```rust
/// use bay_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::BayConfig;
    pub use crate::database::DbPool;
    pub use crate::driver::{ContainerDriver, ContainerInfo, DriverError, ResourceSpec};
    pub use crate::error::BayError;
    pub use crate::gateway::{start_gateway, GatewayState};
    pub use crate::history::{HistoryFilter, HistoryService};
    pub use crate::reaper::Reaper;
    pub use crate::session_service::SessionService;
    pub use crate::ship_client::ShipClient;
    pub use crate::ship_service::ShipService;
    pub use crate::warm_pool::WarmPool;
}
