pub mod execution_history;
pub mod session;
pub mod ship;

pub use execution_history::{ExecType, ExecutionHistoryData, ExecutionHistoryRow, NewExecutionHistory};
pub use session::{NewSession, SessionData, SessionRow};
pub use ship::{NewShip, ShipData, ShipRow, ShipStatus};
