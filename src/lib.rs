//! BLE command core for dormitory door locks: packet codec, transport
//! link, command orchestrator and the door session built on top of them.

pub mod domain;
pub mod infrastructure;
pub mod session;

pub use domain::models::{AppEvent, CommandEvent, ConnectionState, LinkState};
pub use domain::target::RoomIdentity;
pub use infrastructure::bluetooth::orchestrator::CommandOutcome;
pub use session::{DoorSession, SessionError};
