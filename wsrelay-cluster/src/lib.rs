pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{
    BroadcastResult, BusBridge, CloseReason, Connection, ConnectionRegistry, DrainController,
    DrainSettings, DrainState, HeartbeatSettings, InboundStream, LeaderHeartbeat,
};
