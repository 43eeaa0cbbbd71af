// Module: sync

pub mod bridge;
pub mod drain;
pub mod leader;
pub mod registry;

pub use bridge::{BusBridge, CloseReason, InboundStream};
pub use drain::{DrainController, DrainSettings, DrainState};
pub use leader::{HeartbeatSettings, LeaderHeartbeat};
pub use registry::{
    BroadcastResult, ChannelSender, Connection, ConnectionId, ConnectionRegistry, MessageSender,
};
