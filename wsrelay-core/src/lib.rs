pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod store;

pub use bus::{BusSubscription, MemoryBus, MessageBus, RedisBus};
pub use config::Config;
pub use error::{Error, Result};
pub use store::{MemoryStore, RedisStore, SharedStore};
