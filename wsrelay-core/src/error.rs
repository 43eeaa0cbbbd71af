use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error means the bus subscription itself is gone and must be
    /// re-established, as opposed to a single failed poll.
    #[must_use]
    pub const fn is_subscription_lost(&self) -> bool {
        matches!(self, Self::SubscriptionClosed(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
