use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame encoding error: {0}")]
    Frame(#[from] bincode::Error),

    #[error("No subscribers on topic {0}")]
    NoSubscribers(String),

    #[error("Broker connection closed")]
    Closed,

    #[error("Broker rejected request: {0}")]
    Rejected(String),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(&'static str),
}
