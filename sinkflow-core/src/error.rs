use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Log Error - {0}")]
    Log(String),

    #[error("Store Error - {0}")]
    Store(String),

    #[error("Liveness Error - {0}")]
    Liveness(String),

    #[error("metrics Error - {0}")]
    Metrics(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ActorPatternRecv(e.to_string())
    }
}
