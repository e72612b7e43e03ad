use thiserror::Error;

#[derive(Error, Debug)]
pub enum LatchError {
    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Rule not found: {0}")]
    RuleNotFound(i64),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Dispatcher shut down")]
    ShutDown,

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for LatchError {
    fn from(e: serde_json::Error) -> Self {
        LatchError::Serialize(e.to_string())
    }
}
