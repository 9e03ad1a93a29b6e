use thiserror::Error as ThisError;

use crate::instance_lock::InstanceLockError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Transport publish failed on {topic}: {reason}")]
    TransportFailed { topic: String, reason: String },

    #[error("Invalid property '{key}' in patch for {entity}: {reason}")]
    InvalidPatch {
        entity: String,
        key: String,
        reason: String,
    },

    #[error("Payload for {0} is not a JSON object")]
    NotAnObject(String),

    #[error("Invalid device options: {0}")]
    InvalidOptions(String),

    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    InstanceLock(#[from] InstanceLockError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
