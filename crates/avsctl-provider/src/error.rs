//! Error types for the container runtime adapter

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to connect to container runtime: {0}")]
    Connection(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("compose {verb} failed: {message}")]
    Compose { verb: String, message: String },

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Failed to parse runtime output: {0}")]
    Parse(String),

    #[error("Container {0} has no IP address")]
    NoContainerIp(String),

    #[error("Container {0} is not attached to any network")]
    NoContainerNetwork(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::ContainerNotFound(message),
            other => RuntimeError::Runtime(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
