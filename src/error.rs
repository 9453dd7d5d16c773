//! Error types for the task queue

use thiserror::Error;

/// Result type alias for task queue operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Error types for the task queue system
#[derive(Error, Debug)]
pub enum TaskError {
    /// Redis connection or operation errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Envelope, payload or signature serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store operation errors
    #[error("Queue operation failed: {operation}: {reason}")]
    QueueOperation { operation: String, reason: String },

    /// A handler returned an error while processing a task
    #[error("Handler for {task_type} failed: {message}")]
    Handler { task_type: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Lock release kept being invalidated by concurrent writers
    #[error("Lock release contended out: {name} after {attempts} attempts")]
    LockContended { name: String, attempts: u32 },

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// Create a queue operation error
    pub fn queue_operation<S: Into<String>>(operation: S, reason: S) -> Self {
        Self::QueueOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a handler error
    pub fn handler<S: Into<String>>(task_type: S, message: S) -> Self {
        Self::Handler {
            task_type: task_type.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Check if the error is transient (the operation may succeed if retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || e.is_timeout()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::BusyLoadingError
                            | redis::ErrorKind::TryAgain
                            | redis::ErrorKind::ClusterDown
                            | redis::ErrorKind::MasterDown
                    )
            }
            TaskError::QueueOperation { .. } => false,
            TaskError::LockContended { .. } => true,
            TaskError::Serialization(_) => false,
            TaskError::Handler { .. } => false,
            TaskError::Config { .. } => false,
            TaskError::Internal(_) => false,
        }
    }
}
