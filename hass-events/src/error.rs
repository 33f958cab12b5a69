use thiserror::Error;

/// Errors that can occur in the event router
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Handlers run on tokio tasks, so the router must be built inside a runtime
    #[error("Event router must be created from within a tokio runtime")]
    NoRuntime,
}

/// Result type for router operations
pub type Result<T> = std::result::Result<T, RouterError>;
