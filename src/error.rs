use thiserror::Error;

/// Supervisor-wide error taxonomy. The supervisor is the single translation
/// boundary: everything a tenant can observe maps onto one of these variants
/// and its stable `error_code`.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Malformed request. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Tenant is at its concurrent-bot limit.
    #[error("tenant '{tenant}' is at its bot limit ({limit})")]
    QuotaExceeded { tenant: String, limit: u32 },

    /// Image build exited non-zero. Carries the builder's stderr.
    #[error("image build failed: {0}")]
    BuildFailed(String),

    /// An external runtime call failed. The caller decides retry policy;
    /// the driver itself never retries.
    #[error("runtime '{operation}' failed: {message}")]
    Runtime {
        operation: &'static str,
        message: String,
    },

    /// An external runtime call exceeded its deadline. Treated like a
    /// runtime failure for state purposes.
    #[error("runtime '{operation}' timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    /// Unknown bot or container identifier.
    #[error("'{0}' not found")]
    NotFound(String),

    /// The requested action is illegal from the bot's current state.
    #[error("cannot {action} from state '{from}'")]
    InvalidTransition {
        from: &'static str,
        action: &'static str,
    },

    #[error("registry error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Stable tenant-facing error code. These strings are part of the
    /// external contract and must not change casually.
    pub fn error_code(&self) -> &'static str {
        match self {
            SupervisorError::InvalidInput(_) => "invalid_input",
            SupervisorError::QuotaExceeded { .. } => "quota_exceeded",
            SupervisorError::BuildFailed(_) => "build_failed",
            SupervisorError::Runtime { .. } => "runtime_error",
            SupervisorError::Timeout { .. } => "timeout",
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::InvalidTransition { .. } => "invalid_transition",
            SupervisorError::Storage(_) => "storage_error",
            SupervisorError::Io(_) => "io_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
