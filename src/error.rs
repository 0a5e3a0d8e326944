use thiserror::Error;

/// Error taxonomy for the bridge. Variants map 1:1 onto spec §7; the
/// `Display` impl is the operator-facing detail (logged), never shown to a
/// chat user directly — callers use [`AppError::user_message`] for that.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration file missing: {0}")]
    ConfigMissing(String),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("image build failed: {0}")]
    ImageBuildFailed(String),

    #[error("container operation failed: {0}")]
    ContainerOperationFailed(String),

    #[error("execution timed out after {0}s")]
    ExecTimeout(u64),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("store error: {0}")]
    StoreError(#[from] sqlx::Error),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("blocked by security filter: {0}")]
    SecurityBlocked(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("ambiguous: {0} matches")]
    Ambiguous(usize),

    #[error("bad arguments: {0}")]
    BadArgs(String),
}

impl AppError {
    /// The string a chat user should see. Internal detail never leaks here;
    /// admin-facing commands build their own precise diagnostics instead of
    /// calling this (see spec §7's "admin commands return precise
    /// diagnostics" rule).
    pub fn user_message(&self) -> String {
        match self {
            AppError::RateLimited(reason) => reason.clone(),
            AppError::PermissionDenied => "You don't have permission to do that.".to_string(),
            AppError::SecurityBlocked(reason) => reason.clone(),
            AppError::NotFound(what) => format!("Not found: {what}"),
            AppError::Ambiguous(n) => format!("Ambiguous: {n} matches"),
            AppError::BadArgs(msg) => msg.clone(),
            AppError::ExecTimeout(_) | AppError::ExecFailed(_) => {
                "Sorry, please try again.".to_string()
            }
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
