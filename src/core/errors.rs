use crate::core::traits::backend::BackendError;

/// Errors reported to the caller before any sandbox resource is touched,
/// or from the debug-run path which has no verdict to carry them.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("failed to prepare workspace: {0}")]
    Workspace(#[from] std::io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Sandbox(#[from] BackendError),
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("slot pool for {image} has been shut down")]
    Closed { image: String },
}
