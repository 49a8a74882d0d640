use thiserror::Error;

use crate::lifecycle::LifecycleError;

pub type Result<T> = std::result::Result<T, HostError>;

/// Top-level error for host operations that cross the engine seam
#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("engine i/o error: {0}")]
    Io(#[from] std::io::Error),
}
