//! Lifecycle-specific error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by lifecycle transitions and module loading
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// A module failed while executing against a starting application
    #[error("module startup failed for {module}: {message}")]
    StartupFailed {
        /// Name of the failing module
        module: String,
        /// Underlying failure
        message: String,
    },

    /// The module-loading phase exceeded the configured startup timeout
    #[error("module loading did not complete within {timeout:?}")]
    StartupTimeout {
        /// Configured bound
        timeout: Duration,
    },

    /// A module re-entered the loader for a name already in progress
    #[error("module {name} is already loading; recursive module startup is not allowed")]
    ModuleRecursion {
        /// The offending module name
        name: String,
    },

    /// The controller is not in a state where the operation is valid
    #[error("application host is {state}")]
    InvalidState {
        /// Human-readable current state
        state: String,
    },

    /// Teardown exceeded its deadline
    #[error("{phase} did not complete within {timeout:?}")]
    ShutdownTimeout {
        /// What was being torn down
        phase: String,
        /// Configured bound
        timeout: Duration,
    },

    /// Failure reported by the network engine
    #[error("engine failure: {message}")]
    Engine {
        /// Engine-supplied description
        message: String,
    },
}

impl LifecycleError {
    /// Create a module startup failure
    pub fn startup_failed(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StartupFailed {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Create a module recursion error
    pub fn recursion(name: impl Into<String>) -> Self {
        Self::ModuleRecursion { name: name.into() }
    }

    /// Create an invalid-state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a shutdown timeout error
    pub fn shutdown_timeout(phase: impl Into<String>, timeout: Duration) -> Self {
        Self::ShutdownTimeout {
            phase: phase.into(),
            timeout,
        }
    }

    /// Create an engine failure
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }
}

/// A specialized Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;
