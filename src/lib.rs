//! # Portico
//!
//! An application lifecycle engine for embedding an HTTP server host in
//! your process.
//!
//! Portico owns the piece between your configuration code and the network
//! engine: it constructs an [`Application`](application::Application),
//! runs your declared modules against it in order, starts and stops the
//! engine in lockstep with application state, and (in development mode)
//! watches the filesystem and hot-reloads the application on the next
//! request after a batch of changes settles, without restarting the
//! process.
//!
//! ## Features
//!
//! - **Module loading**: ordered configuration callables with recursion
//!   detection and dynamic, registry-based resolution for hot swapping
//! - **Lifecycle events**: typed publish/subscribe with per-subscriber
//!   fault isolation, so an observer can never abort startup or shutdown
//! - **Lazy hot reload**: debounced filesystem watching, reload on access
//! - **Graceful shutdown**: grace period, hard timeout, idempotent stop,
//!   SIGINT/SIGTERM hook
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use portico::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> portico::Result<()> {
//!     let engine = Arc::new(AxumEngine::new(
//!         axum::Router::new(),
//!         vec![Connector::http("0.0.0.0", 8080)],
//!     ));
//!
//!     let controller = LifecycleController::builder()
//!         .engine(engine)
//!         .module("routes", |ctx: ModuleCtx| async move {
//!             ctx.application().attributes().insert("ready".to_string());
//!             Ok(())
//!         })
//!         .build()?;
//!
//!     // Blocks until the engine terminates; Ctrl+C triggers a graceful
//!     // stop through the registered shutdown hook.
//!     controller.start(true).await?;
//!     Ok(())
//! }
//! ```

pub mod application;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod module;
pub mod watch;

// Re-export core types
pub use application::{Application, Attributes, Environment};
pub use config::{ConfigService, HostConfig};
pub use engine::{AxumEngine, Connector, EngineAdapter};
pub use error::{HostError, Result};
pub use events::EventBus;
pub use lifecycle::{HostBuilder, LifecycleController, LifecycleError, shutdown_signal};
pub use module::{ModuleCtx, ModuleDescriptor, ModuleRegistry, ModuleSet};

// Re-export commonly used types from dependencies
pub use async_trait::async_trait;
pub use axum;

/// Prelude module for convenient imports
///
/// ```
/// use portico::prelude::*;
/// ```
pub mod prelude {
    pub use crate::application::{Application, Attributes, Environment};
    pub use crate::config::{ConfigService, HostConfig};
    pub use crate::engine::{AxumEngine, Connector, EngineAdapter};
    pub use crate::error::HostError;
    pub use crate::events::{
        ApplicationModulesLoaded, ApplicationStarted, ApplicationStarting, ApplicationStopped,
        ApplicationStopping, EventBus, Subscription,
    };
    pub use crate::lifecycle::{
        HostBuilder, LifecycleController, LifecycleError, shutdown_signal,
    };
    pub use crate::module::{ModuleCtx, ModuleDescriptor, ModuleRegistry, ModuleSet};
    pub use crate::watch::{ChangeOutcome, ChangeWatcher, WatchRegistration};
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}
