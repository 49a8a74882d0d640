//! Application lifecycle engine
//!
//! The [`LifecycleController`] is the heart of the host. It owns the
//! current application instance under a readers-writer lock and walks it
//! through the observable phase sequence:
//!
//! ```text
//! start:  ApplicationStarting
//!           ↓ modules run in declaration order (recursion-guarded,
//!             bounded by the startup timeout)
//!         ApplicationModulesLoaded   (development mode only)
//!         ApplicationStarted
//!           ↓ engine starts, connectors logged asynchronously
//! [running: requests resolve through current_application()]
//! stop:   ApplicationStopping
//!           ↓ task scope cancelled and joined (shutdown timeout)
//!         ApplicationStopped
//! ```
//!
//! In development mode the controller additionally watches the filesystem
//! and lazily rebuilds the application on the first access after a batch
//! of changes settles.

mod controller;
mod error;
mod shutdown;

pub use controller::{HostBuilder, LifecycleController};
pub use error::{LifecycleError, Result};
pub use shutdown::shutdown_signal;
