//! Application instance
//!
//! An [`Application`] is one running configuration of the host: the
//! environment it was built from, a typed attribute map that modules fill
//! in during startup, and a cancellable task scope that bounds every
//! background task the application spawns. Exactly one application is
//! current per lifecycle controller; reload disposes the old instance and
//! installs a freshly constructed one.

use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ConfigService;
use crate::engine::EngineAdapter;
use crate::events::EventBus;
use crate::lifecycle::{LifecycleError, Result};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Immutable surroundings an application is constructed from
pub struct Environment {
    config: ConfigService,
    development: bool,
    root_path: PathBuf,
}

impl Environment {
    pub fn new(config: ConfigService, development: bool, root_path: impl Into<PathBuf>) -> Self {
        Self {
            config,
            development,
            root_path: root_path.into(),
        }
    }

    pub fn config(&self) -> &ConfigService {
        &self.config
    }

    pub fn is_development(&self) -> bool {
        self.development
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }
}

/// Typed attribute map keyed by value type
///
/// Modules use this to hand state (connection pools, routers, caches) to
/// whatever serves requests later. One value per type.
#[derive(Default)]
pub struct Attributes {
    entries: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Attributes {
    pub fn insert<T: Send + Sync + 'static>(&self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let entry = self.entries.get(&TypeId::of::<T>())?;
        entry.clone().downcast::<T>().ok()
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }
}

/// One running configuration of the host
pub struct Application {
    id: u64,
    environment: Arc<Environment>,
    attributes: Attributes,
    events: EventBus,
    engine: Arc<dyn EngineAdapter>,
    cancellation: CancellationToken,
    tasks: TaskTracker,
}

impl Application {
    pub(crate) fn new(
        environment: Arc<Environment>,
        events: EventBus,
        engine: Arc<dyn EngineAdapter>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            environment,
            attributes: Attributes::default(),
            events,
            engine,
            cancellation: parent.child_token(),
            tasks: TaskTracker::new(),
        }
    }

    /// Monotonically increasing identity of this instance. A reload always
    /// produces an application with a different id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The network engine this application is served by.
    pub fn engine(&self) -> &Arc<dyn EngineAdapter> {
        &self.engine
    }

    /// Cancelled when the application is disposed (or the parent scope is).
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Spawn a task tied to this application's scope. Disposal cancels the
    /// scope token and joins all spawned tasks.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(future)
    }

    /// Cancel the task scope and await completion, bounded by `timeout`.
    pub(crate) async fn dispose(&self, timeout: Duration) -> Result<()> {
        self.cancellation.cancel();
        self.tasks.close();
        tokio::time::timeout(timeout, self.tasks.wait())
            .await
            .map_err(|_| LifecycleError::shutdown_timeout("application task scope", timeout))
    }
}
