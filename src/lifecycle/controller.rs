//! Lifecycle controller
//!
//! Owns the current [`Application`] instance and orchestrates the whole
//! engine lifecycle: construction and module loading on `start`, the
//! event-sequenced teardown on `stop`, and (in development mode) lazy
//! hot reload driven by the filesystem watcher.
//!
//! A single readers-writer lock over the current-application slot is the
//! sole synchronization primitive. Request paths resolve the application
//! under the read half; create, destroy, and reload all take the write
//! half. A reader that detects pending changes releases the read lock and
//! reacquires the write lock, so a racing reader may reload first; the
//! loser's redundant reload is wasted work, never an inconsistency.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::error::{LifecycleError, Result};
use super::shutdown::shutdown_signal;
use crate::application::{Application, Environment};
use crate::config::{ConfigService, HostConfig};
use crate::engine::EngineAdapter;
use crate::events::{
    ApplicationModulesLoaded, ApplicationStarted, ApplicationStarting, ApplicationStopped,
    ApplicationStopping, EventBus,
};
use crate::module::{ModuleCtx, ModuleDescriptor, ModuleLoader, ModuleRegistry, ModuleSet};
use crate::watch::{ChangeOutcome, ChangeWatcher};

/// Grace period handed to the engine by the process shutdown hook.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(500);
/// Hard engine-stop timeout used by the process shutdown hook.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll interval while waiting for the engine to report bound connectors.
const CONNECTOR_POLL_INTERVAL: Duration = Duration::from_millis(50);

enum Slot {
    Uninitialized,
    Running(Arc<Application>),
    Stopped,
}

impl Slot {
    fn reject(&self) -> Option<&'static str> {
        match self {
            Slot::Uninitialized => Some("not running"),
            Slot::Running(_) => None,
            Slot::Stopped => Some("stopped"),
        }
    }
}

struct ControllerInner {
    environment: Arc<Environment>,
    engine: Arc<dyn EngineAdapter>,
    events: EventBus,
    modules: ModuleSet,
    loader: Arc<ModuleLoader>,
    config: HostConfig,
    slot: RwLock<Slot>,
    watcher: StdMutex<Option<Arc<ChangeWatcher>>>,
    cancellation: CancellationToken,
    hook_installed: AtomicBool,
}

/// Orchestrates application construction, engine start/stop, and reload
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<ControllerInner>,
}

impl LifecycleController {
    /// Start building a controller.
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.inner.environment
    }

    /// Swap the registered factory for a named module on a running
    /// controller. The next load pass (reload in development mode)
    /// resolves the replacement.
    pub fn replace_module<F, Fut>(&self, name: impl Into<String>, module: F)
    where
        F: Fn(ModuleCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner.loader.registry().register(name, module);
    }

    /// Build and install the first application, register the process
    /// shutdown hook, then delegate to the engine.
    ///
    /// A module failure during construction propagates, leaves no
    /// application installed, and never starts the engine. An engine
    /// failure tears the installed application back down, so a retry
    /// starts from a clean slate. With `wait` set, blocks until the
    /// engine terminates.
    pub async fn start(&self, wait: bool) -> crate::error::Result<()> {
        {
            let mut slot = self.inner.slot.write().await;
            match &*slot {
                Slot::Uninitialized => {}
                Slot::Running(_) => {
                    return Err(LifecycleError::invalid_state("already running").into());
                }
                Slot::Stopped => {
                    return Err(LifecycleError::invalid_state("stopped").into());
                }
            }
            let application = self.create_application().await?;
            self.spawn_shutdown_hook();
            *slot = Slot::Running(application);
        }
        self.log_connectors();
        if let Err(error) = self.inner.engine.start(wait).await {
            self.rollback_failed_start().await;
            return Err(error);
        }
        Ok(())
    }

    /// Stop the engine, destroy the current application, and release the
    /// filesystem watcher. Never propagates failures and is idempotent:
    /// a second call observes no current application and raises no
    /// further lifecycle events.
    pub async fn stop(&self, grace_period: Duration, timeout: Duration) {
        if let Err(error) = self.inner.engine.stop(grace_period, timeout).await {
            tracing::error!("engine stop failed: {}", error);
        }
        let previous = {
            let mut slot = self.inner.slot.write().await;
            match std::mem::replace(&mut *slot, Slot::Stopped) {
                Slot::Running(application) => Some(application),
                _ => None,
            }
        };
        if let Some(application) = previous {
            self.destroy_application(application).await;
        }
        self.clear_watcher();
    }

    /// Destroy the current application and install a freshly constructed
    /// one. Available only in development mode; triggerable externally,
    /// independent of the watch loop.
    ///
    /// On failure the previous application stays torn down and the
    /// controller requires an explicit retry.
    pub async fn reload(&self) -> Result<Arc<Application>> {
        if !self.inner.config.development {
            return Err(LifecycleError::invalid_state(
                "not in development mode; reload is unavailable",
            ));
        }
        let mut slot = self.inner.slot.write().await;
        if matches!(&*slot, Slot::Stopped) {
            return Err(LifecycleError::invalid_state("stopped"));
        }
        self.reload_locked(&mut slot).await
    }

    /// The accessor every inbound request resolves through.
    ///
    /// Production (or no pending changes): returns the installed instance
    /// under the read lock. Development mode with accumulated filesystem
    /// changes: escalates to the write lock and performs a destroy+create
    /// cycle first, so reload happens lazily on the next access after
    /// changes settle.
    pub async fn current_application(&self) -> Result<Arc<Application>> {
        {
            let slot = self.inner.slot.read().await;
            let application = match &*slot {
                Slot::Running(application) => Arc::clone(application),
                other => {
                    return Err(LifecycleError::invalid_state(
                        other.reject().unwrap_or("unknown"),
                    ));
                }
            };
            if !self.inner.config.development {
                return Ok(application);
            }
            let Some(watcher) = self.current_watcher() else {
                return Ok(application);
            };
            // The debounce check sleeps, so it runs on the blocking pool.
            // A panicked check fails open.
            let changed = tokio::task::spawn_blocking(move || watcher.poll_changes())
                .await
                .unwrap_or(ChangeOutcome::NoChanges);
            match changed {
                ChangeOutcome::NoChanges => return Ok(application),
                ChangeOutcome::Changed(batch) => {
                    tracing::debug!(
                        "{} changed file event(s) detected, reloading application",
                        batch.len()
                    );
                }
            }
        }

        // No lock upgrade: reacquire exclusively. Another task may have
        // reloaded in the gap; reloading again is redundant but safe.
        let mut slot = self.inner.slot.write().await;
        if let Some(state) = slot.reject() {
            return Err(LifecycleError::invalid_state(state));
        }
        self.reload_locked(&mut slot).await
    }

    /// Uninstall and tear down the application after the engine refused
    /// to start, leaving the controller restartable.
    async fn rollback_failed_start(&self) {
        let previous = {
            let mut slot = self.inner.slot.write().await;
            if matches!(&*slot, Slot::Running(_)) {
                match std::mem::replace(&mut *slot, Slot::Uninitialized) {
                    Slot::Running(application) => Some(application),
                    _ => None,
                }
            } else {
                None
            }
        };
        if let Some(application) = previous {
            self.destroy_application(application).await;
        }
    }

    async fn reload_locked(&self, slot: &mut Slot) -> Result<Arc<Application>> {
        if let Slot::Running(previous) = std::mem::replace(slot, Slot::Uninitialized) {
            self.destroy_application(previous).await;
        }
        let application = self.create_application().await?;
        *slot = Slot::Running(Arc::clone(&application));
        Ok(application)
    }

    /// Construct a new application: raise `ApplicationStarting`, run all
    /// modules bounded by the startup timeout, raise the phase events,
    /// and rebuild the watch set. A failure schedules asynchronous
    /// teardown of the partial instance and propagates.
    async fn create_application(&self) -> Result<Arc<Application>> {
        let application = Arc::new(Application::new(
            Arc::clone(&self.inner.environment),
            self.inner.events.clone(),
            Arc::clone(&self.inner.engine),
            &self.inner.cancellation,
        ));
        self.inner
            .events
            .publish(&ApplicationStarting(Arc::clone(&application)));

        let loading = ModuleLoader::load_all(&self.inner.loader, &application, &self.inner.modules);
        let outcome = tokio::time::timeout(self.inner.config.startup_timeout, loading).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error),
            Err(_) => Some(LifecycleError::StartupTimeout {
                timeout: self.inner.config.startup_timeout,
            }),
        };
        if let Some(error) = failure {
            tracing::error!("application startup failed: {}", error);
            self.teardown_async(application);
            return Err(error);
        }

        if self.inner.config.development {
            self.inner
                .events
                .publish(&ApplicationModulesLoaded(Arc::clone(&application)));
        }
        self.inner
            .events
            .publish(&ApplicationStarted(Arc::clone(&application)));

        if self.inner.config.development {
            self.rebuild_watcher();
        }
        Ok(application)
    }

    /// Shutdown sequencing: `ApplicationStopping`, dispose bounded by the
    /// shutdown timeout, `ApplicationStopped`, then clear the watch set.
    async fn destroy_application(&self, application: Arc<Application>) {
        self.inner
            .events
            .publish(&ApplicationStopping(Arc::clone(&application)));
        if let Err(error) = application
            .dispose(self.inner.config.shutdown_timeout)
            .await
        {
            tracing::error!("application teardown failed: {}", error);
        }
        self.inner.events.publish(&ApplicationStopped(application));
        self.clear_watcher();
    }

    /// Dispose a partially started application without blocking the
    /// caller that is already propagating the startup failure.
    fn teardown_async(&self, application: Arc<Application>) {
        let timeout = self.inner.config.shutdown_timeout;
        tokio::spawn(async move {
            if let Err(error) = application.dispose(timeout).await {
                tracing::error!("teardown of failed application: {}", error);
            }
        });
    }

    fn rebuild_watcher(&self) {
        let roots = vec![self.inner.environment.root_path().to_path_buf()];
        let replacement = match ChangeWatcher::new(&roots, &self.inner.config.watch_paths) {
            Ok(watcher) => Some(Arc::new(watcher)),
            Err(error) => {
                // Hot reload degrades to manual; the application still runs.
                tracing::error!("failed to register filesystem watcher: {}", error);
                None
            }
        };
        *self.watcher_slot() = replacement;
    }

    fn clear_watcher(&self) {
        self.watcher_slot().take();
    }

    fn current_watcher(&self) -> Option<Arc<ChangeWatcher>> {
        self.watcher_slot().clone()
    }

    fn watcher_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<ChangeWatcher>>> {
        self.inner
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Invoke `stop` when the process receives SIGINT/SIGTERM. Idempotent
    /// with an explicit `stop` call; installed once per controller, only
    /// after an application has come up.
    fn spawn_shutdown_hook(&self) {
        if self.inner.hook_installed.swap(true, Ordering::SeqCst) {
            return;
        }
        let controller = self.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            controller
                .stop(DEFAULT_GRACE_PERIOD, DEFAULT_STOP_TIMEOUT)
                .await;
        });
    }

    /// Log one `Responding at scheme://host:port` line per connector,
    /// without blocking the caller: connectors resolve only once the
    /// engine has bound its listeners.
    fn log_connectors(&self) {
        let engine = Arc::clone(&self.inner.engine);
        let deadline = self.inner.config.startup_timeout;
        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                let connectors = engine.resolved_connectors();
                if !connectors.is_empty() {
                    for connector in connectors {
                        tracing::info!("Responding at {}", connector);
                    }
                    return;
                }
                if started.elapsed() > deadline {
                    return;
                }
                tokio::time::sleep(CONNECTOR_POLL_INTERVAL).await;
            }
        });
    }
}

/// Fluent builder for a [`LifecycleController`]
///
/// Settings start from the process environment and explicit calls win.
pub struct HostBuilder {
    config_service: ConfigService,
    config: HostConfig,
    engine: Option<Arc<dyn EngineAdapter>>,
    modules: ModuleSet,
    registry: ModuleRegistry,
    events: EventBus,
    root_path: PathBuf,
    parent: CancellationToken,
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBuilder {
    /// A builder seeded from the process environment.
    pub fn new() -> Self {
        Self::with_config_service(ConfigService::new())
    }

    /// A builder seeded from an explicit configuration store.
    pub fn with_config_service(config_service: ConfigService) -> Self {
        let config = HostConfig::from_config(&config_service);
        Self {
            config_service,
            config,
            engine: None,
            modules: ModuleSet::default(),
            registry: ModuleRegistry::default(),
            events: EventBus::new(),
            root_path: PathBuf::from("."),
            parent: CancellationToken::new(),
        }
    }

    pub fn engine(mut self, engine: Arc<dyn EngineAdapter>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn development(mut self, development: bool) -> Self {
        self.config.development = development;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.config.startup_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Add a watch pattern on top of any configured via the environment.
    pub fn watch_path(mut self, pattern: impl Into<String>) -> Self {
        self.config.watch_paths.push(pattern.into());
        self
    }

    /// Filesystem root the watch patterns are resolved against.
    pub fn root_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_path = path.into();
        self
    }

    /// Cancellation scope every application instance is parented to.
    pub fn parent_scope(mut self, token: CancellationToken) -> Self {
        self.parent = token;
        self
    }

    /// The event bus lifecycle events are published on. Subscribe here
    /// before `build` to observe the first start.
    pub fn event_bus(&self) -> EventBus {
        self.events.clone()
    }

    /// Declare a named module. The name is also registered as a
    /// rebuildable factory so development-mode loads resolve it
    /// dynamically; [`replace_module`](Self::replace_module) can swap the
    /// factory between reloads.
    pub fn module<F, Fut>(mut self, name: impl Into<String>, module: F) -> Self
    where
        F: Fn(ModuleCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let descriptor = ModuleDescriptor::new(name, module);
        if let Some(name) = descriptor.name() {
            self.registry.insert_fn(name, descriptor.fallback_fn());
        }
        self.modules.push(descriptor);
        self
    }

    /// Declare a module with no symbolic name: dynamic resolution is
    /// skipped and the captured callable always runs directly.
    pub fn anonymous_module<F, Fut>(mut self, module: F) -> Self
    where
        F: Fn(ModuleCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.modules.push(ModuleDescriptor::anonymous(module));
        self
    }

    /// Replace the registered factory for a named module. The next load
    /// pass (reload in development mode) picks up the replacement.
    pub fn replace_module<F, Fut>(self, name: impl Into<String>, module: F) -> Self
    where
        F: Fn(ModuleCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.registry.register(name, module);
        self
    }

    pub fn build(self) -> Result<LifecycleController> {
        let engine = self
            .engine
            .ok_or_else(|| LifecycleError::invalid_state("no engine configured"))?;
        let environment = Arc::new(Environment::new(
            self.config_service,
            self.config.development,
            self.root_path,
        ));
        let loader = Arc::new(ModuleLoader::new(self.registry, self.config.development));
        Ok(LifecycleController {
            inner: Arc::new(ControllerInner {
                environment,
                engine,
                events: self.events,
                modules: self.modules,
                loader,
                config: self.config,
                slot: RwLock::new(Slot::Uninitialized),
                watcher: StdMutex::new(None),
                cancellation: self.parent,
                hook_installed: AtomicBool::new(false),
            }),
        })
    }
}
