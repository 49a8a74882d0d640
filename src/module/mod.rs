//! Application modules
//!
//! A module is one unit of configuration applied to a starting
//! [`Application`](crate::application::Application). Modules are declared on
//! the builder in order and executed in that order on every start and
//! reload. A named module can additionally be resolved dynamically through
//! the [`ModuleRegistry`], which is what lets development mode swap a
//! module's implementation between reloads; when resolution misses, the
//! originally captured callable is invoked instead.
//!
//! The loader threads an explicit [`LoadGuard`] of in-progress module names
//! through every (possibly re-entrant) invocation, so a module whose own
//! startup code triggers the loader again for the same name fails fast
//! instead of recursing.

use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::application::Application;
use crate::lifecycle::{LifecycleError, Result};

/// Type-erased module callable
pub type ModuleFn = Arc<dyn Fn(ModuleCtx) -> BoxFuture<'static, Result<()>> + Send + Sync>;

const ANONYMOUS: &str = "<anonymous>";

/// A named, invokable unit of application configuration
#[derive(Clone)]
pub struct ModuleDescriptor {
    name: Option<String>,
    fallback: ModuleFn,
}

impl ModuleDescriptor {
    /// A module with a stable symbolic name, eligible for dynamic
    /// resolution through the registry in development mode.
    pub fn new<F, Fut>(name: impl Into<String>, module: F) -> Self
    where
        F: Fn(ModuleCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: Some(name.into()),
            fallback: boxed(module),
        }
    }

    /// A module without a symbolic name. Dynamic resolution is skipped and
    /// the captured callable is always invoked directly.
    pub fn anonymous<F, Fut>(module: F) -> Self
    where
        F: Fn(ModuleCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: None,
            fallback: boxed(module),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn fallback_fn(&self) -> ModuleFn {
        Arc::clone(&self.fallback)
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(ANONYMOUS)
    }
}

fn boxed<F, Fut>(module: F) -> ModuleFn
where
    F: Fn(ModuleCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(module(ctx)))
}

/// Ordered collection of module descriptors
#[derive(Clone, Default)]
pub struct ModuleSet {
    entries: Vec<ModuleDescriptor>,
}

impl ModuleSet {
    pub fn push(&mut self, descriptor: ModuleDescriptor) {
        self.entries.push(descriptor);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Registry of rebuildable module factories, keyed by stable name
///
/// Populated at configuration time; consulted by the loader in development
/// mode so a reload picks up a replaced factory without touching the
/// declared module list.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: Arc<DashMap<String, ModuleFn>>,
}

impl ModuleRegistry {
    pub fn register<F, Fut>(&self, name: impl Into<String>, module: F)
    where
        F: Fn(ModuleCtx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.factories.insert(name.into(), boxed(module));
    }

    pub(crate) fn insert_fn(&self, name: &str, module: ModuleFn) {
        self.factories.insert(name.to_string(), module);
    }

    pub fn resolve(&self, name: &str) -> Option<ModuleFn> {
        self.factories.get(name).map(|entry| entry.clone())
    }
}

/// Set of module names currently in progress within one load pass
///
/// Scoped to the outermost load invocation and shared by reference with
/// every nested one; cleared per module regardless of success.
#[derive(Clone, Default)]
pub struct LoadGuard {
    in_progress: Arc<Mutex<HashSet<String>>>,
}

impl LoadGuard {
    fn enter(&self, name: &str) -> Result<()> {
        let mut in_progress = lock(&self.in_progress);
        if !in_progress.insert(name.to_string()) {
            return Err(LifecycleError::recursion(name));
        }
        Ok(())
    }

    fn exit(&self, name: &str) {
        lock(&self.in_progress).remove(name);
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-invocation context handed to every running module
///
/// Carries the target application plus the loader and guard, so a module
/// that needs to pull in another module re-enters the loader under the
/// same in-progress set instead of ambient state.
#[derive(Clone)]
pub struct ModuleCtx {
    application: Arc<Application>,
    loader: Arc<ModuleLoader>,
    guard: LoadGuard,
}

impl ModuleCtx {
    pub fn application(&self) -> &Arc<Application> {
        &self.application
    }

    /// Load another module from inside a running one.
    pub async fn load(&self, descriptor: &ModuleDescriptor) -> Result<()> {
        ModuleLoader::load_one(&self.loader, &self.application, descriptor, &self.guard).await
    }
}

/// Executes module descriptors against a target application
pub struct ModuleLoader {
    registry: ModuleRegistry,
    development: bool,
}

impl ModuleLoader {
    pub fn new(registry: ModuleRegistry, development: bool) -> Self {
        Self {
            registry,
            development,
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Run every descriptor in declaration order against `application`.
    ///
    /// The first failure aborts the pass and propagates unwrapped to the
    /// caller.
    pub async fn load_all(
        loader: &Arc<Self>,
        application: &Arc<Application>,
        modules: &ModuleSet,
    ) -> Result<()> {
        let guard = LoadGuard::default();
        for descriptor in modules.iter() {
            Self::load_one(loader, application, descriptor, &guard).await?;
        }
        Ok(())
    }

    pub(crate) async fn load_one(
        loader: &Arc<Self>,
        application: &Arc<Application>,
        descriptor: &ModuleDescriptor,
        guard: &LoadGuard,
    ) -> Result<()> {
        if let Some(name) = descriptor.name() {
            guard.enter(name)?;
        }
        tracing::debug!("loading module: {}", descriptor.label());

        let ctx = ModuleCtx {
            application: Arc::clone(application),
            loader: Arc::clone(loader),
            guard: guard.clone(),
        };
        let callable = loader.resolve(descriptor);
        let outcome = callable(ctx).await;

        if let Some(name) = descriptor.name() {
            guard.exit(name);
        }
        if let Err(error) = &outcome {
            tracing::error!("module {} failed: {}", descriptor.label(), error);
        }
        outcome
    }

    /// In development mode a named module is resolved through the registry
    /// first; a miss falls back to the captured callable.
    fn resolve(&self, descriptor: &ModuleDescriptor) -> ModuleFn {
        if self.development
            && let Some(name) = descriptor.name()
        {
            if let Some(factory) = self.registry.resolve(name) {
                return factory;
            }
            tracing::debug!(
                "module {} not present in registry, falling back to captured callable",
                name
            );
        }
        Arc::clone(&descriptor.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::Environment;
    use crate::config::ConfigService;
    use crate::engine::test_support::RecordingEngine;
    use crate::events::EventBus;
    use tokio_util::sync::CancellationToken;

    fn test_application() -> Arc<Application> {
        let environment = Arc::new(Environment::new(ConfigService::empty(), true, "."));
        Arc::new(Application::new(
            environment,
            EventBus::new(),
            Arc::new(RecordingEngine::new()),
            &CancellationToken::new(),
        ))
    }

    fn recording_module(
        name: &str,
        log: Arc<Mutex<Vec<String>>>,
    ) -> ModuleDescriptor {
        let label = name.to_string();
        ModuleDescriptor::new(name, move |_ctx| {
            let log = Arc::clone(&log);
            let label = label.clone();
            async move {
                lock(&log).push(label);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn modules_run_in_declaration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut modules = ModuleSet::default();
        modules.push(recording_module("first", Arc::clone(&log)));
        modules.push(recording_module("second", Arc::clone(&log)));
        modules.push(recording_module("third", Arc::clone(&log)));

        let loader = Arc::new(ModuleLoader::new(ModuleRegistry::default(), false));
        ModuleLoader::load_all(&loader, &test_application(), &modules)
            .await
            .unwrap();

        assert_eq!(*lock(&log), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn self_recursion_fails_fast() {
        let descriptor = ModuleDescriptor::new("looper", |ctx: ModuleCtx| async move {
            let again = ModuleDescriptor::new("looper", |_ctx| async { Ok(()) });
            ctx.load(&again).await
        });

        let mut modules = ModuleSet::default();
        modules.push(descriptor);

        let loader = Arc::new(ModuleLoader::new(ModuleRegistry::default(), false));
        let application = test_application();
        let outcome = ModuleLoader::load_all(&loader, &application, &modules).await;
        match outcome {
            Err(LifecycleError::ModuleRecursion { name }) => assert_eq!(name, "looper"),
            other => panic!("expected recursion error, got {other:?}"),
        }

        // Guard state must not leak into later passes.
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut next = ModuleSet::default();
        next.push(recording_module("looper", Arc::clone(&log)));
        ModuleLoader::load_all(&loader, &application, &next)
            .await
            .unwrap();
        assert_eq!(*lock(&log), vec!["looper"]);
    }

    #[tokio::test]
    async fn nested_load_of_distinct_module_is_allowed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_log = Arc::clone(&log);
        let outer = ModuleDescriptor::new("outer", move |ctx: ModuleCtx| {
            let inner = recording_module("inner", Arc::clone(&inner_log));
            async move { ctx.load(&inner).await }
        });

        let mut modules = ModuleSet::default();
        modules.push(outer);

        let loader = Arc::new(ModuleLoader::new(ModuleRegistry::default(), false));
        ModuleLoader::load_all(&loader, &test_application(), &modules)
            .await
            .unwrap();
        assert_eq!(*lock(&log), vec!["inner"]);
    }

    #[tokio::test]
    async fn development_mode_prefers_registry_factory() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut modules = ModuleSet::default();
        modules.push(recording_module("db", Arc::clone(&log)));

        let registry = ModuleRegistry::default();
        let sink = Arc::clone(&log);
        registry.register("db", move |_ctx| {
            let sink = Arc::clone(&sink);
            async move {
                lock(&sink).push("db (registry)".to_string());
                Ok(())
            }
        });

        let loader = Arc::new(ModuleLoader::new(registry, true));
        ModuleLoader::load_all(&loader, &test_application(), &modules)
            .await
            .unwrap();
        assert_eq!(*lock(&log), vec!["db (registry)"]);
    }

    #[tokio::test]
    async fn registry_miss_falls_back_to_captured_callable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut modules = ModuleSet::default();
        modules.push(recording_module("db", Arc::clone(&log)));

        let loader = Arc::new(ModuleLoader::new(ModuleRegistry::default(), true));
        ModuleLoader::load_all(&loader, &test_application(), &modules)
            .await
            .unwrap();
        assert_eq!(*lock(&log), vec!["db"]);
    }

    #[tokio::test]
    async fn anonymous_module_always_invokes_callable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let mut modules = ModuleSet::default();
        modules.push(ModuleDescriptor::anonymous(move |_ctx| {
            let sink = Arc::clone(&sink);
            async move {
                lock(&sink).push("anon".to_string());
                Ok(())
            }
        }));

        let loader = Arc::new(ModuleLoader::new(ModuleRegistry::default(), true));
        ModuleLoader::load_all(&loader, &test_application(), &modules)
            .await
            .unwrap();
        assert_eq!(*lock(&log), vec!["anon"]);
    }

    #[tokio::test]
    async fn failure_propagates_unwrapped() {
        let mut modules = ModuleSet::default();
        modules.push(ModuleDescriptor::new("broken", |_ctx| async {
            Err(LifecycleError::startup_failed("broken", "no database"))
        }));

        let loader = Arc::new(ModuleLoader::new(ModuleRegistry::default(), false));
        let outcome = ModuleLoader::load_all(&loader, &test_application(), &modules).await;
        match outcome {
            Err(LifecycleError::StartupFailed { module, message }) => {
                assert_eq!(module, "broken");
                assert_eq!(message, "no database");
            }
            other => panic!("expected startup failure, got {other:?}"),
        }
    }
}
