//! Network engine seam
//!
//! The lifecycle controller drives the engine through the narrow
//! [`EngineAdapter`] contract and never inspects engine internals.
//! [`AxumEngine`] is the bundled glue: it binds a TCP listener per
//! configured connector and serves an axum router with graceful shutdown.

use async_trait::async_trait;
use axum::Router;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::Result;

/// A configured network listening endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connector {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Connector {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new("http", host, port)
    }

    /// Host as rendered in log lines: the wildcard addresses `0.0.0.0`
    /// and `::` read as `localhost`. Binding is unaffected.
    pub fn display_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "::" => "localhost",
            other => other,
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.display_host(), self.port)
    }
}

/// Start/stop contract of the underlying network engine
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Start the engine. With `wait` set, returns only once the engine
    /// has terminated; otherwise the engine keeps running in the
    /// background.
    async fn start(&self, wait: bool) -> Result<()>;

    /// Stop the engine: in-flight requests get `grace_period` to finish,
    /// then remaining work is abandoned after `timeout`. Must tolerate
    /// being called on an already-stopped engine.
    async fn stop(&self, grace_period: Duration, timeout: Duration) -> Result<()>;

    /// The connectors actually bound, empty until the engine has started.
    fn resolved_connectors(&self) -> Vec<Connector>;
}

/// Axum/tokio implementation of [`EngineAdapter`]
pub struct AxumEngine {
    router: Router,
    connectors: Vec<Connector>,
    bound: Mutex<Vec<Connector>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl AxumEngine {
    pub fn new(router: Router, connectors: Vec<Connector>) -> Self {
        Self {
            router,
            connectors,
            bound: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EngineAdapter for AxumEngine {
    async fn start(&self, wait: bool) -> Result<()> {
        // Bind every listener before serving anything: a refused bind
        // must leave no connector live or reported.
        let mut bindings = Vec::with_capacity(self.connectors.len());
        for connector in &self.connectors {
            let listener = TcpListener::bind((connector.host.as_str(), connector.port)).await?;
            let port = listener.local_addr()?.port();
            bindings.push((
                Connector::new(connector.scheme.clone(), connector.host.clone(), port),
                listener,
            ));
        }

        for (connector, listener) in bindings {
            Self::lock(&self.bound).push(connector);
            let router = self.router.clone();
            let token = self.shutdown.clone();
            let handle = self.tasks.spawn(async move {
                let serve = axum::serve(listener, router)
                    .with_graceful_shutdown(async move { token.cancelled().await });
                if let Err(error) = serve.await {
                    tracing::error!("engine serve error: {}", error);
                }
            });
            Self::lock(&self.handles).push(handle);
        }

        if wait {
            self.tasks.close();
            self.tasks.wait().await;
        }
        Ok(())
    }

    async fn stop(&self, grace_period: Duration, timeout: Duration) -> Result<()> {
        self.shutdown.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace_period, self.tasks.wait())
            .await
            .is_ok()
        {
            return Ok(());
        }

        // Grace period exhausted: force-kill whatever is still serving.
        tracing::warn!(
            "connections still open after {:?}, aborting remaining serve tasks",
            grace_period
        );
        let handles: Vec<_> = Self::lock(&self.handles).drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        if tokio::time::timeout(timeout, self.tasks.wait())
            .await
            .is_err()
        {
            tracing::error!("engine did not stop within {:?} after abort", timeout);
        }
        Ok(())
    }

    fn resolved_connectors(&self) -> Vec<Connector> {
        Self::lock(&self.bound).clone()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_hosts_render_as_localhost() {
        assert_eq!(Connector::http("0.0.0.0", 8080).to_string(), "http://localhost:8080");
        assert_eq!(Connector::new("https", "::", 8443).to_string(), "https://localhost:8443");
        assert_eq!(
            Connector::http("example.test", 80).to_string(),
            "http://example.test:80"
        );
    }

    #[tokio::test]
    async fn axum_engine_binds_and_stops() {
        let engine = AxumEngine::new(Router::new(), vec![Connector::http("127.0.0.1", 0)]);
        engine.start(false).await.unwrap();

        let bound = engine.resolved_connectors();
        assert_eq!(bound.len(), 1);
        assert_ne!(bound[0].port, 0);

        engine
            .stop(Duration::from_millis(10), Duration::from_millis(100))
            .await
            .unwrap();
        // A second stop on an already-stopped engine is a no-op.
        engine
            .stop(Duration::from_millis(10), Duration::from_millis(100))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_bind_leaves_no_connectors() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let engine = AxumEngine::new(
            Router::new(),
            vec![
                Connector::http("127.0.0.1", 0),
                Connector::http("127.0.0.1", port),
            ],
        );

        assert!(engine.start(false).await.is_err());
        assert!(engine.resolved_connectors().is_empty());
    }

    #[tokio::test]
    async fn stop_aborts_connections_that_outlive_grace_period() {
        use axum::routing::get;
        use tokio::io::AsyncWriteExt;

        let router = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                "late"
            }),
        );
        let engine = AxumEngine::new(router, vec![Connector::http("127.0.0.1", 0)]);
        engine.start(false).await.unwrap();
        let port = engine.resolved_connectors()[0].port;

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET /slow HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        // Let the request reach the handler before stopping.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let begun = std::time::Instant::now();
        engine
            .stop(Duration::from_millis(50), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(begun.elapsed() < Duration::from_secs(5));
    }
}
