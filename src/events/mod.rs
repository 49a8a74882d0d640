//! Lifecycle event bus
//!
//! A process-wide typed publish/subscribe channel. Subscribers are plain
//! callbacks keyed by event type; every invocation runs inside its own
//! failure boundary so a panicking subscriber is logged and skipped,
//! never aborting the start or stop sequence that raised the event.

use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::application::Application;

type BoxedHandler = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

/// Raised before any module of a new application has run.
#[derive(Clone)]
pub struct ApplicationStarting(pub Arc<Application>);

/// Raised after every configured module has executed (development mode only).
#[derive(Clone)]
pub struct ApplicationModulesLoaded(pub Arc<Application>);

/// Raised once the application is fully constructed.
#[derive(Clone)]
pub struct ApplicationStarted(pub Arc<Application>);

/// Raised before an application is disposed.
#[derive(Clone)]
pub struct ApplicationStopping(pub Arc<Application>);

/// Raised after an application's task scope has been torn down.
#[derive(Clone)]
pub struct ApplicationStopped(pub Arc<Application>);

/// Handle returned by [`EventBus::subscribe`], usable to detach the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    type_id: TypeId,
    id: u64,
}

/// Typed in-memory event bus with per-subscriber fault isolation
#[derive(Clone, Default)]
pub struct EventBus {
    // Map of event type -> registered handlers, in subscription order
    handlers: Arc<DashMap<TypeId, Vec<(u64, BoxedHandler)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for events of type `E`.
    pub fn subscribe<E, F>(&self, handler: F) -> Subscription
    where
        E: Any + Send + Sync,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let boxed: BoxedHandler = Arc::new(move |event| {
            if let Some(event) = event.downcast_ref::<E>() {
                handler(event);
            }
        });
        self.handlers
            .entry(TypeId::of::<E>())
            .or_default()
            .push((id, boxed));
        Subscription {
            type_id: TypeId::of::<E>(),
            id,
        }
    }

    /// Detach a previously registered handler.
    pub fn unsubscribe(&self, subscription: Subscription) {
        if let Some(mut handlers) = self.handlers.get_mut(&subscription.type_id) {
            handlers.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Publish an event to every subscriber of its type.
    ///
    /// Each handler runs in its own failure boundary: a panic is caught,
    /// logged, and discarded, and the remaining handlers still run.
    pub fn publish<E: Any + Send + Sync>(&self, event: &E) {
        let handlers = match self.handlers.get(&TypeId::of::<E>()) {
            // Clone out so no shard lock is held while handlers run
            Some(handlers) => handlers.clone(),
            None => return,
        };
        for (_, handler) in handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                tracing::error!(
                    "event handler for {} panicked: {}",
                    std::any::type_name::<E>(),
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone)]
    struct Ping(u32);

    #[derive(Clone)]
    struct Pong;

    #[test]
    fn delivers_to_matching_type_only() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe::<Ping, _>(move |event| sink.lock().unwrap().push(event.0));
        bus.subscribe::<Pong, _>(|_| panic!("wrong channel"));

        bus.publish(&Ping(7));
        bus.publish(&Ping(8));
        assert_eq!(*seen.lock().unwrap(), vec![7, 8]);
    }

    #[test]
    fn panicking_handler_does_not_block_later_ones() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0u32));

        bus.subscribe::<Ping, _>(|_| panic!("always broken"));
        let sink = Arc::clone(&seen);
        bus.subscribe::<Ping, _>(move |_| *sink.lock().unwrap() += 1);

        bus.publish(&Ping(1));
        bus.publish(&Ping(2));
        assert_eq!(*seen.lock().unwrap(), 2);
    }

    #[test]
    fn unsubscribe_detaches_handler() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0u32));

        let sink = Arc::clone(&seen);
        let subscription = bus.subscribe::<Ping, _>(move |_| *sink.lock().unwrap() += 1);
        bus.publish(&Ping(1));
        bus.unsubscribe(subscription);
        bus.publish(&Ping(2));

        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
