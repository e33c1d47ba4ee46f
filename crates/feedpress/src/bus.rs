//! In-process event bus with per-handler isolation.
//!
//! # Guarantees
//!
//! - **Fan-out**: every handler subscribed to the event's type receives it
//! - **Isolation**: a handler error, panic or timeout is logged and reported,
//!   never propagated to the publisher or to sibling handlers
//! - **In-memory only**: no persistence, no replay. Durable workflow state
//!   lives in entity status fields
//!
//! `publish` awaits all handlers of one event concurrently. `publish_many`
//! publishes its events one after another.
//!
//! The bus is process-wide state with an explicit lifecycle: build one at
//! startup, share it by cloning, and [`clear`](EventBus::clear) it in tests.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::panic_message;

// =============================================================================
// Event
// =============================================================================

/// A fact that happened. Routed by its stable [`TYPE`](Event::TYPE) name.
pub trait Event: Send + Sync + 'static {
    const TYPE: &'static str;
}

/// Delivery metadata shared by every handler of one publish.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub event_type: &'static str,
    pub occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    fn new(event_type: &'static str) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type,
            occurred_at: Utc::now(),
        }
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Reacts to one event type.
///
/// Errors are logged and reported in the [`PublishReport`]; they do not
/// affect the publisher.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    /// Name used in logs and failure reports.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, event: &E, envelope: &EventEnvelope) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Payload = Arc<dyn Any + Send + Sync>;
type ErasedHandler = Arc<dyn Fn(Payload, EventEnvelope) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    name: &'static str,
    run: ErasedHandler,
}

// =============================================================================
// Report
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Error,
    Panic,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerFailure {
    pub subscription: u64,
    pub handler: &'static str,
    pub kind: FailureKind,
    pub message: String,
}

/// What happened to one published event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishReport {
    pub event_id: Uuid,
    pub event_type: &'static str,
    /// Handlers invoked, including failed ones.
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.delivered - self.failures.len()
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Typed publish/subscribe bus. Cheap to clone; clones share subscriptions.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: RwLock<HashMap<&'static str, Vec<Subscriber>>>,
    next_id: AtomicU64,
    handler_timeout: Option<Duration>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus whose handlers fail with [`FailureKind::Timeout`] after `timeout`.
    pub fn with_handler_timeout(timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                handler_timeout: timeout,
                ..Inner::default()
            }),
        }
    }

    /// Subscribe `handler` to events of type `E`.
    ///
    /// Handlers of one type are invoked in subscription order.
    pub fn subscribe<E, H>(&self, handler: H) -> SubscriptionId
    where
        E: Event,
        H: EventHandler<E>,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let name = handler.name();
        let handler = Arc::new(handler);

        let run: ErasedHandler = Arc::new(move |payload: Payload, envelope: EventEnvelope| {
            let handler = handler.clone();
            async move {
                let event = payload
                    .downcast::<E>()
                    .map_err(|_| anyhow!("payload is not a {} event", E::TYPE))?;
                handler.handle(&event, &envelope).await
            }
            .boxed()
        });

        self.write()
            .entry(E::TYPE)
            .or_default()
            .push(Subscriber { id, name, run });
        debug!(event_type = E::TYPE, handler = name, subscription = %id, "handler subscribed");
        id
    }

    /// Remove one subscription. Returns false if it was not found.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.write();
        for list in subscribers.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn subscriber_count<E: Event>(&self) -> usize {
        self.read().get(E::TYPE).map_or(0, Vec::len)
    }

    /// Deliver `event` to every handler of its type and wait for all of them.
    pub async fn publish<E: Event>(&self, event: E) -> PublishReport {
        let envelope = EventEnvelope::new(E::TYPE);
        let subscribers = self.read().get(E::TYPE).cloned().unwrap_or_default();

        let mut report = PublishReport {
            event_id: envelope.id,
            event_type: E::TYPE,
            delivered: subscribers.len(),
            failures: Vec::new(),
        };
        if subscribers.is_empty() {
            debug!(event_type = E::TYPE, event_id = %envelope.id, "no handlers subscribed");
            return report;
        }

        let payload: Payload = Arc::new(event);
        let timeout = self.inner.handler_timeout;
        let runs = subscribers.iter().map(|subscriber| {
            let future = (subscriber.run)(payload.clone(), envelope.clone());
            async move { (subscriber, run_isolated(future, timeout).await) }
        });

        for (subscriber, outcome) in join_all(runs).await {
            if let Err((kind, message)) = outcome {
                error!(
                    handler = subscriber.name,
                    event_type = E::TYPE,
                    event_id = %envelope.id,
                    kind = ?kind,
                    error = %message,
                    "event handler failed"
                );
                report.failures.push(HandlerFailure {
                    subscription: subscriber.id.0,
                    handler: subscriber.name,
                    kind,
                    message,
                });
            }
        }

        report
    }

    /// Publish each event in turn, waiting for one before the next.
    pub async fn publish_many<E, I>(&self, events: I) -> Vec<PublishReport>
    where
        E: Event,
        I: IntoIterator<Item = E>,
    {
        let mut reports = Vec::new();
        for event in events {
            reports.push(self.publish(event).await);
        }
        reports
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<&'static str, Vec<Subscriber>>> {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<&'static str, Vec<Subscriber>>> {
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_isolated(
    future: BoxFuture<'static, Result<()>>,
    timeout: Option<Duration>,
) -> Result<(), (FailureKind, String)> {
    let guarded = AssertUnwindSafe(future).catch_unwind();
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, guarded)
            .await
            .map_err(|_| (FailureKind::Timeout, format!("timed out after {limit:?}")))?,
        None => guarded.await,
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err((FailureKind::Error, format!("{e:#}"))),
        Err(panic) => Err((FailureKind::Panic, panic_message(panic.as_ref()))),
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&'static str, usize> = self
            .read()
            .iter()
            .map(|(event_type, list)| (*event_type, list.len()))
            .collect();
        f.debug_struct("EventBus")
            .field("subscribers", &counts)
            .field("handler_timeout", &self.inner.handler_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone)]
    struct Ping(u32);

    impl Event for Ping {
        const TYPE: &'static str = "ping";
    }

    #[derive(Debug, Clone)]
    struct Pong;

    impl Event for Pong {
        const TYPE: &'static str = "pong";
    }

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Recorder {
        name: &'static str,
        log: Log,
    }

    #[async_trait]
    impl EventHandler<Ping> for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, event: &Ping, _envelope: &EventEnvelope) -> Result<()> {
            self.log.push(format!("{}:{}", self.name, event.0));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler<Ping> for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(&self, _event: &Ping, _envelope: &EventEnvelope) -> Result<()> {
            Err(anyhow!("provider unavailable"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler<Ping> for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn handle(&self, _event: &Ping, _envelope: &EventEnvelope) -> Result<()> {
            panic!("handler exploded");
        }
    }

    struct Slow;

    #[async_trait]
    impl EventHandler<Ping> for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn handle(&self, _event: &Ping, _envelope: &EventEnvelope) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    struct PongCounter(Log);

    #[async_trait]
    impl EventHandler<Pong> for PongCounter {
        async fn handle(&self, _event: &Pong, _envelope: &EventEnvelope) -> Result<()> {
            self.0.push("pong");
            Ok(())
        }
    }

    fn recorder(name: &'static str, log: &Log) -> Recorder {
        Recorder {
            name,
            log: log.clone(),
        }
    }

    #[tokio::test]
    async fn test_failures_do_not_reach_siblings() {
        let bus = EventBus::new();
        let log = Log::default();
        bus.subscribe::<Ping, _>(recorder("first", &log));
        bus.subscribe::<Ping, _>(Failing);
        bus.subscribe::<Ping, _>(Panicking);
        bus.subscribe::<Ping, _>(recorder("last", &log));

        let report = bus.publish(Ping(7)).await;

        assert_eq!(report.delivered, 4);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(log.entries(), ["first:7", "last:7"]);

        let kinds: Vec<(&str, FailureKind)> = report
            .failures
            .iter()
            .map(|f| (f.handler, f.kind))
            .collect();
        assert_eq!(
            kinds,
            [("failing", FailureKind::Error), ("panicking", FailureKind::Panic)]
        );
        assert_eq!(report.failures[1].message, "handler exploded");
    }

    #[tokio::test]
    async fn test_handlers_start_in_subscription_order() {
        let bus = EventBus::new();
        let log = Log::default();
        for name in ["a", "b", "c", "d"] {
            bus.subscribe::<Ping, _>(recorder(name, &log));
        }

        bus.publish(Ping(1)).await;

        assert_eq!(log.entries(), ["a:1", "b:1", "c:1", "d:1"]);
    }

    #[tokio::test]
    async fn test_routing_by_event_type() {
        let bus = EventBus::new();
        let log = Log::default();
        bus.subscribe::<Ping, _>(recorder("ping", &log));
        bus.subscribe::<Pong, _>(PongCounter(log.clone()));

        let report = bus.publish(Pong).await;

        assert_eq!(report.event_type, "pong");
        assert_eq!(report.delivered, 1);
        assert_eq!(log.entries(), ["pong"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_clear() {
        let bus = EventBus::new();
        let log = Log::default();
        let first = bus.subscribe::<Ping, _>(recorder("first", &log));
        bus.subscribe::<Ping, _>(recorder("second", &log));

        assert!(bus.unsubscribe(first));
        assert!(!bus.unsubscribe(first));
        bus.publish(Ping(2)).await;
        assert_eq!(log.entries(), ["second:2"]);

        bus.clear();
        assert_eq!(bus.subscriber_count::<Ping>(), 0);
        let report = bus.publish(Ping(3)).await;
        assert_eq!(report.delivered, 0);
        assert_eq!(log.entries(), ["second:2"]);
    }

    #[tokio::test]
    async fn test_clones_share_subscriptions() {
        let bus = EventBus::new();
        let log = Log::default();
        bus.clone().subscribe::<Ping, _>(recorder("shared", &log));

        bus.publish(Ping(5)).await;

        assert_eq!(log.entries(), ["shared:5"]);
    }

    #[tokio::test]
    async fn test_publish_many_is_sequential() {
        let bus = EventBus::new();
        let log = Log::default();
        bus.subscribe::<Ping, _>(recorder("r", &log));

        let reports = bus.publish_many([Ping(1), Ping(2), Ping(3)]).await;

        assert_eq!(reports.len(), 3);
        assert_eq!(log.entries(), ["r:1", "r:2", "r:3"]);
        assert_ne!(reports[0].event_id, reports[1].event_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_handler_times_out() {
        let bus = EventBus::with_handler_timeout(Some(Duration::from_secs(1)));
        let log = Log::default();
        bus.subscribe::<Ping, _>(Slow);
        bus.subscribe::<Ping, _>(recorder("fast", &log));

        let report = bus.publish(Ping(9)).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, FailureKind::Timeout);
        assert_eq!(log.entries(), ["fast:9"]);
    }
}
