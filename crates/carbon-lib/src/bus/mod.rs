//! In-process publish/subscribe bus
//!
//! Decouples the schedulers that produce metrics from the calculator that
//! consumes them. Dispatch is synchronous: `publish` runs every handler
//! subscribed to the event's topic on the caller's task, in registration
//! order, before returning.

mod events;

pub use events::{EmissionsCalculated, Event, MetricsCollected, Topic};

use crate::observability::CarbonMetrics;
use anyhow::Result;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// A consumer of bus events
pub trait EventHandler: Send + Sync {
    /// Name used in logs and metrics
    fn name(&self) -> &str;

    /// Handle one event. `bus` may be used to publish follow-up events.
    fn handle(&self, event: &Event, bus: &EventBus) -> Result<()>;

    /// Release resources held by the handler
    fn stop(&self) {}
}

/// Topic-keyed ordered registry of handlers
pub struct EventBus {
    handlers: RwLock<HashMap<Topic, Vec<Arc<dyn EventHandler>>>>,
    metrics: CarbonMetrics,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            metrics: CarbonMetrics::new(),
        }
    }

    /// Register a handler for a topic. Handlers run in registration order.
    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) {
        info!(topic = %topic, handler = handler.name(), "Subscribing handler");
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(topic).or_default().push(handler);
    }

    /// Number of handlers registered for a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&topic).map(Vec::len).unwrap_or(0)
    }

    /// Dispatch an event to every handler of its topic.
    ///
    /// Returns the number of handlers that completed successfully. A handler
    /// that errors or panics is logged and skipped; the remaining handlers
    /// still run and nothing is propagated to the publisher.
    pub fn publish(&self, event: Event) -> usize {
        let topic = event.topic();

        // Snapshot so the lock is not held while handlers run (they may publish).
        let subscribers: Vec<Arc<dyn EventHandler>> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&topic).cloned().unwrap_or_default()
        };

        self.metrics.inc_events_published(topic.as_str());

        if subscribers.is_empty() {
            debug!(topic = %topic, "No subscribers for topic");
            return 0;
        }

        let mut delivered = 0;
        for handler in &subscribers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&event, self))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(
                        topic = %topic,
                        handler = handler.name(),
                        instance_id = %event.instance().id,
                        error = %e,
                        "Event handler failed"
                    );
                    self.metrics.inc_handler_failures(handler.name());
                }
                Err(_) => {
                    error!(
                        topic = %topic,
                        handler = handler.name(),
                        instance_id = %event.instance().id,
                        "Event handler panicked"
                    );
                    self.metrics.inc_handler_failures(handler.name());
                }
            }
        }

        delivered
    }

    /// Stop every registered handler once and drop all registrations
    pub fn stop(&self) {
        let drained: Vec<Arc<dyn EventHandler>> = {
            let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
            handlers.drain().flat_map(|(_, v)| v).collect()
        };

        let mut stopped: Vec<&Arc<dyn EventHandler>> = Vec::new();
        for handler in &drained {
            // A handler subscribed to several topics is stopped once.
            if stopped.iter().any(|s| Arc::ptr_eq(s, handler)) {
                continue;
            }
            debug!(handler = handler.name(), "Stopping handler");
            handler.stop();
            stopped.push(handler);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Instance, Provider};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records the order in which handlers saw events
    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        stops: AtomicUsize,
    }

    impl Recorder {
        fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                log,
                stops: AtomicUsize::new(0),
            })
        }
    }

    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle(&self, event: &Event, _bus: &EventBus) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.instance().id));
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Failing;

    impl EventHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn handle(&self, _event: &Event, _bus: &EventBus) -> Result<()> {
            anyhow::bail!("boom")
        }
    }

    struct Panicking;

    impl EventHandler for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn handle(&self, _event: &Event, _bus: &EventBus) -> Result<()> {
            panic!("handler exploded")
        }
    }

    /// Republishes every MetricsCollected as EmissionsCalculated
    struct Forwarder;

    impl EventHandler for Forwarder {
        fn name(&self) -> &str {
            "forwarder"
        }

        fn handle(&self, event: &Event, bus: &EventBus) -> Result<()> {
            if let Event::MetricsCollected(e) = event {
                bus.publish(Event::emissions_calculated(e.instance.clone(), e.interval));
            }
            Ok(())
        }
    }

    fn collected(id: &str) -> Event {
        Event::metrics_collected(
            Instance::new(id, Provider::Gcp, "europe-west1", "e2-small"),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_handlers_receive_once_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::MetricsCollected, Recorder::new("first", log.clone()));
        bus.subscribe(Topic::MetricsCollected, Recorder::new("second", log.clone()));
        bus.subscribe(Topic::EmissionsCalculated, Recorder::new("other", log.clone()));

        let delivered = bus.publish(collected("vm-1"));

        assert_eq!(delivered, 2);
        assert_eq!(*log.lock().unwrap(), vec!["first:vm-1", "second:vm-1"]);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(Topic::MetricsCollected), 0);
        assert_eq!(bus.publish(collected("vm-1")), 0);
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::MetricsCollected, Arc::new(Failing));
        bus.subscribe(Topic::MetricsCollected, Arc::new(Panicking));
        bus.subscribe(Topic::MetricsCollected, Recorder::new("last", log.clone()));

        let delivered = bus.publish(collected("vm-2"));

        assert_eq!(delivered, 1);
        assert_eq!(*log.lock().unwrap(), vec!["last:vm-2"]);
    }

    #[test]
    fn test_handler_can_publish_followup() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(Topic::MetricsCollected, Arc::new(Forwarder));
        bus.subscribe(Topic::EmissionsCalculated, Recorder::new("sink", log.clone()));

        bus.publish(collected("vm-3"));

        assert_eq!(*log.lock().unwrap(), vec!["sink:vm-3"]);
    }

    #[test]
    fn test_stop_calls_each_handler_once() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder::new("both", log.clone());
        bus.subscribe(Topic::MetricsCollected, recorder.clone());
        bus.subscribe(Topic::EmissionsCalculated, recorder.clone());

        bus.stop();

        assert_eq!(recorder.stops.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(Topic::MetricsCollected), 0);
        assert_eq!(bus.publish(collected("vm-4")), 0);
    }
}
