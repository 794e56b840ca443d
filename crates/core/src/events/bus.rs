use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use crate::{
    error::{PipelineError, Result},
    events::{EnrichedEvent, PipelineEvent},
    queues::{FifoDropOldestQueue, FifoDropOldestReceiver},
};

pub struct SubscriptionSpec {
    pub subscriber_id: &'static str,
    /// Event types to deliver; empty means every event.
    pub event_types: Vec<&'static str>,
    pub capacity: usize,
}

impl SubscriptionSpec {
    pub fn all(subscriber_id: &'static str, capacity: usize) -> Self {
        Self {
            subscriber_id,
            event_types: Vec::new(),
            capacity,
        }
    }
}

#[derive(Default)]
pub struct BusMetrics {
    pub published_total: AtomicU64,
    pub unrouted_publish_total: AtomicU64,
    pub drops_total: AtomicU64,
}

struct Route {
    subscriber_id: &'static str,
    event_types: Vec<&'static str>,
    inbox: FifoDropOldestQueue<Arc<EnrichedEvent>>,
    drops_total: AtomicU64,
}

impl Route {
    fn accepts(&self, event_type: &str) -> bool {
        self.event_types.is_empty() || self.event_types.contains(&event_type)
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    session_id: Uuid,
    next_ingest_seq: AtomicU64,
    routes: Mutex<Vec<Arc<Route>>>,
    metrics: BusMetrics,
}

pub struct EventReceiver {
    route: Arc<Route>,
    rx: FifoDropOldestReceiver<Arc<EnrichedEvent>>,
}

impl EventReceiver {
    pub async fn recv(&self) -> Arc<EnrichedEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&self) -> Option<Arc<EnrichedEvent>> {
        self.rx.try_recv()
    }

    /// Events evicted from this subscriber's inbox because it fell behind.
    pub fn dropped(&self) -> u64 {
        self.route.drops_total.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Uuid::new_v4())
    }
}

impl EventBus {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                session_id,
                next_ingest_seq: AtomicU64::new(0),
                routes: Mutex::new(Vec::new()),
                metrics: BusMetrics::default(),
            }),
        }
    }

    pub fn subscribe(&self, spec: SubscriptionSpec) -> Result<EventReceiver> {
        if spec.subscriber_id.trim().is_empty() {
            return Err(PipelineError::Config("empty subscriber_id".to_string()));
        }
        if spec.capacity == 0 {
            return Err(PipelineError::Config(format!(
                "subscriber_id={} capacity must be > 0",
                spec.subscriber_id
            )));
        }

        let mut routes = self.inner.routes.lock().expect("EventBus routes poisoned");
        if routes.iter().any(|r| r.subscriber_id == spec.subscriber_id) {
            return Err(PipelineError::Config(format!(
                "duplicate subscriber_id={}",
                spec.subscriber_id
            )));
        }

        let route = Arc::new(Route {
            subscriber_id: spec.subscriber_id,
            event_types: spec.event_types,
            inbox: FifoDropOldestQueue::new(spec.capacity),
            drops_total: AtomicU64::new(0),
        });
        let rx = route.inbox.receiver();
        routes.push(Arc::clone(&route));

        Ok(EventReceiver { route, rx })
    }

    pub fn publish(&self, event: PipelineEvent) {
        let ingest_seq = self.inner.next_ingest_seq.fetch_add(1, Ordering::Relaxed);
        self.inner
            .metrics
            .published_total
            .fetch_add(1, Ordering::Relaxed);

        let enriched = Arc::new(EnrichedEvent {
            event,
            event_id: Uuid::new_v4(),
            session_id: self.inner.session_id,
            ingest_seq,
            timestamp: Utc::now(),
            ingested_at: Instant::now(),
        });
        let event_type = enriched.event.event_type();

        let routes = self.inner.routes.lock().expect("EventBus routes poisoned");
        let mut delivered = false;
        for route in routes.iter().filter(|r| r.accepts(event_type)) {
            delivered = true;
            if route.inbox.push_overwrite(Arc::clone(&enriched)) {
                route.drops_total.fetch_add(1, Ordering::Relaxed);
                self.inner.metrics.drops_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        if !delivered {
            self.inner
                .metrics
                .unrouted_publish_total
                .fetch_add(1, Ordering::Relaxed);
        }
        trace!(event_type, ingest_seq, delivered, "Event published");
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn metrics(&self) -> &BusMetrics {
        &self.inner.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(video_id: &str) -> PipelineEvent {
        PipelineEvent::JobQueued {
            video_id: video_id.into(),
            run: 1,
        }
    }

    #[test]
    fn routes_by_event_type() {
        let bus = EventBus::default();
        let all = bus.subscribe(SubscriptionSpec::all("all", 8)).unwrap();
        let failures = bus
            .subscribe(SubscriptionSpec {
                subscriber_id: "failures",
                event_types: vec!["job.failed"],
                capacity: 8,
            })
            .unwrap();

        bus.publish(queued("a"));
        bus.publish(PipelineEvent::JobFailed {
            video_id: "a".into(),
            reason: "boom".into(),
        });

        assert_eq!(all.try_recv().unwrap().ingest_seq, 0);
        assert_eq!(all.try_recv().unwrap().ingest_seq, 1);
        let failed = failures.try_recv().unwrap();
        assert_eq!(failed.event.event_type(), "job.failed");
        assert_eq!(failed.session_id, bus.session_id());
        assert!(failures.try_recv().is_none());
    }

    #[test]
    fn slow_subscriber_loses_oldest_events() {
        let bus = EventBus::default();
        let rx = bus.subscribe(SubscriptionSpec::all("slow", 2)).unwrap();

        for id in ["a", "b", "c"] {
            bus.publish(queued(id));
        }

        assert_eq!(rx.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap().event.video_id(), "b");
        assert_eq!(rx.try_recv().unwrap().event.video_id(), "c");
    }

    #[test]
    fn rejects_invalid_subscriptions() {
        let bus = EventBus::default();
        bus.subscribe(SubscriptionSpec::all("ui", 1)).unwrap();
        assert!(bus.subscribe(SubscriptionSpec::all("ui", 1)).is_err());
        assert!(bus.subscribe(SubscriptionSpec::all(" ", 1)).is_err());
        assert!(bus.subscribe(SubscriptionSpec::all("zero", 0)).is_err());
    }

    #[test]
    fn unrouted_events_are_counted() {
        let bus = EventBus::default();
        bus.publish(queued("a"));
        assert_eq!(
            bus.metrics().unrouted_publish_total.load(Ordering::Relaxed),
            1
        );
    }
}
