use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::trace;

/// Fired after an onboarding checkout is confirmed by the payment provider.
pub const TOPIC_ONBOARDING_PAYMENT_SUCCEEDED: &str = "onboarding_payment_succeeded";
/// Fired after an order payment link is confirmed by the payment provider.
pub const TOPIC_ORDER_PAYMENT_SUCCEEDED: &str = "order_payment_succeeded";

const DISPATCH_CAPACITY: usize = 1024;
const SUBSCRIBER_CAPACITY: usize = 128;

#[derive(Debug, Clone)]
pub struct Event {
    pub topic: &'static str,
    pub payload: Value,
    /// Trace id of the emitting request, for downstream log correlation.
    pub request_id: Option<Uuid>,
}

impl Event {
    pub fn new(topic: &'static str, payload: Value) -> Self {
        Event {
            topic,
            payload,
            request_id: trace::request_id(),
        }
    }
}

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

struct Subscriber {
    id: u64,
    topic: &'static str,
    tx: mpsc::Sender<Event>,
}

type SubscriberList = Arc<RwLock<Vec<Subscriber>>>;

/// Single-process topic fan-out. Bounded everywhere: a slow subscriber fills
/// its channel, the dispatcher stalls on it, the dispatch channel fills, and
/// `emit` blocks. Events are never dropped silently.
pub struct EventBus {
    dispatch_tx: mpsc::Sender<Event>,
    subscribers: SubscriberList,
    subscriber_capacity: usize,
    stop_tx: watch::Sender<bool>,
    next_id: AtomicU64,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DISPATCH_CAPACITY, SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(dispatch: usize, subscriber: usize) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(dispatch.max(1));
        let (stop_tx, _) = watch::channel(false);
        let subscribers: SubscriberList = Arc::new(RwLock::new(Vec::new()));
        let bus = Arc::new(EventBus {
            dispatch_tx,
            subscribers: Arc::clone(&subscribers),
            subscriber_capacity: subscriber.max(1),
            stop_tx: stop_tx.clone(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
        });
        let handle = tokio::spawn(dispatch_loop(
            dispatch_rx,
            subscribers,
            stop_tx.subscribe(),
        ));
        *bus.dispatcher.lock().expect("dispatcher lock") = Some(handle);
        bus
    }

    /// Registers a handler for a topic. The returned subscription detaches
    /// the handler when unsubscribed; its worker drains what it already
    /// received, then exits.
    pub fn listen<F, Fut>(&self, topic: &'static str, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| handler(event).boxed());
        let (tx, mut rx) = mpsc::channel::<Event>(self.subscriber_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let topic = event.topic;
                if let Err(panic) = AssertUnwindSafe(handler(event)).catch_unwind().await {
                    tracing::error!(
                        topic,
                        panic = %trace::panic_message(&panic),
                        "event handler panicked"
                    );
                }
            }
        });
        self.workers.lock().expect("workers lock").push(worker);
        self.subscribers
            .write()
            .expect("subscribers lock")
            .push(Subscriber { id, topic, tx });
        Subscription {
            id,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Enqueues an event, blocking while the dispatch channel is full.
    /// Returns false only when the bus is shutting down.
    pub async fn emit(&self, event: Event) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!(topic = event.topic, "emit on closed event bus");
            return false;
        }
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return false;
        }
        tokio::select! {
            sent = self.dispatch_tx.send(event) => sent.is_ok(),
            _ = stop_rx.changed() => false,
        }
    }

    /// Idempotent shutdown: stops accepting events, delivers everything
    /// already accepted, then waits for every worker.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);
        let dispatcher = self.dispatcher.lock().expect("dispatcher lock").take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                tracing::error!(?e, "event bus dispatcher task failed");
            }
        }
        // Dropping the senders lets each worker drain and exit.
        self.subscribers.write().expect("subscribers lock").clear();
        let workers = std::mem::take(&mut *self.workers.lock().expect("workers lock"));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(?e, "event bus worker task failed");
            }
        }
    }
}

async fn dispatch_loop(
    mut rx: mpsc::Receiver<Event>,
    subscribers: SubscriberList,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            received = rx.recv() => match received {
                Some(event) => deliver(&subscribers, event).await,
                None => return,
            }
        }
    }
    // Everything already accepted into the dispatch channel still goes out.
    while let Ok(event) = rx.try_recv() {
        deliver(&subscribers, event).await;
    }
}

async fn deliver(subscribers: &SubscriberList, event: Event) {
    let targets: Vec<mpsc::Sender<Event>> = subscribers
        .read()
        .expect("subscribers lock")
        .iter()
        .filter(|s| s.topic == event.topic)
        .map(|s| s.tx.clone())
        .collect();
    for tx in targets {
        // Blocking here is the backpressure contract.
        if tx.send(event.clone()).await.is_err() {
            tracing::debug!(topic = event.topic, "subscriber went away mid-delivery");
        }
    }
}

pub struct Subscription {
    id: u64,
    subscribers: SubscriberList,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.subscribers
            .write()
            .expect("subscribers lock")
            .retain(|s| s.id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counter_handler(
        seen: Arc<AtomicUsize>,
    ) -> impl Fn(Event) -> BoxFuture<'static, ()> + Send + Sync + 'static {
        move |_event| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn events_fan_out_to_topic_subscribers_only() {
        let bus = EventBus::new();
        let onboarding = Arc::new(AtomicUsize::new(0));
        let orders = Arc::new(AtomicUsize::new(0));
        let _s1 = bus.listen(
            TOPIC_ONBOARDING_PAYMENT_SUCCEEDED,
            counter_handler(Arc::clone(&onboarding)),
        );
        let _s2 = bus.listen(
            TOPIC_ORDER_PAYMENT_SUCCEEDED,
            counter_handler(Arc::clone(&orders)),
        );
        for _ in 0..3 {
            assert!(
                bus.emit(Event::new(TOPIC_ONBOARDING_PAYMENT_SUCCEEDED, json!({})))
                    .await
            );
        }
        bus.close().await;
        assert_eq!(onboarding.load(Ordering::SeqCst), 3);
        assert_eq!(orders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn accepted_events_are_delivered_before_close_returns() {
        let bus = EventBus::with_capacity(64, 8);
        let seen = Arc::new(AtomicUsize::new(0));
        let _sub = bus.listen(TOPIC_ORDER_PAYMENT_SUCCEEDED, {
            let seen = Arc::clone(&seen);
            move |_event| {
                let seen = Arc::clone(&seen);
                async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        for _ in 0..20 {
            assert!(
                bus.emit(Event::new(TOPIC_ORDER_PAYMENT_SUCCEEDED, json!({})))
                    .await
            );
        }
        bus.close().await;
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn handler_panic_does_not_kill_the_worker() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let _sub = bus.listen(TOPIC_ORDER_PAYMENT_SUCCEEDED, {
            let seen = Arc::clone(&seen);
            move |event| {
                let seen = Arc::clone(&seen);
                async move {
                    if event.payload["boom"].as_bool().unwrap_or(false) {
                        panic!("subscriber exploded");
                    }
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        bus.emit(Event::new(
            TOPIC_ORDER_PAYMENT_SUCCEEDED,
            json!({"boom": true}),
        ))
        .await;
        bus.emit(Event::new(
            TOPIC_ORDER_PAYMENT_SUCCEEDED,
            json!({"boom": false}),
        ))
        .await;
        bus.close().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let sub = bus.listen(
            TOPIC_ORDER_PAYMENT_SUCCEEDED,
            counter_handler(Arc::clone(&seen)),
        );
        assert!(
            bus.emit(Event::new(TOPIC_ORDER_PAYMENT_SUCCEEDED, json!({})))
                .await
        );
        // Give the dispatcher a beat before detaching.
        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.unsubscribe();
        bus.emit(Event::new(TOPIC_ORDER_PAYMENT_SUCCEEDED, json!({})))
            .await;
        bus.close().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_emits() {
        let bus = EventBus::new();
        bus.close().await;
        bus.close().await;
        assert!(
            !bus.emit(Event::new(TOPIC_ORDER_PAYMENT_SUCCEEDED, json!({})))
                .await
        );
    }

    #[tokio::test]
    async fn emit_blocks_instead_of_dropping() {
        let bus = EventBus::with_capacity(1, 1);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let _sub = bus.listen(TOPIC_ORDER_PAYMENT_SUCCEEDED, {
            let gate = Arc::clone(&gate);
            move |_event| {
                let gate = Arc::clone(&gate);
                async move {
                    let _permit = gate.acquire().await;
                }
            }
        });
        // Saturate worker (1 in-flight), subscriber buffer (1) and the
        // dispatch buffer (1); the next emit must block.
        for _ in 0..3 {
            assert!(
                bus.emit(Event::new(TOPIC_ORDER_PAYMENT_SUCCEEDED, json!({})))
                    .await
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            bus.emit(Event::new(TOPIC_ORDER_PAYMENT_SUCCEEDED, json!({}))),
        )
        .await;
        assert!(blocked.is_err(), "emit should block while channels are full");
        gate.add_permits(100);
    }
}
