//! In-process topic bus.
//!
//! Producers call [`MessageBus::publish`] from any thread; the message lands on
//! the topic's queue and a single dedicated worker thread sweeps all topics,
//! handing each queued envelope to every listener registered at sweep time.
//! The worker runs its own current-thread tokio runtime. Listener futures are
//! spawned onto it and never awaited by the sweep, so a listener that is still
//! running does not hold up the next message or the next topic. Listener
//! errors and panics are logged and forwarded to [`MessageBus::failures`].
//! On stop the worker keeps its runtime alive until every listener already
//! running has returned.
//!
//! Delivery is best-effort: nothing is persisted, messages published to a topic
//! nobody listens to are dropped, and queued messages are discarded when the
//! last listener unsubscribes.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::task::JoinSet;

use crate::message::Envelope;

const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// An async listener. Identity (for unsubscribe) is the `Arc` allocation.
pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |envelope| f(envelope).boxed())
}

/// A listener invocation that returned an error or panicked.
#[derive(Debug, Clone)]
pub struct ListenerFailure {
    pub topic: String,
    pub message_id: String,
    pub error: String,
}

struct Topic {
    queue_tx: flume::Sender<Envelope>,
    queue_rx: flume::Receiver<Envelope>,
    listeners: Vec<Handler>,
}

impl Topic {
    fn new() -> Self {
        let (queue_tx, queue_rx) = flume::unbounded();
        Self {
            queue_tx,
            queue_rx,
            listeners: Vec::new(),
        }
    }
}

struct Worker {
    stop_tx: flume::Sender<()>,
    handle: JoinHandle<()>,
}

struct BusInner {
    topics: Mutex<HashMap<String, Topic>>,
    worker: Mutex<Option<Worker>>,
    poll_interval: Duration,
    failures_tx: flume::Sender<ListenerFailure>,
    failures_rx: flume::Receiver<ListenerFailure>,
}

impl BusInner {
    // A panic while holding these locks cannot leave the maps half-updated,
    // so a poisoned guard is still safe to use.
    fn lock_topics(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drain every topic once and spawn listener invocations into `tasks`.
    fn sweep(&self, tasks: &mut JoinSet<()>) {
        let batches: Vec<(String, Vec<Envelope>, Vec<Handler>)> = {
            let topics = self.lock_topics();
            topics
                .iter()
                .filter_map(|(name, topic)| {
                    let pending: Vec<Envelope> = topic.queue_rx.try_iter().collect();
                    if pending.is_empty() {
                        None
                    } else {
                        Some((name.clone(), pending, topic.listeners.clone()))
                    }
                })
                .collect()
        };

        for (topic, pending, listeners) in batches {
            for envelope in pending {
                tracing::debug!(
                    "Delivering message {} on '{}' to {} listener(s)",
                    envelope.id,
                    topic,
                    listeners.len()
                );
                for listener in &listeners {
                    self.dispatch(tasks, &topic, listener, envelope.clone());
                }
            }
        }
    }

    fn dispatch(&self, tasks: &mut JoinSet<()>, topic: &str, listener: &Handler, envelope: Envelope) {
        let message_id = envelope.id.clone();
        let topic = topic.to_string();
        let failures_tx = self.failures_tx.clone();
        let listener = listener.clone();

        tasks.spawn(async move {
            let outcome = AssertUnwindSafe(async move { listener(envelope).await })
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(e)) => format!("{:#}", e),
                Err(_) => "listener panicked".to_string(),
            };
            tracing::error!(
                "Listener on topic '{}' failed for message {}: {}",
                topic,
                message_id,
                error
            );
            let _ = failures_tx.try_send(ListenerFailure {
                topic,
                message_id,
                error,
            });
        });
    }
}

/// Cheap to clone; all clones share the same topics and worker.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(poll_interval: Duration) -> Self {
        let (failures_tx, failures_rx) = flume::bounded(FAILURE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                worker: Mutex::new(None),
                poll_interval,
                failures_tx,
                failures_rx,
            }),
        }
    }

    /// Register `handler` on `topic`, creating the topic if needed.
    /// Registering the same handler twice delivers every message twice.
    pub fn subscribe(&self, topic: &str, handler: Handler) {
        let mut topics = self.inner.lock_topics();
        let entry = topics.entry(topic.to_string()).or_insert_with(|| {
            tracing::info!("Creating topic '{}'", topic);
            Topic::new()
        });
        entry.listeners.push(handler);
        tracing::info!(
            "Subscribed listener to '{}' ({} listener(s))",
            topic,
            entry.listeners.len()
        );
    }

    /// Remove every registration of `handler` from `topic`. Removing the last
    /// listener deletes the topic and discards whatever was still queued.
    pub fn unsubscribe(&self, topic: &str, handler: &Handler) {
        let mut topics = self.inner.lock_topics();
        let Some(entry) = topics.get_mut(topic) else {
            tracing::debug!("Unsubscribe from unknown topic '{}' ignored", topic);
            return;
        };

        entry
            .listeners
            .retain(|registered| !same_handler(registered, handler));

        if entry.listeners.is_empty() {
            let discarded = entry.queue_rx.len();
            topics.remove(topic);
            tracing::info!(
                "Topic '{}' removed due to no listeners ({} queued message(s) discarded)",
                topic,
                discarded
            );
        }
    }

    /// Queue `envelope` on `topic`. Returns `false` if nobody listens there,
    /// in which case the envelope is dropped.
    pub fn publish(&self, topic: &str, envelope: Envelope) -> bool {
        let topics = self.inner.lock_topics();
        match topics.get(topic) {
            Some(entry) => {
                tracing::debug!("Publishing message {} to '{}'", envelope.id, topic);
                entry.queue_tx.send(envelope).is_ok()
            }
            None => {
                tracing::warn!(
                    "Publishing to topic '{}' that no one listens to; dropping message {}",
                    topic,
                    envelope.id
                );
                false
            }
        }
    }

    /// Spawn the worker thread. Calling it while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.inner.lock_worker();
        if worker.is_some() {
            tracing::warn!("Bus worker already running");
            return Ok(());
        }

        let (stop_tx, stop_rx) = flume::bounded(1);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("kurisu-bus".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!("Failed to build bus worker runtime: {}", e);
                        return;
                    }
                };
                rt.block_on(run_worker(inner, stop_rx));
                tracing::info!("Bus worker stopped");
            })
            .context("failed to spawn bus worker thread")?;

        tracing::info!(
            "Bus worker started (poll interval {:?})",
            self.inner.poll_interval
        );
        *worker = Some(Worker { stop_tx, handle });
        Ok(())
    }

    /// Signal the worker, let the current sweep and every running listener
    /// finish, and join it. Messages still queued are not delivered.
    pub fn stop(&self) {
        let Some(worker) = self.inner.lock_worker().take() else {
            tracing::debug!("Bus worker already stopped");
            return;
        };

        tracing::info!("Stopping bus worker");
        let _ = worker.stop_tx.send(());

        if worker.handle.thread().id() == std::thread::current().id() {
            // Called from a listener: the loop exits after this task yields.
            return;
        }
        if worker.handle.join().is_err() {
            tracing::error!("Bus worker panicked during shutdown");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_worker().is_some()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.inner.lock_topics().contains_key(topic)
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner
            .lock_topics()
            .get(topic)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    /// Supervisory stream of listener failures. Oldest failures are kept when
    /// nobody drains it; newer ones are only logged.
    pub fn failures(&self) -> flume::Receiver<ListenerFailure> {
        self.inner.failures_rx.clone()
    }
}

async fn run_worker(inner: Arc<BusInner>, stop_rx: flume::Receiver<()>) {
    tracing::info!("Bus worker entering sweep loop");
    let mut tasks = JoinSet::new();
    loop {
        inner.sweep(&mut tasks);
        while tasks.try_join_next().is_some() {}
        tokio::select! {
            _ = tokio::time::sleep(inner.poll_interval) => {}
            _ = stop_rx.recv_async() => break,
        }
    }

    if !tasks.is_empty() {
        tracing::info!("Waiting for {} running listener(s) to finish", tasks.len());
    }
    while tasks.join_next().await.is_some() {}
}

fn same_handler(a: &Handler, b: &Handler) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
