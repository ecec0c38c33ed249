//! # Message Bus
//!
//! Point-to-point and broadcast messaging between registered modules.
//!
//! ## Delivery Model
//!
//! - `send` validates the target and dependency policy, persists the message to
//!   the `messages` collection and queues it under its (sender, target)
//!   ordering key.
//! - A pool of `message_bus.worker_count` workers pulls ready keys from the
//!   [`Scheduler`]; at most one delivery per key is in flight, so delivery is
//!   FIFO per pair.
//! - Transient handler failures are retried with exponential backoff. The key
//!   stays reserved during the backoff. Once `max_delivery_attempts` is reached
//!   the message is parked in the dead letter set.
//! - Permanent failures (`Rejected`, `UnknownMessageType`, target gone) mark
//!   the message `failed` immediately.
//!
//! Synchronous sends wait on a oneshot reply channel bounded by
//! `tokio::time::timeout`. On timeout the waiter is dropped and the message
//! stays queued.

use super::dead_letter::{DeadLetter, DeadLetterStore};
use super::errors::{DeliveryError, DeliveryResult, HandlerError};
use super::handler::ModuleHandler;
use super::message::{
    BroadcastReport, DeliveryReceipt, DeliveryStatus, Message, MessageId, MessageSource,
    SendOptions,
};
use super::scheduler::Scheduler;
use crate::clock::SharedClock;
use crate::config::MessageBusConfig;
use crate::constants::collections;
use crate::registry::ModuleRegistry;
use crate::store::{DocumentFilter, DocumentStore, StoreResult};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Point-in-time bus counters for operator views
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub pending: usize,
    pub in_flight: usize,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub retried: u64,
    pub attached_handlers: usize,
    pub accepting: bool,
}

#[derive(Debug, Default)]
struct BusCounters {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    retried: AtomicU64,
}

type ReplySender = oneshot::Sender<DeliveryResult<Value>>;

struct BusInner {
    registry: Arc<ModuleRegistry>,
    store: Arc<dyn DocumentStore>,
    dead_letters: DeadLetterStore,
    clock: SharedClock,
    config: MessageBusConfig,
    handlers: DashMap<String, Arc<dyn ModuleHandler>>,
    scheduler: Mutex<Scheduler>,
    work_available: Notify,
    waiters: DashMap<MessageId, ReplySender>,
    accepting: AtomicBool,
    next_sequence: AtomicU64,
    counters: BusCounters,
}

/// Cheaply cloneable handle to the bus
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("stats", &self.stats())
            .finish()
    }
}

impl MessageBus {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        store: Arc<dyn DocumentStore>,
        clock: SharedClock,
        config: MessageBusConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry,
                dead_letters: DeadLetterStore::new(Arc::clone(&store)),
                store,
                clock,
                config,
                handlers: DashMap::new(),
                scheduler: Mutex::new(Scheduler::new()),
                work_available: Notify::new(),
                waiters: DashMap::new(),
                accepting: AtomicBool::new(true),
                next_sequence: AtomicU64::new(0),
                counters: BusCounters::default(),
            }),
        }
    }

    /// Attach the handler that receives messages addressed to `module`
    pub fn attach_handler(&self, module: impl Into<String>, handler: Arc<dyn ModuleHandler>) {
        let module = module.into();
        crate::log_bus!(debug, "Handler attached", module: module);
        self.inner.handlers.insert(module, handler);
        self.inner.work_available.notify_one();
    }

    /// Detach a module's handler; deliveries to it fail transiently until reattached
    pub fn detach_handler(&self, module: &str) -> bool {
        let removed = self.inner.handlers.remove(module).is_some();
        if removed {
            crate::log_bus!(debug, "Handler detached", module: module);
        }
        removed
    }

    pub fn has_handler(&self, module: &str) -> bool {
        self.inner.handlers.contains_key(module)
    }

    /// Send one message.
    ///
    /// Asynchronous sends return as soon as the message is queued. Synchronous
    /// sends (`SendOptions::sync`) also carry the handler's reply.
    pub async fn send(
        &self,
        sender: impl Into<MessageSource>,
        target: &str,
        message_type: &str,
        payload: Value,
        options: SendOptions,
    ) -> DeliveryResult<DeliveryReceipt> {
        let sender = sender.into();
        self.inner.admit(&sender, target)?;

        let mut message = Message::new(
            sender,
            target,
            message_type,
            payload,
            &options,
            self.inner.clock.now(),
        );
        message.sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        let message_id = message.id;
        let correlation_id = message.correlation_id.clone();

        let waiter = options.synchronous.then(|| {
            let (tx, rx) = oneshot::channel();
            self.inner.waiters.insert(message_id, tx);
            rx
        });

        if let Err(error) = self.inner.enqueue(message).await {
            self.inner.waiters.remove(&message_id);
            return Err(error);
        }

        let Some(reply) = waiter else {
            return Ok(DeliveryReceipt {
                message_id,
                reply: None,
            });
        };

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.default_sync_timeout());
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(Ok(value))) => Ok(DeliveryReceipt {
                message_id,
                reply: Some(value),
            }),
            Ok(Ok(Err(error))) => Err(error),
            Ok(Err(_closed)) => Err(DeliveryError::ShuttingDown),
            Err(_elapsed) => {
                self.inner.waiters.remove(&message_id);
                crate::log_bus!(warn, "Synchronous send timed out",
                    message_id: message_id,
                    correlation_id: correlation_id,
                    timeout_ms: timeout.as_millis()
                );
                Err(DeliveryError::DeliveryTimeout {
                    message_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Best-effort fan-out to every registered module (or the given subset).
    ///
    /// A module sender is never included in its own broadcast unless named
    /// explicitly in `targets`.
    pub async fn broadcast(
        &self,
        sender: impl Into<MessageSource>,
        message_type: &str,
        payload: Value,
        targets: Option<Vec<String>>,
    ) -> BroadcastReport {
        let sender = sender.into();
        let targets = targets.unwrap_or_else(|| {
            self.inner
                .registry
                .list()
                .into_iter()
                .map(|m| m.name)
                .filter(|name| !matches!(&sender, MessageSource::Module(s) if s == name))
                .collect()
        });

        let mut report = BroadcastReport::default();
        for target in targets {
            let result = self
                .send(
                    sender.clone(),
                    &target,
                    message_type,
                    payload.clone(),
                    SendOptions::default(),
                )
                .await
                .map(|receipt| receipt.message_id);
            report.results.insert(target, result);
        }

        crate::log_bus!(debug, "Broadcast fanned out",
            sender: sender.to_string(),
            message_type: message_type,
            targets: report.len(),
            failures: report.failed().len()
        );
        report
    }

    /// Reload messages persisted as `queued` into the delivery queues.
    ///
    /// Covers messages left behind by a crash, a drain timeout or a timed-out
    /// synchronous send. They are re-enqueued oldest first so delivery stays FIFO
    /// per (sender, target) pair; messages this bus already holds are skipped.
    pub async fn recover_queued(&self) -> DeliveryResult<usize> {
        let filter = DocumentFilter::new().field_eq("status", DeliveryStatus::Queued.to_string());
        let mut messages = self
            .inner
            .store
            .select(collections::MESSAGES, &filter)
            .await?
            .iter()
            .map(|document| document.decode::<Message>())
            .collect::<StoreResult<Vec<_>>>()?;
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.sequence.cmp(&b.sequence))
        });

        let mut recovered = 0usize;
        {
            let mut scheduler = self.inner.scheduler.lock();
            for message in messages {
                if scheduler.recover(message) {
                    recovered += 1;
                }
            }
        }

        if recovered > 0 {
            self.inner.work_available.notify_waiters();
            crate::log_bus!(info, "Queued messages recovered", recovered: recovered);
        }
        Ok(recovered)
    }

    /// Spawn the delivery worker pool
    pub fn start_workers(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        (0..self.inner.config.worker_count)
            .map(|worker_id| {
                let inner = Arc::clone(&self.inner);
                let shutdown = shutdown.subscribe();
                tokio::spawn(async move { inner.run_worker(worker_id, shutdown).await })
            })
            .collect()
    }

    /// Spawn the periodic garbage collection of terminal messages
    pub fn start_gc_loop(&self, shutdown: &broadcast::Sender<()>) -> JoinHandle<()> {
        let bus = self.clone();
        let mut shutdown = shutdown.subscribe();
        let period = self.inner.config.gc_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = bus.collect_garbage().await {
                            warn!(error = %error, "Message garbage collection failed");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            debug!("Message GC loop stopped");
        })
    }

    /// Reject new sends with [`DeliveryError::ShuttingDown`]
    pub fn stop_accepting(&self) {
        self.inner.accepting.store(false, Ordering::Release);
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::Acquire)
    }

    /// Stop accepting sends and wait for queued messages to settle.
    ///
    /// Returns `true` if the bus became idle before `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.stop_accepting();
        let drained = tokio::time::timeout(timeout, async {
            while !self.inner.scheduler.lock().is_idle() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok();

        let stats = self.stats();
        if drained {
            info!("📨 BUS: Drained all queued messages");
        } else {
            warn!(
                pending = stats.pending,
                in_flight = stats.in_flight,
                "📨 BUS: Drain timed out with messages outstanding"
            );
        }
        drained
    }

    /// Look up a persisted message by id
    pub async fn message(&self, id: MessageId) -> DeliveryResult<Option<Message>> {
        match self
            .inner
            .store
            .get(collections::MESSAGES, &id.to_string())
            .await?
        {
            Some(document) => Ok(Some(document.decode()?)),
            None => Ok(None),
        }
    }

    pub async fn dead_letters(&self) -> DeliveryResult<Vec<DeadLetter>> {
        Ok(self.inner.dead_letters.list().await?)
    }

    /// Move a dead letter back onto its queue with a fresh attempt budget
    pub async fn requeue_dead_letter(&self, id: MessageId) -> DeliveryResult<MessageId> {
        let entry = self
            .inner
            .dead_letters
            .get(id)
            .await?
            .ok_or(DeliveryError::MessageNotFound { message_id: id })?;

        if !self.is_accepting() {
            return Err(DeliveryError::ShuttingDown);
        }
        if !self.inner.registry.contains(&entry.message.target) {
            return Err(DeliveryError::target_not_registered(&entry.message.target));
        }

        let mut message = entry.message;
        message.status = DeliveryStatus::Queued;
        message.requeues += 1;
        message.attempts = 0;
        message.last_error = None;
        message.updated_at = self.inner.clock.now();

        self.inner.persist(&message).await?;
        self.inner.dead_letters.remove(id).await?;
        self.inner.scheduler.lock().enqueue(message.clone());
        self.inner.work_available.notify_one();

        crate::log_bus!(info, "Dead letter requeued",
            message_id: message.id,
            correlation_id: message.correlation_id,
            requeues: message.requeues
        );
        Ok(message.id)
    }

    /// Discard a dead letter permanently
    pub async fn purge_dead_letter(&self, id: MessageId) -> DeliveryResult<()> {
        if !self.inner.dead_letters.remove(id).await? {
            return Err(DeliveryError::MessageNotFound { message_id: id });
        }
        crate::log_bus!(info, "Dead letter purged", message_id: id, correlation_id: None::<String>);
        Ok(())
    }

    /// Delete terminal messages whose last update is older than the TTL.
    ///
    /// Dead letter entries are kept; only the audit copy in `messages` goes.
    pub async fn collect_garbage(&self) -> DeliveryResult<usize> {
        let ttl = chrono::Duration::from_std(self.inner.config.message_ttl())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = self.inner.clock.now() - ttl;
        let mut removed = 0usize;

        for status in [
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
            DeliveryStatus::DeadLettered,
        ] {
            let filter = DocumentFilter::new().field_eq("status", status.to_string());
            let documents = self
                .inner
                .store
                .select(collections::MESSAGES, &filter)
                .await?;
            for document in documents {
                let message: Message = document.decode()?;
                if message.updated_at < cutoff {
                    removed += self
                        .inner
                        .store
                        .delete(collections::MESSAGES, &document.key)
                        .await? as usize;
                }
            }
        }

        if removed > 0 {
            crate::log_bus!(debug, "Expired messages collected", removed: removed);
        }
        Ok(removed)
    }

    pub fn stats(&self) -> BusStats {
        let (pending, in_flight) = {
            let scheduler = self.inner.scheduler.lock();
            (scheduler.pending(), scheduler.in_flight())
        };
        let counters = &self.inner.counters;
        BusStats {
            pending,
            in_flight,
            sent: counters.sent.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            attached_handlers: self.inner.handlers.len(),
            accepting: self.is_accepting(),
        }
    }
}

impl BusInner {
    fn admit(&self, sender: &MessageSource, target: &str) -> DeliveryResult<()> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(DeliveryError::ShuttingDown);
        }
        if !self.registry.contains(target) {
            return Err(DeliveryError::target_not_registered(target));
        }
        if let MessageSource::Module(name) = sender {
            if !self.registry.check_dependency_satisfied(target, name) {
                crate::log_bus!(debug, "Send refused by dependency policy",
                    sender: name,
                    target: target
                );
                return Err(DeliveryError::DependencyNotSatisfied {
                    sender: name.clone(),
                    target: target.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn enqueue(&self, message: Message) -> DeliveryResult<()> {
        let body = serde_json::to_value(&message).map_err(crate::store::StoreError::from)?;
        self.store
            .insert(collections::MESSAGES, &message.id.to_string(), body)
            .await?;

        crate::log_bus!(debug, "Message queued",
            message_id: message.id,
            correlation_id: message.correlation_id,
            sender: message.sender.to_string(),
            target: message.target,
            message_type: message.message_type,
            priority: message.priority
        );

        self.scheduler.lock().enqueue(message);
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        self.work_available.notify_one();
        Ok(())
    }

    async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown: broadcast::Receiver<()>) {
        debug!(worker_id, "📨 BUS: Delivery worker started");
        loop {
            if !matches!(
                shutdown.try_recv(),
                Err(broadcast::error::TryRecvError::Empty)
            ) {
                break;
            }

            let next = self.scheduler.lock().next_ready();
            match next {
                Some(message) => Arc::clone(&self).deliver(message).await,
                None => {
                    tokio::select! {
                        _ = self.work_available.notified() => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }
        debug!(worker_id, "📨 BUS: Delivery worker stopped");
    }

    async fn deliver(self: Arc<Self>, mut message: Message) {
        message.attempts += 1;
        let handler = self
            .handlers
            .get(&message.target)
            .map(|entry| Arc::clone(entry.value()));

        let outcome = match handler {
            Some(handler) => {
                let call = handler.handle(&message.message_type, message.payload.clone());
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::permanent("handler panicked")),
                }
            }
            None if self.registry.contains(&message.target) => Err(HandlerError::transient(
                "module is registered but has no attached handler",
            )),
            None => {
                let error = DeliveryError::target_not_registered(&message.target);
                self.finish_failed(message, error).await;
                return;
            }
        };

        match outcome {
            Ok(reply) => self.finish_delivered(message, reply).await,
            Err(HandlerError::UnknownMessageType(message_type)) => {
                let error = DeliveryError::UnknownMessageType {
                    target: message.target.clone(),
                    message_type,
                };
                self.finish_failed(message, error).await;
            }
            Err(HandlerError::Permanent(reason)) => {
                let error = DeliveryError::rejected(&message.target, reason);
                self.finish_failed(message, error).await;
            }
            Err(HandlerError::Transient(reason)) => {
                self.retry_or_dead_letter(message, reason).await
            }
        }
    }

    async fn finish_delivered(&self, mut message: Message, reply: Value) {
        let now = self.clock.now();
        message.status = DeliveryStatus::Delivered;
        message.reply = Some(reply.clone());
        message.delivered_at = Some(now);
        message.updated_at = now;
        self.persist_logged(&message).await;
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);

        crate::log_bus!(debug, "Message delivered",
            message_id: message.id,
            correlation_id: message.correlation_id,
            target: message.target,
            attempts: message.attempts
        );
        self.settle(&message, Ok(reply));
    }

    async fn finish_failed(&self, mut message: Message, error: DeliveryError) {
        message.status = DeliveryStatus::Failed;
        message.last_error = Some(error.to_string());
        message.updated_at = self.clock.now();
        self.persist_logged(&message).await;
        self.counters.failed.fetch_add(1, Ordering::Relaxed);

        crate::log_bus!(warn, "Message permanently failed",
            message_id: message.id,
            correlation_id: message.correlation_id,
            target: message.target,
            error: error.to_string()
        );
        self.settle(&message, Err(error));
    }

    async fn retry_or_dead_letter(self: Arc<Self>, mut message: Message, reason: String) {
        message.last_error = Some(reason.clone());
        message.updated_at = self.clock.now();

        if message.attempts >= self.config.max_delivery_attempts {
            message.status = DeliveryStatus::DeadLettered;
            self.persist_logged(&message).await;
            let entry = DeadLetter {
                message: message.clone(),
                reason: reason.clone(),
                dead_lettered_at: message.updated_at,
                requeue_count: message.requeues,
            };
            if let Err(error) = self.dead_letters.park(&entry).await {
                warn!(message_id = %message.id, error = %error, "Failed to persist dead letter");
            }
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);

            crate::log_bus!(error, "Message dead-lettered",
                message_id: message.id,
                correlation_id: message.correlation_id,
                target: message.target,
                attempts: message.attempts,
                reason: reason
            );
            let error = DeliveryError::transient(&message.target, reason);
            self.settle(&message, Err(error));
            return;
        }

        self.persist_logged(&message).await;
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        let delay = self.config.backoff.delay_for_retry(message.attempts);

        crate::log_bus!(debug, "Transient failure, retry scheduled",
            message_id: message.id,
            correlation_id: message.correlation_id,
            attempt: message.attempts,
            delay_ms: delay.as_millis()
        );

        let inner = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.scheduler.lock().requeue_front(message);
            inner.work_available.notify_one();
        });
    }

    /// Release the ordering key and answer a synchronous waiter, if any
    fn settle(&self, message: &Message, result: DeliveryResult<Value>) {
        self.scheduler
            .lock()
            .complete(message.id, &message.ordering_key());
        if let Some((_, waiter)) = self.waiters.remove(&message.id) {
            let _ = waiter.send(result);
        }
        self.work_available.notify_one();
    }

    async fn persist(&self, message: &Message) -> DeliveryResult<()> {
        let body = serde_json::to_value(message).map_err(crate::store::StoreError::from)?;
        self.store
            .upsert(collections::MESSAGES, &message.id.to_string(), body)
            .await?;
        Ok(())
    }

    async fn persist_logged(&self, message: &Message) {
        if let Err(error) = self.persist(message).await {
            warn!(message_id = %message.id, error = %error, "Failed to persist message state");
        }
    }
}
