//! # Delivery Scheduler
//!
//! In-memory queueing state behind the bus workers.
//!
//! Each ordering key has its own FIFO queue. A key is either idle, waiting in the
//! ready heap, or in flight; it is never in the heap twice and never delivered by
//! two workers at once. The ready heap orders keys by the priority of their head
//! message, then by arrival sequence.
//!
//! All methods are synchronous and meant to be called under a short
//! `parking_lot::Mutex` critical section.

use super::message::{Message, MessageId, MessagePriority, OrderingKey};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

#[derive(Debug)]
struct QueuedMessage {
    sequence: u64,
    message: Message,
}

#[derive(Debug, PartialEq, Eq)]
struct ReadyKey {
    priority: MessagePriority,
    sequence: u64,
    key: OrderingKey,
}

impl Ord for ReadyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, then lower sequence
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    queues: HashMap<OrderingKey, VecDeque<QueuedMessage>>,
    ready: BinaryHeap<ReadyKey>,
    /// Keys currently in `ready` or in flight
    scheduled: HashSet<OrderingKey>,
    in_flight: HashSet<OrderingKey>,
    /// Messages queued, in flight or waiting out a retry backoff
    tracked: HashSet<MessageId>,
    next_sequence: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the back of its key's queue
    pub fn enqueue(&mut self, message: Message) {
        self.tracked.insert(message.id);
        let key = message.ordering_key();
        let sequence = self.bump_sequence();
        self.queues
            .entry(key.clone())
            .or_default()
            .push_back(QueuedMessage { sequence, message });
        self.schedule_if_idle(key);
    }

    /// Enqueue a message reloaded from the store unless this scheduler already
    /// holds it. Returns whether it was added.
    pub fn recover(&mut self, message: Message) -> bool {
        if self.tracked.contains(&message.id) {
            return false;
        }
        self.enqueue(message);
        true
    }

    /// Put a message back at the front of its key's queue and release the key.
    ///
    /// Used after a retry backoff; the key stays in flight until this is called
    /// so no later message on the same key can overtake the retried one.
    pub fn requeue_front(&mut self, message: Message) {
        let key = message.ordering_key();
        let sequence = self.bump_sequence();
        self.queues
            .entry(key.clone())
            .or_default()
            .push_front(QueuedMessage { sequence, message });
        self.in_flight.remove(&key);
        self.scheduled.remove(&key);
        self.schedule_if_idle(key);
    }

    /// Take the highest priority ready message and mark its key in flight
    pub fn next_ready(&mut self) -> Option<Message> {
        while let Some(ready) = self.ready.pop() {
            let Some(queue) = self.queues.get_mut(&ready.key) else {
                self.scheduled.remove(&ready.key);
                continue;
            };
            match queue.pop_front() {
                Some(queued) => {
                    self.in_flight.insert(ready.key);
                    return Some(queued.message);
                }
                None => {
                    self.queues.remove(&ready.key);
                    self.scheduled.remove(&ready.key);
                }
            }
        }
        None
    }

    /// Release a key after its in-flight message reached a terminal state
    pub fn complete(&mut self, message_id: MessageId, key: &OrderingKey) {
        self.tracked.remove(&message_id);
        self.in_flight.remove(key);
        self.scheduled.remove(key);
        let has_more = self.queues.get(key).is_some_and(|q| !q.is_empty());
        if has_more {
            self.schedule_if_idle(key.clone());
        } else {
            self.queues.remove(key);
        }
    }

    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0 && self.in_flight.is_empty()
    }

    fn schedule_if_idle(&mut self, key: OrderingKey) {
        if self.scheduled.contains(&key) {
            return;
        }
        let Some(head) = self.queues.get(&key).and_then(VecDeque::front) else {
            return;
        };
        self.ready.push(ReadyKey {
            priority: head.message.priority,
            sequence: head.sequence,
            key: key.clone(),
        });
        self.scheduled.insert(key);
    }

    fn bump_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}
