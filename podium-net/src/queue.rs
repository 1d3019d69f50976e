//! Message reliability queue for the performer.
//!
//! Messages from the conductor land here before they reach the UI. A single
//! consumer drains the queue in priority order and drops anything stale,
//! already seen, or overtaken by a newer message. Page and file changes that
//! fail to apply are retried a few times with a growing delay.

use std::collections::VecDeque;
use std::error::Error;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lru::LruCache;

use podium_types::now_millis;

use crate::config::QueueConfig;
use crate::sync::lock;

/// What a queued message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PageChange,
    FileChange,
    Pointer,
    Annotation,
    ConnectionStatus,
    BackToList,
}

impl MessageKind {
    /// Only page and file changes are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(self, MessageKind::PageChange | MessageKind::FileChange)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: String,
    pub kind: MessageKind,
    /// JSON text of the control message as received.
    pub payload: String,
    /// Epoch milliseconds.
    pub enqueued_at: u64,
    pub retry_count: u32,
    pub priority: Priority,
}

impl QueuedMessage {
    pub fn new(kind: MessageKind, payload: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload: payload.into(),
            enqueued_at: now_millis(),
            retry_count: 0,
            priority,
        }
    }

    /// Use a caller-chosen id, so repeats of the same message de-duplicate.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_enqueued_at(mut self, millis: u64) -> Self {
        self.enqueued_at = millis;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_size: usize,
    pub total_processed: u64,
    pub total_dropped: u64,
    pub total_retried: u64,
    pub last_processing_time: Duration,
}

/// What happened to the message taken by [`MessageQueue::process_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Expired,
    Duplicate,
    OutOfOrder,
    /// The handler failed and the message was scheduled again.
    Retrying,
    /// The handler failed and the message was dropped.
    Failed,
}

pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Applies a delivered message. An error triggers the retry policy.
pub trait MessageHandler: Send {
    fn handle(&mut self, message: &QueuedMessage) -> HandlerResult;
}

impl<F> MessageHandler for F
where
    F: FnMut(&QueuedMessage) -> HandlerResult + Send,
{
    fn handle(&mut self, message: &QueuedMessage) -> HandlerResult {
        self(message)
    }
}

struct State {
    pending: VecDeque<QueuedMessage>,
    /// Retries waiting for their backoff to elapse.
    delayed: Vec<(Instant, QueuedMessage)>,
    seen: LruCache<String, u64>,
    last_processed: u64,
    stats: QueueStats,
    last_maintenance: Instant,
    /// Bumped by `clear` and `stop_processing`; retries from an older
    /// generation are discarded.
    generation: u64,
}

struct Shared {
    config: QueueConfig,
    state: Mutex<State>,
    ready: Condvar,
    processing: AtomicBool,
    stats_sink: Mutex<Option<StatsSink>>,
}

type StatsSink = Box<dyn Fn(QueueStats) + Send>;

pub struct MessageQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> Self {
        let capacity = NonZeroUsize::new(config.dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    delayed: Vec::new(),
                    seen: LruCache::new(capacity),
                    last_processed: 0,
                    stats: QueueStats::default(),
                    last_maintenance: Instant::now(),
                    generation: 0,
                }),
                ready: Condvar::new(),
                processing: AtomicBool::new(false),
                stats_sink: Mutex::new(None),
                config,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Receive a stats snapshot on every maintenance pass.
    pub fn set_stats_sink<F>(&self, sink: F)
    where
        F: Fn(QueueStats) + Send + 'static,
    {
        *lock(&self.shared.stats_sink) = Some(Box::new(sink));
    }

    /// Add a message. Returns false if it was dropped for lack of room.
    pub fn enqueue(&self, message: QueuedMessage) -> bool {
        let accepted = {
            let mut state = lock(&self.shared.state);
            self.shared.place(&mut state, message)
        };
        if accepted {
            self.shared.ready.notify_one();
        }
        accepted
    }

    /// Take one message, waiting up to `timeout`, and run it through
    /// validation and `handler`. `None` if nothing arrived in time.
    pub fn process_next(&self, handler: &mut dyn MessageHandler, timeout: Duration) -> Option<Outcome> {
        self.shared.process_next(handler, timeout)
    }

    /// Spawn the consumer thread. Ignored if already running.
    pub fn start_processing<H: MessageHandler + 'static>(&self, mut handler: H) {
        if self.shared.processing.swap(true, Ordering::SeqCst) {
            log::warn!(target: "podium::queue", "message processing already started");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("queue-consumer".into())
            .spawn(move || {
                log::debug!(target: "podium::queue", "message processing started");
                while shared.processing.load(Ordering::SeqCst) {
                    shared.process_next(&mut handler, shared.config.poll_timeout);
                    shared.maintain();
                }
                log::debug!(target: "podium::queue", "message processing stopped");
            })
            .expect("failed to spawn queue-consumer thread");
        *lock(&self.worker) = Some(handle);
    }

    /// Stop the consumer and cancel pending retries. Blocks until the
    /// consumer has finished its current message.
    pub fn stop_processing(&self) {
        self.shared.processing.store(false, Ordering::SeqCst);
        {
            let mut state = lock(&self.shared.state);
            state.delayed.clear();
            state.generation += 1;
        }
        self.shared.ready.notify_all();

        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                log::error!(target: "podium::queue", "queue-consumer thread panicked");
            }
        }
    }

    pub fn is_processing(&self) -> bool {
        self.shared.processing.load(Ordering::SeqCst)
    }

    /// Empty the queue, cancel retries, forget seen ids and reset ordering.
    pub fn clear(&self) {
        let mut state = lock(&self.shared.state);
        state.pending.clear();
        state.delayed.clear();
        state.seen.clear();
        state.last_processed = 0;
        state.generation += 1;
        log::debug!(target: "podium::queue", "message queue cleared");
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_processed_timestamp(&self) -> u64 {
        lock(&self.shared.state).last_processed
    }

    pub fn stats(&self) -> QueueStats {
        let state = lock(&self.shared.state);
        QueueStats {
            queue_size: state.pending.len(),
            ..state.stats.clone()
        }
    }

    pub fn reset_stats(&self) {
        lock(&self.shared.state).stats = QueueStats::default();
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        self.stop_processing();
    }
}

impl Shared {
    fn place(&self, state: &mut State, message: QueuedMessage) -> bool {
        match message.priority {
            Priority::High => {
                let (mut keep, low): (VecDeque<_>, VecDeque<_>) =
                    state.pending.drain(..).partition(|m| m.priority != Priority::Low);
                keep.push_front(message);
                keep.extend(low);
                state.pending = keep;
            }
            Priority::Normal => state.pending.push_back(message),
            Priority::Low => {
                if state.pending.len() >= self.config.max_queue_size {
                    log::warn!(target: "podium::queue", "dropping low priority message, queue full");
                    state.stats.total_dropped += 1;
                    return false;
                }
                state.pending.push_back(message);
            }
        }
        true
    }

    /// Move retries whose delay has passed back into the queue. Returns the
    /// earliest remaining due time.
    fn promote_due(&self, state: &mut State) -> Option<Instant> {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) = state.delayed.drain(..).partition(|(at, _)| *at <= now);
        state.delayed = later;
        for (_, message) in due {
            self.place(state, message);
        }
        state.delayed.iter().map(|(at, _)| *at).min()
    }

    fn take(&self, timeout: Duration) -> Option<(QueuedMessage, u64)> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            let next_retry = self.promote_due(&mut state);
            if let Some(message) = state.pending.pop_front() {
                return Some((message, state.generation));
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let mut wait = deadline - now;
            if let Some(at) = next_retry {
                wait = wait.min(at.saturating_duration_since(now));
            }
            state = self
                .ready
                .wait_timeout(state, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn validate(&self, state: &State, message: &QueuedMessage) -> Option<Outcome> {
        let now = now_millis();
        let ttl = self.config.ttl.as_millis() as u64;
        let tolerance = self.config.out_of_order_tolerance.as_millis() as u64;

        if now.saturating_sub(message.enqueued_at) > ttl {
            Some(Outcome::Expired)
        } else if state.seen.contains(&message.id) {
            Some(Outcome::Duplicate)
        } else if message.enqueued_at.saturating_add(tolerance) < state.last_processed {
            Some(Outcome::OutOfOrder)
        } else {
            None
        }
    }

    fn process_next(&self, handler: &mut dyn MessageHandler, timeout: Duration) -> Option<Outcome> {
        let (message, generation) = self.take(timeout)?;

        {
            let mut state = lock(&self.state);
            if let Some(outcome) = self.validate(&state, &message) {
                log::debug!(
                    target: "podium::queue",
                    "dropping {:?} message {}: {:?}",
                    message.kind, message.id, outcome
                );
                state.stats.total_dropped += 1;
                return Some(outcome);
            }
        }

        let started = Instant::now();
        let result = handler.handle(&message);
        let elapsed = started.elapsed();

        let mut state = lock(&self.state);
        match result {
            Ok(()) => {
                state.last_processed = message.enqueued_at;
                state.seen.put(message.id.clone(), now_millis());
                state.stats.total_processed += 1;
                state.stats.last_processing_time = elapsed;
                log::debug!(target: "podium::queue", "message {} processed in {:?}", message.id, elapsed);
                Some(Outcome::Delivered)
            }
            Err(e) => {
                log::warn!(target: "podium::queue", "handler failed for message {}: {}", message.id, e);
                let retryable = message.priority == Priority::High
                    && message.kind.is_retryable()
                    && message.retry_count < self.config.max_retries;
                if retryable && state.generation == generation {
                    let delay = self.config.retry_backoff * (message.retry_count + 1);
                    let retry = QueuedMessage {
                        retry_count: message.retry_count + 1,
                        ..message
                    };
                    log::debug!(
                        target: "podium::queue",
                        "retrying message {} (attempt {}) in {:?}",
                        retry.id, retry.retry_count, delay
                    );
                    state.delayed.push((Instant::now() + delay, retry));
                    state.stats.total_retried += 1;
                    Some(Outcome::Retrying)
                } else {
                    state.stats.total_dropped += 1;
                    Some(Outcome::Failed)
                }
            }
        }
    }

    /// Periodic TTL sweep and stats publication.
    fn maintain(&self) {
        let stats = {
            let mut state = lock(&self.state);
            if state.last_maintenance.elapsed() < self.config.maintenance_interval {
                return;
            }
            state.last_maintenance = Instant::now();

            let now = now_millis();
            let ttl = self.config.ttl.as_millis() as u64;
            let before = state.pending.len();
            state.pending.retain(|m| now.saturating_sub(m.enqueued_at) <= ttl);
            let expired = before - state.pending.len();
            if expired > 0 {
                state.stats.total_dropped += expired as u64;
                log::debug!(target: "podium::queue", "cleaned up {} expired messages", expired);
            }

            QueueStats {
                queue_size: state.pending.len(),
                ..state.stats.clone()
            }
        };

        if let Some(sink) = lock(&self.stats_sink).as_ref() {
            sink(stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;

    fn queue() -> MessageQueue {
        MessageQueue::new(NetConfig::default().queue)
    }

    fn page(id: &str, priority: Priority) -> QueuedMessage {
        QueuedMessage::new(MessageKind::PageChange, id, priority).with_id(id)
    }

    fn collect(queue: &MessageQueue) -> (Vec<String>, Vec<Outcome>) {
        let mut delivered = Vec::new();
        let mut outcomes = Vec::new();
        let mut handler = |m: &QueuedMessage| -> HandlerResult {
            delivered.push(m.id.clone());
            Ok(())
        };
        while let Some(outcome) = queue.process_next(&mut handler, Duration::from_millis(10)) {
            outcomes.push(outcome);
        }
        (delivered, outcomes)
    }

    #[test]
    fn duplicate_id_is_delivered_once() {
        let q = queue();
        q.enqueue(page("a", Priority::High));
        q.enqueue(page("a", Priority::High));
        let (delivered, outcomes) = collect(&q);
        assert_eq!(delivered, vec!["a"]);
        assert_eq!(outcomes, vec![Outcome::Delivered, Outcome::Duplicate]);
        assert_eq!(q.stats().total_dropped, 1);
    }

    #[test]
    fn expired_message_is_dropped() {
        let q = queue();
        q.enqueue(page("old", Priority::High).with_enqueued_at(now_millis() - 31_000));
        let (delivered, outcomes) = collect(&q);
        assert!(delivered.is_empty());
        assert_eq!(outcomes, vec![Outcome::Expired]);
        assert_eq!(q.stats().total_dropped, 1);
    }

    #[test]
    fn maintenance_sweeps_expired_pending_messages() {
        let mut config = NetConfig::default().queue;
        config.maintenance_interval = Duration::ZERO;
        let q = MessageQueue::new(config);

        let published = Arc::new(Mutex::new(Vec::new()));
        {
            let published = Arc::clone(&published);
            q.set_stats_sink(move |stats| published.lock().unwrap().push(stats));
        }

        q.enqueue(page("stale", Priority::Normal).with_enqueued_at(now_millis() - 31_000));
        q.enqueue(page("fresh", Priority::Normal));
        q.shared.maintain();

        assert_eq!(q.len(), 1);
        assert_eq!(q.stats().total_dropped, 1);
        let published = published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].queue_size, 1);
        assert_eq!(published[0].total_dropped, 1);

        let (delivered, _) = collect(&q);
        assert_eq!(delivered, vec!["fresh"]);
    }

    #[test]
    fn out_of_order_tolerance() {
        let now = now_millis();

        let q = queue();
        q.enqueue(page("new", Priority::Normal).with_enqueued_at(now));
        q.enqueue(page("late", Priority::Normal).with_enqueued_at(now - 400));
        let (delivered, _) = collect(&q);
        assert_eq!(delivered, vec!["new", "late"]);

        let q = queue();
        q.enqueue(page("new", Priority::Normal).with_enqueued_at(now));
        q.enqueue(page("stale", Priority::Normal).with_enqueued_at(now - 600));
        let (delivered, outcomes) = collect(&q);
        assert_eq!(delivered, vec!["new"]);
        assert_eq!(outcomes[1], Outcome::OutOfOrder);
        assert_eq!(q.last_processed_timestamp(), now);
    }

    #[test]
    fn high_priority_jumps_ahead_and_low_sinks() {
        let q = queue();
        q.enqueue(page("n1", Priority::Normal));
        q.enqueue(page("l1", Priority::Low));
        q.enqueue(page("n2", Priority::Normal));
        q.enqueue(page("h1", Priority::High));
        let (delivered, _) = collect(&q);
        assert_eq!(delivered, vec!["h1", "n1", "n2", "l1"]);
    }

    #[test]
    fn low_priority_dropped_when_full() {
        let mut config = NetConfig::default().queue;
        config.max_queue_size = 2;
        let q = MessageQueue::new(config);
        assert!(q.enqueue(page("a", Priority::Normal)));
        assert!(q.enqueue(page("b", Priority::Normal)));
        assert!(!q.enqueue(page("c", Priority::Low)));
        assert!(q.enqueue(page("d", Priority::Normal)));
        assert_eq!(q.len(), 3);
        assert_eq!(q.stats().total_dropped, 1);
    }

    #[test]
    fn failed_page_change_is_retried_then_dropped() {
        let mut config = NetConfig::default().queue;
        config.retry_backoff = Duration::from_millis(5);
        let q = MessageQueue::new(config);
        q.enqueue(page("p", Priority::High));

        let mut attempts = Vec::new();
        let mut handler = |m: &QueuedMessage| -> HandlerResult {
            attempts.push(m.retry_count);
            Err("render failed".into())
        };
        let mut outcomes = Vec::new();
        while let Some(outcome) = q.process_next(&mut handler, Duration::from_millis(100)) {
            outcomes.push(outcome);
        }

        assert_eq!(attempts, vec![0, 1, 2, 3]);
        assert_eq!(
            outcomes,
            vec![Outcome::Retrying, Outcome::Retrying, Outcome::Retrying, Outcome::Failed]
        );
        let stats = q.stats();
        assert_eq!(stats.total_retried, 3);
        assert_eq!(stats.total_dropped, 1);
    }

    #[test]
    fn normal_priority_is_not_retried() {
        let q = queue();
        q.enqueue(QueuedMessage::new(MessageKind::BackToList, "{}", Priority::Normal));
        let mut handler = |_: &QueuedMessage| -> HandlerResult { Err("no".into()) };
        assert_eq!(
            q.process_next(&mut handler, Duration::from_millis(10)),
            Some(Outcome::Failed)
        );
        assert_eq!(q.process_next(&mut handler, Duration::from_millis(10)), None);
    }

    #[test]
    fn clear_cancels_retries_and_resets_ordering() {
        let q = queue();
        q.enqueue(page("done", Priority::Normal));
        assert_eq!(collect(&q).0, vec!["done"]);

        q.enqueue(page("p", Priority::High));
        let mut handler = |_: &QueuedMessage| -> HandlerResult { Err("no".into()) };
        assert_eq!(
            q.process_next(&mut handler, Duration::from_millis(10)),
            Some(Outcome::Retrying)
        );

        q.clear();
        assert_eq!(q.process_next(&mut handler, Duration::from_millis(300)), None);
        assert_eq!(q.last_processed_timestamp(), 0);

        q.enqueue(page("done", Priority::Normal));
        assert_eq!(collect(&q).0, vec!["done"]);
    }

    #[test]
    fn consumer_thread_delivers_and_publishes_stats() {
        let mut config = NetConfig::default().queue;
        config.poll_timeout = Duration::from_millis(10);
        config.maintenance_interval = Duration::from_millis(20);
        let q = MessageQueue::new(config);

        let (stats_tx, stats_rx) = crossbeam_channel::unbounded();
        q.set_stats_sink(move |stats| {
            let _ = stats_tx.send(stats);
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        q.start_processing(move |m: &QueuedMessage| -> HandlerResult {
            tx.send(m.id.clone())?;
            Ok(())
        });
        q.enqueue(page("x", Priority::High));

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "x");
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let stats = stats_rx.recv_timeout(Duration::from_secs(2)).unwrap();
            if stats.total_processed == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "stats never showed the delivery");
        }

        q.stop_processing();
        assert!(!q.is_processing());
        q.reset_stats();
        assert_eq!(q.stats(), QueueStats::default());
    }
}
