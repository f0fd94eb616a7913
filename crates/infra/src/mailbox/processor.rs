use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::delay::DelayQueue;
use crate::config::MailboxConfig;

/// Items a worker takes from one lane before giving other lanes a turn.
const DRAIN_BATCH: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox {0} is shut down")]
    Closed(String),
}

/// Mailbox runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MailboxStats {
    pub enqueued: u64,
    pub delayed: u64,
    pub processed: u64,
    pub failed: u64,
    /// Accepted items not yet handled (queued, delayed or running).
    pub outstanding: u64,
}

type HandlerFn<T> = dyn Fn(T, &MailboxSender<T>) -> anyhow::Result<()> + Send + Sync;

enum Ready {
    Lane(usize),
    Stop,
}

struct LaneState<T> {
    queue: VecDeque<T>,
    /// A worker owns this lane until it observes the queue empty.
    draining: bool,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delayed: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    outstanding: AtomicU64,
}

struct Shared<T> {
    name: String,
    lanes: Vec<Mutex<LaneState<T>>>,
    ready: mpsc::Sender<Ready>,
    /// Held for reading while an item is handed to a lane; shutdown takes it
    /// for writing, so no lane is signalled after the workers' stop messages.
    closed: RwLock<bool>,
    stopping: AtomicBool,
    delayed: Mutex<DelayQueue<T>>,
    delay_signal: Condvar,
    counters: Counters,
}

impl<T> Shared<T> {
    /// Caller must hold `closed` for reading.
    fn push_lane(&self, lane: usize, item: T) {
        let mut state = self.lanes[lane].lock().unwrap_or_else(PoisonError::into_inner);
        state.queue.push_back(item);
        if !state.draining {
            state.draining = true;
            let _ = self.ready.send(Ready::Lane(lane));
        }
    }

    fn lane_of<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }
}

/// Submission side of a mailbox; cheap to clone.
///
/// Handlers receive one so they can requeue (possibly delayed) follow-up work
/// onto the mailbox that is running them.
pub struct MailboxSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> MailboxSender<T> {
    /// Lane index `key` maps to.
    pub fn lane_of<K: Hash + ?Sized>(&self, key: &K) -> usize {
        self.shared.lane_of(key)
    }

    /// Append `item` to the lane of `key`.
    ///
    /// Items with equal keys are handled one at a time in enqueue order.
    pub fn enqueue<K: Hash + ?Sized>(&self, key: &K, item: T) -> Result<(), MailboxError> {
        let closed = self.shared.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(MailboxError::Closed(self.shared.name.clone()));
        }

        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.shared.counters.outstanding.fetch_add(1, Ordering::Relaxed);
        self.shared.push_lane(self.shared.lane_of(key), item);
        Ok(())
    }

    /// Append `item` to the lane of `key` once `delay` has elapsed.
    ///
    /// Ordering is by arrival in the lane, i.e. after the delay.
    pub fn enqueue_after<K: Hash + ?Sized>(&self, key: &K, item: T, delay: Duration) -> Result<(), MailboxError> {
        if delay.is_zero() {
            return self.enqueue(key, item);
        }

        let closed = self.shared.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(MailboxError::Closed(self.shared.name.clone()));
        }

        self.shared.counters.delayed.fetch_add(1, Ordering::Relaxed);
        self.shared.counters.outstanding.fetch_add(1, Ordering::Relaxed);
        let lane = self.shared.lane_of(key);
        let mut delayed = self.shared.delayed.lock().unwrap_or_else(PoisonError::into_inner);
        delayed.push(Instant::now() + delay, lane, item);
        self.shared.delay_signal.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> MailboxStats {
        let c = &self.shared.counters;
        MailboxStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            delayed: c.delayed.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            outstanding: c.outstanding.load(Ordering::Relaxed),
        }
    }
}

/// Routes items to hash-partitioned, strictly sequential lanes drained by a
/// fixed worker pool.
///
/// ## Ordering
///
/// For one key, an item enqueued before another is fully handled before the
/// other starts. Items of different keys (different lanes) run in parallel
/// up to the worker count. Nothing is promised across keys.
///
/// ## Failures
///
/// A handler error or panic is logged, counted in [`MailboxStats::failed`]
/// and contained to that item; the lane moves on to its next item.
pub struct AggregateMailboxProcessor<T: Send + 'static> {
    sender: MailboxSender<T>,
    workers: Vec<thread::JoinHandle<()>>,
    delay: Option<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> AggregateMailboxProcessor<T> {
    /// Start `config.workers` workers over `config.lanes` lanes.
    pub fn start<F>(name: impl Into<String>, config: &MailboxConfig, handler: F) -> std::io::Result<Self>
    where
        F: Fn(T, &MailboxSender<T>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let (ready_tx, ready_rx) = mpsc::channel::<Ready>();
        let lanes = (0..config.lanes.max(1))
            .map(|_| {
                Mutex::new(LaneState {
                    queue: VecDeque::new(),
                    draining: false,
                })
            })
            .collect();

        let shared = Arc::new(Shared {
            name: name.clone(),
            lanes,
            ready: ready_tx,
            closed: RwLock::new(false),
            stopping: AtomicBool::new(false),
            delayed: Mutex::new(DelayQueue::new()),
            delay_signal: Condvar::new(),
            counters: Counters::default(),
        });

        let mut processor = Self {
            sender: MailboxSender { shared },
            workers: Vec::new(),
            delay: None,
        };

        let handler: Arc<HandlerFn<T>> = Arc::new(handler);
        let ready_rx = Arc::new(Mutex::new(ready_rx));
        for index in 0..config.workers.max(1) {
            let (sender, handler, ready_rx) = (processor.sender.clone(), handler.clone(), ready_rx.clone());
            let worker = thread::Builder::new()
                .name(format!("{name}-worker-{index}"))
                .spawn(move || worker_loop(sender, ready_rx, handler))?;
            processor.workers.push(worker);
        }

        let shared = processor.sender.shared.clone();
        processor.delay = Some(
            thread::Builder::new()
                .name(format!("{name}-delay"))
                .spawn(move || delay_loop(shared))?,
        );

        info!(
            mailbox = %name,
            workers = processor.workers.len(),
            lanes = config.lanes.max(1),
            "mailbox started"
        );
        Ok(processor)
    }

    pub fn sender(&self) -> MailboxSender<T> {
        self.sender.clone()
    }

    pub fn enqueue<K: Hash + ?Sized>(&self, key: &K, item: T) -> Result<(), MailboxError> {
        self.sender.enqueue(key, item)
    }

    pub fn enqueue_after<K: Hash + ?Sized>(&self, key: &K, item: T, delay: Duration) -> Result<(), MailboxError> {
        self.sender.enqueue_after(key, item, delay)
    }

    pub fn stats(&self) -> MailboxStats {
        self.sender.stats()
    }

    /// Block until every accepted item has been handled, or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stats().outstanding == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Stop accepting items, let workers finish what is already in the lanes,
    /// and join them. Items still waiting on a delay are dropped.
    pub fn shutdown(self) {
        drop(self);
    }

    fn stop(&mut self) {
        let shared = &self.sender.shared;
        {
            let mut closed = shared.closed.write().unwrap_or_else(PoisonError::into_inner);
            *closed = true;
            shared.stopping.store(true, Ordering::SeqCst);
            for _ in 0..self.workers.len() {
                let _ = shared.ready.send(Ready::Stop);
            }
        }
        {
            let _delayed = shared.delayed.lock().unwrap_or_else(PoisonError::into_inner);
            shared.delay_signal.notify_all();
        }

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        if let Some(delay) = self.delay.take() {
            let _ = delay.join();
        }
        info!(mailbox = %shared.name, "mailbox stopped");
    }
}

impl<T: Send + 'static> Drop for AggregateMailboxProcessor<T> {
    fn drop(&mut self) {
        if !self.workers.is_empty() || self.delay.is_some() {
            self.stop();
        }
    }
}

fn worker_loop<T: Send + 'static>(
    sender: MailboxSender<T>,
    ready: Arc<Mutex<mpsc::Receiver<Ready>>>,
    handler: Arc<HandlerFn<T>>,
) {
    loop {
        let next = {
            let rx = ready.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv()
        };
        match next {
            Ok(Ready::Lane(lane)) => drain_lane(&sender, lane, handler.as_ref()),
            Ok(Ready::Stop) | Err(_) => break,
        }
    }
}

fn drain_lane<T: Send + 'static>(sender: &MailboxSender<T>, lane: usize, handler: &HandlerFn<T>) {
    let shared = &sender.shared;
    let mut budget = DRAIN_BATCH;

    loop {
        if budget == 0 {
            // Yield the lane (still marked draining) unless shutdown already
            // queued the stop messages; then keep draining here.
            let closed = shared.closed.read().unwrap_or_else(PoisonError::into_inner);
            if !*closed {
                let has_more = !shared.lanes[lane]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .queue
                    .is_empty();
                if has_more {
                    let _ = shared.ready.send(Ready::Lane(lane));
                    return;
                }
            }
            budget = DRAIN_BATCH;
        }

        let item = {
            let mut state = shared.lanes[lane].lock().unwrap_or_else(PoisonError::into_inner);
            match state.queue.pop_front() {
                Some(item) => item,
                None => {
                    state.draining = false;
                    return;
                }
            }
        };
        budget -= 1;

        match catch_unwind(AssertUnwindSafe(|| handler(item, sender))) {
            Ok(Ok(())) => {
                shared.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(mailbox = %shared.name, lane, error = %format!("{err:#}"), "mailbox item failed");
            }
            Err(_) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(mailbox = %shared.name, lane, "mailbox handler panicked");
            }
        }
        shared.counters.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

fn delay_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
    let mut queue = shared.delayed.lock().unwrap_or_else(PoisonError::into_inner);

    loop {
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }

        let now = Instant::now();
        let due = queue.pop_due(now);
        if !due.is_empty() {
            drop(queue);
            let closed = shared.closed.read().unwrap_or_else(PoisonError::into_inner);
            for item in due {
                if *closed {
                    shared.counters.outstanding.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
                debug!(mailbox = %shared.name, lane = item.lane, "delayed item due");
                shared.push_lane(item.lane, item.item);
            }
            drop(closed);
            queue = shared.delayed.lock().unwrap_or_else(PoisonError::into_inner);
            continue;
        }

        queue = match queue.next_deadline() {
            Some(deadline) => {
                shared
                    .delay_signal
                    .wait_timeout(queue, deadline.saturating_duration_since(now))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => shared
                .delay_signal
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }

    if queue.len() > 0 {
        warn!(mailbox = %shared.name, dropped = queue.len(), "mailbox stopped with delayed items");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn test_config(workers: usize, lanes: usize) -> MailboxConfig {
        MailboxConfig::default().with_workers(workers).with_lanes(lanes)
    }

    #[test]
    fn same_key_items_run_in_enqueue_order() {
        let seen: Arc<Mutex<HashMap<u32, Vec<u32>>>> = Arc::default();
        let sink = seen.clone();
        let mailbox = AggregateMailboxProcessor::start("order", &test_config(4, 8), move |(key, n): (u32, u32), _| {
            sink.lock().unwrap().entry(key).or_default().push(n);
            Ok(())
        })
        .unwrap();

        for n in 0..200 {
            for key in 0..5u32 {
                mailbox.enqueue(&key, (key, n)).unwrap();
            }
        }
        assert!(mailbox.wait_idle(Duration::from_secs(5)));

        let seen = seen.lock().unwrap();
        for key in 0..5u32 {
            assert_eq!(seen[&key], (0..200).collect::<Vec<_>>());
        }
        assert_eq!(mailbox.stats().processed, 1000);
    }

    #[test]
    fn same_key_items_never_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let (r, o) = (running.clone(), overlaps.clone());
        let mailbox = AggregateMailboxProcessor::start("overlap", &test_config(4, 4), move |_: u32, _| {
            if r.fetch_add(1, Ordering::SeqCst) > 0 {
                o.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(200));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        for n in 0..100 {
            mailbox.enqueue("one-aggregate", n).unwrap();
        }
        assert!(mailbox.wait_idle(Duration::from_secs(5)));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn different_keys_run_in_parallel() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let mailbox = AggregateMailboxProcessor::start("parallel", &test_config(4, 64), move |_: u32, _| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            r.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        for key in 0..32u32 {
            mailbox.enqueue(&key, key).unwrap();
        }
        assert!(mailbox.wait_idle(Duration::from_secs(5)));
        assert!(peak.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn failing_and_panicking_items_do_not_stall_the_lane() {
        let done = Arc::new(Mutex::new(Vec::new()));
        let sink = done.clone();
        let mailbox = AggregateMailboxProcessor::start("faults", &test_config(1, 1), move |n: u32, _| {
            match n {
                1 => anyhow::bail!("item one fails"),
                2 => panic!("item two panics"),
                _ => {
                    sink.lock().unwrap().push(n);
                    Ok(())
                }
            }
        })
        .unwrap();

        for n in 0..4 {
            mailbox.enqueue(&0u8, n).unwrap();
        }
        assert!(mailbox.wait_idle(Duration::from_secs(5)));

        assert_eq!(*done.lock().unwrap(), vec![0, 3]);
        let stats = mailbox.stats();
        assert_eq!((stats.processed, stats.failed), (2, 2));
    }

    #[test]
    fn handler_can_requeue_with_delay() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mailbox = AggregateMailboxProcessor::start("requeue", &test_config(2, 4), move |n: u32, sender: &MailboxSender<u32>| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                sender.enqueue_after(&n, n, Duration::from_millis(10))?;
            }
            Ok(())
        })
        .unwrap();

        let started = Instant::now();
        mailbox.enqueue(&7u32, 7).unwrap();
        assert!(mailbox.wait_idle(Duration::from_secs(5)));

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(mailbox.stats().delayed, 2);
    }

    #[test]
    fn enqueue_after_shutdown_is_rejected() {
        let mailbox = AggregateMailboxProcessor::start("closed", &test_config(1, 1), |_: u32, _| Ok(())).unwrap();
        let sender = mailbox.sender();
        mailbox.shutdown();

        assert_eq!(sender.enqueue(&1u32, 1), Err(MailboxError::Closed("closed".to_string())));
    }

    #[test]
    fn shutdown_finishes_items_already_in_lanes() {
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let mailbox = AggregateMailboxProcessor::start("drain", &test_config(2, 2), move |_: u32, _| {
            thread::sleep(Duration::from_millis(1));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        for n in 0..50u32 {
            mailbox.enqueue(&(n % 2), n).unwrap();
        }
        mailbox.shutdown();

        assert_eq!(handled.load(Ordering::SeqCst), 50);
    }
}
