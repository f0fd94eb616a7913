//! Bounded inline retry, then indefinite background retry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::types::{ActionError, ActionInfo, ActionOutcome, ActionStats};
use crate::config::RetryPolicy;

/// How often the idle background worker checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    succeeded: AtomicU64,
    queued: AtomicU64,
    background_attempts: AtomicU64,
    pending: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    policy: RetryPolicy,
    queue: mpsc::Sender<ActionInfo>,
    counters: Counters,
}

/// Executes unreliable units of work.
///
/// `try_action` attempts an action up to `max_retry_count` times on the
/// caller's thread. If every attempt fails, the action moves to an unbounded
/// queue drained by a single background worker, which keeps re-pushing it
/// until it succeeds. The caller is never blocked past its inline budget.
///
/// Cloning is cheap; clones share the queue and statistics.
#[derive(Debug, Clone)]
pub struct ActionExecutor {
    shared: Arc<Shared>,
}

/// Handle to the background retry worker.
///
/// Dropping the handle also stops the worker, without joining it.
#[derive(Debug)]
pub struct ActionExecutorHandle {
    executor: ActionExecutor,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ActionExecutorHandle {
    pub fn executor(&self) -> ActionExecutor {
        self.executor.clone()
    }

    /// Stop the background worker and wait for it.
    ///
    /// Actions still queued are discarded (and logged).
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl ActionExecutor {
    /// Start an executor and its background retry worker.
    pub fn spawn(policy: RetryPolicy) -> std::io::Result<ActionExecutorHandle> {
        let (queue_tx, queue_rx) = mpsc::channel::<ActionInfo>();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let executor = ActionExecutor {
            shared: Arc::new(Shared {
                policy,
                queue: queue_tx,
                counters: Counters::default(),
            }),
        };

        let worker = executor.clone();
        let join = thread::Builder::new()
            .name("eventlane-action-retry".to_string())
            .spawn(move || background_loop(worker, queue_rx, shutdown_rx))?;

        Ok(ActionExecutorHandle {
            executor,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    /// Run `info` with bounded inline retry; queue it for background retry
    /// when the budget is exhausted.
    ///
    /// On success the continuation (if any) is dispatched the same way.
    pub fn try_action(&self, mut info: ActionInfo) -> ActionOutcome {
        let budget = info
            .max_retry_count
            .unwrap_or(self.shared.policy.max_retry_count);

        for attempt in 1..=budget {
            self.shared.counters.attempts.fetch_add(1, Ordering::Relaxed);
            match info.attempt() {
                Ok(()) => {
                    self.shared.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        debug!(action = %info.name, attempt, "action succeeded after retry");
                    }
                    self.dispatch_next(&mut info);
                    return ActionOutcome::Succeeded;
                }
                Err(err) => {
                    debug!(action = %info.name, attempt, error = %err, "action attempt failed");
                    if attempt < budget && !self.shared.policy.inline_delay.is_zero() {
                        thread::sleep(self.shared.policy.inline_delay);
                    }
                }
            }
        }

        warn!(
            action = %info.name,
            attempts = budget,
            "inline retries exhausted, queueing for background retry"
        );
        self.shared.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.push_background(info);
        ActionOutcome::Queued
    }

    /// Attempt `action` up to `max_retry_count` times and report the verdict.
    ///
    /// Nothing is queued: a `false` result is final for this call.
    pub fn try_recursively<F>(&self, name: &str, mut action: F, max_retry_count: u32) -> bool
    where
        F: FnMut() -> Result<(), ActionError>,
    {
        for attempt in 1..=max_retry_count {
            self.shared.counters.attempts.fetch_add(1, Ordering::Relaxed);
            match action() {
                Ok(()) => {
                    self.shared.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(err) => {
                    debug!(action = name, attempt, error = %err, "action attempt failed");
                    if attempt < max_retry_count && !self.shared.policy.inline_delay.is_zero() {
                        thread::sleep(self.shared.policy.inline_delay);
                    }
                }
            }
        }
        warn!(action = name, attempts = max_retry_count, "action failed, giving up");
        false
    }

    pub fn stats(&self) -> ActionStats {
        let c = &self.shared.counters;
        ActionStats {
            attempts: c.attempts.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            background_attempts: c.background_attempts.load(Ordering::Relaxed),
            pending: c.pending.load(Ordering::Relaxed),
        }
    }

    fn dispatch_next(&self, info: &mut ActionInfo) {
        if let Some(next) = info.next.take() {
            self.try_action(*next);
        }
    }

    fn push_background(&self, info: ActionInfo) {
        self.shared.counters.pending.fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::SendError(info)) = self.shared.queue.send(info) {
            self.shared.counters.pending.fetch_sub(1, Ordering::Relaxed);
            error!(action = %info.name, "background retry queue closed, action dropped");
        }
    }
}

fn background_loop(executor: ActionExecutor, queue: mpsc::Receiver<ActionInfo>, shutdown: mpsc::Receiver<()>) {
    info!("action retry worker started");

    loop {
        if !matches!(shutdown.try_recv(), Err(mpsc::TryRecvError::Empty)) {
            break;
        }

        let mut info = match queue.recv_timeout(POLL_INTERVAL) {
            Ok(info) => info,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        let counters = &executor.shared.counters;
        counters.pending.fetch_sub(1, Ordering::Relaxed);
        counters.attempts.fetch_add(1, Ordering::Relaxed);
        counters.background_attempts.fetch_add(1, Ordering::Relaxed);

        match info.attempt() {
            Ok(()) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(action = %info.name, "background retry succeeded");
                executor.dispatch_next(&mut info);
            }
            Err(err) => {
                debug!(action = %info.name, error = %err, "background retry failed");
                let stop = !matches!(
                    shutdown.recv_timeout(executor.shared.policy.background_delay),
                    Err(mpsc::RecvTimeoutError::Timeout)
                );
                executor.push_background(info);
                if stop {
                    break;
                }
            }
        }
    }

    let pending = executor.shared.counters.pending.load(Ordering::Relaxed);
    if pending > 0 {
        warn!(pending, "action retry worker stopped with actions still queued");
    }
    info!("action retry worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::Instant;

    use super::*;

    fn test_policy(max_retry_count: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retry_count(max_retry_count)
            .with_background_delay(Duration::from_millis(5))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn action_failing_fewer_times_than_budget_runs_n_plus_one_times() {
        let handle = ActionExecutor::spawn(test_policy(3)).unwrap();
        let executor = handle.executor();
        let calls = Arc::new(AtomicU32::new(0));

        let counted = calls.clone();
        let outcome = executor.try_action(ActionInfo::new("flaky", move || {
            let n = counted.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err(ActionError::failed("not yet")) } else { Ok(()) }
        }));

        assert_eq!(outcome, ActionOutcome::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.stats().queued, 0);
        handle.shutdown();
    }

    #[test]
    fn always_failing_action_moves_to_background_until_forced_success() {
        let handle = ActionExecutor::spawn(test_policy(3)).unwrap();
        let executor = handle.executor();
        let allow = Arc::new(AtomicBool::new(false));
        let callers = Arc::new(Mutex::new(Vec::new()));

        let (gate, seen) = (allow.clone(), callers.clone());
        let outcome = executor.try_action(ActionInfo::new("stubborn", move || {
            seen.lock().unwrap().push(thread::current().id());
            if gate.load(Ordering::SeqCst) { Ok(()) } else { Err(ActionError::failed("down")) }
        }));
        assert_eq!(outcome, ActionOutcome::Queued);

        // Unrelated actions are not held up by the queued one.
        assert_eq!(
            executor.try_action(ActionInfo::new("unrelated", || Ok(()))),
            ActionOutcome::Succeeded
        );

        assert!(wait_until(|| executor.stats().background_attempts >= 2));
        allow.store(true, Ordering::SeqCst);
        assert!(wait_until(|| executor.stats().succeeded == 2 && executor.stats().pending == 0));

        let me = thread::current().id();
        let inline = callers.lock().unwrap().iter().filter(|id| **id == me).count();
        assert_eq!(inline, 3);
        assert_eq!(executor.stats().queued, 1);
        handle.shutdown();
    }

    #[test]
    fn continuation_runs_after_predecessor_succeeds() {
        let handle = ActionExecutor::spawn(test_policy(3)).unwrap();
        let executor = handle.executor();
        let order = Arc::new(Mutex::new(Vec::new()));
        let first_failures = Arc::new(AtomicU32::new(0));

        let (o1, o2, failures) = (order.clone(), order.clone(), first_failures.clone());
        let info = ActionInfo::new("handle", move || {
            if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ActionError::failed("first attempt fails"));
            }
            o1.lock().unwrap().push("handle");
            Ok(())
        })
        .then(ActionInfo::new("advance", move || {
            o2.lock().unwrap().push("advance");
            Ok(())
        }));

        assert_eq!(executor.try_action(info), ActionOutcome::Succeeded);
        assert_eq!(*order.lock().unwrap(), vec!["handle", "advance"]);
        handle.shutdown();
    }

    #[test]
    fn continuation_of_background_action_runs_once_it_succeeds() {
        let handle = ActionExecutor::spawn(test_policy(1)).unwrap();
        let executor = handle.executor();
        let ran = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicU32::new(0));

        let (flag, counter) = (ran.clone(), attempts.clone());
        let info = ActionInfo::new("slow", move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(ActionError::failed("later"))
            } else {
                Ok(())
            }
        })
        .then(ActionInfo::new("after", move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }));

        assert_eq!(executor.try_action(info), ActionOutcome::Queued);
        assert!(!ran.load(Ordering::SeqCst));
        assert!(wait_until(|| ran.load(Ordering::SeqCst)));
        handle.shutdown();
    }

    #[test]
    fn try_recursively_reports_verdict_without_queueing() {
        let handle = ActionExecutor::spawn(test_policy(3)).unwrap();
        let executor = handle.executor();
        let mut calls = 0;

        let ok = executor.try_recursively(
            "connect",
            || {
                calls += 1;
                Err(ActionError::failed("refused"))
            },
            4,
        );

        assert!(!ok);
        assert_eq!(calls, 4);
        assert_eq!(executor.stats().queued, 0);
        assert!(executor.try_recursively("connect", || Ok(()), 1));
        handle.shutdown();
    }
}
