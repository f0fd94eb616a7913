use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use eventlane_events::{CommandResult, ReplyType};

use super::ReplySink;
use super::transport::{ReplyConnection, ReplyConnector, TcpReplyConnector, encode_reply_frame, resolve_address};
use crate::actions::{ActionError, ActionExecutor};
use crate::config::ReplyConfig;

struct PooledConnection {
    connection: Box<dyn ReplyConnection>,
    last_used: Instant,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

/// Reply delivery statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplyStats {
    pub sent: u64,
    /// Sends that failed on an established connection.
    pub failed: u64,
    /// Replies discarded before sending (bad address, unreachable caller).
    pub dropped: u64,
    pub evicted: u64,
}

struct ServiceInner {
    connector: Arc<dyn ReplyConnector>,
    executor: ActionExecutor,
    config: ReplyConfig,
    pool: Mutex<HashMap<String, PooledConnection>>,
    counters: Counters,
}

impl ServiceInner {
    fn evict_stale(&self) -> usize {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let before = pool.len();
        pool.retain(|address, pooled| {
            if !pooled.connection.is_connected() {
                debug!(address = %address, "evicting disconnected reply connection");
                false
            } else if pooled.last_used.elapsed() > self.config.idle_timeout {
                debug!(address = %address, "evicting idle reply connection");
                false
            } else {
                true
            }
        });
        let evicted = before - pool.len();
        self.counters.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }
}

/// Sends command outcomes back to callers over pooled, address-keyed
/// connections.
///
/// Replies are one-way. Only connection establishment is retried
/// (`connect_retry_count` attempts); a failed send is logged and the
/// connection dropped, leaving the caller to time out. A sweep thread evicts
/// connections that are disconnected or idle past `idle_timeout`; the next
/// reply to that address reconnects.
pub struct ReplyDeliveryService {
    inner: Arc<ServiceInner>,
    sweeper_shutdown: Option<mpsc::Sender<()>>,
    sweeper: Option<thread::JoinHandle<()>>,
}

impl ReplyDeliveryService {
    /// Start a TCP reply service with the connector timeouts from `config`.
    pub fn start_tcp(executor: ActionExecutor, config: ReplyConfig) -> std::io::Result<Self> {
        let connector = Arc::new(TcpReplyConnector::from_config(&config));
        Self::start(connector, executor, config)
    }

    /// Start the service and its eviction sweep.
    pub fn start(
        connector: Arc<dyn ReplyConnector>,
        executor: ActionExecutor,
        config: ReplyConfig,
    ) -> std::io::Result<Self> {
        let inner = Arc::new(ServiceInner {
            connector,
            executor,
            config,
            pool: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        });

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sweep = inner.clone();
        let sweeper = thread::Builder::new()
            .name("eventlane-reply-sweep".to_string())
            .spawn(move || {
                let interval = sweep.config.scan_interval;
                while let Err(mpsc::RecvTimeoutError::Timeout) = shutdown_rx.recv_timeout(interval) {
                    let evicted = sweep.evict_stale();
                    if evicted > 0 {
                        info!(evicted, "reply connections evicted");
                    }
                }
            })?;

        Ok(Self {
            inner,
            sweeper_shutdown: Some(shutdown_tx),
            sweeper: Some(sweeper),
        })
    }

    /// Deliver one reply; never blocks longer than the connect and send budgets.
    pub fn send_reply(&self, reply_type: ReplyType, result: &CommandResult, address: &str) {
        let inner = &self.inner;

        if let Err(err) = resolve_address(address) {
            inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(address, command_id = %result.command_id, error = %err, "dropping reply to malformed address");
            return;
        }

        let frame = match encode_reply_frame(reply_type, result) {
            Ok(frame) => frame,
            Err(err) => {
                inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(address, command_id = %result.command_id, error = %err, "dropping unencodable reply");
                return;
            }
        };

        // Take the connection out so the pool lock is not held across IO.
        let pooled = inner
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);

        let mut connection = match pooled {
            Some(pooled) => pooled.connection,
            None => {
                let mut opened = None;
                let connected = inner.executor.try_recursively(
                    "reply_connect",
                    || {
                        opened = Some(inner.connector.connect(address).map_err(ActionError::failed)?);
                        Ok(())
                    },
                    inner.config.connect_retry_count,
                );
                match opened {
                    Some(connection) if connected => connection,
                    _ => {
                        inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(address, command_id = %result.command_id, "caller unreachable, reply dropped");
                        return;
                    }
                }
            }
        };

        match connection.send(&frame) {
            Ok(()) => {
                inner.counters.sent.fetch_add(1, Ordering::Relaxed);
                debug!(address, command_id = %result.command_id, reply_type = ?reply_type, "reply sent");
                inner.pool.lock().unwrap_or_else(PoisonError::into_inner).insert(
                    address.to_string(),
                    PooledConnection {
                        connection,
                        last_used: Instant::now(),
                    },
                );
            }
            Err(err) => {
                inner.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(address, command_id = %result.command_id, error = %err, "reply send failed");
            }
        }
    }

    /// Run one eviction pass now; returns the number of evicted connections.
    pub fn evict_stale(&self) -> usize {
        self.inner.evict_stale()
    }

    pub fn pooled_connections(&self) -> usize {
        self.inner.pool.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> ReplyStats {
        let c = &self.inner.counters;
        ReplyStats {
            sent: c.sent.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
        }
    }

    /// Stop the sweep and close every pooled connection.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl ReplySink for ReplyDeliveryService {
    fn send_reply(&self, reply_type: ReplyType, result: &CommandResult, address: &str) {
        ReplyDeliveryService::send_reply(self, reply_type, result, address)
    }
}

impl Drop for ReplyDeliveryService {
    fn drop(&mut self) {
        if let Some(tx) = self.sweeper_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(j) = self.sweeper.take() {
            let _ = j.join();
        }
        self.inner.pool.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use eventlane_core::{AggregateId, CommandId};

    use super::*;
    use crate::actions::ActionExecutorHandle;
    use crate::config::RetryPolicy;
    use crate::reply::{TcpReplyConnector, read_reply_frame};

    fn test_service(config: ReplyConfig) -> (ReplyDeliveryService, ActionExecutorHandle) {
        let handle = ActionExecutor::spawn(RetryPolicy::default()).unwrap();
        let connector = Arc::new(TcpReplyConnector::new(Duration::from_millis(500), Duration::from_millis(500)));
        let service = ReplyDeliveryService::start(connector, handle.executor(), config).unwrap();
        (service, handle)
    }

    fn test_result() -> CommandResult {
        CommandResult::success(CommandId::new(), AggregateId::new())
    }

    fn quiet_sweep() -> ReplyConfig {
        ReplyConfig::default().with_scan_interval(Duration::from_secs(3600))
    }

    #[test]
    fn replies_reuse_one_pooled_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (service, executor) = test_service(quiet_sweep());

        let first = test_result();
        let second = test_result();
        service.send_reply(ReplyType::CommandExecuted, &first, &address);
        service.send_reply(ReplyType::DomainEventHandled, &second, &address);

        let (mut caller, _) = listener.accept().unwrap();
        caller.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let a = read_reply_frame(&mut caller).unwrap();
        let b = read_reply_frame(&mut caller).unwrap();

        assert_eq!((a.reply_type, a.result), (ReplyType::CommandExecuted, first));
        assert_eq!((b.reply_type, b.result), (ReplyType::DomainEventHandled, second));
        assert_eq!(service.pooled_connections(), 1);
        assert_eq!(service.stats().sent, 2);

        service.shutdown();
        executor.shutdown();
    }

    #[test]
    fn malformed_address_is_dropped_without_connecting() {
        let (service, executor) = test_service(quiet_sweep());

        service.send_reply(ReplyType::CommandExecuted, &test_result(), "no-port-here");

        assert_eq!(service.pooled_connections(), 0);
        assert_eq!(service.stats().dropped, 1);
        assert_eq!(executor.executor().stats().attempts, 0);
        service.shutdown();
        executor.shutdown();
    }

    #[test]
    fn unreachable_caller_is_retried_then_dropped() {
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let (service, executor) = test_service(quiet_sweep());

        service.send_reply(ReplyType::CommandExecuted, &test_result(), &address);

        assert_eq!(service.stats().dropped, 1);
        assert_eq!(executor.executor().stats().attempts, 3);
        assert_eq!(executor.executor().stats().queued, 0);
        service.shutdown();
        executor.shutdown();
    }

    #[test]
    fn idle_connections_are_evicted_and_recreated() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (service, executor) = test_service(quiet_sweep().with_idle_timeout(Duration::from_millis(10)));

        service.send_reply(ReplyType::CommandExecuted, &test_result(), &address);
        let _first: TcpStream = listener.accept().unwrap().0;
        thread::sleep(Duration::from_millis(30));

        assert_eq!(service.evict_stale(), 1);
        assert_eq!(service.pooled_connections(), 0);

        service.send_reply(ReplyType::CommandExecuted, &test_result(), &address);
        let (mut second, _) = listener.accept().unwrap();
        second.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        assert!(read_reply_frame(&mut second).is_ok());
        service.shutdown();
        executor.shutdown();
    }

    #[test]
    fn disconnected_connections_are_evicted() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (service, executor) = test_service(quiet_sweep());

        service.send_reply(ReplyType::CommandExecuted, &test_result(), &address);
        drop(listener.accept().unwrap());
        thread::sleep(Duration::from_millis(50));

        assert_eq!(service.evict_stale(), 1);
        assert_eq!(service.stats().evicted, 1);
        service.shutdown();
        executor.shutdown();
    }

    #[test]
    fn background_sweep_evicts_on_its_own() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let config = ReplyConfig::default()
            .with_scan_interval(Duration::from_millis(10))
            .with_idle_timeout(Duration::from_millis(10));
        let (service, executor) = test_service(config);

        service.send_reply(ReplyType::CommandExecuted, &test_result(), &address);
        let _caller = listener.accept().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while service.pooled_connections() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(service.pooled_connections(), 0);
        service.shutdown();
        executor.shutdown();
    }
}
