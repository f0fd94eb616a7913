use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use eventlane_core::CommandId;
use eventlane_events::{ExceptionHandler, IssuedCommand, PublishableException};

use super::{CommandSink, ExceptionPublisher};
use crate::actions::{ActionError, ActionExecutor, ActionInfo};
use crate::config::EngineConfig;
use crate::mailbox::{AggregateMailboxProcessor, MailboxError, MailboxStats};

/// Outcome of dispatching one exception.
#[derive(Debug, Clone, Copy, Default)]
struct DispatchReport {
    handlers: usize,
    failed: usize,
    commands: usize,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    unhandled: AtomicU64,
    handler_failures: AtomicU64,
    commands_issued: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExceptionStats {
    pub dispatched: u64,
    /// Exceptions with no registered handler.
    pub unhandled: u64,
    pub handler_failures: u64,
    pub commands_issued: u64,
    pub mailbox: MailboxStats,
}

struct Shared {
    handlers: HashMap<String, Vec<Arc<dyn ExceptionHandler>>>,
    sink: Arc<dyn CommandSink>,
    executor: ActionExecutor,
    counters: Counters,
}

pub struct ExceptionPipelineBuilder {
    handlers: HashMap<String, Vec<Arc<dyn ExceptionHandler>>>,
    sink: Arc<dyn CommandSink>,
    executor: ActionExecutor,
}

impl ExceptionPipelineBuilder {
    /// Register `handler` for exceptions of `exception_type`.
    pub fn with_handler(mut self, exception_type: impl Into<String>, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.handlers.entry(exception_type.into()).or_default().push(handler);
        self
    }

    pub fn start(self, config: &EngineConfig) -> std::io::Result<ExceptionDispatchPipeline> {
        let shared = Arc::new(Shared {
            handlers: self.handlers,
            sink: self.sink,
            executor: self.executor,
            counters: Counters::default(),
        });

        let worker = shared.clone();
        let mailbox = AggregateMailboxProcessor::start("eventlane-exceptions", &config.mailbox, move |exception, _| {
            let report = dispatch(&worker, &exception);
            if report.failed > 0 {
                anyhow::bail!(
                    "{} of {} handlers failed for exception {}",
                    report.failed,
                    report.handlers,
                    exception.exception_id
                );
            }
            Ok(())
        })?;

        info!(exception_types = shared.handlers.len(), "exception dispatch started");
        Ok(ExceptionDispatchPipeline { shared, mailbox })
    }
}

/// Dispatches business exceptions to their registered handlers.
///
/// Exceptions run on a mailbox keyed by exception id: redeliveries of one
/// exception are handled in order, unrelated exceptions concurrently. Each
/// follow-up command gets the id
/// [`CommandId::for_follow_up`]`(exception_id, handler type code, command type code, business key)`
/// and is sent through the [`ActionExecutor`].
pub struct ExceptionDispatchPipeline {
    shared: Arc<Shared>,
    mailbox: AggregateMailboxProcessor<PublishableException>,
}

impl ExceptionDispatchPipeline {
    pub fn builder(sink: Arc<dyn CommandSink>, executor: ActionExecutor) -> ExceptionPipelineBuilder {
        ExceptionPipelineBuilder {
            handlers: HashMap::new(),
            sink,
            executor,
        }
    }

    pub fn submit(&self, exception: PublishableException) -> Result<(), MailboxError> {
        let key = exception.exception_id;
        self.mailbox.enqueue(&key, exception)
    }

    pub fn stats(&self) -> ExceptionStats {
        let c = &self.shared.counters;
        ExceptionStats {
            dispatched: c.dispatched.load(Ordering::Relaxed),
            unhandled: c.unhandled.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            commands_issued: c.commands_issued.load(Ordering::Relaxed),
            mailbox: self.mailbox.stats(),
        }
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.mailbox.wait_idle(timeout)
    }

    pub fn shutdown(self) {
        self.mailbox.shutdown();
    }
}

impl ExceptionPublisher for ExceptionDispatchPipeline {
    fn publish_exception(&self, exception: PublishableException) -> anyhow::Result<()> {
        Ok(self.submit(exception)?)
    }
}

fn dispatch(shared: &Shared, exception: &PublishableException) -> DispatchReport {
    shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);

    let Some(handlers) = shared.handlers.get(&exception.exception_type) else {
        shared.counters.unhandled.fetch_add(1, Ordering::Relaxed);
        debug!(
            exception_type = %exception.exception_type,
            exception_id = %exception.exception_id,
            "no handler registered for exception"
        );
        return DispatchReport::default();
    };

    let mut report = DispatchReport {
        handlers: handlers.len(),
        ..DispatchReport::default()
    };

    for handler in handlers {
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(exception)))
            .unwrap_or_else(|_| Err(anyhow::anyhow!("handler panicked")));
        let follow_ups = match outcome {
            Ok(follow_ups) => follow_ups,
            Err(err) => {
                report.failed += 1;
                shared.counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    handler = handler.name(),
                    exception_type = %exception.exception_type,
                    exception_id = %exception.exception_id,
                    error = %err,
                    "exception handler failed"
                );
                continue;
            }
        };

        for command in follow_ups {
            let issued = IssuedCommand {
                command_id: CommandId::for_follow_up(
                    exception.exception_id,
                    handler.type_code(),
                    command.command_type_code,
                    &command.business_key,
                ),
                caused_by: exception.exception_id,
                command,
            };
            debug!(
                handler = handler.name(),
                command_id = %issued.command_id,
                command_type = %issued.command.command_type,
                "issuing follow-up command"
            );

            let sink = shared.sink.clone();
            shared.executor.try_action(ActionInfo::new("issue_follow_up_command", move || {
                sink.send(issued.clone()).map_err(ActionError::from)
            }));
            report.commands += 1;
            shared.counters.commands_issued.fetch_add(1, Ordering::Relaxed);
        }
    }

    if report.failed > 0 {
        warn!(
            exception_id = %exception.exception_id,
            failed = report.failed,
            handlers = report.handlers,
            commands = report.commands,
            "exception partially handled"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use eventlane_core::AggregateId;
    use eventlane_events::FollowUpCommand;

    use super::*;
    use crate::actions::ActionExecutorHandle;
    use crate::config::RetryPolicy;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<IssuedCommand>>,
        fail_first: AtomicU32,
    }

    impl CommandSink for RecordingSink {
        fn send(&self, command: IssuedCommand) -> anyhow::Result<()> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("queue unavailable");
            }
            self.sent.lock().unwrap().push(command);
            Ok(())
        }
    }

    struct Refund;

    impl ExceptionHandler for Refund {
        fn name(&self) -> &str {
            "refund"
        }

        fn type_code(&self) -> u32 {
            11
        }

        fn handle(&self, exception: &PublishableException) -> anyhow::Result<Vec<FollowUpCommand>> {
            Ok(vec![FollowUpCommand {
                command_type: "bank.notify_owner".to_string(),
                command_type_code: 3,
                business_key: format!("notify:{}", exception.aggregate_id),
                aggregate_id: exception.aggregate_id,
                payload: exception.payload.clone(),
            }])
        }
    }

    struct Broken;

    impl ExceptionHandler for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn type_code(&self) -> u32 {
            12
        }

        fn handle(&self, _: &PublishableException) -> anyhow::Result<Vec<FollowUpCommand>> {
            anyhow::bail!("handler crashed")
        }
    }

    struct Panicking;

    impl ExceptionHandler for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn type_code(&self) -> u32 {
            13
        }

        fn handle(&self, _: &PublishableException) -> anyhow::Result<Vec<FollowUpCommand>> {
            panic!("handler bug")
        }
    }

    fn test_exception() -> PublishableException {
        PublishableException::raised_by(
            CommandId::new(),
            AggregateId::new(),
            "bank.account",
            "insufficient_funds",
            "balance too low",
            serde_json::json!({ "requested": 50 }),
        )
    }

    fn start(sink: Arc<RecordingSink>) -> (ExceptionDispatchPipeline, ActionExecutorHandle) {
        let executor = ActionExecutor::spawn(RetryPolicy::default().with_background_delay(Duration::from_millis(5))).unwrap();
        let pipeline = ExceptionDispatchPipeline::builder(sink, executor.executor())
            .with_handler("insufficient_funds", Arc::new(Broken))
            .with_handler("insufficient_funds", Arc::new(Refund))
            .start(&EngineConfig::default())
            .unwrap();
        (pipeline, executor)
    }

    #[test]
    fn redelivered_exception_issues_the_same_command_id() {
        let sink = Arc::new(RecordingSink::default());
        let (pipeline, executor) = start(sink.clone());

        let exception = test_exception();
        pipeline.submit(exception.clone()).unwrap();
        pipeline.submit(exception.clone()).unwrap();
        assert!(pipeline.wait_idle(Duration::from_secs(5)));

        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].command_id, sent[1].command_id);
        assert_eq!(
            sent[0].command_id,
            CommandId::for_follow_up(
                exception.exception_id,
                11,
                3,
                &format!("notify:{}", exception.aggregate_id)
            )
        );
        assert_eq!(sent[0].caused_by, exception.exception_id);
        drop(sent);
        pipeline.shutdown();
        executor.shutdown();
    }

    #[test]
    fn failing_handler_does_not_stop_its_siblings() {
        let sink = Arc::new(RecordingSink::default());
        let (pipeline, executor) = start(sink.clone());

        pipeline.submit(test_exception()).unwrap();
        assert!(pipeline.wait_idle(Duration::from_secs(5)));

        let stats = pipeline.stats();
        assert_eq!(stats.handler_failures, 1);
        assert_eq!(stats.commands_issued, 1);
        assert_eq!(stats.mailbox.failed, 1);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        pipeline.shutdown();
        executor.shutdown();
    }

    #[test]
    fn panicking_handler_does_not_stop_its_siblings() {
        let sink = Arc::new(RecordingSink::default());
        let executor = ActionExecutor::spawn(RetryPolicy::default()).unwrap();
        let pipeline = ExceptionDispatchPipeline::builder(sink.clone(), executor.executor())
            .with_handler("insufficient_funds", Arc::new(Panicking))
            .with_handler("insufficient_funds", Arc::new(Refund))
            .start(&EngineConfig::default())
            .unwrap();

        pipeline.submit(test_exception()).unwrap();
        assert!(pipeline.wait_idle(Duration::from_secs(5)));

        let stats = pipeline.stats();
        assert_eq!(stats.handler_failures, 1);
        assert_eq!(stats.commands_issued, 1);
        assert_eq!(stats.mailbox.failed, 1);
        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        pipeline.shutdown();
        executor.shutdown();
    }

    #[test]
    fn unregistered_exception_type_is_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let (pipeline, executor) = start(sink.clone());

        let mut exception = test_exception();
        exception.exception_type = "overdraft_limit".to_string();
        pipeline.submit(exception).unwrap();
        assert!(pipeline.wait_idle(Duration::from_secs(5)));

        assert_eq!(pipeline.stats().unhandled, 1);
        assert!(sink.sent.lock().unwrap().is_empty());
        pipeline.shutdown();
        executor.shutdown();
    }

    #[test]
    fn follow_up_send_is_retried() {
        let sink = Arc::new(RecordingSink {
            fail_first: AtomicU32::new(2),
            ..RecordingSink::default()
        });
        let (pipeline, executor) = start(sink.clone());

        pipeline.submit(test_exception()).unwrap();
        assert!(pipeline.wait_idle(Duration::from_secs(5)));

        assert_eq!(sink.sent.lock().unwrap().len(), 1);
        assert_eq!(executor.executor().stats().queued, 0);
        pipeline.shutdown();
        executor.shutdown();
    }
}
