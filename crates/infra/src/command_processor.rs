//! Command execution (application-level orchestration).
//!
//! ## Command Execution Flow
//!
//! ```text
//! CommandEnvelope
//!   ↓  mailbox lane of the target aggregate (one command per aggregate at a time)
//! 1. Already applied? (find_by_command) → republish stored stream, reply success
//!   ↓
//! 2. Load streams, rehydrate `Versioned<A>`
//!   ↓
//! 3. Handle command (pure decision logic) → no events = NothingChanged
//!   ↓
//! 4. Append stream at version + 1
//!      Success                          → publish
//!      DuplicateEvent/DuplicateCommand  → republish stored stream
//!      ConcurrencyConflict              → back to 2 (bounded)
//!   ↓
//! 5. Reply to the caller (CommandExecuted ack point, or any failure)
//! ```
//!
//! Store calls use the executor's bounded inline retry; publishing uses
//! `try_action`, so a stuck downstream is retried in the background and never
//! holds the aggregate's lane.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};

use eventlane_core::{Aggregate, AggregateId, DomainError, Versioned};
use eventlane_events::{
    AckPoint, Command, CommandEnvelope, CommandResult, Event, EventStream, IssuedCommand, PublishableException,
    ReplyType,
};

use crate::actions::{ActionError, ActionExecutor, ActionInfo};
use crate::config::EngineConfig;
use crate::event_store::{AppendOutcome, EventStore, EventStoreError};
use crate::exception::{CommandSink, ExceptionPublisher};
use crate::mailbox::{AggregateMailboxProcessor, MailboxError, MailboxStats};
use crate::publishing::StreamPublisher;
use crate::reply::ReplySink;

/// Why a command failed. Reported to the caller through [`CommandResult::failed`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandFailure {
    /// The aggregate rejected the command.
    #[error("command rejected: {0}")]
    Rejected(DomainError),

    /// Stored history could not be decoded or applied.
    #[error("aggregate replay failed: {0}")]
    Replay(String),

    #[error("stream encode failed: {0}")]
    Encode(String),

    /// The store stayed unreachable for the whole inline retry budget.
    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),

    /// The store refused the stream (not retryable).
    #[error("event store rejected the stream: {0}")]
    Store(String),

    #[error("concurrency conflict persisted after {0} retries")]
    ConflictRetriesExhausted(u32),
}

impl CommandFailure {
    /// `result_type` reported to the caller.
    pub fn result_type(&self) -> &str {
        match self {
            CommandFailure::Rejected(err) => match err {
                DomainError::Validation(_) => "validation",
                DomainError::InvariantViolation(_) => "invariant_violation",
                DomainError::InvalidId(_) => "invalid_id",
                DomainError::NotFound => "not_found",
                DomainError::Conflict(_) => "conflict",
                DomainError::BusinessRule { exception_type, .. } => exception_type,
            },
            CommandFailure::Replay(_) => "replay",
            CommandFailure::Encode(_) => "encode",
            CommandFailure::StoreUnavailable(_) => "store_unavailable",
            CommandFailure::Store(_) => "store",
            CommandFailure::ConflictRetriesExhausted(_) => "concurrency_conflict",
        }
    }
}

impl From<EventStoreError> for CommandFailure {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::Unavailable(msg) => CommandFailure::StoreUnavailable(msg),
            EventStoreError::InvalidAppend(msg) => CommandFailure::Store(msg),
            EventStoreError::Corrupt(msg) => CommandFailure::Replay(msg),
        }
    }
}

enum Outcome {
    Committed,
    AlreadyApplied,
    NothingChanged,
    Failed(CommandFailure),
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    committed: AtomicU64,
    already_applied: AtomicU64,
    nothing_changed: AtomicU64,
    conflicts: AtomicU64,
    failed: AtomicU64,
}

/// Command processing statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommandStats {
    pub submitted: u64,
    pub committed: u64,
    pub already_applied: u64,
    pub nothing_changed: u64,
    /// Concurrency conflicts that triggered a reload.
    pub conflicts: u64,
    pub failed: u64,
    pub mailbox: MailboxStats,
}

type Factory<A> = dyn Fn(AggregateId) -> A + Send + Sync;

struct Shared<A> {
    store: Arc<dyn EventStore>,
    publisher: Arc<dyn StreamPublisher>,
    executor: ActionExecutor,
    replies: Option<Arc<dyn ReplySink>>,
    exceptions: Option<Arc<dyn ExceptionPublisher>>,
    factory: Box<Factory<A>>,
    max_conflict_retries: u32,
    counters: Counters,
}

pub struct CommandProcessorBuilder<A> {
    store: Arc<dyn EventStore>,
    publisher: Arc<dyn StreamPublisher>,
    executor: ActionExecutor,
    replies: Option<Arc<dyn ReplySink>>,
    exceptions: Option<Arc<dyn ExceptionPublisher>>,
    factory: Box<Factory<A>>,
}

impl<A> CommandProcessorBuilder<A>
where
    A: Aggregate,
    A::Command: Command,
    A::Event: Event + Serialize + DeserializeOwned,
{
    pub fn with_replies(mut self, replies: Arc<dyn ReplySink>) -> Self {
        self.replies = Some(replies);
        self
    }

    /// Publish business rule violations to `exceptions`.
    pub fn with_exceptions(mut self, exceptions: Arc<dyn ExceptionPublisher>) -> Self {
        self.exceptions = Some(exceptions);
        self
    }

    pub fn start(self, config: &EngineConfig) -> std::io::Result<CommandProcessor<A>> {
        let shared = Arc::new(Shared {
            store: self.store,
            publisher: self.publisher,
            executor: self.executor,
            replies: self.replies,
            exceptions: self.exceptions,
            factory: self.factory,
            max_conflict_retries: config.command.max_conflict_retries,
            counters: Counters::default(),
        });

        let worker = shared.clone();
        let mailbox = AggregateMailboxProcessor::start(
            format!("eventlane-commands-{}", A::aggregate_type()),
            &config.mailbox,
            move |envelope, _| {
                process::<A>(&worker, envelope);
                Ok(())
            },
        )?;

        info!(aggregate_type = A::aggregate_type(), "command processor started");
        Ok(CommandProcessor { shared, mailbox })
    }
}

/// Executes commands for one aggregate type.
///
/// Commands for the same aggregate run strictly in submission order; commands
/// for different aggregates run in parallel on the mailbox workers. Several
/// engine instances may share a store: version races surface as
/// `ConcurrencyConflict` and are resolved by reloading and re-running the
/// command up to `max_conflict_retries` times.
///
/// ## Replies
///
/// A command carrying a [`ReplyTarget`](eventlane_events::ReplyTarget) gets
/// exactly one `CommandExecuted` reply from here when it fails, changes
/// nothing, was already applied, or committed with
/// [`AckPoint::CommandExecuted`]. Committed commands waiting for
/// [`AckPoint::EventHandled`] are acknowledged by the publishing pipeline.
pub struct CommandProcessor<A: Aggregate> {
    shared: Arc<Shared<A>>,
    mailbox: AggregateMailboxProcessor<CommandEnvelope<A::Command>>,
}

impl<A> CommandProcessor<A>
where
    A: Aggregate,
    A::Command: Command,
    A::Event: Event + Serialize + DeserializeOwned,
{
    /// `factory` builds the version-0 state of an aggregate.
    pub fn builder<F>(
        store: Arc<dyn EventStore>,
        publisher: Arc<dyn StreamPublisher>,
        executor: ActionExecutor,
        factory: F,
    ) -> CommandProcessorBuilder<A>
    where
        F: Fn(AggregateId) -> A + Send + Sync + 'static,
    {
        CommandProcessorBuilder {
            store,
            publisher,
            executor,
            replies: None,
            exceptions: None,
            factory: Box::new(factory),
        }
    }

    pub fn submit(&self, envelope: CommandEnvelope<A::Command>) -> Result<(), MailboxError> {
        self.mailbox.enqueue(&envelope.aggregate_id(), envelope)?;
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Rehydrate an aggregate from the store (outside the mailbox).
    pub fn load_aggregate(&self, aggregate_id: AggregateId) -> Result<Versioned<A>, CommandFailure> {
        load::<A>(&self.shared, aggregate_id)
    }

    pub fn stats(&self) -> CommandStats {
        let c = &self.shared.counters;
        CommandStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            committed: c.committed.load(Ordering::Relaxed),
            already_applied: c.already_applied.load(Ordering::Relaxed),
            nothing_changed: c.nothing_changed.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
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

/// Follow-up commands are decoded from their JSON payload and submitted
/// under their engine-assigned id.
impl<A> CommandSink for CommandProcessor<A>
where
    A: Aggregate,
    A::Command: Command + DeserializeOwned,
    A::Event: Event + Serialize + DeserializeOwned,
{
    fn send(&self, issued: IssuedCommand) -> anyhow::Result<()> {
        let command: A::Command = serde_json::from_value(issued.command.payload.clone())
            .with_context(|| format!("decoding follow-up command {}", issued.command.command_type))?;
        self.submit(CommandEnvelope::with_id(issued.command_id, command))?;
        Ok(())
    }
}

fn process<A>(shared: &Shared<A>, envelope: CommandEnvelope<A::Command>)
where
    A: Aggregate,
    A::Event: Event + Serialize + DeserializeOwned,
{
    let outcome = execute(shared, &envelope);
    respond(shared, &envelope, outcome);
}

fn execute<A>(shared: &Shared<A>, envelope: &CommandEnvelope<A::Command>) -> Outcome
where
    A: Aggregate,
    A::Event: Event + Serialize + DeserializeOwned,
{
    let (command_id, aggregate_id) = (envelope.command_id(), envelope.aggregate_id());

    match store_call(&shared.executor, "find_by_command", || {
        shared.store.find_by_command(aggregate_id, command_id)
    }) {
        Ok(Some(stored)) => {
            debug!(command_id = %command_id, aggregate_id = %aggregate_id, "command already applied");
            publish(shared, stored);
            return Outcome::AlreadyApplied;
        }
        Ok(None) => {}
        Err(failure) => return Outcome::Failed(failure),
    }

    for round in 0..=shared.max_conflict_retries {
        let aggregate = match load(shared, aggregate_id) {
            Ok(aggregate) => aggregate,
            Err(failure) => return Outcome::Failed(failure),
        };

        let events = match aggregate.state().handle(envelope.payload()) {
            Ok(events) => events,
            Err(err) => return Outcome::Failed(CommandFailure::Rejected(err.into())),
        };
        if events.is_empty() {
            return Outcome::NothingChanged;
        }

        let stream = match EventStream::from_typed(
            command_id,
            aggregate_id,
            A::aggregate_type(),
            aggregate.version() + 1,
            &events,
            envelope.stream_items(),
        ) {
            Ok(stream) => stream,
            Err(err) => return Outcome::Failed(CommandFailure::Encode(err.to_string())),
        };

        let appended = match store_call(&shared.executor, "append_stream", || shared.store.append(&stream)) {
            Ok(appended) => appended,
            Err(failure) => return Outcome::Failed(failure),
        };

        match appended {
            AppendOutcome::Success => {
                debug!(
                    command_id = %command_id,
                    aggregate_id = %aggregate_id,
                    version = stream.version(),
                    "stream committed"
                );
                publish(shared, stream);
                return Outcome::Committed;
            }
            AppendOutcome::DuplicateEvent | AppendOutcome::DuplicateCommand => {
                info!(
                    command_id = %command_id,
                    aggregate_id = %aggregate_id,
                    outcome = ?appended,
                    "duplicate append, republishing stored stream"
                );
                let stored = store_call(&shared.executor, "find_by_command", || {
                    shared.store.find_by_command(aggregate_id, command_id)
                });
                match stored {
                    Ok(Some(stored)) => publish(shared, stored),
                    Ok(None) => publish(shared, stream),
                    Err(failure) => return Outcome::Failed(failure),
                }
                return Outcome::AlreadyApplied;
            }
            AppendOutcome::ConcurrencyConflict => {
                shared.counters.conflicts.fetch_add(1, Ordering::Relaxed);
                info!(
                    command_id = %command_id,
                    aggregate_id = %aggregate_id,
                    version = stream.version(),
                    retry = round + 1,
                    "concurrency conflict, reloading aggregate"
                );
            }
        }
    }

    Outcome::Failed(CommandFailure::ConflictRetriesExhausted(shared.max_conflict_retries))
}

fn load<A>(shared: &Shared<A>, aggregate_id: AggregateId) -> Result<Versioned<A>, CommandFailure>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    let streams = store_call(&shared.executor, "load_aggregate", || {
        shared.store.query(aggregate_id, A::aggregate_type(), 1, u64::MAX)
    })?;

    let mut aggregate = Versioned::initial((shared.factory)(aggregate_id));
    for stream in &streams {
        let events: Vec<A::Event> = stream
            .decode_events()
            .map_err(|e| CommandFailure::Replay(format!("stream version {}: {e}", stream.version())))?;
        aggregate
            .apply_stream(stream.version(), &events)
            .map_err(|e| CommandFailure::Replay(e.to_string()))?;
    }
    Ok(aggregate)
}

/// Run a store call with bounded inline retry of transient errors.
fn store_call<T>(
    executor: &ActionExecutor,
    name: &str,
    mut call: impl FnMut() -> Result<T, EventStoreError>,
) -> Result<T, CommandFailure> {
    let mut value = None;
    let mut last_error = None;
    let mut permanent = None;

    executor.try_recursively(
        name,
        || match call() {
            Ok(v) => {
                value = Some(v);
                Ok(())
            }
            Err(err) if err.is_transient() => {
                let action_err = ActionError::failed(&err);
                last_error = Some(err);
                Err(action_err)
            }
            Err(err) => {
                permanent = Some(err);
                Ok(())
            }
        },
        executor.policy().max_retry_count,
    );

    if let Some(err) = permanent {
        return Err(err.into());
    }
    match (value, last_error) {
        (Some(v), _) => Ok(v),
        (None, Some(err)) => Err(err.into()),
        (None, None) => Err(CommandFailure::StoreUnavailable(format!("{name}: no attempt made"))),
    }
}

fn publish<A>(shared: &Shared<A>, stream: EventStream) {
    let publisher = shared.publisher.clone();
    shared.executor.try_action(ActionInfo::new("publish_stream", move || {
        publisher.publish(&stream).map_err(ActionError::failed)
    }));
}

fn respond<A>(shared: &Shared<A>, envelope: &CommandEnvelope<A::Command>, outcome: Outcome)
where
    A: Aggregate,
{
    let (command_id, aggregate_id) = (envelope.command_id(), envelope.aggregate_id());
    let acked_downstream = envelope.reply().map(|r| r.ack()) == Some(AckPoint::EventHandled);

    let (result, reply_now) = match outcome {
        Outcome::Committed => {
            shared.counters.committed.fetch_add(1, Ordering::Relaxed);
            (CommandResult::success(command_id, aggregate_id), !acked_downstream)
        }
        Outcome::AlreadyApplied => {
            shared.counters.already_applied.fetch_add(1, Ordering::Relaxed);
            (CommandResult::success(command_id, aggregate_id), true)
        }
        Outcome::NothingChanged => {
            shared.counters.nothing_changed.fetch_add(1, Ordering::Relaxed);
            (CommandResult::nothing_changed(command_id, aggregate_id), true)
        }
        Outcome::Failed(failure) => {
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                command_id = %command_id,
                aggregate_id = %aggregate_id,
                result_type = failure.result_type(),
                error = %failure,
                "command failed"
            );
            if let CommandFailure::Rejected(DomainError::BusinessRule {
                exception_type,
                message,
                payload,
            }) = &failure
            {
                raise(
                    shared,
                    PublishableException::raised_by(
                        command_id,
                        aggregate_id,
                        A::aggregate_type(),
                        exception_type.clone(),
                        message.clone(),
                        payload.clone(),
                    ),
                );
            }
            let result = CommandResult::failed(command_id, aggregate_id, failure.result_type(), failure.to_string());
            (result, true)
        }
    };

    if !reply_now {
        return;
    }
    if let (Some(target), Some(replies)) = (envelope.reply(), &shared.replies) {
        replies.send_reply(ReplyType::CommandExecuted, &result, target.address());
    }
}

fn raise<A>(shared: &Shared<A>, exception: PublishableException) {
    let Some(exceptions) = shared.exceptions.clone() else {
        debug!(exception_type = %exception.exception_type, "no exception publisher configured");
        return;
    };
    shared.executor.try_action(ActionInfo::new("publish_exception", move || {
        exceptions
            .publish_exception(exception.clone())
            .map_err(ActionError::from)
    }));
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use serde::Deserialize;

    use eventlane_core::CommandId;
    use eventlane_events::{CommandStatus, ReplyTarget};

    use super::*;
    use crate::actions::ActionExecutorHandle;
    use crate::config::RetryPolicy;
    use crate::event_store::InMemoryEventStore;
    use crate::publishing::PublishError;

    #[derive(Debug, Clone, Default)]
    struct Tally {
        total: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Add {
        tally: AggregateId,
        amount: i64,
    }

    impl Command for Add {
        fn target_aggregate_id(&self) -> AggregateId {
            self.tally
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Added {
        amount: i64,
    }

    impl Event for Added {
        fn event_type(&self) -> &'static str {
            "test.tally.added"
        }
    }

    impl Aggregate for Tally {
        type Command = Add;
        type Event = Added;
        type Error = DomainError;

        fn aggregate_type() -> &'static str {
            "test.tally"
        }

        fn apply(&mut self, event: &Added) {
            self.total += event.amount;
        }

        fn handle(&self, command: &Add) -> Result<Vec<Added>, DomainError> {
            if command.amount < 0 {
                return Err(DomainError::validation("amount must not be negative"));
            }
            if command.amount == 0 {
                return Ok(vec![]);
            }
            Ok(vec![Added { amount: command.amount }])
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        streams: Mutex<Vec<EventStream>>,
    }

    impl StreamPublisher for RecordingPublisher {
        fn publish(&self, stream: &EventStream) -> Result<(), PublishError> {
            self.streams.lock().unwrap().push(stream.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingReplies {
        sent: Mutex<Vec<(ReplyType, CommandResult)>>,
    }

    impl ReplySink for RecordingReplies {
        fn send_reply(&self, reply_type: ReplyType, result: &CommandResult, _: &str) {
            self.sent.lock().unwrap().push((reply_type, result.clone()));
        }
    }

    /// Reports every append as a lost race.
    struct AlwaysConflicting(InMemoryEventStore);

    impl EventStore for AlwaysConflicting {
        fn append(&self, _: &EventStream) -> Result<AppendOutcome, EventStoreError> {
            Ok(AppendOutcome::ConcurrencyConflict)
        }

        fn query(
            &self,
            aggregate_id: AggregateId,
            aggregate_type: &str,
            min_version: u64,
            max_version: u64,
        ) -> Result<Vec<EventStream>, EventStoreError> {
            self.0.query(aggregate_id, aggregate_type, min_version, max_version)
        }

        fn find_by_command(
            &self,
            aggregate_id: AggregateId,
            command_id: CommandId,
        ) -> Result<Option<EventStream>, EventStoreError> {
            self.0.find_by_command(aggregate_id, command_id)
        }
    }

    /// Unavailable for the first `failures` calls.
    struct Flaky {
        inner: InMemoryEventStore,
        failures: AtomicU32,
    }

    impl Flaky {
        fn check(&self) -> Result<(), EventStoreError> {
            match self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
                Ok(_) => Err(EventStoreError::Unavailable("connection reset".to_string())),
                Err(_) => Ok(()),
            }
        }
    }

    impl EventStore for Flaky {
        fn append(&self, stream: &EventStream) -> Result<AppendOutcome, EventStoreError> {
            self.check()?;
            self.inner.append(stream)
        }

        fn query(
            &self,
            aggregate_id: AggregateId,
            aggregate_type: &str,
            min_version: u64,
            max_version: u64,
        ) -> Result<Vec<EventStream>, EventStoreError> {
            self.check()?;
            self.inner.query(aggregate_id, aggregate_type, min_version, max_version)
        }

        fn find_by_command(
            &self,
            aggregate_id: AggregateId,
            command_id: CommandId,
        ) -> Result<Option<EventStream>, EventStoreError> {
            self.check()?;
            self.inner.find_by_command(aggregate_id, command_id)
        }
    }

    struct Harness {
        processor: CommandProcessor<Tally>,
        published: Arc<RecordingPublisher>,
        replies: Arc<RecordingReplies>,
        executor: ActionExecutorHandle,
    }

    impl Harness {
        fn start(store: Arc<dyn EventStore>) -> Self {
            let executor = ActionExecutor::spawn(RetryPolicy::default()).unwrap();
            let published = Arc::new(RecordingPublisher::default());
            let replies = Arc::new(RecordingReplies::default());
            let processor = CommandProcessor::builder(store, published.clone(), executor.executor(), |_| {
                Tally::default()
            })
            .with_replies(replies.clone())
            .start(&EngineConfig::default())
            .unwrap();
            Self {
                processor,
                published,
                replies,
                executor,
            }
        }

        fn run(&self, envelope: CommandEnvelope<Add>) {
            self.processor.submit(envelope).unwrap();
            assert!(self.processor.wait_idle(Duration::from_secs(5)));
        }

        fn replies(&self) -> Vec<(ReplyType, CommandResult)> {
            self.replies.sent.lock().unwrap().clone()
        }

        fn stop(self) {
            self.processor.shutdown();
            self.executor.shutdown();
        }
    }

    fn add(tally: AggregateId, amount: i64) -> CommandEnvelope<Add> {
        CommandEnvelope::new(Add { tally, amount })
            .with_reply(ReplyTarget::new("127.0.0.1:9000", AckPoint::CommandExecuted))
    }

    #[test]
    fn committed_command_is_published_and_acknowledged() {
        let store = Arc::new(InMemoryEventStore::new());
        let h = Harness::start(store.clone());
        let id = AggregateId::new();

        h.run(add(id, 5));
        h.run(add(id, 7));

        assert_eq!(store.current_version(id), 2);
        assert_eq!(h.processor.load_aggregate(id).unwrap().state().total, 12);
        let versions: Vec<u64> = h.published.streams.lock().unwrap().iter().map(|s| s.version()).collect();
        assert_eq!(versions, vec![1, 2]);
        let replies = h.replies();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|(t, r)| *t == ReplyType::CommandExecuted && r.status == CommandStatus::Success));
        h.stop();
    }

    #[test]
    fn event_handled_ack_is_left_to_the_pipeline() {
        let h = Harness::start(Arc::new(InMemoryEventStore::new()));
        let envelope = CommandEnvelope::new(Add {
            tally: AggregateId::new(),
            amount: 1,
        })
        .with_reply(ReplyTarget::new("127.0.0.1:9000", AckPoint::EventHandled));

        h.run(envelope);

        assert!(h.replies().is_empty());
        assert_eq!(h.processor.stats().committed, 1);
        h.stop();
    }

    #[test]
    fn empty_decision_replies_nothing_changed() {
        let store = Arc::new(InMemoryEventStore::new());
        let h = Harness::start(store.clone());
        let id = AggregateId::new();

        h.run(add(id, 0));

        assert_eq!(store.current_version(id), 0);
        assert!(h.published.streams.lock().unwrap().is_empty());
        assert_eq!(h.replies()[0].1.status, CommandStatus::NothingChanged);
        h.stop();
    }

    #[test]
    fn rejected_command_reports_the_domain_error_kind() {
        let h = Harness::start(Arc::new(InMemoryEventStore::new()));

        h.run(add(AggregateId::new(), -3));

        let (_, result) = &h.replies()[0];
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.result_type.as_deref(), Some("validation"));
        assert_eq!(h.processor.stats().failed, 1);
        h.stop();
    }

    #[test]
    fn resubmitted_command_is_not_applied_twice() {
        let store = Arc::new(InMemoryEventStore::new());
        let h = Harness::start(store.clone());
        let id = AggregateId::new();
        let command_id = CommandId::new();

        h.run(CommandEnvelope::with_id(command_id, Add { tally: id, amount: 4 }));
        h.run(
            CommandEnvelope::with_id(command_id, Add { tally: id, amount: 4 })
                .with_reply(ReplyTarget::new("127.0.0.1:9000", AckPoint::CommandExecuted)),
        );

        assert_eq!(store.current_version(id), 1);
        assert_eq!(h.processor.stats().already_applied, 1);
        let published = h.published.streams.lock().unwrap().clone();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0], published[1]);
        assert_eq!(h.replies()[0].1, CommandResult::success(command_id, id));
        h.stop();
    }

    #[test]
    fn persistent_conflict_fails_after_the_retry_budget() {
        let h = Harness::start(Arc::new(AlwaysConflicting(InMemoryEventStore::new())));

        h.run(add(AggregateId::new(), 1));

        let stats = h.processor.stats();
        assert_eq!(stats.conflicts, 4);
        assert_eq!(stats.failed, 1);
        assert_eq!(h.replies()[0].1.result_type.as_deref(), Some("concurrency_conflict"));
        h.stop();
    }

    #[test]
    fn transient_store_errors_are_retried_inline() {
        let store = Arc::new(Flaky {
            inner: InMemoryEventStore::new(),
            failures: AtomicU32::new(2),
        });
        let h = Harness::start(store.clone());
        let id = AggregateId::new();

        h.run(add(id, 9));

        assert_eq!(store.inner.current_version(id), 1);
        assert_eq!(h.replies()[0].1.status, CommandStatus::Success);
        h.stop();
    }

    #[test]
    fn unreachable_store_fails_the_command() {
        let store = Arc::new(Flaky {
            inner: InMemoryEventStore::new(),
            failures: AtomicU32::new(u32::MAX),
        });
        let h = Harness::start(store);

        h.run(add(AggregateId::new(), 9));

        let (_, result) = &h.replies()[0];
        assert_eq!(result.result_type.as_deref(), Some("store_unavailable"));
        assert!(h.published.streams.lock().unwrap().is_empty());
        h.stop();
    }
}
