use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use eventlane_core::{AggregateId, MessageId};
use eventlane_events::{AckPoint, CommandResult, EventStream, EventStreamHandler, ReplyType};

use super::{PublishError, StreamPublisher};
use crate::actions::{ActionError, ActionExecutor, ActionInfo};
use crate::config::EngineConfig;
use crate::ledger::{InsertOutcome, LedgerError, MessageHandleStore, PublishedVersionStore};
use crate::mailbox::{AggregateMailboxProcessor, MailboxSender, MailboxStats};
use crate::reply::ReplySink;

/// A named downstream processor and the handlers it runs for every stream.
///
/// The name keys the published-version ledger, so it must be stable and
/// unique within a pipeline.
pub struct StreamProcessor {
    name: String,
    handlers: Vec<Arc<dyn EventStreamHandler>>,
    acknowledging: bool,
}

impl StreamProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
            acknowledging: false,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventStreamHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Reply `DomainEventHandled` to callers that asked for
    /// [`AckPoint::EventHandled`] once this processor has handled their stream.
    pub fn acknowledging(mut self) -> Self {
        self.acknowledging = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    published: AtomicU64,
    stale: AtomicU64,
    held_back: AtomicU64,
    lost_races: AtomicU64,
    duplicate_handles: AtomicU64,
    acknowledged: AtomicU64,
}

/// Publishing pipeline statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub submitted: u64,
    /// Ledger advances made by this pipeline.
    pub published: u64,
    /// Deliveries at or below the published version (redeliveries).
    pub stale: u64,
    /// Deliveries requeued because an earlier version was not published yet.
    pub held_back: u64,
    pub lost_races: u64,
    /// Handler invocations skipped because a handle record existed.
    pub duplicate_handles: u64,
    pub acknowledged: u64,
    pub mailbox: MailboxStats,
}

struct Delivery {
    processor: usize,
    stream: Arc<EventStream>,
}

impl Delivery {
    fn key(&self) -> (usize, AggregateId) {
        (self.processor, self.stream.aggregate_id())
    }
}

struct Shared {
    processors: Vec<StreamProcessor>,
    versions: Arc<dyn PublishedVersionStore>,
    handles: Arc<dyn MessageHandleStore>,
    executor: ActionExecutor,
    replies: Option<Arc<dyn ReplySink>>,
    gap_retry_delay: Duration,
    /// `(processor, aggregate)` pairs whose next version is being handled.
    in_flight: Mutex<HashSet<(usize, AggregateId)>>,
    counters: Counters,
}

/// Builder for [`EventPublishingPipeline`].
pub struct PipelineBuilder {
    versions: Arc<dyn PublishedVersionStore>,
    handles: Arc<dyn MessageHandleStore>,
    executor: ActionExecutor,
    processors: Vec<StreamProcessor>,
    replies: Option<Arc<dyn ReplySink>>,
}

impl PipelineBuilder {
    pub fn with_processor(mut self, processor: StreamProcessor) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_replies(mut self, replies: Arc<dyn ReplySink>) -> Self {
        self.replies = Some(replies);
        self
    }

    pub fn start(self, config: &EngineConfig) -> std::io::Result<EventPublishingPipeline> {
        let mut names = HashSet::new();
        for processor in &self.processors {
            if !names.insert(processor.name.as_str()) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("duplicate stream processor name {:?}", processor.name),
                ));
            }
        }

        let shared = Arc::new(Shared {
            processors: self.processors,
            versions: self.versions,
            handles: self.handles,
            executor: self.executor,
            replies: self.replies,
            gap_retry_delay: config.publish.gap_retry_delay,
            in_flight: Mutex::new(HashSet::new()),
            counters: Counters::default(),
        });

        let worker = shared.clone();
        let mailbox = AggregateMailboxProcessor::start("eventlane-publish", &config.mailbox, move |delivery, mailbox| {
            deliver(&worker, delivery, mailbox)
        })?;

        info!(
            processors = shared.processors.len(),
            "publishing pipeline started"
        );
        Ok(EventPublishingPipeline { shared, mailbox })
    }
}

/// Delivers committed streams to every registered processor, per aggregate
/// in version order, advancing the published-version ledger as it goes.
///
/// ## Delivery Algorithm
///
/// For a stream at version `v` and processor `P` with published version `p`:
///
/// - `v <= p`: already published, skipped
/// - `v > p + 1`: an earlier version is missing, requeued after `gap_retry_delay`
/// - `v == p + 1`: handlers run (each skipped if its handle record exists),
///   then the ledger advances by insert-if-absent (`v == 1`) or compare-and-set
///
/// Handling and advancing run through the [`ActionExecutor`], so a failing
/// handler is retried in the background while its lane moves on; later
/// versions of that aggregate stay held back for that processor only.
pub struct EventPublishingPipeline {
    shared: Arc<Shared>,
    mailbox: AggregateMailboxProcessor<Delivery>,
}

impl EventPublishingPipeline {
    pub fn builder(
        versions: Arc<dyn PublishedVersionStore>,
        handles: Arc<dyn MessageHandleStore>,
        executor: ActionExecutor,
    ) -> PipelineBuilder {
        PipelineBuilder {
            versions,
            handles,
            executor,
            processors: Vec::new(),
            replies: None,
        }
    }

    /// Queue `stream` for every processor.
    pub fn submit(&self, stream: EventStream) -> Result<(), PublishError> {
        let stream = Arc::new(stream);
        for processor in 0..self.shared.processors.len() {
            let delivery = Delivery {
                processor,
                stream: stream.clone(),
            };
            self.mailbox.enqueue(&delivery.key(), delivery)?;
        }
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn processor_names(&self) -> impl Iterator<Item = &str> {
        self.shared.processors.iter().map(StreamProcessor::name)
    }

    pub fn published_version(
        &self,
        processor: &str,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<u64, LedgerError> {
        self.shared.versions.get_version(processor, aggregate_type, aggregate_id)
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            held_back: c.held_back.load(Ordering::Relaxed),
            lost_races: c.lost_races.load(Ordering::Relaxed),
            duplicate_handles: c.duplicate_handles.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            mailbox: self.mailbox.stats(),
        }
    }

    /// Block until no delivery is queued, delayed or being handled, or
    /// `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let in_flight = self
                .shared
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len();
            if in_flight == 0 && self.mailbox.stats().outstanding == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn shutdown(self) {
        self.mailbox.shutdown();
    }
}

impl StreamPublisher for EventPublishingPipeline {
    fn publish(&self, stream: &EventStream) -> Result<(), PublishError> {
        self.submit(stream.clone())
    }
}

fn deliver(shared: &Arc<Shared>, delivery: Delivery, mailbox: &MailboxSender<Delivery>) -> anyhow::Result<()> {
    let processor = &shared.processors[delivery.processor];
    let stream = delivery.stream.clone();
    let key = delivery.key();

    let mut published = None;
    let read = shared.executor.try_recursively(
        "read_published_version",
        || {
            published = Some(shared.versions.get_version(
                processor.name(),
                stream.aggregate_type(),
                stream.aggregate_id(),
            )?);
            Ok(())
        },
        shared.executor.policy().max_retry_count,
    );
    let published = match published {
        Some(published) if read => published,
        _ => {
            warn!(
                processor = processor.name(),
                aggregate_id = %stream.aggregate_id(),
                "published version unavailable, requeueing delivery"
            );
            mailbox.enqueue_after(&key, delivery, shared.gap_retry_delay)?;
            return Ok(());
        }
    };

    let version = stream.version();
    if version <= published {
        shared.counters.stale.fetch_add(1, Ordering::Relaxed);
        debug!(
            processor = processor.name(),
            aggregate_id = %stream.aggregate_id(),
            version,
            published,
            "stream already published, skipping"
        );
        return Ok(());
    }
    if version > published + 1 {
        shared.counters.held_back.fetch_add(1, Ordering::Relaxed);
        debug!(
            processor = processor.name(),
            aggregate_id = %stream.aggregate_id(),
            version,
            published,
            "earlier version unpublished, holding stream back"
        );
        mailbox.enqueue_after(&key, delivery, shared.gap_retry_delay)?;
        return Ok(());
    }

    let claimed = shared
        .in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key);
    if !claimed {
        // The same version is still being handled (possibly in the background).
        shared.counters.held_back.fetch_add(1, Ordering::Relaxed);
        mailbox.enqueue_after(&key, delivery, shared.gap_retry_delay)?;
        return Ok(());
    }

    let handle = handle_action(shared.clone(), delivery.processor, stream.clone());
    let advance = advance_action(shared.clone(), delivery.processor, stream, mailbox.clone());
    shared.executor.try_action(handle.then(advance));
    Ok(())
}

fn handle_action(shared: Arc<Shared>, processor: usize, stream: Arc<EventStream>) -> ActionInfo {
    let name = format!("handle_stream:{}", shared.processors[processor].name());
    ActionInfo::new(name, move || {
        let message_id = MessageId::from(stream.stream_id());
        for handler in &shared.processors[processor].handlers {
            if shared.handles.record_exists(message_id, handler.type_code())? {
                shared.counters.duplicate_handles.fetch_add(1, Ordering::Relaxed);
                debug!(
                    handler = handler.name(),
                    stream_id = %stream.stream_id(),
                    "stream already handled, skipping handler"
                );
                continue;
            }

            handler.handle(&stream).map_err(|err| {
                warn!(
                    handler = handler.name(),
                    aggregate_id = %stream.aggregate_id(),
                    version = stream.version(),
                    error = %err,
                    "stream handler failed"
                );
                ActionError::failed(format!("{}: {err:#}", handler.name()))
            })?;
            shared.handles.add_record(message_id, handler.type_code())?;
        }
        Ok(())
    })
}

fn advance_action(
    shared: Arc<Shared>,
    processor: usize,
    stream: Arc<EventStream>,
    mailbox: MailboxSender<Delivery>,
) -> ActionInfo {
    let name = format!("advance_published:{}", shared.processors[processor].name());
    ActionInfo::new(name, move || {
        let p = &shared.processors[processor];
        let (aggregate_type, aggregate_id, version) = (stream.aggregate_type(), stream.aggregate_id(), stream.version());

        let advanced = if version == 1 {
            match shared.versions.insert_first(p.name(), aggregate_type, aggregate_id)? {
                InsertOutcome::Inserted => true,
                InsertOutcome::AlreadyExists => {
                    debug!(processor = p.name(), aggregate_id = %aggregate_id, "first version already recorded");
                    false
                }
            }
        } else {
            shared.versions.update(p.name(), aggregate_type, aggregate_id, version)?
        };

        shared
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(processor, aggregate_id));

        if !advanced {
            if version > 1 {
                shared.counters.lost_races.fetch_add(1, Ordering::Relaxed);
                warn!(
                    processor = p.name(),
                    aggregate_id = %aggregate_id,
                    version,
                    "published version moved underneath, requeueing"
                );
                let delivery = Delivery {
                    processor,
                    stream: stream.clone(),
                };
                if let Err(err) = mailbox.enqueue_after(&delivery.key(), delivery, shared.gap_retry_delay) {
                    warn!(error = %err, "requeue after lost race failed");
                }
            }
            return Ok(());
        }

        shared.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(processor = p.name(), aggregate_id = %aggregate_id, version, "published version advanced");

        if p.acknowledging {
            acknowledge(&shared, &stream);
        }
        Ok(())
    })
}

fn acknowledge(shared: &Shared, stream: &EventStream) {
    let Some(target) = stream.reply_target() else {
        return;
    };
    if target.ack() != AckPoint::EventHandled {
        return;
    }
    if let Some(replies) = &shared.replies {
        let result = CommandResult::success(stream.command_id(), stream.aggregate_id());
        replies.send_reply(ReplyType::DomainEventHandled, &result, target.address());
        shared.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
    }
}
