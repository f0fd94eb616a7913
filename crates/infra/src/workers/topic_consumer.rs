use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use eventlane_events::{EventBus, EventStream, Subscription};

use crate::actions::{ActionError, ActionExecutor, ActionInfo};
use crate::publishing::StreamPublisher;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Topic consumer loop.
///
/// - Subscribes to one or more topics of a bus carrying JSON stream envelopes
/// - Decodes each envelope and hands the stream to a [`StreamPublisher`]
///   (normally an [`EventPublishingPipeline`](crate::publishing::EventPublishingPipeline))
///   through the [`ActionExecutor`], so failed forwards retry in the background
/// - Supports graceful shutdown
///
/// Deduplication and ordering are the pipeline's job; the consumer forwards
/// whatever the bus delivers, in delivery order.
#[derive(Debug)]
pub struct TopicConsumer;

impl TopicConsumer {
    /// Spawn a worker thread that forwards envelopes from `topics`.
    pub fn spawn<B>(
        name: &str,
        bus: B,
        topics: &[&str],
        sink: Arc<dyn StreamPublisher>,
        executor: ActionExecutor,
    ) -> std::io::Result<WorkerHandle>
    where
        B: EventBus<String>,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<String> = bus.subscribe(topics);
        let worker = name.to_string();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&worker, sub, shutdown_rx, &sink, &executor))?;

        info!(worker = name, topics = ?topics, "topic consumer started");
        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop(
    name: &str,
    sub: Subscription<String>,
    shutdown_rx: mpsc::Receiver<()>,
    sink: &Arc<dyn StreamPublisher>,
    executor: &ActionExecutor,
) {
    let tick = Duration::from_millis(250);

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(envelope) => {
                let stream: EventStream = match serde_json::from_str(&envelope) {
                    Ok(stream) => stream,
                    Err(err) => {
                        warn!(worker = name, error = %err, "undecodable stream envelope dropped");
                        continue;
                    }
                };

                debug!(
                    worker = name,
                    aggregate_id = %stream.aggregate_id(),
                    version = stream.version(),
                    "stream received"
                );
                let sink = sink.clone();
                executor.try_action(ActionInfo::new("forward_stream", move || {
                    sink.publish(&stream).map_err(ActionError::failed)
                }));
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!(worker = name, "topic consumer stopped");
}
