use crate::EventStream;

/// Handles committed event streams on behalf of a downstream processor
/// (projection, notifier, integration publisher, ...).
///
/// ## Delivery
///
/// Streams are delivered **at least once** and, per aggregate, **in version
/// order**. The engine records every successful invocation keyed by
/// `(stream_id, type_code)` and skips redeliveries, so a handler only has to
/// be idempotent across the window between "handled" and "recorded".
///
/// ## Errors
///
/// Returning `Err` leaves the stream unpublished for this handler's processor;
/// the engine retries it (inline a bounded number of times, then in the
/// background) and holds later versions of the same aggregate back until it
/// succeeds.
pub trait EventStreamHandler: Send + Sync + 'static {
    /// Stable handler name (used in logs).
    fn name(&self) -> &str;

    /// Stable numeric handler type code (idempotency record key).
    fn type_code(&self) -> u32;

    fn handle(&self, stream: &EventStream) -> anyhow::Result<()>;
}

/// Adapter turning a closure into an [`EventStreamHandler`].
pub struct FnStreamHandler<F> {
    name: String,
    type_code: u32,
    f: F,
}

impl<F> FnStreamHandler<F>
where
    F: Fn(&EventStream) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, type_code: u32, f: F) -> Self {
        Self {
            name: name.into(),
            type_code,
            f,
        }
    }
}

impl<F> EventStreamHandler for FnStreamHandler<F>
where
    F: Fn(&EventStream) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn type_code(&self) -> u32 {
        self.type_code
    }

    fn handle(&self, stream: &EventStream) -> anyhow::Result<()> {
        (self.f)(stream)
    }
}
