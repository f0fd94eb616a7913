/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
///
/// Events travel inside an [`EventStream`](crate::EventStream); the stream
/// carries the commit timestamp, so events do not need one of their own.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "bank.account.deposited").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }
}
