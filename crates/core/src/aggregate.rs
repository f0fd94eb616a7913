//! Aggregate traits for event-sourced domain models.

use crate::error::DomainError;

/// Aggregate execution semantics (pure, deterministic).
///
/// - **Decision logic**: `handle(&self, cmd)` returns events.
/// - **State mutation**: `apply(&mut self, event)` evolves state.
///
/// Aggregates must not perform IO or side effects. They should only return events
/// describing what happened. Versioning is owned by the engine: an aggregate's
/// version is the version of the last event stream applied to it, so
/// implementations do not track it themselves.
pub trait Aggregate: Send + 'static {
    type Command: Clone + core::fmt::Debug + Send + Sync + 'static;
    type Event: Clone + core::fmt::Debug + Send + Sync + 'static;
    type Error: core::fmt::Debug + Into<DomainError>;

    /// Stable aggregate type name (e.g. "bank.account").
    ///
    /// Persisted with every stream and used to key the published-version
    /// ledger, so it must not change once data exists.
    fn aggregate_type() -> &'static str;

    /// Evolve in-memory state from a single event.
    fn apply(&mut self, event: &Self::Event);

    /// Decide which events to emit given the current state and a command.
    ///
    /// This must not mutate state. State evolution is done through `apply`.
    /// Returning an empty vector means the command changed nothing.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;
}

/// An aggregate instance paired with the version of its last applied stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<A> {
    state: A,
    version: u64,
}

impl<A: Aggregate> Versioned<A> {
    /// A fresh, never-committed aggregate (version 0).
    pub fn initial(state: A) -> Self {
        Self { state, version: 0 }
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn into_state(self) -> A {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply all events of one committed stream and move to its version.
    ///
    /// Streams must be applied in order; `stream_version` must be exactly
    /// `version() + 1`.
    pub fn apply_stream<'a>(
        &mut self,
        stream_version: u64,
        events: impl IntoIterator<Item = &'a A::Event>,
    ) -> Result<(), DomainError>
    where
        A::Event: 'a,
    {
        if stream_version != self.version + 1 {
            return Err(DomainError::invariant(format!(
                "stream version {stream_version} does not follow aggregate version {}",
                self.version
            )));
        }
        for event in events {
            self.state.apply(event);
        }
        self.version = stream_version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Counter {
        total: i64,
    }

    impl Aggregate for Counter {
        type Command = i64;
        type Event = i64;
        type Error = DomainError;

        fn aggregate_type() -> &'static str {
            "test.counter"
        }

        fn apply(&mut self, event: &i64) {
            self.total += event;
        }

        fn handle(&self, command: &i64) -> Result<Vec<i64>, DomainError> {
            if *command == 0 {
                return Ok(vec![]);
            }
            Ok(vec![*command])
        }
    }

    #[test]
    fn apply_stream_advances_version_by_one() {
        let mut agg = Versioned::initial(Counter::default());
        agg.apply_stream(1, &[5, 2]).unwrap();
        agg.apply_stream(2, &[-1]).unwrap();

        assert_eq!(agg.version(), 2);
        assert_eq!(agg.state().total, 6);
    }

    #[test]
    fn apply_stream_rejects_gaps() {
        let mut agg = Versioned::initial(Counter::default());
        let err = agg.apply_stream(2, &[1]).unwrap_err();

        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(agg.version(), 0);
        assert_eq!(agg.state().total, 0);
    }
}
