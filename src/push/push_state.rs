use std::time::Duration;

use tokio::time::Instant;

/// The phases of a single rendezvous request. `Finished` is terminal.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PushState {
    NotStarted,
    Started,
    DirectlyConnecting,
    Pushing,
    Exchanging,
    Finished,
}

/// A state together with the time it was entered. Stamps are replaced as a whole on every
///  transition, so a reader always sees a consistent pair.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StateStamp {
    pub state: PushState,
    pub since: Instant,
}

impl StateStamp {
    pub fn new(state: PushState) -> StateStamp {
        StateStamp {
            state,
            since: Instant::now(),
        }
    }

    /// The part of `expected` that elapsed in this state at `now`, capped at 1.0
    pub fn elapsed_fraction(&self, now: Instant, expected: Duration) -> f64 {
        if expected.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.since);
        (elapsed.as_secs_f64() / expected.as_secs_f64()).min(1.0)
    }
}
