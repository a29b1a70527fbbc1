//! Client-wide backoff window applied after the provider throttles us.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RetryConfig;

#[derive(Default)]
struct GateState {
    until: Option<Instant>,
    strikes: u32,
}

/// Every request waits here before it is sent.
pub(crate) struct ThrottleGate {
    state: Mutex<GateState>,
    retry: RetryConfig,
}

impl ThrottleGate {
    pub(crate) fn new(retry: RetryConfig) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            retry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a throttling response and extend the window.
    ///
    /// Each consecutive strike doubles the window; a provider-supplied
    /// `retry_after` is honoured when longer. Returns the window length.
    pub(crate) fn trip(&self, retry_after: Option<Duration>) -> Duration {
        let mut state = self.lock();
        let window = self
            .retry
            .backoff_for(state.strikes)
            .max(retry_after.unwrap_or_default());
        state.strikes = state.strikes.saturating_add(1);

        let until = Instant::now() + window;
        state.until = Some(state.until.map_or(until, |current| current.max(until)));
        window
    }

    /// A request got through; the next throttle starts from the initial window.
    pub(crate) fn reset(&self) {
        self.lock().strikes = 0;
    }

    /// Time left in the current window.
    pub(crate) fn remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Sleep until no backoff window is active.
    pub(crate) async fn wait(&self) {
        loop {
            let until = self.lock().until;
            match until {
                Some(until) if until > Instant::now() => tokio::time::sleep_until(until).await,
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ThrottleGate {
        ThrottleGate::new(
            RetryConfig::new()
                .initial_backoff(Duration::from_secs(1))
                .max_backoff(Duration::from_secs(8)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn window_grows_exponentially() {
        let gate = gate();
        assert_eq!(gate.trip(None), Duration::from_secs(1));
        assert_eq!(gate.trip(None), Duration::from_secs(2));
        assert_eq!(gate.trip(None), Duration::from_secs(4));
        gate.reset();
        assert_eq!(gate.trip(None), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_wins_when_longer() {
        let gate = gate();
        assert_eq!(gate.trip(Some(Duration::from_secs(30))), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_out_the_window() {
        let gate = gate();
        let start = Instant::now();
        gate.wait().await;
        assert_eq!(Instant::now(), start);

        gate.trip(None);
        gate.trip(None);
        gate.wait().await;
        assert!(Instant::now() - start >= Duration::from_secs(2));
        assert!(gate.remaining().is_none());
    }
}
