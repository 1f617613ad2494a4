// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AITBC - CIRCUIT BREAKER
//
// Wraps the proposer tick. Isolates ledger-store transient failures
// (disk full, lock contention) from an infinite retry storm while
// preserving eventual recovery.
//
// CLOSED → (threshold consecutive failures) → OPEN
// OPEN   → (cooldown elapsed)               → HALF_OPEN
// HALF_OPEN → success → CLOSED | failure → OPEN (timer restarts)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of one guarded tick
#[derive(Debug, PartialEq)]
pub enum TickOutcome<T, E> {
    /// The tick ran; its result is attached
    Executed(Result<T, E>),
    /// The breaker is OPEN; the tick was skipped entirely
    Skipped,
}

pub struct CircuitBreaker {
    state: BreakerState,
    threshold: u32,
    timeout: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// Total CLOSED→OPEN transitions
    pub trips: u64,
    /// Ticks skipped while OPEN
    pub skipped: u64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        CircuitBreaker {
            state: BreakerState::Closed,
            threshold: threshold.max(1),
            timeout,
            consecutive_failures: 0,
            opened_at: None,
            trips: 0,
            skipped: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Gauge value: 1 while OPEN, 0 otherwise
    pub fn state_gauge(&self) -> i64 {
        match self.state {
            BreakerState::Open => 1,
            _ => 0,
        }
    }

    /// Run one tick through the breaker. While OPEN (and the cooldown has
    /// not elapsed) the closure is never invoked.
    pub fn guard<T, E, F>(&mut self, tick: F) -> TickOutcome<T, E>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if self.state == BreakerState::Open {
            let elapsed = self
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO);
            if elapsed < self.timeout {
                self.skipped += 1;
                return TickOutcome::Skipped;
            }
            // Cooldown over — let exactly one probe tick through
            self.state = BreakerState::HalfOpen;
        }

        let result = tick();
        match &result {
            Ok(_) => {
                self.state = BreakerState::Closed;
                self.consecutive_failures = 0;
                self.opened_at = None;
            }
            Err(_) => {
                if self.state == BreakerState::HalfOpen {
                    // Probe failed — back to OPEN, timer restarts
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                } else {
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.threshold {
                        self.state = BreakerState::Open;
                        self.opened_at = Some(Instant::now());
                        self.trips += 1;
                    }
                }
            }
        }
        TickOutcome::Executed(result)
    }
}
