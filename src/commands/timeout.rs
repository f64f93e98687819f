use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Absolute wall-clock timeout for a spawned command.
///
/// The deadline is fixed at spawn time; output activity never extends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutStrategy {
    /// Hard deadline in milliseconds
    pub base_timeout_ms: u64,

    /// Warning multiplier (default 0.8)
    #[serde(default = "default_soft_multiplier")]
    pub soft_multiplier: f64,

    /// Time allowed for the killed process to be reaped, in milliseconds
    #[serde(default = "default_reap_grace")]
    pub reap_grace_ms: u64,
}

fn default_soft_multiplier() -> f64 {
    0.8
}
fn default_reap_grace() -> u64 {
    2000
}

impl Default for TimeoutStrategy {
    fn default() -> Self {
        Self::from_secs(10)
    }
}

impl TimeoutStrategy {
    pub fn from_secs(secs: u64) -> Self {
        Self::from_duration(Duration::from_secs(secs))
    }

    pub fn from_duration(timeout: Duration) -> Self {
        Self {
            base_timeout_ms: timeout.as_millis() as u64,
            soft_multiplier: default_soft_multiplier(),
            reap_grace_ms: default_reap_grace(),
        }
    }

    /// Get soft timeout duration
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis((self.base_timeout_ms as f64 * self.soft_multiplier) as u64)
    }

    /// Get kill timeout duration
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    pub fn reap_grace(&self) -> Duration {
        Duration::from_millis(self.reap_grace_ms)
    }
}

/// Current phase of command execution timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutPhase {
    /// Before the soft threshold
    Normal,
    /// Past the soft threshold, still running
    Warning,
    /// Deadline reached, the process must be killed
    ForceKill,
}

/// Tracks timeout state for a running command
#[derive(Debug)]
pub struct TimeoutTracker {
    strategy: TimeoutStrategy,
    start_time: Instant,
}

impl TimeoutTracker {
    pub fn new(strategy: TimeoutStrategy) -> Self {
        Self::started_at(strategy, Instant::now())
    }

    pub fn started_at(strategy: TimeoutStrategy, start_time: Instant) -> Self {
        Self {
            strategy,
            start_time,
        }
    }

    /// Get current phase based on elapsed time
    pub fn current_phase(&self) -> TimeoutPhase {
        self.phase_at(self.start_time.elapsed())
    }

    fn phase_at(&self, elapsed: Duration) -> TimeoutPhase {
        if elapsed >= self.strategy.kill_timeout() {
            TimeoutPhase::ForceKill
        } else if elapsed >= self.strategy.soft_timeout() {
            TimeoutPhase::Warning
        } else {
            TimeoutPhase::Normal
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Instant at which the process must be killed.
    pub fn deadline(&self) -> Instant {
        self.start_time + self.strategy.kill_timeout()
    }

    /// Instant at which the next phase starts, `None` once past the deadline.
    pub fn next_phase_at(&self) -> Option<Instant> {
        match self.current_phase() {
            TimeoutPhase::Normal => Some(self.start_time + self.strategy.soft_timeout()),
            TimeoutPhase::Warning => Some(self.deadline()),
            TimeoutPhase::ForceKill => None,
        }
    }

    pub fn strategy(&self) -> &TimeoutStrategy {
        &self.strategy
    }
}
