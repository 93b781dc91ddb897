//! Timeout and recovery state machine for a single dispatch pass.
//!
//! ```text
//! Running --poll timeout--> Draining{iteration} --no active instance--> Halted(Reclaimed)
//!    |                          |
//!    |                          +--iteration bound reached--> Halted(ReclaimExceeded)
//!    +--all instances done--> Halted(Completed)
//! any state --cancellation--> Halted(Cancelled)
//! ```

use std::fmt;
use std::time::Duration;

pub const DEFAULT_RECLAIM_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimPolicy {
    pub max_iterations: u32,
    pub interval: Duration,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_RECLAIM_ATTEMPTS,
            interval: DEFAULT_RECLAIM_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// Every instance finished its queue.
    Completed,
    /// Stuck instances finished after being told to stop.
    Reclaimed,
    /// Instances were still active after the reclaim bound; tasks were force-halted.
    ReclaimExceeded,
    Cancelled,
}

impl HaltReason {
    pub fn restart_required(self) -> bool {
        matches!(self, HaltReason::ReclaimExceeded)
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HaltReason::Completed => "completed",
            HaltReason::Reclaimed => "reclaimed",
            HaltReason::ReclaimExceeded => "reclaim exceeded",
            HaltReason::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Running,
    Draining { iteration: u32 },
    Halted(HaltReason),
}

/// Outcome of one reclaim check while draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimStep {
    /// Signal the remaining instances again and wait one interval.
    Continue,
    Clean,
    Exceeded,
}

#[derive(Debug, Clone)]
pub struct PassState {
    policy: ReclaimPolicy,
    state: DispatchState,
    reclaim_iterations: u32,
}

impl PassState {
    pub fn new(policy: ReclaimPolicy) -> Self {
        Self {
            policy,
            state: DispatchState::Running,
            reclaim_iterations: 0,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn policy(&self) -> ReclaimPolicy {
        self.policy
    }

    pub fn reclaim_iterations(&self) -> u32 {
        self.reclaim_iterations
    }

    pub fn is_halted(&self) -> bool {
        matches!(self.state, DispatchState::Halted(_))
    }

    pub fn halt_reason(&self) -> Option<HaltReason> {
        match self.state {
            DispatchState::Halted(reason) => Some(reason),
            _ => None,
        }
    }

    /// A poll wait elapsed with work outstanding.
    pub fn poll_timed_out(&mut self) {
        if self.state == DispatchState::Running {
            self.state = DispatchState::Draining { iteration: 0 };
        }
    }

    /// All instances finished while running.
    pub fn complete(&mut self) {
        if self.state == DispatchState::Running {
            self.state = DispatchState::Halted(HaltReason::Completed);
        }
    }

    pub fn cancel(&mut self) {
        if !self.is_halted() {
            self.state = DispatchState::Halted(HaltReason::Cancelled);
        }
    }

    /// Records how many instances are still active after the latest signal.
    pub fn reclaim_tick(&mut self, remaining: usize) -> ReclaimStep {
        let DispatchState::Draining { iteration } = self.state else {
            return match self.state {
                DispatchState::Halted(HaltReason::ReclaimExceeded) => ReclaimStep::Exceeded,
                _ => ReclaimStep::Clean,
            };
        };

        if remaining == 0 {
            self.state = DispatchState::Halted(HaltReason::Reclaimed);
            return ReclaimStep::Clean;
        }

        if iteration >= self.policy.max_iterations {
            self.state = DispatchState::Halted(HaltReason::ReclaimExceeded);
            return ReclaimStep::Exceeded;
        }

        let iteration = iteration + 1;
        self.reclaim_iterations = iteration;
        self.state = DispatchState::Draining { iteration };
        ReclaimStep::Continue
    }
}
