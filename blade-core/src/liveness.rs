//! Heartbeat debouncing and the reconnect hand-off.
//!
//! The machine only sees probe outcomes; scheduling and timeouts belong to the runtime.

use crate::DEFAULT_FAILURE_THRESHOLD;

/// Connection badge shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

impl LinkState {
    pub fn label(self) -> &'static str {
        match self {
            LinkState::Connecting => "Connecting...",
            LinkState::Connected => "Connected",
            LinkState::Disconnected => "Disconnected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessPhase {
    /// No monitor running (unauthenticated, or between recovery and restart).
    Idle,
    Monitoring { consecutive_failures: u32 },
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessTransition {
    None,
    Lost,
    Regained,
}

#[derive(Debug, Clone)]
pub struct LivenessMachine {
    phase: LivenessPhase,
    threshold: u32,
}

impl Default for LivenessMachine {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

impl LivenessMachine {
    pub fn new(threshold: u32) -> Self {
        Self {
            phase: LivenessPhase::Idle,
            threshold: threshold.max(1),
        }
    }

    pub fn phase(&self) -> LivenessPhase {
        self.phase
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_reconnecting(&self) -> bool {
        self.phase == LivenessPhase::Reconnecting
    }

    /// (Re)arms the monitor with a zeroed failure counter.
    pub fn start_monitoring(&mut self) {
        self.phase = LivenessPhase::Monitoring {
            consecutive_failures: 0,
        };
    }

    /// Enters the reconnect phase directly. Returns `false` if already reconnecting.
    pub fn begin_reconnecting(&mut self) -> bool {
        if self.is_reconnecting() {
            return false;
        }
        self.phase = LivenessPhase::Reconnecting;
        true
    }

    pub fn stop(&mut self) {
        self.phase = LivenessPhase::Idle;
    }

    pub fn record_probe(&mut self, alive: bool) -> LivenessTransition {
        match self.phase {
            LivenessPhase::Idle => LivenessTransition::None,
            LivenessPhase::Monitoring { .. } if alive => {
                self.start_monitoring();
                LivenessTransition::None
            }
            LivenessPhase::Monitoring {
                consecutive_failures,
            } => {
                let failures = consecutive_failures.saturating_add(1);
                if failures >= self.threshold {
                    self.phase = LivenessPhase::Reconnecting;
                    LivenessTransition::Lost
                } else {
                    self.phase = LivenessPhase::Monitoring {
                        consecutive_failures: failures,
                    };
                    LivenessTransition::None
                }
            }
            LivenessPhase::Reconnecting if alive => {
                self.phase = LivenessPhase::Idle;
                LivenessTransition::Regained
            }
            LivenessPhase::Reconnecting => LivenessTransition::None,
        }
    }
}
