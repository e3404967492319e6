//! Service status: STOPPED -> STARTING -> RUNNING -> STOPPING, stored as a
//! lock-free atomic so reads never contend with the registry mutex.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl Status {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Status::Stopped,
            1 => Status::Starting,
            2 => Status::Running,
            3 => Status::Stopping,
            _ => unreachable!("invalid status byte"),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Stopped => "stopped",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

/// Atomic holder for a Service's status, with a CAS primitive so exactly one
/// caller may observe STOPPED and transition to STARTING.
#[derive(Debug)]
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub fn new(initial: Status) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, status: Status) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    /// Atomically transition from `from` to `to`; returns true if it won the race.
    pub fn try_transition(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl Default for AtomicStatus {
    fn default() -> Self {
        Self::new(Status::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_caller_wins_the_stopped_to_starting_race() {
        let status = AtomicStatus::new(Status::Stopped);
        assert!(status.try_transition(Status::Stopped, Status::Starting));
        assert!(!status.try_transition(Status::Stopped, Status::Starting));
        assert_eq!(status.get(), Status::Starting);
    }

    #[test]
    fn display_matches_lowercase_names() {
        assert_eq!(Status::Stopped.to_string(), "stopped");
        assert_eq!(Status::Running.to_string(), "running");
    }
}
