//! Newtype identifiers shared across the capture pipeline.

use std::fmt;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread (task) identifier. Tid 0 is reserved for the process-wide summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl Tid {
    /// Synthetic thread carrying the process-wide sample summary.
    pub const SUMMARY: Tid = Tid(0);
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical CPU index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of an interned call stack (hash of the frame sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallstackId(pub u64);

impl fmt::Display for CallstackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A completed entry/exit pair for one instrumented function on one thread.
///
/// `depth` is the number of timers that were already open on the same thread
/// when this one started. Timers on a thread nest strictly (LIFO close).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub tid: Tid,
    pub function: u64,
    pub start_ns: u64,
    pub end_ns: u64,
    pub depth: u8,
}

impl Timer {
    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.end_ns - self.start_ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_duration() {
        let t = Timer { tid: Tid(1), function: 0xdead, start_ns: 1000, end_ns: 1500, depth: 0 };
        assert_eq!(t.duration_ns(), 500);
    }

    #[test]
    fn test_summary_tid() {
        assert_eq!(Tid::SUMMARY, Tid(0));
    }
}
