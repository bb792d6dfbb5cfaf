//! Finished capture data
//!
//! Everything in here is plain immutable data produced by the processing
//! pass; the embedding reads it through an `Arc` snapshot.

use std::collections::HashMap;

use crate::domain::{CallstackId, CpuId, Tid};

/// One function's share of a thread's samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledFunction {
    /// Resolved function start address, or the raw address when no symbol
    /// was found.
    pub address: u64,
    pub name: String,
    pub exclusive: u32,
    pub inclusive: u32,
    /// Percentages relative to this thread's total samples.
    pub exclusive_pct: f32,
    pub inclusive_pct: f32,
    /// Completed entry/exit timers observed for this function.
    pub timer_count: u32,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// An on-CPU interval of one thread, from context-switch records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedSlice {
    pub start_ns: u64,
    pub end_ns: u64,
    pub cpu: CpuId,
}

/// Per-thread sampling results. Thread id 0 is the synthetic process-wide
/// summary when enabled.
#[derive(Debug, Clone, Default)]
pub struct ThreadSampleReport {
    pub tid: Tid,
    pub name: String,
    pub samples: u32,
    /// Occurrences of each resolved call stack.
    pub callstack_counts: HashMap<CallstackId, u32>,
    /// Samples in which the function appeared anywhere in the stack.
    pub inclusive: HashMap<u64, u32>,
    /// Samples in which the function was the leaf.
    pub exclusive: HashMap<u64, u32>,
    /// Sorted by exclusive count descending, ties by address ascending.
    pub functions: Vec<SampledFunction>,
    pub timer_count: u64,
    /// Mean of the usage series collected while sampling, in [0, 1].
    pub average_usage: f32,
    pub slices: Vec<SchedSlice>,
}

/// Non-fatal incident counters, per capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthCounters {
    /// Events the kernel reported dropping (LOST records).
    pub lost_records: u64,
    /// Events dropped on the user side because a queue overran.
    pub dropped_events: u64,
    /// Exit records with no matching entry.
    pub timer_mismatches: u64,
    /// Tracer stdout lines that did not parse.
    pub unparsable_tracer_lines: u64,
    /// Addresses no symbol covered.
    pub symbol_misses: u64,
    /// Timers still open when the capture ended.
    pub discarded_timers: u64,
    /// Probes dropped to fit the descriptor budget.
    pub probes_dropped: u64,
}

/// Immutable result of one capture.
#[derive(Debug, Clone, Default)]
pub struct CaptureReport {
    /// Sorted by thread id; the summary pseudo-thread (id 0) leads when
    /// summary generation was enabled.
    pub threads: Vec<ThreadSampleReport>,
    pub total_samples: u32,
    pub health: HealthCounters,
}

impl CaptureReport {
    #[must_use]
    pub fn thread(&self, tid: Tid) -> Option<&ThreadSampleReport> {
        self.threads.iter().find(|t| t.tid == tid)
    }

    #[must_use]
    pub fn summary(&self) -> Option<&ThreadSampleReport> {
        self.thread(Tid::SUMMARY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lookup() {
        let report = CaptureReport {
            threads: vec![
                ThreadSampleReport { tid: Tid::SUMMARY, ..Default::default() },
                ThreadSampleReport { tid: Tid(42), samples: 7, ..Default::default() },
            ],
            total_samples: 7,
            health: HealthCounters::default(),
        };
        assert_eq!(report.thread(Tid(42)).unwrap().samples, 7);
        assert!(report.summary().is_some());
        assert!(report.thread(Tid(99)).is_none());
    }
}
