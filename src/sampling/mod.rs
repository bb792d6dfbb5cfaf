//! The aggregation engine
//!
//! Consumes the merged sample and probe streams while a capture runs, then
//! reduces the accumulated evidence into per-thread reports during the
//! processing pass. One consumer thread owns the profiler during sampling;
//! the state machine is advanced by the coordinator only.

pub mod report;
pub mod usage;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use crate::callstack::CallStackInterner;
use crate::domain::{CallstackId, CpuId, Tid, Timer};
use crate::probes::ProbeEvent;
use crate::sinks::TimerSink;
use crate::symbols::SymbolProvider;

pub use report::{CaptureReport, HealthCounters, SampledFunction, SchedSlice, ThreadSampleReport};
pub use usage::ThreadUsageSampler;

/// Capture lifecycle as the profiler sees it. Transitions are driven by the
/// coordinator only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingState {
    Idle,
    Sampling,
    PendingStop,
    Processing,
    DoneProcessing,
}

/// One stack sample attributed to a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallstackEvent {
    pub time_ns: u64,
    pub callstack: CallstackId,
    pub tid: Tid,
}

#[derive(Default)]
struct ThreadTrack {
    name: String,
    usage_series: Vec<f32>,
}

pub struct SamplingProfiler {
    state: SamplingState,
    generate_summary: bool,
    interner: CallStackInterner,
    /// Sample events per thread, in arrival order.
    events: HashMap<Tid, Vec<CallstackEvent>>,
    /// Open timers per thread. Each stack has exactly one writer.
    timer_stacks: HashMap<Tid, Vec<Timer>>,
    /// Closed-timer counts per thread and function.
    timer_counts: HashMap<Tid, HashMap<u64, u32>>,
    threads: HashMap<Tid, ThreadTrack>,
    /// Last switch-in per thread, awaiting its switch-out.
    sched_in: HashMap<Tid, (u64, CpuId)>,
    slices: HashMap<Tid, Vec<SchedSlice>>,
    health: HealthCounters,
    symbol_misses: u64,
    report: Option<Arc<CaptureReport>>,
}

impl SamplingProfiler {
    #[must_use]
    pub fn new(generate_summary: bool) -> Self {
        Self {
            state: SamplingState::Idle,
            generate_summary,
            interner: CallStackInterner::new(),
            events: HashMap::new(),
            timer_stacks: HashMap::new(),
            timer_counts: HashMap::new(),
            threads: HashMap::new(),
            sched_in: HashMap::new(),
            slices: HashMap::new(),
            health: HealthCounters::default(),
            symbol_misses: 0,
            report: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> SamplingState {
        self.state
    }

    pub fn health_mut(&mut self) -> &mut HealthCounters {
        &mut self.health
    }

    /// Seed the thread set known at capture start, so threads that never
    /// produce an event still appear in the report.
    pub fn seed_thread(&mut self, tid: Tid, name: String) {
        self.threads.entry(tid).or_default().name = name;
    }

    pub fn start_sampling(&mut self) {
        debug_assert_eq!(self.state, SamplingState::Idle);
        self.state = SamplingState::Sampling;
    }

    pub fn request_stop(&mut self) {
        if self.state == SamplingState::Sampling {
            self.state = SamplingState::PendingStop;
        }
    }

    /// Intern a raw stack and queue the sample. A no-op outside Sampling.
    pub fn add_callstack(&mut self, tid: Tid, time_ns: u64, frames: Vec<u64>) {
        if self.state != SamplingState::Sampling || frames.is_empty() {
            return;
        }
        let callstack = self.interner.intern_raw(frames);
        self.threads.entry(tid).or_default();
        self.events
            .entry(tid)
            .or_default()
            .push(CallstackEvent { time_ns, callstack, tid });
    }

    /// Pair one probe record against the thread's timer stack. Entries push
    /// an open timer; exits close the top timer if it matches, otherwise the
    /// record is dropped and counted.
    pub fn handle_probe(&mut self, event: ProbeEvent, sink: &dyn TimerSink) {
        if !matches!(self.state, SamplingState::Sampling | SamplingState::PendingStop) {
            return;
        }
        self.threads.entry(event.tid).or_default();
        let stack = self.timer_stacks.entry(event.tid).or_default();

        if event.enter {
            #[allow(clippy::cast_possible_truncation)]
            let depth = stack.len().min(u8::MAX as usize) as u8;
            stack.push(Timer {
                tid: event.tid,
                function: event.function,
                start_ns: event.time_ns,
                end_ns: 0,
                depth,
            });
            return;
        }

        match stack.last() {
            Some(open) if open.function == event.function => {
                let mut timer = stack.pop().unwrap();
                timer.end_ns = event.time_ns;
                *self
                    .timer_counts
                    .entry(event.tid)
                    .or_default()
                    .entry(timer.function)
                    .or_insert(0) += 1;
                sink.on_timer(&timer);
            }
            _ => {
                self.health.timer_mismatches += 1;
                debug!(
                    "exit for {:#x} on thread {} without matching entry",
                    event.function, event.tid
                );
            }
        }
    }

    pub fn thread_spawned(&mut self, tid: Tid, name: String) {
        let track = self.threads.entry(tid).or_default();
        if track.name.is_empty() {
            track.name = name;
        }
    }

    /// Thread exit discards its open timers; entries without exits are
    /// meaningless once the thread is gone.
    pub fn thread_exited(&mut self, tid: Tid) {
        if let Some(stack) = self.timer_stacks.get_mut(&tid) {
            if !stack.is_empty() {
                debug!("discarding {} open timers of exited thread {tid}", stack.len());
                stack.clear();
            }
        }
        self.sched_in.remove(&tid);
    }

    pub fn context_switch(&mut self, tid: Tid, cpu: CpuId, time_ns: u64, switch_out: bool) {
        if switch_out {
            if let Some((start_ns, cpu)) = self.sched_in.remove(&tid) {
                self.slices
                    .entry(tid)
                    .or_default()
                    .push(SchedSlice { start_ns, end_ns: time_ns, cpu });
            }
        } else {
            self.sched_in.insert(tid, (time_ns, cpu));
        }
    }

    /// Context switch reconstructed from a CPU-wide sched_switch sample:
    /// the previous task leaves the CPU, the next one enters it. Only
    /// threads this capture tracks are recorded.
    pub fn tracepoint_switch(&mut self, prev: Tid, next: Tid, cpu: CpuId, time_ns: u64) {
        if self.threads.contains_key(&prev) {
            self.context_switch(prev, cpu, time_ns, true);
        }
        if self.threads.contains_key(&next) {
            self.context_switch(next, cpu, time_ns, false);
        }
    }

    pub fn record_lost(&mut self, count: u64) {
        self.health.lost_records += count;
    }

    pub fn record_usage(&mut self, tid: Tid, fraction: f32) {
        self.threads.entry(tid).or_default().usage_series.push(fraction);
    }

    /// Reduce the accumulated evidence into the immutable report. Runs
    /// single threaded; re-running on the same input yields an identical
    /// report.
    pub fn process(&mut self, symbols: &dyn SymbolProvider) -> Arc<CaptureReport> {
        self.state = SamplingState::Processing;

        // Open timers at capture end are discarded, not closed.
        self.health.discarded_timers =
            self.timer_stacks.values().map(|s| s.len() as u64).sum();

        let mut tids: Vec<Tid> = self
            .threads
            .keys()
            .chain(self.events.keys())
            .chain(self.timer_counts.keys())
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        tids.sort_unstable();

        let mut threads = Vec::with_capacity(tids.len() + 1);
        let mut summary_events: Vec<CallstackEvent> = Vec::new();
        let mut summary_timers: HashMap<u64, u32> = HashMap::new();

        for tid in tids {
            let events = self.events.get(&tid).cloned().unwrap_or_default();
            if self.generate_summary {
                summary_events.extend(events.iter().copied());
                for (&function, &count) in
                    self.timer_counts.get(&tid).into_iter().flatten()
                {
                    *summary_timers.entry(function).or_insert(0) += count;
                }
            }
            let thread = self.reduce_thread(tid, &events, symbols);
            threads.push(thread);
        }

        if self.generate_summary {
            let mut summary = self.reduce_thread(Tid::SUMMARY, &summary_events, symbols);
            summary.name = "process".into();
            summary.timer_count = summary_timers.values().map(|&c| u64::from(c)).sum();
            threads.insert(0, summary);
        }

        self.health.symbol_misses = self.symbol_misses;
        let total_samples = self.events.values().map(|e| e.len() as u32).sum();
        let report =
            Arc::new(CaptureReport { threads, total_samples, health: self.health });

        self.state = SamplingState::DoneProcessing;
        self.report = Some(Arc::clone(&report));
        report
    }

    fn reduce_thread(
        &mut self,
        tid: Tid,
        events: &[CallstackEvent],
        symbols: &dyn SymbolProvider,
    ) -> ThreadSampleReport {
        let mut callstack_counts: HashMap<CallstackId, u32> = HashMap::new();
        let mut inclusive: HashMap<u64, u32> = HashMap::new();
        let mut exclusive: HashMap<u64, u32> = HashMap::new();

        for event in events {
            let resolved_id =
                self.interner
                    .resolve(event.callstack, symbols, &mut self.symbol_misses);
            *callstack_counts.entry(resolved_id).or_insert(0) += 1;

            let Some(resolved) = self.interner.resolved(resolved_id) else { continue };
            if let Some(leaf) = resolved.leaf() {
                *exclusive.entry(leaf).or_insert(0) += 1;
            }
            // Credit inclusive once per distinct address so recursion does
            // not over-credit.
            let mut seen = HashSet::new();
            for &addr in &resolved.frames {
                if seen.insert(addr) {
                    *inclusive.entry(addr).or_insert(0) += 1;
                }
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let samples = events.len() as u32;
        let timer_counts = self.timer_counts.get(&tid).cloned().unwrap_or_default();
        let functions =
            build_function_report(&inclusive, &exclusive, &timer_counts, samples, symbols);

        let track = self.threads.get(&tid);
        let average_usage = track
            .map(|t| &t.usage_series)
            .filter(|series| !series.is_empty())
            .map_or(0.0, |series| series.iter().sum::<f32>() / series.len() as f32);

        ThreadSampleReport {
            tid,
            name: track.map(|t| t.name.clone()).unwrap_or_default(),
            samples,
            callstack_counts,
            inclusive,
            exclusive,
            functions,
            timer_count: timer_counts.values().map(|&c| u64::from(c)).sum(),
            average_usage,
            slices: self.slices.get(&tid).cloned().unwrap_or_default(),
        }
    }

    /// Snapshot of the finished report; present only after processing.
    #[must_use]
    pub fn report(&self) -> Option<Arc<CaptureReport>> {
        self.report.clone()
    }
}

fn build_function_report(
    inclusive: &HashMap<u64, u32>,
    exclusive: &HashMap<u64, u32>,
    timer_counts: &HashMap<u64, u32>,
    samples: u32,
    symbols: &dyn SymbolProvider,
) -> Vec<SampledFunction> {
    let addresses: HashSet<u64> =
        inclusive.keys().chain(timer_counts.keys()).copied().collect();

    let mut functions: Vec<SampledFunction> = addresses
        .into_iter()
        .map(|address| {
            let exclusive_count = exclusive.get(&address).copied().unwrap_or(0);
            let inclusive_count = inclusive.get(&address).copied().unwrap_or(0);
            let pct = |count: u32| {
                if samples == 0 {
                    0.0
                } else {
                    100.0 * count as f32 / samples as f32
                }
            };
            let (name, file, line) = match symbols.resolve(address) {
                Some(symbol) => {
                    let location = symbols.line_info(address);
                    let (file, line) = match location {
                        Some((f, l)) => (Some(f), Some(l)),
                        None => (None, None),
                    };
                    (symbol.name, file, line)
                }
                None => (format!("{address:#x}"), None, None),
            };
            SampledFunction {
                address,
                name,
                exclusive: exclusive_count,
                inclusive: inclusive_count,
                exclusive_pct: pct(exclusive_count),
                inclusive_pct: pct(inclusive_count),
                timer_count: timer_counts.get(&address).copied().unwrap_or(0),
                file,
                line,
            }
        })
        .collect();

    functions.sort_by(|a, b| {
        b.exclusive.cmp(&a.exclusive).then_with(|| a.address.cmp(&b.address))
    });
    functions
}
