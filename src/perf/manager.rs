//! Ownership of the per-CPU ring fleet
//!
//! One task-tracking ring and one context-switch ring per CPU, one sampling
//! ring per CPU, and an entry/return ring pair per selected function per CPU
//! when kernel uprobes are in use. All rings are created disabled and flipped
//! together, and all are drained by a single poll-driven consumer.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;

use log::{debug, warn};

use crate::domain::{CaptureError, CpuId, Pid};
use crate::perf::records::{parse_record, PerfRecord, SampleLayout};
use crate::perf::ring::PerfRing;
use crate::perf::sys;

/// What a ring was opened for. Drives payload interpretation and, for probe
/// rings, carries the instrumented function's virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    TaskTracking,
    ContextSwitch,
    /// Context switches reconstructed from the sched_switch tracepoint on
    /// kernels without the dedicated record type.
    ContextSwitchTracepoint,
    Sampling,
    UprobeEntry { function: u64 },
    UprobeReturn { function: u64 },
}

impl RingKind {
    fn layout(self) -> SampleLayout {
        match self {
            RingKind::Sampling => SampleLayout::Callchain,
            RingKind::ContextSwitchTracepoint => SampleLayout::SchedSwitchRaw,
            _ => SampleLayout::TidTime,
        }
    }
}

/// Sizing knobs for the fleet.
#[derive(Debug, Clone, Copy)]
pub struct RingBudget {
    /// Data pages per ring; must be a power of two.
    pub ring_pages: usize,
    /// Ceiling on total mapped bytes across all rings.
    pub max_mapped_bytes: usize,
}

impl Default for RingBudget {
    fn default() -> Self {
        Self { ring_pages: 64, max_mapped_bytes: 64 * 1024 * 1024 }
    }
}

struct ManagedRing {
    kind: RingKind,
    cpu: CpuId,
    layout: SampleLayout,
    ring: PerfRing,
}

pub struct PerfRingManager {
    pid: Pid,
    budget: RingBudget,
    rings: Vec<ManagedRing>,
    mapped_bytes: usize,
}

impl PerfRingManager {
    #[must_use]
    pub fn new(pid: Pid, budget: RingBudget) -> Self {
        Self { pid, budget, rings: Vec::new(), mapped_bytes: 0 }
    }

    #[must_use]
    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    /// Task-tracking ring: thread creation/exit plus executable mappings.
    ///
    /// # Errors
    /// Fatal open or mapping failure.
    pub fn open_task_tracking(&mut self, cpu: CpuId) -> Result<(), CaptureError> {
        let mut attr = sys::base_attr();
        attr.type_ = sys::PERF_TYPE_SOFTWARE;
        attr.config = sys::PERF_COUNT_SW_DUMMY;
        attr.flags |= sys::ATTR_TASK | sys::ATTR_MMAP | sys::ATTR_MMAP2;
        attr.sample_type = sys::PERF_SAMPLE_TID | sys::PERF_SAMPLE_TIME;

        let fd = self.open(&attr, cpu)?;
        self.add_ring(fd, RingKind::TaskTracking, cpu)
    }

    /// Context-switch ring. On kernels without `context_switch` support this
    /// falls back to the sched_switch tracepoint; if that is unavailable too,
    /// the feature is reported unsupported so the caller can disable it with
    /// a warning.
    ///
    /// # Errors
    /// `KernelUnsupported` when no switch source exists; otherwise fatal
    /// open or mapping failures.
    pub fn open_context_switch(&mut self, cpu: CpuId) -> Result<(), CaptureError> {
        let mut attr = sys::base_attr();
        attr.type_ = sys::PERF_TYPE_SOFTWARE;
        attr.config = sys::PERF_COUNT_SW_DUMMY;
        attr.flags |= sys::ATTR_CONTEXT_SWITCH;
        attr.sample_type = sys::PERF_SAMPLE_TID | sys::PERF_SAMPLE_TIME;

        match self.open(&attr, cpu) {
            Ok(fd) => self.add_ring(fd, RingKind::ContextSwitch, cpu),
            Err(CaptureError::KernelUnsupported { .. }) => {
                debug!("context_switch records unsupported, trying sched_switch tracepoint");
                self.open_switch_tracepoint(cpu)
            }
            Err(err) => Err(err),
        }
    }

    fn open_switch_tracepoint(&mut self, cpu: CpuId) -> Result<(), CaptureError> {
        let Some(tp_id) = sys::tracepoint_id("sched", "sched_switch") else {
            return Err(CaptureError::KernelUnsupported { feature: "context switch records" });
        };
        let mut attr = sys::base_attr();
        attr.type_ = sys::PERF_TYPE_TRACEPOINT;
        attr.config = tp_id;
        attr.sample_type = sys::PERF_SAMPLE_TID | sys::PERF_SAMPLE_TIME | sys::PERF_SAMPLE_RAW;

        let fd = self.open(&attr, cpu)?;
        self.add_ring(fd, RingKind::ContextSwitchTracepoint, cpu)
    }

    /// Stack-sampling ring on the monotonic CPU clock. Without
    /// `collect_stacks` the samples carry timestamps only.
    ///
    /// # Errors
    /// Fatal open or mapping failure.
    pub fn open_sampling(
        &mut self,
        cpu: CpuId,
        period_ns: u64,
        collect_stacks: bool,
    ) -> Result<(), CaptureError> {
        let mut attr = sys::base_attr();
        attr.type_ = sys::PERF_TYPE_SOFTWARE;
        attr.config = sys::PERF_COUNT_SW_CPU_CLOCK;
        attr.sample_period = period_ns;
        attr.sample_type = sys::PERF_SAMPLE_TID | sys::PERF_SAMPLE_TIME;
        attr.flags |= sys::ATTR_EXCLUDE_KERNEL | sys::ATTR_EXCLUDE_HV;
        let layout = if collect_stacks {
            attr.sample_type |= sys::PERF_SAMPLE_CALLCHAIN;
            attr.flags |= sys::ATTR_EXCLUDE_CALLCHAIN_KERNEL;
            attr.sample_max_stack = 127;
            SampleLayout::Callchain
        } else {
            SampleLayout::TidTime
        };

        let fd = self.open(&attr, cpu)?;
        self.insert_ring(fd, RingKind::Sampling, cpu, layout)
    }

    /// Adopt an externally opened event fd (uprobes) into the fleet.
    ///
    /// # Errors
    /// `ResourceExhausted` when the mapping would exceed the byte ceiling.
    pub fn add_ring(
        &mut self,
        fd: OwnedFd,
        kind: RingKind,
        cpu: CpuId,
    ) -> Result<(), CaptureError> {
        self.insert_ring(fd, kind, cpu, kind.layout())
    }

    fn insert_ring(
        &mut self,
        fd: OwnedFd,
        kind: RingKind,
        cpu: CpuId,
        layout: SampleLayout,
    ) -> Result<(), CaptureError> {
        let ring = PerfRing::new(fd, self.budget.ring_pages)?;
        if self.mapped_bytes + ring.mapped_len() > self.budget.max_mapped_bytes {
            return Err(CaptureError::ResourceExhausted(format!(
                "ring memory ceiling of {} bytes reached with {} rings",
                self.budget.max_mapped_bytes,
                self.rings.len()
            )));
        }
        self.mapped_bytes += ring.mapped_len();
        self.rings.push(ManagedRing { kind, cpu, layout, ring });
        Ok(())
    }

    fn open(&self, attr: &sys::PerfEventAttr, cpu: CpuId) -> Result<OwnedFd, CaptureError> {
        sys::perf_event_open(attr, self.pid.0, cpu.0 as i32, -1, sys::PERF_FLAG_FD_CLOEXEC)
            .map_err(|err| map_open_error(&err, self.pid))
    }

    pub fn enable_all(&self) {
        for managed in &self.rings {
            if let Err(err) = managed.ring.enable() {
                warn!("enabling {:?} ring on cpu {}: {err}", managed.kind, managed.cpu);
            }
        }
    }

    pub fn disable_all(&self) {
        for managed in &self.rings {
            let _ = managed.ring.disable();
        }
    }

    /// Block until at least one ring has pending records, or the timeout
    /// elapses. Returns whether any fd reported readiness.
    ///
    /// # Errors
    /// Propagates the poll failure.
    pub fn poll(&self, timeout: Duration) -> io::Result<bool> {
        if self.rings.is_empty() {
            std::thread::sleep(timeout);
            return Ok(false);
        }
        let mut fds: Vec<libc::pollfd> = self
            .rings
            .iter()
            .map(|m| libc::pollfd { fd: m.ring.raw_fd(), events: libc::POLLIN, revents: 0 })
            .collect();
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        // SAFETY: fds points at a live, correctly sized pollfd array
        let ready =
            unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(ready > 0)
    }

    /// Drain every ring, handing each parsed record to `consume` together
    /// with the owning ring's kind. Within one ring records arrive in kernel
    /// timestamp order; across rings only the timestamps order them.
    pub fn drain(&mut self, mut consume: impl FnMut(RingKind, CpuId, PerfRecord)) {
        for managed in &mut self.rings {
            let layout = managed.layout;
            while let Some(raw) = managed.ring.pop_record() {
                let record = parse_record(&raw, layout);
                if let PerfRecord::Unknown { kind } = record {
                    debug!("skipping unknown record type {kind} on {:?} ring", managed.kind);
                    continue;
                }
                consume(managed.kind, managed.cpu, record);
            }
        }
    }
}

fn map_open_error(err: &io::Error, pid: Pid) -> CaptureError {
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EPERM) => {
            CaptureError::PermissionDenied("perf_event_open".into())
        }
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM) => {
            CaptureError::ResourceExhausted(format!("perf_event_open: {err}"))
        }
        Some(libc::EINVAL) | Some(libc::ENOENT) | Some(libc::EOPNOTSUPP) => {
            CaptureError::KernelUnsupported { feature: "requested perf event" }
        }
        Some(libc::ESRCH) => CaptureError::ProcessGone(pid),
        _ => CaptureError::Io(io::Error::new(err.kind(), err.to_string())),
    }
}

/// Raise the open-files soft limit toward the hard limit. Returns the limit
/// now in effect.
///
/// # Errors
/// Propagates getrlimit/setrlimit failures.
pub fn raise_open_files_limit() -> io::Result<u64> {
    let mut limit = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: limit points at a live rlimit struct
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if limit.rlim_cur >= limit.rlim_max {
        return Ok(limit.rlim_cur);
    }
    limit.rlim_cur = limit.rlim_max;
    // SAFETY: limit holds valid soft <= hard values
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(limit.rlim_cur)
}

/// Descriptors the fleet needs for `num_probes` instrumented functions:
/// task + switch + sampling rings per CPU, plus an entry/return pair per
/// probe per CPU.
#[must_use]
pub fn descriptors_needed(num_cpus: usize, num_probes: usize) -> u64 {
    (num_cpus * (3 + num_probes * 2)) as u64
}

/// Slack left for files the process has open besides the rings.
const FD_HEADROOM: u64 = 32;

/// Shrink the probe set until the descriptor budget fits `limit`.
/// Returns `(probes_kept, probes_dropped)`.
#[must_use]
pub fn plan_probe_coverage(num_cpus: usize, num_probes: usize, limit: u64) -> (usize, usize) {
    let mut kept = num_probes;
    while kept > 0 && descriptors_needed(num_cpus, kept) + FD_HEADROOM > limit {
        kept -= 1;
    }
    (kept, num_probes - kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptors_needed() {
        assert_eq!(descriptors_needed(4, 0), 12);
        assert_eq!(descriptors_needed(4, 10), 4 * 23);
    }

    #[test]
    fn test_plan_keeps_all_when_limit_is_high() {
        assert_eq!(plan_probe_coverage(4, 10, 4096), (10, 0));
    }

    #[test]
    fn test_plan_shrinks_probes() {
        // 8 cpus: base 24 fds, each probe adds 16
        let (kept, dropped) = plan_probe_coverage(8, 100, 256);
        assert!(kept < 100);
        assert_eq!(kept + dropped, 100);
        assert!(descriptors_needed(8, kept) + FD_HEADROOM <= 256);
    }

    #[test]
    fn test_plan_can_drop_everything() {
        assert_eq!(plan_probe_coverage(8, 5, 0).0, 0);
    }

    #[test]
    fn test_budget_default() {
        let budget = RingBudget::default();
        assert!(budget.ring_pages.is_power_of_two());
        assert_eq!(budget.max_mapped_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_raise_open_files_limit() {
        let limit = raise_open_files_limit().unwrap();
        assert!(limit > 0);
    }
}
