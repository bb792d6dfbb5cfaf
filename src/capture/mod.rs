//! Top-level capture orchestration
//!
//! The coordinator owns everything with a lifetime: the ring fleet, the
//! probe installation, the reader threads and the aggregation engine. Its
//! visible state machine is start → stop → snapshot; everything in between
//! runs on named worker threads connected by bounded queues, one per
//! producer. Producers observe a shared cancellation flag and exit within
//! one poll interval of it being set.

mod queue;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::attach::AttachController;
use crate::domain::{CaptureError, CpuId, Pid, Tid};
use crate::inspect::{self, cpuset};
use crate::perf::manager::{
    plan_probe_coverage, raise_open_files_limit, PerfRingManager, RingBudget, RingKind,
};
use crate::perf::records::PerfRecord;
use crate::probes::tracer::{write_probe_script, TracerProcess};
use crate::probes::uprobe;
use crate::probes::{KernelVersion, ProbeEvent, ProbeMode, SelectedProbe};
use crate::sampling::{CaptureReport, SamplingProfiler};
use crate::sinks::{LogSink, RefreshSink, StatusSink, TimerSink, ViewKind};
use crate::symbols::SymbolProvider;

use queue::{spill_queue, SpillQueue};

/// How long ring readers may sleep between cancellation checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capture tuning knobs and their defaults.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Sampling and usage-snapshot period in milliseconds.
    pub sample_period_ms: u64,
    /// Also build the process-wide pseudo-thread (id 0).
    pub generate_summary: bool,
    /// Capture user call chains with each sample.
    pub collect_user_stacks: bool,
    /// Record context switches for per-thread timelines.
    pub context_switches: bool,
    /// Resolve file and line for functions while loading modules.
    pub find_file_and_line: bool,
    pub probe_mode: ProbeMode,
    /// Tracer binary for the fallback probe mode.
    pub tracer_binary: PathBuf,
    pub ring_budget: RingBudget,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            sample_period_ms: 1,
            generate_summary: true,
            collect_user_stacks: true,
            context_switches: true,
            find_file_and_line: true,
            probe_mode: ProbeMode::Auto,
            tracer_binary: PathBuf::from("bpftrace"),
            ring_budget: RingBudget::default(),
        }
    }
}

/// Everything a capture needs from its embedding. Background threads receive
/// this by shared reference; there are no process-wide globals.
#[derive(Clone)]
pub struct CaptureContext {
    pub symbols: Arc<dyn SymbolProvider>,
    pub timers: Arc<dyn TimerSink>,
    pub status: Arc<dyn StatusSink>,
    pub refresh: Arc<dyn RefreshSink>,
}

impl CaptureContext {
    /// Context with log-backed sinks, for headless embeddings.
    #[must_use]
    pub fn new(symbols: Arc<dyn SymbolProvider>) -> Self {
        Self {
            symbols,
            timers: Arc::new(LogSink),
            status: Arc::new(LogSink),
            refresh: Arc::new(LogSink),
        }
    }
}

/// Events flowing from the ring consumer to the aggregation engine.
#[derive(Debug, Clone)]
enum CaptureEvent {
    Sample { tid: Tid, time_ns: u64, frames: Vec<u64> },
    ThreadSpawned { tid: Tid },
    ThreadExited { tid: Tid },
    ContextSwitch { tid: Tid, cpu: CpuId, time_ns: u64, switch_out: bool },
    TracepointSwitch { prev: Tid, next: Tid, cpu: CpuId, time_ns: u64 },
    Lost { count: u64 },
}

struct ActiveCapture {
    pid: Pid,
    cancel: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    probes_dropped: u64,
    ring_reader: JoinHandle<()>,
    usage_sampler: JoinHandle<()>,
    consumer: JoinHandle<SamplingProfiler>,
    tracer: Option<TracerProcess>,
}

pub struct CaptureCoordinator {
    ctx: CaptureContext,
    active: Option<ActiveCapture>,
    report: Option<Arc<CaptureReport>>,
}

impl CaptureCoordinator {
    #[must_use]
    pub fn new(ctx: CaptureContext) -> Self {
        Self { ctx, active: None, report: None }
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.active.is_some()
    }

    /// Snapshot of the last finished capture.
    ///
    /// # Errors
    /// `NoReport` before the first capture has finished processing.
    pub fn snapshot(&self) -> Result<Arc<CaptureReport>, CaptureError> {
        if self.is_capturing() {
            return Err(CaptureError::NoReport);
        }
        self.report.clone().ok_or(CaptureError::NoReport)
    }

    /// Quiesce the target, install probes and rings, and start sampling.
    ///
    /// # Errors
    /// Fatal configuration failures per the error taxonomy; on any error the
    /// target is resumed and partial state is torn down.
    pub fn start(
        &mut self,
        pid: Pid,
        selected: Vec<SelectedProbe>,
        options: &CaptureOptions,
    ) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Err(CaptureError::CaptureInProgress);
        }
        if !inspect::process_exists(pid) {
            return Err(CaptureError::ProcessGone(pid));
        }

        self.ctx.status.progress("snapshotting modules");
        let modules = self.ctx.symbols.modules(pid);
        info!("target {pid}: {} modules", modules.len());

        self.ctx.status.progress("stopping target threads");
        let mut attacher = AttachController::new(pid);
        attacher.attach_and_stop()?;

        let result = self.configure_and_launch(pid, selected, options);
        // The target resumes whether or not configuration succeeded.
        attacher.detach_and_resume();

        match result {
            Ok(active) => {
                self.active = Some(active);
                self.ctx.status.info("capture", "sampling started");
                Ok(())
            }
            Err(err) => {
                self.ctx.status.error("capture", &err.to_string());
                Err(err)
            }
        }
    }

    fn configure_and_launch(
        &self,
        pid: Pid,
        mut selected: Vec<SelectedProbe>,
        options: &CaptureOptions,
    ) -> Result<ActiveCapture, CaptureError> {
        let cpus = cpuset::cpuset_cpus(pid);
        info!("target cpuset: {}", cpuset::format_cpuset(&cpus));

        let fd_limit = raise_open_files_limit().unwrap_or(1024);
        let (kept, dropped_probes) = plan_probe_coverage(cpus.len(), selected.len(), fd_limit);
        if dropped_probes > 0 {
            self.ctx.status.info(
                "capture",
                &format!(
                    "descriptor budget covers {kept} of {} selected functions",
                    selected.len()
                ),
            );
            selected.truncate(kept);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicU64::new(0));
        let (ring_q, ring_rx) = spill_queue::<CaptureEvent>(65536, Arc::clone(&dropped));
        let (probe_q, probe_rx) = spill_queue::<ProbeEvent>(16384, Arc::clone(&dropped));
        let (usage_q, usage_rx) = spill_queue::<(Tid, f32)>(4096, Arc::clone(&dropped));

        let mut manager = PerfRingManager::new(pid, options.ring_budget);
        let period_ns = options.sample_period_ms.max(1) * 1_000_000;
        let mut switch_records = options.context_switches;
        for &cpu in &cpus {
            manager.open_task_tracking(cpu)?;
            manager.open_sampling(cpu, period_ns, options.collect_user_stacks)?;
            if switch_records {
                match manager.open_context_switch(cpu) {
                    Ok(()) => {}
                    Err(CaptureError::KernelUnsupported { feature }) => {
                        self.ctx
                            .status
                            .info("capture", &format!("{feature} unavailable, disabled"));
                        switch_records = false;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let tracer = self.install_probes(&mut manager, &selected, pid, &cpus, options, {
            let probe_q = probe_q.clone();
            move |event| probe_q.push(event)
        })?;

        manager.enable_all();
        info!(
            "{} rings mapped ({} KiB)",
            manager.ring_count(),
            manager.mapped_bytes() / 1024
        );

        let mut profiler = SamplingProfiler::new(options.generate_summary);
        for tid in inspect::list_threads(pid)? {
            profiler.seed_thread(tid, inspect::thread_name(tid));
        }
        profiler.start_sampling();

        let ring_reader = spawn_ring_reader(manager, ring_q, probe_q, Arc::clone(&cancel))?;
        let usage_sampler = spawn_usage_sampler(
            pid,
            usage_q,
            Arc::clone(&cancel),
            Duration::from_millis(options.sample_period_ms.max(1)),
        )?;
        let consumer = spawn_consumer(
            profiler,
            ring_rx,
            probe_rx,
            usage_rx,
            Arc::clone(&cancel),
            Arc::clone(&self.ctx.timers),
        )?;

        Ok(ActiveCapture {
            pid,
            cancel,
            dropped,
            probes_dropped: dropped_probes as u64,
            ring_reader,
            usage_sampler,
            consumer,
            tracer,
        })
    }

    /// Install entry/exit instrumentation in the resolved probe mode.
    /// Kernel-mode failures under `Auto` downgrade to the tracer.
    fn install_probes(
        &self,
        manager: &mut PerfRingManager,
        selected: &[SelectedProbe],
        pid: Pid,
        cpus: &[CpuId],
        options: &CaptureOptions,
        on_event: impl FnMut(ProbeEvent) + Send + 'static,
    ) -> Result<Option<TracerProcess>, CaptureError> {
        if selected.is_empty() {
            return Ok(None);
        }

        let kernel = KernelVersion::current()
            .unwrap_or(KernelVersion { major: 0, minor: 0, patch: 0 });
        let mode = options.probe_mode.resolve(kernel);

        if mode == ProbeMode::Kernel {
            match self.install_kernel_uprobes(manager, selected, pid, cpus) {
                Ok(()) => return Ok(None),
                Err(err @ CaptureError::KernelUnsupported { .. })
                    if options.probe_mode == ProbeMode::Auto =>
                {
                    warn!("kernel uprobes unavailable ({err}), using tracer");
                }
                Err(err) => return Err(err),
            }
        }

        if selected.iter().all(|p| p.probe_name.is_none()) {
            warn!("none of the selected functions carries a probe spec");
            return Ok(None);
        }
        let script = write_probe_script(selected)?;
        let tracer = TracerProcess::spawn(
            &options.tracer_binary,
            &script,
            Arc::new(AtomicBool::new(false)),
            on_event,
        )?;
        info!("tracer started on {}", script.display());
        Ok(Some(tracer))
    }

    fn install_kernel_uprobes(
        &self,
        manager: &mut PerfRingManager,
        selected: &[SelectedProbe],
        pid: Pid,
        cpus: &[CpuId],
    ) -> Result<(), CaptureError> {
        let pmu_type = uprobe::uprobe_pmu_type()?;
        for probe in selected {
            for &cpu in cpus {
                let (entry, ret) = uprobe::open_uprobe_pair(pmu_type, probe, pid, cpu)?;
                manager.add_ring(entry, RingKind::UprobeEntry { function: probe.vaddr }, cpu)?;
                manager.add_ring(ret, RingKind::UprobeReturn { function: probe.vaddr }, cpu)?;
            }
        }
        info!("{} functions instrumented via kernel uprobes", selected.len());
        Ok(())
    }

    /// Stop sampling, drain the pipeline, run processing and publish the
    /// report.
    ///
    /// # Errors
    /// `NotCapturing` when no capture is running.
    pub fn stop(&mut self) -> Result<Arc<CaptureReport>, CaptureError> {
        let active = self.active.take().ok_or(CaptureError::NotCapturing)?;

        self.ctx.status.progress("stopping capture");
        active.cancel.store(true, Ordering::Relaxed);

        // Producers observe the flag within one poll interval; joining them
        // disconnects their queues, which lets the consumer finish draining.
        if active.ring_reader.join().is_err() {
            warn!("ring reader thread panicked");
        }
        let tracer_stats = active.tracer.map(TracerProcess::stop);
        if active.usage_sampler.join().is_err() {
            warn!("usage sampler thread panicked");
        }

        let mut profiler = active
            .consumer
            .join()
            .map_err(|_| CaptureError::TracerFailed("event consumer panicked".into()))?;

        let health = profiler.health_mut();
        health.dropped_events = active.dropped.load(Ordering::Relaxed);
        health.probes_dropped = active.probes_dropped;
        if let Some(stats) = tracer_stats {
            health.unparsable_tracer_lines = stats.unparsable_lines;
            if !stats.exited_cleanly {
                self.ctx.status.error("tracer", "tracer exited uncleanly; keeping samples");
            }
        }

        self.ctx.status.progress("processing samples");
        let symbols = Arc::clone(&self.ctx.symbols);
        let processor = thread::Builder::new()
            .name("strobe-process".into())
            .spawn(move || {
                let report = profiler.process(&*symbols);
                (profiler, report)
            })
            .map_err(CaptureError::Io)?;
        let (_profiler, report) = processor
            .join()
            .map_err(|_| CaptureError::TracerFailed("processing panicked".into()))?;

        info!(
            "capture of {} finished: {} samples, {} threads",
            active.pid,
            report.total_samples,
            report.threads.len()
        );
        self.report = Some(Arc::clone(&report));
        self.ctx.refresh.on_data_changed(ViewKind::SampleReport);
        self.ctx.refresh.on_data_changed(ViewKind::Timeline);
        self.ctx.status.info("capture", "done");
        Ok(report)
    }
}

fn spawn_ring_reader(
    mut manager: PerfRingManager,
    ring_q: SpillQueue<CaptureEvent>,
    probe_q: SpillQueue<ProbeEvent>,
    cancel: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, CaptureError> {
    let handle = thread::Builder::new()
        .name("strobe-rings".into())
        .spawn(move || {
            loop {
                if let Err(err) = manager.poll(POLL_INTERVAL) {
                    warn!("ring poll failed: {err}");
                    break;
                }
                manager.drain(|kind, cpu, record| {
                    dispatch_record(kind, cpu, record, &ring_q, &probe_q);
                });
                if cancel.load(Ordering::Relaxed) {
                    manager.disable_all();
                    // One final drain for records that landed before the
                    // rings went quiet.
                    manager.drain(|kind, cpu, record| {
                        dispatch_record(kind, cpu, record, &ring_q, &probe_q);
                    });
                    break;
                }
            }
            // Dropping the manager unmaps the rings and closes the fds.
        })
        .map_err(CaptureError::Io)?;
    Ok(handle)
}

fn dispatch_record(
    kind: RingKind,
    cpu: CpuId,
    record: PerfRecord,
    ring_q: &SpillQueue<CaptureEvent>,
    probe_q: &SpillQueue<ProbeEvent>,
) {
    match (kind, record) {
        (RingKind::UprobeEntry { function }, PerfRecord::Sample { tid, time_ns, .. }) => {
            probe_q.push(ProbeEvent { enter: true, function, tid: Tid(tid), time_ns });
        }
        (RingKind::UprobeReturn { function }, PerfRecord::Sample { tid, time_ns, .. }) => {
            probe_q.push(ProbeEvent { enter: false, function, tid: Tid(tid), time_ns });
        }
        (_, PerfRecord::Sample { tid, time_ns, frames, .. }) => {
            ring_q.push(CaptureEvent::Sample { tid: Tid(tid), time_ns, frames });
        }
        (_, PerfRecord::Fork { tid, .. }) => {
            ring_q.push(CaptureEvent::ThreadSpawned { tid: Tid(tid) });
        }
        (_, PerfRecord::Exit { tid, .. }) => {
            ring_q.push(CaptureEvent::ThreadExited { tid: Tid(tid) });
        }
        (_, PerfRecord::ContextSwitch { tid, time_ns, switch_out }) => {
            ring_q.push(CaptureEvent::ContextSwitch {
                tid: Tid(tid),
                cpu,
                time_ns,
                switch_out,
            });
        }
        (_, PerfRecord::TracepointSwitch { time_ns, prev_tid, next_tid }) => {
            ring_q.push(CaptureEvent::TracepointSwitch {
                prev: Tid(prev_tid),
                next: Tid(next_tid),
                cpu,
                time_ns,
            });
        }
        (_, PerfRecord::ModuleLoad { path, addr, .. }) => {
            log::debug!("module mapped mid-capture: {path} at {addr:#x}");
        }
        (_, PerfRecord::Lost { count, .. }) => {
            ring_q.push(CaptureEvent::Lost { count });
        }
        (_, PerfRecord::Unknown { .. }) => {}
    }
}

fn spawn_usage_sampler(
    pid: Pid,
    usage_q: SpillQueue<(Tid, f32)>,
    cancel: Arc<AtomicBool>,
    period: Duration,
) -> Result<JoinHandle<()>, CaptureError> {
    let handle = thread::Builder::new()
        .name("strobe-usage".into())
        .spawn(move || {
            let mut sampler = crate::sampling::ThreadUsageSampler::new(pid);
            while !cancel.load(Ordering::Relaxed) {
                for (tid, fraction) in sampler.sample() {
                    usage_q.push((tid, fraction));
                }
                thread::sleep(period);
            }
        })
        .map_err(CaptureError::Io)?;
    Ok(handle)
}

fn spawn_consumer(
    mut profiler: SamplingProfiler,
    ring_rx: crossbeam_channel::Receiver<CaptureEvent>,
    probe_rx: crossbeam_channel::Receiver<ProbeEvent>,
    usage_rx: crossbeam_channel::Receiver<(Tid, f32)>,
    cancel: Arc<AtomicBool>,
    timers: Arc<dyn TimerSink>,
) -> Result<JoinHandle<SamplingProfiler>, CaptureError> {
    let handle = thread::Builder::new()
        .name("strobe-consume".into())
        .spawn(move || {
            let mut ring_rx = ring_rx;
            let mut probe_rx = probe_rx;
            let mut usage_rx = usage_rx;
            let (mut ring_done, mut probe_done, mut usage_done) = (false, false, false);
            let mut stop_requested = false;

            while !(ring_done && probe_done && usage_done) {
                if !stop_requested && cancel.load(Ordering::Relaxed) {
                    profiler.request_stop();
                    stop_requested = true;
                }

                // A disconnected channel still yields its buffered events
                // before erroring, so nothing drained here is lost.
                let mut disconnected: Option<u8> = None;
                crossbeam_channel::select! {
                    recv(ring_rx) -> msg => match msg {
                        Ok(event) => dispatch_event(&mut profiler, event),
                        Err(_) => disconnected = Some(0),
                    },
                    recv(probe_rx) -> msg => match msg {
                        Ok(event) => profiler.handle_probe(event, &*timers),
                        Err(_) => disconnected = Some(1),
                    },
                    recv(usage_rx) -> msg => match msg {
                        Ok((tid, fraction)) => profiler.record_usage(tid, fraction),
                        Err(_) => disconnected = Some(2),
                    },
                    default(POLL_INTERVAL) => {}
                }

                // Swap exhausted channels for never() so the select does not
                // keep firing on them.
                match disconnected {
                    Some(0) => {
                        ring_done = true;
                        ring_rx = crossbeam_channel::never();
                    }
                    Some(1) => {
                        probe_done = true;
                        probe_rx = crossbeam_channel::never();
                    }
                    Some(2) => {
                        usage_done = true;
                        usage_rx = crossbeam_channel::never();
                    }
                    _ => {}
                }
            }
            profiler
        })
        .map_err(CaptureError::Io)?;
    Ok(handle)
}

fn dispatch_event(profiler: &mut SamplingProfiler, event: CaptureEvent) {
    match event {
        CaptureEvent::Sample { tid, time_ns, frames } => {
            profiler.add_callstack(tid, time_ns, frames);
        }
        CaptureEvent::ThreadSpawned { tid } => {
            profiler.thread_spawned(tid, inspect::thread_name(tid));
        }
        CaptureEvent::ThreadExited { tid } => profiler.thread_exited(tid),
        CaptureEvent::ContextSwitch { tid, cpu, time_ns, switch_out } => {
            profiler.context_switch(tid, cpu, time_ns, switch_out);
        }
        CaptureEvent::TracepointSwitch { prev, next, cpu, time_ns } => {
            profiler.tracepoint_switch(prev, next, cpu, time_ns);
        }
        CaptureEvent::Lost { count } => profiler.record_lost(count),
    }
}
