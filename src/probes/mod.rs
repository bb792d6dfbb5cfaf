//! Entry/exit instrumentation of selected functions
//!
//! Two mechanisms produce the same stream of entry/exit records:
//!
//! - **`uprobe`** - kernel uprobe/uretprobe perf events, one pair per
//!   (function, CPU), available from kernel 4.17
//! - **`tracer`** - a generated script driven by an external tracer binary
//!   whose stdout is consumed line by line, for older kernels

pub mod tracer;
pub mod uprobe;

use std::fs;
use std::path::PathBuf;

use crate::domain::Tid;

/// How entry/exit records are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProbeMode {
    /// Kernel uprobes when the running kernel supports them, else tracer.
    #[default]
    Auto,
    Kernel,
    Tracer,
}

impl ProbeMode {
    /// Resolve `Auto` against the running kernel.
    #[must_use]
    pub fn resolve(self, kernel: KernelVersion) -> ProbeMode {
        match self {
            ProbeMode::Auto => {
                if kernel.supports_perf_uprobes() {
                    ProbeMode::Kernel
                } else {
                    ProbeMode::Tracer
                }
            }
            explicit => explicit,
        }
    }
}

/// A function the operator selected for instrumentation.
#[derive(Debug, Clone)]
pub struct SelectedProbe {
    /// Virtual address of the function in the target's address space.
    pub vaddr: u64,
    /// Probe spec understood by the tracer, absent for functions the probe
    /// tool cannot instrument.
    pub probe_name: Option<String>,
    pub module_path: PathBuf,
    /// File offset of the function inside its module, as uprobes want it.
    pub module_offset: u64,
}

/// One entry or exit record for an instrumented function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeEvent {
    pub enter: bool,
    pub function: u64,
    pub tid: Tid,
    pub time_ns: u64,
}

/// Running kernel version, from `/proc/sys/kernel/osrelease`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    #[must_use]
    pub fn current() -> Option<Self> {
        let release = fs::read_to_string("/proc/sys/kernel/osrelease").ok()?;
        Self::parse(&release)
    }

    /// Parse a release string like "5.15.0-91-generic".
    #[must_use]
    pub fn parse(release: &str) -> Option<Self> {
        let numeric =
            release.trim().split(|c: char| !c.is_ascii_digit() && c != '.').next()?;
        let mut parts = numeric.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        Some(Self { major, minor, patch })
    }

    /// Uprobes via perf_event_open exist since 4.17.
    #[must_use]
    pub fn supports_perf_uprobes(self) -> bool {
        self >= KernelVersion { major: 4, minor: 17, patch: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release() {
        let v = KernelVersion::parse("5.15.0-91-generic").unwrap();
        assert_eq!(v, KernelVersion { major: 5, minor: 15, patch: 0 });
    }

    #[test]
    fn test_parse_two_component_release() {
        let v = KernelVersion::parse("6.1-rc3").unwrap();
        assert_eq!(v, KernelVersion { major: 6, minor: 1, patch: 0 });
    }

    #[test]
    fn test_uprobe_cutoff_is_inclusive() {
        assert!(KernelVersion { major: 4, minor: 17, patch: 0 }.supports_perf_uprobes());
        assert!(!KernelVersion { major: 4, minor: 16, patch: 99 }.supports_perf_uprobes());
        assert!(KernelVersion { major: 5, minor: 0, patch: 0 }.supports_perf_uprobes());
    }

    #[test]
    fn test_mode_resolution() {
        let new = KernelVersion { major: 5, minor: 10, patch: 0 };
        let old = KernelVersion { major: 4, minor: 4, patch: 0 };
        assert_eq!(ProbeMode::Auto.resolve(new), ProbeMode::Kernel);
        assert_eq!(ProbeMode::Auto.resolve(old), ProbeMode::Tracer);
        assert_eq!(ProbeMode::Tracer.resolve(new), ProbeMode::Tracer);
        assert_eq!(ProbeMode::Kernel.resolve(old), ProbeMode::Kernel);
    }

    #[test]
    fn test_current_kernel_parses() {
        assert!(KernelVersion::current().is_some());
    }
}
