//! Kernel uprobe/uretprobe perf events
//!
//! Each selected function gets one entry and one return event per CPU, keyed
//! by `(module_path, function_offset)`. The dynamic PMU's type id differs
//! across kernels and is read from sysfs, never assumed.

use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;

use crate::domain::{CaptureError, CpuId, Pid};
use crate::perf::sys;
use crate::probes::SelectedProbe;

const UPROBE_TYPE_PATH: &str = "/sys/bus/event_source/devices/uprobe/type";

/// Dynamic PMU type id for uprobe events.
///
/// # Errors
/// `KernelUnsupported` when the uprobe PMU is not registered.
pub fn uprobe_pmu_type() -> Result<u32, CaptureError> {
    let content = fs::read_to_string(UPROBE_TYPE_PATH)
        .map_err(|_| CaptureError::KernelUnsupported { feature: "uprobe perf events" })?;
    content
        .trim()
        .parse()
        .map_err(|_| CaptureError::KernelUnsupported { feature: "uprobe perf events" })
}

/// Open the entry and return events for one probe on one CPU. The entry fd
/// leads the group so that enabling it drives both.
///
/// # Errors
/// Permission and resource failures from `perf_event_open`, mapped onto the
/// capture taxonomy.
pub fn open_uprobe_pair(
    pmu_type: u32,
    probe: &SelectedProbe,
    pid: Pid,
    cpu: CpuId,
) -> Result<(OwnedFd, OwnedFd), CaptureError> {
    let path = CString::new(probe.module_path.as_os_str().as_bytes()).map_err(|_| {
        CaptureError::TracerFailed(format!(
            "module path {} contains a nul byte",
            probe.module_path.display()
        ))
    })?;

    let entry = open_one(pmu_type, &path, probe.module_offset, pid, cpu, -1, false)?;
    let ret = open_one(pmu_type, &path, probe.module_offset, pid, cpu, entry.as_raw_fd(), true)?;
    Ok((entry, ret))
}

fn open_one(
    pmu_type: u32,
    path: &CString,
    offset: u64,
    pid: Pid,
    cpu: CpuId,
    group_fd: i32,
    retprobe: bool,
) -> Result<OwnedFd, CaptureError> {
    let mut attr = sys::base_attr();
    attr.type_ = pmu_type;
    // config selects entry (0) vs return (1); config1/config2 carry the
    // probed location.
    attr.config = u64::from(retprobe);
    attr.config1 = path.as_ptr() as u64;
    attr.config2 = offset;
    attr.sample_type = sys::PERF_SAMPLE_TID | sys::PERF_SAMPLE_TIME;

    sys::perf_event_open(&attr, pid.0, cpu.0 as i32, group_fd, sys::PERF_FLAG_FD_CLOEXEC)
        .map_err(|err| match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EPERM) => {
                CaptureError::PermissionDenied("uprobe perf event".into())
            }
            Some(libc::EMFILE) | Some(libc::ENFILE) => {
                CaptureError::ResourceExhausted(format!("uprobe perf event: {err}"))
            }
            _ => CaptureError::KernelUnsupported { feature: "uprobe perf events" },
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pmu_type_matches_sysfs() {
        // Only meaningful where the uprobe PMU exists
        if let Ok(content) = fs::read_to_string(UPROBE_TYPE_PATH) {
            let expected: u32 = content.trim().parse().unwrap();
            assert_eq!(uprobe_pmu_type().unwrap(), expected);
        } else {
            assert!(uprobe_pmu_type().is_err());
        }
    }
}
