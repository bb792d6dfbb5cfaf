//! Raw `perf_event_open` surface
//!
//! The attribute struct is laid out by hand against the kernel ABI instead of
//! going through bindgen; only the fields and flag bits this crate uses are
//! named. The attribute size is pinned to `ATTR_SIZE_VER5`, the last revision
//! whose fields we touch, so older kernels accept it unchanged.

#![allow(unsafe_code)]

use std::fs;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// `perf_event_attr`, through `aux_watermark`/`sample_max_stack` (VER5).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PerfEventAttr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    /// Union with `sample_freq`; interpreted as a frequency when
    /// `ATTR_FREQ` is set in `flags`.
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    /// The kernel's bitfield block, handled as one word. See the `ATTR_*`
    /// bit constants.
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    /// Union: `bp_addr` / `kprobe_func` / `uprobe_path` pointer.
    pub config1: u64,
    /// Union: `bp_len` / `kprobe_addr` / `probe_offset`.
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

pub const ATTR_SIZE_VER5: u32 = 112;

// Bit positions inside PerfEventAttr::flags.
pub const ATTR_DISABLED: u64 = 1 << 0;
pub const ATTR_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const ATTR_EXCLUDE_HV: u64 = 1 << 6;
pub const ATTR_MMAP: u64 = 1 << 8;
pub const ATTR_FREQ: u64 = 1 << 10;
pub const ATTR_TASK: u64 = 1 << 13;
pub const ATTR_SAMPLE_ID_ALL: u64 = 1 << 18;
pub const ATTR_EXCLUDE_CALLCHAIN_KERNEL: u64 = 1 << 21;
pub const ATTR_MMAP2: u64 = 1 << 23;
pub const ATTR_USE_CLOCKID: u64 = 1 << 25;
pub const ATTR_CONTEXT_SWITCH: u64 = 1 << 26;

// perf_type_id
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

// perf_sw_ids
pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

// perf_event_sample_format
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_CALLCHAIN: u64 = 1 << 5;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;

// perf_event_type (record kinds)
pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_MMAP2: u32 = 10;
pub const PERF_RECORD_SWITCH: u32 = 14;
pub const PERF_RECORD_SWITCH_CPU_WIDE: u32 = 15;

pub const PERF_RECORD_MISC_SWITCH_OUT: u16 = 1 << 13;

/// Callchain entries at or above this value are context markers
/// (kernel/user boundaries), not instruction pointers.
pub const PERF_CONTEXT_MAX: u64 = -4095i64 as u64;

// Registers to dump with each sample on x86_64: BP, SP, IP. Enough for a
// frame-pointer unwind of the sampled user stack.
pub const SAMPLE_REGS_USER: u64 = (1 << 6) | (1 << 7) | (1 << 8);
/// Bytes of user stack to snapshot per sample; must be a multiple of 8.
pub const SAMPLE_STACK_USER: u32 = 65528;

pub const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

/// Attribute template shared by every ring the capture opens: one event per
/// sample, monotonic clock, timestamps on every record kind (including LOST),
/// created disabled. User register and stack payloads are sized here and
/// activated per ring via `sample_type`.
#[must_use]
pub fn base_attr() -> PerfEventAttr {
    // SAFETY: all-zero is a valid perf_event_attr
    let mut attr: PerfEventAttr = unsafe { std::mem::zeroed() };
    attr.size = ATTR_SIZE_VER5;
    attr.sample_period = 1;
    attr.flags = ATTR_DISABLED | ATTR_USE_CLOCKID | ATTR_SAMPLE_ID_ALL;
    attr.clockid = libc::CLOCK_MONOTONIC;
    attr.sample_regs_user = SAMPLE_REGS_USER;
    attr.sample_stack_user = SAMPLE_STACK_USER;
    attr
}

/// Thin wrapper over the `perf_event_open` syscall.
///
/// # Errors
/// Returns the raw OS error; callers map EACCES/EPERM, EMFILE and EINVAL
/// onto the capture error taxonomy.
pub fn perf_event_open(
    attr: &PerfEventAttr,
    pid: i32,
    cpu: i32,
    group_fd: i32,
    flags: libc::c_ulong,
) -> io::Result<OwnedFd> {
    // SAFETY: attr points to a live, correctly sized attribute struct
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            std::ptr::from_ref(attr),
            pid,
            cpu,
            group_fd,
            flags,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: the syscall returned a fresh descriptor we now own
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Start event generation on a perf fd.
pub fn ioctl_enable(fd: RawFd) -> io::Result<()> {
    perf_ioctl(fd, PERF_EVENT_IOC_ENABLE)
}

/// Stop event generation on a perf fd.
pub fn ioctl_disable(fd: RawFd) -> io::Result<()> {
    perf_ioctl(fd, PERF_EVENT_IOC_DISABLE)
}

fn perf_ioctl(fd: RawFd, request: libc::c_ulong) -> io::Result<()> {
    // SAFETY: plain ioctl on a perf event fd with no out parameters
    let ret = unsafe { libc::ioctl(fd, request, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Look up a tracepoint id, e.g. ("sched", "sched_switch"). None if tracefs
/// is not mounted or the tracepoint does not exist.
#[must_use]
pub fn tracepoint_id(category: &str, name: &str) -> Option<u64> {
    for tracefs in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
        let path = format!("{tracefs}/events/{category}/{name}/id");
        if let Ok(content) = fs::read_to_string(&path) {
            return content.trim().parse().ok();
        }
    }
    None
}

/// System page size.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    sz.max(4096) as usize
}

/// `perf_event_mmap_page`, the metadata page at the start of every ring
/// mapping. Only the data head/tail/offset/size words are used; the reserved
/// block keeps them at their ABI offsets.
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pub lock: u32,
    pub index: u32,
    pub offset: i64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub capabilities: u64,
    pub pmc_width: u16,
    pub time_shift: u16,
    pub time_mult: u32,
    pub time_offset: u64,
    pub time_zero: u64,
    pub size: u32,
    pub __reserved_1: u32,
    pub time_cycles: u64,
    pub time_mask: u64,
    pub __reserved: [u8; 928],
    pub data_head: u64,
    pub data_tail: u64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_head: u64,
    pub aux_tail: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_attr_layout() {
        assert_eq!(size_of::<PerfEventAttr>(), ATTR_SIZE_VER5 as usize);
        assert_eq!(offset_of!(PerfEventAttr, flags), 40);
        assert_eq!(offset_of!(PerfEventAttr, config1), 56);
        assert_eq!(offset_of!(PerfEventAttr, config2), 64);
        assert_eq!(offset_of!(PerfEventAttr, clockid), 92);
    }

    #[test]
    fn test_mmap_page_layout() {
        // The data words sit after the kernel's reserved extension hole,
        // aligned to 1 KiB.
        assert_eq!(offset_of!(PerfEventMmapPage, data_head), 1024);
        assert_eq!(offset_of!(PerfEventMmapPage, data_tail), 1032);
    }

    #[test]
    fn test_base_attr() {
        let attr = base_attr();
        assert_eq!(attr.size, ATTR_SIZE_VER5);
        assert_eq!(attr.sample_period, 1);
        assert_ne!(attr.flags & ATTR_DISABLED, 0);
        assert_ne!(attr.flags & ATTR_SAMPLE_ID_ALL, 0);
        assert_ne!(attr.flags & ATTR_USE_CLOCKID, 0);
        assert_eq!(attr.clockid, libc::CLOCK_MONOTONIC);
    }

    #[test]
    fn test_context_marker_threshold() {
        // PERF_CONTEXT_USER is -512 and must classify as a marker
        assert!((-512i64 as u64) >= PERF_CONTEXT_MAX);
        assert!(0x55d0_b860_0000u64 < PERF_CONTEXT_MAX);
    }

    #[test]
    fn test_page_size_sane() {
        assert!(page_size() >= 4096);
        assert!(page_size().is_power_of_two());
    }
}
