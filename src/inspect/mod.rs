//! Read-only queries over kernel-exposed process state
//!
//! Everything here is a point-in-time snapshot of `/proc`. Threads may appear
//! or vanish between any two calls; callers must treat disappearance as
//! normal, not as an error. Only the target process itself vanishing is
//! reported as [`CaptureError::ProcessGone`].

pub mod cpuset;

use std::fs;
use std::path::PathBuf;

use crate::domain::{CaptureError, Pid, Tid};

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub path: Option<PathBuf>,
}

impl MapEntry {
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }

    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Enumerate the threads of a process from `/proc/<pid>/task`.
///
/// # Errors
/// Returns [`CaptureError::ProcessGone`] if the task directory cannot be
/// opened, which means the process has exited.
pub fn list_threads(pid: Pid) -> Result<Vec<Tid>, CaptureError> {
    let task_dir = format!("/proc/{pid}/task");
    let entries = fs::read_dir(&task_dir).map_err(|_| CaptureError::ProcessGone(pid))?;

    let mut tids: Vec<Tid> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            entry.file_name().to_string_lossy().parse::<u32>().ok().map(Tid)
        })
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

/// True if `/proc/<pid>` still exists.
#[must_use]
pub fn process_exists(pid: Pid) -> bool {
    fs::metadata(format!("/proc/{pid}")).is_ok()
}

/// Parse `/proc/<pid>/maps` into typed entries.
///
/// # Errors
/// Returns [`CaptureError::ProcessGone`] if the maps file cannot be read.
pub fn read_maps(pid: Pid) -> Result<Vec<MapEntry>, CaptureError> {
    let maps = fs::read_to_string(format!("/proc/{pid}/maps"))
        .map_err(|_| CaptureError::ProcessGone(pid))?;
    Ok(maps.lines().filter_map(parse_map_line).collect())
}

/// Parse one maps line: "start-end perms offset dev inode pathname".
fn parse_map_line(line: &str) -> Option<MapEntry> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path = parts.next().map(PathBuf::from);

    let (start, end) = range.split_once('-')?;
    Some(MapEntry {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms: perms.to_string(),
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

/// Thread name from `/proc/<tid>/comm`. Empty if the thread is gone.
#[must_use]
pub fn thread_name(tid: Tid) -> String {
    fs::read_to_string(format!("/proc/{tid}/comm"))
        .map(|s| s.trim_end_matches('\n').to_string())
        .unwrap_or_default()
}

/// Scheduler state character from `/proc/<tid>/stat`, or None if the thread
/// is gone or the line is malformed.
#[must_use]
pub fn thread_state(tid: Tid) -> Option<char> {
    let stat = fs::read_to_string(format!("/proc/{tid}/stat")).ok()?;
    parse_stat_state(&stat)
}

/// Extract the state field of a stat line. The comm field is enclosed in
/// parentheses and may itself contain spaces and parentheses, so fields are
/// counted from the last closing parenthesis.
fn parse_stat_state(stat_line: &str) -> Option<char> {
    let after_comm = &stat_line[stat_line.rfind(')')? + 1..];
    after_comm.split_whitespace().next()?.chars().next()
}

/// Number of logical cores, from `/sys/devices/system/cpu/online` with a
/// `sysconf` fallback.
#[must_use]
pub fn num_cores() -> usize {
    if let Ok(content) = fs::read_to_string("/sys/devices/system/cpu/online") {
        let cpus = cpuset::parse_cpuset_cpus(content.trim());
        if !cpus.is_empty() {
            return cpus.len();
        }
    }
    // SAFETY: sysconf with a valid name has no preconditions
    #[allow(unsafe_code)]
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as usize
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_threads_self() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid(std::process::id() as i32);
        let tids = list_threads(pid).unwrap();
        assert!(!tids.is_empty());
        // The main thread has tid == pid
        assert!(tids.contains(&Tid(std::process::id())));
    }

    #[test]
    fn test_list_threads_invalid_pid() {
        assert!(matches!(list_threads(Pid(-1)), Err(CaptureError::ProcessGone(_))));
    }

    #[test]
    fn test_parse_map_line() {
        let line = "55d0b8600000-55d0b8800000 r-xp 00020000 103:02 1835009   /usr/bin/cat";
        let entry = parse_map_line(line).unwrap();
        assert_eq!(entry.start, 0x55d0_b860_0000);
        assert_eq!(entry.end, 0x55d0_b880_0000);
        assert!(entry.is_executable());
        assert_eq!(entry.offset, 0x20000);
        assert_eq!(entry.path.unwrap().to_str().unwrap(), "/usr/bin/cat");
    }

    #[test]
    fn test_parse_map_line_anonymous() {
        let line = "7ffc2e8f0000-7ffc2e911000 rw-p 00000000 00:00 0";
        let entry = parse_map_line(line).unwrap();
        assert!(entry.path.is_none());
        assert!(!entry.is_executable());
    }

    #[test]
    fn test_parse_stat_state() {
        let stat = "1234 (my-app) S 1 1234 1234 0 -1 4194304";
        assert_eq!(parse_stat_state(stat), Some('S'));
    }

    #[test]
    fn test_parse_stat_state_comm_with_parens() {
        // Thread names can contain spaces and parentheses
        let stat = "1234 (app (v2) x) R 1 1234";
        assert_eq!(parse_stat_state(stat), Some('R'));
    }

    #[test]
    fn test_thread_name_gone() {
        assert_eq!(thread_name(Tid(u32::MAX)), "");
    }

    #[test]
    fn test_num_cores() {
        assert!(num_cores() >= 1);
    }
}
