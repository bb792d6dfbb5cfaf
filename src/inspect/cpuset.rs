//! Cpuset resolution for a target process
//!
//! The set of CPUs a process may run on bounds how many per-CPU rings the
//! capture needs. It is resolved from the process's cpuset control group;
//! when the group is absent or empty, the full CPU set is assumed.

use std::fs;

use crate::domain::{CpuId, Pid};

/// Extract the cpuset group path from `/proc/<pid>/cgroup` content.
///
/// Matches both a dedicated controller line ("8:cpuset:/game") and a joined
/// one ("5:cpuacct,cpu,cpuset:/daemons").
#[must_use]
pub fn extract_cpuset_from_cgroup(cgroup_content: &str) -> Option<&str> {
    cgroup_content
        .lines()
        .find(|line| line.contains("cpuset:") || line.contains("cpuset,"))
        .and_then(|line| line.rsplit_once(':'))
        .map(|(_, group)| group)
}

/// Parse a cpu list of the form "0-2,7,12-14" into individual ids.
///
/// Malformed ranges are skipped; the result is whatever parsed.
#[must_use]
pub fn parse_cpuset_cpus(cpuset_cpus_content: &str) -> Vec<CpuId> {
    let mut cpus = Vec::new();
    for range in cpuset_cpus_content.trim().split(',').filter(|r| !r.is_empty()) {
        if let Some((start, end)) = range.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.trim().parse::<u32>(), end.trim().parse::<u32>())
            {
                cpus.extend((start..=end).map(CpuId));
            }
        } else if let Ok(cpu) = range.trim().parse::<u32>() {
            cpus.push(CpuId(cpu));
        }
    }
    cpus
}

/// Format a sorted, deduplicated cpu set back into "0-2,7,12-14" form.
/// Inverse of [`parse_cpuset_cpus`].
#[must_use]
pub fn format_cpuset(cpus: &[CpuId]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < cpus.len() {
        let start = cpus[i].0;
        let mut end = start;
        while i + 1 < cpus.len() && cpus[i + 1].0 == end + 1 {
            end = cpus[i + 1].0;
            i += 1;
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{start}-{end}"));
        }
        i += 1;
    }
    out
}

/// Resolve the CPUs the process is permitted to run on.
///
/// Reads `/proc/<pid>/cgroup` and the matching
/// `/sys/fs/cgroup/cpuset<group>/cpuset.cpus`. Falls back to the full set
/// `[0, num_cores)` when the group is absent or the file is empty, since a
/// process cannot run with an empty cpuset.
#[must_use]
pub fn cpuset_cpus(pid: Pid) -> Vec<CpuId> {
    let full_set = || (0..super::num_cores() as u32).map(CpuId).collect();

    let Ok(cgroup_content) = fs::read_to_string(format!("/proc/{pid}/cgroup")) else {
        return full_set();
    };
    let Some(group) = extract_cpuset_from_cgroup(&cgroup_content) else {
        return full_set();
    };

    let group_path = if group == "/" { "" } else { group };
    let cpus_file = format!("/sys/fs/cgroup/cpuset{group_path}/cpuset.cpus");
    let Ok(content) = fs::read_to_string(&cpus_file) else {
        return full_set();
    };

    let cpus = parse_cpuset_cpus(&content);
    if cpus.is_empty() {
        full_set()
    } else {
        cpus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_cpuset() {
        let content = "12:cpuset:/game\n8:memory:/\n";
        assert_eq!(extract_cpuset_from_cgroup(content), Some("/game"));
    }

    #[test]
    fn test_extract_cpuset_joined_controllers() {
        let content = "5:cpuacct,cpu,cpuset:/daemons\n";
        assert_eq!(extract_cpuset_from_cgroup(content), Some("/daemons"));
    }

    #[test]
    fn test_extract_cpuset_root() {
        assert_eq!(extract_cpuset_from_cgroup("8:cpuset:/\n"), Some("/"));
    }

    #[test]
    fn test_extract_cpuset_absent() {
        assert_eq!(extract_cpuset_from_cgroup("8:memory:/\n"), None);
    }

    #[test]
    fn test_parse_cpuset_cpus() {
        let cpus: Vec<u32> = parse_cpuset_cpus("0-2,7,12-14").iter().map(|c| c.0).collect();
        assert_eq!(cpus, vec![0, 1, 2, 7, 12, 13, 14]);
    }

    #[test]
    fn test_parse_cpuset_single() {
        assert_eq!(parse_cpuset_cpus("5"), vec![CpuId(5)]);
    }

    #[test]
    fn test_parse_cpuset_empty() {
        assert!(parse_cpuset_cpus("").is_empty());
        assert!(parse_cpuset_cpus("\n").is_empty());
    }

    #[test]
    fn test_format_cpuset() {
        let cpus = [0, 1, 2, 7, 12, 13, 14].map(CpuId);
        assert_eq!(format_cpuset(&cpus), "0-2,7,12-14");
    }

    #[test]
    fn test_format_single() {
        assert_eq!(format_cpuset(&[CpuId(3)]), "3");
        assert_eq!(format_cpuset(&[]), "");
    }

    #[test]
    fn test_parse_format_round_trip() {
        let sets: &[&[u32]] = &[&[0], &[0, 1, 2, 3], &[1, 3, 5, 7], &[0, 1, 5, 6, 7, 1023]];
        for set in sets {
            let cpus: Vec<CpuId> = set.iter().copied().map(CpuId).collect();
            assert_eq!(parse_cpuset_cpus(&format_cpuset(&cpus)), cpus);
        }
    }

    #[test]
    fn test_cpuset_cpus_self_never_empty() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid(std::process::id() as i32);
        assert!(!cpuset_cpus(pid).is_empty());
    }
}
