//! Rolling per-thread CPU usage
//!
//! Usage is derived from the utime+stime tick counters in each thread's stat
//! file: the tick delta between two snapshots over the wall time between
//! them. The series feeds the mean usage stored on each thread report.

use std::collections::HashMap;
use std::fs;
use std::time::Instant;

use crate::domain::{Pid, Tid};
use crate::inspect;

pub struct ThreadUsageSampler {
    pid: Pid,
    prev_ticks: HashMap<Tid, u64>,
    last_snapshot: Instant,
    ticks_per_sec: u64,
}

impl ThreadUsageSampler {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        // SAFETY: sysconf with a valid name has no preconditions
        #[allow(unsafe_code)]
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            pid,
            prev_ticks: HashMap::new(),
            last_snapshot: Instant::now(),
            ticks_per_sec: if ticks > 0 { ticks as u64 } else { 100 },
        }
    }

    /// Snapshot every live thread and return the usage fraction accumulated
    /// since the previous snapshot. Threads seen for the first time yield no
    /// value yet; vanished threads are silently dropped.
    pub fn sample(&mut self) -> Vec<(Tid, f32)> {
        let elapsed = self.last_snapshot.elapsed().as_secs_f64();
        self.last_snapshot = Instant::now();

        let Ok(tids) = inspect::list_threads(self.pid) else {
            return Vec::new();
        };

        let mut usage = Vec::new();
        let mut current = HashMap::new();
        for tid in tids {
            let Some(ticks) = read_thread_ticks(self.pid, tid) else { continue };
            current.insert(tid, ticks);
            if let Some(prev) = self.prev_ticks.get(&tid) {
                if elapsed > 0.0 {
                    let cpu_secs = (ticks.saturating_sub(*prev)) as f64
                        / self.ticks_per_sec as f64;
                    #[allow(clippy::cast_possible_truncation)]
                    usage.push((tid, (cpu_secs / elapsed).clamp(0.0, 1.0) as f32));
                }
            }
        }
        self.prev_ticks = current;
        usage
    }
}

fn read_thread_ticks(pid: Pid, tid: Tid) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{pid}/task/{tid}/stat")).ok()?;
    parse_stat_ticks(&stat)
}

/// Sum of the utime and stime fields of a stat line. Fields are counted
/// from the last closing parenthesis because comm may contain anything.
fn parse_stat_ticks(stat_line: &str) -> Option<u64> {
    let after_comm = &stat_line[stat_line.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // Overall fields 14 and 15; state is overall field 3, the first here.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_ticks() {
        let stat = "42 (worker (x)) R 1 42 42 0 -1 4194304 100 0 0 0 250 50 0 0 20 0 1 0";
        assert_eq!(parse_stat_ticks(stat), Some(300));
    }

    #[test]
    fn test_parse_short_line() {
        assert_eq!(parse_stat_ticks("42 (x) R 1"), None);
    }

    #[test]
    fn test_sample_self() {
        #[allow(clippy::cast_possible_wrap)]
        let mut sampler = ThreadUsageSampler::new(Pid(std::process::id() as i32));
        // First snapshot only primes the baseline
        let _ = sampler.sample();
        std::thread::sleep(std::time::Duration::from_millis(20));
        for (_, fraction) in sampler.sample() {
            assert!((0.0..=1.0).contains(&fraction));
        }
    }
}
