//! Typed parsing of kernel perf records
//!
//! Every ring this crate opens samples with `TID | TIME` in its sample type,
//! so non-SAMPLE records all carry the same `{pid, tid, time}` trailer via
//! `sample_id_all`. SAMPLE payloads differ per ring and are selected with
//! [`SampleLayout`]. Unknown record kinds are surfaced as
//! [`PerfRecord::Unknown`] and skipped by the consumer.

use crate::perf::ring::RawRecord;
use crate::perf::sys;

/// How to interpret a SAMPLE record's payload on a given ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLayout {
    /// `{pid, tid, time, callchain}` - the stack sampling rings.
    Callchain,
    /// `{pid, tid, time}` - uprobe rings, where the event itself is the data.
    TidTime,
    /// `{pid, tid, time, raw}` with a `sched_switch` tracepoint payload.
    SchedSwitchRaw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerfRecord {
    Sample { pid: u32, tid: u32, time_ns: u64, frames: Vec<u64> },
    Fork { pid: u32, tid: u32, time_ns: u64 },
    Exit { pid: u32, tid: u32, time_ns: u64 },
    ContextSwitch { tid: u32, time_ns: u64, switch_out: bool },
    /// CPU-wide `sched_switch` tracepoint sample, kernels without the
    /// dedicated context-switch record.
    TracepointSwitch { time_ns: u64, prev_tid: u32, next_tid: u32 },
    ModuleLoad { pid: u32, addr: u64, len: u64, pgoff: u64, path: String, time_ns: u64 },
    Lost { count: u64, time_ns: u64 },
    Unknown { kind: u32 },
}

// Offsets into the sched_switch tracepoint payload. The common field block
// is 8 bytes; prev_comm[16] precedes prev_pid and next_comm[16] precedes
// next_pid.
const SCHED_SWITCH_PREV_PID: usize = 24;
const SCHED_SWITCH_NEXT_PID: usize = 56;

/// Parse one raw record. Malformed payloads degrade to `Unknown` rather
/// than failing the capture.
#[must_use]
pub fn parse_record(raw: &RawRecord, layout: SampleLayout) -> PerfRecord {
    match raw.kind {
        sys::PERF_RECORD_SAMPLE => parse_sample(raw, layout),
        sys::PERF_RECORD_FORK | sys::PERF_RECORD_EXIT => parse_task(raw),
        sys::PERF_RECORD_SWITCH => parse_switch(raw),
        sys::PERF_RECORD_LOST => parse_lost(raw),
        sys::PERF_RECORD_MMAP => parse_mmap(raw, false),
        sys::PERF_RECORD_MMAP2 => parse_mmap(raw, true),
        kind => PerfRecord::Unknown { kind },
    }
}

fn parse_sample(raw: &RawRecord, layout: SampleLayout) -> PerfRecord {
    let mut cur = Cursor::new(&raw.data);
    let Some((pid, tid, time_ns)) = cur.tid_time() else {
        return PerfRecord::Unknown { kind: raw.kind };
    };

    match layout {
        SampleLayout::TidTime => PerfRecord::Sample { pid, tid, time_ns, frames: Vec::new() },
        SampleLayout::Callchain => {
            let Some(nr) = cur.u64() else {
                return PerfRecord::Unknown { kind: raw.kind };
            };
            let mut frames = Vec::with_capacity(nr as usize);
            for _ in 0..nr {
                let Some(ip) = cur.u64() else {
                    return PerfRecord::Unknown { kind: raw.kind };
                };
                // Context markers separate kernel and user segments of the
                // chain and are not instruction pointers.
                if ip < sys::PERF_CONTEXT_MAX {
                    frames.push(ip);
                }
            }
            PerfRecord::Sample { pid, tid, time_ns, frames }
        }
        SampleLayout::SchedSwitchRaw => {
            let Some(raw_size) = cur.u32() else {
                return PerfRecord::Unknown { kind: raw.kind };
            };
            let Some(payload) = cur.bytes(raw_size as usize) else {
                return PerfRecord::Unknown { kind: raw.kind };
            };
            match parse_sched_switch_payload(payload) {
                Some((prev_tid, next_tid)) => {
                    PerfRecord::TracepointSwitch { time_ns, prev_tid, next_tid }
                }
                None => PerfRecord::Unknown { kind: raw.kind },
            }
        }
    }
}

fn parse_sched_switch_payload(payload: &[u8]) -> Option<(u32, u32)> {
    let prev = payload.get(SCHED_SWITCH_PREV_PID..SCHED_SWITCH_PREV_PID + 4)?;
    let next = payload.get(SCHED_SWITCH_NEXT_PID..SCHED_SWITCH_NEXT_PID + 4)?;
    Some((
        u32::from_le_bytes(prev.try_into().ok()?),
        u32::from_le_bytes(next.try_into().ok()?),
    ))
}

fn parse_task(raw: &RawRecord) -> PerfRecord {
    // { pid, ppid, tid, ptid, time } followed by the sample_id trailer
    let mut cur = Cursor::new(&raw.data);
    let (Some(pid), Some(_ppid), Some(tid), Some(_ptid), Some(time_ns)) =
        (cur.u32(), cur.u32(), cur.u32(), cur.u32(), cur.u64())
    else {
        return PerfRecord::Unknown { kind: raw.kind };
    };
    if raw.kind == sys::PERF_RECORD_FORK {
        PerfRecord::Fork { pid, tid, time_ns }
    } else {
        PerfRecord::Exit { pid, tid, time_ns }
    }
}

fn parse_switch(raw: &RawRecord) -> PerfRecord {
    // The body is empty; everything of interest is in the trailer and the
    // misc flags.
    let Some((_pid, tid, time_ns)) = parse_trailer(&raw.data) else {
        return PerfRecord::Unknown { kind: raw.kind };
    };
    PerfRecord::ContextSwitch {
        tid,
        time_ns,
        switch_out: raw.misc & sys::PERF_RECORD_MISC_SWITCH_OUT != 0,
    }
}

fn parse_lost(raw: &RawRecord) -> PerfRecord {
    let mut cur = Cursor::new(&raw.data);
    let (Some(_id), Some(count)) = (cur.u64(), cur.u64()) else {
        return PerfRecord::Unknown { kind: raw.kind };
    };
    let time_ns = parse_trailer(&raw.data).map_or(0, |(_, _, t)| t);
    PerfRecord::Lost { count, time_ns }
}

fn parse_mmap(raw: &RawRecord, mmap2: bool) -> PerfRecord {
    let mut cur = Cursor::new(&raw.data);
    let (Some(pid), Some(_tid), Some(addr), Some(len), Some(pgoff)) =
        (cur.u32(), cur.u32(), cur.u64(), cur.u64(), cur.u64())
    else {
        return PerfRecord::Unknown { kind: raw.kind };
    };
    if mmap2 {
        // maj, min, ino, ino_generation, prot, flags
        if cur.bytes(4 + 4 + 8 + 8 + 4 + 4).is_none() {
            return PerfRecord::Unknown { kind: raw.kind };
        }
    }
    // Null-terminated path, padded to 8 bytes, then the trailer.
    let rest = &raw.data[cur.pos..];
    let path_len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let path = String::from_utf8_lossy(&rest[..path_len]).into_owned();
    let time_ns = parse_trailer(&raw.data).map_or(0, |(_, _, t)| t);
    PerfRecord::ModuleLoad { pid, addr, len, pgoff, path, time_ns }
}

/// The `sample_id_all` trailer for `TID | TIME`: the last 16 bytes of the
/// record are `{pid: u32, tid: u32, time: u64}`.
fn parse_trailer(data: &[u8]) -> Option<(u32, u32, u64)> {
    if data.len() < 16 {
        return None;
    }
    let t = &data[data.len() - 16..];
    Some((
        u32::from_le_bytes(t[0..4].try_into().ok()?),
        u32::from_le_bytes(t[4..8].try_into().ok()?),
        u64::from_le_bytes(t[8..16].try_into().ok()?),
    ))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u32(&mut self) -> Option<u32> {
        let b = self.bytes(4)?;
        Some(u32::from_le_bytes(b.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        let b = self.bytes(8)?;
        Some(u64::from_le_bytes(b.try_into().ok()?))
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(out)
    }

    fn tid_time(&mut self) -> Option<(u32, u32, u64)> {
        Some((self.u32()?, self.u32()?, self.u64()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    #[test]
    fn test_parse_callchain_sample() {
        let mut data = Vec::new();
        push_u32(&mut data, 100); // pid
        push_u32(&mut data, 101); // tid
        push_u64(&mut data, 123_456); // time
        push_u64(&mut data, 3); // nr
        push_u64(&mut data, -512i64 as u64); // PERF_CONTEXT_USER marker
        push_u64(&mut data, 0x1000);
        push_u64(&mut data, 0x2000);

        let raw = RawRecord { kind: sys::PERF_RECORD_SAMPLE, misc: 0, data };
        let rec = parse_record(&raw, SampleLayout::Callchain);
        assert_eq!(
            rec,
            PerfRecord::Sample {
                pid: 100,
                tid: 101,
                time_ns: 123_456,
                frames: vec![0x1000, 0x2000]
            }
        );
    }

    #[test]
    fn test_parse_uprobe_sample() {
        let mut data = Vec::new();
        push_u32(&mut data, 100);
        push_u32(&mut data, 7);
        push_u64(&mut data, 42);

        let raw = RawRecord { kind: sys::PERF_RECORD_SAMPLE, misc: 0, data };
        let rec = parse_record(&raw, SampleLayout::TidTime);
        assert_eq!(rec, PerfRecord::Sample { pid: 100, tid: 7, time_ns: 42, frames: vec![] });
    }

    #[test]
    fn test_parse_fork_and_exit() {
        let mut data = Vec::new();
        push_u32(&mut data, 100); // pid
        push_u32(&mut data, 100); // ppid
        push_u32(&mut data, 105); // tid
        push_u32(&mut data, 100); // ptid
        push_u64(&mut data, 999); // time
        // trailer
        push_u32(&mut data, 100);
        push_u32(&mut data, 105);
        push_u64(&mut data, 999);

        let fork = RawRecord { kind: sys::PERF_RECORD_FORK, misc: 0, data: data.clone() };
        assert_eq!(
            parse_record(&fork, SampleLayout::TidTime),
            PerfRecord::Fork { pid: 100, tid: 105, time_ns: 999 }
        );

        let exit = RawRecord { kind: sys::PERF_RECORD_EXIT, misc: 0, data };
        assert_eq!(
            parse_record(&exit, SampleLayout::TidTime),
            PerfRecord::Exit { pid: 100, tid: 105, time_ns: 999 }
        );
    }

    #[test]
    fn test_parse_context_switch_out() {
        let mut data = Vec::new();
        push_u32(&mut data, 100);
        push_u32(&mut data, 101);
        push_u64(&mut data, 5000);

        let raw = RawRecord {
            kind: sys::PERF_RECORD_SWITCH,
            misc: sys::PERF_RECORD_MISC_SWITCH_OUT,
            data,
        };
        assert_eq!(
            parse_record(&raw, SampleLayout::TidTime),
            PerfRecord::ContextSwitch { tid: 101, time_ns: 5000, switch_out: true }
        );
    }

    #[test]
    fn test_parse_lost() {
        let mut data = Vec::new();
        push_u64(&mut data, 1); // id
        push_u64(&mut data, 37); // lost count
        push_u32(&mut data, 100);
        push_u32(&mut data, 101);
        push_u64(&mut data, 7777);

        let raw = RawRecord { kind: sys::PERF_RECORD_LOST, misc: 0, data };
        assert_eq!(
            parse_record(&raw, SampleLayout::Callchain),
            PerfRecord::Lost { count: 37, time_ns: 7777 }
        );
    }

    #[test]
    fn test_parse_mmap2() {
        let mut data = Vec::new();
        push_u32(&mut data, 100);
        push_u32(&mut data, 100);
        push_u64(&mut data, 0x7f00_0000);
        push_u64(&mut data, 0x2000);
        push_u64(&mut data, 0x1000);
        // maj/min/ino/ino_generation/prot/flags
        data.extend_from_slice(&[0u8; 32]);
        data.extend_from_slice(b"/usr/lib/libfoo.so\0\0\0\0\0\0");
        push_u32(&mut data, 100);
        push_u32(&mut data, 100);
        push_u64(&mut data, 31337);

        let raw = RawRecord { kind: sys::PERF_RECORD_MMAP2, misc: 0, data };
        let rec = parse_record(&raw, SampleLayout::Callchain);
        match rec {
            PerfRecord::ModuleLoad { addr, len, pgoff, path, .. } => {
                assert_eq!(addr, 0x7f00_0000);
                assert_eq!(len, 0x2000);
                assert_eq!(pgoff, 0x1000);
                assert_eq!(path, "/usr/lib/libfoo.so");
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn test_unknown_record_kind() {
        let raw = RawRecord { kind: 0xdead, misc: 0, data: vec![] };
        assert_eq!(parse_record(&raw, SampleLayout::TidTime), PerfRecord::Unknown { kind: 0xdead });
    }

    #[test]
    fn test_parse_sched_switch_payload() {
        let mut payload = vec![0u8; 68];
        payload[SCHED_SWITCH_PREV_PID..SCHED_SWITCH_PREV_PID + 4]
            .copy_from_slice(&77u32.to_le_bytes());
        payload[SCHED_SWITCH_NEXT_PID..SCHED_SWITCH_NEXT_PID + 4]
            .copy_from_slice(&88u32.to_le_bytes());
        assert_eq!(parse_sched_switch_payload(&payload), Some((77, 88)));
    }

    #[test]
    fn test_truncated_sample_is_unknown() {
        let raw = RawRecord { kind: sys::PERF_RECORD_SAMPLE, misc: 0, data: vec![1, 2, 3] };
        assert_eq!(
            parse_record(&raw, SampleLayout::Callchain),
            PerfRecord::Unknown { kind: sys::PERF_RECORD_SAMPLE }
        );
    }
}
