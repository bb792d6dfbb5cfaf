//! Tracer-subprocess probe mode
//!
//! For each selected function with a probe spec, the generated script prints
//! one line per entry ("b") and exit ("e") carrying the function's virtual
//! address, the thread id and a monotonic nanosecond timestamp. The tracer
//! binary is spawned on the script and its stdout is consumed line by line
//! until the capture stops.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;

use crate::domain::{CaptureError, Tid};
use crate::probes::{ProbeEvent, SelectedProbe};

/// File name of the generated script under the system temp directory.
const SCRIPT_FILE_NAME: &str = "strobe.bt";

/// Grace period between SIGTERM and SIGKILL at stop.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(2000);

/// Render the probe script for every selected function that carries a probe
/// spec. Functions without one cannot be instrumented in this mode and are
/// skipped.
#[must_use]
pub fn render_probe_script(probes: &[SelectedProbe]) -> String {
    let mut script = String::new();
    for probe in probes {
        let Some(name) = &probe.probe_name else {
            continue;
        };
        script.push_str(&format!(
            "   uprobe:{name} {{ printf(\"b {vaddr} %u %lld\\n\", tid, nsecs); }}\n",
            vaddr = probe.vaddr
        ));
        script.push_str(&format!(
            "uretprobe:{name} {{ printf(\"e {vaddr} %u %lld\\n\", tid, nsecs); }}\n",
            vaddr = probe.vaddr
        ));
    }
    script
}

/// Write the script to its well-known path and return that path.
///
/// # Errors
/// Propagates the write failure.
pub fn write_probe_script(probes: &[SelectedProbe]) -> Result<PathBuf, CaptureError> {
    let path = std::env::temp_dir().join(SCRIPT_FILE_NAME);
    fs::write(&path, render_probe_script(probes))?;
    Ok(path)
}

/// Parse one tracer output line of the form "b <vaddr> <tid> <nsecs>".
/// Lines that do not match are ignored by the caller with a counter.
#[must_use]
pub fn parse_probe_line(line: &str) -> Option<ProbeEvent> {
    let mut tokens = line.split_whitespace();
    let enter = match tokens.next()? {
        "b" => true,
        "e" => false,
        _ => return None,
    };
    let function = parse_address(tokens.next()?)?;
    let tid = Tid(tokens.next()?.parse().ok()?);
    let time_ns = tokens.next()?.parse().ok()?;
    Some(ProbeEvent { enter, function, tid, time_ns })
}

/// Addresses arrive in decimal from printf-style tracers, but hex spellings
/// are accepted too.
fn parse_address(token: &str) -> Option<u64> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}

/// Outcome of a tracer run, folded into the capture health block.
#[derive(Debug, Clone, Copy)]
pub struct TracerStats {
    pub unparsable_lines: u64,
    pub exited_cleanly: bool,
}

/// A running tracer subprocess and the thread consuming its stdout.
pub struct TracerProcess {
    child: Child,
    reader: Option<JoinHandle<u64>>,
    cancel: Arc<AtomicBool>,
}

impl TracerProcess {
    /// Spawn `<tracer> <script>` and start consuming its stdout. Each parsed
    /// record is handed to `on_event` from the reader thread.
    ///
    /// # Errors
    /// `TracerFailed` when the binary cannot be spawned or stdout is missing.
    pub fn spawn(
        tracer: &Path,
        script: &Path,
        cancel: Arc<AtomicBool>,
        mut on_event: impl FnMut(ProbeEvent) + Send + 'static,
    ) -> Result<Self, CaptureError> {
        let mut child = Command::new(tracer)
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                CaptureError::TracerFailed(format!("spawning {}: {err}", tracer.display()))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::TracerFailed("tracer stdout unavailable".into()))?;

        let reader_cancel = Arc::clone(&cancel);
        let reader = thread::Builder::new()
            .name("strobe-tracer".into())
            .spawn(move || {
                let mut unparsable = 0u64;
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if reader_cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    match parse_probe_line(&line) {
                        Some(event) => on_event(event),
                        None => {
                            if !line.trim().is_empty() {
                                unparsable += 1;
                                debug!("unparsable tracer line: {line:?}");
                            }
                        }
                    }
                }
                unparsable
            })
            .map_err(|err| CaptureError::TracerFailed(format!("reader thread: {err}")))?;

        Ok(Self { child, reader: Some(reader), cancel })
    }

    /// Terminate the subprocess, escalating to SIGKILL after the grace
    /// period, and join the reader.
    pub fn stop(mut self) -> TracerStats {
        self.cancel.store(true, Ordering::Relaxed);

        #[allow(clippy::cast_possible_wrap)]
        let child_pid = NixPid::from_raw(self.child.id() as i32);
        let _ = kill(child_pid, Signal::SIGTERM);

        let deadline = Instant::now() + TERMINATE_GRACE;
        let mut status = None;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(st)) => {
                    status = Some(st);
                    break;
                }
                Ok(None) => thread::sleep(Duration::from_millis(20)),
                Err(_) => break,
            }
        }
        if status.is_none() {
            warn!("tracer did not exit within {TERMINATE_GRACE:?}, killing");
            let _ = self.child.kill();
            status = self.child.wait().ok();
        }

        let exited_cleanly = status.is_some_and(|st| st.success());
        if !exited_cleanly {
            warn!("tracer exited with {status:?}");
        }

        let unparsable_lines =
            self.reader.take().and_then(|handle| handle.join().ok()).unwrap_or(0);
        TracerStats { unparsable_lines, exited_cleanly }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(vaddr: u64, name: &str) -> SelectedProbe {
        SelectedProbe {
            vaddr,
            probe_name: Some(name.to_string()),
            module_path: PathBuf::from("/usr/bin/target"),
            module_offset: 0x1000,
        }
    }

    #[test]
    fn test_render_script() {
        let script = render_probe_script(&[probe(0xdead, "/usr/bin/target:foo")]);
        let expected_vaddr = 0xdeadu64.to_string();
        assert!(script.contains(&format!(
            "   uprobe:/usr/bin/target:foo {{ printf(\"b {expected_vaddr} %u %lld\\n\", tid, nsecs); }}"
        )));
        assert!(script.contains(&format!(
            "uretprobe:/usr/bin/target:foo {{ printf(\"e {expected_vaddr} %u %lld\\n\", tid, nsecs); }}"
        )));
    }

    #[test]
    fn test_render_skips_unprobeable() {
        let mut unprobeable = probe(0x1, "x");
        unprobeable.probe_name = None;
        assert!(render_probe_script(&[unprobeable]).is_empty());
    }

    #[test]
    fn test_parse_probe_line() {
        let ev = parse_probe_line("b 57005 4242 1000").unwrap();
        assert_eq!(
            ev,
            ProbeEvent { enter: true, function: 57005, tid: Tid(4242), time_ns: 1000 }
        );
        let ev = parse_probe_line("e 57005 4242 1500").unwrap();
        assert!(!ev.enter);
    }

    #[test]
    fn test_parse_hex_address() {
        let ev = parse_probe_line("b 0xDEAD 4242 1000").unwrap();
        assert_eq!(ev.function, 0xDEAD);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_probe_line("").is_none());
        assert!(parse_probe_line("Attaching 2 probes...").is_none());
        assert!(parse_probe_line("x 1 2 3").is_none());
        assert!(parse_probe_line("b one 2 3").is_none());
        assert!(parse_probe_line("b 1 2").is_none());
    }

    #[test]
    fn test_spawn_missing_binary() {
        let script = std::env::temp_dir().join("strobe-test-missing.bt");
        fs::write(&script, "").unwrap();
        let result = TracerProcess::spawn(
            Path::new("/nonexistent/strobe-tracer"),
            &script,
            Arc::new(AtomicBool::new(false)),
            |_| {},
        );
        assert!(matches!(result, Err(CaptureError::TracerFailed(_))));
        let _ = fs::remove_file(&script);
    }

    #[test]
    fn test_stream_through_cat() {
        // `cat <script>` echoes the script itself, which stresses both the
        // parser and the unparsable counter.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("lines.txt");
        fs::write(&script, "b 100 1 10\ne 100 1 20\nnoise\n").unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let tracer = TracerProcess::spawn(
            Path::new("cat"),
            &script,
            Arc::new(AtomicBool::new(false)),
            move |ev| {
                let _ = tx.send(ev);
            },
        )
        .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.function, 100);
        assert!(first.enter);
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!second.enter);

        let stats = tracer.stop();
        assert_eq!(stats.unparsable_lines, 1);
    }
}
