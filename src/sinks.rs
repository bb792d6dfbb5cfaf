//! Callback surfaces toward the embedding application
//!
//! The capture core never renders anything; finished timers, status text and
//! refresh hints are pushed through these traits. Status and refresh sinks
//! are invoked from the thread driving `stop()`, timer sinks from the probe
//! consumers.

use log::{error, info};

use crate::domain::Timer;

/// Receives every completed entry/exit timer. May be called concurrently
/// from multiple probe consumers.
pub trait TimerSink: Send + Sync {
    fn on_timer(&self, timer: &Timer);
}

/// Human-facing capture status.
pub trait StatusSink: Send + Sync {
    fn info(&self, title: &str, message: &str);
    fn error(&self, title: &str, message: &str);
    fn progress(&self, message: &str);
}

/// Which view of the data changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Timeline,
    SampleReport,
}

/// Signals that pull-able data changed and should be re-read.
pub trait RefreshSink: Send + Sync {
    fn on_data_changed(&self, view: ViewKind);
}

/// Default sinks that forward to the log. Useful for headless embeddings.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TimerSink for LogSink {
    fn on_timer(&self, timer: &Timer) {
        log::trace!(
            "timer tid={} fn={:#x} depth={} {}ns",
            timer.tid,
            timer.function,
            timer.depth,
            timer.duration_ns()
        );
    }
}

impl StatusSink for LogSink {
    fn info(&self, title: &str, message: &str) {
        info!("{title}: {message}");
    }

    fn error(&self, title: &str, message: &str) {
        error!("{title}: {message}");
    }

    fn progress(&self, message: &str) {
        info!("{message}");
    }
}

impl RefreshSink for LogSink {
    fn on_data_changed(&self, view: ViewKind) {
        log::debug!("data changed: {view:?}");
    }
}
