//! CLI argument definitions

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::probes::ProbeMode;

#[derive(Parser)]
#[command(
    name = "strobe",
    about = "Sampling and tracing profiler for a single Linux process",
    after_help = "\
EXAMPLES:
    sudo strobe --pid 1234 --duration 10
    sudo strobe -p 1234 -f compute -f render --probe-mode tracer
    sudo strobe -p 1234 --sample-period-ms 5 --no-summary"
)]
pub struct Args {
    /// Process ID to profile
    #[arg(short, long)]
    pub pid: i32,

    /// Instrument functions whose demangled name contains this pattern
    /// (repeatable)
    #[arg(short = 'f', long = "function")]
    pub functions: Vec<String>,

    /// Stop after N seconds
    #[arg(long, default_value = "10")]
    pub duration: u64,

    /// Sampling period in milliseconds
    #[arg(long, default_value = "1")]
    pub sample_period_ms: u64,

    /// How entry/exit probes are installed
    #[arg(long, value_enum, default_value = "auto")]
    pub probe_mode: ProbeModeArg,

    /// Tracer binary for the fallback probe mode
    #[arg(long, default_value = "bpftrace")]
    pub tracer: PathBuf,

    /// Skip the process-wide summary pseudo-thread
    #[arg(long)]
    pub no_summary: bool,

    /// Skip context-switch collection
    #[arg(long)]
    pub no_context_switches: bool,

    /// Skip file/line resolution during module load
    #[arg(long)]
    pub no_line_info: bool,

    /// Functions to print per thread in the report
    #[arg(long, default_value = "10")]
    pub top: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProbeModeArg {
    Auto,
    Kernel,
    Tracer,
}

impl From<ProbeModeArg> for ProbeMode {
    fn from(arg: ProbeModeArg) -> Self {
        match arg {
            ProbeModeArg::Auto => ProbeMode::Auto,
            ProbeModeArg::Kernel => ProbeMode::Kernel,
            ProbeModeArg::Tracer => ProbeMode::Tracer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["strobe", "--pid", "1234"]);
        assert_eq!(args.pid, 1234);
        assert_eq!(args.sample_period_ms, 1);
        assert_eq!(args.duration, 10);
        assert_eq!(args.probe_mode, ProbeModeArg::Auto);
        assert!(!args.no_summary);
        assert!(args.functions.is_empty());
    }

    #[test]
    fn test_repeatable_functions() {
        let args = Args::parse_from(["strobe", "-p", "1", "-f", "alpha", "-f", "beta"]);
        assert_eq!(args.functions, vec!["alpha", "beta"]);
    }
}
