// Report printing favors one long linear flow
#![allow(clippy::too_many_lines)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use strobe::capture::{CaptureContext, CaptureCoordinator, CaptureOptions};
use strobe::cli::Args;
use strobe::domain::{CaptureError, Pid, Tid};
use strobe::symbols::ElfSymbolProvider;

fn main() {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<CaptureError>()
                .map_or(1, CaptureError::exit_code);
            std::process::exit(code);
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let pid = Pid(args.pid);

    println!("🔍 strobe v{}", env!("CARGO_PKG_VERSION"));
    println!("   PID: {pid}\n");

    let symbols = ElfSymbolProvider::for_process(pid, !args.no_line_info)
        .context("loading target symbols")?;

    let selected = if args.functions.is_empty() {
        Vec::new()
    } else {
        let probes = symbols.probes_matching(&args.functions);
        println!("🎯 {} functions match the selection", probes.len());
        probes
    };

    let options = CaptureOptions {
        sample_period_ms: args.sample_period_ms,
        generate_summary: !args.no_summary,
        context_switches: !args.no_context_switches,
        find_file_and_line: !args.no_line_info,
        probe_mode: args.probe_mode.into(),
        tracer_binary: args.tracer.clone(),
        ..CaptureOptions::default()
    };

    let ctx = CaptureContext::new(Arc::new(symbols));
    let mut coordinator = CaptureCoordinator::new(ctx);

    coordinator.start(pid, selected, &options)?;
    println!("📊 capturing for {}s...\n", args.duration);
    std::thread::sleep(Duration::from_secs(args.duration));
    let report = coordinator.stop()?;

    println!("✓ {} samples total\n", report.total_samples);
    for thread in &report.threads {
        let label = if thread.tid == Tid::SUMMARY {
            "process summary".to_string()
        } else {
            format!("thread {} ({})", thread.tid, thread.name)
        };
        println!(
            "── {label}: {} samples, {} timers, {:.0}% cpu",
            thread.samples,
            thread.timer_count,
            thread.average_usage * 100.0
        );
        for function in thread.functions.iter().take(args.top) {
            println!(
                "   {:>6.2}% excl {:>6.2}% incl  {}",
                function.exclusive_pct, function.inclusive_pct, function.name
            );
        }
    }

    let health = &report.health;
    if health.lost_records + health.dropped_events + health.timer_mismatches > 0 {
        println!(
            "\n⚠️  lost {} kernel events, dropped {} queued events, {} timer mismatches",
            health.lost_records, health.dropped_events, health.timer_mismatches
        );
    }
    info!("health: {health:?}");

    Ok(())
}
