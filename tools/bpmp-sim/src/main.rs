//! bpmp-sim - Exercise the BPMP mailbox against simulated firmware
//!
//! Commands:
//! - `bpmp-sim ping` - Round-trip latency in a chosen call discipline
//! - `bpmp-sim stress` - Concurrent blocking calls across the thread pool
//! - `bpmp-sim info` - Channel layout, firmware identity and ABI support
//!
//! Settings come from an optional TOML file (`--config`); flags override it.

mod config;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bpmp_mailbox::{Mailbox, Mrq};
use bpmp_mock::{MockBpmp, SimSystem};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use crate::config::SimConfig;

#[derive(Parser)]
#[command(name = "bpmp-sim")]
#[command(version)]
#[command(about = "BPMP mailbox simulator", long_about = None)]
struct Cli {
    /// TOML settings file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Shared-area scheme: raw or ivc
    #[arg(long, global = true)]
    transport: Option<String>,

    /// CPUs with a synchronous channel
    #[arg(long, global = true)]
    cpus: Option<usize>,

    /// Size of the blocking-call channel pool
    #[arg(long, global = true)]
    thread_channels: Option<usize>,

    /// Per-call timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Simulated firmware processing time in microseconds
    #[arg(long, global = true)]
    latency_us: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure round-trip latency
    Ping {
        /// Number of pings
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u32,

        /// Call discipline
        #[arg(short, long, value_enum, default_value_t = Discipline::Blocking)]
        mode: Discipline,
    },

    /// Hammer the thread-channel pool from several threads
    Stress {
        /// Worker threads
        #[arg(short, long, default_value_t = 8)]
        threads: usize,

        /// Calls per worker
        #[arg(short, long, default_value_t = 1000)]
        calls: u32,
    },

    /// Show layout and firmware info
    Info,
}

#[derive(Clone, Copy, ValueEnum)]
enum Discipline {
    Blocking,
    Atomic,
    Threaded,
}

impl Cli {
    fn settings(&self) -> Result<SimConfig> {
        let mut settings = match &self.config {
            Some(path) => SimConfig::load(path)?,
            None => SimConfig::default(),
        };
        if let Some(transport) = &self.transport {
            settings.transport = transport.clone();
        }
        if let Some(cpus) = self.cpus {
            settings.cpus = cpus;
        }
        if let Some(thread_channels) = self.thread_channels {
            settings.thread_channels = thread_channels;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            settings.timeout_ms = timeout_ms;
        }
        if let Some(latency_us) = self.latency_us {
            settings.remote_latency_us = latency_us;
        }
        Ok(settings)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = cli.settings()?;
    let system = start_system(&settings)?;

    match cli.command {
        Commands::Ping { count, mode } => run_ping(&system.mailbox, count, mode)?,
        Commands::Stress { threads, calls } => run_stress(&system, threads, calls)?,
        Commands::Info => show_info(&system, &settings)?,
    }

    print_stats(&system.mailbox);
    Ok(())
}

fn start_system(settings: &SimConfig) -> Result<SimSystem> {
    let kind = settings.transport()?;
    let firmware = MockBpmp::builder().latency(settings.remote_latency());
    let system = SimSystem::start(kind, settings.mailbox()?, firmware)
        .with_context(|| format!("Failed to bring up {} mailbox", kind))?;
    log::info!(
        "Simulated {} with {} CPUs, {} thread channels",
        kind.compatible(),
        settings.cpus,
        settings.thread_channels
    );
    Ok(system)
}

fn run_ping(mailbox: &Mailbox, count: u32, mode: Discipline) -> Result<()> {
    let mut samples = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let rtt = match mode {
            Discipline::Blocking => bpmp_services::ping(mailbox)?,
            Discipline::Atomic => bpmp_services::ping_atomic(mailbox)?,
            Discipline::Threaded => bpmp_services::threaded_ping(mailbox)?,
        };
        samples.push(rtt);
    }
    samples.sort();

    let (Some(min), Some(max)) = (samples.first(), samples.last()) else {
        println!("{} no pings sent", "!".yellow());
        return Ok(());
    };
    let total: Duration = samples.iter().sum();
    let median = samples[samples.len() / 2];
    println!(
        "{} {} pings: min {:?}  median {:?}  mean {:?}  max {:?}",
        "✓".green(),
        count,
        min,
        median,
        total / count,
        max
    );
    Ok(())
}

fn run_stress(system: &SimSystem, threads: usize, calls: u32) -> Result<()> {
    let failures = AtomicU64::new(0);
    let started = Instant::now();

    std::thread::scope(|scope| {
        for worker in 0..threads {
            let failures = &failures;
            let mailbox = &system.mailbox;
            scope.spawn(move || {
                for _ in 0..calls {
                    if let Err(err) = bpmp_services::ping(mailbox) {
                        log::warn!("worker {}: {}", worker, err);
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    let elapsed = started.elapsed();
    let total = threads as u64 * u64::from(calls);
    let failed = failures.load(Ordering::Relaxed);
    let rate = total as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{} {} calls from {} threads in {:?} ({:.0} calls/s)",
        "✓".green(),
        total,
        threads,
        elapsed,
        rate
    );
    if failed > 0 {
        anyhow::bail!("{} of {} calls failed", failed, total);
    }
    Ok(())
}

fn show_info(system: &SimSystem, settings: &SimConfig) -> Result<()> {
    let mailbox = &system.mailbox;
    let layout = mailbox.layout();

    println!("{}", "BPMP Mailbox".bold());
    println!("  Transport:  {} ({})", system.kind, mailbox.transport_name());
    println!("  Compatible: {}", system.kind.compatible());
    println!("  Timeout:    {} ms", settings.timeout_ms);
    println!();
    println!("{}", "Channels".bold());
    println!("  Per-CPU:    0..{}", settings.cpus);
    println!("  Thread:     {}..{}", layout.first_thread(), layout.inbound());
    println!("  Inbound:    {}", layout.inbound());
    println!();

    let tag = bpmp_services::query_tag(mailbox)?;
    println!("{}", "Firmware".bold());
    println!("  Tag:        {}", tag);
    for mrq in [Mrq::PING, Mrq::QUERY_TAG, Mrq::TRACE_MODIFY, Mrq::DEBUGFS, Mrq::RESET] {
        let mark = if bpmp_services::query_abi(mailbox, mrq)? {
            "yes".green()
        } else {
            "no".red()
        };
        println!("  {:<18} {}", mrq.to_string(), mark);
    }
    println!();
    Ok(())
}

fn print_stats(mailbox: &Mailbox) {
    let stats = mailbox.stats();
    log::info!(
        "posts={} atomic={} blocking={} inbound={} completions={} timeouts={} faults={}",
        stats.posts,
        stats.atomic_calls,
        stats.blocking_calls,
        stats.inbound_requests,
        stats.completions,
        stats.timeouts,
        stats.faults
    );
}
