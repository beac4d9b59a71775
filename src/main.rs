//! forkfut - demonstration driver for the forkfut library.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use forkfut::logging::{self, LogConfig};
use forkfut::{Orchestrator, Promise, Resolution};
use owo_colors::{OwoColorize, Stream::Stderr, Stream::Stdout};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use cli::{Cli, Commands, RangeArgs, SampleArgs, StatsArgs};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Sample(args) => cmd_sample(&cli, args),
        Commands::Range(args) => cmd_range(&cli, args),
        Commands::Object => cmd_object(&cli),
        Commands::Fail => cmd_fail(&cli),
        Commands::Stats(args) => cmd_stats(&cli, args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let mut config = LogConfig::from_verbosity(cli.verbose).with_format(cli.log_format);
    // -v on the command line wins over FORKFUT_LOG and RUST_LOG.
    if cli.verbose > 0 {
        let filter = config.level.to_string().to_lowercase();
        config = config.with_filter(filter);
    }
    if let Some(path) = &cli.log_file {
        config = config.with_file(path.clone());
    }
    logging::init_from_config(config.with_env_overrides());
}

fn orchestrator(cli: &Cli) -> Result<Orchestrator> {
    Orchestrator::new(cli.orchestrator_config()).context("Invalid orchestrator settings")
}

/// Print one resolved promise as `label: outcome`.
fn print_resolution<T: std::fmt::Debug>(label: &str, promise: &Promise<T>) {
    let label = label.if_supports_color(Stdout, |text| text.cyan());
    match promise.resolution() {
        Resolution::Value(value) => println!("{}: {:?}", label, value),
        Resolution::Void => println!("{}: (void)", label),
        Resolution::Error(code) => println!(
            "{}: {} ({})",
            label,
            "error".if_supports_color(Stdout, |text| text.red()),
            code
        ),
        Resolution::Pending => println!("{}: pending", label),
    }
}

fn cmd_sample(cli: &Cli, args: &SampleArgs) -> Result<()> {
    let mut orchestrator = orchestrator(cli)?;
    let started = Instant::now();

    let mut pending = Vec::with_capacity(args.tasks as usize);
    for index in 0..args.tasks {
        let nap = Duration::from_millis(u64::from(args.tasks - index) * args.step_ms);
        let promise = orchestrator
            .run(move || {
                std::thread::sleep(nap);
                Ok::<_, std::io::Error>(format!("task {} slept {} ms", index, nap.as_millis()))
            })
            .with_context(|| format!("Failed to launch task {}", index))?;
        pending.push((index, promise));
    }
    eprintln!("Launched {} workers", orchestrator.child_count());

    // Print in completion order, not launch order.
    while !pending.is_empty() {
        orchestrator.reap();
        let mut index = 0;
        while index < pending.len() {
            if pending[index].1.is_resolved() {
                let (task, promise) = pending.swap_remove(index);
                print_resolution(&format!("task {}", task), &promise);
            } else {
                index += 1;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    eprintln!("All tasks resolved in {} ms", started.elapsed().as_millis());
    orchestrator.shutdown().context("Failed to shut down")?;
    Ok(())
}

fn cmd_range(cli: &Cli, args: &RangeArgs) -> Result<()> {
    let mut orchestrator = orchestrator(cli)?;
    let max_len = args.max_len.max(1);

    let mut range = orchestrator.run(move || {
        let mut rng = rand::rng();
        let len = rng.random_range(1..=max_len);
        let start: i64 = rng.random_range(-100..=100);
        Ok::<_, std::io::Error>((start..start + i64::from(len)).collect::<Vec<i64>>())
    })?;

    range.resolve();
    print_resolution("range", &range);
    drop(range);

    orchestrator.shutdown().context("Failed to shut down")?;
    Ok(())
}

/// Record returned by the `object` command's worker.
#[derive(Debug, Serialize, Deserialize)]
struct WorkerRecord {
    pid: u32,
    parent_pid: u32,
    name: String,
    tags: Vec<String>,
    created_at: u64,
}

fn cmd_object(cli: &Cli) -> Result<()> {
    let mut orchestrator = orchestrator(cli)?;
    let parent_pid = std::process::id();

    let mut record = orchestrator.run(move || {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Ok::<_, std::io::Error>(WorkerRecord {
            pid: std::process::id(),
            parent_pid,
            name: "forkfut worker".to_string(),
            tags: vec!["forked".to_string(), "shared-memory".to_string()],
            created_at,
        })
    })?;

    record.resolve();
    print_resolution("object", &record);
    drop(record);

    orchestrator.shutdown().context("Failed to shut down")?;
    Ok(())
}

fn cmd_fail(cli: &Cli) -> Result<()> {
    let mut orchestrator = orchestrator(cli)?;

    let mut failed = orchestrator.run(|| Err::<i32, _>("refusing to work"))?;
    let mut panicked = orchestrator.run(|| -> std::result::Result<i32, String> {
        panic!("worker gave up")
    })?;
    let mut empty = orchestrator.run(|| Ok::<_, std::io::Error>(()))?;

    print_resolution("failed", failed.resolve());
    print_resolution("panicked", panicked.resolve());
    print_resolution("void", empty.resolve());
    drop((failed, panicked, empty));

    orchestrator.shutdown().context("Failed to shut down")?;
    Ok(())
}

fn cmd_stats(cli: &Cli, args: &StatsArgs) -> Result<()> {
    let mut orchestrator = orchestrator(cli)?;

    let mut promises = Vec::with_capacity(args.tasks as usize);
    for index in 0..args.tasks {
        let promise = orchestrator
            .run(move || Ok::<_, std::io::Error>(vec![u64::from(index); index as usize * 100]))
            .with_context(|| format!("Failed to launch task {}", index))?;
        promises.push(promise);
    }

    orchestrator.wait_for_children();
    for promise in &mut promises {
        promise.resolve();
    }
    print_stats("resolved", &orchestrator);

    drop(promises);
    print_stats("released", &orchestrator);

    orchestrator.shutdown().context("Failed to shut down")?;
    Ok(())
}

fn print_stats(label: &str, orchestrator: &Orchestrator) {
    let Some(stats) = orchestrator.segment_stats() else {
        println!("{}: no segment", label);
        return;
    };
    println!("{}", label.if_supports_color(Stdout, |text| text.bold()));
    println!("  segment bytes: {}", stats.total_bytes);
    println!(
        "  slots:         {} of {} in use",
        stats.live_slots, stats.slot_capacity
    );
    println!(
        "  arena:         {} of {} bytes free",
        stats.free_bytes, stats.arena_bytes
    );
}
