//! canonlog Stress Test Binary
//!
//! Hammers a single channel with concurrent committers and then checks the
//! ordering guarantees. Run with: `cargo run --bin stress_test -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default test: 100 streams, 1000 events, 10 concurrent tasks, in memory
//! cargo run --release --bin stress_test
//!
//! # SQLite-backed, high concurrency
//! cargo run --release --bin stress_test -- --db /tmp/stress.db --events 10000 --concurrency 50
//!
//! # Same-stream contention with conditional commits
//! cargo run --release --bin stress_test -- --same-stream --events 1000 --concurrency 20
//! ```
//!
//! Log output honours `RUST_LOG` (e.g. `RUST_LOG=canonlog=debug`).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use canonlog::{Channel, ChannelOptions, Error, SqliteStoreFactory, StoreFactory};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Stress test configuration
struct Config {
    /// Number of unique streams to write to
    num_streams: usize,
    /// Total number of events to write
    num_events: usize,
    /// Number of concurrent committer tasks
    concurrency: usize,
    /// Whether every task targets one stream with conditional commits
    same_stream: bool,
    /// SQLite database path (in-memory store if None)
    db_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_streams: 100,
            num_events: 1000,
            concurrency: 10,
            same_stream: false,
            db_path: None,
        }
    }
}

fn usage() -> ! {
    println!(
        r#"canonlog stress test

Usage: stress_test [OPTIONS]

Options:
  -s, --streams <N>     Number of unique streams (default: 100)
  -e, --events <N>      Total events to write (default: 1000)
  -c, --concurrency <N> Concurrent committer tasks (default: 10)
  --same-stream         One stream, conditional commits with retry
  -d, --db <PATH>       SQLite database path (default: in memory)
  -h, --help            Show this help
"#
    );
    std::process::exit(0);
}

fn parse_number(flag: &str, value: Option<&String>) -> usize {
    match value.and_then(|v| v.parse().ok()) {
        Some(n) if n > 0 => n,
        _ => {
            eprintln!("Invalid {flag} value");
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--streams" | "-s" => {
                i += 1;
                config.num_streams = parse_number("--streams", args.get(i));
            }
            "--events" | "-e" => {
                i += 1;
                config.num_events = parse_number("--events", args.get(i));
            }
            "--concurrency" | "-c" => {
                i += 1;
                config.concurrency = parse_number("--concurrency", args.get(i));
            }
            "--same-stream" => config.same_stream = true,
            "--db" | "-d" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config.db_path = Some(path.clone()),
                    None => {
                        eprintln!("--db needs a path");
                        std::process::exit(1);
                    }
                }
            }
            "--help" | "-h" => usage(),
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

/// Commits one event to `stream_name`. In contention mode the commit is
/// conditional on the observed tail and retried until it lands.
async fn commit_one(
    channel: &Channel,
    stream_name: &str,
    payload: Vec<u8>,
    conditional: bool,
    conflicts: &AtomicU64,
) -> canonlog::Result<()> {
    let stream = channel.get_or_create_stream(stream_name)?;
    loop {
        let mut appender = stream.appender();
        appender.create("StressEvent").content(payload.clone()).add()?;
        let outcome = match (conditional, stream.last_event_id()) {
            (true, Some(tail)) => appender.commit_after(tail).await,
            _ => appender.commit().await,
        };
        match outcome {
            Ok(_) => return Ok(()),
            Err(e) if e.is_out_of_sequence() => {
                conflicts.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => return Err(e),
        }
    }
}

#[tokio::main]
async fn main() -> canonlog::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = parse_args();

    println!("canonlog Stress Test");
    println!("====================");
    println!("Streams:     {}", config.num_streams);
    println!("Events:      {}", config.num_events);
    println!("Concurrency: {}", config.concurrency);
    println!(
        "Mode:        {}",
        if config.same_stream {
            "Same-stream contention"
        } else {
            "Multi-stream"
        }
    );
    println!(
        "Store:       {}",
        config.db_path.as_deref().unwrap_or("memory")
    );
    println!();

    let sqlite = match &config.db_path {
        Some(path) => Some(Arc::new(SqliteStoreFactory::open_file(path)?)),
        None => None,
    };
    let channel = match &sqlite {
        Some(factory) => {
            let factory: Arc<dyn StoreFactory> = Arc::clone(factory) as Arc<dyn StoreFactory>;
            Channel::open("stress", factory, ChannelOptions::default())?
        }
        None => Channel::in_memory("stress")?,
    };

    let mut baseline = 0u64;
    for name in channel.stream_names() {
        baseline += channel.stream(name.as_str())?.len() as u64;
    }
    if baseline > 0 {
        info!(baseline, "channel already holds events");
    }

    let events_written = Arc::new(AtomicU64::new(0));
    let conflicts = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicU64::new(0));

    info!("starting stress test");
    let start = Instant::now();

    let mut handles = Vec::new();
    let events_per_task = config.num_events / config.concurrency;

    for task_id in 0..config.concurrency {
        let channel = channel.clone();
        let events_written = Arc::clone(&events_written);
        let conflicts = Arc::clone(&conflicts);
        let errors = Arc::clone(&errors);
        let num_streams = config.num_streams;
        let same_stream = config.same_stream;

        handles.push(tokio::spawn(async move {
            for i in 0..events_per_task {
                let stream_name = if same_stream {
                    "stress-stream".to_string()
                } else {
                    format!("stream-{}", (task_id * events_per_task + i) % num_streams)
                };
                let payload = format!("stress-event-{}-{}", task_id, i).into_bytes();

                match commit_one(&channel, &stream_name, payload, same_stream, &conflicts).await {
                    Ok(()) => {
                        events_written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(task = task_id, error = %e, "commit failed");
                        errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "committer task panicked");
            errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    let elapsed = start.elapsed();

    let written = events_written.load(Ordering::Relaxed);
    let conflict_count = conflicts.load(Ordering::Relaxed);
    let error_count = errors.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Events written:  {}", written);
    println!("Conflicts:       {}", conflict_count);
    println!("Errors:          {}", error_count);
    println!("Duration:        {:?}", elapsed);
    println!(
        "Throughput:      {:.2} events/sec",
        written as f64 / elapsed.as_secs_f64()
    );
    println!();

    println!("Verifying invariants...");

    let mut total = 0u64;
    let mut failures = Vec::new();
    let names = channel.stream_names();
    for name in &names {
        let stream = channel.stream(name.as_str())?;
        let events = stream.events();
        total += events.len() as u64;

        let mut seen = HashSet::new();
        for pair in events.windows(2) {
            if stream.compare(&pair[0].sequence, &pair[1].sequence) != std::cmp::Ordering::Less {
                failures.push(format!("{name}: {} not before {}", pair[0].sequence, pair[1].sequence));
            }
            if pair[1].previous.as_ref() != Some(&pair[0].sequence) {
                failures.push(format!("{name}: broken previous link at {}", pair[1].sequence));
            }
        }
        for event in &events {
            if !seen.insert(event.sequence.clone()) {
                failures.push(format!("{name}: duplicate sequence {}", event.sequence));
            }
        }

        if let Some(factory) = &sqlite {
            let stored = factory.stored_count(name)?;
            if stored != events.len() as u64 {
                failures.push(format!("{name}: {stored} stored, {} in memory", events.len()));
            }
        }
    }

    println!("  Events in channel: {} across {} streams", total, names.len());
    if total != baseline + written {
        failures.push(format!(
            "{total} events in channel, {} expected",
            baseline + written
        ));
    }

    channel.close();

    if failures.is_empty() {
        println!("  Total order:       strictly increasing ✓");
        println!("  Sequences:         no duplicates ✓");
        if sqlite.is_some() {
            println!("  Durability:        store matches memory ✓");
        }
        println!();
        println!("Stress test PASSED ✓");
        Ok(())
    } else {
        for failure in &failures {
            eprintln!("  ✗ {failure}");
        }
        Err(Error::Storage(format!("{} invariant violations", failures.len())))
    }
}
