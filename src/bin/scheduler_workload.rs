#![forbid(unsafe_code)]

//! Deterministic scheduler workload runner for perf baselines.
//!
//! ```text
//! cargo run --release --bin scheduler_workload -- \
//!   --tasks 100000 --max-delay-ms 500 --idle-state paused
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use looper::{DispatcherRegistry, Endpoint, IdleState, Runnable, SchedulerConfig};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "scheduler_workload")]
#[command(about = "Deterministic looper scheduler workload runner")]
struct Args {
    /// Number of tasks to post.
    #[arg(long, default_value_t = 10_000)]
    tasks: u64,
    /// Upper bound (exclusive) for per-task delays.
    #[arg(long, default_value_t = 1_000)]
    max_delay_ms: u64,
    /// Every Nth post goes to the front of the queue (0 disables).
    #[arg(long, default_value_t = 16)]
    front_every: u64,
    /// Seed for the delay sequence.
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
    /// Idle state while posting: paused, unpaused or constant-idle.
    #[arg(long, default_value = "paused")]
    idle_state: IdleState,
    /// Optional JSON5 scheduler config file.
    #[arg(long, env = "LOOPER_CONFIG_PATH")]
    config: Option<PathBuf>,
}

/// Linear congruential step; reproducible without pulling in an RNG.
const fn next_rand(state: u64) -> u64 {
    state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1_442_695_040_888_963_407)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let idle_state = args.idle_state;

    let config = match &args.config {
        Some(path) => SchedulerConfig::load_from_path(path)
            .with_context(|| format!("loading scheduler config from {}", path.display()))?
            .apply_env_overrides_with(|name| std::env::var(name).ok()),
        None => SchedulerConfig::from_env(),
    }
    .context("applying LOOPER_* environment overrides")?;

    let registry = DispatcherRegistry::new(config);
    let main = registry.main();
    let endpoint = Endpoint::new(Arc::clone(&main));
    main.scheduler().set_idle_state(idle_state);

    let executed = Arc::new(AtomicU64::new(0));
    let work = {
        let executed = Arc::clone(&executed);
        Runnable::new(move || {
            executed.fetch_add(1, Ordering::Relaxed);
        })
    };

    let start = Instant::now();
    let mut rand = args.seed;
    let mut front_posts = 0_u64;
    for index in 0..args.tasks {
        rand = next_rand(rand);
        if args.front_every > 0 && index % args.front_every == 0 {
            endpoint.post_at_front_of_queue(work.clone());
            front_posts += 1;
        } else {
            let delay = rand.checked_rem(args.max_delay_ms).unwrap_or(0);
            let delay = i64::try_from(delay).context("delay does not fit in i64")?;
            endpoint.post_delayed(work.clone(), delay)?;
        }
    }
    let post_elapsed = start.elapsed();

    main.run_to_end_of_tasks();
    let total_elapsed = start.elapsed();

    let executed = executed.load(Ordering::Relaxed);
    if executed != args.tasks {
        bail!(
            "expected {} executed tasks, saw {executed} ({} still pending)",
            args.tasks,
            main.scheduler().size()
        );
    }

    let elapsed_micros = total_elapsed.as_micros();
    let tasks_per_sec = u128::from(args.tasks)
        .saturating_mul(1_000_000)
        .checked_div(elapsed_micros)
        .unwrap_or(0);

    println!(
        "{}",
        json!({
            "scenario": "post_then_drain",
            "idle_state": idle_state.to_string(),
            "tasks": args.tasks,
            "front_posts": front_posts,
            "max_delay_ms": args.max_delay_ms,
            "seed": args.seed,
            "final_virtual_time_ms": main.scheduler().current_time(),
            "post_elapsed_us": post_elapsed.as_micros(),
            "total_elapsed_us": elapsed_micros,
            "tasks_per_sec": tasks_per_sec,
        })
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_sequence_is_reproducible() {
        let a: Vec<u64> = std::iter::successors(Some(7), |s| Some(next_rand(*s)))
            .take(5)
            .collect();
        let b: Vec<u64> = std::iter::successors(Some(7), |s| Some(next_rand(*s)))
            .take(5)
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn args_parse_idle_state() {
        let args = Args::try_parse_from(["scheduler_workload", "--idle-state", "constant-idle"])
            .expect("parse args");
        assert_eq!(args.idle_state, IdleState::ConstantIdle);
        assert!(Args::try_parse_from(["scheduler_workload", "--idle-state", "bogus"]).is_err());
    }
}
