use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use taskgrid::bundler::{BundlerFactory, ChannelPerformance, ProportionalAllocator};
use taskgrid::config::{ExecutorConfig, GridConfig, LoadBalancingConfig};
use taskgrid::grid::Grid;
use taskgrid::scheduler::JobSla;
use taskgrid::shutdown::install_shutdown_handler;
use taskgrid::GridError;

#[derive(Parser, Debug)]
#[command(name = "taskgrid")]
#[command(version)]
#[command(about = "A task grid with adaptive proportional load balancing")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run jobs on a local grid of simulated channels and report how bundles were sized
    Simulate(SimulateArgs),

    /// Compute the proportional bundle sizes for a set of channel mean times
    Allocate(AllocateArgs),

    /// List the known load-balancing algorithms
    Algorithms,
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Relative speed of each local channel (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "1.0,2.0,4.0")]
    channels: Vec<f64>,

    /// Number of jobs to submit
    #[arg(long, default_value = "3")]
    jobs: usize,

    /// Number of tasks per job
    #[arg(long, default_value = "200")]
    tasks: usize,

    /// Cost of one task on a channel of speed 1.0, in microseconds
    #[arg(long, default_value = "1000")]
    task_cost_us: u64,

    /// Relative random variation of each bundle's duration
    #[arg(long, default_value = "0.1")]
    jitter: f64,

    /// Capacity bound used before the queue reports a job size
    #[arg(long, default_value = "300")]
    max_bundle_size: usize,

    /// Load-balancing algorithm (overrides the properties file)
    #[arg(long)]
    algorithm: Option<String>,

    /// Load-balancing properties file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Give up after this many seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct AllocateArgs {
    /// Mean time per task of each channel, in nanoseconds (comma-separated)
    #[arg(long, value_delimiter = ',', required = true)]
    means: Vec<f64>,

    /// Total number of tasks to share
    #[arg(long, default_value = "100")]
    max_size: usize,

    /// Proportionality factor
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..=32))]
    factor: u32,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ChannelOutput {
    channel_id: u64,
    identity: String,
    speed: f64,
    bundle_size: usize,
    dispatched_bundles: u64,
}

#[derive(Serialize)]
struct JobOutput {
    job_id: String,
    name: String,
    status: String,
    completed_tasks: usize,
    failed_tasks: usize,
    dispatches: u64,
}

#[derive(Serialize)]
struct SimulateOutput {
    algorithm: String,
    finished: bool,
    elapsed_ms: u64,
    channels: Vec<ChannelOutput>,
    jobs: Vec<JobOutput>,
}

#[derive(Serialize)]
struct AllocationOutput {
    channel: usize,
    mean: f64,
    size: usize,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_simulation(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.channels.is_empty() {
        return Err(GridError::Config("at least one channel speed is required".to_string()).into());
    }
    let mut load_balancing = match &args.config {
        Some(path) => LoadBalancingConfig::load(path)?,
        None => LoadBalancingConfig::default(),
    };
    if let Some(algorithm) = args.algorithm {
        load_balancing.algorithm = algorithm;
    }
    let executor = ExecutorConfig::default()
        .with_task_cost_us(args.task_cost_us)
        .with_jitter(args.jitter);
    let config = GridConfig::default()
        .with_load_balancing(load_balancing)
        .with_max_bundle_size(args.max_bundle_size)
        .with_executor(executor);

    let shutdown = install_shutdown_handler();
    let (grid, receivers) = Grid::new(config, shutdown.clone());
    let grid = Arc::new(grid);

    let mut speeds = HashMap::new();
    for speed in &args.channels {
        let info = grid.attach_local_channel(*speed).await;
        speeds.insert(info.id, *speed);
    }

    let runner = {
        let grid = grid.clone();
        tokio::spawn(async move { grid.run(receivers).await })
    };

    tracing::info!(
        channels = args.channels.len(),
        jobs = args.jobs,
        tasks = args.tasks,
        "Starting simulation"
    );

    let started = Instant::now();
    let mut submitted = Vec::with_capacity(args.jobs);
    for i in 0..args.jobs {
        let payloads = (0..args.tasks)
            .map(|t| (t as u64).to_le_bytes().to_vec())
            .collect();
        let job = grid
            .submit_job(format!("job-{}", i + 1), payloads, JobSla::default())
            .await?;
        submitted.push(job);
    }

    let finished = tokio::time::timeout(Duration::from_secs(args.timeout_secs), async {
        while !submitted.iter().all(|j| j.is_terminal()) && !shutdown.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
        && submitted.iter().all(|j| j.is_terminal());
    let elapsed = started.elapsed();
    if !finished {
        tracing::warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            "Simulation stopped before every job ended"
        );
    }

    let (algorithm, channels) = {
        let dispatcher = grid.dispatcher().read().await;
        let channels: Vec<ChannelOutput> = dispatcher
            .all_channels()
            .iter()
            .map(|c| ChannelOutput {
                channel_id: c.info.id,
                identity: c.info.identity.clone(),
                speed: speeds.get(&c.info.id).copied().unwrap_or(1.0),
                bundle_size: c.bundle_size(),
                dispatched_bundles: c.dispatched_bundles,
            })
            .collect();
        (dispatcher.factory().algorithm().to_string(), channels)
    };
    let jobs: Vec<JobOutput> = submitted
        .iter()
        .map(|j| JobOutput {
            job_id: j.uuid().to_string(),
            name: j.name().to_string(),
            status: j.status().to_string(),
            completed_tasks: j.completed_task_count(),
            failed_tasks: j.failed_task_count(),
            dispatches: j.total_dispatches(),
        })
        .collect();

    shutdown.cancel();
    runner.await?;

    let output = SimulateOutput {
        algorithm,
        finished,
        elapsed_ms: elapsed.as_millis() as u64,
        channels,
        jobs,
    };
    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => print_simulation(&output),
    }
    Ok(())
}

fn print_simulation(output: &SimulateOutput) {
    println!("Simulation ({})", output.algorithm);
    println!("{}", "=".repeat(40));
    println!(
        "Elapsed: {} ms{}",
        output.elapsed_ms,
        if output.finished { "" } else { " (timed out)" }
    );
    println!();
    println!("Channels:");
    println!("{:<8} {:<12} {:<8} {:<8} BUNDLES", "ID", "IDENTITY", "SPEED", "SIZE");
    println!("{}", "-".repeat(50));
    for channel in &output.channels {
        println!(
            "{:<8} {:<12} {:<8.2} {:<8} {}",
            channel.channel_id,
            channel.identity,
            channel.speed,
            channel.bundle_size,
            channel.dispatched_bundles
        );
    }
    println!();
    println!("Jobs:");
    println!(
        "{:<38} {:<10} {:<10} {:<8} {:<8} DISPATCHES",
        "JOB ID", "NAME", "STATUS", "DONE", "FAILED"
    );
    println!("{}", "-".repeat(90));
    for job in &output.jobs {
        println!(
            "{:<38} {:<10} {:<10} {:<8} {:<8} {}",
            job.job_id, job.name, job.status, job.completed_tasks, job.failed_tasks, job.dispatches
        );
    }
}

fn handle_allocate(args: AllocateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let channels: Vec<ChannelPerformance> = args
        .means
        .iter()
        .enumerate()
        .map(|(idx, mean)| ChannelPerformance {
            id: idx as u64,
            mean: *mean,
            proportionality_factor: args.factor,
        })
        .collect();
    let sizes = ProportionalAllocator::compute(&channels, args.max_size.max(1));

    let rows: Vec<AllocationOutput> = channels
        .iter()
        .zip(sizes)
        .map(|(c, size)| AllocationOutput {
            channel: c.id as usize,
            mean: c.mean,
            size,
        })
        .collect();

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Table => {
            println!("{:<8} {:<16} SIZE", "CHANNEL", "MEAN (ns)");
            println!("{}", "-".repeat(32));
            for row in &rows {
                println!("{:<8} {:<16} {}", row.channel, row.mean, row.size);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Simulate(simulate_args) => {
            run_simulation(simulate_args).await?;
        }
        Commands::Allocate(allocate_args) => {
            handle_allocate(allocate_args)?;
        }
        Commands::Algorithms => {
            for name in BundlerFactory::algorithm_names() {
                println!("{}", name);
            }
        }
    }

    Ok(())
}
