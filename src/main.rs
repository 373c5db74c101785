//! flowrt - CLI

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flowrt::util::logger::{self, LogLevel};
use flowrt::{
    task_fn, AccessMode, DepCount, EventKind, EventParams, Guid, Runtime, RuntimeConfig, TaskBuilder,
    NAME, VERSION,
};

const WAIT_LIMIT: Duration = Duration::from_secs(60);

/// Asynchronous dataflow task runtime
#[derive(Parser, Debug)]
#[command(name = "flowrt")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Worker threads per domain
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Number of policy domains
    #[arg(short, long, global = true)]
    domains: Option<usize>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a built-in workload and print its statistics as JSON
    Run {
        #[arg(value_enum)]
        workload: Workload,

        /// Problem size: fib argument, tree depth or pipeline length
        #[arg(short, long)]
        size: Option<u64>,
    },

    /// Print the effective configuration
    Config,

    /// Print version information
    Version,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Workload {
    /// Recursive Fibonacci with continuation tasks
    Fib,
    /// Binary task tree under one finish scope
    Tree,
    /// Chain of stages passing one data-block along
    Pipeline,
}

fn effective_config(args: &Args) -> Result<RuntimeConfig> {
    let mut config = RuntimeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(workers) = args.workers {
        config.scheduler.workers = workers;
    }
    if let Some(domains) = args.domains {
        config.runtime.domains = domains;
    }
    if args.verbose {
        config.log.level = LogLevel::Debug;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = effective_config(&args)?;
    logger::try_init_with_level(config.log.level);

    match args.command {
        Commands::Run { workload, size } => run(config, workload, size)?,
        Commands::Config => {
            print!("{}", config.to_toml().context("Failed to render configuration")?);
        },
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        },
    }
    Ok(())
}

fn run(
    config: RuntimeConfig,
    workload: Workload,
    size: Option<u64>,
) -> Result<()> {
    let runtime = Runtime::new(config).context("Failed to start runtime")?;
    let started = Instant::now();
    let result = match workload {
        Workload::Fib => fib(&runtime, size.unwrap_or(15))?,
        Workload::Tree => tree(&runtime, size.unwrap_or(10))?,
        Workload::Pipeline => pipeline(&runtime, size.unwrap_or(64))?,
    };
    let elapsed = started.elapsed();
    if !runtime.wait_quiescent(WAIT_LIMIT) {
        tracing::warn!("workload did not quiesce");
    }
    let stats = runtime.stats();
    let report = runtime.shutdown();
    let summary = serde_json::json!({
        "workload": format!("{workload:?}").to_lowercase(),
        "result": result,
        "elapsed_ms": elapsed.as_secs_f64() * 1e3,
        "stats": stats,
        "shutdown": report,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn read_u64(
    runtime: &Runtime,
    datablock: Guid,
) -> Result<u64> {
    let owner = runtime
        .domain(datablock.location())
        .context("data-block owned by an unknown domain")?;
    let view = owner.db_acquire(datablock, AccessMode::ReadOnly)?;
    let bytes: [u8; 8] = view
        .as_slice()
        .try_into()
        .context("data-block does not hold a u64")?;
    Ok(u64::from_le_bytes(bytes))
}

fn wait_payload(
    runtime: &Runtime,
    event: Guid,
) -> Result<Guid> {
    match runtime.wait(event, Some(WAIT_LIMIT))? {
        Some(payload) if payload != Guid::ERROR => Ok(payload),
        Some(_) => bail!("workload task failed"),
        None => bail!("workload timed out"),
    }
}

/// `fib(n)`: each task either writes its leaf value or spawns two children
/// and a `sum` continuation that waits on both.
fn fib(
    runtime: &Runtime,
    n: u64,
) -> Result<u64> {
    let root = runtime.root();
    let domains = runtime.num_domains() as u64;
    let sum = root.template_create(
        "fib.sum",
        task_fn(|ctx, params, deps| {
            let mut total = 0;
            for dep in deps.iter().filter(|d| d.is_ok()) {
                if let Ok(view) = ctx.db_acquire(dep.guid, AccessMode::ReadOnly) {
                    let mut word = [0; 8];
                    word.copy_from_slice(&view[..8]);
                    total += u64::from_le_bytes(word);
                }
                if let Err(err) = ctx.db_destroy(dep.guid) {
                    tracing::warn!(block = %dep.guid, %err, "partial sum not released");
                }
            }
            let published = ctx
                .db_create(total.to_le_bytes().to_vec())
                .and_then(|block| ctx.satisfy(Guid::from_raw(params[0]), block));
            if let Err(err) = published {
                tracing::warn!(total, %err, "fib sum not published");
            }
            Guid::NULL
        }),
        1,
        DepCount::Fixed(2),
    )?;
    let step = root.template_create(
        "fib.step",
        task_fn(move |ctx, params, _| {
            let (n, result, this) = (params[0], Guid::from_raw(params[1]), params[2]);
            if n < 2 {
                let published = ctx
                    .db_create(n.to_le_bytes().to_vec())
                    .and_then(|block| ctx.satisfy(result, block));
                if let Err(err) = published {
                    tracing::warn!(n, %err, "fib leaf not published");
                }
                return Guid::NULL;
            }
            let spawn = || -> flowrt::Result<()> {
                let left = ctx.event_create(EventKind::Once, EventParams::default())?;
                let right = ctx.event_create(EventKind::Once, EventParams::default())?;
                ctx.create_task(
                    TaskBuilder::new(sum)
                        .params(&[result.raw()])
                        .depv(&[left, right]),
                )?;
                for (k, event) in [(n - 1, left), (n - 2, right)] {
                    let target = (k % domains) as usize;
                    ctx.create_task(
                        TaskBuilder::new(Guid::from_raw(this))
                            .params(&[k, event.raw(), this])
                            .on_domain(target),
                    )?;
                }
                Ok(())
            };
            if let Err(err) = spawn() {
                tracing::error!(n, %err, "fib step failed");
            }
            Guid::NULL
        }),
        3,
        DepCount::Fixed(0),
    )?;

    let result = root.event_create(EventKind::Sticky, EventParams::default())?;
    root.create_task(TaskBuilder::new(step).params(&[n, result.raw(), step.raw()]))?;
    let payload = wait_payload(runtime, result)?;
    read_u64(runtime, payload)
}

/// Full binary tree of the given depth under one finish scope. Returns the
/// number of tasks that ran.
fn tree(
    runtime: &Runtime,
    depth: u64,
) -> Result<u64> {
    let root = runtime.root();
    let domains = runtime.num_domains();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let node = root.template_create(
        "tree.node",
        task_fn(move |ctx, params, _| {
            counter.fetch_add(1, Ordering::Relaxed);
            let (level, this) = (params[0], params[1]);
            if level < depth {
                for child in 0..2 {
                    let target = (ctx.domain_id() + child + 1) % domains;
                    let created = ctx.create_task(
                        TaskBuilder::new(Guid::from_raw(this))
                            .params(&[level + 1, this])
                            .on_domain(target),
                    );
                    if let Err(err) = created {
                        tracing::error!(level, %err, "tree node could not spawn");
                    }
                }
            }
            Guid::NULL
        }),
        2,
        DepCount::Fixed(0),
    )?;
    let created = root.create_task(
        TaskBuilder::new(node)
            .params(&[0, node.raw()])
            .output(EventKind::Sticky)
            .finish(),
    )?;
    wait_payload(runtime, created.output)?;
    Ok(ran.load(Ordering::Relaxed) as u64)
}

/// `stages` tasks in a chain, each incrementing a counter held in one
/// data-block. Stages rotate over the domains, so the block is cloned at
/// every hop that crosses a domain boundary.
fn pipeline(
    runtime: &Runtime,
    stages: u64,
) -> Result<u64> {
    if stages == 0 {
        return Ok(0);
    }
    let root = runtime.root();
    let stage = root.template_create(
        "pipeline.stage",
        task_fn(|ctx, _, deps| {
            let Some(dep) = deps.first().filter(|d| d.is_ok()) else {
                return Guid::ERROR;
            };
            match ctx.db_acquire(dep.guid, AccessMode::ReadWrite) {
                Ok(mut view) => {
                    if let Ok(bytes) = view.as_mut_slice() {
                        let mut word = [0; 8];
                        word.copy_from_slice(&bytes[..8]);
                        let next = u64::from_le_bytes(word) + 1;
                        bytes[..8].copy_from_slice(&next.to_le_bytes());
                    }
                    dep.guid
                },
                Err(_) => Guid::ERROR,
            }
        }),
        0,
        DepCount::Fixed(1),
    )?;

    let mut upstream = root.db_create(0u64.to_le_bytes().to_vec())?;
    for i in 0..stages {
        let target = (i as usize) % runtime.num_domains();
        let created = root.create_task(
            TaskBuilder::new(stage)
                .depv(&[upstream])
                .output(EventKind::Sticky)
                .on_domain(target),
        )?;
        upstream = created.output;
    }
    let payload = wait_payload(runtime, upstream)?;
    read_u64(runtime, payload)
}
