//! crowdfield CLI
//!
//! Rasterizes crowd trajectories into grid-sequence files, inspects the
//! results and generates synthetic crowds to feed them.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use crowdfield_core::{
    DensityFunction, GridDomain, PipelineConfig, ReaderConfig, SequenceReader, SpeedConfig, SpeedMode,
};
use crowdfield_env::SourceConfig;
use crowdfield_sim::{parse_segment, CrowdOracle, FieldJob, FieldKind, JobResult, SynthConfig};
use nalgebra::Vector2;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Crowd trajectory field rasterizer
#[derive(Parser, Debug)]
#[command(name = "crowdfield")]
#[command(about = "Rasterize crowd trajectories into grid-sequence files", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Kernel density of every frame
    Density(DensityArgs),
    /// Speed field from frame pairs
    Speed(SpeedArgs),
    /// Progress around the pivot since the first frame
    Progress(FlowArgs),
    /// Angular speed around the pivot
    Omega(OmegaArgs),
    /// Disk of ones around every agent
    Splat(SplatArgs),
    /// Advection of values seeded by distance to lines
    Advec(AdvecArgs),
    /// Print a sequence header
    Inspect(InspectArgs),
    /// Write a synthetic SCB crowd
    Synth(SynthArgs),
}

/// Grid domain options.
#[derive(Args, Debug, Clone)]
struct DomainArgs {
    /// Domain minimum x (m)
    #[arg(long, default_value = "-13.0", allow_hyphen_values = true)]
    min_x: f32,

    /// Domain minimum y (m)
    #[arg(long, default_value = "-13.0", allow_hyphen_values = true)]
    min_y: f32,

    /// Domain width (m)
    #[arg(long, default_value = "26.0")]
    size_x: f32,

    /// Domain height (m)
    #[arg(long, default_value = "26.0")]
    size_y: f32,

    /// Cell edge length (m); resolution is size / cell, truncated
    #[arg(long, default_value = "0.25")]
    cell_size: f32,
}

impl DomainArgs {
    fn domain(&self) -> Result<GridDomain> {
        Ok(GridDomain::from_cell_size(
            Vector2::new(self.min_x, self.min_y),
            Vector2::new(self.size_x, self.size_y),
            self.cell_size,
        )?)
    }
}

/// Which frames and agents to read.
#[derive(Args, Debug, Clone)]
struct SourceArgs {
    /// First frame to read
    #[arg(long, default_value = "0")]
    start: usize,

    /// Maximum number of frames to read
    #[arg(long)]
    max_frames: Option<usize>,

    /// Maximum number of agents per frame
    #[arg(long)]
    max_agents: Option<usize>,

    /// Read every n-th frame
    #[arg(long, default_value = "1")]
    stride: usize,
}

impl SourceArgs {
    fn config(&self) -> SourceConfig {
        let mut config = SourceConfig::default().with_start(self.start).with_step(self.stride);
        if let Some(max) = self.max_frames {
            config = config.with_max_frames(max);
        }
        if let Some(max) = self.max_agents {
            config = config.with_max_agents(max);
        }
        config
    }
}

/// Input, output and execution options shared by every field.
#[derive(Args, Debug, Clone)]
struct JobArgs {
    /// SCB trajectory file
    input: PathBuf,

    /// Output base; the field name is appended as extension
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Raster worker threads (default: available cores)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Export the header summary and per-frame agent statistics as JSON
    #[arg(long)]
    stats: Option<PathBuf>,

    #[command(flatten)]
    domain: DomainArgs,

    #[command(flatten)]
    source: SourceArgs,
}

impl JobArgs {
    fn job(&self, kind: FieldKind) -> Result<FieldJob> {
        let mut job = FieldJob::new(&self.input, self.domain.domain()?, kind).with_source(self.source.config());
        if let Some(output) = &self.output {
            job = job.with_output(output);
        }
        if let Some(workers) = self.workers {
            job = job.with_pipeline(PipelineConfig::default().with_workers(workers));
        }
        Ok(job)
    }
}

/// Frame-pair options.
#[derive(Args, Debug, Clone)]
struct FlowArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Seconds between consecutive frames
    #[arg(long, default_value = "0.1")]
    time_step: f32,

    /// Frames between the two ends of each pair
    #[arg(long, default_value = "1")]
    window: usize,

    /// Kernel radius for the gaussian modes (m)
    #[arg(long, default_value = "1.0")]
    radius: f32,

    /// Agent state to leave out (repeatable)
    #[arg(long = "exclude-state")]
    exclude_states: Vec<i32>,

    /// Pivot x for progress and angular speed
    #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
    pivot_x: f32,

    /// Pivot y for progress and angular speed
    #[arg(long, default_value = "0.0", allow_hyphen_values = true)]
    pivot_y: f32,
}

impl FlowArgs {
    fn config(&self) -> SpeedConfig {
        SpeedConfig::default()
            .with_time_step(self.time_step)
            .with_window(self.window)
            .with_radius(self.radius)
            .with_excluded_states(self.exclude_states.clone())
            .with_pivot(Vector2::new(self.pivot_x, self.pivot_y))
    }
}

#[derive(Args, Debug)]
struct DensityArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Density function (uniform, linear, biweight, gaussian, variable-gaussian)
    #[arg(short, long, default_value = "gaussian")]
    function: String,

    /// Kernel radius (m)
    #[arg(short, long, default_value = "1.0")]
    radius: f32,
}

#[derive(Args, Debug)]
struct SpeedArgs {
    #[command(flatten)]
    flow: FlowArgs,

    /// Speed mode (blit, norm-gauss, unnorm-gauss, contrib, laplacian)
    #[arg(short, long, default_value = "blit")]
    mode: String,
}

#[derive(Args, Debug)]
struct OmegaArgs {
    #[command(flatten)]
    flow: FlowArgs,

    /// Speed mode (only blit is supported)
    #[arg(short, long, default_value = "blit")]
    mode: String,
}

#[derive(Args, Debug)]
struct SplatArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Disk radius (m)
    #[arg(short, long, default_value = "0.46")]
    radius: f32,
}

#[derive(Args, Debug)]
struct AdvecArgs {
    #[command(flatten)]
    job: JobArgs,

    /// Seed line as x0,y0,x1,y1 (repeatable)
    #[arg(long = "line", required = true, allow_hyphen_values = true)]
    lines: Vec<String>,

    /// Distance at which the seeded value falls to zero (m)
    #[arg(long, default_value = "2.0")]
    max_dist: f32,

    /// Density function used to spread the values
    #[arg(short, long, default_value = "gaussian")]
    function: String,

    /// Kernel radius (m)
    #[arg(short, long, default_value = "1.0")]
    radius: f32,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Grid-sequence file
    path: PathBuf,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct SynthArgs {
    /// Output SCB file
    output: PathBuf,

    /// Master seed
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of agents
    #[arg(short, long, default_value = "200")]
    agents: usize,

    /// Number of frames
    #[arg(short, long, default_value = "300")]
    frames: usize,

    /// Seconds per frame
    #[arg(long, default_value = "0.1")]
    time_step: f32,

    /// Inner ring radius (m)
    #[arg(long, default_value = "4.0")]
    inner: f32,

    /// Outer ring radius (m)
    #[arg(long, default_value = "12.0")]
    outer: f32,
}

fn init_logging(verbose: bool) -> Result<()> {
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;
    } else {
        let level = if verbose { Level::DEBUG } else { Level::INFO };
        let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
        tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;
    }
    Ok(())
}

fn run_job(args: &JobArgs, kind: FieldKind) -> Result<JobResult> {
    let job = args.job(kind)?;
    let result = job
        .run()
        .with_context(|| format!("{} failed for {}", job.kind.name(), job.input.display()))?;
    if let Some(path) = &args.stats {
        result.export(&job.input, path)?;
        info!("Exported statistics to {}", path.display());
    }
    Ok(result)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Command::Density(args) => {
            let function: DensityFunction = args.function.parse()?;
            run_job(&args.job, FieldKind::Density {
                function,
                radius: args.radius,
            })?;
        }
        Command::Speed(args) => {
            let mode: SpeedMode = args.mode.parse()?;
            run_job(&args.flow.job, FieldKind::Speed {
                mode,
                config: args.flow.config(),
            })?;
        }
        Command::Progress(args) => {
            run_job(&args.job, FieldKind::Progress { config: args.config() })?;
        }
        Command::Omega(args) => {
            let mode: SpeedMode = args.mode.parse()?;
            run_job(&args.flow.job, FieldKind::Omega {
                mode,
                config: args.flow.config(),
            })?;
        }
        Command::Splat(args) => {
            run_job(&args.job, FieldKind::Splat { radius: args.radius })?;
        }
        Command::Advec(args) => {
            let function: DensityFunction = args.function.parse()?;
            let lines = args
                .lines
                .iter()
                .map(|text| parse_segment(text))
                .collect::<Result<Vec<_>, _>>()?;
            run_job(&args.job, FieldKind::Advec {
                function,
                radius: args.radius,
                max_dist: args.max_dist,
                lines,
            })?;
        }
        Command::Inspect(args) => {
            let reader = SequenceReader::open(&args.path, ReaderConfig::default())
                .with_context(|| format!("Cannot read {}", args.path.display()))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(reader.summary())?);
            } else {
                println!("{}", reader.summary());
            }
        }
        Command::Synth(args) => {
            if args.outer < args.inner {
                bail!("outer radius {} is smaller than inner radius {}", args.outer, args.inner);
            }
            let config = SynthConfig::default()
                .with_seed(args.seed)
                .with_agents(args.agents)
                .with_frames(args.frames)
                .with_time_step(args.time_step)
                .with_ring(args.inner, args.outer);
            let (min, size) = config.bounds();
            let written = CrowdOracle::new(config).write_scb(&args.output)?;
            info!(
                "{} frames written; domain --min-x {} --min-y {} --size-x {} --size-y {} covers the crowd",
                written, min.x, min.y, size.x, size.y
            );
        }
    }
    Ok(())
}
