//! Job runner - opens a trajectory and computes one field sequence from it.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crowdfield_core::{
    AgentStats, DensityFunction, FieldError, FieldSequence, GridDomain, PipelineConfig, Segment, SequenceSummary,
    SpeedConfig, SpeedMode,
};
use crowdfield_env::{FrameSource, ScbReader, SourceConfig, TrajectoryError};
use nalgebra::Vector2;
use thiserror::Error;
use tracing::{debug, info};

/// Errors surfaced by a job.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),

    #[error("JSON export failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad line segment '{0}': expected x0,y0,x1,y1")]
    BadSegment(String),
}

/// The field a job computes, with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Density { function: DensityFunction, radius: f32 },
    Speed { mode: SpeedMode, config: SpeedConfig },
    Progress { config: SpeedConfig },
    Omega { mode: SpeedMode, config: SpeedConfig },
    Splat { radius: f32 },
    Advec {
        function: DensityFunction,
        radius: f32,
        max_dist: f32,
        lines: Vec<Segment>,
    },
}

impl FieldKind {
    /// Name, also the extension of the written file.
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Density { .. } => "density",
            FieldKind::Speed { .. } => "speed",
            FieldKind::Progress { .. } => "progress",
            FieldKind::Omega { .. } => "omega",
            FieldKind::Splat { .. } => "splat",
            FieldKind::Advec { .. } => "advec",
        }
    }

    /// True for the kinds that rasterize frames independently on the worker pool.
    pub fn is_parallel(&self) -> bool {
        matches!(
            self,
            FieldKind::Density { .. } | FieldKind::Splat { .. } | FieldKind::Advec { .. }
        )
    }
}

/// One trajectory in, one sequence out.
#[derive(Debug, Clone)]
pub struct FieldJob {
    pub input: PathBuf,
    pub output_base: PathBuf,
    pub domain: GridDomain,
    pub source: SourceConfig,
    pub pipeline: PipelineConfig,
    pub kind: FieldKind,
}

impl FieldJob {
    /// Creates a job with default source and pipeline settings.
    ///
    /// The output base defaults to the input path without its extension.
    pub fn new(input: impl Into<PathBuf>, domain: GridDomain, kind: FieldKind) -> Self {
        let input = input.into();
        let output_base = input.with_extension("");
        Self {
            input,
            output_base,
            domain,
            source: SourceConfig::default(),
            pipeline: PipelineConfig::default(),
            kind,
        }
    }

    pub fn with_output(mut self, base: impl Into<PathBuf>) -> Self {
        self.output_base = base.into();
        self
    }

    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.source = source;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Path of the sequence this job writes.
    pub fn output_path(&self) -> PathBuf {
        crowdfield_core::fields::sibling_path(&self.output_base, self.kind.name())
    }

    /// Runs the job to completion.
    pub fn run(&self) -> Result<JobResult, RunError> {
        let started = Instant::now();
        let mut reader = ScbReader::open_with(&self.input, self.source.clone())?;
        info!(
            "Computing {} for {} ({} agents, {:?})",
            self.kind.name(),
            self.input.display(),
            reader.agent_count(),
            reader.version()
        );
        debug!("Source: {:?}", self.source);

        let fields = FieldSequence::new(&self.output_base, self.domain).with_pipeline(self.pipeline.clone());
        let (summary, stats) = match &self.kind {
            FieldKind::Density { function, radius } => {
                let source = Mutex::new(reader);
                (fields.compute_density(&source, *function, *radius)?, Vec::new())
            }
            FieldKind::Splat { radius } => {
                let source = Mutex::new(reader);
                (fields.splat_agents(&source, *radius)?, Vec::new())
            }
            FieldKind::Advec {
                function,
                radius,
                max_dist,
                lines,
            } => {
                let source = Mutex::new(reader);
                let summary = fields.compute_advec_flow(&source, *function, *radius, *max_dist, lines)?;
                (summary, Vec::new())
            }
            FieldKind::Speed { mode, config } => {
                let report = fields.compute_speeds(&mut reader, *mode, config)?;
                (report.summary, report.stats)
            }
            FieldKind::Progress { config } => {
                let report = fields.compute_progress(&mut reader, config)?;
                (report.summary, report.stats)
            }
            FieldKind::Omega { mode, config } => {
                let report = fields.compute_angular_speeds(&mut reader, *mode, config)?;
                (report.summary, report.stats)
            }
        };

        let result = JobResult {
            field: self.kind.name(),
            output: self.output_path(),
            summary,
            stats,
            elapsed: started.elapsed(),
        };
        info!(
            "Wrote {} grids to {} in {:.2?} (range {:?})",
            result.summary.grid_count,
            result.output.display(),
            result.elapsed,
            result.summary.range
        );
        Ok(result)
    }
}

/// What a finished job produced.
#[derive(Debug, Clone)]
pub struct JobResult {
    /// Field kind name
    pub field: &'static str,

    /// Sequence file written
    pub output: PathBuf,

    /// Final header
    pub summary: SequenceSummary,

    /// Per-frame agent statistics (pairwise kinds only)
    pub stats: Vec<AgentStats>,

    /// Wall-clock time of the run
    pub elapsed: Duration,
}

impl JobResult {
    /// Writes summary and statistics as JSON next to `input`.
    pub fn export(&self, input: &Path, path: impl AsRef<Path>) -> Result<(), RunError> {
        crate::exporter::FieldExport::new(self.field, input, &self.output, self.summary.clone())
            .with_stats(self.stats.clone())
            .write_to_file(path)?;
        Ok(())
    }
}

/// Parses `x0,y0,x1,y1` into a segment.
pub fn parse_segment(text: &str) -> Result<Segment, RunError> {
    let coords: Vec<f32> = text
        .split(',')
        .map(|part| part.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .map_err(|_| RunError::BadSegment(text.to_string()))?;
    match coords.as_slice() {
        [x0, y0, x1, y1] => Ok(Segment::new(Vector2::new(*x0, *y0), Vector2::new(*x1, *y1))),
        _ => Err(RunError::BadSegment(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::FieldExport;
    use crate::synth::{CrowdOracle, SynthConfig};
    use crowdfield_core::{ReaderConfig, SequenceReader};

    fn synthetic_input(dir: &Path, frames: usize) -> (PathBuf, GridDomain) {
        let config = SynthConfig::default().with_agents(25).with_frames(frames).with_ring(2.0, 5.0);
        let path = dir.join("ring.scb");
        CrowdOracle::new(config.clone()).write_scb(&path).unwrap();
        let (min, size) = config.bounds();
        (path, GridDomain::from_cell_size(min, size, 0.5).unwrap())
    }

    #[test]
    fn test_parse_segment() {
        let seg = parse_segment("0, 1.5,-2,3").unwrap();
        assert_eq!(seg, Segment::new(Vector2::new(0.0, 1.5), Vector2::new(-2.0, 3.0)));
        assert!(matches!(parse_segment("1,2,3"), Err(RunError::BadSegment(_))));
        assert!(matches!(parse_segment("a,b,c,d"), Err(RunError::BadSegment(_))));
    }

    #[test]
    fn test_output_path_defaults_to_input_stem() {
        let domain = GridDomain::from_cell_size(Vector2::zeros(), Vector2::new(4.0, 4.0), 1.0).unwrap();
        let job = FieldJob::new("runs/crowd.scb", domain, FieldKind::Splat { radius: 0.5 });
        assert_eq!(job.output_path(), PathBuf::from("runs/crowd.splat"));
        assert!(job.kind.is_parallel());
    }

    #[test]
    fn test_density_job_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (input, domain) = synthetic_input(dir.path(), 10);

        let job = FieldJob::new(&input, domain, FieldKind::Density {
            function: DensityFunction::Gaussian,
            radius: 1.0,
        })
        .with_pipeline(PipelineConfig::default().with_workers(3));
        let result = job.run().unwrap();

        assert_eq!(result.summary.grid_count, 10);
        assert!(result.summary.range.1 > 0.0);
        assert!(result.stats.is_empty());

        let mut reader = SequenceReader::open(&result.output, ReaderConfig::default()).unwrap();
        assert_eq!(reader.grid_count(), 10);
        let (values, index) = reader.next_grid().unwrap().unwrap();
        assert_eq!(index, 0);
        assert_eq!(values.len(), domain.cell_count());
    }

    #[test]
    fn test_speed_job_exports_stats() {
        let dir = tempfile::tempdir().unwrap();
        let (input, domain) = synthetic_input(dir.path(), 8);

        let config = SpeedConfig::default().with_window(2);
        let job = FieldJob::new(&input, domain, FieldKind::Speed {
            mode: SpeedMode::Blit,
            config,
        })
        .with_source(SourceConfig::default().with_max_frames(6));
        let result = job.run().unwrap();
        // Pairs (0,2) .. (3,5)
        assert_eq!(result.summary.grid_count, 4);
        assert_eq!(result.stats.len(), 4);

        let json = dir.path().join("speed.json");
        result.export(&input, &json).unwrap();
        let export = FieldExport::read_from_file(&json).unwrap();
        assert_eq!(export.field, "speed");
        assert_eq!(export.stats.len(), 4);
    }

    #[test]
    fn test_missing_input_is_trajectory_error() {
        let dir = tempfile::tempdir().unwrap();
        let domain = GridDomain::from_cell_size(Vector2::zeros(), Vector2::new(4.0, 4.0), 1.0).unwrap();
        let job = FieldJob::new(dir.path().join("absent.scb"), domain, FieldKind::Splat { radius: 0.5 });
        assert!(matches!(job.run(), Err(RunError::Trajectory(_))));
    }

    #[test]
    fn test_omega_rejects_gauss_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (input, domain) = synthetic_input(dir.path(), 4);
        let job = FieldJob::new(&input, domain, FieldKind::Omega {
            mode: SpeedMode::NormGauss,
            config: SpeedConfig::default(),
        });
        let err = job.run().unwrap_err();
        assert!(matches!(err, RunError::Field(ref e) if e.is_config_error()));
    }
}
