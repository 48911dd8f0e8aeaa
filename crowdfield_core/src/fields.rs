//! Field passes over a whole trajectory.
//!
//! [`FieldSequence`] ties a source, a rasterizer and a sequence writer
//! together. Each `compute_*` method produces one file next to the output
//! base (`<base>.density`, `<base>.speed`, ...) and returns the header it
//! wrote.
//!
//! Passes over single frames (density, splat, advection) run through the
//! [`RasterPipeline`]. Passes over frame pairs (speed, progress, omega)
//! stream sequentially through a sliding window of frames.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crowdfield_env::{Frame, FrameSource};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::density::{DensityFunction, KernelShape};
use crate::error::{FieldError, Result};
use crate::flow::{
    rasterize_angular_speed, AgentStats, ProgressTracker, SpeedConfig, SpeedMode, SpeedRasterizer,
    StatsRecorder, OMEGA_BACKGROUND, PROGRESS_BACKGROUND,
};
use crate::grid::{Grid, GridDomain};
use crate::pipeline::{PipelineConfig, RasterPipeline};
use crate::rasterize::{DensityRasterizer, ValueRasterizer, Walls};
use crate::sequence::{SequenceSummary, SequenceWriter};

/// A line segment used to seed advection values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub a: Vector2<f32>,
    pub b: Vector2<f32>,
}

impl Segment {
    pub fn new(a: Vector2<f32>, b: Vector2<f32>) -> Self {
        Self { a, b }
    }

    /// Distance from `p` to the closest point of the segment.
    pub fn point_distance(&self, p: Vector2<f32>) -> f32 {
        let ab = self.b - self.a;
        let len_sq = ab.norm_squared();
        if len_sq == 0.0 {
            return (p - self.a).norm();
        }
        let t = ((p - self.a).dot(&ab) / len_sq).clamp(0.0, 1.0);
        (p - (self.a + ab * t)).norm()
    }
}

/// Per-frame agent statistics alongside the written header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldReport {
    pub summary: SequenceSummary,
    pub stats: Vec<AgentStats>,
}

/// Produces field sequences for one domain and output base.
#[derive(Debug, Clone)]
pub struct FieldSequence {
    output_base: PathBuf,
    domain: GridDomain,
    pipeline: PipelineConfig,
    walls: Option<Walls>,
}

impl FieldSequence {
    pub fn new(output_base: impl Into<PathBuf>, domain: GridDomain) -> Self {
        Self {
            output_base: output_base.into(),
            domain,
            pipeline: PipelineConfig::default(),
            walls: None,
        }
    }

    pub fn with_pipeline(mut self, config: PipelineConfig) -> Self {
        self.pipeline = config;
        self
    }

    /// Walls for the variable-radius estimator (defaults to the grid rectangle).
    pub fn with_walls(mut self, walls: Walls) -> Self {
        self.walls = Some(walls);
        self
    }

    pub fn domain(&self) -> &GridDomain {
        &self.domain
    }

    /// `<base>.<extension>`
    pub fn output_path(&self, extension: &str) -> PathBuf {
        sibling_path(&self.output_base, extension)
    }

    fn create_writer(&self, extension: &str) -> Result<SequenceWriter> {
        let path = self.output_path(extension);
        info!("Writing {}", path.display());
        SequenceWriter::create(&path, self.domain)
    }

    /// Kernel density estimate of every frame. Writes `.density`.
    pub fn compute_density<S>(&self, source: &Mutex<S>, function: DensityFunction, radius: f32) -> Result<SequenceSummary>
    where
        S: FrameSource + ?Sized,
    {
        let mut rasterizer = DensityRasterizer::new(function, radius, &self.domain)?;
        if let Some(walls) = self.walls {
            rasterizer = rasterizer.with_walls(walls);
        }
        let pipeline = RasterPipeline::new(self.pipeline.clone(), self.domain)?;
        let writer = self.create_writer("density")?;

        let output = pipeline.run(source, &rasterizer, writer)?;
        output.writer.finish()
    }

    /// Marks the disk of `radius` around every agent with 1. Writes `.splat`.
    pub fn splat_agents<S>(&self, source: &Mutex<S>, radius: f32) -> Result<SequenceSummary>
    where
        S: FrameSource + ?Sized,
    {
        let rasterizer = DensityRasterizer::new(KernelShape::Disk, radius, &self.domain)?;
        let pipeline = RasterPipeline::new(self.pipeline.clone(), self.domain)?;
        let writer = self.create_writer("splat")?;

        let output = pipeline.run(source, &rasterizer, writer)?;
        output.writer.finish_with_range((0.0, 1.0))
    }

    /// Speed field from frame pairs `window` frames apart. Writes `.speed`.
    pub fn compute_speeds<S>(&self, source: &mut S, mode: SpeedMode, config: &SpeedConfig) -> Result<FieldReport>
    where
        S: FrameSource + ?Sized,
    {
        let rasterizer = SpeedRasterizer::new(mode, config.clone(), &self.domain)?;
        let writer = self.create_writer("speed")?;
        info!("Speed mode {} ({}), dt {}", mode, mode.description(), config.dt());

        let (writer, stats) = self.for_each_pair(source, config.window, writer, |f1, f2, stats| {
            let mut grid = Grid::filled(self.domain, mode.background());
            rasterizer.rasterize(f1, f2, &mut grid, stats)?;
            Ok((grid.min_value(), grid))
        })?;

        let observed = writer.observed_range().unwrap_or((0.0, 0.0));
        let summary = writer.finish_with_range(mode.header_range(observed))?;
        Ok(FieldReport { summary, stats })
    }

    /// Fraction of a revolution around the pivot since the first frame. Writes `.progress`.
    ///
    /// Cells no agent touched read -100.
    pub fn compute_progress<S>(&self, source: &mut S, config: &SpeedConfig) -> Result<FieldReport>
    where
        S: FrameSource + ?Sized,
    {
        config.validate()?;
        source.set_next(0)?;
        let Some((_, initial)) = source.next_frame()? else {
            return Err(FieldError::invalid_config("trajectory has no frames"));
        };
        let mut tracker = ProgressTracker::new(&initial, config.pivot);
        let writer = self.create_writer("progress")?;

        let (writer, stats) = self.for_each_pair(source, config.window, writer, |_, f2, stats| {
            let mut grid = Grid::filled(self.domain, PROGRESS_BACKGROUND);
            tracker.rasterize(f2, config, &mut grid, stats);
            let min = grid.min_value();
            grid.swap_value(PROGRESS_BACKGROUND, -PROGRESS_BACKGROUND);
            Ok((min, grid))
        })?;

        let summary = finish_swapped(writer)?;
        Ok(FieldReport { summary, stats })
    }

    /// Signed angular speed around the pivot, in degrees per second. Writes `.omega`.
    ///
    /// Only [`SpeedMode::Blit`] is supported. Cells no agent touched read -720.
    pub fn compute_angular_speeds<S>(&self, source: &mut S, mode: SpeedMode, config: &SpeedConfig) -> Result<FieldReport>
    where
        S: FrameSource + ?Sized,
    {
        if mode != SpeedMode::Blit {
            return Err(FieldError::unsupported(mode.name(), "angular speed"));
        }
        config.validate()?;
        let writer = self.create_writer("omega")?;

        let (writer, stats) = self.for_each_pair(source, config.window, writer, |f1, f2, stats| {
            let mut grid = Grid::filled(self.domain, OMEGA_BACKGROUND);
            rasterize_angular_speed(f1, f2, config, &mut grid, stats);
            let min = grid.min_value();
            grid.swap_value(OMEGA_BACKGROUND, -OMEGA_BACKGROUND);
            Ok((min, grid))
        })?;

        let summary = finish_swapped(writer)?;
        Ok(FieldReport { summary, stats })
    }

    /// Marks agents by their starting distance to `lines` and follows them. Writes `.advec`.
    ///
    /// An agent's value is `max(max_dist - d, 0)` where `d` is its distance in
    /// the first frame to the nearest line.
    pub fn compute_advec_flow<S>(
        &self,
        source: &Mutex<S>,
        function: DensityFunction,
        radius: f32,
        max_dist: f32,
        lines: &[Segment],
    ) -> Result<SequenceSummary>
    where
        S: FrameSource + ?Sized,
    {
        if lines.is_empty() {
            return Err(FieldError::invalid_config("advection needs at least one line"));
        }
        let initial = {
            let mut guard = source.lock().map_err(|_| FieldError::SourcePoisoned)?;
            guard.set_next(0)?;
            guard.next_frame()?
        };
        let Some((_, initial)) = initial else {
            return Err(FieldError::invalid_config("trajectory has no frames"));
        };

        let values = advection_values(&initial, max_dist, lines);
        let rasterizer = ValueRasterizer::new(function, radius, &self.domain, values)?;
        let pipeline = RasterPipeline::new(self.pipeline.clone(), self.domain)?;
        let writer = self.create_writer("advec")?;

        let output = pipeline.run(source, &rasterizer, writer)?;
        let max = output.writer.observed_range().map_or(0.0, |(_, max)| max);
        output.writer.finish_with_range((0.0, max))
    }

    /// Feeds `(f1, f2)` pairs `window` frames apart to `step` and writes each grid.
    ///
    /// `step` returns the grid and the minimum to report for it. Returns the
    /// writer (unfinished) with its running range replaced by the reported
    /// minimum and the written maximum.
    fn for_each_pair<S, F>(
        &self,
        source: &mut S,
        window: usize,
        mut writer: SequenceWriter,
        mut step: F,
    ) -> Result<(PairWriter, Vec<AgentStats>)>
    where
        S: FrameSource + ?Sized,
        F: FnMut(&Frame, &Frame, &mut StatsRecorder) -> Result<(f32, Grid)>,
    {
        source.set_next(0)?;
        let mut frames: VecDeque<Frame> = VecDeque::with_capacity(window + 1);
        while frames.len() <= window {
            match source.next_frame()? {
                Some((_, frame)) => frames.push_back(frame),
                None => break,
            }
        }

        let mut stats = StatsRecorder::new();
        let mut reported: Option<(f32, f32)> = None;
        while frames.len() == window + 1 {
            let Some(f1) = frames.pop_front() else { break };
            let Some(f2) = frames.back() else { break };

            let (min, grid) = step(&f1, f2, &mut stats)?;
            let max = grid.max_value();
            writer.write_grid(&grid)?;
            stats.next_frame();
            reported = Some(match reported {
                Some((lo, hi)) => (lo.min(min), hi.max(max)),
                None => (min, max),
            });

            if let Some((_, frame)) = source.next_frame()? {
                frames.push_back(frame);
            }
        }

        if writer.grid_count() == 0 {
            warn!("Fewer than {} frames; the sequence holds no grids", window + 1);
        }
        Ok((PairWriter { writer, reported }, stats.into_frames()))
    }
}

/// A pair-pass writer together with the range its pass reported.
struct PairWriter {
    writer: SequenceWriter,
    reported: Option<(f32, f32)>,
}

impl PairWriter {
    fn observed_range(&self) -> Option<(f32, f32)> {
        self.reported
    }

    fn finish_with_range(self, range: (f32, f32)) -> Result<SequenceSummary> {
        self.writer.finish_with_range(range)
    }
}

/// Header range for the sentinel-swapped passes: minimum before the swap,
/// maximum after it.
fn finish_swapped(writer: PairWriter) -> Result<SequenceSummary> {
    let range = writer.observed_range().unwrap_or((0.0, 0.0));
    writer.finish_with_range(range)
}

/// Per-agent advection values from the first frame.
pub fn advection_values(frame: &Frame, max_dist: f32, lines: &[Segment]) -> Vec<f32> {
    frame
        .agents()
        .iter()
        .map(|agent| {
            let nearest = lines
                .iter()
                .map(|line| line.point_distance(agent.pos))
                .fold(f32::INFINITY, f32::min);
            (max_dist - nearest).max(0.0)
        })
        .collect()
}

/// `<base>.<extension>` for a bare path, without a [`FieldSequence`].
pub fn sibling_path(base: &Path, extension: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
