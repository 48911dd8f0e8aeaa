//! Speed, progress and angular-speed rasterization.
//!
//! These passes work on pairs of frames `(f1, f2)` separated by a fixed
//! window. Each computes one scalar per agent and spreads it onto the grid
//! around the agent's position in `f2`, either by blitting a small block or
//! by accumulating a kernel.

use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;

use crowdfield_env::Frame;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::density::KernelShape;
use crate::error::{FieldError, Result};
use crate::grid::{Grid, GridDomain};
use crate::kernel::Kernel;

/// Background value of a progress grid before remapping.
pub const PROGRESS_BACKGROUND: f32 = 100.0;

/// Background value of an angular-speed grid before remapping.
pub const OMEGA_BACKGROUND: f32 = 720.0;

/// Background value of a blitted speed grid.
pub const SPEED_BLIT_BACKGROUND: f32 = -1.0;

/// How per-agent speeds are spread onto the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpeedMode {
    Blit,
    NormGauss,
    UnnormGauss,
    NormDense,
    Contrib,
    Laplacian,
}

impl SpeedMode {
    pub fn name(&self) -> &'static str {
        match self {
            SpeedMode::Blit => "blit",
            SpeedMode::NormGauss => "norm-gauss",
            SpeedMode::UnnormGauss => "unnorm-gauss",
            SpeedMode::NormDense => "norm-dense",
            SpeedMode::Contrib => "contrib",
            SpeedMode::Laplacian => "laplacian",
        }
    }

    pub fn all() -> Vec<SpeedMode> {
        vec![
            SpeedMode::Blit,
            SpeedMode::NormGauss,
            SpeedMode::UnnormGauss,
            SpeedMode::NormDense,
            SpeedMode::Contrib,
            SpeedMode::Laplacian,
        ]
    }

    pub fn description(&self) -> &'static str {
        match self {
            SpeedMode::Blit => "Each agent's speed written into the block around its cell",
            SpeedMode::NormGauss => "Speeds spread with a gaussian falloff",
            SpeedMode::UnnormGauss => "Speeds spread with an unnormalized gaussian falloff",
            SpeedMode::NormDense => "Gaussian speeds divided by density (not supported)",
            SpeedMode::Contrib => "Gaussian speeds divided by the total kernel contribution per cell",
            SpeedMode::Laplacian => "Laplacian of gaussian applied to the velocity components",
        }
    }

    /// Value every cell starts from.
    pub fn background(&self) -> f32 {
        match self {
            SpeedMode::Blit => SPEED_BLIT_BACKGROUND,
            _ => 0.0,
        }
    }

    /// Header range from the observed grid range.
    ///
    /// Only the laplacian keeps its observed minimum; the others report 0.
    pub fn header_range(&self, observed: (f32, f32)) -> (f32, f32) {
        match self {
            SpeedMode::Laplacian => observed,
            _ => (0.0, observed.1),
        }
    }
}

impl FromStr for SpeedMode {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self> {
        SpeedMode::all()
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| FieldError::UnknownSpeedMode(s.to_string()))
    }
}

impl fmt::Display for SpeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters shared by the frame-pair passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedConfig {
    /// Seconds between consecutive frames
    pub time_step: f32,

    /// Frames between the two samples of a pair
    pub window: usize,

    /// Kernel radius for the gaussian and laplacian modes
    pub radius: f32,

    /// Agents in any of these states are skipped
    pub excluded_states: Vec<i32>,

    /// Blitted agents faster than this are skipped
    pub max_blit_speed: f32,

    /// Half-width of the blitted block (1 = 3x3)
    pub blit_half_width: usize,

    /// Center of rotation for progress and angular speed
    pub pivot: Vector2<f32>,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            time_step: 0.1,
            window: 1,
            radius: 1.0,
            excluded_states: Vec::new(),
            max_blit_speed: 3.0,
            blit_half_width: 1,
            pivot: Vector2::zeros(),
        }
    }
}

impl SpeedConfig {
    pub fn with_time_step(mut self, time_step: f32) -> Self {
        self.time_step = time_step;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn with_radius(mut self, radius: f32) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_excluded_states(mut self, states: Vec<i32>) -> Self {
        self.excluded_states = states;
        self
    }

    pub fn with_max_blit_speed(mut self, speed: f32) -> Self {
        self.max_blit_speed = speed;
        self
    }

    pub fn with_blit_half_width(mut self, half: usize) -> Self {
        self.blit_half_width = half;
        self
    }

    pub fn with_pivot(mut self, pivot: Vector2<f32>) -> Self {
        self.pivot = pivot;
        self
    }

    /// Time between the two frames of a pair.
    pub fn dt(&self) -> f32 {
        self.time_step * self.window as f32
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.time_step.is_finite() && self.time_step > 0.0) {
            return Err(FieldError::invalid_config(format!(
                "time step must be positive, got {}",
                self.time_step
            )));
        }
        if self.window == 0 {
            return Err(FieldError::invalid_config("time window must be at least 1"));
        }
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(FieldError::invalid_config(format!(
                "radius must be positive, got {}",
                self.radius
            )));
        }
        Ok(())
    }

    pub fn is_excluded(&self, state: i32) -> bool {
        self.excluded_states.contains(&state)
    }
}

/// Summary of the per-agent scalar for one output grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub frame: usize,
    pub count: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std_dev: f32,
}

/// Collects per-agent values and closes them into [`AgentStats`] per frame.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    current: Vec<f32>,
    frames: Vec<AgentStats>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, value: f32) {
        self.current.push(value);
    }

    /// Summarizes the values recorded since the last call.
    pub fn next_frame(&mut self) {
        let frame = self.frames.len();
        let count = self.current.len();
        let stats = if count == 0 {
            AgentStats {
                frame,
                count,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                std_dev: 0.0,
            }
        } else {
            let n = count as f32;
            let mean = self.current.iter().sum::<f32>() / n;
            let variance = self.current.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            AgentStats {
                frame,
                count,
                min: self.current.iter().copied().fold(f32::INFINITY, f32::min),
                max: self.current.iter().copied().fold(f32::NEG_INFINITY, f32::max),
                mean,
                std_dev: variance.sqrt(),
            }
        };
        self.frames.push(stats);
        self.current.clear();
    }

    pub fn frames(&self) -> &[AgentStats] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<AgentStats> {
        self.frames
    }
}

/// Unit vector along `v`; `None` for the zero vector, which has no direction.
fn direction(v: Vector2<f32>) -> Option<Vector2<f32>> {
    let norm = v.norm();
    (norm > 0.0).then(|| v / norm)
}

/// 2-D cross product `a.x * b.y - a.y * b.x`.
fn det(a: Vector2<f32>, b: Vector2<f32>) -> f32 {
    a.x * b.y - a.y * b.x
}

/// Unsigned angle between two unit vectors, in radians.
fn angle_between(a: Vector2<f32>, b: Vector2<f32>) -> f32 {
    a.dot(&b).clamp(-1.0, 1.0).acos()
}

/// Rasterizes per-agent speeds for one [`SpeedMode`].
#[derive(Debug, Clone)]
pub struct SpeedRasterizer {
    mode: SpeedMode,
    config: SpeedConfig,
    kernel: Option<Kernel>,
}

impl SpeedRasterizer {
    pub fn new(mode: SpeedMode, config: SpeedConfig, domain: &GridDomain) -> Result<Self> {
        config.validate()?;
        let kernel = match mode {
            SpeedMode::Blit => None,
            SpeedMode::NormDense => return Err(FieldError::unsupported(mode.name(), "speed")),
            SpeedMode::NormGauss | SpeedMode::UnnormGauss | SpeedMode::Contrib => Some(Kernel::build(
                KernelShape::SpeedFalloff,
                config.radius,
                domain.cell_size(),
            )?),
            SpeedMode::Laplacian => Some(Kernel::build(
                KernelShape::LaplacianOfGaussian,
                config.radius,
                domain.cell_size(),
            )?),
        };
        Ok(Self { mode, config, kernel })
    }

    pub fn mode(&self) -> SpeedMode {
        self.mode
    }

    pub fn config(&self) -> &SpeedConfig {
        &self.config
    }

    /// Writes the speeds of the agents between `f1` and `f2` into `grid`.
    ///
    /// `grid` should start at the mode's [`background`](SpeedMode::background).
    pub fn rasterize(&self, f1: &Frame, f2: &Frame, grid: &mut Grid, stats: &mut StatsRecorder) -> Result<()> {
        let domain = *grid.domain();
        let inv_dt = 1.0 / self.config.dt();
        let mut counts = match self.mode {
            SpeedMode::Contrib => Some(Grid::new(domain)),
            _ => None,
        };
        let mut components = match self.mode {
            SpeedMode::Laplacian => Some((Grid::new(domain), Grid::new(domain))),
            _ => None,
        };

        for (i, (a1, a2)) in f1.agents().iter().zip(f2.agents()).enumerate() {
            if self.config.is_excluded(a2.state) {
                continue;
            }
            let velocity = (a2.pos - a1.pos) * inv_dt;
            let speed = velocity.norm();
            let cell = domain.cell_index(a2.pos);

            match (&self.kernel, &mut components) {
                (None, _) => {
                    if speed > self.config.max_blit_speed {
                        continue;
                    }
                    grid.assign(cell, self.config.blit_half_width, speed);
                }
                (Some(kernel), Some((x, y))) => {
                    x.accumulate(i, cell, kernel, velocity.x)?;
                    y.accumulate(i, cell, kernel, velocity.y)?;
                }
                (Some(kernel), None) => {
                    grid.accumulate(i, cell, kernel, speed)?;
                    if let Some(counts) = counts.as_mut() {
                        counts.accumulate(i, cell, kernel, 1.0)?;
                    }
                }
            }
            stats.record(speed);
        }

        if let Some(counts) = counts {
            grid.divide_by_counts(&counts)?;
        }
        if let Some((x, y)) = components {
            grid.add(&x)?;
            grid.add(&y)?;
        }
        Ok(())
    }
}

/// Signed angular speed of each agent around the pivot, in degrees per second.
///
/// Counter-clockwise motion is positive. An agent on the pivot in either
/// frame has no bearing and reads as 0.
pub fn rasterize_angular_speed(
    f1: &Frame,
    f2: &Frame,
    config: &SpeedConfig,
    grid: &mut Grid,
    stats: &mut StatsRecorder,
) {
    let domain = *grid.domain();
    let to_degrees = 180.0 / PI / config.dt();
    for (a1, a2) in f1.agents().iter().zip(f2.agents()) {
        if config.is_excluded(a2.state) {
            continue;
        }
        let omega = match (direction(a1.pos - config.pivot), direction(a2.pos - config.pivot)) {
            (Some(dir1), Some(dir2)) => {
                let omega = angle_between(dir1, dir2) * to_degrees;
                if det(dir1, dir2) < 0.0 {
                    -omega
                } else {
                    omega
                }
            }
            _ => 0.0,
        };
        grid.assign(domain.cell_index(a2.pos), config.blit_half_width, omega);
        stats.record(omega);
    }
}

/// Tracks how far each agent has circled the pivot since the first frame.
///
/// Progress is the fraction of a full counter-clockwise revolution from the
/// agent's starting direction. The best direction reached so far guards
/// against wrapping: an apparent gain while moving clockwise from the best
/// direction means the agent backed over the start line, and reads as 0.
/// Agents that start on the pivot, or stand on it, also read as 0.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    pivot: Vector2<f32>,
    initial: Vec<Option<Vector2<f32>>>,
    best_dir: Vec<Vector2<f32>>,
    best_progress: Vec<f32>,
}

impl ProgressTracker {
    pub fn new(initial: &Frame, pivot: Vector2<f32>) -> Self {
        let dirs: Vec<_> = initial
            .agents()
            .iter()
            .map(|a| direction(a.pos - pivot))
            .collect();
        Self {
            pivot,
            best_progress: vec![0.0; dirs.len()],
            best_dir: dirs.iter().map(|d| d.unwrap_or_else(Vector2::zeros)).collect(),
            initial: dirs,
        }
    }

    /// Best progress seen so far for agent `i`.
    pub fn best(&self, i: usize) -> f32 {
        self.best_progress[i]
    }

    /// Updates the tracker from `frame` and blits each agent's progress.
    pub fn rasterize(&mut self, frame: &Frame, config: &SpeedConfig, grid: &mut Grid, stats: &mut StatsRecorder) {
        let domain = *grid.domain();
        for (i, agent) in frame.agents().iter().enumerate().take(self.initial.len()) {
            if config.is_excluded(agent.state) {
                continue;
            }
            let progress = match (self.initial[i], direction(agent.pos - self.pivot)) {
                (Some(start), Some(dir)) => {
                    let mut angle = angle_between(dir, start);
                    if det(start, dir) < 0.0 {
                        angle = 2.0 * PI - angle;
                    }
                    let progress = angle / (2.0 * PI);
                    if progress <= self.best_progress[i] {
                        progress
                    } else if det(self.best_dir[i], dir) < 0.0 {
                        0.0
                    } else {
                        self.best_progress[i] = progress;
                        self.best_dir[i] = dir;
                        progress
                    }
                }
                _ => 0.0,
            };

            grid.assign(domain.cell_index(agent.pos), config.blit_half_width, progress);
            stats.record(progress);
        }
    }
}
