//! Single-frame rasterization.
//!
//! A [`Rasterize`] implementation turns one frame of agents into one grid.
//! Implementations hold only read-only state, so one instance is shared by
//! every pipeline worker; per-worker scratch space lives in the
//! [`KernelPool`] each worker passes in.

use std::sync::Arc;

use crowdfield_env::Frame;
use nalgebra::Vector2;

use crate::density::{DensityFunction, KernelShape};
use crate::error::{FieldError, Result};
use crate::grid::{Grid, GridDomain};
use crate::kernel::{Kernel, KernelPool};

/// Smallest radius the variable-radius estimator will use (close personal distance, meters).
pub const PERSONAL_SPACE: f32 = 0.46;

/// A per-frame rasterization strategy.
pub trait Rasterize: Sync {
    /// Adds this frame's contribution to `grid`.
    fn rasterize(&self, frame: &Frame, grid: &mut Grid, pool: &mut KernelPool) -> Result<()>;

    /// Short label for logs.
    fn name(&self) -> &'static str;
}

/// The rectangle whose walls bound the variable-radius estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Walls {
    pub min: Vector2<f32>,
    pub max: Vector2<f32>,
}

impl Walls {
    pub fn new(min: Vector2<f32>, max: Vector2<f32>) -> Self {
        Self { min, max }
    }

    /// Distance from `p` to the closest of the four walls.
    pub fn distance(&self, p: Vector2<f32>) -> f32 {
        let dx = (p.x - self.min.x).abs().min((self.max.x - p.x).abs());
        let dy = (p.y - self.min.y).abs().min((self.max.y - p.y).abs());
        dx.min(dy)
    }
}

impl From<&GridDomain> for Walls {
    fn from(domain: &GridDomain) -> Self {
        Self::new(domain.min_corner(), domain.max_corner())
    }
}

/// Radius for agent `i`: the nearer of its closest neighbor and the closest
/// wall, never below [`PERSONAL_SPACE`].
pub fn variable_radius(frame: &Frame, i: usize, walls: &Walls) -> f32 {
    let pos = frame.position(i);
    let nearest_sq = frame
        .agents()
        .iter()
        .enumerate()
        .filter(|(j, other)| *j != i && other.pos != pos)
        .map(|(_, other)| (other.pos - pos).norm_squared())
        .fold(f32::INFINITY, f32::min);

    walls.distance(pos).min(nearest_sq.sqrt()).max(PERSONAL_SPACE)
}

/// Density estimation with one of the kernel shapes.
///
/// Fixed-radius shapes share one prebuilt kernel. The variable-radius
/// gaussian builds a kernel per agent from the worker's pool.
#[derive(Debug, Clone)]
pub struct DensityRasterizer {
    shape: KernelShape,
    radius: f32,
    cell_size: Vector2<f32>,
    kernel: Option<Arc<Kernel>>,
    walls: Walls,
}

impl DensityRasterizer {
    pub fn new(shape: impl Into<KernelShape>, radius: f32, domain: &GridDomain) -> Result<Self> {
        let shape = shape.into();
        let cell_size = domain.cell_size();
        let kernel = if shape == KernelShape::Density(DensityFunction::VariableGaussian) {
            // Validate the parameters even though kernels are built per agent
            Kernel::dims_for(shape, radius, cell_size)?;
            None
        } else {
            Some(Arc::new(Kernel::build(shape, radius, cell_size)?))
        };
        Ok(Self {
            shape,
            radius,
            cell_size,
            kernel,
            walls: Walls::from(domain),
        })
    }

    /// Overrides the walls used by the variable-radius estimator.
    pub fn with_walls(mut self, walls: Walls) -> Self {
        self.walls = walls;
        self
    }

    pub fn shape(&self) -> KernelShape {
        self.shape
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    /// The shared kernel, if this estimator has a fixed radius.
    pub fn kernel(&self) -> Option<&Arc<Kernel>> {
        self.kernel.as_ref()
    }
}

impl Rasterize for DensityRasterizer {
    fn rasterize(&self, frame: &Frame, grid: &mut Grid, pool: &mut KernelPool) -> Result<()> {
        let domain = *grid.domain();
        for (i, agent) in frame.agents().iter().enumerate() {
            let cell = domain.cell_index(agent.pos);
            match &self.kernel {
                Some(kernel) => grid.accumulate(i, cell, kernel, 1.0)?,
                None => {
                    let radius = variable_radius(frame, i, &self.walls);
                    let kernel = pool.build(self.shape, radius, self.cell_size)?;
                    let result = grid.accumulate(i, cell, &kernel, 1.0);
                    pool.recycle(kernel);
                    result?;
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        match self.shape {
            KernelShape::Disk => "splat",
            _ => "density",
        }
    }
}

/// Kernel density weighted by a per-agent value.
///
/// Values are indexed by agent, so a value assigned in one frame follows the
/// same agent through the whole sequence. Agents without an entry use their
/// own `value` field.
#[derive(Debug, Clone)]
pub struct ValueRasterizer {
    kernel: Arc<Kernel>,
    values: Vec<f32>,
}

impl ValueRasterizer {
    pub fn new(function: DensityFunction, radius: f32, domain: &GridDomain, values: Vec<f32>) -> Result<Self> {
        if function.is_variable() {
            return Err(FieldError::unsupported(function.name(), "value rasterization"));
        }
        Ok(Self {
            kernel: Arc::new(Kernel::build(function, radius, domain.cell_size())?),
            values,
        })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }
}

impl Rasterize for ValueRasterizer {
    fn rasterize(&self, frame: &Frame, grid: &mut Grid, _pool: &mut KernelPool) -> Result<()> {
        rasterize_values(frame, grid, &self.kernel, |i| {
            self.values.get(i).copied().unwrap_or(frame.agents()[i].value)
        })
    }

    fn name(&self) -> &'static str {
        "advection"
    }
}

/// Accumulates `value(i) * kernel` at every agent.
pub fn rasterize_values<F>(frame: &Frame, grid: &mut Grid, kernel: &Kernel, value: F) -> Result<()>
where
    F: Fn(usize) -> f32,
{
    let domain = *grid.domain();
    for (i, agent) in frame.agents().iter().enumerate() {
        grid.accumulate(i, domain.cell_index(agent.pos), kernel, value(i))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn domain(cols: usize, rows: usize) -> GridDomain {
        GridDomain::new(Vector2::zeros(), Vector2::new(cols as f32, rows as f32), (cols, rows)).unwrap()
    }

    #[test]
    fn test_walls_use_all_four_sides() {
        let walls = Walls::new(Vector2::zeros(), Vector2::new(10.0, 4.0));
        assert_relative_eq!(walls.distance(Vector2::new(5.0, 3.5)), 0.5);
        assert_relative_eq!(walls.distance(Vector2::new(9.0, 2.0)), 1.0);
    }

    #[test]
    fn test_variable_radius_clamped() {
        let walls = Walls::new(Vector2::zeros(), Vector2::new(10.0, 10.0));
        let frame = Frame::from_positions(&[[5.0, 5.0], [5.1, 5.0], [5.0, 7.0]]);
        assert_relative_eq!(variable_radius(&frame, 0, &walls), PERSONAL_SPACE);
        assert_relative_eq!(variable_radius(&frame, 2, &walls), 2.0, epsilon = 1e-5);

        let lone = Frame::from_positions(&[[3.0, 6.0]]);
        assert_relative_eq!(variable_radius(&lone, 0, &walls), 3.0);
    }

    #[test]
    fn test_density_peaks_at_agent() {
        let d = domain(8, 8);
        let rasterizer = DensityRasterizer::new(DensityFunction::Gaussian, 1.0, &d).unwrap();
        let frame = Frame::from_positions(&[[2.5, 5.5]]);
        let mut grid = Grid::new(d);
        rasterizer.rasterize(&frame, &mut grid, &mut KernelPool::new()).unwrap();

        assert_relative_eq!(grid.max_value(), grid.get(2, 5));
        assert_relative_eq!(grid.get(1, 5), grid.get(3, 5), epsilon = 1e-7);
    }

    #[test]
    fn test_variable_density_uses_pool() {
        let d = domain(10, 10);
        let rasterizer = DensityRasterizer::new(DensityFunction::VariableGaussian, 1.0, &d).unwrap();
        assert!(rasterizer.kernel().is_none());

        let frame = Frame::from_positions(&[[2.5, 2.5], [2.5, 3.5], [7.5, 7.5]]);
        let mut grid = Grid::new(d);
        let mut pool = KernelPool::new();
        rasterizer.rasterize(&frame, &mut grid, &mut pool).unwrap();
        assert_eq!(pool.stats().0, 3);
        assert!(grid.get(7, 7) > 0.0);
    }

    #[test]
    fn test_values_weight_the_kernel() {
        let d = domain(6, 6);
        let rasterizer = ValueRasterizer::new(DensityFunction::Uniform, 1.0, &d, vec![2.0, 0.0]).unwrap();
        let frame = Frame::from_positions(&[[1.5, 1.5], [4.5, 4.5]]);
        let mut grid = Grid::new(d);
        rasterizer.rasterize(&frame, &mut grid, &mut KernelPool::new()).unwrap();

        assert_relative_eq!(grid.get(1, 1), 1.0);
        assert_relative_eq!(grid.get(4, 4), 0.0);
        assert!(ValueRasterizer::new(DensityFunction::VariableGaussian, 1.0, &d, vec![]).is_err());
    }
}
