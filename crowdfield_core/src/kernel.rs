//! Precomputed kernel stencils.
//!
//! A [`Kernel`] samples a [`KernelShape`] at the cell centers of a square
//! (or, for anisotropic cells, rectangular) window around an agent. The window
//! is always an odd number of cells wide so the agent sits on the center
//! cell. Kernels are immutable once built and can be shared between workers
//! behind an `Arc`.

use std::collections::HashMap;

use nalgebra::Vector2;
use tracing::trace;

use crate::density::KernelShape;
use crate::error::{FieldError, Result};

/// A weight stencil for one shape, radius and cell size.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    shape: KernelShape,
    radius: f32,
    cell_size: Vector2<f32>,
    cols: usize,
    rows: usize,
    /// Column-major, `i * rows + j`
    weights: Vec<f32>,
}

impl Kernel {
    /// Builds a kernel, sampling `shape` at every cell of the stencil.
    pub fn build(shape: impl Into<KernelShape>, radius: f32, cell_size: Vector2<f32>) -> Result<Self> {
        Self::build_into(shape.into(), radius, cell_size, Vec::new())
    }

    /// Stencil dimensions for the given parameters: `2 * ceil(support / cell) + 1`.
    pub fn dims_for(shape: KernelShape, radius: f32, cell_size: Vector2<f32>) -> Result<(usize, usize)> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(FieldError::invalid_config(format!(
                "kernel radius must be positive, got {radius}"
            )));
        }
        if !(cell_size.x > 0.0 && cell_size.y > 0.0) {
            return Err(FieldError::invalid_config(format!(
                "cell size must be positive, got ({}, {})",
                cell_size.x, cell_size.y
            )));
        }
        let support = shape.support(radius);
        let half_cols = (support / cell_size.x).ceil() as usize;
        let half_rows = (support / cell_size.y).ceil() as usize;
        Ok((2 * half_cols + 1, 2 * half_rows + 1))
    }

    fn build_into(
        shape: KernelShape,
        radius: f32,
        cell_size: Vector2<f32>,
        mut buffer: Vec<f32>,
    ) -> Result<Self> {
        let (cols, rows) = Self::dims_for(shape, radius, cell_size)?;
        let (half_cols, half_rows) = ((cols / 2) as f32, (rows / 2) as f32);

        buffer.clear();
        buffer.reserve(cols * rows);
        for i in 0..cols {
            let dx = (i as f32 - half_cols) * cell_size.x;
            for j in 0..rows {
                let dy = (j as f32 - half_rows) * cell_size.y;
                buffer.push(shape.weight(dx, dy, radius));
            }
        }

        Ok(Self {
            shape,
            radius,
            cell_size,
            cols,
            rows,
            weights: buffer,
        })
    }

    pub fn shape(&self) -> KernelShape {
        self.shape
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn cell_size(&self) -> Vector2<f32> {
        self.cell_size
    }

    /// `(columns, rows)`, both odd.
    pub fn dims(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    /// Cells from the center to the edge, per axis.
    pub fn half_extent(&self) -> (usize, usize) {
        (self.cols / 2, self.rows / 2)
    }

    pub fn weight(&self, i: usize, j: usize) -> f32 {
        self.weights[i * self.rows + j]
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn sum(&self) -> f32 {
        self.weights.iter().sum()
    }

    /// Integral of the stencil over the plane (sum times cell area).
    pub fn mass(&self) -> f32 {
        self.sum() * self.cell_size.x * self.cell_size.y
    }
}

/// Recycles kernel buffers for per-agent kernels.
///
/// The variable-radius estimator builds a fresh kernel for every agent in
/// every frame. Buffers are grouped by stencil dimensions so a returned
/// kernel's allocation is reused by the next kernel of the same size.
#[derive(Debug, Default)]
pub struct KernelPool {
    free: HashMap<(usize, usize), Vec<Vec<f32>>>,
    built: usize,
    reused: usize,
}

impl KernelPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a kernel, reusing a pooled buffer of matching size if one exists.
    pub fn build(
        &mut self,
        shape: impl Into<KernelShape>,
        radius: f32,
        cell_size: Vector2<f32>,
    ) -> Result<Kernel> {
        let shape = shape.into();
        let dims = Kernel::dims_for(shape, radius, cell_size)?;
        let buffer = match self.free.get_mut(&dims).and_then(Vec::pop) {
            Some(buffer) => {
                self.reused += 1;
                buffer
            }
            None => Vec::with_capacity(dims.0 * dims.1),
        };
        self.built += 1;
        Kernel::build_into(shape, radius, cell_size, buffer)
    }

    /// Returns a kernel's buffer to the pool.
    pub fn recycle(&mut self, kernel: Kernel) {
        let dims = kernel.dims();
        self.free.entry(dims).or_default().push(kernel.weights);
    }

    /// `(kernels built, buffers reused)`.
    pub fn stats(&self) -> (usize, usize) {
        (self.built, self.reused)
    }
}

impl Drop for KernelPool {
    fn drop(&mut self) {
        if self.built > 0 {
            trace!(
                "Kernel pool: {} built, {} reused across {} size classes",
                self.built,
                self.reused,
                self.free.len()
            );
        }
    }
}
