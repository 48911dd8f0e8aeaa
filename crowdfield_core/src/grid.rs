//! The spatial grid and its world-to-cell mapping.
//!
//! A [`GridDomain`] fixes the rectangle a field covers and how finely it is
//! sampled. A [`Grid`] holds one scalar per cell of a domain. Storage is
//! column-major: x is the outer index, so cell `(col, row)` lives at
//! `col * rows + row`.

use std::fmt;
use std::io::Write;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

use crate::error::{FieldError, Result};
use crate::kernel::Kernel;

/// Rectangle and resolution of a field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridDomain {
    /// World position of the lower-left corner
    min_corner: Vector2<f32>,

    /// World extent along x and y
    size: Vector2<f32>,

    /// Cell count as (columns, rows)
    resolution: (usize, usize),

    /// Always `size / resolution`
    cell_size: Vector2<f32>,
}

impl GridDomain {
    /// Creates a domain with an explicit resolution.
    pub fn new(min_corner: Vector2<f32>, size: Vector2<f32>, resolution: (usize, usize)) -> Result<Self> {
        Self::check(size, resolution)?;
        Ok(Self {
            min_corner,
            size,
            resolution,
            cell_size: Self::derive_cell_size(size, resolution),
        })
    }

    /// Creates a domain whose resolution is `size / cell` truncated.
    pub fn from_cell_size(min_corner: Vector2<f32>, size: Vector2<f32>, cell: f32) -> Result<Self> {
        if !(cell.is_finite() && cell > 0.0) {
            return Err(FieldError::invalid_config(format!("cell size must be positive, got {cell}")));
        }
        let resolution = ((size.x / cell) as usize, (size.y / cell) as usize);
        Self::new(min_corner, size, resolution)
    }

    fn check(size: Vector2<f32>, resolution: (usize, usize)) -> Result<()> {
        if !(size.x > 0.0 && size.y > 0.0) {
            return Err(FieldError::invalid_config(format!(
                "domain size must be positive, got ({}, {})",
                size.x, size.y
            )));
        }
        if resolution.0 == 0 || resolution.1 == 0 {
            return Err(FieldError::invalid_config(format!(
                "resolution must be at least 1x1, got {}x{}",
                resolution.0, resolution.1
            )));
        }
        Ok(())
    }

    fn derive_cell_size(size: Vector2<f32>, resolution: (usize, usize)) -> Vector2<f32> {
        Vector2::new(size.x / resolution.0 as f32, size.y / resolution.1 as f32)
    }

    pub fn min_corner(&self) -> Vector2<f32> {
        self.min_corner
    }

    pub fn max_corner(&self) -> Vector2<f32> {
        self.min_corner + self.size
    }

    pub fn size(&self) -> Vector2<f32> {
        self.size
    }

    pub fn resolution(&self) -> (usize, usize) {
        self.resolution
    }

    pub fn cell_size(&self) -> Vector2<f32> {
        self.cell_size
    }

    pub fn cell_area(&self) -> f32 {
        self.cell_size.x * self.cell_size.y
    }

    pub fn cell_count(&self) -> usize {
        self.resolution.0 * self.resolution.1
    }

    /// Cell containing `world`, floored. Not bounds checked.
    pub fn cell_index(&self, world: Vector2<f32>) -> (i64, i64) {
        let offset = world - self.min_corner;
        (
            (offset.x / self.cell_size.x).floor() as i64,
            (offset.y / self.cell_size.y).floor() as i64,
        )
    }

    /// World position of the center of cell `(col, row)`.
    pub fn cell_center(&self, col: usize, row: usize) -> Vector2<f32> {
        self.min_corner
            + Vector2::new(
                (col as f32 + 0.5) * self.cell_size.x,
                (row as f32 + 0.5) * self.cell_size.y,
            )
    }

    pub fn contains_cell(&self, col: i64, row: i64) -> bool {
        col >= 0 && row >= 0 && (col as usize) < self.resolution.0 && (row as usize) < self.resolution.1
    }
}

/// A rectangular run of cells, `[left, right) x [bottom, top)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub left: i64,
    pub bottom: i64,
    pub right: i64,
    pub top: i64,
}

impl Window {
    /// The window of half-extent `half` around `cell`.
    pub fn centered(cell: (i64, i64), half: (usize, usize)) -> Self {
        let (hc, hr) = (half.0 as i64, half.1 as i64);
        Self {
            left: cell.0 - hc,
            bottom: cell.1 - hr,
            right: cell.0 + hc + 1,
            top: cell.1 + hr + 1,
        }
    }

    pub fn width(&self) -> i64 {
        self.right - self.left
    }

    pub fn height(&self) -> i64 {
        self.top - self.bottom
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }

    pub fn bounds(&self) -> (i64, i64, i64, i64) {
        (self.left, self.bottom, self.right, self.top)
    }
}

/// Clips `[lo, hi)` against `[0, limit)` and returns the clipped range plus
/// the matching range inside the unclipped window.
fn clip_axis(lo: i64, hi: i64, limit: i64) -> (i64, i64, i64, i64) {
    let (mut lo, mut hi) = (lo, hi);
    let mut src_lo = 0;
    let mut src_hi = hi - lo;
    if lo < 0 {
        src_lo = -lo;
        lo = 0;
    }
    if hi > limit {
        src_hi -= hi - limit;
        hi = limit;
    }
    (lo, hi, src_lo, src_hi)
}

/// One scalar per cell of a [`GridDomain`].
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    domain: GridDomain,
    values: Vec<f32>,
}

impl Grid {
    /// Zero-filled grid.
    pub fn new(domain: GridDomain) -> Self {
        Self::filled(domain, 0.0)
    }

    pub fn filled(domain: GridDomain, value: f32) -> Self {
        Self {
            values: vec![value; domain.cell_count()],
            domain,
        }
    }

    pub fn domain(&self) -> &GridDomain {
        &self.domain
    }

    pub fn resolution(&self) -> (usize, usize) {
        self.domain.resolution
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    pub fn index(&self, col: usize, row: usize) -> usize {
        col * self.domain.resolution.1 + row
    }

    pub fn get(&self, col: usize, row: usize) -> f32 {
        self.values[self.index(col, row)]
    }

    pub fn set(&mut self, col: usize, row: usize, value: f32) {
        let i = self.index(col, row);
        self.values[i] = value;
    }

    /// Clips `window` to the grid.
    ///
    /// Returns the clipped grid window and the matching window in the
    /// unclipped stencil's own coordinates, or `None` when nothing overlaps.
    pub fn clip(&self, window: Window) -> Option<(Window, Window)> {
        let (cols, rows) = self.domain.resolution;
        let (left, right, src_left, src_right) = clip_axis(window.left, window.right, cols as i64);
        let (bottom, top, src_bottom, src_top) = clip_axis(window.bottom, window.top, rows as i64);
        let dst = Window { left, bottom, right, top };
        let src = Window {
            left: src_left,
            bottom: src_bottom,
            right: src_right,
            top: src_top,
        };
        if dst.is_empty() {
            None
        } else {
            Some((dst, src))
        }
    }

    /// Adds `weight * kernel`, centered on `cell`, into the grid.
    ///
    /// The kernel is clipped at the grid edges. `agent` only labels the error
    /// if the clipped windows disagree.
    pub fn accumulate(&mut self, agent: usize, cell: (i64, i64), kernel: &Kernel, weight: f32) -> Result<()> {
        let (kernel_cols, kernel_rows) = kernel.dims();
        let requested = Window::centered(cell, kernel.half_extent());
        let Some((dst, src)) = self.clip(requested) else {
            return Ok(());
        };

        let src_in_kernel = src.left >= 0
            && src.bottom >= 0
            && src.right <= kernel_cols as i64
            && src.top <= kernel_rows as i64;
        if !src_in_kernel || dst.width() != src.width() || dst.height() != src.height() {
            return Err(FieldError::WindowMismatch {
                agent,
                dst: requested.bounds(),
                src: src.bounds(),
                kernel_cols,
                kernel_rows,
            });
        }

        let rows = self.domain.resolution.1;
        let height = dst.height() as usize;
        let weights = kernel.weights();
        for (dc, sc) in (dst.left..dst.right).zip(src.left..src.right) {
            let d0 = dc as usize * rows + dst.bottom as usize;
            let s0 = sc as usize * kernel_rows + src.bottom as usize;
            let column = &mut self.values[d0..d0 + height];
            for (cell, w) in column.iter_mut().zip(&weights[s0..s0 + height]) {
                *cell += weight * w;
            }
        }
        Ok(())
    }

    /// Overwrites the `(2 * half + 1)`-square block around `cell` with `value`.
    pub fn assign(&mut self, cell: (i64, i64), half: usize, value: f32) {
        let Some((dst, _)) = self.clip(Window::centered(cell, (half, half))) else {
            return;
        };
        let rows = self.domain.resolution.1;
        for col in dst.left..dst.right {
            let start = col as usize * rows;
            self.values[start + dst.bottom as usize..start + dst.top as usize].fill(value);
        }
    }

    pub fn max_value(&self) -> f32 {
        self.values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn min_value(&self) -> f32 {
        self.values.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn sum(&self) -> f32 {
        self.values.iter().sum()
    }

    /// Caps every value at `max`.
    pub fn clamp_max(&mut self, max: f32) {
        for v in &mut self.values {
            if *v > max {
                *v = max;
            }
        }
    }

    /// Replaces every cell equal to `old` with `new`.
    pub fn swap_value(&mut self, old: f32, new: f32) {
        for v in &mut self.values {
            if *v == old {
                *v = new;
            }
        }
    }

    pub fn fill(&mut self, value: f32) {
        self.values.fill(value);
    }

    pub fn clear(&mut self) {
        self.fill(0.0);
    }

    pub fn scale(&mut self, factor: f32) {
        for v in &mut self.values {
            *v *= factor;
        }
    }

    pub fn divide(&mut self, divisor: f32) {
        for v in &mut self.values {
            *v /= divisor;
        }
    }

    fn check_resolution(&self, other: &Grid) -> Result<()> {
        if self.resolution() != other.resolution() {
            return Err(FieldError::ResolutionMismatch {
                expected: self.resolution(),
                found: other.resolution(),
            });
        }
        Ok(())
    }

    /// Cellwise sum with another grid of the same resolution.
    pub fn add(&mut self, other: &Grid) -> Result<()> {
        self.check_resolution(other)?;
        for (v, o) in self.values.iter_mut().zip(&other.values) {
            *v += o;
        }
        Ok(())
    }

    /// Cellwise division by `counts`, leaving cells with a zero count as they are.
    pub fn divide_by_counts(&mut self, counts: &Grid) -> Result<()> {
        self.check_resolution(counts)?;
        for (v, c) in self.values.iter_mut().zip(&counts.values) {
            if *c != 0.0 {
                *v /= c;
            }
        }
        Ok(())
    }

    /// World positions of every cell center, in storage order.
    pub fn cell_centers(&self) -> Vec<Vector2<f32>> {
        let (cols, rows) = self.domain.resolution;
        (0..cols)
            .flat_map(|c| (0..rows).map(move |r| (c, r)))
            .map(|(c, r)| self.domain.cell_center(c, r))
            .collect()
    }

    /// Little-endian f32 payload in storage order.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn write_le<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(&self.to_le_bytes())
    }

    /// Replaces the values with a little-endian f32 payload.
    pub fn read_le_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.values.len() * 4 {
            return Err(FieldError::invalid_config(format!(
                "payload of {} bytes does not fit a {}x{} grid",
                bytes.len(),
                self.domain.resolution.0,
                self.domain.resolution.1
            )));
        }
        for (v, chunk) in self.values.iter_mut().zip(bytes.chunks_exact(4)) {
            *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(())
    }
}

impl fmt::Display for Grid {
    /// Rows are printed top-down so the dump reads like a map.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (cols, rows) = self.domain.resolution;
        for row in (0..rows).rev() {
            for col in 0..cols {
                if col > 0 {
                    f.write_str(" ")?;
                }
                write!(f, "{:8.3}", self.get(col, row))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::{DensityFunction, KernelShape};
    use approx::assert_relative_eq;

    fn domain(cols: usize, rows: usize) -> GridDomain {
        GridDomain::new(Vector2::zeros(), Vector2::new(cols as f32, rows as f32), (cols, rows)).unwrap()
    }

    #[test]
    fn test_cell_size_from_resolution() {
        let d = GridDomain::new(Vector2::new(-2.0, -1.0), Vector2::new(4.0, 2.0), (8, 2)).unwrap();
        assert_relative_eq!(d.cell_size().x, 0.5);
        assert_relative_eq!(d.cell_size().y, 1.0);
        assert!(GridDomain::new(Vector2::zeros(), Vector2::new(4.0, 2.0), (0, 3)).is_err());
    }

    #[test]
    fn test_from_cell_size_truncates() {
        let d = GridDomain::from_cell_size(Vector2::zeros(), Vector2::new(10.0, 5.5), 2.0).unwrap();
        assert_eq!(d.resolution(), (5, 2));
        assert_relative_eq!(d.cell_size().y, 2.75);
    }

    #[test]
    fn test_cell_index_floors() {
        let d = GridDomain::new(Vector2::new(-1.0, -1.0), Vector2::new(2.0, 2.0), (4, 4)).unwrap();
        assert_eq!(d.cell_index(Vector2::new(-1.0, -1.0)), (0, 0));
        assert_eq!(d.cell_index(Vector2::new(0.1, -0.1)), (2, 1));
        assert_eq!(d.cell_index(Vector2::new(-1.2, 1.0)), (-1, 4));
    }

    #[test]
    fn test_column_major_storage() {
        let mut grid = Grid::new(domain(3, 2));
        grid.set(2, 1, 5.0);
        assert_eq!(grid.values().len(), 6);
        assert_relative_eq!(grid.values()[2 * 2 + 1], 5.0);
        assert_relative_eq!(grid.max_value(), 5.0);
        assert_relative_eq!(grid.min_value(), 0.0);
    }

    #[test]
    fn test_clip_tracks_source_offset() {
        let grid = Grid::new(domain(4, 4));
        let (dst, src) = grid.clip(Window::centered((0, 3), (2, 2))).unwrap();
        assert_eq!(dst.bounds(), (0, 1, 3, 4));
        assert_eq!(src.bounds(), (2, 0, 5, 3));
        assert!(grid.clip(Window::centered((-5, 0), (1, 1))).is_none());
    }

    #[test]
    fn test_corner_agent_contributes_in_bounds_quadrant() {
        let mut grid = Grid::new(domain(4, 4));
        let kernel = Kernel::build(KernelShape::Disk, 1.0, Vector2::new(1.0, 1.0)).unwrap();
        grid.accumulate(0, (0, 0), &kernel, 1.0).unwrap();

        // Disk of radius 1 on unit cells: center plus the four neighbors
        assert_relative_eq!(grid.get(0, 0), 1.0);
        assert_relative_eq!(grid.get(1, 0), 1.0);
        assert_relative_eq!(grid.get(0, 1), 1.0);
        assert_relative_eq!(grid.sum(), 3.0);
    }

    #[test]
    fn test_clipping_idempotent_when_inside() {
        let kernel = Kernel::build(DensityFunction::Biweight, 2.0, Vector2::new(1.0, 1.0)).unwrap();
        let mut grid = Grid::new(domain(9, 9));
        grid.accumulate(0, (4, 4), &kernel, 1.0).unwrap();
        for i in 0..5 {
            for j in 0..5 {
                assert_relative_eq!(grid.get(i + 2, j + 2), kernel.weight(i, j));
            }
        }
        assert_relative_eq!(grid.sum(), kernel.sum(), epsilon = 1e-5);
    }

    #[test]
    fn test_accumulate_outside_is_noop() {
        let kernel = Kernel::build(DensityFunction::Uniform, 1.0, Vector2::new(1.0, 1.0)).unwrap();
        let mut grid = Grid::new(domain(4, 4));
        grid.accumulate(3, (40, -9), &kernel, 2.0).unwrap();
        assert_relative_eq!(grid.sum(), 0.0);
    }

    #[test]
    fn test_assign_block_clipped() {
        let mut grid = Grid::filled(domain(4, 4), -1.0);
        grid.assign((3, 3), 1, 2.0);
        assert_relative_eq!(grid.get(2, 2), 2.0);
        assert_relative_eq!(grid.get(3, 3), 2.0);
        assert_relative_eq!(grid.get(1, 3), -1.0);
        assert_eq!(grid.values().iter().filter(|v| **v == 2.0).count(), 4);
    }

    #[test]
    fn test_swap_clamp_and_divide() {
        let mut grid = Grid::filled(domain(2, 2), 100.0);
        grid.set(0, 0, 3.0);
        grid.swap_value(100.0, -100.0);
        assert_relative_eq!(grid.min_value(), -100.0);
        grid.clamp_max(1.0);
        assert_relative_eq!(grid.max_value(), 1.0);

        let mut counts = Grid::new(domain(2, 2));
        counts.set(0, 0, 4.0);
        let mut speeds = Grid::filled(domain(2, 2), 8.0);
        speeds.divide_by_counts(&counts).unwrap();
        assert_relative_eq!(speeds.get(0, 0), 2.0);
        assert_relative_eq!(speeds.get(1, 1), 8.0);
        assert!(speeds.add(&Grid::new(domain(3, 2))).is_err());
    }

    #[test]
    fn test_byte_payload_round_trip() {
        let mut grid = Grid::new(domain(3, 2));
        grid.set(1, 0, 1.5);
        grid.set(2, 1, -4.25);
        let bytes = grid.to_le_bytes();
        assert_eq!(bytes.len(), 24);

        let mut copy = Grid::new(domain(3, 2));
        copy.read_le_bytes(&bytes).unwrap();
        assert_eq!(copy, grid);
        assert!(copy.read_le_bytes(&bytes[..20]).is_err());
    }

    #[test]
    fn test_cell_centers_and_display() {
        let mut grid = Grid::new(domain(2, 2));
        let centers = grid.cell_centers();
        assert_relative_eq!(centers[1].y, 1.5);
        assert_relative_eq!(centers[2].x, 1.5);

        grid.set(0, 1, 1.0);
        let text = grid.to_string();
        let first_line = text.lines().next().unwrap();
        assert!(first_line.trim_start().starts_with("1.000"));
    }
}
