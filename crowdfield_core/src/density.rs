//! Density estimation functions.
//!
//! Every function shares one signature: a displacement `(dx, dy)` from the
//! agent and a radius, returning the weight at that displacement. How the
//! radius is interpreted (box half-width, cutoff, standard deviation) is
//! settled inside each function.

use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FieldError;

/// Smoothing multiplier applied to the variable-radius gaussian.
pub const VARIABLE_GAUSSIAN_LAMBDA: f32 = 1.0;

/// Number of standard deviations a gaussian stencil covers.
pub const GAUSSIAN_SUPPORT_SIGMAS: f32 = 3.0;

/// The estimators selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DensityFunction {
    /// Flat box of height 0.5 over `|dx|, |dy| <= R`
    Uniform,
    /// Cone `1 - d` inside the radius
    Linear,
    /// Normalized biweight `(1 - d^2/R^2) / (4R^2/3)`
    Biweight,
    /// Normalized gaussian with standard deviation R
    Gaussian,
    /// Gaussian whose radius is picked per agent from its surroundings
    VariableGaussian,
}

impl DensityFunction {
    /// Name used on the command line and in logs.
    pub fn name(&self) -> &'static str {
        match self {
            DensityFunction::Uniform => "uniform",
            DensityFunction::Linear => "linear",
            DensityFunction::Biweight => "biweight",
            DensityFunction::Gaussian => "gaussian",
            DensityFunction::VariableGaussian => "variable-gaussian",
        }
    }

    pub fn all() -> Vec<DensityFunction> {
        vec![
            DensityFunction::Uniform,
            DensityFunction::Linear,
            DensityFunction::Biweight,
            DensityFunction::Gaussian,
            DensityFunction::VariableGaussian,
        ]
    }

    /// True when the radius is chosen per agent rather than fixed.
    pub fn is_variable(&self) -> bool {
        matches!(self, DensityFunction::VariableGaussian)
    }

    /// Weight at displacement `(dx, dy)`.
    pub fn weight(&self, dx: f32, dy: f32, radius: f32) -> f32 {
        let dist_sq = dx * dx + dy * dy;
        let r_sq = radius * radius;
        match self {
            DensityFunction::Uniform => {
                if dx.abs() <= radius && dy.abs() <= radius {
                    0.5
                } else {
                    0.0
                }
            }
            DensityFunction::Linear => {
                let dist = dist_sq.sqrt();
                if dist <= radius {
                    1.0 - dist
                } else {
                    0.0
                }
            }
            DensityFunction::Biweight => {
                if dist_sq.sqrt() <= radius {
                    (1.0 - dist_sq / r_sq) / (4.0 * r_sq / 3.0)
                } else {
                    0.0
                }
            }
            DensityFunction::Gaussian => gaussian(dist_sq, r_sq),
            DensityFunction::VariableGaussian => {
                gaussian(dist_sq, r_sq * VARIABLE_GAUSSIAN_LAMBDA * VARIABLE_GAUSSIAN_LAMBDA)
            }
        }
    }

    /// Distance from the agent beyond which the stencil is not evaluated.
    pub fn support(&self, radius: f32) -> f32 {
        match self {
            DensityFunction::Gaussian => GAUSSIAN_SUPPORT_SIGMAS * radius,
            DensityFunction::VariableGaussian => {
                GAUSSIAN_SUPPORT_SIGMAS * radius * VARIABLE_GAUSSIAN_LAMBDA
            }
            _ => radius,
        }
    }
}

fn gaussian(dist_sq: f32, r_sq: f32) -> f32 {
    (-dist_sq / (2.0 * r_sq)).exp() / (2.0 * PI * r_sq)
}

impl FromStr for DensityFunction {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DensityFunction::all()
            .into_iter()
            .find(|f| f.name() == s)
            .ok_or_else(|| FieldError::UnknownDensityFunction(s.to_string()))
    }
}

impl fmt::Display for DensityFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Every stencil shape a [`Kernel`](crate::kernel::Kernel) can be built from.
///
/// The named density functions plus the fixed shapes used internally by the
/// speed, laplacian and splat passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelShape {
    Density(DensityFunction),
    /// Unnormalized falloff `exp(-d^2/R^2)` for gaussian speed modes
    SpeedFalloff,
    /// Laplacian of gaussian
    LaplacianOfGaussian,
    /// Indicator of the closed disk of radius R
    Disk,
}

impl KernelShape {
    pub fn weight(&self, dx: f32, dy: f32, radius: f32) -> f32 {
        let dist_sq = dx * dx + dy * dy;
        let r_sq = radius * radius;
        match self {
            KernelShape::Density(function) => function.weight(dx, dy, radius),
            KernelShape::SpeedFalloff => (-dist_sq / r_sq).exp(),
            KernelShape::LaplacianOfGaussian => {
                let scale = 1.0 / (PI * r_sq);
                scale * (dist_sq - r_sq) / (0.25 * r_sq * r_sq) * (-dist_sq / r_sq).exp()
            }
            KernelShape::Disk => {
                if dist_sq <= r_sq {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    pub fn support(&self, radius: f32) -> f32 {
        match self {
            KernelShape::Density(function) => function.support(radius),
            KernelShape::SpeedFalloff | KernelShape::LaplacianOfGaussian => {
                GAUSSIAN_SUPPORT_SIGMAS * radius
            }
            KernelShape::Disk => radius,
        }
    }
}

impl From<DensityFunction> for KernelShape {
    fn from(function: DensityFunction) -> Self {
        KernelShape::Density(function)
    }
}
