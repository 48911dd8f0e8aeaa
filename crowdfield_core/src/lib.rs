//! Crowdfield Core - kernel rasterization of crowd trajectories
//!
//! This library turns sequences of agent positions into dense scalar fields
//! on a regular grid and streams them to grid-sequence files:
//! 1. **Density**: kernel density estimates with fixed or per-agent radii
//! 2. **Flow**: speed, progress and angular-speed fields from frame pairs
//! 3. **Markers**: splat and advection fields that follow tagged agents
//!
//! Single-frame passes run on a worker pool that rasterizes frames out of
//! order while one writer puts them back in sequence.

pub mod density;
pub mod error;
pub mod fields;
pub mod flow;
pub mod grid;
pub mod kernel;
pub mod pipeline;
pub mod rasterize;
pub mod sequence;

// Re-export key types for convenience
pub use density::{DensityFunction, KernelShape};
pub use error::{FieldError, Result};
pub use fields::{FieldReport, FieldSequence, Segment};
pub use flow::{AgentStats, ProgressTracker, SpeedConfig, SpeedMode, SpeedRasterizer, StatsRecorder};
pub use grid::{Grid, GridDomain, Window};
pub use kernel::{Kernel, KernelPool};
pub use pipeline::{PipelineConfig, RasterPipeline, ReorderBuffer, WorkerReport};
pub use rasterize::{DensityRasterizer, Rasterize, ValueRasterizer, Walls, PERSONAL_SPACE};
pub use sequence::{ElementType, ReaderConfig, SequenceReader, SequenceSummary, SequenceWriter};
