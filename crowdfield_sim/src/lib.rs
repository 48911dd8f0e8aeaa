//! crowdfield tooling
//!
//! The pieces behind the `crowdfield` binary, usable on their own:
//!
//! - [`synth`]: seeded synthetic crowds written as SCB trajectories
//! - [`runner`]: one trajectory in, one field sequence out
//! - [`exporter`]: JSON export of sequence summaries and agent statistics
//!
//! ```ignore
//! use crowdfield_sim::{CrowdOracle, FieldJob, FieldKind, SynthConfig};
//!
//! let config = SynthConfig::default().with_agents(50);
//! CrowdOracle::new(config.clone()).write_scb("ring.scb")?;
//!
//! let (min, size) = config.bounds();
//! let domain = GridDomain::from_cell_size(min, size, 0.25)?;
//! let kind = FieldKind::Density { function: DensityFunction::Gaussian, radius: 1.0 };
//! let result = FieldJob::new("ring.scb", domain, kind).run()?;
//! ```

pub mod exporter;
pub mod runner;
pub mod synth;

pub use exporter::FieldExport;
pub use runner::{parse_segment, FieldJob, FieldKind, JobResult, RunError};
pub use synth::{CrowdOracle, SynthConfig, PAUSED_STATE, WALKING_STATE};
