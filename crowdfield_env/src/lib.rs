//! Crowdfield Trajectory Layer
//!
//! This crate supplies the agent positions that the field rasterizers in
//! `crowdfield_core` consume. Every input goes through the [`FrameSource`]
//! trait, so the same pipeline can run over an SCB file on disk or over
//! frames generated in memory.
//!
//! # Example
//!
//! ```ignore
//! use crowdfield_env::{FrameSource, ScbReader, SourceConfig};
//!
//! let config = SourceConfig::default().with_step(2).with_max_agents(500);
//! let mut source = ScbReader::open_with("crowd.scb", config)?;
//! while let Some((index, frame)) = source.next_frame()? {
//!     println!("frame {index}: {} agents", frame.len());
//! }
//! ```

mod error;
mod scb;
mod source;
mod types;

pub use error::{Result, TrajectoryError};
pub use scb::{ScbReader, ScbVersion, ScbWriter, DEFAULT_SIM_STEP};
pub use source::{FrameSource, MemorySource, SourceConfig};
pub use types::{Agent, Frame};
