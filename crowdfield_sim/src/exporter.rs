//! JSON exporter for field runs.
//!
//! Writes the sequence header summary and the per-frame agent statistics of
//! one run so they can be plotted without parsing the binary sequence.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crowdfield_core::{AgentStats, SequenceSummary};
use serde::{Deserialize, Serialize};

/// Everything a run reports about the sequence it wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldExport {
    /// Field kind ("density", "speed", ...)
    pub field: String,

    /// Trajectory file the run read
    pub input: String,

    /// Sequence file the run wrote
    pub output: String,

    /// Header as patched after the last grid
    pub summary: SequenceSummary,

    /// Per-frame agent statistics (empty for single-frame fields)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stats: Vec<AgentStats>,
}

impl FieldExport {
    /// Creates an export container.
    pub fn new(field: &str, input: &Path, output: &Path, summary: SequenceSummary) -> Self {
        Self {
            field: field.to_string(),
            input: input.display().to_string(),
            output: output.display().to_string(),
            summary,
            stats: Vec::new(),
        }
    }

    pub fn with_stats(mut self, stats: Vec<AgentStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Largest per-agent value seen in any frame.
    pub fn peak_agent_value(&self) -> Option<f32> {
        self.stats
            .iter()
            .filter(|s| s.count > 0)
            .map(|s| s.max)
            .reduce(f32::max)
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Reads an export back.
    pub fn read_from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}
