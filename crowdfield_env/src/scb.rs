//! SCB trajectory files.
//!
//! An SCB file is a small header followed by fixed-size frames. Every frame
//! stores the same number of agents, each as a run of little-endian 32-bit
//! values:
//!
//! | Version | Header after tag + count        | Per-agent record                     |
//! |---------|---------------------------------|--------------------------------------|
//! | 1.0     | -                               | x, y, orientation (12 bytes)         |
//! | 2.0     | sim step (f32), ids (i32 each)  | x, y, orientation (12 bytes)         |
//! | 2.1     | same as 2.0                     | x, y, orientation, state (16 bytes)  |
//! | 3.0     | same as 2.0                     | x, y, dir x, dir y (16 bytes)        |
//!
//! Version 2.1 stores the state tag as a float.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use nalgebra::Vector2;
use tracing::debug;

use crate::error::{Result, TrajectoryError};
use crate::source::{FrameSource, SourceConfig};
use crate::types::{Agent, Frame};

/// Simulation step assumed for version 1.0 files, which do not record one.
pub const DEFAULT_SIM_STEP: f32 = 0.1;

/// SCB format revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScbVersion {
    V1_0,
    V2_0,
    V2_1,
    V3_0,
}

impl ScbVersion {
    /// The four-byte tag at the start of the file.
    pub fn tag(&self) -> [u8; 4] {
        match self {
            ScbVersion::V1_0 => *b"1.0\0",
            ScbVersion::V2_0 => *b"2.0\0",
            ScbVersion::V2_1 => *b"2.1\0",
            ScbVersion::V3_0 => *b"3.0\0",
        }
    }

    fn from_tag(tag: &[u8; 4]) -> Result<Self> {
        match tag {
            b"1.0\0" => Ok(ScbVersion::V1_0),
            b"2.0\0" => Ok(ScbVersion::V2_0),
            b"2.1\0" => Ok(ScbVersion::V2_1),
            b"3.0\0" => Ok(ScbVersion::V3_0),
            _ => Err(TrajectoryError::UnsupportedVersion(
                String::from_utf8_lossy(tag).trim_end_matches('\0').to_string(),
            )),
        }
    }

    /// Bytes per agent record.
    pub fn agent_bytes(&self) -> usize {
        match self {
            ScbVersion::V1_0 | ScbVersion::V2_0 => 12,
            ScbVersion::V2_1 | ScbVersion::V3_0 => 16,
        }
    }

    /// Bytes in the header for a file with `agent_count` agents.
    pub fn header_bytes(&self, agent_count: usize) -> usize {
        match self {
            ScbVersion::V1_0 => 8,
            _ => 12 + 4 * agent_count,
        }
    }

    pub fn has_state_data(&self) -> bool {
        *self == ScbVersion::V2_1
    }
}

fn f32_at(buf: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Reads up to `buf.len()` bytes, stopping early only at end of stream.
fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Sequential reader over an SCB file.
#[derive(Debug)]
pub struct ScbReader<R = BufReader<File>> {
    inner: R,
    version: ScbVersion,
    agent_count: usize,
    read_agents: usize,
    sim_step: f32,
    ids: Vec<i32>,
    config: SourceConfig,
    /// Index of the frame the next call returns
    next_index: usize,
    /// Current byte offset of `inner`
    cursor: u64,
}

impl ScbReader<BufReader<File>> {
    /// Opens an SCB file with the default configuration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, SourceConfig::default())
    }

    /// Opens an SCB file with explicit start, cap and stride settings.
    pub fn open_with(path: impl AsRef<Path>, config: SourceConfig) -> Result<Self> {
        let file = BufReader::new(File::open(path.as_ref())?);
        Self::new(file, config)
    }
}

impl<R: Read + Seek> ScbReader<R> {
    /// Parses the header from `inner` and positions the reader at index 0.
    pub fn new(mut inner: R, config: SourceConfig) -> Result<Self> {
        config.validate()?;
        inner.seek(SeekFrom::Start(0))?;

        let mut tag = [0u8; 4];
        inner.read_exact(&mut tag)?;
        let version = ScbVersion::from_tag(&tag)?;

        let mut word = [0u8; 4];
        inner.read_exact(&mut word)?;
        let count = i32::from_le_bytes(word);
        if count <= 0 {
            // Zero-agent frames are zero bytes long and would never reach the end of the file
            return Err(TrajectoryError::malformed(format!("agent count must be positive, got {count}")));
        }
        let agent_count = count as usize;

        let (sim_step, ids) = if version == ScbVersion::V1_0 {
            (DEFAULT_SIM_STEP, vec![0; agent_count])
        } else {
            inner.read_exact(&mut word)?;
            let sim_step = f32::from_le_bytes(word);
            let mut raw = vec![0u8; 4 * agent_count];
            inner.read_exact(&mut raw)?;
            let ids = raw
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            (sim_step, ids)
        };

        let read_agents = config
            .max_agents
            .map_or(agent_count, |max| max.min(agent_count));

        debug!(
            "SCB {:?}: {} agents ({} read), step {}s",
            version, agent_count, read_agents, sim_step
        );

        let cursor = version.header_bytes(agent_count) as u64;
        Ok(Self {
            inner,
            version,
            agent_count,
            read_agents,
            sim_step,
            ids,
            config,
            next_index: 0,
            cursor,
        })
    }

    pub fn version(&self) -> ScbVersion {
        self.version
    }

    /// Simulation step stored in the file (0.1 for version 1.0).
    pub fn sim_step(&self) -> f32 {
        self.sim_step
    }

    /// Per-agent class ids (all zero for version 1.0).
    pub fn class_ids(&self) -> &[i32] {
        &self.ids
    }

    /// Maps each class id to the agents carrying it.
    pub fn classes(&self) -> BTreeMap<i32, Vec<usize>> {
        let mut classes: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (agent, id) in self.ids.iter().enumerate() {
            classes.entry(*id).or_default().push(agent);
        }
        classes
    }

    pub fn has_state_data(&self) -> bool {
        self.version.has_state_data()
    }

    fn frame_bytes(&self) -> u64 {
        (self.agent_count * self.version.agent_bytes()) as u64
    }

    fn frame_offset(&self, index: usize) -> u64 {
        let raw = self.config.start_frame + index * self.config.frame_step;
        self.version.header_bytes(self.agent_count) as u64 + raw as u64 * self.frame_bytes()
    }

    /// Counts the frames reachable from index 0 by scanning the file length.
    pub fn total_frames(&mut self) -> Result<usize> {
        let len = self.inner.seek(SeekFrom::End(0))?;
        self.cursor = len;

        let header = self.version.header_bytes(self.agent_count) as u64;
        let frame_bytes = self.frame_bytes();
        if frame_bytes == 0 {
            return Ok(0);
        }
        let stored = (len.saturating_sub(header) / frame_bytes) as usize;
        let available = stored
            .saturating_sub(self.config.start_frame)
            .div_ceil(self.config.frame_step);
        Ok(self
            .config
            .max_frames
            .map_or(available, |max| available.min(max)))
    }

    fn decode_agent(&self, record: &[u8]) -> Agent {
        let pos = Vector2::new(f32_at(record, 0), f32_at(record, 4));
        match self.version {
            ScbVersion::V2_1 => Agent::with_state(pos, f32_at(record, 12) as i32),
            _ => Agent::new(pos),
        }
    }
}

impl<R: Read + Seek + Send> FrameSource for ScbReader<R> {
    fn next_frame(&mut self) -> Result<Option<(usize, Frame)>> {
        let index = self.next_index;
        if self.config.exhausted(index) {
            return Ok(None);
        }

        let offset = self.frame_offset(index);
        if offset != self.cursor {
            self.inner.seek(SeekFrom::Start(offset))?;
            self.cursor = offset;
        }

        let agent_bytes = self.version.agent_bytes();
        let expected = self.read_agents * agent_bytes;
        let mut buf = vec![0u8; expected];
        let found = read_fully(&mut self.inner, &mut buf)?;
        self.cursor += found as u64;

        if found == 0 && expected > 0 {
            return Ok(None);
        }
        if found < expected {
            return Err(TrajectoryError::TruncatedFrame {
                frame: index,
                expected,
                found,
            });
        }

        let agents = buf
            .chunks_exact(agent_bytes)
            .map(|record| self.decode_agent(record))
            .collect();
        self.next_index += 1;
        Ok(Some((index, Frame::from_agents(agents))))
    }

    fn set_next(&mut self, index: usize) -> Result<()> {
        self.next_index = index;
        Ok(())
    }

    fn agent_count(&self) -> usize {
        self.read_agents
    }
}

/// Writes frames to an SCB file.
#[derive(Debug)]
pub struct ScbWriter<W: Write = BufWriter<File>> {
    out: W,
    version: ScbVersion,
    agent_count: usize,
    frames_written: usize,
}

impl ScbWriter<BufWriter<File>> {
    /// Creates `path` and writes the header.
    pub fn create(
        path: impl AsRef<Path>,
        version: ScbVersion,
        agent_count: usize,
        sim_step: f32,
        ids: Option<&[i32]>,
    ) -> Result<Self> {
        let out = BufWriter::new(File::create(path.as_ref())?);
        Self::new(out, version, agent_count, sim_step, ids)
    }
}

impl<W: Write> ScbWriter<W> {
    /// Writes the header to `out`.
    pub fn new(
        mut out: W,
        version: ScbVersion,
        agent_count: usize,
        sim_step: f32,
        ids: Option<&[i32]>,
    ) -> Result<Self> {
        if agent_count == 0 {
            return Err(TrajectoryError::invalid_config("an SCB file needs at least one agent"));
        }
        out.write_all(&version.tag())?;
        out.write_all(&(agent_count as i32).to_le_bytes())?;

        if version != ScbVersion::V1_0 {
            out.write_all(&sim_step.to_le_bytes())?;
            match ids {
                Some(ids) if ids.len() != agent_count => {
                    return Err(TrajectoryError::AgentCountMismatch {
                        expected: agent_count,
                        found: ids.len(),
                    });
                }
                Some(ids) => {
                    for id in ids {
                        out.write_all(&id.to_le_bytes())?;
                    }
                }
                None => {
                    for _ in 0..agent_count {
                        out.write_all(&0i32.to_le_bytes())?;
                    }
                }
            }
        }

        Ok(Self {
            out,
            version,
            agent_count,
            frames_written: 0,
        })
    }

    /// Appends one frame.
    pub fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if frame.len() != self.agent_count {
            return Err(TrajectoryError::AgentCountMismatch {
                expected: self.agent_count,
                found: frame.len(),
            });
        }

        for agent in frame.agents() {
            let heading = agent.vel.filter(|v| v.norm() > 0.0);
            self.out.write_all(&agent.pos.x.to_le_bytes())?;
            self.out.write_all(&agent.pos.y.to_le_bytes())?;
            match self.version {
                ScbVersion::V1_0 | ScbVersion::V2_0 | ScbVersion::V2_1 => {
                    let angle = heading.map_or(0.0, |v| v.y.atan2(v.x));
                    self.out.write_all(&angle.to_le_bytes())?;
                    if self.version == ScbVersion::V2_1 {
                        self.out.write_all(&(agent.state as f32).to_le_bytes())?;
                    }
                }
                ScbVersion::V3_0 => {
                    let dir = heading.map_or(Vector2::new(1.0, 0.0), |v| v.normalize());
                    self.out.write_all(&dir.x.to_le_bytes())?;
                    self.out.write_all(&dir.y.to_le_bytes())?;
                }
            }
        }
        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> usize {
        self.frames_written
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    fn sample_frames(count: usize, agents: usize) -> Vec<Frame> {
        (0..count)
            .map(|f| {
                let agents = (0..agents)
                    .map(|a| Agent::with_state(Vector2::new(f as f32, a as f32 * 0.5), (a % 3) as i32))
                    .collect();
                Frame::from_agents(agents)
            })
            .collect()
    }

    fn encode(version: ScbVersion, frames: &[Frame]) -> Vec<u8> {
        let agents = frames[0].len();
        let ids: Vec<i32> = (0..agents as i32).map(|i| i % 2).collect();
        let mut writer = ScbWriter::new(Vec::new(), version, agents, 0.05, Some(&ids)).unwrap();
        for frame in frames {
            writer.write_frame(frame).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(ScbVersion::V1_0.header_bytes(10), 8);
        assert_eq!(ScbVersion::V2_0.header_bytes(10), 52);
        assert_eq!(ScbVersion::V2_1.agent_bytes(), 16);
    }

    #[test]
    fn test_read_version_2_1_with_state() {
        let bytes = encode(ScbVersion::V2_1, &sample_frames(3, 4));
        let mut reader = ScbReader::new(Cursor::new(bytes), SourceConfig::default()).unwrap();

        assert!(reader.has_state_data());
        assert_relative_eq!(reader.sim_step(), 0.05);
        assert_eq!(reader.agent_count(), 4);
        assert_eq!(reader.total_frames().unwrap(), 3);

        let (index, frame) = reader.next_frame().unwrap().unwrap();
        assert_eq!(index, 0);
        assert_eq!(frame.agents()[2].state, 2);
        assert_relative_eq!(frame.position(3).y, 1.5);
    }

    #[test]
    fn test_read_version_1_0_defaults() {
        let bytes = encode(ScbVersion::V1_0, &sample_frames(2, 2));
        let mut reader = ScbReader::new(Cursor::new(bytes), SourceConfig::default()).unwrap();
        assert_relative_eq!(reader.sim_step(), DEFAULT_SIM_STEP);
        assert_eq!(reader.class_ids(), &[0, 0]);

        let (_, second) = {
            reader.next_frame().unwrap();
            reader.next_frame().unwrap().unwrap()
        };
        assert_relative_eq!(second.position(0).x, 1.0);
        assert!(reader.next_frame().unwrap().is_none());
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_stride_start_and_agent_cap() {
        let bytes = encode(ScbVersion::V2_0, &sample_frames(7, 3));
        let config = SourceConfig::default()
            .with_start(1)
            .with_step(3)
            .with_max_agents(2);
        let mut reader = ScbReader::new(Cursor::new(bytes), config).unwrap();
        assert_eq!(reader.total_frames().unwrap(), 2);

        let (i0, f0) = reader.next_frame().unwrap().unwrap();
        let (i1, f1) = reader.next_frame().unwrap().unwrap();
        assert_eq!((i0, i1), (0, 1));
        assert_eq!(f0.len(), 2);
        assert_relative_eq!(f0.position(0).x, 1.0);
        assert_relative_eq!(f1.position(0).x, 4.0);
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_set_next_seeks_absolute() {
        let bytes = encode(ScbVersion::V3_0, &sample_frames(5, 2));
        let mut reader = ScbReader::new(Cursor::new(bytes), SourceConfig::default()).unwrap();
        reader.set_next(3).unwrap();
        let (index, frame) = reader.next_frame().unwrap().unwrap();
        assert_eq!(index, 3);
        assert_relative_eq!(frame.position(1).x, 3.0);

        reader.set_next(0).unwrap();
        let (_, frame) = reader.next_frame().unwrap().unwrap();
        assert_relative_eq!(frame.position(1).x, 0.0);
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let mut bytes = encode(ScbVersion::V2_0, &sample_frames(2, 3));
        bytes.truncate(bytes.len() - 5);
        let mut reader = ScbReader::new(Cursor::new(bytes), SourceConfig::default()).unwrap();
        reader.next_frame().unwrap().unwrap();
        assert!(matches!(
            reader.next_frame(),
            Err(TrajectoryError::TruncatedFrame { frame: 1, .. })
        ));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let bytes = b"9.9\0\x01\x00\x00\x00".to_vec();
        let result = ScbReader::new(Cursor::new(bytes), SourceConfig::default());
        assert!(matches!(result, Err(TrajectoryError::UnsupportedVersion(v)) if v == "9.9"));
    }

    #[test]
    fn test_zero_agent_header_rejected() {
        let mut bytes = ScbVersion::V2_0.tag().to_vec();
        bytes.extend_from_slice(&0i32.to_le_bytes());
        bytes.extend_from_slice(&0.1f32.to_le_bytes());
        let result = ScbReader::new(Cursor::new(bytes), SourceConfig::default());
        assert!(matches!(result, Err(TrajectoryError::MalformedHeader(_))));

        let mut bytes = ScbVersion::V1_0.tag().to_vec();
        bytes.extend_from_slice(&(-3i32).to_le_bytes());
        let result = ScbReader::new(Cursor::new(bytes), SourceConfig::default());
        assert!(matches!(result, Err(TrajectoryError::MalformedHeader(_))));

        let writer = ScbWriter::new(Vec::new(), ScbVersion::V2_0, 0, 0.1, None);
        assert!(matches!(writer, Err(TrajectoryError::InvalidConfig(_))));
    }

    #[test]
    fn test_classes_grouping() {
        let bytes = encode(ScbVersion::V2_0, &sample_frames(1, 4));
        let reader = ScbReader::new(Cursor::new(bytes), SourceConfig::default()).unwrap();
        let classes = reader.classes();
        assert_eq!(classes[&0], vec![0, 2]);
        assert_eq!(classes[&1], vec![1, 3]);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crowd.scb");
        let frames = sample_frames(4, 3);

        let mut writer = ScbWriter::create(&path, ScbVersion::V2_1, 3, 0.1, None).unwrap();
        for frame in &frames {
            writer.write_frame(frame).unwrap();
        }
        assert_eq!(writer.frames_written(), 4);
        writer.finish().unwrap();

        let mut reader = ScbReader::open(&path).unwrap();
        let mut read = Vec::new();
        while let Some((_, frame)) = reader.next_frame().unwrap() {
            read.push(frame);
        }
        assert_eq!(read, frames);
    }
}
