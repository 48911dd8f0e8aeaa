//! The frame source interface consumed by the rasterizers.

use crate::error::{Result, TrajectoryError};
use crate::types::Frame;

/// Which frames and agents a source hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// First frame (in file order) that maps to index 0
    pub start_frame: usize,

    /// Cap on the number of frames returned (None = all)
    pub max_frames: Option<usize>,

    /// Cap on agents per frame (None = all)
    pub max_agents: Option<usize>,

    /// Stride between returned frames (1 = every frame)
    pub frame_step: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            start_frame: 0,
            max_frames: None,
            max_agents: None,
            frame_step: 1,
        }
    }
}

impl SourceConfig {
    pub fn with_start(mut self, start_frame: usize) -> Self {
        self.start_frame = start_frame;
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    pub fn with_max_agents(mut self, max_agents: usize) -> Self {
        self.max_agents = Some(max_agents);
        self
    }

    pub fn with_step(mut self, frame_step: usize) -> Self {
        self.frame_step = frame_step;
        self
    }

    /// Rejects configurations no source can honor.
    pub fn validate(&self) -> Result<()> {
        if self.frame_step == 0 {
            return Err(TrajectoryError::invalid_config("frame step must be at least 1"));
        }
        if self.max_agents == Some(0) {
            return Err(TrajectoryError::invalid_config("max agents must be at least 1"));
        }
        Ok(())
    }

    /// True once `index` frames have been handed out and the cap is reached.
    pub fn exhausted(&self, index: usize) -> bool {
        self.max_frames.map_or(false, |max| index >= max)
    }
}

/// A sequential, seekable supply of frames.
///
/// Indices are relative to the configured start frame and stride: index 0 is
/// the first frame returned after `set_next(0)`, index 1 the next one, and so
/// on. Once exhausted, `next_frame` keeps returning `Ok(None)`.
///
/// Sources are not internally synchronized. Share one between threads by
/// wrapping it in a `Mutex`; `next_frame` is then the whole critical section.
pub trait FrameSource: Send {
    /// Returns the next frame and its index, or `None` at the end.
    fn next_frame(&mut self) -> Result<Option<(usize, Frame)>>;

    /// Positions the source so the next call returns frame `index`.
    fn set_next(&mut self, index: usize) -> Result<()>;

    /// Number of agents in every returned frame.
    fn agent_count(&self) -> usize;
}

/// A frame source over frames already in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    frames: Vec<Frame>,
    config: SourceConfig,
    next_index: usize,
}

impl MemorySource {
    /// Creates a source that returns every frame once, in order.
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            config: SourceConfig::default(),
            next_index: 0,
        }
    }

    /// Creates a source with an explicit configuration.
    pub fn with_config(frames: Vec<Frame>, config: SourceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            frames,
            config,
            next_index: 0,
        })
    }

    /// Total frames this source will return from index 0.
    pub fn total_frames(&self) -> usize {
        let available = self
            .frames
            .len()
            .saturating_sub(self.config.start_frame)
            .div_ceil(self.config.frame_step);
        self.config
            .max_frames
            .map_or(available, |max| available.min(max))
    }
}

impl FrameSource for MemorySource {
    fn next_frame(&mut self) -> Result<Option<(usize, Frame)>> {
        let index = self.next_index;
        if self.config.exhausted(index) {
            return Ok(None);
        }
        let raw = self.config.start_frame + index * self.config.frame_step;
        let Some(frame) = self.frames.get(raw) else {
            return Ok(None);
        };

        let frame = match self.config.max_agents {
            Some(max) if max < frame.len() => Frame::from_agents(frame.agents()[..max].to_vec()),
            _ => frame.clone(),
        };
        self.next_index += 1;
        Ok(Some((index, frame)))
    }

    fn set_next(&mut self, index: usize) -> Result<()> {
        self.next_index = index;
        Ok(())
    }

    fn agent_count(&self) -> usize {
        let total = self.frames.first().map_or(0, Frame::len);
        self.config.max_agents.map_or(total, |max| total.min(max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(n: usize) -> Vec<Frame> {
        (0..n)
            .map(|i| Frame::from_positions(&[[i as f32, 0.0], [0.0, i as f32]]))
            .collect()
    }

    #[test]
    fn test_memory_source_sequential() {
        let mut source = MemorySource::new(frames(3));
        for expected in 0..3 {
            let (index, frame) = source.next_frame().unwrap().unwrap();
            assert_eq!(index, expected);
            assert_eq!(frame.position(0).x, expected as f32);
        }
        assert!(source.next_frame().unwrap().is_none());
        // Repeated calls after exhaustion stay at None
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_memory_source_stride_and_start() {
        let config = SourceConfig::default().with_start(1).with_step(2);
        let mut source = MemorySource::with_config(frames(6), config).unwrap();
        assert_eq!(source.total_frames(), 3);

        let xs: Vec<f32> = std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|(_, f)| f.position(0).x)
            .collect();
        assert_eq!(xs, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_memory_source_caps() {
        let config = SourceConfig::default().with_max_frames(2).with_max_agents(1);
        let mut source = MemorySource::with_config(frames(5), config).unwrap();
        assert_eq!(source.agent_count(), 1);

        let (_, frame) = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 1);
        source.next_frame().unwrap().unwrap();
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_memory_source_set_next() {
        let mut source = MemorySource::new(frames(4));
        source.set_next(2).unwrap();
        let (index, frame) = source.next_frame().unwrap().unwrap();
        assert_eq!(index, 2);
        assert_eq!(frame.position(0).x, 2.0);
    }

    #[test]
    fn test_zero_step_rejected() {
        let config = SourceConfig::default().with_step(0);
        assert!(MemorySource::with_config(frames(2), config).is_err());
    }
}
