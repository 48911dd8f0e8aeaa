//! Synthetic crowd generator.
//!
//! Produces a seeded crowd circulating around a pivot, the motion the
//! progress and angular-speed fields are built to measure:
//! - Agents start on a ring at random angles and radii
//! - Each walks counter-clockwise at its own angular speed
//! - Radial jitter keeps the ring from looking mechanical
//! - A fraction of agents pause in place, tagged with [`PAUSED_STATE`]

use std::f32::consts::TAU;
use std::path::Path;

use crowdfield_env::{Agent, Frame, ScbVersion, ScbWriter};
use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// State tag of agents that are standing still.
pub const PAUSED_STATE: i32 = 1;

/// State tag of walking agents.
pub const WALKING_STATE: i32 = 0;

/// Parameters of a synthetic crowd.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthConfig {
    /// Master seed; the same seed always yields the same crowd
    pub seed: u64,

    /// Number of agents
    pub agents: usize,

    /// Number of frames
    pub frames: usize,

    /// Seconds per frame
    pub time_step: f32,

    /// Center of rotation
    pub pivot: Vector2<f32>,

    /// Inner and outer ring radius in meters
    pub ring: (f32, f32),

    /// Mean walking speed along the ring in m/s
    pub walk_speed: f32,

    /// Standard deviation of the walking speed in m/s
    pub walk_speed_std: f32,

    /// Standard deviation of per-frame radial jitter in meters
    pub radial_jitter: f32,

    /// Probability that an agent pauses on any given frame
    pub pause_probability: f64,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            agents: 200,
            frames: 300,
            time_step: 0.1,
            pivot: Vector2::zeros(),
            ring: (4.0, 12.0),
            walk_speed: 1.2,
            walk_speed_std: 0.25,
            radial_jitter: 0.02,
            pause_probability: 0.01,
        }
    }
}

impl SynthConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_agents(mut self, agents: usize) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_time_step(mut self, time_step: f32) -> Self {
        self.time_step = time_step;
        self
    }

    pub fn with_ring(mut self, inner: f32, outer: f32) -> Self {
        self.ring = (inner, outer);
        self
    }

    pub fn with_pause_probability(mut self, p: f64) -> Self {
        self.pause_probability = p;
        self
    }

    /// Lower-left corner and size of a domain that contains the whole ring.
    pub fn bounds(&self) -> (Vector2<f32>, Vector2<f32>) {
        let reach = self.ring.1 + 1.0;
        (
            self.pivot - Vector2::new(reach, reach),
            Vector2::new(2.0 * reach, 2.0 * reach),
        )
    }
}

#[derive(Debug, Clone)]
struct Walker {
    angle: f32,
    radius: f32,
    /// Radians per second
    omega: f32,
    paused_frames: usize,
}

/// Steps a circulating crowd frame by frame.
pub struct CrowdOracle {
    config: SynthConfig,
    rng: ChaCha8Rng,
    walkers: Vec<Walker>,
    frame_index: usize,
}

impl CrowdOracle {
    pub fn new(config: SynthConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let (inner, outer) = config.ring;
        let angles = Uniform::new(0.0f32, TAU);
        let speeds = Normal::new(config.walk_speed, config.walk_speed_std.max(0.0)).ok();

        let walkers = (0..config.agents)
            .map(|_| {
                let radius = if outer > inner { rng.gen_range(inner..outer) } else { inner };
                let speed = speeds
                    .as_ref()
                    .map_or(config.walk_speed, |d| d.sample(&mut rng))
                    .max(0.1);
                Walker {
                    angle: angles.sample(&mut rng),
                    radius,
                    omega: speed / radius.max(0.5),
                    paused_frames: 0,
                }
            })
            .collect();

        debug!("Seeded crowd of {} agents (seed {})", config.agents, config.seed);
        Self {
            config,
            rng,
            walkers,
            frame_index: 0,
        }
    }

    pub fn config(&self) -> &SynthConfig {
        &self.config
    }

    /// Index of the frame the next call to [`frame`](Self::frame) describes.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    /// The crowd at the current time.
    pub fn frame(&self) -> Frame {
        let agents = self
            .walkers
            .iter()
            .map(|w| {
                let pos = self.config.pivot + Vector2::new(w.angle.cos(), w.angle.sin()) * w.radius;
                let state = if w.paused_frames > 0 { PAUSED_STATE } else { WALKING_STATE };
                Agent::with_state(pos, state)
            })
            .collect();
        Frame::from_agents(agents)
    }

    /// Advances every agent by one time step.
    pub fn step(&mut self) {
        let dt = self.config.time_step;
        let (inner, outer) = self.config.ring;
        let jitter = Normal::new(0.0f32, self.config.radial_jitter.max(0.0)).ok();

        for walker in &mut self.walkers {
            if walker.paused_frames > 0 {
                walker.paused_frames -= 1;
                continue;
            }
            if self.rng.gen_bool(self.config.pause_probability.clamp(0.0, 1.0)) {
                walker.paused_frames = self.rng.gen_range(5..30);
                continue;
            }
            walker.angle = (walker.angle + walker.omega * dt) % TAU;
            if let Some(jitter) = &jitter {
                walker.radius = (walker.radius + jitter.sample(&mut self.rng)).clamp(inner, outer.max(inner));
            }
        }
        self.frame_index += 1;
    }

    /// All configured frames, starting from the current one.
    pub fn generate(&mut self) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(self.config.frames);
        for _ in 0..self.config.frames {
            frames.push(self.frame());
            self.step();
        }
        frames
    }

    /// Writes every configured frame to an SCB 2.1 file (states included).
    pub fn write_scb(&mut self, path: impl AsRef<Path>) -> crowdfield_env::Result<usize> {
        let path = path.as_ref();
        let mut writer = ScbWriter::create(
            path,
            ScbVersion::V2_1,
            self.config.agents,
            self.config.time_step,
            None,
        )?;
        let mut prev: Option<Frame> = None;
        for _ in 0..self.config.frames {
            let mut frame = self.frame();
            // Heading for the orientation field; the first frame has none
            if let Some(prev) = &prev {
                frame.compute_velocity(prev, self.config.time_step);
            }
            writer.write_frame(&frame)?;
            self.step();
            prev = Some(frame);
        }
        let written = writer.frames_written();
        writer.finish()?;
        info!("Wrote {} synthetic frames to {}", written, path.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crowdfield_env::{FrameSource, ScbReader};

    #[test]
    fn test_same_seed_same_crowd() {
        let config = SynthConfig::default().with_agents(20).with_frames(15);
        let a = CrowdOracle::new(config.clone()).generate();
        let b = CrowdOracle::new(config.clone()).generate();
        let c = CrowdOracle::new(config.with_seed(7)).generate();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_agents_stay_on_ring() {
        let config = SynthConfig::default().with_agents(50).with_frames(40).with_ring(3.0, 6.0);
        let frames = CrowdOracle::new(config.clone()).generate();
        assert_eq!(frames.len(), 40);
        for frame in &frames {
            assert_eq!(frame.len(), 50);
            for agent in frame.agents() {
                let r = (agent.pos - config.pivot).norm();
                assert!((3.0 - 1e-3..=6.0 + 1e-3).contains(&r), "radius {r}");
            }
        }
    }

    #[test]
    fn test_paused_agents_hold_still() {
        let config = SynthConfig::default().with_agents(30).with_frames(60).with_pause_probability(0.2);
        let frames = CrowdOracle::new(config).generate();
        let mut saw_pause = false;
        for pair in frames.windows(2) {
            for (before, after) in pair[0].agents().iter().zip(pair[1].agents()) {
                if before.state == PAUSED_STATE && after.state == PAUSED_STATE {
                    saw_pause = true;
                    assert_eq!(before.pos, after.pos);
                }
            }
        }
        assert!(saw_pause);
    }

    #[test]
    fn test_write_scb_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synthetic.scb");
        let config = SynthConfig::default().with_agents(8).with_frames(12);
        let written = CrowdOracle::new(config.clone()).write_scb(&path).unwrap();
        assert_eq!(written, 12);

        let mut reader = ScbReader::open(&path).unwrap();
        assert!(reader.has_state_data());
        assert_eq!(reader.agent_count(), 8);
        assert_eq!(reader.total_frames().unwrap(), 12);

        let expected = CrowdOracle::new(config).generate();
        for expected in &expected[..2] {
            let (_, frame) = reader.next_frame().unwrap().unwrap();
            let read: Vec<_> = frame.agents().iter().map(|a| (a.pos, a.state)).collect();
            let generated: Vec<_> = expected.agents().iter().map(|a| (a.pos, a.state)).collect();
            assert_eq!(read, generated);
        }

        // Orientation of agent 0 in frame 1 follows its step from frame 0
        let bytes = std::fs::read(&path).unwrap();
        let header = 4 + 4 + 4 + 8 * 4;
        let frame_bytes = 8 * 16;
        let orientation = |frame: usize| {
            let at = header + frame * frame_bytes + 8;
            f32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
        };
        assert_eq!(orientation(0), 0.0);
        let step = expected[1].position(0) - expected[0].position(0);
        if step.norm() > 0.0 {
            assert!((orientation(1) - step.y.atan2(step.x)).abs() < 1e-5);
        }
    }
}
