//! Agent and frame types shared by every trajectory source.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// A single pedestrian sample at one time step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// World position in meters
    pub pos: Vector2<f32>,

    /// Velocity, when a source or caller has derived it
    pub vel: Option<Vector2<f32>>,

    /// Per-agent scalar payload which can be rasterized
    pub value: f32,

    /// Discrete state tag (SCB 2.1 carries one per agent)
    pub state: i32,
}

impl Agent {
    /// Creates an agent at the given position with no payload.
    pub fn new(pos: Vector2<f32>) -> Self {
        Self {
            pos,
            vel: None,
            value: 0.0,
            state: 0,
        }
    }

    /// Creates an agent with an explicit state tag.
    pub fn with_state(pos: Vector2<f32>, state: i32) -> Self {
        Self {
            state,
            ..Self::new(pos)
        }
    }
}

/// All agents for one time step.
///
/// The agent count is fixed at construction; agent `i` in one frame is the
/// same pedestrian as agent `i` in every other frame of the same source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    agents: Vec<Agent>,
}

impl Frame {
    /// Creates a frame of `agent_count` agents at the origin.
    pub fn new(agent_count: usize) -> Self {
        Self {
            agents: vec![Agent::new(Vector2::zeros()); agent_count],
        }
    }

    /// Creates a frame from an existing agent list.
    pub fn from_agents(agents: Vec<Agent>) -> Self {
        Self { agents }
    }

    /// Creates a frame from bare positions.
    pub fn from_positions(positions: &[[f32; 2]]) -> Self {
        Self {
            agents: positions
                .iter()
                .map(|p| Agent::new(Vector2::new(p[0], p[1])))
                .collect(),
        }
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agents_mut(&mut self) -> &mut [Agent] {
        &mut self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn position(&self, i: usize) -> Vector2<f32> {
        self.agents[i].pos
    }

    pub fn set_position(&mut self, i: usize, pos: Vector2<f32>) {
        self.agents[i].pos = pos;
    }

    /// Fills in each agent's velocity from a previous frame.
    pub fn compute_velocity(&mut self, prev: &Frame, dt: f32) {
        for (agent, before) in self.agents.iter_mut().zip(prev.agents.iter()) {
            agent.vel = Some((agent.pos - before.pos) / dt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_frame_agent_count_fixed() {
        let frame = Frame::new(4);
        assert_eq!(frame.len(), 4);
        assert!(frame.agents().iter().all(|a| a.pos == Vector2::zeros()));
    }

    #[test]
    fn test_compute_velocity() {
        let prev = Frame::from_positions(&[[0.0, 0.0], [1.0, 1.0]]);
        let mut next = Frame::from_positions(&[[1.0, 0.0], [1.0, 3.0]]);
        next.compute_velocity(&prev, 0.5);

        let v0 = next.agents()[0].vel.unwrap();
        let v1 = next.agents()[1].vel.unwrap();
        assert_relative_eq!(v0.x, 2.0);
        assert_relative_eq!(v1.y, 4.0);
    }
}
