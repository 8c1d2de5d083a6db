//! Car poses and the output seam
//!
//! The engine computes one `CarPose` per car every frame and hands them to a
//! `RenderSink`. The browser binding writes them onto SVG nodes; headless
//! hosts can ignore them or read `RaceEngine::poses`.

use glam::DVec2;
use serde::Serialize;

use super::agent::{AgentId, CarSize};
use super::path::Lane;

/// Where a car should be drawn this frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CarPose {
    pub agent_id: AgentId,
    pub lane: Lane,
    /// Display-space center of the sprite
    pub center: DVec2,
    /// Display-space top-left corner (center minus half the size)
    pub top_left: DVec2,
    pub size: CarSize,
    /// Smoothed heading plus the rotation offset, in [-180, 180)
    pub heading_deg: f64,
}

impl CarPose {
    pub fn new(agent_id: AgentId, lane: Lane, center: DVec2, size: CarSize, heading_deg: f64) -> Self {
        Self {
            agent_id,
            lane,
            center,
            top_left: center - DVec2::new(size.width, size.height) * 0.5,
            size,
            heading_deg,
        }
    }

    /// SVG `transform` attribute rotating the sprite about its center
    pub fn svg_transform(&self) -> String {
        format!(
            "rotate({:.3} {:.3} {:.3})",
            self.heading_deg, self.center.x, self.center.y
        )
    }
}

/// Receives poses after each frame
pub trait RenderSink {
    fn place_car(&mut self, pose: &CarPose) -> anyhow::Result<()>;

    /// Start coordinate moved (construction, transform change, re-sample)
    fn place_start_marker(&mut self, _at: DVec2) -> anyhow::Result<()> {
        Ok(())
    }
}
