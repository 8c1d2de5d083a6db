//! Engine options
//!
//! Supplied once by the host at init, usually as a JSON object from the page.
//! Every field has a default so partial objects are fine.

use serde::{Deserialize, Serialize};

use crate::consts::*;
use crate::error::SimError;

/// Options consumed at engine construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimOptions {
    /// Base speed along the primary path (px/s)
    pub speed: f64,
    /// Sprite rotation offset added to every heading (degrees)
    pub start_rotation: f64,
    /// Weight of the new heading sample per frame, in (0, 1]
    pub angle_smoothing: f64,
    /// Where the user starts along the path, as a fraction of its length
    pub start_offset_fraction: f64,
    /// Screen-space Y shift for lane 2, applied after the transform
    #[serde(rename = "lane2YOffset")]
    pub lane2_y_offset: f64,

    // === Pacing ===
    /// Clamp effective speed to `min_speed_floor` once it has been reached
    pub min_speed_floor_enabled: bool,
    pub min_speed_floor: f64,
    /// Range for each AI car's per-lap speed boost (px/s)
    pub ai_lap_boost_min: f64,
    pub ai_lap_boost_max: f64,

    // === Gating ===
    /// Halt the user at each lap until the answered count catches up
    pub gate_by_answered_count: bool,

    // === Lap detection ===
    pub lap_inner_radius: f64,
    pub lap_outer_radius: f64,

    /// Seed for AI boost draws
    pub seed: Option<u64>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            speed: DEFAULT_SPEED,
            start_rotation: 0.0,
            angle_smoothing: DEFAULT_ANGLE_SMOOTHING,
            start_offset_fraction: 0.0,
            lane2_y_offset: 0.0,

            min_speed_floor_enabled: false,
            min_speed_floor: DEFAULT_MIN_SPEED_FLOOR,
            ai_lap_boost_min: DEFAULT_AI_LAP_BOOST_MIN,
            ai_lap_boost_max: DEFAULT_AI_LAP_BOOST_MAX,

            gate_by_answered_count: false,

            lap_inner_radius: LAP_INNER_RADIUS,
            lap_outer_radius: LAP_OUTER_RADIUS,

            seed: None,
        }
    }
}

impl SimOptions {
    /// Parse options from a JSON object; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self, SimError> {
        let options: SimOptions = serde_json::from_str(json)?;
        Ok(options.sanitized())
    }

    /// Replace unusable values with defaults and normalize ranges
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        fn finite_or(v: f64, fallback: f64) -> f64 {
            if v.is_finite() { v } else { fallback }
        }

        self.speed = finite_or(self.speed, defaults.speed).max(0.0);
        self.start_rotation = finite_or(self.start_rotation, 0.0);
        self.angle_smoothing = finite_or(self.angle_smoothing, defaults.angle_smoothing);
        if self.angle_smoothing <= 0.0 || self.angle_smoothing > 1.0 {
            self.angle_smoothing = defaults.angle_smoothing;
        }
        self.start_offset_fraction =
            crate::wrap_distance(finite_or(self.start_offset_fraction, 0.0), 1.0);
        self.lane2_y_offset = finite_or(self.lane2_y_offset, 0.0);

        self.min_speed_floor = finite_or(self.min_speed_floor, defaults.min_speed_floor).max(0.0);
        self.ai_lap_boost_min = finite_or(self.ai_lap_boost_min, defaults.ai_lap_boost_min);
        self.ai_lap_boost_max = finite_or(self.ai_lap_boost_max, defaults.ai_lap_boost_max);
        if self.ai_lap_boost_min > self.ai_lap_boost_max {
            std::mem::swap(&mut self.ai_lap_boost_min, &mut self.ai_lap_boost_max);
        }

        self.lap_inner_radius = finite_or(self.lap_inner_radius, defaults.lap_inner_radius);
        self.lap_outer_radius = finite_or(self.lap_outer_radius, defaults.lap_outer_radius);
        if self.lap_inner_radius <= 0.0 || self.lap_outer_radius <= self.lap_inner_radius {
            log::warn!(
                "Lap radii {}/{} invalid, using defaults",
                self.lap_inner_radius,
                self.lap_outer_radius
            );
            self.lap_inner_radius = defaults.lap_inner_radius;
            self.lap_outer_radius = defaults.lap_outer_radius;
        }

        self
    }

    /// Effective seed for AI boost draws
    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(DEFAULT_SEED)
    }
}
