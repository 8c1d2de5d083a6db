//! Lap detection
//!
//! `LapDetector` turns the user's continuous display position into discrete
//! lap events using two radii around the start coordinate. Entering the inner
//! radius fires; leaving the outer radius re-arms. The proximity test uses the
//! segment travelled this frame, so a fast car cannot step over the radius.
//!
//! `BoundaryWrap` is the second signal used by lap targets: it watches the
//! position shifted so the start boundary sits at zero, and reports a wrap
//! whenever that shifted value jumps up (motion always decreases it). Pulling
//! away from a car parked exactly on the boundary is not a wrap.

use glam::DVec2;
use serde::Serialize;

use crate::consts::LAP_THROTTLE_MS;
use crate::wrap_distance;

/// Hysteresis zone relative to the start coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Zone {
    Outside,
    Inside,
}

/// Distance from `p` to the segment `a`-`b`
fn distance_to_segment(p: DVec2, a: DVec2, b: DVec2) -> f64 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq <= f64::EPSILON {
        return p.distance(a);
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    p.distance(a + ab * t)
}

#[derive(Debug, Clone, Serialize)]
pub struct LapDetector {
    inner_radius: f64,
    outer_radius: f64,
    zone: Zone,
    start: DVec2,
    previous: Option<DVec2>,
    last_fire_ms: Option<f64>,
    throttle_ms: f64,
}

impl LapDetector {
    pub fn new(inner_radius: f64, outer_radius: f64) -> Self {
        Self {
            inner_radius,
            outer_radius,
            zone: Zone::Inside,
            start: DVec2::ZERO,
            previous: None,
            last_fire_ms: None,
            throttle_ms: LAP_THROTTLE_MS,
        }
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn start(&self) -> DVec2 {
        self.start
    }

    /// Move the start coordinate and re-derive the zone from `position`
    /// without firing
    pub fn prime(&mut self, start: DVec2, position: DVec2) {
        self.start = start;
        self.previous = Some(position);
        self.zone = if position.distance(start) <= self.outer_radius {
            Zone::Inside
        } else {
            Zone::Outside
        };
        log::trace!("Lap detector primed {:?} at {:?}", self.zone, start);
    }

    /// Move the start coordinate, keeping the zone and the last position
    pub fn set_start(&mut self, start: DVec2) {
        self.start = start;
    }

    /// Forget the throttle history (new race)
    pub fn clear_history(&mut self) {
        self.last_fire_ms = None;
    }

    /// Feed the user's display position for this frame; returns true when a
    /// lap completes
    pub fn update(&mut self, position: DVec2, now_ms: f64) -> bool {
        let previous = self.previous.replace(position).unwrap_or(position);
        let mut fired = false;

        match self.zone {
            Zone::Outside => {
                let closest = distance_to_segment(self.start, previous, position);
                if closest <= self.inner_radius {
                    self.zone = Zone::Inside;
                    let throttled = self
                        .last_fire_ms
                        .is_some_and(|last| now_ms - last < self.throttle_ms);
                    if throttled {
                        log::trace!("Lap crossing ignored (throttled)");
                    } else {
                        self.last_fire_ms = Some(now_ms);
                        fired = true;
                    }
                }
            }
            Zone::Inside => {}
        }

        // A single long step can enter and leave in the same frame
        if self.zone == Zone::Inside && position.distance(self.start) > self.outer_radius {
            self.zone = Zone::Outside;
        }

        fired
    }
}

/// Watches the start-shifted position for wraps
#[derive(Debug, Clone, Default, Serialize)]
pub struct BoundaryWrap {
    previous_shifted: Option<f64>,
}

impl BoundaryWrap {
    /// Returns true when the shifted position increased since the last call
    /// from somewhere past the boundary
    pub fn update(&mut self, traveled: f64, boundary: f64, total: f64) -> bool {
        let shifted = wrap_distance(traveled - boundary, total);
        let tolerance = f64::EPSILON * total;
        let wrapped = self
            .previous_shifted
            .is_some_and(|prev| prev > tolerance && shifted > prev + tolerance);
        self.previous_shifted = Some(shifted);
        wrapped
    }

    pub fn clear(&mut self) {
        self.previous_shifted = None;
    }
}
