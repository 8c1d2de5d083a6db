//! Closed-curve geometry for the race track
//!
//! A track is one or two closed curves sharing a display transform. All car
//! positions are expressed as a distance along the primary curve; a car on
//! lane 2 is remapped proportionally so both lanes stay phase-aligned even
//! when their lengths differ.

use glam::DVec2;
use serde::{Deserialize, Serialize};

use crate::consts::{HEADING_DELTA, HEADING_DELTA_SINGLE_LANE};
use crate::error::SimError;
use crate::wrap_distance;

/// A closed curve that can be sampled by arc length
pub trait ClosedCurve {
    /// Total arc length (curve-local px)
    fn total_length(&self) -> f64;

    /// Point at `distance` along the curve; `distance` is already in [0, total)
    fn point_at_length(&self, distance: f64) -> DVec2;
}

/// Which of the (up to two) parallel curves a car follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Lane {
    #[default]
    Primary,
    Secondary,
}

impl Lane {
    /// 1-based lane number as the host numbers them
    pub fn index(self) -> u8 {
        match self {
            Lane::Primary => 1,
            Lane::Secondary => 2,
        }
    }
}

/// Curve-local to display mapping: uniform scale, then translate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translate: DVec2,
    pub scale: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translate: DVec2::ZERO,
            scale: 1.0,
        }
    }
}

impl Transform {
    pub fn new(translate_x: f64, translate_y: f64, scale: f64) -> Self {
        Self {
            translate: DVec2::new(translate_x, translate_y),
            scale,
        }
    }

    #[inline]
    pub fn apply(&self, p: DVec2) -> DVec2 {
        p * self.scale + self.translate
    }

    pub fn is_valid(&self) -> bool {
        self.translate.is_finite() && self.scale.is_finite() && self.scale > 0.0
    }
}

/// Closed polyline with cumulative arc lengths
///
/// The last vertex connects back to the first.
#[derive(Debug, Clone)]
pub struct Polyline {
    points: Vec<DVec2>,
    /// cumulative[i] = arc length from points[0] to points[i]
    cumulative: Vec<f64>,
    total: f64,
}

impl Polyline {
    pub fn new(points: Vec<DVec2>) -> Result<Self, SimError> {
        if points.len() < 2 || points.iter().any(|p| !p.is_finite()) {
            return Err(SimError::DegeneratePath {
                name: "polyline".into(),
                length: 0.0,
            });
        }

        let mut cumulative = Vec::with_capacity(points.len());
        let mut acc = 0.0;
        cumulative.push(0.0);
        for pair in points.windows(2) {
            acc += pair[0].distance(pair[1]);
            cumulative.push(acc);
        }
        acc += points[points.len() - 1].distance(points[0]);

        if acc <= 0.0 {
            return Err(SimError::DegeneratePath {
                name: "polyline".into(),
                length: acc,
            });
        }

        Ok(Self {
            points,
            cumulative,
            total: acc,
        })
    }

    /// Ellipse approximated by `segments` vertices, traced counter-clockwise
    /// from angle 0
    pub fn ellipse(center: DVec2, rx: f64, ry: f64, segments: usize) -> Result<Self, SimError> {
        let n = segments.max(3);
        let points = (0..n)
            .map(|i| {
                let t = i as f64 / n as f64 * std::f64::consts::TAU;
                center + DVec2::new(rx * t.cos(), ry * t.sin())
            })
            .collect();
        Self::new(points)
    }

    /// Axis-aligned rectangle traced from its top-left corner
    pub fn rectangle(origin: DVec2, width: f64, height: f64) -> Result<Self, SimError> {
        Self::new(vec![
            origin,
            origin + DVec2::new(width, 0.0),
            origin + DVec2::new(width, height),
            origin + DVec2::new(0.0, height),
        ])
    }

    /// Parallel curve shifted `distance` along each vertex normal
    ///
    /// Positive distances move to the left of the direction of tracing.
    pub fn offset(&self, distance: f64) -> Result<Self, SimError> {
        let n = self.points.len();
        let points = (0..n)
            .map(|i| {
                let prev = self.points[(i + n - 1) % n];
                let next = self.points[(i + 1) % n];
                let tangent = (next - prev).normalize_or_zero();
                self.points[i] + tangent.perp() * distance
            })
            .collect();
        Self::new(points)
    }

    pub fn points(&self) -> &[DVec2] {
        &self.points
    }
}

impl ClosedCurve for Polyline {
    fn total_length(&self) -> f64 {
        self.total
    }

    fn point_at_length(&self, distance: f64) -> DVec2 {
        let d = wrap_distance(distance, self.total);
        // Index of the segment whose start is the last cumulative <= d
        let i = match self
            .cumulative
            .binary_search_by(|c| c.partial_cmp(&d).unwrap_or(std::cmp::Ordering::Less))
        {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let start = self.points[i];
        let end = self.points[(i + 1) % self.points.len()];
        let seg_start = self.cumulative[i];
        let seg_end = if i + 1 < self.cumulative.len() {
            self.cumulative[i + 1]
        } else {
            self.total
        };
        let seg_len = seg_end - seg_start;
        if seg_len <= 0.0 {
            return start;
        }
        start.lerp(end, (d - seg_start) / seg_len)
    }
}

/// One or two lanes plus the shared display transform
pub struct TrackGeometry {
    primary: Box<dyn ClosedCurve>,
    secondary: Option<Box<dyn ClosedCurve>>,
    primary_total: f64,
    secondary_total: f64,
    transform: Transform,
    lane2_y_offset: f64,
    heading_delta: f64,
}

impl std::fmt::Debug for TrackGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackGeometry")
            .field("primary_total", &self.primary_total)
            .field("secondary_total", &self.secondary_total)
            .field("transform", &self.transform)
            .field("lane2_y_offset", &self.lane2_y_offset)
            .finish()
    }
}

fn checked_length(name: &str, curve: &dyn ClosedCurve) -> Result<f64, SimError> {
    let length = curve.total_length();
    if !length.is_finite() || length <= 0.0 {
        return Err(SimError::DegeneratePath {
            name: name.to_string(),
            length,
        });
    }
    Ok(length)
}

impl TrackGeometry {
    /// Single-lane track
    pub fn new(primary: Box<dyn ClosedCurve>) -> Result<Self, SimError> {
        let primary_total = checked_length("primary", primary.as_ref())?;
        Ok(Self {
            primary,
            secondary: None,
            primary_total,
            secondary_total: primary_total,
            transform: Transform::default(),
            lane2_y_offset: 0.0,
            heading_delta: HEADING_DELTA_SINGLE_LANE,
        })
    }

    /// Two-lane track
    pub fn with_lane2(
        primary: Box<dyn ClosedCurve>,
        secondary: Box<dyn ClosedCurve>,
    ) -> Result<Self, SimError> {
        let mut geometry = Self::new(primary)?;
        geometry.secondary_total = checked_length("lane2", secondary.as_ref())?;
        geometry.secondary = Some(secondary);
        geometry.heading_delta = HEADING_DELTA;
        Ok(geometry)
    }

    /// Primary path length; all positions live in this domain
    pub fn total_length(&self) -> f64 {
        self.primary_total
    }

    pub fn has_lane2(&self) -> bool {
        self.secondary.is_some()
    }

    /// Length of the curve a lane actually follows
    pub fn lane_length(&self, lane: Lane) -> f64 {
        match (lane, &self.secondary) {
            (Lane::Secondary, Some(_)) => self.secondary_total,
            _ => self.primary_total,
        }
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    pub fn set_lane2_y_offset(&mut self, offset: f64) {
        self.lane2_y_offset = offset;
    }

    pub fn heading_delta(&self) -> f64 {
        self.heading_delta
    }

    /// Map a primary-domain distance onto the lane's own domain
    pub fn lane_distance(&self, distance: f64, lane: Lane) -> f64 {
        let fraction = wrap_distance(distance, self.primary_total) / self.primary_total;
        let lane_total = self.lane_length(lane);
        wrap_distance(fraction * lane_total, lane_total)
    }

    /// Curve-local point to display space
    pub fn map_to_display(&self, point: DVec2, lane: Lane) -> DVec2 {
        let mapped = self.transform.apply(point);
        match (lane, &self.secondary) {
            (Lane::Secondary, Some(_)) => mapped + DVec2::new(0.0, self.lane2_y_offset),
            _ => mapped,
        }
    }

    /// Display position for a primary-domain distance
    pub fn sample_at(&self, distance: f64, lane: Lane) -> DVec2 {
        let d = self.lane_distance(distance, lane);
        let local = match (lane, &self.secondary) {
            (Lane::Secondary, Some(curve)) => curve.point_at_length(d),
            _ => self.primary.point_at_length(d),
        };
        self.map_to_display(local, lane)
    }

    /// Heading in degrees at `distance`, pointing in the direction of travel
    /// (decreasing distance)
    pub fn heading_at(&self, distance: f64, lane: Lane) -> f64 {
        let here = self.sample_at(distance, lane);
        // heading_delta is in lane px; convert back to the primary domain
        let step = self.heading_delta * self.primary_total / self.lane_length(lane);
        let ahead = self.sample_at(distance - step, lane);
        let delta = ahead - here;
        delta.y.atan2(delta.x).to_degrees()
    }

    /// Position and heading together
    pub fn pose_at(&self, distance: f64, lane: Lane) -> (DVec2, f64) {
        (self.sample_at(distance, lane), self.heading_at(distance, lane))
    }
}
