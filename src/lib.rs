//! Track Sim - path-following race track simulation
//!
//! Core modules:
//! - `sim`: Frame-driven simulation (path geometry, cars, laps, pacing, gating)
//! - `settings`: Engine options parsed from the host
//! - `error`: Configuration errors
//! - `web`: Browser binding over an SVG track (wasm32 only)

pub mod error;
pub mod settings;
pub mod sim;

#[cfg(target_arch = "wasm32")]
pub mod web;

pub use error::SimError;
pub use settings::SimOptions;
pub use sim::RaceEngine;

/// Engine configuration constants
pub mod consts {
    /// Default base speed along the primary path (px/s)
    pub const DEFAULT_SPEED: f64 = 140.0;

    /// Lap detector hysteresis radii around the start coordinate (display px)
    pub const LAP_INNER_RADIUS: f64 = 0.5;
    pub const LAP_OUTER_RADIUS: f64 = 1.0;
    /// Minimum time between two lap-completed events
    pub const LAP_THROTTLE_MS: f64 = 500.0;
    /// Wrap signals are ignored this long after play / play_for_laps
    pub const WRAP_GUARD_MS: f64 = 500.0;

    /// Speed notifications are throttled to ~6 Hz unless forced
    pub const SPEED_NOTIFY_INTERVAL_MS: f64 = 1000.0 / 6.0;

    /// The speed floor arms once effective speed comes within this margin of it
    pub const FLOOR_ARM_MARGIN: f64 = 0.5;
    pub const DEFAULT_MIN_SPEED_FLOOR: f64 = 40.0;

    /// Arc-length step used to derive headings
    pub const HEADING_DELTA: f64 = 0.1;
    /// Coarser step when only one lane exists
    pub const HEADING_DELTA_SINGLE_LANE: f64 = 0.5;
    /// Weight of the new heading sample per frame (1.0 = no smoothing)
    pub const DEFAULT_ANGLE_SMOOTHING: f64 = 0.35;

    /// Car sprite fallback size
    pub const DEFAULT_CAR_WIDTH: f64 = 48.0;
    pub const DEFAULT_CAR_HEIGHT: f64 = 28.0;

    /// Per-lap AI speed boost range (px/s)
    pub const DEFAULT_AI_LAP_BOOST_MIN: f64 = 4.0;
    pub const DEFAULT_AI_LAP_BOOST_MAX: f64 = 12.0;

    /// Grid offset hints beyond this put a car in lane 2
    pub const LANE_HINT_THRESHOLD: f64 = 1.0;

    /// Delay before the start coordinate is re-sampled after play
    pub const START_SAMPLE_DELAY_MS: f64 = 50.0;

    /// Phase differences below this do not change rank
    pub const RANK_TOLERANCE: f64 = 1e-6;

    /// Seed used when the host does not supply one
    pub const DEFAULT_SEED: u64 = 0x7261_6365;
}

/// Wrap a distance into [0, m)
#[inline]
pub fn wrap_distance(v: f64, m: f64) -> f64 {
    if m <= 0.0 || !m.is_finite() {
        return 0.0;
    }
    let w = ((v % m) + m) % m;
    // (-tiny % m) + m can round up to exactly m
    if w >= m { 0.0 } else { w }
}

/// Normalize an angle in degrees to [-180, 180)
#[inline]
pub fn normalize_degrees(angle: f64) -> f64 {
    let a = wrap_distance(angle + 180.0, 360.0) - 180.0;
    if a >= 180.0 { a - 360.0 } else { a }
}

/// Exponentially smooth a heading toward `target` along the shortest arc.
///
/// `alpha` is the weight of the new sample; `None` snaps to the target.
pub fn smooth_heading(previous: Option<f64>, target: f64, alpha: f64) -> f64 {
    match previous {
        None => normalize_degrees(target),
        Some(prev) => {
            let delta = normalize_degrees(target - prev);
            normalize_degrees(prev + delta * alpha.clamp(0.0, 1.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_distance() {
        assert_eq!(wrap_distance(0.0, 1000.0), 0.0);
        assert_eq!(wrap_distance(-1000.0, 1000.0), 0.0);
        assert_eq!(wrap_distance(-12.5, 1000.0), 987.5);
        assert_eq!(wrap_distance(2500.0, 1000.0), 500.0);
        assert_eq!(wrap_distance(-1e-17, 1000.0), 0.0);
        assert_eq!(wrap_distance(5.0, 0.0), 0.0);
    }

    #[test]
    fn test_normalize_degrees() {
        assert_eq!(normalize_degrees(0.0), 0.0);
        assert_eq!(normalize_degrees(180.0), -180.0);
        assert_eq!(normalize_degrees(-180.0), -180.0);
        assert_eq!(normalize_degrees(190.0), -170.0);
        assert_eq!(normalize_degrees(-190.0), 170.0);
        assert_eq!(normalize_degrees(720.0), 0.0);
    }

    #[test]
    fn test_smooth_heading_takes_short_arc() {
        // 170 -> -170 is a 20 degree turn through 180, not 340 the other way
        let h = smooth_heading(Some(170.0), -170.0, 0.5);
        assert!((h - -180.0).abs() < 1e-9);

        let h = smooth_heading(Some(-170.0), 170.0, 0.5);
        assert!((h - -180.0).abs() < 1e-9);
    }

    #[test]
    fn test_smooth_heading_snaps_without_history() {
        assert_eq!(smooth_heading(None, 45.0, 0.1), 45.0);
        assert_eq!(smooth_heading(Some(10.0), 45.0, 1.0), 45.0);
        assert_eq!(smooth_heading(Some(10.0), 45.0, 0.0), 10.0);
    }
}
