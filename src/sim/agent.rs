//! Car registry
//!
//! Cars are stored as an array of structs and addressed by `AgentId`, the
//! car's index. Identity is fixed at construction; only the mutable motion
//! fields change afterwards.

use rand::Rng;
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};

use super::path::Lane;
use crate::consts::*;
use crate::error::SimError;

/// Stable handle to a car (index into the registry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub usize);

/// Sprite size in display px
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CarSize {
    pub width: f64,
    pub height: f64,
}

impl Default for CarSize {
    fn default() -> Self {
        Self {
            width: DEFAULT_CAR_WIDTH,
            height: DEFAULT_CAR_HEIGHT,
        }
    }
}

/// Description of one car as read from the host's markup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CarSpec {
    pub label: String,
    pub color_tag: String,
    pub is_user: bool,
    /// Explicit lane attribute (1 or 2)
    pub lane: Option<u8>,
    /// Lateral grid offset hint; used when no explicit lane is given
    pub grid_offset_hint: Option<f64>,
    /// Static stagger along the path, fraction of total length
    pub offset_fraction: f64,
    pub size: Option<CarSize>,
    /// Initial speed for AI cars (px/s); defaults to the base speed
    pub speed: Option<f64>,
}

impl CarSpec {
    pub fn user(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            is_user: true,
            ..Default::default()
        }
    }

    pub fn ai(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color_tag = color.into();
        self
    }

    pub fn with_lane(mut self, lane: u8) -> Self {
        self.lane = Some(lane);
        self
    }

    pub fn with_offset(mut self, fraction: f64) -> Self {
        self.offset_fraction = fraction;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    /// Resolve the lane: explicit attribute first, then the grid hint
    fn resolve_lane(&self) -> Lane {
        match self.lane {
            Some(2) => Lane::Secondary,
            Some(_) => Lane::Primary,
            None => match self.grid_offset_hint {
                Some(hint) if hint.is_finite() && hint > LANE_HINT_THRESHOLD => Lane::Secondary,
                _ => Lane::Primary,
            },
        }
    }
}

/// A simulated car
#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: AgentId,
    pub label: String,
    pub color_tag: String,
    pub is_user: bool,
    pub lane: Lane,
    pub offset_fraction: f64,
    pub size: CarSize,
    /// Smoothed heading from the previous frame
    pub heading_smoothed: Option<f64>,
    /// Cumulative distance driven (px), never decreases
    pub absolute_traveled: f64,

    // === AI only ===
    /// Current speed (px/s)
    pub absolute_speed: f64,
    /// Speed restored on reset
    pub initial_speed: f64,
    /// Signed lead over the user (px), sum of (own - user speed) * dt
    pub relative_distance: f64,
    /// Added to `absolute_speed` on every user lap
    pub lap_boost: f64,
}

impl Agent {
    /// Integrate one frame of AI motion against the user's effective speed
    pub fn advance_ai(&mut self, user_speed: f64, dt: f64) {
        if self.is_user {
            return;
        }
        self.relative_distance += (self.absolute_speed - user_speed) * dt;
        if self.absolute_speed > 0.0 {
            self.absolute_traveled += self.absolute_speed * dt;
        }
    }

    /// Apply this car's per-lap boost
    pub fn apply_lap_boost(&mut self) {
        if !self.is_user {
            self.absolute_speed += self.lap_boost;
        }
    }

    pub fn reset_motion(&mut self) {
        self.absolute_traveled = 0.0;
        self.relative_distance = 0.0;
        self.heading_smoothed = None;
        self.absolute_speed = self.initial_speed;
    }
}

/// All cars, with the user car's handle cached
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
    user: AgentId,
}

impl AgentRegistry {
    /// Build the registry; exactly one spec must be the user car
    pub fn new(
        specs: Vec<CarSpec>,
        base_speed: f64,
        boost_range: (f64, f64),
        has_lane2: bool,
        rng: &mut Pcg32,
    ) -> Result<Self, SimError> {
        if specs.is_empty() {
            return Err(SimError::NoCars);
        }
        let user_count = specs.iter().filter(|s| s.is_user).count();
        match user_count {
            0 => return Err(SimError::MissingUserCar),
            1 => {}
            count => return Err(SimError::MultipleUserCars { count }),
        }

        let (boost_min, boost_max) = boost_range;
        let mut user = AgentId(0);
        let mut agents = Vec::with_capacity(specs.len());

        for (i, spec) in specs.into_iter().enumerate() {
            let id = AgentId(i);
            let mut lane = spec.resolve_lane();
            if lane == Lane::Secondary && !has_lane2 {
                log::warn!("Car '{}' wants lane 2 but the track has one lane", spec.label);
                lane = Lane::Primary;
            }

            let offset_fraction = if spec.offset_fraction.is_finite() {
                crate::wrap_distance(spec.offset_fraction, 1.0)
            } else {
                0.0
            };

            let (speed, lap_boost) = if spec.is_user {
                user = id;
                (0.0, 0.0)
            } else {
                let speed = spec
                    .speed
                    .filter(|s| s.is_finite())
                    .unwrap_or(base_speed)
                    .max(0.0);
                let boost = if boost_max > boost_min {
                    rng.random_range(boost_min..=boost_max)
                } else {
                    boost_min
                };
                (speed, boost)
            };

            log::debug!(
                "Car {} '{}' user={} lane={} offset={:.3} boost={:.2}",
                i,
                spec.label,
                spec.is_user,
                lane.index(),
                offset_fraction,
                lap_boost
            );

            agents.push(Agent {
                id,
                label: spec.label,
                color_tag: spec.color_tag,
                is_user: spec.is_user,
                lane,
                offset_fraction,
                size: spec.size.unwrap_or_default(),
                heading_smoothed: None,
                absolute_traveled: 0.0,
                absolute_speed: speed,
                initial_speed: speed,
                relative_distance: 0.0,
                lap_boost,
            });
        }

        Ok(Self { agents, user })
    }

    pub fn user_id(&self) -> AgentId {
        self.user
    }

    pub fn user(&self) -> &Agent {
        &self.agents[self.user.0]
    }

    pub fn user_mut(&mut self) -> &mut Agent {
        &mut self.agents[self.user.0]
    }

    pub fn get(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(id.0)
    }

    pub fn get_mut(&mut self, id: AgentId) -> Option<&mut Agent> {
        self.agents.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.agents.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Agent> {
        self.agents.iter_mut()
    }

    /// AI cars only
    pub fn ai_mut(&mut self) -> impl Iterator<Item = &mut Agent> {
        self.agents.iter_mut().filter(|a| !a.is_user)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> Pcg32 {
        Pcg32::seed_from_u64(7)
    }

    #[test]
    fn test_requires_exactly_one_user() {
        let none = vec![CarSpec::ai("a"), CarSpec::ai("b")];
        assert!(matches!(
            AgentRegistry::new(none, 100.0, (1.0, 2.0), false, &mut rng()),
            Err(SimError::MissingUserCar)
        ));

        let two = vec![CarSpec::user("a"), CarSpec::user("b")];
        assert!(matches!(
            AgentRegistry::new(two, 100.0, (1.0, 2.0), false, &mut rng()),
            Err(SimError::MultipleUserCars { count: 2 })
        ));

        assert!(matches!(
            AgentRegistry::new(Vec::new(), 100.0, (1.0, 2.0), false, &mut rng()),
            Err(SimError::NoCars)
        ));
    }

    #[test]
    fn test_boosts_drawn_in_range_and_deterministic() {
        let specs = || vec![CarSpec::user("me"), CarSpec::ai("a"), CarSpec::ai("b")];
        let r1 = AgentRegistry::new(specs(), 100.0, (4.0, 12.0), false, &mut rng()).unwrap();
        let r2 = AgentRegistry::new(specs(), 100.0, (4.0, 12.0), false, &mut rng()).unwrap();

        for (a, b) in r1.iter().zip(r2.iter()) {
            assert_eq!(a.lap_boost, b.lap_boost);
            if a.is_user {
                assert_eq!(a.lap_boost, 0.0);
            } else {
                assert!((4.0..=12.0).contains(&a.lap_boost));
                assert_eq!(a.absolute_speed, 100.0);
            }
        }
        assert_eq!(r1.user_id(), AgentId(0));
    }

    #[test]
    fn test_lane_resolution() {
        let specs = vec![
            CarSpec::user("me"),
            CarSpec::ai("explicit").with_lane(2),
            CarSpec {
                grid_offset_hint: Some(12.0),
                ..CarSpec::ai("hinted")
            },
            CarSpec {
                grid_offset_hint: Some(0.5),
                ..CarSpec::ai("small hint")
            },
            CarSpec {
                lane: Some(1),
                grid_offset_hint: Some(12.0),
                ..CarSpec::ai("explicit wins")
            },
        ];
        let reg = AgentRegistry::new(specs, 100.0, (0.0, 0.0), true, &mut rng()).unwrap();
        let lanes: Vec<_> = reg.iter().map(|a| a.lane.index()).collect();
        assert_eq!(lanes, vec![1, 2, 2, 1, 1]);
    }

    #[test]
    fn test_lane2_downgraded_on_single_lane_track() {
        let specs = vec![CarSpec::user("me").with_lane(2)];
        let reg = AgentRegistry::new(specs, 100.0, (0.0, 0.0), false, &mut rng()).unwrap();
        assert_eq!(reg.user().lane, Lane::Primary);
    }

    #[test]
    fn test_ai_advance_accumulates_relative_distance() {
        let specs = vec![CarSpec::user("me"), CarSpec::ai("fast").with_speed(60.0)];
        let mut reg = AgentRegistry::new(specs, 50.0, (5.0, 5.0), false, &mut rng()).unwrap();
        let ai = reg.get_mut(AgentId(1)).unwrap();
        ai.advance_ai(50.0, 2.0);
        assert_eq!(ai.relative_distance, 20.0);
        assert_eq!(ai.absolute_traveled, 120.0);

        ai.apply_lap_boost();
        assert_eq!(ai.absolute_speed, 65.0);

        ai.reset_motion();
        assert_eq!(ai.absolute_speed, 60.0);
        assert_eq!(ai.relative_distance, 0.0);
    }
}
