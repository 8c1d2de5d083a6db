//! User pacing: base speed, penalties and the minimum-speed floor
//!
//! Effective speed is `max(0, base) * multiplier`, clamped up to the floor
//! once the floor has been armed, and forced to zero while the user is held.

use serde::Serialize;

use crate::consts::FLOOR_ARM_MARGIN;

#[derive(Debug, Clone, Serialize)]
pub struct Pacing {
    base: f64,
    multiplier: f64,
    /// Configured floor, if enabled
    floor: Option<f64>,
    floor_armed: bool,
    effective: f64,
    last_nonzero: f64,
    /// Lap at which a lap-bound penalty expires
    penalty_expiry_lap: Option<u32>,
    /// Frame time at which a temporary penalty reverts
    penalty_revert_at_ms: Option<f64>,
    held: bool,
}

impl Pacing {
    pub fn new(base: f64, floor: Option<f64>) -> Self {
        let mut pacing = Self {
            base: base.max(0.0),
            multiplier: 1.0,
            floor,
            floor_armed: false,
            effective: 0.0,
            last_nonzero: 0.0,
            penalty_expiry_lap: None,
            penalty_revert_at_ms: None,
            held: false,
        };
        pacing.recompute();
        pacing
    }

    pub fn effective(&self) -> f64 {
        self.effective
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn last_nonzero(&self) -> f64 {
        self.last_nonzero
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn floor_armed(&self) -> bool {
        self.floor_armed
    }

    pub fn penalty_expiry_lap(&self) -> Option<u32> {
        self.penalty_expiry_lap
    }

    /// Speed the user would have if not held
    fn unheld_speed(&self) -> f64 {
        let raw = self.base.max(0.0) * self.multiplier;
        match self.floor {
            Some(floor) if self.floor_armed => raw.max(floor),
            _ => raw,
        }
    }

    fn recompute(&mut self) {
        let speed = self.unheld_speed();
        if speed > 0.0 {
            self.last_nonzero = speed;
        }
        self.effective = if self.held { 0.0 } else { speed };
    }

    /// Per-frame floor handling: arm once reached, then clamp
    pub fn update_floor(&mut self) {
        if let Some(floor) = self.floor {
            if !self.floor_armed && self.base.max(0.0) * self.multiplier >= floor - FLOOR_ARM_MARGIN {
                self.floor_armed = true;
                log::debug!("Speed floor armed at {:.1} px/s", floor);
            }
        }
        self.recompute();
    }

    /// Replace the base speed; non-finite values are ignored
    pub fn set_base(&mut self, speed: f64) -> bool {
        if !speed.is_finite() {
            log::debug!("Ignoring non-finite base speed");
            return false;
        }
        self.base = speed.max(0.0);
        self.recompute();
        true
    }

    pub fn adjust_base(&mut self, delta: f64) -> bool {
        if !delta.is_finite() {
            log::debug!("Ignoring non-finite speed delta");
            return false;
        }
        self.set_base(self.base + delta)
    }

    /// Time-bound penalty; reverts at `now_ms + duration_ms`
    pub fn apply_temporary_penalty(&mut self, multiplier: f64, duration_ms: f64, now_ms: f64) -> bool {
        if !multiplier.is_finite() || !duration_ms.is_finite() {
            log::debug!("Ignoring non-finite penalty");
            return false;
        }
        self.multiplier = multiplier.clamp(0.0, 1.0);
        self.penalty_expiry_lap = None;
        self.penalty_revert_at_ms = Some(now_ms + duration_ms.max(0.0));
        self.recompute();
        log::debug!(
            "Penalty x{:.2} for {:.0} ms",
            self.multiplier,
            duration_ms
        );
        true
    }

    /// Lap-bound penalty; cleared when `lap_counter + 1` laps are complete
    pub fn apply_lap_penalty(&mut self, multiplier: f64, lap_counter: u32) -> bool {
        if !multiplier.is_finite() {
            log::debug!("Ignoring non-finite penalty");
            return false;
        }
        self.multiplier = multiplier.clamp(0.0, 1.0);
        self.penalty_revert_at_ms = None;
        self.penalty_expiry_lap = Some(lap_counter + 1);
        self.recompute();
        log::debug!(
            "Penalty x{:.2} until lap {}",
            self.multiplier,
            lap_counter + 1
        );
        true
    }

    /// Revert a temporary penalty whose time has come
    pub fn poll_timer(&mut self, now_ms: f64) -> bool {
        match self.penalty_revert_at_ms {
            Some(at) if now_ms >= at => {
                self.clear_penalty();
                log::debug!("Temporary penalty expired");
                true
            }
            _ => false,
        }
    }

    /// Clear a lap-bound penalty once its lap has been reached
    pub fn on_lap(&mut self, lap_counter: u32) -> bool {
        match self.penalty_expiry_lap {
            Some(lap) if lap_counter >= lap => {
                self.clear_penalty();
                log::debug!("Lap penalty cleared at lap {}", lap_counter);
                true
            }
            _ => false,
        }
    }

    fn clear_penalty(&mut self) {
        self.multiplier = 1.0;
        self.penalty_expiry_lap = None;
        self.penalty_revert_at_ms = None;
        self.recompute();
    }

    /// Force the user's speed to zero
    pub fn hold(&mut self) {
        self.held = true;
        self.recompute();
    }

    /// Release a hold; falls back to the last nonzero speed if the current
    /// settings would leave the user stopped
    pub fn release(&mut self) {
        self.held = false;
        if self.unheld_speed() <= 0.0 && self.last_nonzero > 0.0 {
            self.base = self.last_nonzero;
            self.multiplier = 1.0;
            self.penalty_expiry_lap = None;
            self.penalty_revert_at_ms = None;
        }
        self.recompute();
    }

    /// Back to construction state with a new base speed
    pub fn reset(&mut self, base: f64) {
        *self = Self::new(base, self.floor);
    }
}
