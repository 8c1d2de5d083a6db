//! Simulation state
//!
//! Scalars mutated every frame and by every control call. Per-car data lives
//! in the agent registry; pacing and gating keep their own state.

use serde::Serialize;

/// Whether frames are being driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    /// Constructed or paused; frames are ignored
    Idle,
    /// Frames advance the simulation
    Playing,
    /// Torn down; every call is a no-op
    Disposed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimState {
    pub phase: RunPhase,
    /// User position along the primary path (px), in [0, total)
    pub traveled: f64,
    /// User position at the start line, from the start offset
    pub start_traveled: f64,
    pub lap_counter: u32,
    /// 0 = unbounded
    pub target_laps: u32,
    /// Latest host timestamp seen (ms)
    pub clock_ms: f64,
    /// Timestamp of the previous frame; `None` makes the next frame dt = 0
    pub last_frame_ms: Option<f64>,
    /// Sprite rotation offset (degrees)
    pub rotation: f64,
    /// User stopped at the end of a `play_for_laps` run
    pub finish_hold: bool,
    /// Pending re-sample of the start coordinate
    pub start_sample_at_ms: Option<f64>,
}

impl SimState {
    pub fn new(start_traveled: f64, rotation: f64) -> Self {
        Self {
            phase: RunPhase::Idle,
            traveled: start_traveled,
            start_traveled,
            lap_counter: 0,
            target_laps: 0,
            clock_ms: 0.0,
            last_frame_ms: None,
            rotation,
            finish_hold: false,
            start_sample_at_ms: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.phase == RunPhase::Playing
    }

    pub fn is_disposed(&self) -> bool {
        self.phase == RunPhase::Disposed
    }

    /// Advance the clock to `now_ms` and return the frame's dt in seconds
    pub fn frame_dt(&mut self, now_ms: f64) -> f64 {
        let dt = match self.last_frame_ms {
            Some(last) if now_ms.is_finite() => ((now_ms - last) / 1000.0).max(0.0),
            _ => 0.0,
        };
        if now_ms.is_finite() {
            self.last_frame_ms = Some(now_ms);
            self.clock_ms = self.clock_ms.max(now_ms);
        }
        dt
    }
}

/// Host-facing view of the simulation flags
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimSnapshot {
    pub playing: bool,
    pub px_per_sec_base: f64,
    pub penalty_multiplier: f64,
    pub px_per_sec_effective: f64,
    pub lap_counter: u32,
    pub answered_count: u32,
    pub paused_for_question: bool,
    pub target_laps: u32,
    pub penalty_expiry_lap: Option<u32>,
    pub traveled: f64,
}
