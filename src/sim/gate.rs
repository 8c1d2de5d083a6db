//! Answer gating
//!
//! The user may not start lap `n + 1` until `n` questions have been answered.
//! The gate only decides; the engine applies the hold to the user's pacing
//! and leaves every other car running.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GateState {
    Running,
    HaltedAwaitingAnswer,
}

#[derive(Debug, Clone, Serialize)]
pub struct Gate {
    enabled: bool,
    answered: u32,
    state: GateState,
}

impl Gate {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            answered: 0,
            state: GateState::Running,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state == GateState::HaltedAwaitingAnswer
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn answered(&self) -> u32 {
        self.answered
    }

    /// Would the user be stopped at `lap_counter` right now?
    pub fn blocks(&self, lap_counter: u32) -> bool {
        self.enabled && self.answered < lap_counter
    }

    /// Called after a lap completes; returns true if the user must halt
    pub fn on_lap(&mut self, lap_counter: u32) -> bool {
        if self.blocks(lap_counter) {
            self.state = GateState::HaltedAwaitingAnswer;
            log::debug!(
                "Gate closed at lap {} ({} answered)",
                lap_counter,
                self.answered
            );
            true
        } else {
            false
        }
    }

    /// Update the answered count; returns true if a halt was released
    pub fn set_answered(&mut self, answered: u32, lap_counter: u32) -> bool {
        self.answered = answered;
        self.try_open(lap_counter)
    }

    /// Mark the question for the current lap as answered
    pub fn mark_answered(&mut self, lap_counter: u32) -> bool {
        self.answered = self.answered.max(lap_counter);
        self.try_open(lap_counter)
    }

    /// Enable or disable gating; disabling releases any halt
    pub fn set_enabled(&mut self, enabled: bool, lap_counter: u32) -> bool {
        self.enabled = enabled;
        self.try_open(lap_counter)
    }

    fn try_open(&mut self, lap_counter: u32) -> bool {
        if self.is_halted() && !self.blocks(lap_counter) {
            self.state = GateState::Running;
            log::debug!("Gate opened at lap {}", lap_counter);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.answered = 0;
        self.state = GateState::Running;
    }
}
