//! Motion integration for one frame
//!
//! Advances the user along the path and every AI car relative to the user.
//! Lap detection, observers and pose output run afterwards in the engine.

use super::agent::AgentRegistry;
use super::pacing::Pacing;
use super::state::SimState;
use crate::wrap_distance;

/// Integrate `dt` seconds of motion
///
/// Travel is in the direction of decreasing path distance.
pub fn integrate(
    state: &mut SimState,
    pacing: &mut Pacing,
    agents: &mut AgentRegistry,
    total_length: f64,
    dt: f64,
) {
    if !state.is_playing() {
        return;
    }

    // Arm/clamp the floor before using the speed
    pacing.update_floor();
    let speed = pacing.effective();
    let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };

    state.traveled = wrap_distance(state.traveled - speed * dt, total_length);

    let user = agents.user_mut();
    if speed > 0.0 {
        user.absolute_traveled += speed * dt;
    }

    for ai in agents.ai_mut() {
        ai.advance_ai(speed, dt);
    }

    log::trace!(
        "Frame dt={:.4} speed={:.2} traveled={:.3}",
        dt,
        speed,
        state.traveled
    );
}
