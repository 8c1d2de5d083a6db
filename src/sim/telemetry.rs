//! Lap telemetry and live ranking

use serde::{Deserialize, Serialize};

use super::agent::{Agent, AgentId};
use crate::consts::RANK_TOLERANCE;
use crate::wrap_distance;

/// One car's distance at the moment the user completed a lap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSample {
    pub agent_id: AgentId,
    pub label: String,
    pub is_user: bool,
    pub color_tag: String,
    pub distance_px: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapTelemetryEntry {
    pub lap_number: u32,
    pub elapsed_ms_since_race_start: f64,
    pub per_agent_samples: Vec<AgentSample>,
}

/// Per-lap snapshots, appended on every user lap
#[derive(Debug, Clone, Default, Serialize)]
pub struct LapTelemetry {
    entries: Vec<LapTelemetryEntry>,
    race_start_ms: Option<f64>,
}

impl LapTelemetry {
    /// Set the race-start baseline if none is recorded yet
    pub fn mark_start(&mut self, now_ms: f64) {
        if self.race_start_ms.is_none() {
            self.race_start_ms = Some(now_ms);
        }
    }

    pub fn race_start_ms(&self) -> Option<f64> {
        self.race_start_ms
    }

    pub fn record<'a>(
        &mut self,
        lap_number: u32,
        now_ms: f64,
        agents: impl Iterator<Item = &'a Agent>,
    ) {
        let start = *self.race_start_ms.get_or_insert(now_ms);
        let per_agent_samples = agents
            .map(|a| AgentSample {
                agent_id: a.id,
                label: a.label.clone(),
                is_user: a.is_user,
                color_tag: a.color_tag.clone(),
                distance_px: a.absolute_traveled,
            })
            .collect();
        self.entries.push(LapTelemetryEntry {
            lap_number,
            elapsed_ms_since_race_start: (now_ms - start).max(0.0),
            per_agent_samples,
        });
    }

    pub fn entries(&self) -> &[LapTelemetryEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.race_start_ms = None;
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.entries)
    }
}

/// Distance covered by one car
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoveredDistance {
    pub agent_id: AgentId,
    pub label: String,
    pub is_user: bool,
    pub distance_px: f64,
    /// Share of the race completed, when a target lap count is set
    pub fraction: Option<f64>,
}

/// Race completion fraction against `target_laps` of the car's own lane
pub fn race_fraction(distance: f64, target_laps: u32, lane_length: f64) -> Option<f64> {
    if target_laps == 0 || lane_length <= 0.0 {
        return None;
    }
    Some((distance / (target_laps as f64 * lane_length)).clamp(0.0, 1.0))
}

/// 1-based placement of the user among `phases`
///
/// Each entry is `(is_user, phase_position)`. Travel decreases position, so
/// a car is ahead when it sits below the user by less than half a lap.
pub fn user_rank(phases: &[(bool, f64)], total_length: f64) -> usize {
    let Some(&(_, user_phase)) = phases.iter().find(|(is_user, _)| *is_user) else {
        return 1;
    };
    let half = total_length / 2.0;
    let ahead = phases
        .iter()
        .filter(|(is_user, _)| !is_user)
        .filter(|(_, phase)| {
            let delta = wrap_distance(user_phase - phase, total_length);
            delta > RANK_TOLERANCE && delta < half
        })
        .count();
    1 + ahead
}
