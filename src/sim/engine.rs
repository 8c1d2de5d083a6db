//! Race engine
//!
//! Owns every piece of simulation state and runs the per-frame pipeline:
//! timers, motion, lap detection and its effects, observers, poses, then the
//! throttled speed report. The host drives it with `frame(now_ms)` from its
//! animation loop and calls the control methods from UI events.

use glam::DVec2;
use rand::SeedableRng;
use rand_pcg::Pcg32;

use super::agent::{Agent, AgentRegistry, CarSpec};
use super::gate::{Gate, GateState};
use super::lap::LapDetector;
use super::notify::{Notifier, RaceListener};
use super::pacing::Pacing;
use super::path::{TrackGeometry, Transform};
use super::render::{CarPose, RenderSink};
use super::state::{RunPhase, SimSnapshot, SimState};
use super::telemetry::{self, CoveredDistance, LapTelemetry, LapTelemetryEntry};
use super::tick::integrate;
use super::ticker::{
    Finished, FrameInfo, LapTarget, LapsCompletion, LapsOutcome, SubscriptionId, TickObserver,
    TickerStatus, Tickers,
};
use crate::consts::START_SAMPLE_DELAY_MS;
use crate::error::SimError;
use crate::settings::SimOptions;
use crate::{normalize_degrees, smooth_heading, wrap_distance};

/// A car's position along the primary path, stagger included
fn phase_position(agent: &Agent, traveled: f64, total: f64) -> f64 {
    // Motion decreases position, so a positive lead sits below the user
    let lead = if agent.is_user {
        0.0
    } else {
        agent.relative_distance
    };
    wrap_distance(traveled - lead + agent.offset_fraction * total, total)
}

pub struct RaceEngine {
    geometry: TrackGeometry,
    agents: AgentRegistry,
    state: SimState,
    pacing: Pacing,
    gate: Gate,
    detector: LapDetector,
    telemetry: LapTelemetry,
    notifier: Notifier,
    tickers: Tickers,
    /// Subscriptions made by `play_for_laps`; cancelled on reset
    lap_requests: Vec<SubscriptionId>,
    sink: Option<Box<dyn RenderSink>>,
    poses: Vec<CarPose>,
    options: SimOptions,
}

impl std::fmt::Debug for RaceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaceEngine")
            .field("geometry", &self.geometry)
            .field("state", &self.state)
            .field("pacing", &self.pacing)
            .field("gate", &self.gate)
            .field("cars", &self.agents.len())
            .field("tickers", &self.tickers)
            .finish()
    }
}

impl RaceEngine {
    /// Build an engine over `geometry` with the given cars
    ///
    /// Exactly one car must be the user car. Poses are computed immediately
    /// so the host can draw the grid before the first frame.
    pub fn new(
        mut geometry: TrackGeometry,
        cars: Vec<CarSpec>,
        options: SimOptions,
    ) -> Result<Self, SimError> {
        let options = options.sanitized();
        geometry.set_lane2_y_offset(options.lane2_y_offset);

        let mut rng = Pcg32::seed_from_u64(options.seed());
        let agents = AgentRegistry::new(
            cars,
            options.speed,
            (options.ai_lap_boost_min, options.ai_lap_boost_max),
            geometry.has_lane2(),
            &mut rng,
        )?;

        let total = geometry.total_length();
        let start_traveled = wrap_distance(options.start_offset_fraction * total, total);
        let floor = options
            .min_speed_floor_enabled
            .then_some(options.min_speed_floor);

        let mut engine = Self {
            state: SimState::new(start_traveled, options.start_rotation),
            pacing: Pacing::new(options.speed, floor),
            gate: Gate::new(options.gate_by_answered_count),
            detector: LapDetector::new(options.lap_inner_radius, options.lap_outer_radius),
            telemetry: LapTelemetry::default(),
            notifier: Notifier::default(),
            tickers: Tickers::default(),
            lap_requests: Vec::new(),
            sink: None,
            poses: Vec::with_capacity(agents.len()),
            geometry,
            agents,
            options,
        };
        engine.prime_detector();
        engine.render_poses();

        log::info!(
            "Race engine ready: {} cars, track {:.1} px, lane 2 {}",
            engine.agents.len(),
            total,
            if engine.geometry.has_lane2() {
                "present"
            } else {
                "absent"
            }
        );
        Ok(engine)
    }

    // === Frame pipeline ===

    /// Advance the simulation to `now_ms`; returns whether the host should
    /// keep requesting frames
    pub fn frame(&mut self, now_ms: f64) -> bool {
        if self.state.is_disposed() {
            return false;
        }
        self.poll_timers(now_ms);
        if !self.state.is_playing() {
            return false;
        }

        let dt = self.state.frame_dt(now_ms);
        let now = if now_ms.is_finite() {
            now_ms
        } else {
            self.state.clock_ms
        };
        self.telemetry.mark_start(now);

        let total = self.geometry.total_length();
        integrate(
            &mut self.state,
            &mut self.pacing,
            &mut self.agents,
            total,
            dt,
        );

        let laps = self.detect_laps(now);
        self.run_tickers(now, dt, laps);
        self.render_poses();
        self.notifier.speed(self.pacing.effective(), now, false);

        self.state.is_playing()
    }

    /// Fire due timers without advancing motion
    ///
    /// Runs at the start of every frame. Hosts that stop driving frames while
    /// paused can call it from their own timer so a temporary penalty still
    /// reverts on time.
    pub fn poll_timers(&mut self, now_ms: f64) {
        if self.state.is_disposed() || !now_ms.is_finite() {
            return;
        }
        self.state.clock_ms = self.state.clock_ms.max(now_ms);

        if self.pacing.poll_timer(now_ms) {
            self.notifier.speed(self.pacing.effective(), now_ms, true);
        }
        if self
            .state
            .start_sample_at_ms
            .is_some_and(|at| now_ms >= at)
        {
            self.state.start_sample_at_ms = None;
            self.sample_start();
        }
    }

    fn detect_laps(&mut self, now_ms: f64) -> u32 {
        let position = self.user_display();
        if !self.detector.update(position, now_ms) {
            return 0;
        }
        self.complete_lap(now_ms);
        1
    }

    fn complete_lap(&mut self, now_ms: f64) {
        self.state.lap_counter += 1;
        let lap = self.state.lap_counter;
        log::info!("Lap {} complete at {:.0} ms", lap, now_ms);

        self.notifier.lap(lap);
        self.telemetry.record(lap, now_ms, self.agents.iter());
        for ai in self.agents.ai_mut() {
            ai.apply_lap_boost();
        }
        self.pacing.on_lap(lap);
        if self.gate.on_lap(lap) {
            self.halt_at_start();
        }

        // Reported once the lap's effects are applied
        self.notifier.speed(self.pacing.effective(), now_ms, true);
    }

    /// Snap the user to the start boundary and hold them there
    fn halt_at_start(&mut self) {
        self.state.traveled = self.state.start_traveled;
        self.refresh_hold();
        let start = self.detector.start();
        let position = self.user_display();
        self.detector.prime(start, position);
        log::info!(
            "User halted at lap {} awaiting answer",
            self.state.lap_counter
        );
    }

    /// Hold the user while the gate or a finish hold requires it
    fn refresh_hold(&mut self) {
        let hold = self.gate.is_halted() || self.state.finish_hold;
        if hold && !self.pacing.is_held() {
            self.pacing.hold();
        } else if !hold && self.pacing.is_held() {
            self.pacing.release();
        }
    }

    fn frame_info(&self, now_ms: f64, dt: f64, laps_this_frame: u32) -> FrameInfo {
        FrameInfo {
            now_ms,
            dt,
            total_length: self.geometry.total_length(),
            user_traveled: self.state.traveled,
            start_traveled: self.state.start_traveled,
            user_absolute: self.agents.user().absolute_traveled,
            lap_counter: self.state.lap_counter,
            laps_this_frame,
            gate_halted: self.gate.is_halted(),
        }
    }

    fn run_tickers(&mut self, now_ms: f64, dt: f64, laps_this_frame: u32) {
        if self.tickers.is_empty() {
            return;
        }
        let info = self.frame_info(now_ms, dt, laps_this_frame);
        for Finished {
            id,
            status,
            mut observer,
        } in self.tickers.run(&info)
        {
            self.lap_requests.retain(|r| *r != id);
            if status == TickerStatus::HaltThenDone {
                self.hold_at_finish(now_ms);
            }
            observer.settle(&self.frame_info(now_ms, dt, laps_this_frame));
        }
    }

    fn hold_at_finish(&mut self, now_ms: f64) {
        // A closed gate already holds the user
        if self.gate.is_halted() {
            return;
        }
        self.state.finish_hold = true;
        self.refresh_hold();
        self.notifier.speed(self.pacing.effective(), now_ms, true);
        log::info!("User held at finish, lap {}", self.state.lap_counter);
    }

    // === Geometry helpers ===

    fn user_display(&self) -> DVec2 {
        let user = self.agents.user();
        let at = phase_position(user, self.state.traveled, self.geometry.total_length());
        self.geometry.sample_at(at, user.lane)
    }

    /// Display coordinate of the user's start line
    pub fn start_coordinate(&self) -> DVec2 {
        let user = self.agents.user();
        let total = self.geometry.total_length();
        let at = wrap_distance(
            self.state.start_traveled + user.offset_fraction * total,
            total,
        );
        self.geometry.sample_at(at, user.lane)
    }

    fn prime_detector(&mut self) {
        let start = self.start_coordinate();
        let position = self.user_display();
        self.detector.prime(start, position);
        self.place_start_marker(start);
    }

    /// Refresh the start coordinate without touching the detector's zone
    fn sample_start(&mut self) {
        let start = self.start_coordinate();
        self.detector.set_start(start);
        self.place_start_marker(start);
    }

    fn place_start_marker(&mut self, at: DVec2) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.place_start_marker(at) {
                log::warn!("Placing start marker failed: {e:#}");
            }
        }
    }

    fn render_poses(&mut self) {
        let total = self.geometry.total_length();
        let alpha = self.options.angle_smoothing;
        self.poses.clear();

        for agent in self.agents.iter_mut() {
            let at = phase_position(agent, self.state.traveled, total);
            let (center, heading) = self.geometry.pose_at(at, agent.lane);
            let smoothed = smooth_heading(agent.heading_smoothed, heading, alpha);
            agent.heading_smoothed = Some(smoothed);
            self.poses.push(CarPose::new(
                agent.id,
                agent.lane,
                center,
                agent.size,
                normalize_degrees(smoothed + self.state.rotation),
            ));
        }

        if let Some(sink) = self.sink.as_mut() {
            for pose in &self.poses {
                if let Err(e) = sink.place_car(pose) {
                    log::warn!("Placing car {} failed: {e:#}", pose.agent_id.0);
                }
            }
        }
    }

    // === Run control ===

    /// Start or resume; also releases a finish hold from `play_for_laps`
    pub fn play(&mut self) {
        if self.state.is_disposed() {
            return;
        }
        if self.state.finish_hold {
            self.state.finish_hold = false;
            self.refresh_hold();
            self.notify_speed();
        }
        if self.state.is_playing() {
            return;
        }
        self.state.phase = RunPhase::Playing;
        self.state.last_frame_ms = None;
        self.state.start_sample_at_ms = Some(self.state.clock_ms + START_SAMPLE_DELAY_MS);
        self.tickers.notify_play();
        log::info!("Race playing");
    }

    pub fn pause(&mut self) {
        if !self.state.is_playing() {
            return;
        }
        self.state.phase = RunPhase::Idle;
        self.state.last_frame_ms = None;
        self.state.start_sample_at_ms = None;
        log::info!("Race paused at lap {}", self.state.lap_counter);
    }

    /// Pause and return every car to the grid
    ///
    /// Lap count, answered count, penalties, holds and telemetry are cleared,
    /// AI speeds go back to their initial values and pending lap requests
    /// resolve as cancelled. The base speed is kept.
    pub fn reset(&mut self) {
        if self.state.is_disposed() {
            return;
        }
        self.pause();
        for id in self.lap_requests.drain(..) {
            self.tickers.unsubscribe(id);
        }

        self.state.traveled = self.state.start_traveled;
        self.state.lap_counter = 0;
        self.state.finish_hold = false;
        for agent in self.agents.iter_mut() {
            agent.reset_motion();
        }
        self.pacing.reset(self.pacing.base());
        self.gate.reset();
        self.telemetry.clear();

        self.detector.clear_history();
        self.prime_detector();
        self.render_poses();

        self.notifier.lap(0);
        self.notify_speed();
        log::info!("Race reset");
    }

    /// Tear down; every later call is a no-op and pending lap requests
    /// resolve as cancelled
    pub fn dispose(&mut self) {
        if self.state.is_disposed() {
            return;
        }
        self.pause();
        self.tickers.clear();
        self.lap_requests.clear();
        self.state.phase = RunPhase::Disposed;
        self.state.start_sample_at_ms = None;
        self.notifier.set_listener(None);
        self.sink = None;
        log::info!("Race engine disposed");
    }

    /// Play until the user completes `laps` more laps
    ///
    /// With `halt_at_finish` the user is held once the target is reached and
    /// the completion resolves after the hold is in place; the next `play`
    /// releases it.
    pub fn play_for_laps(&mut self, laps: u32, halt_at_finish: bool) -> LapsCompletion {
        if self.state.is_disposed() {
            return LapsCompletion::ready(LapsOutcome::Cancelled);
        }
        if laps == 0 {
            return LapsCompletion::ready(LapsOutcome::Completed {
                laps: 0,
                halted: false,
            });
        }

        let (target, completion) =
            LapTarget::new(laps, halt_at_finish, self.agents.user().absolute_traveled);
        let id = self.tickers.subscribe(Box::new(target));
        self.lap_requests.push(id);
        log::debug!("Playing for {} laps (halt at finish: {})", laps, halt_at_finish);

        self.play();
        completion
    }

    // === Pacing and gating ===

    fn notify_speed(&mut self) {
        self.notifier
            .speed(self.pacing.effective(), self.state.clock_ms, true);
    }

    /// Set the user's base speed (px/s)
    pub fn set_speed(&mut self, px_per_sec: f64) {
        if !self.state.is_disposed() && self.pacing.set_base(px_per_sec) {
            self.notify_speed();
        }
    }

    pub fn adjust_base_speed(&mut self, delta: f64) {
        if !self.state.is_disposed() && self.pacing.adjust_base(delta) {
            self.notify_speed();
        }
    }

    /// Scale the user's speed for `duration_ms`, measured on the frame clock
    pub fn apply_penalty(&mut self, multiplier: f64, duration_ms: f64) {
        if !self.state.is_disposed()
            && self
                .pacing
                .apply_temporary_penalty(multiplier, duration_ms, self.state.clock_ms)
        {
            self.notify_speed();
        }
    }

    /// Scale the user's speed until the next lap completes
    pub fn apply_penalty_for_next_lap(&mut self, multiplier: f64) {
        if !self.state.is_disposed()
            && self
                .pacing
                .apply_lap_penalty(multiplier, self.state.lap_counter)
        {
            self.notify_speed();
        }
    }

    fn resume_from_gate(&mut self) {
        self.refresh_hold();
        self.notify_speed();
        log::info!("User released at lap {}", self.state.lap_counter);
    }

    pub fn set_answered_count(&mut self, answered: u32) {
        if !self.state.is_disposed() && self.gate.set_answered(answered, self.state.lap_counter) {
            self.resume_from_gate();
        }
    }

    /// Mark the current lap's question as answered; `false` changes nothing
    pub fn set_question_answered(&mut self, answered: bool) {
        if answered
            && !self.state.is_disposed()
            && self.gate.mark_answered(self.state.lap_counter)
        {
            self.resume_from_gate();
        }
    }

    pub fn set_gate_by_answered_count(&mut self, enabled: bool) {
        if !self.state.is_disposed() && self.gate.set_enabled(enabled, self.state.lap_counter) {
            self.resume_from_gate();
        }
    }

    /// Race length used for completion fractions; 0 = unbounded
    pub fn set_target_laps(&mut self, laps: u32) {
        self.state.target_laps = laps;
    }

    // === Display ===

    /// Change the curve-to-display mapping; invalid transforms are ignored
    pub fn set_transform(&mut self, transform: Transform) {
        if self.state.is_disposed() {
            return;
        }
        if !transform.is_valid() {
            log::debug!("Ignoring invalid transform {:?}", transform);
            return;
        }
        self.geometry.set_transform(transform);
        self.prime_detector();
        self.render_poses();
    }

    /// Sprite rotation offset in degrees
    pub fn set_rotation(&mut self, degrees: f64) {
        if self.state.is_disposed() || !degrees.is_finite() {
            return;
        }
        self.state.rotation = degrees;
        self.render_poses();
    }

    pub fn set_listener(&mut self, listener: Option<Box<dyn RaceListener>>) {
        if !self.state.is_disposed() {
            self.notifier.set_listener(listener);
        }
    }

    /// Attach an output; current poses are pushed to it right away
    pub fn set_render_sink(&mut self, sink: Option<Box<dyn RenderSink>>) {
        if self.state.is_disposed() {
            return;
        }
        self.sink = sink;
        let start = self.detector.start();
        self.place_start_marker(start);
        self.render_poses();
    }

    // === Observers ===

    pub fn subscribe(&mut self, observer: Box<dyn TickObserver>) -> SubscriptionId {
        self.tickers.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.lap_requests.retain(|r| *r != id);
        self.tickers.unsubscribe(id)
    }

    // === Queries ===

    /// 1-based placement of the user
    pub fn user_rank(&self) -> usize {
        let total = self.geometry.total_length();
        let phases: Vec<(bool, f64)> = self
            .agents
            .iter()
            .map(|a| (a.is_user, phase_position(a, self.state.traveled, total)))
            .collect();
        telemetry::user_rank(&phases, total)
    }

    pub fn covered_distances(&self) -> Vec<CoveredDistance> {
        self.agents
            .iter()
            .map(|a| CoveredDistance {
                agent_id: a.id,
                label: a.label.clone(),
                is_user: a.is_user,
                distance_px: a.absolute_traveled,
                fraction: telemetry::race_fraction(
                    a.absolute_traveled,
                    self.state.target_laps,
                    self.geometry.lane_length(a.lane),
                ),
            })
            .collect()
    }

    pub fn lap_telemetry(&self) -> &[LapTelemetryEntry] {
        self.telemetry.entries()
    }

    pub fn lap_telemetry_json(&self) -> Result<String, SimError> {
        Ok(self.telemetry.to_json()?)
    }

    /// Drop recorded laps; the next frame starts a new baseline
    pub fn reset_lap_telemetry(&mut self) {
        self.telemetry.clear();
    }

    pub fn snapshot(&self) -> SimSnapshot {
        SimSnapshot {
            playing: self.state.is_playing(),
            px_per_sec_base: self.pacing.base(),
            penalty_multiplier: self.pacing.multiplier(),
            px_per_sec_effective: self.pacing.effective(),
            lap_counter: self.state.lap_counter,
            answered_count: self.gate.answered(),
            paused_for_question: self.gate.is_halted(),
            target_laps: self.state.target_laps,
            penalty_expiry_lap: self.pacing.penalty_expiry_lap(),
            traveled: self.state.traveled,
        }
    }

    pub fn poses(&self) -> &[CarPose] {
        &self.poses
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn geometry(&self) -> &TrackGeometry {
        &self.geometry
    }

    pub fn options(&self) -> &SimOptions {
        &self.options
    }

    pub fn lap_counter(&self) -> u32 {
        self.state.lap_counter
    }

    pub fn traveled(&self) -> f64 {
        self.state.traveled
    }

    pub fn effective_speed(&self) -> f64 {
        self.pacing.effective()
    }

    pub fn is_playing(&self) -> bool {
        self.state.is_playing()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    pub fn is_paused_for_question(&self) -> bool {
        self.gate.is_halted()
    }

    pub fn gate_state(&self) -> GateState {
        self.gate.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::agent::AgentId;
    use crate::sim::notify::tests::{Note, Recorder};
    use crate::sim::path::Polyline;
    use proptest::prelude::*;

    /// 250 x 250 square: 1000 px around, start at the top-left corner
    fn square_track() -> TrackGeometry {
        let square = Polyline::rectangle(DVec2::ZERO, 250.0, 250.0).unwrap();
        TrackGeometry::new(Box::new(square)).unwrap()
    }

    fn options(speed: f64) -> SimOptions {
        SimOptions {
            speed,
            ai_lap_boost_min: 0.0,
            ai_lap_boost_max: 0.0,
            ..Default::default()
        }
    }

    fn solo(speed: f64) -> RaceEngine {
        RaceEngine::new(square_track(), vec![CarSpec::user("me")], options(speed)).unwrap()
    }

    /// Frames at `from_ms`, `from_ms + step_ms`, ... up to `to_ms` inclusive
    fn drive(engine: &mut RaceEngine, from_ms: f64, to_ms: f64, step_ms: f64) {
        let steps = ((to_ms - from_ms) / step_ms).round() as u32;
        for i in 0..=steps {
            engine.frame(from_ms + i as f64 * step_ms);
        }
    }

    #[test]
    fn test_ten_seconds_at_100_is_exactly_one_lap() {
        let rec = Recorder::default();
        let mut e = solo(100.0);
        e.set_listener(Some(Box::new(rec.clone())));
        e.play();

        drive(&mut e, 0.0, 9875.0, 125.0);
        assert_eq!(e.lap_counter(), 0);
        assert_eq!(e.traveled(), 12.5);

        e.frame(10_000.0);
        assert_eq!(e.lap_counter(), 1);
        assert_eq!(e.traveled(), 0.0);
        assert_eq!(rec.laps(), vec![1]);

        // Leaving the start again does not fire
        drive(&mut e, 10_125.0, 19_875.0, 125.0);
        assert_eq!(e.lap_counter(), 1);
    }

    #[test]
    fn test_construction_validates_cars() {
        let no_user = RaceEngine::new(square_track(), vec![CarSpec::ai("bot")], options(100.0));
        assert!(matches!(no_user, Err(SimError::MissingUserCar)));

        let e = solo(100.0);
        assert_eq!(e.poses().len(), 1);
        assert!(!e.is_playing());
        assert_eq!(e.start_coordinate(), DVec2::ZERO);
    }

    #[test]
    fn test_initial_pose_heads_along_travel() {
        let mut e = solo(100.0);
        // From the top-left corner travel runs down the left edge
        assert!((e.poses()[0].heading_deg - 90.0).abs() < 1e-9);
        e.set_rotation(-90.0);
        assert!(e.poses()[0].heading_deg.abs() < 1e-9);
        assert_eq!(e.poses()[0].top_left, DVec2::new(-24.0, -14.0));
    }

    #[test]
    fn test_gate_halts_user_until_answered() {
        let mut opts = options(100.0);
        opts.gate_by_answered_count = true;
        let cars = vec![CarSpec::user("me"), CarSpec::ai("bot").with_speed(100.0)];
        let mut e = RaceEngine::new(square_track(), cars, opts).unwrap();
        let rec = Recorder::default();
        e.set_listener(Some(Box::new(rec.clone())));
        e.play();

        drive(&mut e, 0.0, 10_000.0, 125.0);
        assert_eq!(e.lap_counter(), 1);
        assert!(e.is_paused_for_question());
        assert_eq!(e.gate_state(), GateState::HaltedAwaitingAnswer);
        assert_eq!(e.effective_speed(), 0.0);
        assert!(e.is_playing());

        let bot_before = e.agents().get(AgentId(1)).unwrap().absolute_traveled;
        drive(&mut e, 10_125.0, 11_000.0, 125.0);
        assert_eq!(e.traveled(), 0.0);
        assert_eq!(e.lap_counter(), 1);
        let bot = e.agents().get(AgentId(1)).unwrap();
        assert_eq!(bot.absolute_traveled, bot_before + 100.0);
        assert_eq!(bot.relative_distance, 100.0);

        e.set_answered_count(1);
        assert!(!e.is_paused_for_question());
        assert_eq!(e.effective_speed(), 100.0);
        e.frame(11_125.0);
        assert_eq!(e.traveled(), 987.5);
        assert_eq!(
            rec.notes(),
            vec![
                Note::Speed(100.0),
                Note::Lap(1),
                Note::Speed(0.0),
                Note::Speed(100.0)
            ]
        );
    }

    #[test]
    fn test_question_answered_flag_resumes() {
        let mut opts = options(100.0);
        opts.gate_by_answered_count = true;
        let mut e = RaceEngine::new(square_track(), vec![CarSpec::user("me")], opts).unwrap();
        e.play();
        drive(&mut e, 0.0, 10_000.0, 125.0);
        assert!(e.is_paused_for_question());

        e.set_question_answered(false);
        assert!(e.is_paused_for_question());
        e.set_question_answered(true);
        assert!(!e.is_paused_for_question());
        assert_eq!(e.snapshot().answered_count, 1);
    }

    #[test]
    fn test_disabling_gate_releases_halt() {
        let mut opts = options(100.0);
        opts.gate_by_answered_count = true;
        let mut e = RaceEngine::new(square_track(), vec![CarSpec::user("me")], opts).unwrap();
        e.play();
        drive(&mut e, 0.0, 10_000.0, 125.0);
        e.set_gate_by_answered_count(false);
        assert_eq!(e.effective_speed(), 100.0);
    }

    #[test]
    fn test_lap_penalty_expires_exactly_at_next_lap() {
        let mut e = solo(100.0);
        e.apply_penalty_for_next_lap(0.5);
        assert_eq!(e.effective_speed(), 50.0);
        assert_eq!(e.snapshot().penalty_expiry_lap, Some(1));
        e.play();

        // A lap at 50 px/s takes 20 s
        drive(&mut e, 0.0, 19_875.0, 125.0);
        assert_eq!(e.lap_counter(), 0);
        assert_eq!(e.snapshot().penalty_multiplier, 0.5);

        e.frame(20_000.0);
        assert_eq!(e.lap_counter(), 1);
        assert_eq!(e.snapshot().penalty_multiplier, 1.0);
        assert_eq!(e.effective_speed(), 100.0);
        assert_eq!(e.snapshot().penalty_expiry_lap, None);
    }

    #[test]
    fn test_temporary_penalty_reverts_while_paused() {
        let mut e = solo(100.0);
        e.poll_timers(1000.0);
        e.apply_penalty(0.5, 2000.0);
        assert_eq!(e.effective_speed(), 50.0);
        e.poll_timers(2999.0);
        assert_eq!(e.effective_speed(), 50.0);
        e.poll_timers(3000.0);
        assert_eq!(e.effective_speed(), 100.0);
    }

    #[test]
    fn test_speed_floor_holds_after_arming() {
        let mut opts = options(100.0);
        opts.min_speed_floor_enabled = true;
        opts.min_speed_floor = 40.0;
        let mut e = RaceEngine::new(square_track(), vec![CarSpec::user("me")], opts).unwrap();
        e.play();
        e.frame(0.0);
        e.apply_penalty_for_next_lap(0.1);
        assert_eq!(e.effective_speed(), 40.0);
    }

    #[test]
    fn test_lap_events_throttled_regardless_of_frame_rate() {
        // 20 px loop at 100 px/s passes the start every 200 ms
        let tiny = Polyline::rectangle(DVec2::ZERO, 5.0, 5.0).unwrap();
        let geometry = TrackGeometry::new(Box::new(tiny)).unwrap();
        let mut e = RaceEngine::new(geometry, vec![CarSpec::user("me")], options(100.0)).unwrap();
        e.play();
        drive(&mut e, 0.0, 3000.0, 1.0);

        let entries = e.lap_telemetry();
        assert!(entries.len() >= 3, "only {} laps", entries.len());
        for pair in entries.windows(2) {
            let gap = pair[1].elapsed_ms_since_race_start - pair[0].elapsed_ms_since_race_start;
            assert!(gap >= 500.0, "laps {} ms apart", gap);
        }
    }

    #[test]
    fn test_equal_speeds_keep_rank_stable() {
        let cars = vec![
            CarSpec::user("me"),
            CarSpec::ai("level").with_speed(80.0),
            CarSpec::ai("behind").with_speed(80.0).with_offset(0.25),
            CarSpec::ai("ahead").with_speed(80.0).with_offset(0.9),
        ];
        let mut e = RaceEngine::new(square_track(), cars, options(80.0)).unwrap();
        e.play();
        let mut t = 0.0;
        for i in 0..3000 {
            e.frame(t);
            assert_eq!(e.user_rank(), 2);
            t += 7.0 + (i % 5) as f64 * 3.0;
        }
    }

    #[test]
    fn test_faster_ai_overtakes() {
        let cars = vec![CarSpec::user("me"), CarSpec::ai("quick").with_speed(150.0)];
        let mut e = RaceEngine::new(square_track(), cars, options(100.0)).unwrap();
        assert_eq!(e.user_rank(), 1);
        e.play();
        drive(&mut e, 0.0, 1000.0, 125.0);
        assert_eq!(e.user_rank(), 2);
    }

    #[test]
    fn test_telemetry_samples_every_car() {
        let cars = vec![CarSpec::user("me"), CarSpec::ai("bot").with_speed(120.0)];
        let mut e = RaceEngine::new(square_track(), cars, options(100.0)).unwrap();
        e.play();
        drive(&mut e, 0.0, 10_000.0, 125.0);

        let entry = &e.lap_telemetry()[0];
        assert_eq!(entry.lap_number, 1);
        assert_eq!(entry.elapsed_ms_since_race_start, 10_000.0);
        let distances: Vec<f64> = entry.per_agent_samples.iter().map(|s| s.distance_px).collect();
        assert_eq!(distances, vec![1000.0, 1200.0]);

        let json = e.lap_telemetry_json().unwrap();
        assert!(json.contains("\"perAgentSamples\""));

        e.reset_lap_telemetry();
        assert!(e.lap_telemetry().is_empty());
    }

    #[test]
    fn test_ai_boost_applied_each_lap() {
        let mut opts = options(100.0);
        opts.ai_lap_boost_min = 5.0;
        opts.ai_lap_boost_max = 5.0;
        let cars = vec![CarSpec::user("me"), CarSpec::ai("bot")];
        let mut e = RaceEngine::new(square_track(), cars, opts).unwrap();
        e.play();
        drive(&mut e, 0.0, 10_000.0, 125.0);
        assert_eq!(e.agents().get(AgentId(1)).unwrap().absolute_speed, 105.0);

        e.reset();
        assert_eq!(e.agents().get(AgentId(1)).unwrap().absolute_speed, 100.0);
    }

    #[test]
    fn test_covered_fraction_uses_target_laps() {
        let mut e = solo(100.0);
        assert_eq!(e.covered_distances()[0].fraction, None);
        e.set_target_laps(4);
        e.play();
        drive(&mut e, 0.0, 10_000.0, 125.0);
        let covered = &e.covered_distances()[0];
        assert_eq!(covered.distance_px, 1000.0);
        assert_eq!(covered.fraction, Some(0.25));
    }

    #[test]
    fn test_reset_returns_to_grid() {
        let rec = Recorder::default();
        let mut opts = options(100.0);
        opts.start_offset_fraction = 0.25;
        let mut e = RaceEngine::new(square_track(), vec![CarSpec::user("me")], opts).unwrap();
        e.set_listener(Some(Box::new(rec.clone())));
        assert_eq!(e.traveled(), 250.0);
        assert_eq!(e.start_coordinate(), DVec2::new(250.0, 0.0));

        e.play();
        drive(&mut e, 0.0, 15_000.0, 125.0);
        assert_eq!(e.lap_counter(), 1);

        e.reset();
        assert!(!e.is_playing());
        assert_eq!(e.lap_counter(), 0);
        assert_eq!(e.traveled(), 250.0);
        assert!(e.lap_telemetry().is_empty());
        assert_eq!(e.agents().user().absolute_traveled, 0.0);
        assert_eq!(rec.laps(), vec![1, 0]);

        // The same race plays out again
        e.play();
        drive(&mut e, 20_000.0, 30_000.0, 125.0);
        assert_eq!(e.lap_counter(), 1);
    }

    #[test]
    fn test_play_for_laps_halts_at_finish() {
        let mut e = solo(100.0);
        let done = e.play_for_laps(2, true);
        assert!(e.is_playing());

        drive(&mut e, 0.0, 19_875.0, 125.0);
        assert_eq!(e.lap_counter(), 1);
        assert!(!done.is_resolved());

        e.frame(20_000.0);
        assert_eq!(e.lap_counter(), 2);
        assert_eq!(
            done.try_outcome(),
            Some(LapsOutcome::Completed {
                laps: 2,
                halted: true
            })
        );
        assert_eq!(e.effective_speed(), 0.0);
        assert!(e.is_playing());

        e.play();
        assert_eq!(e.effective_speed(), 100.0);
    }

    #[test]
    fn test_play_for_laps_without_halt_keeps_running() {
        let mut e = solo(100.0);
        let done = e.play_for_laps(1, false);
        drive(&mut e, 0.0, 10_000.0, 125.0);
        assert_eq!(
            done.try_outcome(),
            Some(LapsOutcome::Completed {
                laps: 1,
                halted: false
            })
        );
        assert_eq!(e.effective_speed(), 100.0);
    }

    #[test]
    fn test_play_for_laps_with_gate_resolves_once_halted() {
        let mut opts = options(100.0);
        opts.gate_by_answered_count = true;
        let mut e = RaceEngine::new(square_track(), vec![CarSpec::user("me")], opts).unwrap();
        let done = e.play_for_laps(1, true);
        drive(&mut e, 0.0, 10_000.0, 125.0);

        assert!(done.is_resolved());
        assert!(e.is_paused_for_question());
        e.set_answered_count(1);
        assert_eq!(e.effective_speed(), 100.0);
    }

    #[test]
    fn test_multi_lap_request_survives_gate_release() {
        let mut opts = options(100.0);
        opts.gate_by_answered_count = true;
        let mut e = RaceEngine::new(square_track(), vec![CarSpec::user("me")], opts).unwrap();
        let done = e.play_for_laps(2, true);
        drive(&mut e, 0.0, 10_000.0, 125.0);
        assert_eq!(e.lap_counter(), 1);
        assert!(e.is_paused_for_question());

        // Answered well after the lap, so no guard window is open
        drive(&mut e, 10_125.0, 12_000.0, 125.0);
        e.set_answered_count(1);
        drive(&mut e, 12_125.0, 12_375.0, 125.0);
        assert_eq!(e.traveled(), 962.5);
        assert!(!done.is_resolved());
        assert_eq!(e.effective_speed(), 100.0);

        drive(&mut e, 12_500.0, 21_875.0, 125.0);
        assert_eq!(e.lap_counter(), 1);
        assert!(!done.is_resolved());

        e.frame(22_000.0);
        assert_eq!(e.lap_counter(), 2);
        assert_eq!(
            done.try_outcome(),
            Some(LapsOutcome::Completed {
                laps: 2,
                halted: true
            })
        );
        assert!(e.is_paused_for_question());
    }

    #[test]
    fn test_resume_just_short_of_start_still_counts_lap() {
        let mut e = solo(100.0);
        e.play();
        drive(&mut e, 0.0, 9875.0, 125.0);
        // Stop 0.8 px before the line: inside the outer radius only
        e.frame(9992.0);
        assert!((e.traveled() - 0.8).abs() < 1e-9);
        assert_eq!(e.lap_counter(), 0);
        e.pause();

        e.set_speed(3.0);
        e.play();
        drive(&mut e, 20_000.0, 23_200.0, 16.0);
        assert_eq!(e.lap_counter(), 1);
        assert_eq!(e.lap_telemetry().len(), 1);
    }

    #[test]
    fn test_pending_lap_requests_cancelled() {
        let mut e = solo(100.0);
        assert_eq!(
            e.play_for_laps(0, true).try_outcome(),
            Some(LapsOutcome::Completed {
                laps: 0,
                halted: false
            })
        );

        let first = e.play_for_laps(3, false);
        e.reset();
        assert_eq!(first.try_outcome(), Some(LapsOutcome::Cancelled));

        let second = e.play_for_laps(3, false);
        e.dispose();
        assert_eq!(second.try_outcome(), Some(LapsOutcome::Cancelled));
        assert!(!e.frame(0.0));
        assert_eq!(
            e.play_for_laps(1, false).try_outcome(),
            Some(LapsOutcome::Cancelled)
        );
    }

    #[test]
    fn test_failing_listener_does_not_stop_race() {
        struct Broken;
        impl RaceListener for Broken {
            fn speed_changed(&mut self, _: f64) -> anyhow::Result<()> {
                anyhow::bail!("detached")
            }
            fn lap_changed(&mut self, _: u32) -> anyhow::Result<()> {
                anyhow::bail!("detached")
            }
        }

        let mut e = solo(100.0);
        e.set_listener(Some(Box::new(Broken)));
        e.play();
        drive(&mut e, 0.0, 10_000.0, 125.0);
        assert_eq!(e.lap_counter(), 1);
    }

    #[test]
    fn test_transform_moves_start_and_poses() {
        let mut e = solo(100.0);
        e.set_transform(Transform::new(100.0, 50.0, 2.0));
        assert_eq!(e.start_coordinate(), DVec2::new(100.0, 50.0));
        assert_eq!(e.poses()[0].center, DVec2::new(100.0, 50.0));

        e.set_transform(Transform::new(0.0, 0.0, 0.0));
        assert_eq!(e.start_coordinate(), DVec2::new(100.0, 50.0));

        // Path length is unchanged; laps still take 10 s
        e.play();
        drive(&mut e, 0.0, 10_000.0, 125.0);
        assert_eq!(e.lap_counter(), 1);
    }

    #[test]
    fn test_render_sink_receives_poses() {
        use std::cell::RefCell;
        use std::rc::Rc;

        #[derive(Clone, Default)]
        struct Collect(Rc<RefCell<Vec<CarPose>>>, Rc<RefCell<Vec<DVec2>>>);
        impl RenderSink for Collect {
            fn place_car(&mut self, pose: &CarPose) -> anyhow::Result<()> {
                self.0.borrow_mut().push(*pose);
                Ok(())
            }
            fn place_start_marker(&mut self, at: DVec2) -> anyhow::Result<()> {
                self.1.borrow_mut().push(at);
                Ok(())
            }
        }

        let sink = Collect::default();
        let cars = vec![CarSpec::user("me"), CarSpec::ai("bot")];
        let mut e = RaceEngine::new(square_track(), cars, options(100.0)).unwrap();
        e.set_render_sink(Some(Box::new(sink.clone())));
        assert_eq!(sink.0.borrow().len(), 2);
        assert_eq!(sink.1.borrow().as_slice(), &[DVec2::ZERO]);

        e.play();
        e.frame(0.0);
        e.frame(16.0);
        assert_eq!(sink.0.borrow().len(), 6);
    }

    #[test]
    fn test_dispose_is_terminal() {
        let mut e = solo(100.0);
        e.dispose();
        e.play();
        assert!(!e.is_playing());
        assert!(e.is_disposed());
        e.set_speed(10.0);
        assert_eq!(e.snapshot().px_per_sec_base, 100.0);
    }

    proptest! {
        #[test]
        fn prop_frames_keep_state_consistent(
            speed in 1.0f64..3000.0,
            steps in prop::collection::vec(0.0f64..100.0, 1..300),
        ) {
            let cars = vec![CarSpec::user("me"), CarSpec::ai("bot").with_speed(speed * 0.8)];
            let mut e = RaceEngine::new(square_track(), cars, options(speed)).unwrap();
            e.play();
            let mut t = 0.0;
            let mut laps = 0;
            for step in steps {
                t += step;
                e.frame(t);
                prop_assert!(e.traveled() >= 0.0 && e.traveled() < 1000.0);
                prop_assert!(e.lap_counter() >= laps);
                laps = e.lap_counter();
                let rank = e.user_rank();
                prop_assert!((1..=2).contains(&rank));
            }
        }
    }
}
