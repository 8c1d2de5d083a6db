//! Track Sim entry point
//!
//! Native builds run a headless demo race and print its telemetry. The
//! browser build is driven through the `TrackSim` class exported by the
//! library.

#[cfg(not(target_arch = "wasm32"))]
fn main() {
    env_logger::init();
    log::info!("Track Sim (native) starting...");

    if let Err(e) = demo::run() {
        log::error!("Demo race failed: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(target_arch = "wasm32")]
fn main() {
    // WASM entry point is the TrackSim constructor, this is just to satisfy the compiler
}

#[cfg(not(target_arch = "wasm32"))]
mod demo {
    use glam::DVec2;
    use track_sim::SimOptions;
    use track_sim::sim::{CarSpec, LapsOutcome, Polyline, RaceEngine, RaceListener, TrackGeometry};

    const FRAME_MS: f64 = 1000.0 / 60.0;
    /// Give up after five minutes of race time
    const MAX_RACE_MS: f64 = 300_000.0;
    const LAPS: u32 = 3;
    /// How long the simulated player takes to answer after each lap
    const ANSWER_DELAYS_MS: [f64; 3] = [1200.0, 2600.0, 900.0];

    struct LogListener;

    impl RaceListener for LogListener {
        fn speed_changed(&mut self, px_per_sec: f64) -> anyhow::Result<()> {
            log::info!("Speed {px_per_sec:.1} px/s");
            Ok(())
        }

        fn lap_changed(&mut self, lap: u32) -> anyhow::Result<()> {
            log::info!("Lap {lap}");
            Ok(())
        }
    }

    fn build_engine() -> anyhow::Result<RaceEngine> {
        let lane1 = Polyline::ellipse(DVec2::new(400.0, 250.0), 320.0, 180.0, 256)?;
        let lane2 = lane1.offset(-24.0)?;
        let geometry = TrackGeometry::with_lane2(Box::new(lane1), Box::new(lane2))?;

        let cars = vec![
            CarSpec::user("You").with_color("red"),
            CarSpec::ai("Blue")
                .with_color("blue")
                .with_speed(135.0)
                .with_offset(0.02),
            CarSpec::ai("Green")
                .with_color("green")
                .with_lane(2)
                .with_speed(145.0),
            CarSpec::ai("Yellow")
                .with_color("yellow")
                .with_lane(2)
                .with_speed(125.0)
                .with_offset(0.98),
        ];

        let options = SimOptions {
            speed: 140.0,
            gate_by_answered_count: true,
            min_speed_floor_enabled: true,
            seed: Some(7),
            ..Default::default()
        };

        let mut engine = RaceEngine::new(geometry, cars, options)?;
        engine.set_listener(Some(Box::new(LogListener)));
        engine.set_target_laps(LAPS);
        Ok(engine)
    }

    pub fn run() -> anyhow::Result<()> {
        let mut engine = build_engine()?;
        let completion = engine.play_for_laps(LAPS, true);

        let mut now = 0.0;
        let mut answer_due: Option<f64> = None;
        engine.frame(now);

        while !completion.is_resolved() && now < MAX_RACE_MS {
            now += FRAME_MS;
            engine.frame(now);

            if !engine.is_paused_for_question() {
                continue;
            }
            let lap = engine.lap_counter();
            let due = *answer_due.get_or_insert_with(|| {
                now + ANSWER_DELAYS_MS[(lap as usize - 1) % ANSWER_DELAYS_MS.len()]
            });
            if now >= due {
                answer_due = None;
                // Every second answer is wrong and costs speed for a lap
                if lap % 2 == 0 {
                    log::info!("Wrong answer on lap {lap}");
                    engine.apply_penalty_for_next_lap(0.6);
                }
                engine.set_question_answered(true);
            }
        }

        match completion.try_outcome() {
            Some(LapsOutcome::Completed { laps, halted }) => {
                println!(
                    "Finished {laps} laps in {:.1} s (held at finish: {halted})",
                    now / 1000.0
                );
            }
            Some(LapsOutcome::Cancelled) => println!("Race cancelled"),
            None => println!("Race did not finish within {:.0} s", MAX_RACE_MS / 1000.0),
        }

        println!("Rank: {} of {}", engine.user_rank(), engine.agents().len());
        for covered in engine.covered_distances() {
            println!(
                "  {:<8} {:>9.1} px {:>6.1}%",
                covered.label,
                covered.distance_px,
                covered.fraction.unwrap_or(0.0) * 100.0
            );
        }
        println!("{}", serde_json::to_string_pretty(engine.lap_telemetry())?);
        Ok(())
    }
}
