//! Host notifications
//!
//! Speed changes are throttled and deduplicated on the rounded value; lap
//! changes always go out but are deduplicated on the value. A listener error
//! is logged and dropped so it can never stall the simulation.

use crate::consts::SPEED_NOTIFY_INTERVAL_MS;

/// Receives speed and lap changes from the engine
pub trait RaceListener {
    fn speed_changed(&mut self, px_per_sec: f64) -> anyhow::Result<()>;
    fn lap_changed(&mut self, lap: u32) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct Notifier {
    listener: Option<Box<dyn RaceListener>>,
    last_speed: Option<i64>,
    last_speed_ms: Option<f64>,
    last_lap: Option<u32>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("attached", &self.listener.is_some())
            .field("last_speed", &self.last_speed)
            .field("last_lap", &self.last_lap)
            .finish()
    }
}

impl Notifier {
    pub fn set_listener(&mut self, listener: Option<Box<dyn RaceListener>>) {
        self.listener = listener;
        self.last_speed = None;
        self.last_speed_ms = None;
        self.last_lap = None;
    }

    /// Report the current speed. Reports are deduplicated on the rounded
    /// value and unforced ones are limited to ~6 Hz.
    pub fn speed(&mut self, px_per_sec: f64, now_ms: f64, forced: bool) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        let rounded = px_per_sec.round() as i64;
        if self.last_speed == Some(rounded) {
            return;
        }
        if !forced
            && self
                .last_speed_ms
                .is_some_and(|last| now_ms - last < SPEED_NOTIFY_INTERVAL_MS)
        {
            return;
        }
        self.last_speed = Some(rounded);
        self.last_speed_ms = Some(now_ms);
        if let Err(e) = listener.speed_changed(px_per_sec) {
            log::warn!("Speed listener failed: {e:#}");
        }
    }

    pub fn lap(&mut self, lap: u32) {
        let Some(listener) = self.listener.as_mut() else {
            return;
        };
        if self.last_lap == Some(lap) {
            return;
        }
        self.last_lap = Some(lap);
        if let Err(e) = listener.lap_changed(lap) {
            log::warn!("Lap listener failed: {e:#}");
        }
    }
}
