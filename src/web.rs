//! Browser binding
//!
//! Builds a `RaceEngine` from the page's SVG (`#racePath`, optional
//! `#racePath2`, `[data-car]` sprites and an optional `#startMarker`), drives
//! it from `requestAnimationFrame` and writes poses back onto the sprites.
//! JS sees a single `TrackSim` class.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use glam::DVec2;
use serde::Serialize;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{Document, Element, SvgGeometryElement};

use crate::error::SimError;
use crate::settings::SimOptions;
use crate::sim::{
    CarPose, CarSize, CarSpec, ClosedCurve, LapsOutcome, RaceEngine, RaceListener, RenderSink,
    TrackGeometry, Transform,
};

fn js_err(e: JsValue) -> anyhow::Error {
    anyhow::anyhow!("{:?}", e)
}

fn now_ms() -> f64 {
    web_sys::window()
        .and_then(|w| w.performance())
        .map(|p| p.now())
        .unwrap_or_else(js_sys::Date::now)
}

fn to_js<T: Serialize + ?Sized>(value: &T) -> Result<JsValue, JsError> {
    let json = serde_json::to_string(value)?;
    js_sys::JSON::parse(&json).map_err(|_| JsError::new("JSON.parse rejected engine output"))
}

// === DOM adapters ===

/// SVG geometry sampled through the browser
struct SvgPath {
    element: SvgGeometryElement,
    length: f64,
}

impl SvgPath {
    fn new(name: &str, element: SvgGeometryElement) -> Result<Self, SimError> {
        let length = element.get_total_length() as f64;
        // Probe once; a detached path fails here instead of mid-race
        element
            .get_point_at_length(0.0)
            .map_err(|e| SimError::Geometry {
                name: name.to_string(),
                reason: format!("{:?}", e),
            })?;
        Ok(Self { element, length })
    }
}

impl ClosedCurve for SvgPath {
    fn total_length(&self) -> f64 {
        self.length
    }

    fn point_at_length(&self, distance: f64) -> DVec2 {
        match self.element.get_point_at_length(distance as f32) {
            Ok(p) => DVec2::new(p.x() as f64, p.y() as f64),
            Err(e) => {
                log::warn!("getPointAtLength({distance}) failed: {:?}", e);
                DVec2::ZERO
            }
        }
    }
}

fn svg_path(document: &Document, id: &str) -> Result<Option<SvgPath>, SimError> {
    let Some(element) = document.get_element_by_id(id) else {
        return Ok(None);
    };
    let geometry = element
        .dyn_into::<SvgGeometryElement>()
        .map_err(|_| SimError::Geometry {
            name: id.to_string(),
            reason: "not an SVG geometry element".into(),
        })?;
    SvgPath::new(id, geometry).map(Some)
}

fn read_geometry(document: &Document) -> Result<TrackGeometry, SimError> {
    let primary = svg_path(document, "racePath")?.ok_or(SimError::MissingPath)?;
    match svg_path(document, "racePath2")? {
        Some(lane2) => TrackGeometry::with_lane2(Box::new(primary), Box::new(lane2)),
        None => TrackGeometry::new(Box::new(primary)),
    }
}

fn attr_f64(el: &Element, name: &str) -> Option<f64> {
    el.get_attribute(name)?.trim().parse().ok()
}

fn read_car(el: &Element, index: u32) -> CarSpec {
    let label = el
        .get_attribute("data-car")
        .filter(|s| !s.is_empty())
        .or_else(|| Some(el.id()).filter(|s| !s.is_empty()))
        .unwrap_or_else(|| format!("car-{index}"));
    let size = match (attr_f64(el, "width"), attr_f64(el, "height")) {
        (Some(width), Some(height)) if width > 0.0 && height > 0.0 => {
            Some(CarSize { width, height })
        }
        _ => None,
    };

    CarSpec {
        label,
        color_tag: el.get_attribute("data-color").unwrap_or_default(),
        is_user: el
            .get_attribute("data-user")
            .is_some_and(|v| v != "false" && v != "0"),
        lane: el
            .get_attribute("data-lane")
            .and_then(|v| v.trim().parse().ok()),
        grid_offset_hint: attr_f64(el, "data-grid-offset"),
        offset_fraction: attr_f64(el, "data-offset").unwrap_or(0.0),
        size,
        speed: attr_f64(el, "data-speed"),
    }
}

fn read_cars(document: &Document) -> Result<(Vec<CarSpec>, Vec<Element>), SimError> {
    let nodes = document
        .query_selector_all("[data-car]")
        .map_err(|e| SimError::Markup(format!("car query failed: {:?}", e)))?;

    let mut specs = Vec::new();
    let mut elements = Vec::new();
    for i in 0..nodes.length() {
        let Some(element) = nodes.get(i).and_then(|n| n.dyn_into::<Element>().ok()) else {
            continue;
        };
        specs.push(read_car(&element, i));
        elements.push(element);
    }
    Ok((specs, elements))
}

/// Writes poses onto the car sprites
struct SvgCarSink {
    cars: Vec<Element>,
    start_marker: Option<Element>,
}

impl RenderSink for SvgCarSink {
    fn place_car(&mut self, pose: &CarPose) -> anyhow::Result<()> {
        let Some(el) = self.cars.get(pose.agent_id.0) else {
            anyhow::bail!("no sprite for car {}", pose.agent_id.0);
        };
        el.set_attribute("x", &format!("{:.2}", pose.top_left.x))
            .map_err(js_err)?;
        el.set_attribute("y", &format!("{:.2}", pose.top_left.y))
            .map_err(js_err)?;
        el.set_attribute("transform", &pose.svg_transform())
            .map_err(js_err)?;
        Ok(())
    }

    fn place_start_marker(&mut self, at: DVec2) -> anyhow::Result<()> {
        if let Some(marker) = &self.start_marker {
            marker
                .set_attribute("cx", &format!("{:.2}", at.x))
                .map_err(js_err)?;
            marker
                .set_attribute("cy", &format!("{:.2}", at.y))
                .map_err(js_err)?;
        }
        Ok(())
    }
}

/// Forwards notifications to `speedChanged` / `lapChanged` on a JS object
struct JsListener {
    target: JsValue,
}

impl JsListener {
    fn call(&self, method: &str, arg: JsValue) -> anyhow::Result<()> {
        let f = js_sys::Reflect::get(&self.target, &JsValue::from_str(method)).map_err(js_err)?;
        // Both callbacks are optional
        let Some(f) = f.dyn_ref::<js_sys::Function>() else {
            return Ok(());
        };
        f.call1(&self.target, &arg).map_err(js_err)?;
        Ok(())
    }
}

impl RaceListener for JsListener {
    fn speed_changed(&mut self, px_per_sec: f64) -> anyhow::Result<()> {
        self.call("speedChanged", JsValue::from_f64(px_per_sec))
    }

    fn lap_changed(&mut self, lap: u32) -> anyhow::Result<()> {
        self.call("lapChanged", JsValue::from_f64(lap as f64))
    }
}

// === Frame loop ===

struct Host {
    engine: RefCell<RaceEngine>,
    frame_pending: Cell<bool>,
}

impl Host {
    fn with_engine<R>(&self, f: impl FnOnce(&mut RaceEngine) -> R) -> Option<R> {
        match self.engine.try_borrow_mut() {
            Ok(mut engine) => Some(f(&mut engine)),
            Err(_) => {
                log::warn!("TrackSim called from inside a listener callback; ignored");
                None
            }
        }
    }
}

fn request_frame(host: &Rc<Host>) {
    if host.frame_pending.replace(true) {
        return;
    }
    let Some(window) = web_sys::window() else {
        host.frame_pending.set(false);
        return;
    };
    let weak = Rc::downgrade(host);
    let closure = Closure::once(move |time: f64| frame_loop(weak, time));
    if let Err(e) = window.request_animation_frame(closure.as_ref().unchecked_ref()) {
        log::warn!("requestAnimationFrame failed: {:?}", e);
        host.frame_pending.set(false);
    }
    closure.forget();
}

fn frame_loop(host: Weak<Host>, time: f64) {
    // The binding was dropped
    let Some(host) = host.upgrade() else {
        return;
    };
    host.frame_pending.set(false);
    if host.with_engine(|e| e.frame(time)).unwrap_or(true) {
        request_frame(&host);
    }
}

/// Fire engine timers once `delay_ms` has passed, even with no frames running
fn schedule_timer_poll(host: &Rc<Host>, delay_ms: f64) {
    let Some(window) = web_sys::window() else {
        return;
    };
    let weak = Rc::downgrade(host);
    let closure = Closure::once(move || {
        if let Some(host) = weak.upgrade() {
            host.with_engine(|e| e.poll_timers(now_ms()));
        }
    });
    let delay = delay_ms.clamp(0.0, i32::MAX as f64) as i32;
    if let Err(e) = window
        .set_timeout_with_callback_and_timeout_and_arguments_0(closure.as_ref().unchecked_ref(), delay)
    {
        log::warn!("setTimeout failed: {:?}", e);
    }
    closure.forget();
}

fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        console_error_panic_hook::set_once();
        if console_log::init_with_level(log::Level::Info).is_err() {
            web_sys::console::warn_1(&"track-sim: logger already installed".into());
        }
    });
}

fn parse_options(value: &JsValue) -> Result<SimOptions, JsError> {
    if value.is_undefined() || value.is_null() {
        return Ok(SimOptions::default());
    }
    let json: String = js_sys::JSON::stringify(value)
        .map_err(|_| JsError::new("options must be a plain object"))?
        .into();
    Ok(SimOptions::from_json(&json)?)
}

fn count_arg(name: &str, value: f64) -> Option<u32> {
    if value.is_finite() && value >= 0.0 {
        Some(value.min(u32::MAX as f64) as u32)
    } else {
        log::debug!("Ignoring {name} = {value}");
        None
    }
}

// === JS surface ===

#[wasm_bindgen]
pub struct TrackSim {
    host: Rc<Host>,
}

#[wasm_bindgen]
impl TrackSim {
    /// Build from the current document; `options` is a plain object or
    /// undefined
    #[wasm_bindgen(constructor)]
    pub fn new(options: JsValue) -> Result<TrackSim, JsError> {
        init_logging();

        let document = web_sys::window()
            .and_then(|w| w.document())
            .ok_or_else(|| JsError::new("no document"))?;

        let mut options = parse_options(&options)?;
        if options.seed.is_none() {
            options.seed = Some(js_sys::Date::now() as u64);
        }

        let geometry = read_geometry(&document)?;
        let (specs, cars) = read_cars(&document)?;
        let mut engine = RaceEngine::new(geometry, specs, options)?;
        engine.set_render_sink(Some(Box::new(SvgCarSink {
            cars,
            start_marker: document.get_element_by_id("startMarker"),
        })));

        log::info!("TrackSim attached");
        Ok(TrackSim {
            host: Rc::new(Host {
                engine: RefCell::new(engine),
                frame_pending: Cell::new(false),
            }),
        })
    }

    pub fn play(&self) {
        let playing = self.host.with_engine(|e| {
            e.poll_timers(now_ms());
            e.play();
            e.is_playing()
        });
        if playing == Some(true) {
            request_frame(&self.host);
        }
    }

    pub fn pause(&self) {
        self.host.with_engine(|e| e.pause());
    }

    pub fn reset(&self) {
        self.host.with_engine(|e| e.reset());
    }

    pub fn dispose(&self) {
        self.host.with_engine(|e| e.dispose());
    }

    /// Resolves with `{laps, halted}` once the user has completed `laps`
    /// more laps; rejects if the race is reset or disposed first
    #[wasm_bindgen(js_name = playForLaps)]
    pub fn play_for_laps(&self, laps: f64, halt_at_finish: Option<bool>) -> js_sys::Promise {
        let laps = count_arg("laps", laps).unwrap_or(0);
        let Some(completion) = self.host.with_engine(|e| {
            e.poll_timers(now_ms());
            e.play_for_laps(laps, halt_at_finish.unwrap_or(true))
        }) else {
            return js_sys::Promise::reject(&JsValue::from_str("busy"));
        };
        request_frame(&self.host);

        wasm_bindgen_futures::future_to_promise(async move {
            match completion.await {
                LapsOutcome::Completed { laps, halted } => {
                    let result = js_sys::Object::new();
                    js_sys::Reflect::set(&result, &"laps".into(), &JsValue::from_f64(laps as f64))?;
                    js_sys::Reflect::set(&result, &"halted".into(), &JsValue::from_bool(halted))?;
                    Ok(result.into())
                }
                LapsOutcome::Cancelled => Err(JsValue::from_str("cancelled")),
            }
        })
    }

    #[wasm_bindgen(js_name = setSpeed)]
    pub fn set_speed(&self, px_per_sec: f64) {
        self.host.with_engine(|e| e.set_speed(px_per_sec));
    }

    #[wasm_bindgen(js_name = adjustBaseSpeed)]
    pub fn adjust_base_speed(&self, delta: f64) {
        self.host.with_engine(|e| e.adjust_base_speed(delta));
    }

    #[wasm_bindgen(js_name = applyPenalty)]
    pub fn apply_penalty(&self, multiplier: f64, duration_ms: f64) {
        self.host.with_engine(|e| {
            e.poll_timers(now_ms());
            e.apply_penalty(multiplier, duration_ms);
        });
        if duration_ms.is_finite() {
            schedule_timer_poll(&self.host, duration_ms);
        }
    }

    #[wasm_bindgen(js_name = applyPenaltyForNextLap)]
    pub fn apply_penalty_for_next_lap(&self, multiplier: f64) {
        self.host
            .with_engine(|e| e.apply_penalty_for_next_lap(multiplier));
    }

    #[wasm_bindgen(js_name = setAnsweredCount)]
    pub fn set_answered_count(&self, answered: f64) {
        if let Some(answered) = count_arg("answeredCount", answered) {
            self.host.with_engine(|e| e.set_answered_count(answered));
        }
    }

    #[wasm_bindgen(js_name = setQuestionAnswered)]
    pub fn set_question_answered(&self, answered: bool) {
        self.host.with_engine(|e| e.set_question_answered(answered));
    }

    #[wasm_bindgen(js_name = setGateByAnsweredCount)]
    pub fn set_gate_by_answered_count(&self, enabled: bool) {
        self.host
            .with_engine(|e| e.set_gate_by_answered_count(enabled));
    }

    #[wasm_bindgen(js_name = setTargetLaps)]
    pub fn set_target_laps(&self, laps: f64) {
        if let Some(laps) = count_arg("targetLaps", laps) {
            self.host.with_engine(|e| e.set_target_laps(laps));
        }
    }

    #[wasm_bindgen(js_name = setTransform)]
    pub fn set_transform(&self, translate_x: f64, translate_y: f64, scale: f64) {
        self.host
            .with_engine(|e| e.set_transform(Transform::new(translate_x, translate_y, scale)));
    }

    #[wasm_bindgen(js_name = setRotation)]
    pub fn set_rotation(&self, degrees: f64) {
        self.host.with_engine(|e| e.set_rotation(degrees));
    }

    /// Object with optional `speedChanged(pxPerSec)` and `lapChanged(lap)`
    /// methods; null detaches
    #[wasm_bindgen(js_name = setListener)]
    pub fn set_listener(&self, listener: JsValue) {
        let listener: Option<Box<dyn RaceListener>> =
            if listener.is_undefined() || listener.is_null() {
                None
            } else {
                Some(Box::new(JsListener { target: listener }))
            };
        self.host.with_engine(|e| e.set_listener(listener));
    }

    #[wasm_bindgen(js_name = userRank)]
    pub fn user_rank(&self) -> u32 {
        self.host.with_engine(|e| e.user_rank() as u32).unwrap_or(1)
    }

    #[wasm_bindgen(js_name = coveredDistances)]
    pub fn covered_distances(&self) -> Result<JsValue, JsError> {
        let covered = self
            .host
            .with_engine(|e| e.covered_distances())
            .unwrap_or_default();
        to_js(&covered)
    }

    /// Copy of the per-lap snapshots
    #[wasm_bindgen(js_name = lapTelemetry)]
    pub fn lap_telemetry(&self) -> Result<JsValue, JsError> {
        let entries = self
            .host
            .with_engine(|e| e.lap_telemetry().to_vec())
            .unwrap_or_default();
        to_js(&entries)
    }

    #[wasm_bindgen(js_name = resetLapTelemetry)]
    pub fn reset_lap_telemetry(&self) {
        self.host.with_engine(|e| e.reset_lap_telemetry());
    }

    /// Current flags and speeds
    pub fn state(&self) -> Result<JsValue, JsError> {
        match self.host.with_engine(|e| e.snapshot()) {
            Some(snapshot) => to_js(&snapshot),
            None => Err(JsError::new("busy")),
        }
    }
}
