//! Race simulation module
//!
//! All race logic lives here. This module is host-agnostic and deterministic:
//! - Time only enters through `frame(now_ms)` and `poll_timers(now_ms)`
//! - Seeded RNG only
//! - Stable iteration order (by car index)
//! - No DOM or platform dependencies

pub mod agent;
pub mod engine;
pub mod gate;
pub mod lap;
pub mod notify;
pub mod pacing;
pub mod path;
pub mod render;
pub mod state;
pub mod telemetry;
pub mod tick;
pub mod ticker;

pub use agent::{Agent, AgentId, AgentRegistry, CarSize, CarSpec};
pub use engine::RaceEngine;
pub use gate::GateState;
pub use notify::RaceListener;
pub use path::{ClosedCurve, Lane, Polyline, TrackGeometry, Transform};
pub use render::{CarPose, RenderSink};
pub use state::{RunPhase, SimSnapshot};
pub use telemetry::{AgentSample, CoveredDistance, LapTelemetryEntry};
pub use ticker::{FrameInfo, LapsCompletion, LapsOutcome, SubscriptionId, TickObserver, TickerStatus};
