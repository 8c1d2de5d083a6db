//! Configuration errors
//!
//! Anything returned from here is fatal at construction: no engine is built.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("missing primary race path")]
    MissingPath,

    #[error("no cars to simulate")]
    NoCars,

    #[error("no car is marked as the user car")]
    MissingUserCar,

    #[error("{count} cars are marked as the user car, expected exactly one")]
    MultipleUserCars { count: usize },

    #[error("path `{name}` has unusable length {length}")]
    DegeneratePath { name: String, length: f64 },

    #[error("path `{name}` cannot be sampled: {reason}")]
    Geometry { name: String, reason: String },

    #[error("page markup error: {0}")]
    Markup(String),

    #[error("options JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
