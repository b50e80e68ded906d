//! API handlers for the marketplace order service

mod health;
mod orders;

pub use health::{health_check, HealthResponse};
pub use orders::*;
