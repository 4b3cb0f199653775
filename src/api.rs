use chrono::{DateTime, Utc};
use rocket::serde::json::Json;
use rocket::serde::{Deserialize, Serialize};
use rocket::{Route, State, get, post, routes};
use std::sync::Arc;
use tracing::warn;

use reconciler_exchange::Exchange;

use crate::breaker::BreakerSnapshot;
use crate::guarded::GuardedExchange;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};

/// Breaker view the status endpoints need, independent of the venue type.
pub trait BreakerControl: Send + Sync {
    fn breaker_snapshots(&self) -> Vec<BreakerSnapshot>;
    fn reset_breakers(&self);
}

impl<E: Exchange> BreakerControl for GuardedExchange<E> {
    fn breaker_snapshots(&self) -> Vec<BreakerSnapshot> {
        Self::breaker_snapshots(self)
    }

    fn reset_breakers(&self) {
        Self::reset_breakers(self);
    }
}

pub type DynBreakerControl = Arc<dyn BreakerControl>;

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[get("/health")]
pub fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
    })
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub metrics: MetricsSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
}

#[get("/metrics")]
pub fn metrics(
    registry: &State<Arc<MetricsRegistry>>,
    breakers: &State<DynBreakerControl>,
) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        metrics: registry.snapshot(),
        breakers: breakers.breaker_snapshots(),
    })
}

/// Operator override that closes every breaker without waiting out the open
/// duration.
#[post("/breakers/reset")]
pub fn reset_breakers(breakers: &State<DynBreakerControl>) -> Json<Vec<BreakerSnapshot>> {
    warn!("Resetting all circuit breakers on operator request");
    breakers.reset_breakers();
    Json(breakers.breaker_snapshots())
}

pub fn routes() -> Vec<Route> {
    routes![health, metrics, reset_breakers]
}
