//! HTTP control surface for the engine.
//!
//! These are the engine's own endpoints, not a CRUD API over the fleet:
//!
//! - `GET /health` - Health check
//! - `POST /incidents` - Report an incident and dispatch to it
//! - `POST /dispatch/:intervention_id` - Dispatch to an intervention's shortfall
//! - `GET /interventions/:intervention_id/candidates` - Scored candidate preview
//! - `POST /interventions/:intervention_id/cancel` - Cancel and free its units
//! - `GET /vehicles` - Latest simulator snapshot
//! - `GET /dispatch/config`, `PUT /dispatch/config` - Live dispatch weights
//! - `POST /refresh` - Reload dispatch weights from the store

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::config::DispatchWeights;
use crate::dispatch::{
    CancelledIntervention, DispatchReport, Dispatcher, OpenedIncident, ScoredCandidate,
};
use crate::error::Error;
use crate::model::{InterventionId, NewIncident};
use crate::routing::{CachedRouter, RoutingBackend};
use crate::simulation::VehicleSnapshot;
use crate::storage::Storage;

/// The dispatcher as wired by the binary.
pub type EngineDispatcher = Dispatcher<Storage, CachedRouter<RoutingBackend>>;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<EngineDispatcher>,
    pub vehicles: watch::Receiver<Vec<VehicleSnapshot>>,
}

/// Request body for `PUT /dispatch/config`.
#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    pub key: String,
    pub value: f64,
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::IllegalTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn weights_body(weights: &DispatchWeights) -> Json<BTreeMap<&'static str, f64>> {
    Json(weights.entries().into_iter().collect())
}

/// Build the router with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/incidents", post(post_incident))
        .route("/dispatch/config", get(get_config).put(put_config))
        .route("/dispatch/:intervention_id", post(post_dispatch))
        .route("/interventions/:intervention_id/candidates", get(get_candidates))
        .route("/interventions/:intervention_id/cancel", post(post_cancel))
        .route("/vehicles", get(get_vehicles))
        .route("/refresh", post(post_refresh))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// POST /incidents - Record an incident, open its intervention and dispatch.
///
/// ```json
/// {
///     "type_code": "FIRE",
///     "severity": 3,
///     "required_unit_types": ["VSAV"],
///     "location": {"lat": 45.743, "lon": 4.817}
/// }
/// ```
#[instrument(skip(state, request), fields(type_code = %request.type_code, severity = request.severity))]
pub async fn post_incident(
    State(state): State<AppState>,
    Json(request): Json<NewIncident>,
) -> Result<(StatusCode, Json<OpenedIncident>), StatusCode> {
    match state.dispatcher.open_incident(request).await {
        Ok(opened) => {
            info!(
                intervention_id = opened.intervention.id,
                dispatched = opened.report.assignments.len(),
                "Incident opened"
            );
            Ok((StatusCode::CREATED, Json(opened)))
        }
        Err(e) => {
            warn!(error = %e, "Failed to open incident");
            Err(status_for(&e))
        }
    }
}

/// POST /dispatch/:intervention_id - Dispatch units to cover the shortfall.
///
/// An empty `assignments` list means no unit was available; the caller may
/// retry later.
#[instrument(skip(state))]
pub async fn post_dispatch(
    State(state): State<AppState>,
    Path(intervention_id): Path<InterventionId>,
) -> Result<Json<DispatchReport>, StatusCode> {
    match state.dispatcher.dispatch(intervention_id).await {
        Ok(report) => {
            info!(
                intervention_id,
                dispatched = report.assignments.len(),
                degraded_match = report.degraded_match,
                "Dispatch requested"
            );
            Ok(Json(report))
        }
        Err(e) => {
            warn!(intervention_id, error = %e, "Dispatch failed");
            Err(status_for(&e))
        }
    }
}

/// GET /interventions/:intervention_id/candidates - What the scored strategy
/// would consider, best first. Disqualified candidates are listed last with
/// a `null` total.
#[instrument(skip(state))]
pub async fn get_candidates(
    State(state): State<AppState>,
    Path(intervention_id): Path<InterventionId>,
) -> Result<Json<Vec<ScoredCandidate>>, StatusCode> {
    match state.dispatcher.rank_candidates(intervention_id).await {
        Ok(candidates) => {
            info!(intervention_id, candidates = candidates.len(), "Candidates ranked");
            Ok(Json(candidates))
        }
        Err(e) => {
            warn!(intervention_id, error = %e, "Failed to rank candidates");
            Err(status_for(&e))
        }
    }
}

/// POST /interventions/:intervention_id/cancel - Cancel an intervention.
///
/// Repeating the call answers with an empty `freed_units`; a completed
/// intervention answers 409.
#[instrument(skip(state))]
pub async fn post_cancel(
    State(state): State<AppState>,
    Path(intervention_id): Path<InterventionId>,
) -> Result<Json<CancelledIntervention>, StatusCode> {
    match state.dispatcher.cancel(intervention_id).await {
        Ok(cancelled) => Ok(Json(cancelled)),
        Err(e) => {
            warn!(intervention_id, error = %e, "Failed to cancel intervention");
            Err(status_for(&e))
        }
    }
}

/// GET /vehicles - Positions and progress after the latest tick.
pub async fn get_vehicles(State(state): State<AppState>) -> Json<Vec<VehicleSnapshot>> {
    Json(state.vehicles.borrow().clone())
}

/// GET /dispatch/config - Current dispatch weights.
pub async fn get_config(State(state): State<AppState>) -> Json<BTreeMap<&'static str, f64>> {
    weights_body(&state.dispatcher.config().current())
}

/// PUT /dispatch/config - Persist one weight and apply it to the next dispatch.
#[instrument(skip(state))]
pub async fn put_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<BTreeMap<&'static str, f64>>, StatusCode> {
    match state.dispatcher.update_config(&update.key, update.value).await {
        Ok(weights) => Ok(weights_body(&weights)),
        Err(e) => {
            warn!(key = %update.key, value = update.value, error = %e, "Rejected config update");
            Err(status_for(&e))
        }
    }
}

/// POST /refresh - Reload dispatch weights from the store.
#[instrument(skip(state))]
pub async fn post_refresh(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<&'static str, f64>>, StatusCode> {
    match state.dispatcher.reload_config().await {
        Ok(weights) => Ok(weights_body(&weights)),
        Err(e) => {
            warn!(error = %e, "Failed to reload dispatch config");
            Err(status_for(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::ConfigHandle;

    async fn state() -> AppState {
        let storage = Arc::new(Storage::new("sqlite::memory:").await.unwrap());
        let router = Arc::new(CachedRouter::new(RoutingBackend::Direct));
        let (_tx, vehicles) = watch::channel(Vec::new());
        AppState {
            dispatcher: Arc::new(Dispatcher::new(storage, router, ConfigHandle::default())),
            vehicles,
        }
    }

    #[tokio::test]
    async fn test_health_through_tower() {
        let app = router(state().await);
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();

        let response = tokio_test::assert_ok!(app.oneshot(request).await);

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_vehicles_before_first_tick() {
        let app = router(state().await);
        let request = Request::builder().uri("/vehicles").body(Body::empty()).unwrap();

        let response = tokio_test::assert_ok!(app.oneshot(request).await);

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(status_for(&Error::not_found("intervention", 1)), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::Config("unknown key".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&Error::IllegalTransition {
                entity: "intervention",
                from: "completed".into(),
                to: "on_site".into(),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&Error::RoadNetwork("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
