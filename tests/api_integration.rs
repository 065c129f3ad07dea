//! Integration tests for the Fleet Dispatch control surface.
//!
//! These tests verify the full request/response cycle through the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{Value, json};

use fleet_dispatch::api::{self, AppState};
use fleet_dispatch::config::{ConfigHandle, DispatchTuning};
use fleet_dispatch::dispatch::Dispatcher;
use fleet_dispatch::geo::GeoPoint;
use fleet_dispatch::model::NewUnit;
use fleet_dispatch::routing::{CachedRouter, RoutingBackend};
use fleet_dispatch::simulation::{FixedDraw, Simulator};
use fleet_dispatch::storage::{Storage, Store};
use fleet_dispatch::zones::LYON_CONFLUENCE;

type TestSimulator = Simulator<Storage, CachedRouter<RoutingBackend>, FixedDraw>;

async fn create_test_server() -> (TestServer, TestSimulator) {
    let storage = Arc::new(Storage::new("sqlite::memory:").await.unwrap());
    for n in 1..=3 {
        storage
            .insert_unit(&NewUnit {
                call_sign: format!("VSAV-C{n}"),
                unit_type_code: "VSAV".to_string(),
                home_base: Some(LYON_CONFLUENCE.to_string()),
                location: GeoPoint::new(45.7421, 4.8158),
            })
            .await
            .unwrap();
    }

    let router = Arc::new(CachedRouter::new(RoutingBackend::Direct));
    let dispatcher = Dispatcher::new(storage.clone(), router.clone(), ConfigHandle::default())
        .with_tuning(DispatchTuning {
            assign_throttle: Duration::ZERO,
            ..DispatchTuning::default()
        });
    let simulator = Simulator::new(storage, router, FixedDraw(1.0));

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        vehicles: simulator.subscribe(),
    };

    (TestServer::new(api::router(state)).unwrap(), simulator)
}

fn incident(severity: u8) -> Value {
    json!({
        "type_code": "FIRE",
        "severity": severity,
        "required_unit_types": ["VSAV"],
        "location": {"lat": 45.7500, "lon": 4.8300}
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _) = create_test_server().await;

    let response = server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_post_incident_dispatches_by_severity() {
    let (server, _) = create_test_server().await;

    let response = server.post("/incidents").json(&incident(2)).await;

    response.assert_status(StatusCode::CREATED);
    let body: Value = response.json();
    assert_eq!(body["intervention"]["status"], "created");
    assert_eq!(body["intervention"]["priority"], 2);
    let assignments = body["report"]["assignments"].as_array().unwrap();
    assert_eq!(assignments.len(), 2);
    assert_eq!(assignments[0]["role"], "lead");
    assert_eq!(assignments[1]["role"], "support");
    assert_eq!(assignments[0]["direct_route"], true);
}

#[tokio::test]
async fn test_dispatch_covers_only_the_shortfall() {
    let (server, _) = create_test_server().await;

    let opened: Value = server.post("/incidents").json(&incident(5)).await.json();
    assert_eq!(opened["report"]["assignments"].as_array().unwrap().len(), 3);
    let id = opened["intervention"]["id"].as_i64().unwrap();

    // The whole fleet is already committed.
    let response = server.post(&format!("/dispatch/{id}")).await;

    response.assert_status_ok();
    let report: Value = response.json();
    assert_eq!(report["units_needed"], 2);
    assert!(report["assignments"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_dispatch_unknown_intervention() {
    let (server, _) = create_test_server().await;

    let response = server.post("/dispatch/999").await;

    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_candidates_preview() {
    let (server, _) = create_test_server().await;

    let opened: Value = server.post("/incidents").json(&incident(1)).await.json();
    let id = opened["intervention"]["id"].as_i64().unwrap();

    let response = server.get(&format!("/interventions/{id}/candidates")).await;

    response.assert_status_ok();
    let candidates: Vec<Value> = response.json();
    // The dispatched unit is already on this intervention.
    assert_eq!(candidates.len(), 2);
    assert!(candidates.iter().all(|c| c["disqualified"] == false));
    assert!(candidates.iter().all(|c| c["type_match"] == true));

    server
        .get("/interventions/999/candidates")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_intervention() {
    let (server, _) = create_test_server().await;

    let opened: Value = server.post("/incidents").json(&incident(2)).await.json();
    let id = opened["intervention"]["id"].as_i64().unwrap();

    let response = server.post(&format!("/interventions/{id}/cancel")).await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["intervention_id"], id);
    assert_eq!(body["freed_units"].as_array().unwrap().len(), 2);

    // The freed units can be sent elsewhere right away.
    let next: Value = server.post("/incidents").json(&incident(3)).await.json();
    assert_eq!(next["report"]["assignments"].as_array().unwrap().len(), 3);

    let again: Value = server.post(&format!("/interventions/{id}/cancel")).await.json();
    assert!(again["freed_units"].as_array().unwrap().is_empty());

    server
        .post("/interventions/999/cancel")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_vehicles_follow_simulator_ticks() {
    let (server, mut simulator) = create_test_server().await;

    let vehicles: Vec<Value> = server.get("/vehicles").await.json();
    assert!(vehicles.is_empty());

    server.post("/incidents").json(&incident(1)).await;
    simulator.tick(1.0).await.unwrap();

    let vehicles: Vec<Value> = server.get("/vehicles").await.json();
    let moving: Vec<&Value> = vehicles.iter().filter(|v| v["moving"] == true).collect();
    assert_eq!(moving.len(), 1);
    assert_eq!(moving[0]["status"], "under_way");
}

#[tokio::test]
async fn test_config_roundtrip() {
    let (server, _) = create_test_server().await;

    let config: Value = server.get("/dispatch/config").await.json();
    assert_eq!(config["weight_travel_time"], 0.7);
    assert_eq!(config["max_candidates_per_dispatch"], 10.0);

    let response = server
        .put("/dispatch/config")
        .json(&json!({"key": "weight_travel_time", "value": 1.5}))
        .await;
    response.assert_status_ok();
    let updated: Value = response.json();
    assert_eq!(updated["weight_travel_time"], 1.5);

    // The persisted value survives a reload.
    let reloaded: Value = server.post("/refresh").await.json();
    assert_eq!(reloaded["weight_travel_time"], 1.5);
}

#[tokio::test]
async fn test_config_rejects_unknown_key() {
    let (server, _) = create_test_server().await;

    let response = server
        .put("/dispatch/config")
        .json(&json!({"key": "weight_luck", "value": 1.0}))
        .await;

    response.assert_status(StatusCode::BAD_REQUEST);
}
