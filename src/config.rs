//! Engine configuration.
//!
//! Process-level settings come from `FLEET_*` environment variables and are
//! fixed for the lifetime of the process. Dispatch weights are different: they
//! live in the store's `dispatch_config` table and are published through a
//! [`ConfigHandle`] so that every dispatch reads the latest values.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::dispatch::SelectionStrategy;
use crate::error::{Error, Result};
use crate::model::{Base, NewUnit};
use crate::zones::ZonePolicy;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DATABASE_URL: &str = "sqlite:fleet.db?mode=rwc";

/// Which movement model drives the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementModelKind {
    /// Advance along the route by elapsed time over estimated duration.
    Progress,
    /// Fixed step along waypoints with meters-based arrival.
    Waypoint,
}

impl FromStr for MovementModelKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "progress" => Ok(MovementModelKind::Progress),
            "waypoint" => Ok(MovementModelKind::Waypoint),
            other => Err(Error::Config(format!("unknown movement model: {other}"))),
        }
    }
}

/// Live-tunable dispatch weights and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispatchWeights {
    pub travel_time_weight: f64,
    pub coverage_penalty_weight: f64,
    pub preemption_delta_weight: f64,
    pub reassignment_base_cost: f64,
    pub min_reserve_per_base: u32,
    pub preemption_severity_threshold: i32,
    pub max_candidates_per_dispatch: usize,
}

impl Default for DispatchWeights {
    fn default() -> Self {
        Self {
            travel_time_weight: 0.7,
            coverage_penalty_weight: 0.3,
            preemption_delta_weight: -100.0,
            reassignment_base_cost: 60.0,
            min_reserve_per_base: 1,
            preemption_severity_threshold: 2,
            max_candidates_per_dispatch: 10,
        }
    }
}

impl DispatchWeights {
    /// Keys understood by [`DispatchWeights::set`], as stored in `dispatch_config`.
    pub const KEYS: [&'static str; 7] = [
        "weight_travel_time",
        "weight_coverage_penalty",
        "weight_preemption_delta",
        "reassignment_base_cost",
        "min_reserve_per_base",
        "preemption_severity_threshold",
        "max_candidates_per_dispatch",
    ];

    /// Apply one key/value pair. Integer settings are rounded; negative
    /// reserves and candidate caps are rejected.
    pub fn set(&mut self, key: &str, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(Error::Config(format!("{key} must be finite")));
        }
        match key {
            "weight_travel_time" => self.travel_time_weight = value,
            "weight_coverage_penalty" => self.coverage_penalty_weight = value,
            "weight_preemption_delta" => self.preemption_delta_weight = value,
            "reassignment_base_cost" => self.reassignment_base_cost = value,
            "min_reserve_per_base" => {
                if value < 0.0 {
                    return Err(Error::Config(format!("{key} must not be negative")));
                }
                self.min_reserve_per_base = value.round() as u32;
            }
            "preemption_severity_threshold" => {
                self.preemption_severity_threshold = value.round() as i32;
            }
            "max_candidates_per_dispatch" => {
                if value < 1.0 {
                    return Err(Error::Config(format!("{key} must be at least 1")));
                }
                self.max_candidates_per_dispatch = value.round() as usize;
            }
            other => return Err(Error::Config(format!("unknown key: {other}"))),
        }
        Ok(())
    }

    /// Build weights from stored rows. Unknown keys and invalid values are
    /// skipped so one bad row never blocks the rest.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let mut weights = Self::default();
        for (key, value) in entries {
            if let Err(e) = weights.set(key, value) {
                tracing::warn!(key, value, error = %e, "Ignoring dispatch config entry");
            }
        }
        weights
    }

    /// All settings as key/value pairs, in [`DispatchWeights::KEYS`] order.
    pub fn entries(&self) -> Vec<(&'static str, f64)> {
        vec![
            (Self::KEYS[0], self.travel_time_weight),
            (Self::KEYS[1], self.coverage_penalty_weight),
            (Self::KEYS[2], self.preemption_delta_weight),
            (Self::KEYS[3], self.reassignment_base_cost),
            (Self::KEYS[4], f64::from(self.min_reserve_per_base)),
            (Self::KEYS[5], f64::from(self.preemption_severity_threshold)),
            (Self::KEYS[6], self.max_candidates_per_dispatch as f64),
        ]
    }
}

/// Shared, live view of the current [`DispatchWeights`].
#[derive(Clone)]
pub struct ConfigHandle {
    tx: watch::Sender<DispatchWeights>,
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(DispatchWeights::default())
    }
}

impl ConfigHandle {
    pub fn new(weights: DispatchWeights) -> Self {
        let (tx, _rx) = watch::channel(weights);
        Self { tx }
    }

    /// Snapshot of the weights at call time.
    pub fn current(&self) -> DispatchWeights {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DispatchWeights> {
        self.tx.subscribe()
    }

    /// Replace all weights.
    pub fn publish(&self, weights: DispatchWeights) {
        self.tx.send_replace(weights);
    }
}

/// Constants used by the dispatch decision service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchTuning {
    /// Distance between consecutive convoy members along the shared route.
    pub convoy_spacing_meters: f64,
    /// Speed used to time a straight-line fallback route.
    pub fallback_speed_mps: f64,
    /// Speed used to estimate candidate travel time.
    pub candidate_speed_mps: f64,
    /// Ratio of road distance to straight-line distance for estimates.
    pub detour_factor: f64,
    /// Pause between successive assignment writes.
    pub assign_throttle: Duration,
}

impl Default for DispatchTuning {
    fn default() -> Self {
        Self {
            convoy_spacing_meters: 30.0,
            fallback_speed_mps: 13.9,
            candidate_speed_mps: 13.9,
            detour_factor: 1.3,
            assign_throttle: Duration::from_millis(300),
        }
    }
}

/// Probabilistic completion curve, in percent per second.
///
/// `p = base + (units - 1) * per_unit - (severity - 3) * per_severity`,
/// clamped to `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionCurve {
    pub base_percent: f64,
    pub per_extra_unit_percent: f64,
    pub per_severity_percent: f64,
    pub min_percent: f64,
    pub max_percent: f64,
}

impl Default for CompletionCurve {
    fn default() -> Self {
        Self {
            base_percent: 2.3,
            per_extra_unit_percent: 2.2,
            per_severity_percent: 2.2,
            min_percent: 0.1,
            max_percent: 99.0,
        }
    }
}

/// Constants used by the movement simulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationTuning {
    pub completion: CompletionCurve,
    /// Distance moved per second by the waypoint model.
    pub waypoint_step_meters: f64,
    /// Distance under which a waypoint counts as reached.
    pub waypoint_threshold_meters: f64,
    /// Distance under which the destination counts as reached.
    pub arrival_threshold_meters: f64,
    /// Radius of the first ring of arrival slots around an incident.
    pub arrival_ring_radius_meters: f64,
    /// Units per arrival ring.
    pub arrival_ring_capacity: usize,
    /// Speed used to time routes computed by the repair worker.
    pub fallback_speed_mps: f64,
}

impl Default for SimulationTuning {
    fn default() -> Self {
        Self {
            completion: CompletionCurve::default(),
            waypoint_step_meters: 111.0,
            waypoint_threshold_meters: 25.0,
            arrival_threshold_meters: 30.0,
            arrival_ring_radius_meters: 25.0,
            arrival_ring_capacity: 8,
            fallback_speed_mps: 13.9,
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    pub database_url: String,
    pub road_network: Option<PathBuf>,
    pub routing_url: Option<String>,
    pub routing_connect_timeout: Duration,
    pub routing_timeout: Duration,
    pub fleet_file: Option<PathBuf>,
    pub tick_interval: Duration,
    pub dispatch_interval: Duration,
    pub strategy: SelectionStrategy,
    pub movement_model: MovementModelKind,
    pub return_trips: bool,
    pub seed: Option<u64>,
    pub dispatch: DispatchTuning,
    pub simulation: SimulationTuning,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            road_network: None,
            routing_url: None,
            routing_connect_timeout: Duration::from_secs(10),
            routing_timeout: Duration::from_secs(30),
            fleet_file: None,
            tick_interval: Duration::from_millis(1000),
            dispatch_interval: Duration::from_secs(30),
            strategy: SelectionStrategy::Simple,
            movement_model: MovementModelKind::Progress,
            return_trips: true,
            seed: None,
            dispatch: DispatchTuning::default(),
            simulation: SimulationTuning::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(port) = parse_var(&lookup, "FLEET_PORT")? {
            config.port = port;
        }
        if let Some(url) = lookup("FLEET_DATABASE_URL") {
            config.database_url = url;
        }
        config.road_network = lookup("FLEET_ROAD_NETWORK").map(PathBuf::from);
        config.routing_url = lookup("FLEET_ROUTING_URL").filter(|u| !u.is_empty());
        config.fleet_file = lookup("FLEET_FLEET_FILE").map(PathBuf::from);
        if let Some(secs) = parse_var::<u64>(&lookup, "FLEET_ROUTING_CONNECT_TIMEOUT_SECS")? {
            config.routing_connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "FLEET_ROUTING_TIMEOUT_SECS")? {
            if secs == 0 {
                return Err(Error::Config(
                    "FLEET_ROUTING_TIMEOUT_SECS must be positive".to_string(),
                ));
            }
            config.routing_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "FLEET_TICK_MS")? {
            if ms == 0 {
                return Err(Error::Config("FLEET_TICK_MS must be positive".to_string()));
            }
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "FLEET_DISPATCH_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(Error::Config(
                    "FLEET_DISPATCH_INTERVAL_SECS must be positive".to_string(),
                ));
            }
            config.dispatch_interval = Duration::from_secs(secs);
        }
        if let Some(strategy) = lookup("FLEET_STRATEGY") {
            config.strategy = strategy.parse()?;
        }
        if let Some(model) = lookup("FLEET_MOVEMENT_MODEL") {
            config.movement_model = model.parse()?;
        }
        if let Some(flag) = lookup("FLEET_RETURN_TRIPS") {
            config.return_trips = parse_bool("FLEET_RETURN_TRIPS", &flag)?;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FLEET_ASSIGN_THROTTLE_MS")? {
            config.dispatch.assign_throttle = Duration::from_millis(ms);
        }
        config.seed = parse_var(&lookup, "FLEET_SEED")?;

        Ok(config)
    }
}

/// Bases, zone preferences and units used to seed an empty store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetFile {
    pub bases: Vec<Base>,
    #[serde(default)]
    pub priorities: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub units: Vec<NewUnit>,
}

impl FleetFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The Lyon stations, two VSAV and one FPT each.
    pub fn lyon() -> Self {
        let policy = ZonePolicy::lyon();
        let mut units = Vec::new();
        for (i, base) in policy.bases().iter().enumerate() {
            for (kind, n) in [("VSAV", 1), ("VSAV", 2), ("FPT", 1)] {
                units.push(NewUnit {
                    call_sign: format!("{kind}-{}{n}", i + 1),
                    unit_type_code: kind.to_string(),
                    home_base: Some(base.name.clone()),
                    location: base.location,
                });
            }
        }
        Self {
            bases: policy.bases().to_vec(),
            priorities: policy.priorities().clone(),
            units,
        }
    }

    pub fn zone_policy(&self) -> ZonePolicy {
        let mut policy = ZonePolicy::new(self.bases.clone());
        for (zone, order) in &self.priorities {
            let order: Vec<&str> = order.iter().map(String::as_str).collect();
            policy = policy.with_priority(zone.clone(), &order);
        }
        policy
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key}: cannot parse {raw:?}"))),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key}: cannot parse {raw:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.dispatch_interval, Duration::from_secs(30));
        assert_eq!(config.strategy, SelectionStrategy::Simple);
        assert_eq!(config.movement_model, MovementModelKind::Progress);
        assert!(config.return_trips);
        assert!(config.seed.is_none());
        assert!(config.routing_url.is_none());
        assert_eq!(config.routing_connect_timeout, Duration::from_secs(10));
        assert_eq!(config.routing_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("FLEET_PORT", "8088"),
            ("FLEET_TICK_MS", "250"),
            ("FLEET_STRATEGY", "scored"),
            ("FLEET_MOVEMENT_MODEL", "waypoint"),
            ("FLEET_RETURN_TRIPS", "off"),
            ("FLEET_ASSIGN_THROTTLE_MS", "0"),
            ("FLEET_SEED", "42"),
            ("FLEET_ROUTING_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.routing_timeout, Duration::from_secs(5));
        assert_eq!(config.port, 8088);
        assert_eq!(config.tick_interval, Duration::from_millis(250));
        assert_eq!(config.strategy, SelectionStrategy::Scored);
        assert_eq!(config.movement_model, MovementModelKind::Waypoint);
        assert!(!config.return_trips);
        assert_eq!(config.dispatch.assign_throttle, Duration::ZERO);
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[("FLEET_PORT", "http")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("FLEET_TICK_MS", "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("FLEET_STRATEGY", "greedy")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("FLEET_RETURN_TRIPS", "maybe")])).is_err());
    }

    #[test]
    fn test_weights_set_and_entries() {
        let mut weights = DispatchWeights::default();
        weights.set("weight_travel_time", 1.0).unwrap();
        weights.set("max_candidates_per_dispatch", 4.0).unwrap();
        assert_eq!(weights.travel_time_weight, 1.0);
        assert_eq!(weights.max_candidates_per_dispatch, 4);
        assert!(weights.set("weight_bananas", 1.0).is_err());
        assert!(weights.set("min_reserve_per_base", -1.0).is_err());
        assert!(weights.set("weight_travel_time", f64::NAN).is_err());

        let entries = weights.entries();
        assert_eq!(entries.len(), DispatchWeights::KEYS.len());
        assert_eq!(entries[0], ("weight_travel_time", 1.0));
    }

    #[test]
    fn test_from_entries_skips_unknown_keys() {
        let weights = DispatchWeights::from_entries([
            ("weight_coverage_penalty", 0.5),
            ("legacy_key", 9.0),
        ]);
        assert_eq!(weights.coverage_penalty_weight, 0.5);
        assert_eq!(weights.travel_time_weight, 0.7);
    }

    #[test]
    fn test_fleet_file_parsing() {
        let fleet: FleetFile = serde_json::from_str(
            r#"{
                "bases": [
                    {"name": "North", "location": {"lat": 46.0, "lon": 5.0}},
                    {"name": "South", "location": {"lat": 45.0, "lon": 5.0}}
                ],
                "priorities": {"North": ["South", "North"]},
                "units": [
                    {"call_sign": "N1", "unit_type_code": "VSAV", "home_base": "North",
                     "location": {"lat": 46.0, "lon": 5.0}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            fleet.units,
            vec![NewUnit {
                call_sign: "N1".to_string(),
                unit_type_code: "VSAV".to_string(),
                home_base: Some("North".to_string()),
                location: GeoPoint::new(46.0, 5.0),
            }]
        );
        let order = fleet.zone_policy().priority_order(&GeoPoint::new(46.0, 5.0));
        assert_eq!(order, vec!["South", "North"]);
    }

    #[test]
    fn test_lyon_fleet_matches_zone_policy() {
        let fleet = FleetFile::lyon();
        assert_eq!(fleet.bases.len(), 4);
        assert_eq!(fleet.units.len(), 12);
        assert_eq!(fleet.zone_policy(), ZonePolicy::lyon());
    }

    #[tokio::test]
    async fn test_config_handle_publishes_updates() {
        let handle = ConfigHandle::default();
        let mut rx = handle.subscribe();
        let mut weights = handle.current();
        weights.set("reassignment_base_cost", 90.0).unwrap();
        handle.publish(weights);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().reassignment_base_cost, 90.0);
        assert_eq!(handle.current().reassignment_base_cost, 90.0);
    }
}
