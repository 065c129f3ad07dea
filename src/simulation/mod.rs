//! Vehicle movement simulator.
//!
//! The [`Simulator`] owns the movement table: one [`MovementRecord`] per unit
//! in transit, keyed by unit id and rebuilt from persisted routes. Each tick
//! runs four phases in order:
//!
//! 1. **sync** the table with the store (units, routes, active assignments),
//!    requesting route repairs for under way units without a usable route;
//! 2. **advance** every record with the configured movement model and persist
//!    its progress and position;
//! 3. **arrivals**: flip unit, assignment and intervention status, or park a
//!    returning unit back at its base;
//! 4. **completions**: roll for every fully arrived intervention and release
//!    its units, optionally sending them home.
//!
//! Store and routing failures are logged and retried on the next tick; only
//! failing to read the fleet aborts a tick.

mod completion;
mod movement;
mod waypoint;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{MovementModelKind, SimulationTuning};
use crate::error::Result;
use crate::geo::{GeoPoint, haversine_meters};
use crate::model::{
    ActiveAssignment, AssignmentStatus, InterventionId, InterventionStatus, NewRoute, Route, Unit,
    UnitId, UnitStatus,
};
use crate::routing::{RoutingProvider, route_or_direct};
use crate::storage::Store;

pub use completion::{CompletionDraws, FixedDraw, RandomDraws, completion_percent, per_tick_probability};
pub use movement::{MovementRecord, advance_progress};
pub use waypoint::{advance_waypoint, arrival_slot};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub tracked: usize,
    pub moved: usize,
    pub repairs_requested: Vec<UnitId>,
    pub dropped: Vec<UnitId>,
    pub arrived: Vec<UnitId>,
    pub returned: Vec<UnitId>,
    pub completed: Vec<InterventionId>,
    pub returning: Vec<UnitId>,
}

/// Published view of one unit after a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleSnapshot {
    pub unit_id: UnitId,
    pub call_sign: String,
    pub status: UnitStatus,
    pub position: GeoPoint,
    pub intervention_id: Option<InterventionId>,
    pub progress_percent: Option<f64>,
    pub moving: bool,
}

pub struct Simulator<S, R, D> {
    store: Arc<S>,
    router: Arc<R>,
    draws: D,
    tuning: SimulationTuning,
    model: MovementModelKind,
    return_trips: bool,
    records: HashMap<UnitId, MovementRecord>,
    repair_gate: HashSet<UnitId>,
    repairs: Option<mpsc::Sender<UnitId>>,
    snapshot: watch::Sender<Vec<VehicleSnapshot>>,
}

impl<S: Store, R: RoutingProvider, D: CompletionDraws> Simulator<S, R, D> {
    pub fn new(store: Arc<S>, router: Arc<R>, draws: D) -> Self {
        let (snapshot, _rx) = watch::channel(Vec::new());
        Self {
            store,
            router,
            draws,
            tuning: SimulationTuning::default(),
            model: MovementModelKind::Progress,
            return_trips: true,
            records: HashMap::new(),
            repair_gate: HashSet::new(),
            repairs: None,
            snapshot,
        }
    }

    pub fn with_tuning(mut self, tuning: SimulationTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_model(mut self, model: MovementModelKind) -> Self {
        self.model = model;
        self
    }

    pub fn with_return_trips(mut self, enabled: bool) -> Self {
        self.return_trips = enabled;
        self
    }

    /// Send route-repair requests to `repairs`.
    pub fn with_repairs(mut self, repairs: mpsc::Sender<UnitId>) -> Self {
        self.repairs = Some(repairs);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<VehicleSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn record(&self, unit_id: UnitId) -> Option<&MovementRecord> {
        self.records.get(&unit_id)
    }

    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    /// Run one simulation step covering `delta_seconds`.
    pub async fn tick(&mut self, delta_seconds: f64) -> Result<TickReport> {
        let delta = if delta_seconds.is_finite() {
            delta_seconds.max(0.0)
        } else {
            0.0
        };
        let units = self.store.list_units().await?;
        let routes: HashMap<UnitId, Route> = self
            .store
            .list_routes()
            .await?
            .into_iter()
            .map(|r| (r.unit_id, r))
            .collect();
        let active: HashMap<UnitId, ActiveAssignment> = self
            .store
            .list_active_assignments()
            .await?
            .into_iter()
            .map(|a| (a.assignment.unit_id, a))
            .collect();

        let mut report = TickReport::default();
        self.sync(&units, &routes, &active, &mut report);
        self.advance(delta, &mut report).await;
        self.handle_arrivals(&mut report).await;
        self.check_completions(delta, &active, &mut report).await;
        report.tracked = self.records.len();
        self.publish(&units);
        Ok(report)
    }

    fn sync(
        &mut self,
        units: &[Unit],
        routes: &HashMap<UnitId, Route>,
        active: &HashMap<UnitId, ActiveAssignment>,
        report: &mut TickReport,
    ) {
        let known: HashSet<UnitId> = units.iter().map(|u| u.id).collect();
        let gone: Vec<UnitId> = self
            .records
            .keys()
            .filter(|id| !known.contains(id))
            .copied()
            .collect();
        for unit_id in gone {
            self.drop_record(unit_id, report);
        }

        for unit in units {
            let route = routes.get(&unit.id);
            let assignment = active.get(&unit.id);
            let assigned_to = assignment.map(|a| a.assignment.intervention_id);

            match unit.status {
                UnitStatus::UnderWay => match route {
                    Some(route)
                        if route.intervention_id.is_some() && route.intervention_id == assigned_to =>
                    {
                        self.repair_gate.remove(&unit.id);
                        self.track(route, assignment);
                    }
                    _ => {
                        if route.is_some() || self.records.contains_key(&unit.id) {
                            debug!(
                                unit_id = unit.id,
                                intervention_id = ?assigned_to,
                                "Discarding stale movement state"
                            );
                        }
                        self.drop_record(unit.id, report);
                        if assignment.is_some() {
                            self.request_repair(unit.id, report);
                        } else {
                            warn!(unit_id = unit.id, "Unit under way without an active assignment");
                        }
                    }
                },
                UnitStatus::Available => match route {
                    Some(route) if route.is_return_trip() => {
                        self.repair_gate.remove(&unit.id);
                        self.track(route, None);
                    }
                    _ => self.drop_record(unit.id, report),
                },
                UnitStatus::OnSite => {
                    let keep = self.records.get(&unit.id).is_some_and(|r| {
                        r.intervention_id.is_some() && r.intervention_id == assigned_to
                    });
                    if keep {
                        if let Some(record) = self.records.get_mut(&unit.id) {
                            record.assignment_id = assignment.map(|a| a.assignment.id);
                        }
                        continue;
                    }
                    match route {
                        Some(route)
                            if route.is_complete()
                                && route.intervention_id.is_some()
                                && route.intervention_id == assigned_to =>
                        {
                            info!(
                                unit_id = unit.id,
                                intervention_id = ?route.intervention_id,
                                "Recovering on-site unit"
                            );
                            self.track(route, assignment);
                        }
                        _ => self.drop_record(unit.id, report),
                    }
                }
                _ => self.drop_record(unit.id, report),
            }
        }
    }

    /// Ensure a record follows `route`, rebuilding it when the route changed.
    fn track(&mut self, route: &Route, assignment: Option<&ActiveAssignment>) {
        let current = self
            .records
            .get(&route.unit_id)
            .is_some_and(|r| r.revision == route.revision && r.intervention_id == route.intervention_id);
        if !current {
            let mut record = MovementRecord::from_route(route);
            if record.severity.is_none() {
                record.severity = assignment.and_then(|a| a.severity);
            }
            debug!(
                unit_id = route.unit_id,
                revision = route.revision,
                progress = record.progress_percent,
                "Tracking unit"
            );
            self.records.insert(route.unit_id, record);
        }
        if let Some(record) = self.records.get_mut(&route.unit_id) {
            record.assignment_id = assignment.map(|a| a.assignment.id);
        }
    }

    fn drop_record(&mut self, unit_id: UnitId, report: &mut TickReport) {
        if self.records.remove(&unit_id).is_some() {
            debug!(unit_id, "Dropped movement record");
            report.dropped.push(unit_id);
        }
    }

    /// Ask for a new route, at most once until the unit's route is seen again.
    fn request_repair(&mut self, unit_id: UnitId, report: &mut TickReport) {
        if !self.repair_gate.insert(unit_id) {
            return;
        }
        let Some(repairs) = &self.repairs else {
            debug!(unit_id, "No repair worker, leaving unit without a route");
            return;
        };
        match repairs.try_send(unit_id) {
            Ok(()) => {
                info!(unit_id, "Requested route repair");
                report.repairs_requested.push(unit_id);
            }
            Err(e) => {
                warn!(unit_id, error = %e, "Could not queue route repair");
                self.repair_gate.remove(&unit_id);
            }
        }
    }

    async fn advance(&mut self, delta: f64, report: &mut TickReport) {
        for record in self.records.values_mut().filter(|r| !r.is_arrived()) {
            let arrived = match self.model {
                MovementModelKind::Progress => advance_progress(record, delta),
                MovementModelKind::Waypoint => advance_waypoint(record, delta, &self.tuning),
            };
            report.moved += 1;

            if let Err(e) = self
                .store
                .update_route_progress(record.unit_id, record.revision, record.progress_percent, record.position)
                .await
            {
                warn!(
                    unit_id = record.unit_id,
                    progress = record.progress_percent,
                    error = %e,
                    "Failed to persist route progress"
                );
            }
            if let Err(e) = self.store.set_unit_location(record.unit_id, record.position).await {
                warn!(
                    unit_id = record.unit_id,
                    lat = record.position.lat,
                    lon = record.position.lon,
                    error = %e,
                    "Failed to persist unit location"
                );
            }
            if arrived {
                debug!(unit_id = record.unit_id, intervention_id = ?record.intervention_id, "Unit reached destination");
            }
        }
    }

    async fn handle_arrivals(&mut self, report: &mut TickReport) {
        let mut pending: Vec<UnitId> = self
            .records
            .values()
            .filter(|r| r.awaits_arrival_handling())
            .map(|r| r.unit_id)
            .collect();
        pending.sort_unstable();
        for unit_id in pending {
            let returning = self.records.get(&unit_id).is_some_and(|r| r.is_return_trip());
            if self.handle_arrival(unit_id).await {
                if returning {
                    report.returned.push(unit_id);
                } else {
                    report.arrived.push(unit_id);
                }
            }
        }
    }

    /// Apply an arrived record's status changes. Returns `true` only the
    /// first time the arrival goes through; a failed write is retried on the
    /// next call.
    pub async fn handle_arrival(&mut self, unit_id: UnitId) -> bool {
        let Some(record) = self.records.get(&unit_id) else {
            return false;
        };
        if !record.awaits_arrival_handling() {
            return false;
        }

        if record.is_return_trip() {
            let revision = record.revision;
            if let Err(e) = self.store.set_unit_status(unit_id, UnitStatus::AvailableHidden).await {
                warn!(unit_id, error = %e, "Failed to park returned unit");
                return false;
            }
            if let Err(e) = self.store.delete_route(unit_id, revision).await {
                warn!(unit_id, error = %e, "Failed to delete return route");
            }
            self.records.remove(&unit_id);
            info!(unit_id, "Unit back at base");
            return true;
        }

        let Some(intervention_id) = record.intervention_id else {
            return false;
        };
        let assignment_id = record.assignment_id;

        if self.model == MovementModelKind::Waypoint {
            let slot = self
                .records
                .values()
                .filter(|r| r.intervention_id == Some(intervention_id) && r.arrival_handled)
                .count();
            let center = record.destination();
            let parked = arrival_slot(&center, slot, &self.tuning);
            if let Err(e) = self.store.set_unit_location(unit_id, parked).await {
                warn!(unit_id, error = %e, "Failed to park unit on site");
            } else if let Some(record) = self.records.get_mut(&unit_id) {
                record.position = parked;
            }
        }

        let unit = self.store.set_unit_status(unit_id, UnitStatus::OnSite).await;
        let assignment = match assignment_id {
            Some(id) => self
                .store
                .set_assignment_status(id, AssignmentStatus::Arrived)
                .await
                .map(|_| ()),
            None => Ok(()),
        };
        let intervention = self
            .store
            .set_intervention_status(intervention_id, InterventionStatus::OnSite)
            .await;

        match (unit, assignment, intervention) {
            (Ok(_), Ok(()), Ok(_)) => {
                if let Some(record) = self.records.get_mut(&unit_id) {
                    record.arrival_handled = true;
                }
                info!(unit_id, intervention_id, "Unit on site");
                true
            }
            (unit, assignment, intervention) => {
                let error = [unit.err(), assignment.err(), intervention.err()]
                    .into_iter()
                    .flatten()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(unit_id, intervention_id, error = %error, "Arrival update failed, retrying next tick");
                false
            }
        }
    }

    async fn check_completions(
        &mut self,
        delta: f64,
        active: &HashMap<UnitId, ActiveAssignment>,
        report: &mut TickReport,
    ) {
        #[derive(Default)]
        struct Progress {
            on_site: usize,
            in_transit: usize,
            severity: Option<u8>,
        }

        let mut by_intervention: BTreeMap<InterventionId, Progress> = BTreeMap::new();
        for record in self.records.values() {
            let Some(intervention_id) = record.intervention_id else {
                continue;
            };
            let entry = by_intervention.entry(intervention_id).or_default();
            if record.arrival_handled {
                entry.on_site += 1;
            } else {
                entry.in_transit += 1;
            }
            entry.severity = entry.severity.or(record.severity);
        }

        for (intervention_id, progress) in by_intervention {
            if progress.on_site == 0 || progress.in_transit > 0 {
                continue;
            }
            let untracked = active.values().any(|a| {
                a.assignment.intervention_id == intervention_id
                    && a.assignment.status == AssignmentStatus::Dispatched
                    && !self.records.contains_key(&a.assignment.unit_id)
            });
            if untracked {
                continue;
            }

            let per_second = completion_percent(&self.tuning.completion, progress.on_site, progress.severity) / 100.0;
            let chance = per_tick_probability(per_second, delta);
            if self.draws.next_uniform() >= chance {
                continue;
            }

            match self.store.complete_intervention(intervention_id).await {
                Ok(Some(freed)) => {
                    self.records
                        .retain(|_, r| r.intervention_id != Some(intervention_id));
                    info!(intervention_id, units = freed.len(), "Intervention completed");
                    report.completed.push(intervention_id);
                    if self.return_trips {
                        for unit_id in freed {
                            match self.plan_return(unit_id).await {
                                Ok(true) => report.returning.push(unit_id),
                                Ok(false) => {}
                                Err(e) => warn!(unit_id, error = %e, "Failed to plan return trip"),
                            }
                        }
                    }
                }
                Ok(None) => {
                    debug!(intervention_id, "Intervention no longer on site, skipping completion");
                }
                Err(e) => warn!(intervention_id, error = %e, "Failed to complete intervention"),
            }
        }
    }

    /// Persist a route home for a released unit. Returns `true` when a return
    /// trip was started; a unit already at its base is parked directly.
    async fn plan_return(&self, unit_id: UnitId) -> Result<bool> {
        let Some(unit) = self.store.get_unit(unit_id).await? else {
            return Ok(false);
        };
        let Some(home) = unit.home_base.as_deref() else {
            return Ok(false);
        };
        let bases = self.store.list_bases().await?;
        let Some(base) = bases.into_iter().find(|b| b.name == home) else {
            warn!(unit_id, home_base = home, "Unknown home base, unit stays in place");
            return Ok(false);
        };

        if haversine_meters(&unit.location, &base.location) <= self.tuning.arrival_threshold_meters {
            self.store.set_unit_status(unit_id, UnitStatus::AvailableHidden).await?;
            return Ok(false);
        }

        let (route, direct_route) = route_or_direct(
            self.router.as_ref(),
            unit.location,
            base.location,
            self.tuning.fallback_speed_mps,
        )
        .await;
        self.store
            .save_route(&NewRoute {
                unit_id,
                intervention_id: None,
                geometry: route.geometry,
                length_meters: route.length_meters,
                duration_seconds: route.duration_seconds,
                origin: unit.location,
                destination: base.location,
            })
            .await?;
        info!(unit_id, home_base = home, direct_route, "Unit returning to base");
        Ok(true)
    }

    fn publish(&self, units: &[Unit]) {
        let vehicles = units
            .iter()
            .map(|unit| match self.records.get(&unit.id) {
                Some(record) => VehicleSnapshot {
                    unit_id: unit.id,
                    call_sign: unit.call_sign.clone(),
                    status: if record.arrival_handled {
                        UnitStatus::OnSite
                    } else if record.is_return_trip() {
                        UnitStatus::Available
                    } else {
                        UnitStatus::UnderWay
                    },
                    position: record.position,
                    intervention_id: record.intervention_id,
                    progress_percent: Some(record.progress_percent),
                    moving: !record.is_arrived(),
                },
                None => VehicleSnapshot {
                    unit_id: unit.id,
                    call_sign: unit.call_sign.clone(),
                    status: unit.status,
                    position: unit.location,
                    intervention_id: None,
                    progress_percent: None,
                    moving: false,
                },
            })
            .collect();
        self.snapshot.send_replace(vehicles);
    }

    /// Tick every `period` with the measured elapsed time.
    pub async fn run(mut self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();
        loop {
            interval.tick().await;
            let now = Instant::now();
            let delta = now.duration_since(last).as_secs_f64();
            last = now;
            match self.tick(delta).await {
                Ok(report) => {
                    if !report.arrived.is_empty() || !report.completed.is_empty() {
                        debug!(
                            tracked = report.tracked,
                            arrived = report.arrived.len(),
                            completed = report.completed.len(),
                            "Tick"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Simulation tick failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssignmentRole, Base, DecisionMode, Intervention, NewIncident, NewUnit};
    use crate::routing::RoutingBackend;
    use crate::storage::{Claim, StatusSink, Storage};

    const BASE: GeoPoint = GeoPoint::new(45.7421, 4.8158);
    const INCIDENT: GeoPoint = GeoPoint::new(45.7521, 4.8158);

    async fn store() -> Arc<Storage> {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage
            .insert_base(&Base::new("Lyon Confluence", BASE.lat, BASE.lon))
            .await
            .unwrap();
        Arc::new(storage)
    }

    async fn unit(store: &Storage, call_sign: &str) -> Unit {
        store
            .insert_unit(&NewUnit {
                call_sign: call_sign.to_string(),
                unit_type_code: "VSAV".to_string(),
                home_base: Some("Lyon Confluence".to_string()),
                location: BASE,
            })
            .await
            .unwrap()
    }

    async fn intervention(store: &Storage, severity: u8) -> Intervention {
        let incident = store
            .create_incident(&NewIncident {
                type_code: "FIRE".to_string(),
                severity,
                required_unit_types: Vec::new(),
                location: INCIDENT,
            })
            .await
            .unwrap();
        store
            .create_intervention(incident.id, i32::from(severity), DecisionMode::AutoSuggested)
            .await
            .unwrap()
    }

    async fn claim(store: &Storage, unit: &Unit, intervention: &Intervention) {
        store
            .claim_unit(&Claim {
                unit_id: unit.id,
                observed: UnitStatus::Available,
                intervention_id: intervention.id,
                role: AssignmentRole::Lead,
                preempt: None,
            })
            .await
            .unwrap()
            .unwrap();
    }

    /// A straight 300 s route from the unit to the incident.
    async fn save_route(store: &Storage, unit: &Unit, intervention: &Intervention) -> Route {
        store
            .save_route(&NewRoute {
                unit_id: unit.id,
                intervention_id: Some(intervention.id),
                geometry: vec![unit.location, INCIDENT],
                length_meters: haversine_meters(&unit.location, &INCIDENT),
                duration_seconds: 300.0,
                origin: unit.location,
                destination: INCIDENT,
            })
            .await
            .unwrap()
    }

    async fn dispatch(store: &Storage, unit: &Unit, intervention: &Intervention) {
        claim(store, unit, intervention).await;
        save_route(store, unit, intervention).await;
    }

    fn simulator(store: Arc<Storage>, draw: f64) -> Simulator<Storage, RoutingBackend, FixedDraw> {
        Simulator::new(store, Arc::new(RoutingBackend::Direct), FixedDraw(draw))
    }

    #[tokio::test]
    async fn test_unit_arrives_after_ten_ticks() {
        let store = store().await;
        let vsav = unit(&store, "VSAV-1").await;
        let target = intervention(&store, 3).await;
        dispatch(&store, &vsav, &target).await;

        let mut sim = simulator(store.clone(), 1.0);
        let mut arrivals = Vec::new();
        for tick in 1..=10 {
            let report = sim.tick(30.0).await.unwrap();
            assert_eq!(report.tracked, 1);
            if !report.arrived.is_empty() {
                arrivals.push(tick);
            }
            let route = store.get_route(vsav.id).await.unwrap().unwrap();
            assert!((route.progress_percent - 10.0 * tick as f64).abs() < 1e-6);
        }
        assert_eq!(arrivals, vec![10]);

        let report = sim.tick(30.0).await.unwrap();
        assert!(report.arrived.is_empty());
        assert_eq!(store.get_unit(vsav.id).await.unwrap().unwrap().status, UnitStatus::OnSite);
        let intervention = store.get_intervention(target.id).await.unwrap().unwrap();
        assert_eq!(intervention.status, InterventionStatus::OnSite);
        let assignments = store.list_assignments(target.id).await.unwrap();
        assert_eq!(assignments[0].status, AssignmentStatus::Arrived);
    }

    #[tokio::test]
    async fn test_arrival_is_idempotent() {
        let store = store().await;
        let vsav = unit(&store, "VSAV-1").await;
        let target = intervention(&store, 3).await;
        dispatch(&store, &vsav, &target).await;

        let mut sim = simulator(store.clone(), 1.0);
        sim.tick(600.0).await.unwrap();
        assert!(sim.record(vsav.id).unwrap().arrival_handled);
        assert!(!sim.handle_arrival(vsav.id).await);
        assert!(!store.set_unit_status(vsav.id, UnitStatus::OnSite).await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_releases_and_returns_units() {
        let store = store().await;
        let vsav = unit(&store, "VSAV-1").await;
        let target = intervention(&store, 3).await;
        dispatch(&store, &vsav, &target).await;

        let mut sim = simulator(store.clone(), 0.0);
        let report = sim.tick(600.0).await.unwrap();
        assert_eq!(report.arrived, vec![vsav.id]);
        assert_eq!(report.completed, vec![target.id]);
        assert_eq!(report.returning, vec![vsav.id]);
        assert!(sim.record(vsav.id).is_none());

        let intervention = store.get_intervention(target.id).await.unwrap().unwrap();
        assert_eq!(intervention.status, InterventionStatus::Completed);
        let back = store.get_route(vsav.id).await.unwrap().unwrap();
        assert!(back.is_return_trip());

        // The return trip is picked up and parks the unit.
        let report = sim.tick(600.0).await.unwrap();
        assert_eq!(report.returned, vec![vsav.id]);
        let parked = store.get_unit(vsav.id).await.unwrap().unwrap();
        assert_eq!(parked.status, UnitStatus::AvailableHidden);
        assert!(store.get_route(vsav.id).await.unwrap().is_none());
        assert_eq!(sim.tracked(), 0);
    }

    #[tokio::test]
    async fn test_never_completes_with_high_draw() {
        let store = store().await;
        let vsav = unit(&store, "VSAV-1").await;
        let target = intervention(&store, 1).await;
        dispatch(&store, &vsav, &target).await;

        let mut sim = simulator(store.clone(), 1.0);
        for _ in 0..5 {
            assert!(sim.tick(600.0).await.unwrap().completed.is_empty());
        }
        assert_eq!(sim.tracked(), 1);
    }

    #[tokio::test]
    async fn test_completion_waits_for_units_in_transit() {
        let store = store().await;
        let first = unit(&store, "VSAV-1").await;
        let second = unit(&store, "VSAV-2").await;
        let target = intervention(&store, 2).await;
        dispatch(&store, &first, &target).await;

        let mut sim = simulator(store.clone(), 0.0);
        sim.tick(150.0).await.unwrap();
        dispatch(&store, &second, &target).await;
        let report = sim.tick(150.0).await.unwrap();
        assert_eq!(report.arrived, vec![first.id]);
        assert!(report.completed.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_intervention_drops_record() {
        let store = store().await;
        let vsav = unit(&store, "VSAV-1").await;
        let target = intervention(&store, 3).await;
        dispatch(&store, &vsav, &target).await;

        let mut sim = simulator(store.clone(), 1.0);
        sim.tick(30.0).await.unwrap();
        assert_eq!(sim.tracked(), 1);

        store.cancel_intervention(target.id).await.unwrap();
        let report = sim.tick(30.0).await.unwrap();
        assert_eq!(report.dropped, vec![vsav.id]);
        assert_eq!(sim.tracked(), 0);
    }

    #[tokio::test]
    async fn test_missing_route_requests_one_repair() {
        let store = store().await;
        let vsav = unit(&store, "VSAV-1").await;
        let target = intervention(&store, 3).await;
        claim(&store, &vsav, &target).await;

        let (tx, mut rx) = mpsc::channel(8);
        let mut sim = simulator(store.clone(), 1.0).with_repairs(tx);
        assert_eq!(sim.tick(1.0).await.unwrap().repairs_requested, vec![vsav.id]);
        assert!(sim.tick(1.0).await.unwrap().repairs_requested.is_empty());
        assert_eq!(rx.try_recv().unwrap(), vsav.id);
        assert!(rx.try_recv().is_err());

        // Once a route shows up the gate reopens.
        let route = save_route(&store, &vsav, &target).await;
        assert!(sim.tick(1.0).await.unwrap().repairs_requested.is_empty());
        assert_eq!(sim.tracked(), 1);
        assert!(store.delete_route(vsav.id, route.revision).await.unwrap());
        let report = sim.tick(1.0).await.unwrap();
        assert_eq!(report.dropped, vec![vsav.id]);
        assert_eq!(report.repairs_requested, vec![vsav.id]);
    }

    #[tokio::test]
    async fn test_restart_recovers_on_site_unit() {
        let store = store().await;
        let vsav = unit(&store, "VSAV-1").await;
        let target = intervention(&store, 3).await;
        dispatch(&store, &vsav, &target).await;

        let mut before = simulator(store.clone(), 1.0);
        before.tick(600.0).await.unwrap();
        drop(before);

        let mut after = simulator(store.clone(), 0.0);
        let report = after.tick(1.0).await.unwrap();
        assert_eq!(report.completed, vec![target.id]);
    }

    #[tokio::test]
    async fn test_waypoint_model_parks_units_apart() {
        let store = store().await;
        let first = unit(&store, "VSAV-1").await;
        let second = unit(&store, "VSAV-2").await;
        let target = intervention(&store, 2).await;
        dispatch(&store, &first, &target).await;
        dispatch(&store, &second, &target).await;

        let mut sim = simulator(store.clone(), 1.0).with_model(MovementModelKind::Waypoint);
        let mut ticks = 0;
        while sim.tick(1.0).await.unwrap().arrived.is_empty() {
            ticks += 1;
            assert!(ticks < 30);
        }
        let a = store.get_unit(first.id).await.unwrap().unwrap().location;
        let b = store.get_unit(second.id).await.unwrap().unwrap().location;
        assert!(haversine_meters(&a, &b) > 1.0);
        assert!(haversine_meters(&a, &INCIDENT) < 30.0);
    }

    #[tokio::test]
    async fn test_snapshot_is_published() {
        let store = store().await;
        let vsav = unit(&store, "VSAV-1").await;
        let target = intervention(&store, 3).await;
        dispatch(&store, &vsav, &target).await;

        let mut sim = simulator(store.clone(), 1.0);
        let rx = sim.subscribe();
        sim.tick(30.0).await.unwrap();
        let vehicles = rx.borrow().clone();
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].status, UnitStatus::UnderWay);
        assert!(vehicles[0].moving);
        assert_eq!(vehicles[0].intervention_id, Some(target.id));
    }
}
