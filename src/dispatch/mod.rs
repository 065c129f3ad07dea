//! Dispatch decision service.
//!
//! A [`Dispatcher`] turns an intervention's staffing shortfall into
//! assignments: it selects units with the configured [`SelectionStrategy`],
//! groups them into convoys per home base, routes each convoy once and
//! persists a staggered copy of the route for every member. It never touches
//! the simulator's movement table; the simulator picks the new routes up on
//! its next sync.

mod convoy;
mod selection;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigHandle, DispatchTuning, DispatchWeights};
use crate::error::{Error, Result};
use crate::lifecycle::{Lifecycle, Transition};
use crate::model::{
    AssignmentId, AssignmentRole, DecisionMode, Incident, Intervention, InterventionId,
    InterventionStatus, NewIncident, NewRoute, UnitId,
};
use crate::routing::{RoutingProvider, route_or_direct};
use crate::storage::{Claim, Store};
use crate::zones::ZonePolicy;

pub use convoy::{Convoy, group_by_base, stagger};
pub use selection::{
    ScoredCandidate, Selected, Selection, SelectionStrategy, estimate_travel_seconds,
    select_scored, select_simple,
};

/// One unit sent by a dispatch pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchedUnit {
    pub unit_id: UnitId,
    pub call_sign: String,
    pub assignment_id: AssignmentId,
    pub role: AssignmentRole,
    pub home_base: Option<String>,
    /// Position in the unit's convoy; 0 for the leader.
    pub convoy_position: usize,
    pub route_length_meters: f64,
    pub duration_seconds: f64,
    /// The convoy moves in a straight line because no road route was found.
    pub direct_route: bool,
    /// Assignment released to free this unit.
    pub preempted_assignment: Option<AssignmentId>,
}

/// Outcome of one dispatch pass for an intervention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchReport {
    pub intervention_id: InterventionId,
    pub strategy: SelectionStrategy,
    pub units_needed: usize,
    pub assignments: Vec<DispatchedUnit>,
    /// No unit of a required type was free; other types were sent.
    pub degraded_match: bool,
}

impl DispatchReport {
    fn empty(intervention_id: InterventionId, strategy: SelectionStrategy, units_needed: usize) -> Self {
        Self {
            intervention_id,
            strategy,
            units_needed,
            assignments: Vec::new(),
            degraded_match: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Outcome of cancelling an intervention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelledIntervention {
    pub intervention_id: InterventionId,
    /// Units released by this call; empty when it was already cancelled.
    pub freed_units: Vec<UnitId>,
}

/// A newly reported incident, its intervention and the first dispatch pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenedIncident {
    pub incident: Incident,
    pub intervention: Intervention,
    pub report: DispatchReport,
}

pub struct Dispatcher<S, R> {
    store: Arc<S>,
    router: Arc<R>,
    zones: ZonePolicy,
    config: ConfigHandle,
    tuning: DispatchTuning,
    strategy: SelectionStrategy,
}

impl<S: Store, R: RoutingProvider> Dispatcher<S, R> {
    pub fn new(store: Arc<S>, router: Arc<R>, config: ConfigHandle) -> Self {
        Self {
            store,
            router,
            zones: ZonePolicy::default(),
            config,
            tuning: DispatchTuning::default(),
            strategy: SelectionStrategy::Simple,
        }
    }

    pub fn with_zones(mut self, zones: ZonePolicy) -> Self {
        self.zones = zones;
        self
    }

    pub fn with_tuning(mut self, tuning: DispatchTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Record a new incident, open its intervention and dispatch to it.
    #[instrument(skip(self, incident), fields(type_code = %incident.type_code))]
    pub async fn open_incident(&self, incident: NewIncident) -> Result<OpenedIncident> {
        let incident = self.store.create_incident(&incident).await?;
        let intervention = self
            .store
            .create_intervention(incident.id, i32::from(incident.severity), DecisionMode::AutoSuggested)
            .await?;
        info!(
            incident_id = incident.id,
            intervention_id = intervention.id,
            severity = incident.severity,
            "Opened intervention"
        );

        let report = self
            .dispatch_to(&intervention, &incident, incident.units_needed())
            .await?;
        Ok(OpenedIncident {
            incident,
            intervention,
            report,
        })
    }

    /// Dispatch units to cover the intervention's current shortfall.
    ///
    /// Finding no unit is a normal outcome reported as an empty report. Only
    /// failing to read the intervention, its incident or the fleet is an error.
    #[instrument(skip(self))]
    pub async fn dispatch(&self, intervention_id: InterventionId) -> Result<DispatchReport> {
        let intervention = self
            .store
            .get_intervention(intervention_id)
            .await?
            .ok_or_else(|| Error::not_found("intervention", intervention_id))?;
        if !intervention.status.is_active() {
            warn!(
                intervention_id,
                status = %intervention.status,
                "Refusing to dispatch to a closed intervention"
            );
            return Ok(DispatchReport::empty(intervention_id, self.strategy, 0));
        }

        let incident = self
            .store
            .get_incident(intervention.incident_id)
            .await?
            .ok_or_else(|| Error::not_found("incident", intervention.incident_id))?;

        let active = self
            .store
            .list_assignments(intervention_id)
            .await?
            .iter()
            .filter(|a| a.status.is_active())
            .count();
        let needed = incident.units_needed().saturating_sub(active);

        self.dispatch_to(&intervention, &incident, needed).await
    }

    /// Cancel an intervention and free its units. Cancelling twice is a no-op;
    /// a completed intervention cannot be cancelled.
    #[instrument(skip(self))]
    pub async fn cancel(&self, intervention_id: InterventionId) -> Result<CancelledIntervention> {
        let intervention = self
            .store
            .get_intervention(intervention_id)
            .await?
            .ok_or_else(|| Error::not_found("intervention", intervention_id))?;

        let freed_units = match intervention.status.transition(InterventionStatus::Cancelled)? {
            Transition::Unchanged => {
                debug!(intervention_id, "Intervention already cancelled");
                Vec::new()
            }
            Transition::Applied => self
                .store
                .cancel_intervention(intervention_id)
                .await?
                .unwrap_or_default(),
        };
        info!(intervention_id, freed = freed_units.len(), "Intervention cancelled");
        Ok(CancelledIntervention {
            intervention_id,
            freed_units,
        })
    }

    /// Dispatch to every active intervention still short of units, highest
    /// priority first. A failing intervention is logged and skipped.
    #[instrument(skip(self))]
    pub async fn dispatch_pending(&self) -> Result<Vec<DispatchReport>> {
        let pending = self.store.list_pending_interventions().await?;
        let mut reports = Vec::new();
        for item in pending.iter().filter(|p| p.needs_more_units()) {
            match self
                .dispatch_to(&item.intervention, &item.incident, item.shortfall())
                .await
            {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(
                        intervention_id = item.intervention.id,
                        error = %e,
                        "Pending dispatch failed"
                    );
                }
            }
        }
        Ok(reports)
    }

    /// Score every eligible unit for the intervention, best first.
    /// Disqualified candidates are included, flagged and sorted last.
    #[instrument(skip(self))]
    pub async fn rank_candidates(&self, intervention_id: InterventionId) -> Result<Vec<ScoredCandidate>> {
        let intervention = self
            .store
            .get_intervention(intervention_id)
            .await?
            .ok_or_else(|| Error::not_found("intervention", intervention_id))?;
        let incident = self
            .store
            .get_incident(intervention.incident_id)
            .await?
            .ok_or_else(|| Error::not_found("incident", intervention.incident_id))?;

        let (candidates, _) = self
            .score_candidates(&incident, intervention_id, &self.config.current())
            .await?;
        Ok(candidates)
    }

    async fn score_candidates(
        &self,
        incident: &Incident,
        intervention_id: InterventionId,
        weights: &DispatchWeights,
    ) -> Result<(Vec<ScoredCandidate>, bool)> {
        let units = self.store.list_units().await?;
        let active: HashMap<UnitId, _> = self
            .store
            .list_active_assignments()
            .await?
            .into_iter()
            .map(|a| (a.assignment.unit_id, a))
            .collect();
        let base_order = self.zones.priority_order(&incident.location);
        Ok(selection::rank_candidates(
            &units,
            &active,
            incident,
            intervention_id,
            &base_order,
            weights,
            &self.tuning,
        ))
    }

    async fn select(&self, incident: &Incident, intervention_id: InterventionId, needed: usize) -> Result<Selection> {
        match self.strategy {
            SelectionStrategy::Simple => {
                let units = self.store.list_units().await?;
                let base_order = self.zones.priority_order(&incident.location);
                Ok(select_simple(&units, incident, &base_order, needed))
            }
            SelectionStrategy::Scored => {
                let weights = self.config.current();
                let (candidates, degraded) = self
                    .score_candidates(incident, intervention_id, &weights)
                    .await?;
                Ok(select_scored(&candidates, degraded, needed))
            }
        }
    }

    async fn dispatch_to(
        &self,
        intervention: &Intervention,
        incident: &Incident,
        needed: usize,
    ) -> Result<DispatchReport> {
        let intervention_id = intervention.id;
        let mut report = DispatchReport::empty(intervention_id, self.strategy, needed);
        if needed == 0 {
            debug!(intervention_id, "Intervention fully staffed");
            return Ok(report);
        }

        let selection = self.select(incident, intervention_id, needed).await?;
        report.degraded_match = selection.degraded_match;
        if selection.degraded_match {
            warn!(
                intervention_id,
                required = ?incident.required_unit_types,
                "No unit of a required type available, sending other types"
            );
        }
        if selection.units.is_empty() {
            info!(intervention_id, needed, "No units available");
            return Ok(report);
        }

        for convoy in group_by_base(selection.units) {
            let Some(leader) = convoy.leader() else {
                continue;
            };
            let (shared, direct_route) = route_or_direct(
                self.router.as_ref(),
                leader.unit.location,
                incident.location,
                self.tuning.fallback_speed_mps,
            )
            .await;
            if direct_route {
                warn!(
                    intervention_id,
                    unit_id = leader.unit.id,
                    from_lat = leader.unit.location.lat,
                    from_lon = leader.unit.location.lon,
                    to_lat = incident.location.lat,
                    to_lon = incident.location.lon,
                    "No road route, convoy moves in a straight line"
                );
            }

            let mut position = 0;
            for member in &convoy.members {
                if !report.assignments.is_empty() && !self.tuning.assign_throttle.is_zero() {
                    tokio::time::sleep(self.tuning.assign_throttle).await;
                }

                let claim = Claim {
                    unit_id: member.unit.id,
                    observed: member.unit.status,
                    intervention_id,
                    role: AssignmentRole::for_position(report.assignments.len()),
                    preempt: member.preempt,
                };
                let assignment = match self.store.claim_unit(&claim).await {
                    Ok(Some(assignment)) => assignment,
                    Ok(None) => {
                        info!(
                            intervention_id,
                            unit_id = member.unit.id,
                            "Unit taken by another dispatch, skipping"
                        );
                        continue;
                    }
                    Err(e) => {
                        warn!(intervention_id, unit_id = member.unit.id, error = %e, "Failed to claim unit");
                        continue;
                    }
                };

                let route = stagger(&shared, position, self.tuning.convoy_spacing_meters, incident.location);
                let destination = route.geometry.last().copied().unwrap_or(incident.location);
                let new_route = NewRoute {
                    unit_id: member.unit.id,
                    intervention_id: Some(intervention_id),
                    geometry: route.geometry,
                    length_meters: route.length_meters,
                    duration_seconds: route.duration_seconds,
                    origin: member.unit.location,
                    destination,
                };
                if let Err(e) = self.store.save_route(&new_route).await {
                    // The simulator requests a repair for an under way unit without a route.
                    warn!(intervention_id, unit_id = member.unit.id, error = %e, "Failed to save route");
                }

                info!(
                    intervention_id,
                    unit_id = member.unit.id,
                    call_sign = %member.unit.call_sign,
                    role = assignment.role.map(|r| r.as_str()).unwrap_or("none"),
                    convoy_position = position,
                    preempted = ?member.preempt,
                    "Unit dispatched"
                );
                report.assignments.push(DispatchedUnit {
                    unit_id: member.unit.id,
                    call_sign: member.unit.call_sign.clone(),
                    assignment_id: assignment.id,
                    role: claim.role,
                    home_base: member.unit.home_base.clone(),
                    convoy_position: position,
                    route_length_meters: new_route.length_meters,
                    duration_seconds: new_route.duration_seconds,
                    direct_route,
                    preempted_assignment: member.preempt,
                });
                position += 1;
            }
        }

        Ok(report)
    }

    /// Recompute the route of an under way unit towards its active
    /// assignment's incident. Returns `false` when there is nothing to repair,
    /// including when the unit already has a route for that intervention: a
    /// repair queued while the dispatcher was still saving must not replace a
    /// convoy follower's staggered route.
    #[instrument(skip(self))]
    pub async fn repair_route(&self, unit_id: UnitId) -> Result<bool> {
        let Some(unit) = self.store.get_unit(unit_id).await? else {
            debug!(unit_id, "Repair requested for unknown unit");
            return Ok(false);
        };
        let active = self.store.list_active_assignments().await?;
        let Some(current) = active
            .into_iter()
            .find(|a| a.assignment.unit_id == unit_id && a.assignment.status.is_active())
        else {
            debug!(unit_id, "No active assignment to repair a route for");
            return Ok(false);
        };
        let intervention_id = current.assignment.intervention_id;
        let existing = self.store.get_route(unit_id).await?;
        if existing.is_some_and(|r| r.intervention_id == Some(intervention_id)) {
            debug!(unit_id, intervention_id, "Route already leads to the active intervention");
            return Ok(false);
        }
        let intervention = self
            .store
            .get_intervention(intervention_id)
            .await?
            .ok_or_else(|| Error::not_found("intervention", intervention_id))?;
        let incident = self
            .store
            .get_incident(intervention.incident_id)
            .await?
            .ok_or_else(|| Error::not_found("incident", intervention.incident_id))?;

        let (route, direct_route) = route_or_direct(
            self.router.as_ref(),
            unit.location,
            incident.location,
            self.tuning.fallback_speed_mps,
        )
        .await;
        self.store
            .save_route(&NewRoute {
                unit_id,
                intervention_id: Some(intervention_id),
                geometry: route.geometry,
                length_meters: route.length_meters,
                duration_seconds: route.duration_seconds,
                origin: unit.location,
                destination: incident.location,
            })
            .await?;
        info!(unit_id, intervention_id, direct_route, "Route repaired");
        Ok(true)
    }

    /// Serve route-repair requests until every sender is dropped.
    pub async fn serve_repairs(self: Arc<Self>, mut requests: mpsc::Receiver<UnitId>) {
        while let Some(unit_id) = requests.recv().await {
            if let Err(e) = self.repair_route(unit_id).await {
                warn!(unit_id, error = %e, "Route repair failed");
            }
        }
        debug!("Route repair channel closed");
    }

    /// Sweep pending interventions every `period`.
    pub async fn run_sweep(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.dispatch_pending().await {
                Ok(reports) => {
                    let sent: usize = reports.iter().map(|r| r.assignments.len()).sum();
                    if sent > 0 {
                        info!(interventions = reports.len(), units = sent, "Pending sweep dispatched units");
                    }
                }
                Err(e) => warn!(error = %e, "Pending sweep failed"),
            }
        }
    }

    /// Reload weights from the store and publish them.
    pub async fn reload_config(&self) -> Result<DispatchWeights> {
        let entries = self.store.load_dispatch_config().await?;
        let weights = DispatchWeights::from_entries(entries.iter().map(|(k, v)| (k.as_str(), *v)));
        self.config.publish(weights);
        info!(?weights, "Dispatch config reloaded");
        Ok(weights)
    }

    /// Validate, persist and publish one weight.
    pub async fn update_config(&self, key: &str, value: f64) -> Result<DispatchWeights> {
        let mut weights = self.config.current();
        weights.set(key, value)?;
        self.store.save_dispatch_config(key, value).await?;
        self.config.publish(weights);
        info!(key, value, "Dispatch config updated");
        Ok(weights)
    }
}
