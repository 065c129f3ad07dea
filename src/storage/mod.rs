//! Persistence collaborators.
//!
//! [`StatusSink`] carries the idempotent status and position updates the
//! simulator fires every tick; [`Store`] adds the queries and multi-row writes
//! the dispatcher needs. Both are implemented by the SQLite [`Storage`].

mod sqlite;

use std::future::Future;

use crate::error::Result;
use crate::geo::GeoPoint;
use crate::model::{
    ActiveAssignment, Assignment, AssignmentId, AssignmentRole, AssignmentStatus, Base,
    DecisionMode, Incident, IncidentId, Intervention, InterventionId, InterventionStatus,
    NewIncident, NewRoute, NewUnit, PendingIntervention, Route, Unit, UnitId, UnitStatus,
};

pub use sqlite::Storage;

/// Request to take a unit for an intervention.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub unit_id: UnitId,
    /// Status the dispatcher saw; the claim fails if it changed since.
    pub observed: UnitStatus,
    pub intervention_id: InterventionId,
    pub role: AssignmentRole,
    /// Active assignment to release in the same transaction (preemption).
    pub preempt: Option<AssignmentId>,
}

/// Status and position updates. Every method is idempotent: a repeated or
/// out-of-order transition changes nothing and returns `false`.
pub trait StatusSink: Send + Sync {
    fn set_unit_status(
        &self,
        unit_id: UnitId,
        status: UnitStatus,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn set_unit_location(
        &self,
        unit_id: UnitId,
        location: GeoPoint,
    ) -> impl Future<Output = Result<()>> + Send;

    fn set_assignment_status(
        &self,
        assignment_id: AssignmentId,
        status: AssignmentStatus,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn set_intervention_status(
        &self,
        intervention_id: InterventionId,
        status: InterventionStatus,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Record progress on the route with the given revision. Persisted
    /// progress never decreases.
    fn update_route_progress(
        &self,
        unit_id: UnitId,
        revision: i64,
        progress_percent: f64,
        position: GeoPoint,
    ) -> impl Future<Output = Result<bool>> + Send;
}

/// Queries and writes used by the dispatcher and the simulator.
pub trait Store: StatusSink {
    fn insert_base(&self, base: &Base) -> impl Future<Output = Result<()>> + Send;

    fn list_bases(&self) -> impl Future<Output = Result<Vec<Base>>> + Send;

    fn insert_unit(&self, unit: &NewUnit) -> impl Future<Output = Result<Unit>> + Send;

    fn get_unit(&self, unit_id: UnitId) -> impl Future<Output = Result<Option<Unit>>> + Send;

    fn list_units(&self) -> impl Future<Output = Result<Vec<Unit>>> + Send;

    fn create_incident(
        &self,
        incident: &NewIncident,
    ) -> impl Future<Output = Result<Incident>> + Send;

    fn get_incident(
        &self,
        incident_id: IncidentId,
    ) -> impl Future<Output = Result<Option<Incident>>> + Send;

    fn create_intervention(
        &self,
        incident_id: IncidentId,
        priority: i32,
        decision_mode: DecisionMode,
    ) -> impl Future<Output = Result<Intervention>> + Send;

    fn get_intervention(
        &self,
        intervention_id: InterventionId,
    ) -> impl Future<Output = Result<Option<Intervention>>> + Send;

    /// Active interventions with their incident and active assignment count,
    /// highest priority first.
    fn list_pending_interventions(
        &self,
    ) -> impl Future<Output = Result<Vec<PendingIntervention>>> + Send;

    /// Every dispatched or arrived assignment, with its incident's severity.
    fn list_active_assignments(
        &self,
    ) -> impl Future<Output = Result<Vec<ActiveAssignment>>> + Send;

    fn list_assignments(
        &self,
        intervention_id: InterventionId,
    ) -> impl Future<Output = Result<Vec<Assignment>>> + Send;

    /// Compare-and-set the unit to `under_way` and create its assignment.
    /// `None` means the unit was taken or changed status in the meantime.
    fn claim_unit(&self, claim: &Claim) -> impl Future<Output = Result<Option<Assignment>>> + Send;

    /// Replace the unit's route, resetting progress and bumping its revision.
    fn save_route(&self, route: &NewRoute) -> impl Future<Output = Result<Route>> + Send;

    fn get_route(&self, unit_id: UnitId) -> impl Future<Output = Result<Option<Route>>> + Send;

    fn list_routes(&self) -> impl Future<Output = Result<Vec<Route>>> + Send;

    /// Delete the route if it still has `revision`.
    fn delete_route(
        &self,
        unit_id: UnitId,
        revision: i64,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Complete an on-site intervention in one transaction: release its
    /// assignments, free its units, drop their routes and close the incident.
    /// Returns the freed units, or `None` if the intervention was not on site.
    fn complete_intervention(
        &self,
        intervention_id: InterventionId,
    ) -> impl Future<Output = Result<Option<Vec<UnitId>>>> + Send;

    /// Cancel an active intervention, freeing its units. Returns the freed
    /// units, or `None` if the intervention was not active.
    fn cancel_intervention(
        &self,
        intervention_id: InterventionId,
    ) -> impl Future<Output = Result<Option<Vec<UnitId>>>> + Send;

    fn load_dispatch_config(&self) -> impl Future<Output = Result<Vec<(String, f64)>>> + Send;

    fn save_dispatch_config(
        &self,
        key: &str,
        value: f64,
    ) -> impl Future<Output = Result<()>> + Send;
}
