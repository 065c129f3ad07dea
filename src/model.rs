//! Data model for units, incidents, interventions, assignments and routes.
//!
//! Status enums serialize to the snake_case strings stored by the
//! persistence layer (`under_way`, `auto_suggested`, ...). Identifiers are the
//! store's integer row ids.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::geo::GeoPoint;

pub type UnitId = i64;
pub type IncidentId = i64;
pub type InterventionId = i64;
pub type AssignmentId = i64;

/// Lowest and highest incident severities.
pub const MIN_SEVERITY: u8 = 1;
pub const MAX_SEVERITY: u8 = 5;

/// Severity assumed when an intervention's severity is unknown.
pub const DEFAULT_SEVERITY: u8 = 3;

/// Operational status of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// At base or free on the road; can be dispatched.
    Available,
    /// Back at base after a return trip, not shown on the map.
    AvailableHidden,
    /// Responding to an intervention.
    UnderWay,
    /// Working at an incident.
    OnSite,
    /// Out of service.
    Unavailable,
    /// Not reporting.
    Offline,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Available => "available",
            UnitStatus::AvailableHidden => "available_hidden",
            UnitStatus::UnderWay => "under_way",
            UnitStatus::OnSite => "on_site",
            UnitStatus::Unavailable => "unavailable",
            UnitStatus::Offline => "offline",
        }
    }

    /// Whether a unit in this status may receive a new assignment without
    /// preemption.
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, UnitStatus::Available | UnitStatus::AvailableHidden)
    }

    /// Whether a unit in this status is working an intervention.
    pub fn is_engaged(&self) -> bool {
        matches!(self, UnitStatus::UnderWay | UnitStatus::OnSite)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(UnitStatus::Available),
            "available_hidden" => Ok(UnitStatus::AvailableHidden),
            "under_way" => Ok(UnitStatus::UnderWay),
            "on_site" => Ok(UnitStatus::OnSite),
            "unavailable" => Ok(UnitStatus::Unavailable),
            "offline" => Ok(UnitStatus::Offline),
            other => Err(Error::UnknownStatus {
                entity: "unit",
                value: other.to_string(),
            }),
        }
    }
}

/// Status of an intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionStatus {
    /// Opened; units may be en route.
    Created,
    /// At least one unit has arrived.
    OnSite,
    Completed,
    Cancelled,
}

impl InterventionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionStatus::Created => "created",
            InterventionStatus::OnSite => "on_site",
            InterventionStatus::Completed => "completed",
            InterventionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, InterventionStatus::Created | InterventionStatus::OnSite)
    }
}

impl fmt::Display for InterventionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterventionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(InterventionStatus::Created),
            "on_site" => Ok(InterventionStatus::OnSite),
            "completed" => Ok(InterventionStatus::Completed),
            "cancelled" => Ok(InterventionStatus::Cancelled),
            other => Err(Error::UnknownStatus {
                entity: "intervention",
                value: other.to_string(),
            }),
        }
    }
}

/// How the intervention's units were chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    AutoSuggested,
    Manual,
}

impl DecisionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionMode::AutoSuggested => "auto_suggested",
            DecisionMode::Manual => "manual",
        }
    }
}

impl FromStr for DecisionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_suggested" => Ok(DecisionMode::AutoSuggested),
            "manual" => Ok(DecisionMode::Manual),
            other => Err(Error::UnknownStatus {
                entity: "decision mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Status of a unit's assignment to an intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Dispatched,
    Arrived,
    Released,
    Cancelled,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Dispatched => "dispatched",
            AssignmentStatus::Arrived => "arrived",
            AssignmentStatus::Released => "released",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, AssignmentStatus::Dispatched | AssignmentStatus::Arrived)
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dispatched" => Ok(AssignmentStatus::Dispatched),
            "arrived" => Ok(AssignmentStatus::Arrived),
            "released" => Ok(AssignmentStatus::Released),
            "cancelled" => Ok(AssignmentStatus::Cancelled),
            other => Err(Error::UnknownStatus {
                entity: "assignment",
                value: other.to_string(),
            }),
        }
    }
}

/// Role of a unit within an intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentRole {
    Lead,
    Support,
}

impl AssignmentRole {
    /// Role for the unit at `position` in a dispatch pass.
    pub fn for_position(position: usize) -> Self {
        if position == 0 {
            AssignmentRole::Lead
        } else {
            AssignmentRole::Support
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentRole::Lead => "lead",
            AssignmentRole::Support => "support",
        }
    }
}

impl FromStr for AssignmentRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead" => Ok(AssignmentRole::Lead),
            "support" => Ok(AssignmentRole::Support),
            other => Err(Error::UnknownStatus {
                entity: "assignment role",
                value: other.to_string(),
            }),
        }
    }
}

/// A home base (fire station).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Base {
    pub name: String,
    pub location: GeoPoint,
}

impl Base {
    pub fn new(name: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            name: name.into(),
            location: GeoPoint::new(lat, lon),
        }
    }
}

/// A physical vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub call_sign: String,
    pub unit_type_code: String,
    pub home_base: Option<String>,
    pub status: UnitStatus,
    pub location: GeoPoint,
    pub last_contact_at: Option<DateTime<Utc>>,
}

/// Fields needed to register a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUnit {
    pub call_sign: String,
    pub unit_type_code: String,
    pub home_base: Option<String>,
    pub location: GeoPoint,
}

/// A reported emergency (the external "event").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub type_code: String,
    pub severity: u8,
    pub required_unit_types: Vec<String>,
    pub location: GeoPoint,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Incident {
    /// Whether `unit_type_code` satisfies this incident. An incident that
    /// names no required types accepts any unit.
    pub fn accepts_unit_type(&self, unit_type_code: &str) -> bool {
        self.required_unit_types.is_empty()
            || self.required_unit_types.iter().any(|t| t == unit_type_code)
    }

    /// Default staffing policy: one unit per severity level.
    pub fn units_needed(&self) -> usize {
        usize::from(clamp_severity(self.severity))
    }
}

/// Fields needed to report an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIncident {
    pub type_code: String,
    pub severity: u8,
    #[serde(default)]
    pub required_unit_types: Vec<String>,
    pub location: GeoPoint,
}

/// Clamp a severity into the supported 1-5 range.
pub fn clamp_severity(severity: u8) -> u8 {
    severity.clamp(MIN_SEVERITY, MAX_SEVERITY)
}

/// The operational response to an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intervention {
    pub id: InterventionId,
    pub incident_id: IncidentId,
    pub status: InterventionStatus,
    pub priority: i32,
    pub decision_mode: DecisionMode,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The link between one unit and one intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub intervention_id: InterventionId,
    pub unit_id: UnitId,
    pub role: Option<AssignmentRole>,
    pub status: AssignmentStatus,
    pub dispatched_at: DateTime<Utc>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

/// A unit's active assignment together with the severity of the incident it
/// serves.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveAssignment {
    pub assignment: Assignment,
    pub severity: Option<u8>,
}

/// A cached path for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub unit_id: UnitId,
    /// `None` for return-to-base trips.
    pub intervention_id: Option<InterventionId>,
    pub geometry: Vec<GeoPoint>,
    pub length_meters: f64,
    pub duration_seconds: f64,
    pub progress_percent: f64,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub current: Option<GeoPoint>,
    /// Bumped every time the unit's route is replaced.
    pub revision: i64,
    /// Severity of the incident the route leads to, when known.
    pub severity: Option<u8>,
}

impl Route {
    /// Whether the route is a return-to-base trip.
    pub fn is_return_trip(&self) -> bool {
        self.intervention_id.is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.progress_percent >= 100.0
    }
}

/// A route to persist for a unit, replacing any existing one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRoute {
    pub unit_id: UnitId,
    pub intervention_id: Option<InterventionId>,
    pub geometry: Vec<GeoPoint>,
    pub length_meters: f64,
    pub duration_seconds: f64,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
}

/// An active intervention awaiting (more) units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingIntervention {
    pub intervention: Intervention,
    pub incident: Incident,
    pub active_assignments: usize,
}

impl PendingIntervention {
    /// Units still missing against the incident's staffing target.
    pub fn shortfall(&self) -> usize {
        self.incident
            .units_needed()
            .saturating_sub(self.active_assignments)
    }

    pub fn needs_more_units(&self) -> bool {
        self.shortfall() > 0
    }
}
