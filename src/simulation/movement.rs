//! Per-unit movement records and the progress-percentage model.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::geo::{GeoPoint, haversine_meters, point_at_percent, polyline_length};
use crate::model::{AssignmentId, InterventionId, Route, UnitId};

/// In-memory movement state for one unit, derived from its persisted route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementRecord {
    pub unit_id: UnitId,
    /// `None` for a return-to-base trip.
    pub intervention_id: Option<InterventionId>,
    pub assignment_id: Option<AssignmentId>,
    /// Revision of the route this record follows.
    pub revision: i64,
    pub geometry: Vec<GeoPoint>,
    pub length_meters: f64,
    pub duration_seconds: f64,
    pub progress_percent: f64,
    pub position: GeoPoint,
    pub severity: Option<u8>,
    pub arrived_at: Option<DateTime<Utc>>,
    /// Arrival status writes went through.
    pub arrival_handled: bool,
    /// Index of the next vertex to reach (waypoint model).
    pub(crate) next_waypoint: usize,
}

impl MovementRecord {
    /// Seed a record from a persisted route, resuming its progress. A route
    /// without usable geometry is followed as a straight line.
    pub fn from_route(route: &Route) -> Self {
        let geometry = if route.geometry.len() >= 2 {
            route.geometry.clone()
        } else {
            vec![route.origin, route.destination]
        };
        let progress_percent = route.progress_percent.clamp(0.0, 100.0);
        let position = route
            .current
            .or_else(|| point_at_percent(&geometry, progress_percent))
            .unwrap_or(route.origin);
        let length_meters = if route.length_meters > 0.0 {
            route.length_meters
        } else {
            polyline_length(&geometry)
        };
        let next_waypoint = next_waypoint_for(&geometry, length_meters, progress_percent);

        Self {
            unit_id: route.unit_id,
            intervention_id: route.intervention_id,
            assignment_id: None,
            revision: route.revision,
            geometry,
            length_meters,
            duration_seconds: route.duration_seconds,
            progress_percent,
            position,
            severity: route.severity,
            arrived_at: (progress_percent >= 100.0).then(Utc::now),
            arrival_handled: false,
            next_waypoint,
        }
    }

    pub fn is_return_trip(&self) -> bool {
        self.intervention_id.is_none()
    }

    pub fn is_arrived(&self) -> bool {
        self.arrived_at.is_some()
    }

    /// Arrived, but the arrival has not been applied to the store yet.
    pub fn awaits_arrival_handling(&self) -> bool {
        self.is_arrived() && !self.arrival_handled
    }

    pub fn destination(&self) -> GeoPoint {
        self.geometry.last().copied().unwrap_or(self.position)
    }

    pub(crate) fn mark_arrived(&mut self) {
        self.progress_percent = 100.0;
        if self.arrived_at.is_none() {
            self.arrived_at = Some(Utc::now());
        }
    }
}

/// First vertex lying beyond `percent` of the route.
fn next_waypoint_for(geometry: &[GeoPoint], length_meters: f64, percent: f64) -> usize {
    let target = polyline_length(geometry).min(length_meters.max(0.0)) * percent / 100.0;
    let mut walked = 0.0;
    for (i, w) in geometry.windows(2).enumerate() {
        walked += haversine_meters(&w[0], &w[1]);
        if walked > target {
            return i + 1;
        }
    }
    geometry.len()
}

/// Advance by elapsed time over estimated duration. Returns `true` when the
/// record arrives during this step.
pub fn advance_progress(record: &mut MovementRecord, delta_seconds: f64) -> bool {
    if record.is_arrived() {
        return false;
    }
    let increment = if record.duration_seconds <= 0.0 {
        100.0
    } else {
        delta_seconds.max(0.0) * 100.0 / record.duration_seconds
    };
    let progress = (record.progress_percent + increment).clamp(record.progress_percent, 100.0);
    record.progress_percent = progress;
    if let Some(position) = point_at_percent(&record.geometry, progress) {
        record.position = position;
    }

    if progress >= 100.0 {
        record.mark_arrived();
        record.position = record.destination();
        return true;
    }
    false
}
