//! Fixed-step waypoint movement.
//!
//! Each tick moves a unit `waypoint_step_meters` per elapsed second towards
//! its next vertex, snapping onto a vertex once within the waypoint threshold.
//! Arrival is decided by distance to the destination, not by percent.

use std::f64::consts::PI;

use crate::config::SimulationTuning;
use crate::geo::{GeoPoint, haversine_meters, offset_by_meters, polyline_length, step_towards};

use super::movement::MovementRecord;

/// Distance left along the route from the record's position.
fn remaining_meters(record: &MovementRecord) -> f64 {
    let Some(next) = record.geometry.get(record.next_waypoint) else {
        return haversine_meters(&record.position, &record.destination());
    };
    haversine_meters(&record.position, next) + polyline_length(&record.geometry[record.next_waypoint..])
}

/// Advance one step. Returns `true` when the record arrives during this step.
pub fn advance_waypoint(record: &mut MovementRecord, delta_seconds: f64, tuning: &SimulationTuning) -> bool {
    if record.is_arrived() {
        return false;
    }
    let destination = record.destination();
    let mut budget = tuning.waypoint_step_meters * delta_seconds.max(0.0);

    while budget > 0.0 {
        let target = record
            .geometry
            .get(record.next_waypoint)
            .copied()
            .unwrap_or(destination);
        let distance = haversine_meters(&record.position, &target);
        if distance <= budget {
            record.position = target;
            budget -= distance;
        } else {
            record.position = step_towards(&record.position, &target, budget);
            budget = 0.0;
        }
        if haversine_meters(&record.position, &target) <= tuning.waypoint_threshold_meters {
            record.position = target;
            if record.next_waypoint >= record.geometry.len() {
                break;
            }
            record.next_waypoint += 1;
        }
    }

    let total = polyline_length(&record.geometry);
    if total > 0.0 {
        let travelled = (1.0 - remaining_meters(record) / total) * 100.0;
        record.progress_percent = travelled.clamp(record.progress_percent, 100.0);
    }

    if haversine_meters(&record.position, &destination) < tuning.arrival_threshold_meters {
        record.position = destination;
        record.mark_arrived();
        return true;
    }
    false
}

/// Parking spot for the `slot`-th unit arriving at `center`: a semicircle
/// south of the incident, `arrival_ring_capacity` units per ring, each ring
/// one radius further out.
pub fn arrival_slot(center: &GeoPoint, slot: usize, tuning: &SimulationTuning) -> GeoPoint {
    let capacity = tuning.arrival_ring_capacity.max(1);
    let ring = slot / capacity;
    let index = slot % capacity;
    let radius = tuning.arrival_ring_radius_meters * (ring + 1) as f64;
    let angle = PI * (index as f64 + 0.5) / capacity as f64;
    offset_by_meters(center, -radius * angle.sin(), radius * angle.cos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Route;

    fn record(geometry: Vec<GeoPoint>) -> MovementRecord {
        let origin = geometry[0];
        let destination = *geometry.last().unwrap();
        MovementRecord::from_route(&Route {
            unit_id: 7,
            intervention_id: Some(3),
            length_meters: polyline_length(&geometry),
            geometry,
            duration_seconds: 100.0,
            progress_percent: 0.0,
            origin,
            destination,
            current: None,
            revision: 1,
            severity: None,
        })
    }

    fn east(meters: f64) -> GeoPoint {
        GeoPoint::new(0.0, meters / 111_194.93)
    }

    #[test]
    fn test_steps_along_waypoints_until_arrival() {
        let tuning = SimulationTuning::default();
        let mut rec = record(vec![east(0.0), east(150.0), east(400.0)]);

        assert!(!advance_waypoint(&mut rec, 1.0, &tuning));
        assert!((haversine_meters(&rec.position, &east(111.0))).abs() < 0.5);
        let first = rec.progress_percent;
        assert!(first > 0.0);

        // Reaches the first vertex and carries the rest of the step past it.
        assert!(!advance_waypoint(&mut rec, 1.0, &tuning));
        assert_eq!(rec.next_waypoint, 2);
        assert!(rec.progress_percent > first);

        let mut ticks = 0;
        while !advance_waypoint(&mut rec, 1.0, &tuning) {
            ticks += 1;
            assert!(ticks < 10);
        }
        assert_eq!(rec.position, east(400.0));
        assert_eq!(rec.progress_percent, 100.0);
        assert!(!advance_waypoint(&mut rec, 1.0, &tuning));
    }

    #[test]
    fn test_arrives_within_threshold() {
        let tuning = SimulationTuning::default();
        let mut rec = record(vec![east(0.0), east(20.0)]);
        assert!(advance_waypoint(&mut rec, 0.0, &tuning));
        assert_eq!(rec.position, east(20.0));
    }

    #[test]
    fn test_arrival_slots_fill_rings() {
        let tuning = SimulationTuning::default();
        let center = GeoPoint::new(45.75, 4.85);
        let first = arrival_slot(&center, 0, &tuning);
        let ninth = arrival_slot(&center, 8, &tuning);
        assert!((haversine_meters(&center, &first) - 25.0).abs() < 0.5);
        assert!((haversine_meters(&center, &ninth) - 50.0).abs() < 0.5);
        assert!(first.lat < center.lat);

        let slots: Vec<GeoPoint> = (0..8).map(|k| arrival_slot(&center, k, &tuning)).collect();
        for (i, a) in slots.iter().enumerate() {
            for b in &slots[i + 1..] {
                assert!(haversine_meters(a, b) > 1.0);
            }
        }
    }
}
