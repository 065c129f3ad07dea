//! Candidate selection strategies.
//!
//! Both strategies answer the same question (which units, in which order) and
//! feed the same convoy and assignment plumbing:
//!
//! - [`SelectionStrategy::Simple`] considers free units only (`available`, or
//!   parked as `available_hidden`) and orders them by zone priority, then raw
//!   distance.
//! - [`SelectionStrategy::Scored`] ranks available and engaged units with the
//!   candidate scorer, which allows preempting lower-severity work.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{DispatchTuning, DispatchWeights};
use crate::error::Error;
use crate::geo::{haversine_meters, planar_distance_squared};
use crate::model::{ActiveAssignment, AssignmentId, Incident, InterventionId, Unit, UnitId, UnitStatus};
use crate::scoring::{CandidateFactors, Engagement, ScoreBreakdown, score};
use crate::zones::priority_index;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    Simple,
    Scored,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::Simple => "simple",
            SelectionStrategy::Scored => "scored",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(SelectionStrategy::Simple),
            "scored" => Ok(SelectionStrategy::Scored),
            other => Err(Error::Config(format!("unknown selection strategy: {other}"))),
        }
    }
}

/// A unit picked for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Selected {
    pub unit: Unit,
    /// Assignment to release when the unit is taken from other work.
    pub preempt: Option<AssignmentId>,
}

/// Ordered picks plus the degraded-match flag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub units: Vec<Selected>,
    /// No unit of a required type was available; any type was used.
    pub degraded_match: bool,
}

/// Restrict `pool` to units of a required type, or keep everything (and flag
/// it) when none match.
fn prefer_required_types<'a>(pool: Vec<&'a Unit>, incident: &Incident) -> (Vec<&'a Unit>, bool) {
    if incident.required_unit_types.is_empty() {
        return (pool, false);
    }
    let matching: Vec<&Unit> = pool
        .iter()
        .copied()
        .filter(|u| incident.accepts_unit_type(&u.unit_type_code))
        .collect();
    if matching.is_empty() && !pool.is_empty() {
        (pool, true)
    } else {
        (matching, false)
    }
}

/// Free units ordered by (zone priority, distance), at most `needed`.
pub fn select_simple(
    units: &[Unit],
    incident: &Incident,
    base_order: &[String],
    needed: usize,
) -> Selection {
    let available: Vec<&Unit> = units
        .iter()
        .filter(|u| u.status.is_dispatchable())
        .collect();
    let (mut pool, degraded_match) = prefer_required_types(available, incident);

    pool.sort_by(|a, b| {
        let pa = priority_index(base_order, a.home_base.as_deref());
        let pb = priority_index(base_order, b.home_base.as_deref());
        pa.cmp(&pb).then_with(|| {
            planar_distance_squared(&a.location, &incident.location)
                .total_cmp(&planar_distance_squared(&b.location, &incident.location))
        })
    });

    Selection {
        units: pool
            .into_iter()
            .take(needed)
            .map(|unit| Selected {
                unit: unit.clone(),
                preempt: None,
            })
            .collect(),
        degraded_match,
    }
}

/// One scored candidate, kept with its inputs for inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub unit_id: UnitId,
    pub call_sign: String,
    pub unit_type_code: String,
    pub home_base: Option<String>,
    pub status: UnitStatus,
    pub distance_meters: f64,
    pub travel_time_seconds: f64,
    pub remaining_at_base: u32,
    pub base_priority: usize,
    pub type_match: bool,
    pub current_assignment_id: Option<AssignmentId>,
    pub current_severity: Option<u8>,
    pub score: ScoreBreakdown,
    pub disqualified: bool,
    #[serde(skip)]
    unit: Unit,
}

impl ScoredCandidate {
    pub fn requires_preemption(&self) -> bool {
        self.current_assignment_id.is_some()
    }

    pub fn unit(&self) -> &Unit {
        &self.unit
    }
}

/// Estimated travel time from straight-line distance.
pub fn estimate_travel_seconds(distance_meters: f64, tuning: &DispatchTuning) -> f64 {
    if tuning.candidate_speed_mps <= 0.0 {
        return f64::INFINITY;
    }
    distance_meters * tuning.detour_factor / tuning.candidate_speed_mps
}

/// Score every eligible unit for `incident`.
///
/// The pool holds dispatchable and engaged units, excluding units already
/// working `intervention_id`. It is capped at `max_candidates_per_dispatch`
/// by travel time, then sorted by score (disqualified last), zone priority
/// and travel time.
pub fn rank_candidates(
    units: &[Unit],
    active: &HashMap<UnitId, ActiveAssignment>,
    incident: &Incident,
    intervention_id: InterventionId,
    base_order: &[String],
    weights: &DispatchWeights,
    tuning: &DispatchTuning,
) -> (Vec<ScoredCandidate>, bool) {
    let eligible: Vec<&Unit> = units
        .iter()
        .filter(|u| u.status.is_dispatchable() || u.status.is_engaged())
        .filter(|u| {
            active
                .get(&u.id)
                .is_none_or(|a| a.assignment.intervention_id != intervention_id)
        })
        .collect();
    let (pool, degraded_match) = prefer_required_types(eligible, incident);

    let mut at_base: HashMap<&str, u32> = HashMap::new();
    for unit in units.iter().filter(|u| u.status.is_dispatchable()) {
        if let Some(base) = unit.home_base.as_deref() {
            *at_base.entry(base).or_default() += 1;
        }
    }

    let mut candidates: Vec<ScoredCandidate> = pool
        .into_iter()
        .map(|unit| {
            let distance_meters = haversine_meters(&unit.location, &incident.location);
            let travel_time_seconds = estimate_travel_seconds(distance_meters, tuning);
            let remaining_at_base = match unit.home_base.as_deref() {
                Some(base) => {
                    let here = at_base.get(base).copied().unwrap_or(0);
                    if unit.status.is_dispatchable() {
                        here.saturating_sub(1)
                    } else {
                        here
                    }
                }
                // Units without a base never leave a station short.
                None => weights.min_reserve_per_base,
            };
            let current = active.get(&unit.id);
            let engagement = if unit.status.is_dispatchable() && current.is_none() {
                Engagement::Available
            } else {
                Engagement::Assigned {
                    severity: current.and_then(|a| a.severity),
                }
            };
            let factors = CandidateFactors {
                travel_time_seconds,
                remaining_at_base,
                engagement,
                target_severity: incident.severity,
            };
            let breakdown = score(&factors, weights);
            ScoredCandidate {
                unit_id: unit.id,
                call_sign: unit.call_sign.clone(),
                unit_type_code: unit.unit_type_code.clone(),
                home_base: unit.home_base.clone(),
                status: unit.status,
                distance_meters,
                travel_time_seconds,
                remaining_at_base,
                base_priority: priority_index(base_order, unit.home_base.as_deref()),
                type_match: incident.accepts_unit_type(&unit.unit_type_code),
                current_assignment_id: current.map(|a| a.assignment.id),
                current_severity: current.and_then(|a| a.severity),
                disqualified: breakdown.total.is_disqualified(),
                score: breakdown,
                unit: unit.clone(),
            }
        })
        .collect();

    candidates.sort_by(|a, b| a.travel_time_seconds.total_cmp(&b.travel_time_seconds));
    candidates.truncate(weights.max_candidates_per_dispatch.max(1));
    candidates.sort_by(|a, b| {
        a.score
            .total
            .compare(&b.score.total)
            .then_with(|| a.base_priority.cmp(&b.base_priority))
            .then_with(|| a.travel_time_seconds.total_cmp(&b.travel_time_seconds))
    });

    (candidates, degraded_match)
}

/// The best `needed` candidates that are not disqualified.
pub fn select_scored(candidates: &[ScoredCandidate], degraded_match: bool, needed: usize) -> Selection {
    Selection {
        units: candidates
            .iter()
            .filter(|c| !c.disqualified)
            .take(needed)
            .map(|c| Selected {
                unit: c.unit.clone(),
                preempt: c.current_assignment_id,
            })
            .collect(),
        degraded_match,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;
    use crate::model::{Assignment, AssignmentStatus};
    use crate::zones::ZonePolicy;
    use chrono::Utc;

    fn unit(id: UnitId, kind: &str, base: &str, status: UnitStatus, lat: f64, lon: f64) -> Unit {
        Unit {
            id,
            call_sign: format!("{kind}-{id}"),
            unit_type_code: kind.to_string(),
            home_base: Some(base.to_string()),
            status,
            location: GeoPoint::new(lat, lon),
            last_contact_at: None,
        }
    }

    fn incident(severity: u8, required: &[&str]) -> Incident {
        Incident {
            id: 1,
            type_code: "FIRE".to_string(),
            severity,
            required_unit_types: required.iter().map(|s| s.to_string()).collect(),
            location: GeoPoint::new(45.7430, 4.8170),
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    fn active(unit_id: UnitId, intervention_id: InterventionId, severity: u8) -> ActiveAssignment {
        ActiveAssignment {
            assignment: Assignment {
                id: unit_id * 100,
                intervention_id,
                unit_id,
                role: None,
                status: AssignmentStatus::Dispatched,
                dispatched_at: Utc::now(),
                arrived_at: None,
                released_at: None,
            },
            severity: Some(severity),
        }
    }

    fn fleet() -> Vec<Unit> {
        vec![
            unit(1, "VSAV", "Cusset", UnitStatus::Available, 45.7744, 4.8957),
            unit(2, "VSAV", "Lyon Confluence", UnitStatus::Available, 45.7421, 4.8158),
            unit(3, "FPT", "Lyon Confluence", UnitStatus::Available, 45.7421, 4.8158),
            unit(4, "VSAV", "Lyon Part-Dieu", UnitStatus::UnderWay, 45.7601, 4.8590),
            unit(5, "VSAV", "Lyon Part-Dieu", UnitStatus::Available, 45.7601, 4.8590),
        ]
    }

    #[test]
    fn test_simple_orders_by_zone_then_distance() {
        let order = ZonePolicy::lyon().priority_order(&incident(3, &[]).location);
        let selection = select_simple(&fleet(), &incident(3, &["VSAV"]), &order, 5);
        let ids: Vec<UnitId> = selection.units.iter().map(|s| s.unit.id).collect();
        // Confluence zone: Confluence, Part-Dieu, Villeurbanne, Cusset.
        assert_eq!(ids, vec![2, 5, 1]);
        assert!(!selection.degraded_match);
        assert!(selection.units.iter().all(|s| s.preempt.is_none()));
    }

    #[test]
    fn test_simple_falls_back_to_any_type() {
        let order = ZonePolicy::lyon().priority_order(&incident(2, &[]).location);
        let selection = select_simple(&fleet(), &incident(2, &["EPA"]), &order, 2);
        assert!(selection.degraded_match);
        assert_eq!(selection.units.len(), 2);
    }

    #[test]
    fn test_simple_with_nothing_available() {
        let units: Vec<Unit> = fleet()
            .into_iter()
            .map(|u| Unit {
                status: UnitStatus::Offline,
                ..u
            })
            .collect();
        let selection = select_simple(&units, &incident(3, &[]), &[], 3);
        assert!(selection.units.is_empty());
        assert!(!selection.degraded_match);
    }

    #[test]
    fn test_rank_disqualifies_low_delta_preemption() {
        let mut actives = HashMap::new();
        actives.insert(4, active(4, 77, 2));
        let (ranked, _) = rank_candidates(
            &fleet(),
            &actives,
            &incident(3, &["VSAV"]),
            1,
            &[],
            &DispatchWeights::default(),
            &DispatchTuning::default(),
        );
        let engaged = ranked.iter().find(|c| c.unit_id == 4).unwrap();
        assert!(engaged.disqualified);
        assert!(engaged.requires_preemption());
        assert_eq!(ranked.last().unwrap().unit_id, 4);

        let selection = select_scored(&ranked, false, 5);
        assert!(selection.units.iter().all(|s| s.unit.id != 4));
    }

    #[test]
    fn test_rank_allows_high_delta_preemption() {
        let mut actives = HashMap::new();
        actives.insert(4, active(4, 77, 2));
        let weights = DispatchWeights {
            preemption_delta_weight: -200.0,
            ..DispatchWeights::default()
        };
        let (ranked, _) = rank_candidates(
            &fleet(),
            &actives,
            &incident(5, &["VSAV"]),
            1,
            &[],
            &weights,
            &DispatchTuning::default(),
        );
        // Delta 3 earns -540, which outweighs the extra travel from Part-Dieu.
        assert_eq!(ranked[0].unit_id, 4);
        assert!(!ranked[0].disqualified);
        let selection = select_scored(&ranked, false, 1);
        assert_eq!(selection.units[0].preempt, Some(400));
    }

    #[test]
    fn test_rank_skips_units_already_on_this_intervention() {
        let mut actives = HashMap::new();
        actives.insert(4, active(4, 1, 3));
        let (ranked, _) = rank_candidates(
            &fleet(),
            &actives,
            &incident(5, &[]),
            1,
            &[],
            &DispatchWeights::default(),
            &DispatchTuning::default(),
        );
        assert!(ranked.iter().all(|c| c.unit_id != 4));
    }

    #[test]
    fn test_rank_caps_candidate_pool() {
        let weights = DispatchWeights {
            max_candidates_per_dispatch: 2,
            ..DispatchWeights::default()
        };
        let (ranked, _) = rank_candidates(
            &fleet(),
            &HashMap::new(),
            &incident(3, &[]),
            1,
            &[],
            &weights,
            &DispatchTuning::default(),
        );
        assert_eq!(ranked.len(), 2);
        // The two Confluence units are closest to the incident.
        assert!(ranked.iter().all(|c| c.home_base.as_deref() == Some("Lyon Confluence")));
    }

    #[test]
    fn test_coverage_penalty_for_last_unit_at_base() {
        let (ranked, _) = rank_candidates(
            &fleet(),
            &HashMap::new(),
            &incident(3, &[]),
            1,
            &[],
            &DispatchWeights::default(),
            &DispatchTuning::default(),
        );
        let cusset = ranked.iter().find(|c| c.unit_id == 1).unwrap();
        assert_eq!(cusset.remaining_at_base, 0);
        assert!(cusset.score.coverage > 0.0);
        let confluence = ranked.iter().find(|c| c.unit_id == 2).unwrap();
        assert_eq!(confluence.remaining_at_base, 1);
        assert_eq!(confluence.score.coverage, 0.0);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Scored".parse::<SelectionStrategy>().unwrap(), SelectionStrategy::Scored);
        assert!("random".parse::<SelectionStrategy>().is_err());
    }
}
