//! Candidate scoring.
//!
//! ```text
//! cost = w_travel * travel_seconds
//!      + w_coverage * (reserve - remaining) * 100     when remaining < reserve
//!      + w_preempt * severity_delta + reassign_cost   when currently assigned
//! ```
//!
//! Lower is better. An assigned unit whose current severity is unknown, or
//! whose severity delta is below the preemption threshold, is disqualified.

use std::cmp::Ordering;

use serde::{Serialize, Serializer};

use crate::config::DispatchWeights;

/// Whether the candidate is free or already working an intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engagement {
    Available,
    /// Assigned to an intervention of the given severity, if known.
    Assigned { severity: Option<u8> },
}

/// Everything the scorer needs to know about one unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateFactors {
    pub travel_time_seconds: f64,
    /// Dispatchable units left at the candidate's base once it leaves.
    pub remaining_at_base: u32,
    pub engagement: Engagement,
    pub target_severity: u8,
}

/// A comparable cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Cost(f64),
    Disqualified,
}

impl Score {
    pub fn is_disqualified(&self) -> bool {
        matches!(self, Score::Disqualified)
    }

    pub fn cost(&self) -> Option<f64> {
        match self {
            Score::Cost(c) => Some(*c),
            Score::Disqualified => None,
        }
    }

    /// Total order with disqualified scores last.
    pub fn compare(&self, other: &Score) -> Ordering {
        match (self, other) {
            (Score::Cost(a), Score::Cost(b)) => a.total_cmp(b),
            (Score::Cost(_), Score::Disqualified) => Ordering::Less,
            (Score::Disqualified, Score::Cost(_)) => Ordering::Greater,
            (Score::Disqualified, Score::Disqualified) => Ordering::Equal,
        }
    }
}

impl Serialize for Score {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Score::Cost(c) => serializer.serialize_some(c),
            Score::Disqualified => serializer.serialize_none(),
        }
    }
}

/// Score with its components, kept for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub travel: f64,
    pub coverage: f64,
    /// Preemption component; zero for available units.
    pub preemption: f64,
    pub total: Score,
}

pub fn travel_score(travel_time_seconds: f64, weights: &DispatchWeights) -> f64 {
    weights.travel_time_weight * travel_time_seconds
}

pub fn coverage_score(remaining_at_base: u32, weights: &DispatchWeights) -> f64 {
    if remaining_at_base >= weights.min_reserve_per_base {
        return 0.0;
    }
    let shortfall = f64::from(weights.min_reserve_per_base - remaining_at_base);
    weights.coverage_penalty_weight * shortfall * 100.0
}

/// Preemption component, or `None` when the unit cannot be taken.
pub fn preemption_score(
    engagement: Engagement,
    target_severity: u8,
    weights: &DispatchWeights,
) -> Option<f64> {
    match engagement {
        Engagement::Available => Some(0.0),
        Engagement::Assigned { severity: None } => None,
        Engagement::Assigned {
            severity: Some(current),
        } => {
            let delta = i32::from(target_severity) - i32::from(current);
            if delta < weights.preemption_severity_threshold {
                None
            } else {
                Some(weights.preemption_delta_weight * f64::from(delta) + weights.reassignment_base_cost)
            }
        }
    }
}

/// Score one candidate.
pub fn score(factors: &CandidateFactors, weights: &DispatchWeights) -> ScoreBreakdown {
    let travel = travel_score(factors.travel_time_seconds, weights);
    let coverage = coverage_score(factors.remaining_at_base, weights);
    match preemption_score(factors.engagement, factors.target_severity, weights) {
        Some(preemption) => ScoreBreakdown {
            travel,
            coverage,
            preemption,
            total: Score::Cost(travel + coverage + preemption),
        },
        None => ScoreBreakdown {
            travel,
            coverage,
            preemption: 0.0,
            total: Score::Disqualified,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn available(travel: f64, remaining: u32) -> CandidateFactors {
        CandidateFactors {
            travel_time_seconds: travel,
            remaining_at_base: remaining,
            engagement: Engagement::Available,
            target_severity: 3,
        }
    }

    #[test]
    fn test_travel_weighted_costs() {
        let weights = DispatchWeights::default();
        let a = score(&available(480.0, 2), &weights);
        let b = score(&available(840.0, 3), &weights);
        assert!((a.total.cost().unwrap() - 336.0).abs() < 1e-9);
        assert!((b.total.cost().unwrap() - 588.0).abs() < 1e-9);
        assert_eq!(a.total.compare(&b.total), Ordering::Less);
    }

    #[test]
    fn test_cost_increases_with_travel_time() {
        let weights = DispatchWeights::default();
        let mut previous = f64::NEG_INFINITY;
        for travel in [0.0, 10.0, 60.0, 600.0, 6000.0] {
            let cost = score(&available(travel, 0), &weights).total.cost().unwrap();
            assert!(cost > previous);
            previous = cost;
        }
    }

    #[test]
    fn test_coverage_penalty_below_reserve_only() {
        let weights = DispatchWeights {
            min_reserve_per_base: 2,
            ..DispatchWeights::default()
        };
        assert!((coverage_score(0, &weights) - 60.0).abs() < 1e-9);
        assert!((coverage_score(1, &weights) - 30.0).abs() < 1e-9);
        assert_eq!(coverage_score(2, &weights), 0.0);
        assert_eq!(coverage_score(7, &weights), 0.0);
    }

    #[test]
    fn test_preemption_allowed_with_large_enough_delta() {
        let weights = DispatchWeights::default();
        let factors = CandidateFactors {
            travel_time_seconds: 0.0,
            remaining_at_base: 5,
            engagement: Engagement::Assigned { severity: Some(2) },
            target_severity: 5,
        };
        let breakdown = score(&factors, &weights);
        let expected = weights.preemption_delta_weight * 3.0 + weights.reassignment_base_cost;
        assert_eq!(breakdown.preemption, expected);
        assert_eq!(breakdown.total, Score::Cost(expected));
    }

    #[test]
    fn test_preemption_gated_by_threshold() {
        let extreme = DispatchWeights {
            preemption_delta_weight: -1e9,
            reassignment_base_cost: -1e9,
            ..DispatchWeights::default()
        };
        for weights in [DispatchWeights::default(), extreme] {
            let below = CandidateFactors {
                travel_time_seconds: 10.0,
                remaining_at_base: 5,
                engagement: Engagement::Assigned { severity: Some(2) },
                target_severity: 3,
            };
            assert!(score(&below, &weights).total.is_disqualified());

            let unknown = CandidateFactors {
                engagement: Engagement::Assigned { severity: None },
                target_severity: 5,
                ..below
            };
            assert!(score(&unknown, &weights).total.is_disqualified());
        }
    }

    #[test]
    fn test_disqualified_sorts_last() {
        let mut scores = [Score::Disqualified, Score::Cost(10.0), Score::Cost(-5.0)];
        scores.sort_by(|a, b| a.compare(b));
        assert_eq!(
            scores,
            [Score::Cost(-5.0), Score::Cost(10.0), Score::Disqualified]
        );
    }

    #[test]
    fn test_score_serializes_disqualified_as_null() {
        assert_eq!(serde_json::to_string(&Score::Disqualified).unwrap(), "null");
        assert_eq!(serde_json::to_string(&Score::Cost(1.5)).unwrap(), "1.5");
    }
}
