//! Status transition rules for units, interventions and assignments.
//!
//! Every status change goes through [`Lifecycle::predecessors`]: the store
//! turns the list into a conditional `UPDATE ... WHERE status IN (...)`, so an
//! out-of-order transition simply matches no row. Repeating a transition that
//! already happened is reported as [`Transition::Unchanged`], never as an error.

use crate::error::{Error, Result};
use crate::model::{AssignmentStatus, InterventionStatus, UnitStatus};

/// Outcome of checking a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Unchanged,
}

/// A status type with a fixed set of legal transitions.
pub trait Lifecycle: Copy + Eq + Sized + 'static {
    /// Entity name used in errors and logs.
    const ENTITY: &'static str;

    /// Statuses from which `self` may be entered.
    fn predecessors(self) -> &'static [Self];

    fn as_status_str(self) -> &'static str;

    fn can_become(self, to: Self) -> bool {
        to.predecessors().contains(&self)
    }

    /// Validate `self -> to`.
    fn transition(self, to: Self) -> Result<Transition> {
        if self == to {
            Ok(Transition::Unchanged)
        } else if self.can_become(to) {
            Ok(Transition::Applied)
        } else {
            Err(Error::IllegalTransition {
                entity: Self::ENTITY,
                from: self.as_status_str().to_string(),
                to: to.as_status_str().to_string(),
            })
        }
    }
}

impl Lifecycle for UnitStatus {
    const ENTITY: &'static str = "unit";

    fn predecessors(self) -> &'static [Self] {
        use UnitStatus::*;
        match self {
            // Engaged units may be preempted onto a new intervention.
            UnderWay => &[Available, AvailableHidden, OnSite],
            OnSite => &[UnderWay],
            Available => &[UnderWay, OnSite, AvailableHidden],
            AvailableHidden => &[Available],
            Unavailable => &[Available, AvailableHidden, UnderWay, OnSite, Offline],
            Offline => &[Available, AvailableHidden, UnderWay, OnSite, Unavailable],
        }
    }

    fn as_status_str(self) -> &'static str {
        self.as_str()
    }
}

impl Lifecycle for InterventionStatus {
    const ENTITY: &'static str = "intervention";

    fn predecessors(self) -> &'static [Self] {
        use InterventionStatus::*;
        match self {
            Created => &[],
            OnSite => &[Created],
            Completed => &[OnSite],
            Cancelled => &[Created, OnSite],
        }
    }

    fn as_status_str(self) -> &'static str {
        self.as_str()
    }
}

impl Lifecycle for AssignmentStatus {
    const ENTITY: &'static str = "assignment";

    fn predecessors(self) -> &'static [Self] {
        use AssignmentStatus::*;
        match self {
            Dispatched => &[],
            Arrived => &[Dispatched],
            Released => &[Dispatched, Arrived],
            Cancelled => &[Dispatched],
        }
    }

    fn as_status_str(self) -> &'static str {
        self.as_str()
    }
}

/// Quoted, comma-separated predecessor list for an SQL `IN (...)` clause.
///
/// Returns `NULL` for statuses with no predecessor so the clause matches
/// nothing.
pub fn predecessor_list<S: Lifecycle>(to: S) -> String {
    let list = to.predecessors();
    if list.is_empty() {
        return "NULL".to_string();
    }
    list.iter()
        .map(|s| format!("'{}'", s.as_status_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_forward_order() {
        use UnitStatus::*;
        assert_eq!(Available.transition(UnderWay).unwrap(), Transition::Applied);
        assert_eq!(UnderWay.transition(OnSite).unwrap(), Transition::Applied);
        assert_eq!(OnSite.transition(Available).unwrap(), Transition::Applied);
        assert_eq!(Available.transition(AvailableHidden).unwrap(), Transition::Applied);
        assert!(Available.transition(OnSite).is_err());
        assert!(AvailableHidden.transition(OnSite).is_err());
    }

    #[test]
    fn test_intervention_cannot_skip_on_site() {
        use InterventionStatus::*;
        let err = Created.transition(Completed).unwrap_err();
        assert_eq!(
            err.to_string(),
            "illegal intervention transition: created -> completed"
        );
        assert_eq!(Created.transition(OnSite).unwrap(), Transition::Applied);
        assert_eq!(OnSite.transition(Completed).unwrap(), Transition::Applied);
        assert!(Completed.transition(OnSite).is_err());
        assert!(Cancelled.transition(Created).is_err());
    }

    #[test]
    fn test_repeated_transition_is_unchanged() {
        assert_eq!(
            AssignmentStatus::Arrived
                .transition(AssignmentStatus::Arrived)
                .unwrap(),
            Transition::Unchanged
        );
        assert_eq!(
            UnitStatus::OnSite.transition(UnitStatus::OnSite).unwrap(),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_assignment_release_paths() {
        use AssignmentStatus::*;
        assert!(Dispatched.can_become(Released));
        assert!(Arrived.can_become(Released));
        assert!(!Released.can_become(Arrived));
        assert!(!Arrived.can_become(Cancelled));
    }

    #[test]
    fn test_predecessor_list() {
        assert_eq!(predecessor_list(InterventionStatus::Completed), "'on_site'");
        assert_eq!(
            predecessor_list(AssignmentStatus::Released),
            "'dispatched', 'arrived'"
        );
        assert_eq!(predecessor_list(InterventionStatus::Created), "NULL");
    }
}
