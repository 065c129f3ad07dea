//! Convoy grouping and staggering.

use crate::geo::{GeoPoint, offset_by_meters, trim_end};
use crate::routing::RouteResult;

use super::selection::Selected;

/// Units leaving together on one shared route.
#[derive(Debug, Clone, PartialEq)]
pub struct Convoy {
    /// Home base the convoy leaves from; `None` for a single unit dispatched
    /// from wherever it currently is.
    pub base: Option<String>,
    pub members: Vec<Selected>,
}

impl Convoy {
    pub fn leader(&self) -> Option<&Selected> {
        self.members.first()
    }
}

/// Group picks by home base, keeping selection order.
///
/// Only free units are grouped. A preempted unit, or one without a home base,
/// is not at a station and travels alone.
pub fn group_by_base(picks: Vec<Selected>) -> Vec<Convoy> {
    let mut convoys: Vec<Convoy> = Vec::new();
    for pick in picks {
        let base = if pick.preempt.is_none() && pick.unit.status.is_dispatchable() {
            pick.unit.home_base.clone()
        } else {
            None
        };
        match base {
            Some(name) => {
                if let Some(convoy) = convoys
                    .iter_mut()
                    .find(|c| c.base.as_deref() == Some(name.as_str()))
                {
                    convoy.members.push(pick);
                } else {
                    convoys.push(Convoy {
                        base: Some(name),
                        members: vec![pick],
                    });
                }
            }
            None => convoys.push(Convoy {
                base: None,
                members: vec![pick],
            }),
        }
    }
    convoys
}

/// Route for convoy position `position`, held back `position * spacing`
/// meters from the end of the shared route.
///
/// Followers keep the leader's duration, so the whole convoy arrives in the
/// same tick. Under the progress model every member leaves from the same
/// point and the gap to the leader grows with progress: it is
/// `progress * position * spacing` along the way and reaches the full offset
/// on arrival.
///
/// When the shared route is too short for the offset, the destination itself
/// is shifted south by the same distance instead.
pub fn stagger(
    shared: &RouteResult,
    position: usize,
    spacing_meters: f64,
    destination: GeoPoint,
) -> RouteResult {
    let offset = position as f64 * spacing_meters;
    if position == 0 || offset <= 0.0 {
        return shared.clone();
    }

    match trim_end(&shared.geometry, offset) {
        Some(geometry) if shared.length_meters > offset => RouteResult {
            geometry,
            length_meters: shared.length_meters - offset,
            duration_seconds: shared.duration_seconds,
        },
        _ => {
            let mut geometry = shared.geometry.clone();
            let parked = offset_by_meters(&destination, -offset, 0.0);
            let len = geometry.len();
            match geometry.last_mut() {
                Some(last) if len >= 2 => *last = parked,
                _ => geometry.push(parked),
            }
            RouteResult {
                geometry,
                length_meters: shared.length_meters,
                duration_seconds: shared.duration_seconds,
            }
        }
    }
}
