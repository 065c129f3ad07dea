//! Base/zone priority resolution.
//!
//! The zone of an incident is its nearest base. Each zone can name a
//! hand-tuned preference order over the bases; bases the order leaves out are
//! appended by distance, so no base is ever excluded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::geo::{GeoPoint, planar_distance_squared};
use crate::model::Base;

pub const VILLEURBANNE: &str = "Villeurbanne";
pub const LYON_CONFLUENCE: &str = "Lyon Confluence";
pub const LYON_PART_DIEU: &str = "Lyon Part-Dieu";
pub const CUSSET: &str = "Cusset";

/// Ordered base preferences per zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonePolicy {
    bases: Vec<Base>,
    #[serde(default)]
    priorities: HashMap<String, Vec<String>>,
}

impl ZonePolicy {
    pub fn new(bases: Vec<Base>) -> Self {
        Self {
            bases,
            priorities: HashMap::new(),
        }
    }

    /// Name the preference order for incidents whose nearest base is `zone`.
    pub fn with_priority(mut self, zone: impl Into<String>, order: &[&str]) -> Self {
        self.priorities
            .insert(zone.into(), order.iter().map(|s| s.to_string()).collect());
        self
    }

    /// The four Lyon stations with their dispatch preferences.
    pub fn lyon() -> Self {
        Self::new(vec![
            Base::new(VILLEURBANNE, 45.7719, 4.8902),
            Base::new(LYON_CONFLUENCE, 45.7421, 4.8158),
            Base::new(LYON_PART_DIEU, 45.7601, 4.8590),
            Base::new(CUSSET, 45.7744, 4.8957),
        ])
        .with_priority(
            LYON_CONFLUENCE,
            &[LYON_CONFLUENCE, LYON_PART_DIEU, VILLEURBANNE, CUSSET],
        )
        .with_priority(
            LYON_PART_DIEU,
            &[LYON_PART_DIEU, VILLEURBANNE, LYON_CONFLUENCE, CUSSET],
        )
        .with_priority(
            VILLEURBANNE,
            &[VILLEURBANNE, LYON_PART_DIEU, CUSSET, LYON_CONFLUENCE],
        )
        .with_priority(
            CUSSET,
            &[CUSSET, VILLEURBANNE, LYON_PART_DIEU, LYON_CONFLUENCE],
        )
    }

    pub fn bases(&self) -> &[Base] {
        &self.bases
    }

    pub fn priorities(&self) -> &HashMap<String, Vec<String>> {
        &self.priorities
    }

    pub fn base(&self, name: &str) -> Option<&Base> {
        self.bases.iter().find(|b| b.name == name)
    }

    /// Nearest base to `location`, by squared planar distance.
    pub fn zone_of(&self, location: &GeoPoint) -> Option<&Base> {
        self.bases.iter().min_by(|a, b| {
            planar_distance_squared(&a.location, location)
                .total_cmp(&planar_distance_squared(&b.location, location))
        })
    }

    /// Base names in dispatch preference order for an incident at `location`.
    pub fn priority_order(&self, location: &GeoPoint) -> Vec<String> {
        let Some(zone) = self.zone_of(location) else {
            return Vec::new();
        };
        let mut by_distance: Vec<&Base> = self.bases.iter().collect();
        by_distance.sort_by(|a, b| {
            planar_distance_squared(&a.location, location)
                .total_cmp(&planar_distance_squared(&b.location, location))
        });

        let mut order: Vec<String> = Vec::with_capacity(self.bases.len());
        if let Some(named) = self.priorities.get(&zone.name) {
            for name in named {
                if self.base(name).is_some() && !order.contains(name) {
                    order.push(name.clone());
                }
            }
        }
        for base in by_distance {
            if !order.contains(&base.name) {
                order.push(base.name.clone());
            }
        }
        order
    }
}

impl Default for ZonePolicy {
    fn default() -> Self {
        Self::lyon()
    }
}

/// Position of `home_base` in `order`; unknown or missing bases sort last.
pub fn priority_index(order: &[String], home_base: Option<&str>) -> usize {
    home_base
        .and_then(|name| order.iter().position(|b| b == name))
        .unwrap_or(order.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_is_nearest_base() {
        let policy = ZonePolicy::lyon();
        let near_confluence = GeoPoint::new(45.7430, 4.8170);
        assert_eq!(policy.zone_of(&near_confluence).unwrap().name, LYON_CONFLUENCE);
    }

    #[test]
    fn test_named_order_for_zone() {
        let policy = ZonePolicy::lyon();
        let order = policy.priority_order(&GeoPoint::new(45.7430, 4.8170));
        assert_eq!(
            order,
            vec![LYON_CONFLUENCE, LYON_PART_DIEU, VILLEURBANNE, CUSSET]
        );
    }

    #[test]
    fn test_unlisted_zone_falls_back_to_distance() {
        let policy = ZonePolicy::new(vec![
            Base::new("North", 46.0, 5.0),
            Base::new("South", 45.0, 5.0),
            Base::new("Middle", 45.5, 5.0),
        ]);
        let order = policy.priority_order(&GeoPoint::new(45.1, 5.0));
        assert_eq!(order, vec!["South", "Middle", "North"]);
    }

    #[test]
    fn test_partial_order_keeps_every_base() {
        let policy = ZonePolicy::new(vec![
            Base::new("A", 45.0, 5.0),
            Base::new("B", 45.1, 5.0),
            Base::new("C", 45.2, 5.0),
        ])
        .with_priority("A", &["C", "Ghost"]);
        let order = policy.priority_order(&GeoPoint::new(45.0, 5.0));
        assert_eq!(order, vec!["C", "A", "B"]);
    }

    #[test]
    fn test_priority_index_for_unknown_base() {
        let order = vec!["A".to_string(), "B".to_string()];
        assert_eq!(priority_index(&order, Some("B")), 1);
        assert_eq!(priority_index(&order, Some("Z")), 2);
        assert_eq!(priority_index(&order, None), 2);
    }

    #[test]
    fn test_empty_policy() {
        let policy = ZonePolicy::new(Vec::new());
        assert!(policy.priority_order(&GeoPoint::new(0.0, 0.0)).is_empty());
        assert!(policy.zone_of(&GeoPoint::new(0.0, 0.0)).is_none());
    }
}
