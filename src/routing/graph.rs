//! In-process road graph.
//!
//! The network is loaded from JSON:
//!
//! ```json
//! {
//!   "nodes": [{ "id": 1, "lat": 45.76, "lon": 4.85 }],
//!   "edges": [{ "source": 1, "target": 2, "cost": 12.5, "reverse_cost": -1.0, "length_meters": 170.0 }]
//! }
//! ```
//!
//! `cost` and `reverse_cost` are traversal times in seconds; a negative value
//! closes that direction. A missing `reverse_cost` makes the edge two-way at
//! the forward cost. Endpoints are snapped to the nearest vertex of the largest
//! connected component only, so a query never starts on an unreachable sliver.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use pathfinding::prelude::{connected_components, dijkstra};
use serde::Deserialize;
use tracing::{debug, info};

use super::{RouteResult, RoutingProvider};
use crate::error::{Error, Result};
use crate::geo::{GeoPoint, haversine_meters, planar_distance_squared};

#[derive(Debug, Deserialize)]
struct NetworkFile {
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
}

#[derive(Debug, Deserialize)]
struct NodeRecord {
    id: i64,
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct EdgeRecord {
    source: i64,
    target: i64,
    cost: f64,
    reverse_cost: Option<f64>,
    length_meters: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    to: usize,
    /// Traversal time in milliseconds.
    cost_ms: u64,
    length_meters: f64,
}

/// A directed road graph with a precomputed main component.
#[derive(Debug, Clone)]
pub struct RoadGraph {
    points: Vec<GeoPoint>,
    arcs: Vec<Vec<Link>>,
    /// Vertices of the largest connected component.
    main_component: Vec<usize>,
}

fn to_millis(seconds: f64) -> Option<u64> {
    (seconds.is_finite() && seconds > 0.0).then(|| (seconds * 1000.0).round().max(1.0) as u64)
}

impl RoadGraph {
    /// Load a network file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::RoadNetwork(format!("{}: {e}", path.display())))?;
        let graph = Self::from_json(&text)?;
        info!(
            path = %path.display(),
            vertices = graph.vertex_count(),
            main_component = graph.main_component.len(),
            "Road network loaded"
        );
        Ok(graph)
    }

    /// Parse a network from its JSON representation.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: NetworkFile = serde_json::from_str(text)?;

        let mut index: HashMap<i64, usize> = HashMap::with_capacity(file.nodes.len());
        let mut points = Vec::with_capacity(file.nodes.len());
        for node in &file.nodes {
            if index.insert(node.id, points.len()).is_some() {
                return Err(Error::RoadNetwork(format!("duplicate node id {}", node.id)));
            }
            points.push(GeoPoint::new(node.lat, node.lon));
        }

        let mut arcs: Vec<Vec<Link>> = vec![Vec::new(); points.len()];
        for edge in &file.edges {
            let (Some(&a), Some(&b)) = (index.get(&edge.source), index.get(&edge.target)) else {
                return Err(Error::RoadNetwork(format!(
                    "edge {} -> {} references an unknown node",
                    edge.source, edge.target
                )));
            };
            let length_meters = edge
                .length_meters
                .unwrap_or_else(|| haversine_meters(&points[a], &points[b]));

            if let Some(cost_ms) = to_millis(edge.cost) {
                arcs[a].push(Link {
                    to: b,
                    cost_ms,
                    length_meters,
                });
            }
            if let Some(cost_ms) = to_millis(edge.reverse_cost.unwrap_or(edge.cost)) {
                arcs[b].push(Link {
                    to: a,
                    cost_ms,
                    length_meters,
                });
            }
        }

        Ok(Self::from_parts(points, arcs))
    }

    fn from_parts(points: Vec<GeoPoint>, arcs: Vec<Vec<Link>>) -> Self {
        // Components ignore direction: an arc in either direction links two vertices.
        let mut undirected: Vec<HashSet<usize>> = vec![HashSet::new(); points.len()];
        for (from, out) in arcs.iter().enumerate() {
            for arc in out {
                undirected[from].insert(arc.to);
                undirected[arc.to].insert(from);
            }
        }
        let starts: Vec<usize> = (0..points.len())
            .filter(|&v| !undirected[v].is_empty())
            .collect();
        let components = connected_components(&starts, |v| undirected[*v].iter().copied().collect::<Vec<_>>());

        let mut main_component: Vec<usize> = components
            .into_iter()
            .max_by_key(|c| c.len())
            .map(|c| c.into_iter().collect())
            .unwrap_or_default();
        main_component.sort_unstable();

        Self {
            points,
            arcs,
            main_component,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.main_component.is_empty()
    }

    /// Nearest vertex of the main component to `point`.
    fn nearest_vertex(&self, point: &GeoPoint) -> Option<usize> {
        self.main_component.iter().copied().min_by(|&a, &b| {
            planar_distance_squared(&self.points[a], point)
                .total_cmp(&planar_distance_squared(&self.points[b], point))
        })
    }

    /// Shortest-time route between the vertices nearest to `from` and `to`.
    pub fn shortest_route(&self, from: &GeoPoint, to: &GeoPoint) -> Option<RouteResult> {
        let start = self.nearest_vertex(from)?;
        let goal = self.nearest_vertex(to)?;
        if start == goal {
            return None;
        }

        let (path, cost_ms) = dijkstra(
            &start,
            |&v| self.arcs[v].iter().map(|arc| (arc.to, arc.cost_ms)).collect::<Vec<_>>(),
            |&v| v == goal,
        )?;

        let length_meters: f64 = path
            .windows(2)
            .map(|w| self.cheapest_arc(w[0], w[1]).map_or(0.0, |arc| arc.length_meters))
            .sum();
        if length_meters <= 0.0 {
            return None;
        }

        debug!(start, goal, hops = path.len() - 1, cost_ms, "Graph route computed");
        Some(RouteResult {
            geometry: path.iter().map(|&v| self.points[v]).collect(),
            length_meters,
            duration_seconds: cost_ms as f64 / 1000.0,
        })
    }

    fn cheapest_arc(&self, from: usize, to: usize) -> Option<&Link> {
        self.arcs[from]
            .iter()
            .filter(|arc| arc.to == to)
            .min_by_key(|arc| arc.cost_ms)
    }
}

impl RoutingProvider for RoadGraph {
    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Option<RouteResult> {
        self.shortest_route(&from, &to)
    }
}
