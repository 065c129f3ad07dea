//! Route memoisation.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::debug;

use super::{RouteResult, RoutingProvider};
use crate::geo::GeoPoint;

pub const DEFAULT_CAPACITY: usize = 100;

/// Endpoints rounded to five decimals (about one meter).
type RouteKey = (i64, i64, i64, i64);

fn round5(value: f64) -> i64 {
    (value * 100_000.0).round() as i64
}

fn key(from: &GeoPoint, to: &GeoPoint) -> RouteKey {
    (round5(from.lat), round5(from.lon), round5(to.lat), round5(to.lon))
}

#[derive(Default)]
struct Lru {
    entries: HashMap<RouteKey, RouteResult>,
    /// Least recently used first.
    order: VecDeque<RouteKey>,
}

impl Lru {
    fn touch(&mut self, key: RouteKey) {
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key);
    }
}

/// Wraps a provider and caches its successful answers.
pub struct CachedRouter<R> {
    inner: R,
    capacity: usize,
    cache: Mutex<Lru>,
}

impl<R: RoutingProvider> CachedRouter<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            cache: Mutex::new(Lru::default()),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub async fn len(&self) -> usize {
        self.cache.lock().await.entries.len()
    }
}

impl<R: RoutingProvider> RoutingProvider for CachedRouter<R> {
    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Option<RouteResult> {
        let key = key(&from, &to);
        {
            let mut cache = self.cache.lock().await;
            if let Some(hit) = cache.entries.get(&key).cloned() {
                cache.touch(key);
                debug!("Route cache hit");
                return Some(hit);
            }
        }

        let route = self.inner.route(from, to).await?;

        let mut cache = self.cache.lock().await;
        if !cache.entries.contains_key(&key) && cache.entries.len() >= self.capacity {
            if let Some(oldest) = cache.order.pop_front() {
                cache.entries.remove(&oldest);
            }
        }
        cache.entries.insert(key, route.clone());
        cache.touch(key);
        Some(route)
    }
}
