//! Fleet Dispatch - emergency-vehicle dispatch and movement simulation.
//!
//! # Overview
//!
//! When an incident is reported, the engine opens an intervention, picks
//! suitable units from the fleet and sends them along road routes. A
//! simulator then advances every unit towards its destination on a fixed
//! tick, marks arrivals, rolls for intervention completion and sends units
//! back to their home base.
//!
//! The store is the source of truth. The simulator keeps only in-memory
//! movement state derived from it, so a restart resumes where the last
//! persisted progress left off.
//!
//! # Modules
//!
//! - [`model`]: Units, incidents, interventions, assignments, routes
//! - [`lifecycle`]: Legal status transitions
//! - [`storage`]: Persistence seams and the SQLite store
//! - [`routing`]: Road graph, HTTP router, route cache, straight-line fallback
//! - [`zones`]: Base priority per incident zone
//! - [`scoring`]: Candidate cost for the scored strategy
//! - [`dispatch`]: Unit selection, convoys, claims and route persistence
//! - [`simulation`]: Movement models, arrivals, completion, return trips
//! - [`config`]: Environment configuration and live dispatch weights
//! - [`api`]: HTTP control surface

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod geo;
pub mod lifecycle;
pub mod model;
pub mod routing;
pub mod scoring;
pub mod simulation;
pub mod storage;
pub mod zones;

pub use error::{Error, Result};
