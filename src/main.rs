//! Fleet Dispatch server.
//!
//! Seeds an empty store with a fleet, then runs three loops next to the HTTP
//! control surface: the movement simulator, the pending-intervention sweep
//! and the route-repair worker.
//!
//! Configuration is read from `FLEET_*` environment variables; see
//! [`EngineConfig`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use fleet_dispatch::api::{self, AppState};
use fleet_dispatch::config::{ConfigHandle, EngineConfig, FleetFile};
use fleet_dispatch::dispatch::Dispatcher;
use fleet_dispatch::routing::{CachedRouter, HttpRouter, RoadGraph, RoutingBackend};
use fleet_dispatch::simulation::{RandomDraws, Simulator};
use fleet_dispatch::storage::{Storage, Store};

/// Pending repair requests before the simulator starts dropping them.
const REPAIR_QUEUE: usize = 64;

async fn seed_fleet(storage: &Storage, fleet: &FleetFile) -> anyhow::Result<()> {
    if !storage.list_units().await?.is_empty() {
        return Ok(());
    }
    for base in &fleet.bases {
        storage.insert_base(base).await?;
    }
    for unit in &fleet.units {
        storage.insert_unit(unit).await?;
    }
    info!(bases = fleet.bases.len(), units = fleet.units.len(), "Seeded empty fleet");
    Ok(())
}

fn routing_backend(config: &EngineConfig) -> anyhow::Result<RoutingBackend> {
    if let Some(path) = &config.road_network {
        let graph = RoadGraph::load(path)
            .with_context(|| format!("loading road network {}", path.display()))?;
        info!(vertices = graph.vertex_count(), "Routing over local road network");
        return Ok(RoutingBackend::Graph(graph));
    }
    if let Some(url) = &config.routing_url {
        info!(routing_url = %url, "Routing through external service");
        let router = HttpRouter::with_timeouts(
            url,
            config.routing_connect_timeout,
            config.routing_timeout,
        )
        .context("building routing service client")?;
        return Ok(RoutingBackend::Http(router));
    }
    warn!("No road network configured; every route falls back to a straight line");
    Ok(RoutingBackend::Direct)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("fleet_dispatch=info".parse()?))
        .init();

    let config = EngineConfig::from_env()?;
    info!(
        port = config.port,
        database_url = %config.database_url,
        strategy = %config.strategy,
        "Starting Fleet Dispatch"
    );

    let storage = Arc::new(Storage::new(&config.database_url).await?);

    let fleet = match &config.fleet_file {
        Some(path) => FleetFile::load(path)?,
        None => FleetFile::lyon(),
    };
    seed_fleet(&storage, &fleet).await?;

    let router = Arc::new(CachedRouter::new(routing_backend(&config)?));

    let dispatcher = Arc::new(
        Dispatcher::new(storage.clone(), router.clone(), ConfigHandle::default())
            .with_zones(fleet.zone_policy())
            .with_tuning(config.dispatch)
            .with_strategy(config.strategy),
    );
    dispatcher.reload_config().await?;

    let (repair_tx, repair_rx) = mpsc::channel(REPAIR_QUEUE);
    tokio::spawn(dispatcher.clone().serve_repairs(repair_rx));
    tokio::spawn(dispatcher.clone().run_sweep(config.dispatch_interval));

    let simulator = Simulator::new(storage.clone(), router, RandomDraws::new(config.seed))
        .with_tuning(config.simulation)
        .with_model(config.movement_model)
        .with_return_trips(config.return_trips)
        .with_repairs(repair_tx);
    let vehicles = simulator.subscribe();
    tokio::spawn(simulator.run(config.tick_interval));

    let app = api::router(AppState { dispatcher, vehicles });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Fleet Dispatch is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
