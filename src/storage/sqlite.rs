//! SQLite implementation of the persistence collaborators.
//!
//! Timestamps are unix seconds, polylines are GeoJSON text. Status updates are
//! conditional on the legal predecessor statuses, so the row itself is the
//! source of truth for ordering: an update that arrives late matches nothing.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tracing::{debug, info};

use super::{Claim, StatusSink, Store};
use crate::error::{Error, Result};
use crate::geo::GeoPoint;
use crate::lifecycle::predecessor_list;
use crate::model::{
    ActiveAssignment, Assignment, AssignmentId, AssignmentRole, AssignmentStatus, Base,
    DecisionMode, Incident, IncidentId, Intervention, InterventionId, InterventionStatus,
    NewIncident, NewRoute, NewUnit, PendingIntervention, Route, Unit, UnitId, UnitStatus,
    clamp_severity,
};
use crate::routing::{from_geojson, to_geojson};

const ACTIVE_ASSIGNMENT: &str = "'dispatched', 'arrived'";
const ENGAGED_UNIT: &str = "'under_way', 'on_site'";
const ACTIVE_INTERVENTION: &str = "'created', 'on_site'";

const UNIT_COLUMNS: &str =
    "id, call_sign, unit_type_code, home_base, status, lat, lon, last_contact_at";
const INTERVENTION_COLUMNS: &str =
    "id, event_id, status, priority, decision_mode, created_at, started_at, completed_at";
const ASSIGNMENT_COLUMNS: &str =
    "a.id, a.intervention_id, a.unit_id, a.role, a.status, a.dispatched_at, a.arrived_at, a.released_at";
const ROUTE_SELECT: &str = r#"
    SELECT r.unit_id, r.intervention_id, r.route_geojson, r.route_length_meters,
           r.estimated_duration_seconds, r.progress_percent,
           r.origin_lat, r.origin_lon, r.destination_lat, r.destination_lon,
           r.current_lat, r.current_lon, r.revision, e.severity AS severity
    FROM unit_routes r
    LEFT JOIN interventions i ON i.id = r.intervention_id
    LEFT JOIN events e ON e.id = i.event_id
"#;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

fn severity_from(value: i64) -> u8 {
    clamp_severity(value.clamp(0, i64::from(u8::MAX)) as u8)
}

fn unit_from_row(row: &SqliteRow) -> Result<Unit> {
    let status: String = row.try_get("status")?;
    Ok(Unit {
        id: row.try_get("id")?,
        call_sign: row.try_get("call_sign")?,
        unit_type_code: row.try_get("unit_type_code")?,
        home_base: row.try_get("home_base")?,
        status: status.parse()?,
        location: GeoPoint::new(row.try_get("lat")?, row.try_get("lon")?),
        last_contact_at: row
            .try_get::<Option<i64>, _>("last_contact_at")?
            .map(from_ts),
    })
}

/// Map an event row whose columns carry `prefix`.
fn incident_from_row(row: &SqliteRow, prefix: &str) -> Result<Incident> {
    let col = |name: &str| format!("{prefix}{name}");
    let required: String = row.try_get(col("required_unit_types").as_str())?;
    Ok(Incident {
        id: row.try_get(col("id").as_str())?,
        type_code: row.try_get(col("type_code").as_str())?,
        severity: severity_from(row.try_get(col("severity").as_str())?),
        required_unit_types: serde_json::from_str(&required)?,
        location: GeoPoint::new(
            row.try_get(col("lat").as_str())?,
            row.try_get(col("lon").as_str())?,
        ),
        created_at: from_ts(row.try_get(col("created_at").as_str())?),
        closed_at: row
            .try_get::<Option<i64>, _>(col("closed_at").as_str())?
            .map(from_ts),
    })
}

fn intervention_from_row(row: &SqliteRow) -> Result<Intervention> {
    let status: String = row.try_get("status")?;
    let mode: String = row.try_get("decision_mode")?;
    Ok(Intervention {
        id: row.try_get("id")?,
        incident_id: row.try_get("event_id")?,
        status: status.parse()?,
        priority: row.try_get("priority")?,
        decision_mode: mode.parse()?,
        created_at: from_ts(row.try_get("created_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_ts),
        completed_at: row.try_get::<Option<i64>, _>("completed_at")?.map(from_ts),
    })
}

fn assignment_from_row(row: &SqliteRow) -> Result<Assignment> {
    let status: String = row.try_get("status")?;
    let role: Option<String> = row.try_get("role")?;
    Ok(Assignment {
        id: row.try_get("id")?,
        intervention_id: row.try_get("intervention_id")?,
        unit_id: row.try_get("unit_id")?,
        role: role.map(|r| r.parse()).transpose()?,
        status: status.parse()?,
        dispatched_at: from_ts(row.try_get("dispatched_at")?),
        arrived_at: row.try_get::<Option<i64>, _>("arrived_at")?.map(from_ts),
        released_at: row.try_get::<Option<i64>, _>("released_at")?.map(from_ts),
    })
}

fn route_from_row(row: &SqliteRow) -> Result<Route> {
    let geojson: String = row.try_get("route_geojson")?;
    let current_lat: Option<f64> = row.try_get("current_lat")?;
    let current_lon: Option<f64> = row.try_get("current_lon")?;
    Ok(Route {
        unit_id: row.try_get("unit_id")?,
        intervention_id: row.try_get("intervention_id")?,
        // Unreadable geometry surfaces as an empty route, which callers rebuild.
        geometry: from_geojson(&geojson).unwrap_or_default(),
        length_meters: row.try_get("route_length_meters")?,
        duration_seconds: row.try_get("estimated_duration_seconds")?,
        progress_percent: row.try_get("progress_percent")?,
        origin: GeoPoint::new(row.try_get("origin_lat")?, row.try_get("origin_lon")?),
        destination: GeoPoint::new(
            row.try_get("destination_lat")?,
            row.try_get("destination_lon")?,
        ),
        current: current_lat
            .zip(current_lon)
            .map(|(lat, lon)| GeoPoint::new(lat, lon)),
        revision: row.try_get("revision")?,
        severity: row.try_get::<Option<i64>, _>("severity")?.map(severity_from),
    })
}

impl Storage {
    /// Connect and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:fleet.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to an in-memory database sees its own empty
        // database, so those are pinned to a single long-lived connection.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(database_url).await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;
        info!(database_url, "Storage ready");

        Ok(storage)
    }

    async fn initialize_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS bases (
                name TEXT PRIMARY KEY,
                lat REAL NOT NULL,
                lon REAL NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS units (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                call_sign TEXT NOT NULL UNIQUE,
                unit_type_code TEXT NOT NULL,
                home_base TEXT,
                status TEXT NOT NULL DEFAULT 'available',
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                last_contact_at INTEGER,
                route_revision INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type_code TEXT NOT NULL,
                severity INTEGER NOT NULL,
                required_unit_types TEXT NOT NULL DEFAULT '[]',
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                created_at INTEGER NOT NULL,
                closed_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS interventions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id INTEGER NOT NULL REFERENCES events(id),
                status TEXT NOT NULL,
                priority INTEGER NOT NULL,
                decision_mode TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS assignments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                intervention_id INTEGER NOT NULL REFERENCES interventions(id),
                unit_id INTEGER NOT NULL REFERENCES units(id),
                role TEXT,
                status TEXT NOT NULL,
                dispatched_at INTEGER NOT NULL,
                arrived_at INTEGER,
                released_at INTEGER
            )
            "#,
            // At most one active assignment per unit.
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_active_unit
            ON assignments(unit_id) WHERE status IN ('dispatched', 'arrived')
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_assignments_intervention
            ON assignments(intervention_id, status)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS unit_routes (
                unit_id INTEGER PRIMARY KEY REFERENCES units(id),
                intervention_id INTEGER REFERENCES interventions(id),
                route_geojson TEXT NOT NULL,
                route_length_meters REAL NOT NULL,
                estimated_duration_seconds REAL NOT NULL,
                progress_percent REAL NOT NULL DEFAULT 0,
                origin_lat REAL NOT NULL,
                origin_lon REAL NOT NULL,
                destination_lat REAL NOT NULL,
                destination_lon REAL NOT NULL,
                current_lat REAL,
                current_lon REAL,
                revision INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_config (
                key TEXT PRIMARY KEY,
                value REAL NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Free the given units and release or cancel the intervention's active
    /// assignments inside `tx`. Returns the units whose status changed.
    async fn free_units(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        intervention_id: InterventionId,
        cancel_dispatched: bool,
        now: i64,
    ) -> Result<Vec<UnitId>> {
        let units: Vec<UnitId> = sqlx::query_scalar(&format!(
            "SELECT unit_id FROM assignments WHERE intervention_id = ? AND status IN ({ACTIVE_ASSIGNMENT})"
        ))
        .bind(intervention_id)
        .fetch_all(&mut **tx)
        .await?;

        if cancel_dispatched {
            sqlx::query(
                "UPDATE assignments SET status = 'cancelled', released_at = ? WHERE intervention_id = ? AND status = 'dispatched'",
            )
            .bind(now)
            .bind(intervention_id)
            .execute(&mut **tx)
            .await?;
        }
        sqlx::query(&format!(
            "UPDATE assignments SET status = 'released', released_at = ? WHERE intervention_id = ? AND status IN ({ACTIVE_ASSIGNMENT})"
        ))
        .bind(now)
        .bind(intervention_id)
        .execute(&mut **tx)
        .await?;

        let mut freed = Vec::with_capacity(units.len());
        for unit_id in units {
            let result = sqlx::query(&format!(
                "UPDATE units SET status = 'available', last_contact_at = ? WHERE id = ? AND status IN ({ENGAGED_UNIT})"
            ))
            .bind(now)
            .bind(unit_id)
            .execute(&mut **tx)
            .await?;
            if result.rows_affected() > 0 {
                freed.push(unit_id);
            }
            sqlx::query("DELETE FROM unit_routes WHERE unit_id = ? AND intervention_id = ?")
                .bind(unit_id)
                .bind(intervention_id)
                .execute(&mut **tx)
                .await?;
        }

        Ok(freed)
    }
}

impl StatusSink for Storage {
    async fn set_unit_status(&self, unit_id: UnitId, status: UnitStatus) -> Result<bool> {
        let sql = format!(
            "UPDATE units SET status = ?, last_contact_at = ? WHERE id = ? AND status IN ({})",
            predecessor_list(status)
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(unit_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_unit_location(&self, unit_id: UnitId, location: GeoPoint) -> Result<()> {
        sqlx::query("UPDATE units SET lat = ?, lon = ?, last_contact_at = ? WHERE id = ?")
            .bind(location.lat)
            .bind(location.lon)
            .bind(Utc::now().timestamp())
            .bind(unit_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_assignment_status(
        &self,
        assignment_id: AssignmentId,
        status: AssignmentStatus,
    ) -> Result<bool> {
        let stamp = match status {
            AssignmentStatus::Dispatched => "",
            AssignmentStatus::Arrived => ", arrived_at = ?",
            AssignmentStatus::Released | AssignmentStatus::Cancelled => ", released_at = ?",
        };
        let sql = format!(
            "UPDATE assignments SET status = ?{stamp} WHERE id = ? AND status IN ({})",
            predecessor_list(status)
        );
        let mut query = sqlx::query(&sql).bind(status.as_str());
        if !stamp.is_empty() {
            query = query.bind(Utc::now().timestamp());
        }
        let result = query.bind(assignment_id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_intervention_status(
        &self,
        intervention_id: InterventionId,
        status: InterventionStatus,
    ) -> Result<bool> {
        let stamp = match status {
            InterventionStatus::Created => "",
            InterventionStatus::OnSite => ", started_at = COALESCE(started_at, ?)",
            InterventionStatus::Completed | InterventionStatus::Cancelled => ", completed_at = ?",
        };
        let sql = format!(
            "UPDATE interventions SET status = ?{stamp} WHERE id = ? AND status IN ({})",
            predecessor_list(status)
        );
        let mut query = sqlx::query(&sql).bind(status.as_str());
        if !stamp.is_empty() {
            query = query.bind(Utc::now().timestamp());
        }
        let result = query.bind(intervention_id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_route_progress(
        &self,
        unit_id: UnitId,
        revision: i64,
        progress_percent: f64,
        position: GeoPoint,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE unit_routes
            SET progress_percent = MAX(progress_percent, ?),
                current_lat = ?, current_lon = ?, updated_at = ?
            WHERE unit_id = ? AND revision = ?
            "#,
        )
        .bind(progress_percent.clamp(0.0, 100.0))
        .bind(position.lat)
        .bind(position.lon)
        .bind(Utc::now().timestamp())
        .bind(unit_id)
        .bind(revision)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl Store for Storage {
    async fn insert_base(&self, base: &Base) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bases (name, lat, lon) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET lat = excluded.lat, lon = excluded.lon
            "#,
        )
        .bind(&base.name)
        .bind(base.location.lat)
        .bind(base.location.lon)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_bases(&self) -> Result<Vec<Base>> {
        let rows = sqlx::query("SELECT name, lat, lon FROM bases ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<Base> {
                Ok(Base::new(
                    row.try_get::<String, _>("name")?,
                    row.try_get("lat")?,
                    row.try_get("lon")?,
                ))
            })
            .collect()
    }

    async fn insert_unit(&self, unit: &NewUnit) -> Result<Unit> {
        let result = sqlx::query(
            r#"
            INSERT INTO units (call_sign, unit_type_code, home_base, status, lat, lon)
            VALUES (?, ?, ?, 'available', ?, ?)
            "#,
        )
        .bind(&unit.call_sign)
        .bind(&unit.unit_type_code)
        .bind(&unit.home_base)
        .bind(unit.location.lat)
        .bind(unit.location.lon)
        .execute(&self.pool)
        .await?;

        Ok(Unit {
            id: result.last_insert_rowid(),
            call_sign: unit.call_sign.clone(),
            unit_type_code: unit.unit_type_code.clone(),
            home_base: unit.home_base.clone(),
            status: UnitStatus::Available,
            location: unit.location,
            last_contact_at: None,
        })
    }

    async fn get_unit(&self, unit_id: UnitId) -> Result<Option<Unit>> {
        let row = sqlx::query(&format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = ?"))
            .bind(unit_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(unit_from_row).transpose()
    }

    async fn list_units(&self) -> Result<Vec<Unit>> {
        let rows = sqlx::query(&format!("SELECT {UNIT_COLUMNS} FROM units ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(unit_from_row).collect()
    }

    async fn create_incident(&self, incident: &NewIncident) -> Result<Incident> {
        let now = Utc::now().timestamp();
        let severity = clamp_severity(incident.severity);
        let required = serde_json::to_string(&incident.required_unit_types)?;
        let result = sqlx::query(
            r#"
            INSERT INTO events (type_code, severity, required_unit_types, lat, lon, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&incident.type_code)
        .bind(i64::from(severity))
        .bind(&required)
        .bind(incident.location.lat)
        .bind(incident.location.lon)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Incident {
            id: result.last_insert_rowid(),
            type_code: incident.type_code.clone(),
            severity,
            required_unit_types: incident.required_unit_types.clone(),
            location: incident.location,
            created_at: from_ts(now),
            closed_at: None,
        })
    }

    async fn get_incident(&self, incident_id: IncidentId) -> Result<Option<Incident>> {
        let row = sqlx::query(
            r#"
            SELECT id, type_code, severity, required_unit_types, lat, lon, created_at, closed_at
            FROM events WHERE id = ?
            "#,
        )
        .bind(incident_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(|r| incident_from_row(r, "")).transpose()
    }

    async fn create_intervention(
        &self,
        incident_id: IncidentId,
        priority: i32,
        decision_mode: DecisionMode,
    ) -> Result<Intervention> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO interventions (event_id, status, priority, decision_mode, created_at)
            VALUES (?, 'created', ?, ?, ?)
            "#,
        )
        .bind(incident_id)
        .bind(priority)
        .bind(decision_mode.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Intervention {
            id: result.last_insert_rowid(),
            incident_id,
            status: InterventionStatus::Created,
            priority,
            decision_mode,
            created_at: from_ts(now),
            started_at: None,
            completed_at: None,
        })
    }

    async fn get_intervention(&self, intervention_id: InterventionId) -> Result<Option<Intervention>> {
        let row = sqlx::query(&format!(
            "SELECT {INTERVENTION_COLUMNS} FROM interventions WHERE id = ?"
        ))
        .bind(intervention_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(intervention_from_row).transpose()
    }

    async fn list_pending_interventions(&self) -> Result<Vec<PendingIntervention>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT i.id, i.event_id, i.status, i.priority, i.decision_mode,
                   i.created_at, i.started_at, i.completed_at,
                   e.id AS e_id, e.type_code AS e_type_code, e.severity AS e_severity,
                   e.required_unit_types AS e_required_unit_types,
                   e.lat AS e_lat, e.lon AS e_lon,
                   e.created_at AS e_created_at, e.closed_at AS e_closed_at,
                   (SELECT COUNT(*) FROM assignments a
                    WHERE a.intervention_id = i.id AND a.status IN ({ACTIVE_ASSIGNMENT})) AS active_count
            FROM interventions i
            JOIN events e ON e.id = i.event_id
            WHERE i.status IN ({ACTIVE_INTERVENTION})
            ORDER BY i.priority DESC, i.created_at ASC, i.id ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PendingIntervention> {
                let active: i64 = row.try_get("active_count")?;
                Ok(PendingIntervention {
                    intervention: intervention_from_row(row)?,
                    incident: incident_from_row(row, "e_")?,
                    active_assignments: usize::try_from(active).unwrap_or(0),
                })
            })
            .collect()
    }

    async fn list_active_assignments(&self) -> Result<Vec<ActiveAssignment>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ASSIGNMENT_COLUMNS}, e.severity AS severity
            FROM assignments a
            JOIN interventions i ON i.id = a.intervention_id
            LEFT JOIN events e ON e.id = i.event_id
            WHERE a.status IN ({ACTIVE_ASSIGNMENT})
            ORDER BY a.id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ActiveAssignment> {
                Ok(ActiveAssignment {
                    assignment: assignment_from_row(row)?,
                    severity: row.try_get::<Option<i64>, _>("severity")?.map(severity_from),
                })
            })
            .collect()
    }

    async fn list_assignments(&self, intervention_id: InterventionId) -> Result<Vec<Assignment>> {
        let rows = sqlx::query(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments a WHERE a.intervention_id = ? ORDER BY a.id"
        ))
        .bind(intervention_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(assignment_from_row).collect()
    }

    async fn claim_unit(&self, claim: &Claim) -> Result<Option<Assignment>> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE units SET status = 'under_way', last_contact_at = ? WHERE id = ? AND status = ?",
        )
        .bind(now)
        .bind(claim.unit_id)
        .bind(claim.observed.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(unit_id = claim.unit_id, "Unit changed status before claim");
            return Ok(None);
        }

        if let Some(previous) = claim.preempt {
            let result = sqlx::query(&format!(
                "UPDATE assignments SET status = 'released', released_at = ? WHERE id = ? AND unit_id = ? AND status IN ({ACTIVE_ASSIGNMENT})"
            ))
            .bind(now)
            .bind(previous)
            .bind(claim.unit_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                tx.rollback().await?;
                debug!(unit_id = claim.unit_id, assignment_id = previous, "Preempted assignment no longer active");
                return Ok(None);
            }
        }

        let active: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM assignments WHERE unit_id = ? AND status IN ({ACTIVE_ASSIGNMENT})"
        ))
        .bind(claim.unit_id)
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            tx.rollback().await?;
            debug!(unit_id = claim.unit_id, "Unit already holds an active assignment");
            return Ok(None);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO assignments (intervention_id, unit_id, role, status, dispatched_at)
            VALUES (?, ?, ?, 'dispatched', ?)
            "#,
        )
        .bind(claim.intervention_id)
        .bind(claim.unit_id)
        .bind(claim.role.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        tx.commit().await?;

        Ok(Some(Assignment {
            id,
            intervention_id: claim.intervention_id,
            unit_id: claim.unit_id,
            role: Some(claim.role),
            status: AssignmentStatus::Dispatched,
            dispatched_at: from_ts(now),
            arrived_at: None,
            released_at: None,
        }))
    }

    async fn save_route(&self, route: &NewRoute) -> Result<Route> {
        let now = Utc::now().timestamp();
        let geojson = to_geojson(&route.geometry);
        let mut tx = self.pool.begin().await?;

        let revision: Option<i64> = sqlx::query_scalar(
            "UPDATE units SET route_revision = route_revision + 1 WHERE id = ? RETURNING route_revision",
        )
        .bind(route.unit_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(revision) = revision else {
            tx.rollback().await?;
            return Err(Error::not_found("unit", route.unit_id));
        };

        sqlx::query(
            r#"
            INSERT INTO unit_routes (
                unit_id, intervention_id, route_geojson, route_length_meters,
                estimated_duration_seconds, progress_percent,
                origin_lat, origin_lon, destination_lat, destination_lon,
                current_lat, current_lon, revision, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(unit_id) DO UPDATE SET
                intervention_id = excluded.intervention_id,
                route_geojson = excluded.route_geojson,
                route_length_meters = excluded.route_length_meters,
                estimated_duration_seconds = excluded.estimated_duration_seconds,
                progress_percent = 0,
                origin_lat = excluded.origin_lat,
                origin_lon = excluded.origin_lon,
                destination_lat = excluded.destination_lat,
                destination_lon = excluded.destination_lon,
                current_lat = excluded.current_lat,
                current_lon = excluded.current_lon,
                revision = excluded.revision,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(route.unit_id)
        .bind(route.intervention_id)
        .bind(&geojson)
        .bind(route.length_meters)
        .bind(route.duration_seconds)
        .bind(route.origin.lat)
        .bind(route.origin.lon)
        .bind(route.destination.lat)
        .bind(route.destination.lon)
        .bind(route.origin.lat)
        .bind(route.origin.lon)
        .bind(revision)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_route(route.unit_id)
            .await?
            .ok_or_else(|| Error::not_found("route", route.unit_id))
    }

    async fn get_route(&self, unit_id: UnitId) -> Result<Option<Route>> {
        let row = sqlx::query(&format!("{ROUTE_SELECT} WHERE r.unit_id = ?"))
            .bind(unit_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(route_from_row).transpose()
    }

    async fn list_routes(&self) -> Result<Vec<Route>> {
        let rows = sqlx::query(&format!("{ROUTE_SELECT} ORDER BY r.unit_id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(route_from_row).collect()
    }

    async fn delete_route(&self, unit_id: UnitId, revision: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM unit_routes WHERE unit_id = ? AND revision = ?")
            .bind(unit_id)
            .bind(revision)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_intervention(
        &self,
        intervention_id: InterventionId,
    ) -> Result<Option<Vec<UnitId>>> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(&format!(
            "UPDATE interventions SET status = 'completed', completed_at = ? WHERE id = ? AND status IN ({})",
            predecessor_list(InterventionStatus::Completed)
        ))
        .bind(now)
        .bind(intervention_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let freed = Self::free_units(&mut tx, intervention_id, false, now).await?;

        sqlx::query(
            r#"
            UPDATE events SET closed_at = ?
            WHERE id = (SELECT event_id FROM interventions WHERE id = ?) AND closed_at IS NULL
            "#,
        )
        .bind(now)
        .bind(intervention_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(freed))
    }

    async fn cancel_intervention(
        &self,
        intervention_id: InterventionId,
    ) -> Result<Option<Vec<UnitId>>> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(&format!(
            "UPDATE interventions SET status = 'cancelled', completed_at = ? WHERE id = ? AND status IN ({})",
            predecessor_list(InterventionStatus::Cancelled)
        ))
        .bind(now)
        .bind(intervention_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        let freed = Self::free_units(&mut tx, intervention_id, true, now).await?;

        tx.commit().await?;
        Ok(Some(freed))
    }

    async fn load_dispatch_config(&self) -> Result<Vec<(String, f64)>> {
        let rows = sqlx::query("SELECT key, value FROM dispatch_config ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<(String, f64)> {
                Ok((row.try_get("key")?, row.try_get("value")?))
            })
            .collect()
    }

    async fn save_dispatch_config(&self, key: &str, value: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_config (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
