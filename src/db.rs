use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

pub const DB_FILE: &str = "transport.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS routes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            vehicle_no TEXT NOT NULL,
            areas TEXT NOT NULL,
            term TEXT NOT NULL,
            year INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'active'
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_routes_status ON routes(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS learners(
            id TEXT PRIMARY KEY,
            route_id TEXT NOT NULL,
            admission_no TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            class TEXT NOT NULL,
            pickup_area TEXT NOT NULL,
            pickup_time TEXT NOT NULL,
            father_phone TEXT NOT NULL,
            mother_phone TEXT NOT NULL,
            active INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(route_id) REFERENCES routes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_learners_route ON learners(route_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_learners_route_time ON learners(route_id, pickup_time)",
        [],
    )?;

    // Older workspaces predate dropoff tracking. Add and leave NULL.
    ensure_learners_dropoff_columns(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS drivers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            phone TEXT NOT NULL,
            route_id TEXT,
            role TEXT NOT NULL DEFAULT 'driver',
            FOREIGN KEY(route_id) REFERENCES routes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_drivers_route ON drivers(route_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS minders(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT NOT NULL,
            driver_id TEXT,
            route_id TEXT,
            FOREIGN KEY(driver_id) REFERENCES drivers(id),
            FOREIGN KEY(route_id) REFERENCES routes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_minders_route ON minders(route_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_minders_driver ON minders(driver_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS school_config(
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            name TEXT NOT NULL,
            parent_id TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_school_config_parent ON school_config(parent_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_logs(
            id TEXT PRIMARY KEY,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            route_id TEXT,
            details TEXT,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs(timestamp)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_route ON audit_logs(route_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

fn ensure_learners_dropoff_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "learners", "dropoff_area")? {
        conn.execute("ALTER TABLE learners ADD COLUMN dropoff_area TEXT", [])?;
    }
    if !table_has_column(conn, "learners", "dropoff_time")? {
        conn.execute("ALTER TABLE learners ADD COLUMN dropoff_time TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerRow {
    pub id: String,
    pub route_id: String,
    pub admission_no: String,
    pub name: String,
    pub class: String,
    pub pickup_area: String,
    pub pickup_time: String,
    pub dropoff_area: Option<String>,
    pub dropoff_time: Option<String>,
    pub father_phone: String,
    pub mother_phone: String,
    pub active: bool,
    pub updated_at: Option<String>,
}

pub const LEARNER_COLUMNS: &str = "id, route_id, admission_no, name, class, pickup_area, \
     pickup_time, dropoff_area, dropoff_time, father_phone, mother_phone, active, updated_at";

pub fn map_learner(row: &rusqlite::Row) -> rusqlite::Result<LearnerRow> {
    Ok(LearnerRow {
        id: row.get(0)?,
        route_id: row.get(1)?,
        admission_no: row.get(2)?,
        name: row.get(3)?,
        class: row.get(4)?,
        pickup_area: row.get(5)?,
        pickup_time: row.get(6)?,
        dropoff_area: row.get(7)?,
        dropoff_time: row.get(8)?,
        father_phone: row.get(9)?,
        mother_phone: row.get(10)?,
        active: row.get::<_, i64>(11)? != 0,
        updated_at: row.get(12)?,
    })
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?")?;
    let mut rows = stmt.query([key])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let raw: String = row.get(0)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

/// Best-effort audit append. A failed audit write never fails the operation
/// it describes; it is logged and dropped.
pub fn record_audit(
    conn: &Connection,
    actor: &str,
    action: &str,
    entity_type: &str,
    entity_id: Option<&str>,
    route_id: Option<&str>,
    details: Option<serde_json::Value>,
) {
    let details_text = details.map(|d| d.to_string());
    let result = conn.execute(
        "INSERT INTO audit_logs(id, actor, action, entity_type, entity_id, route_id, details, timestamp)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            actor,
            action,
            entity_type,
            entity_id,
            route_id,
            details_text,
            now_rfc3339(),
        ),
    );
    if let Err(e) = result {
        log::warn!("audit append failed for {}: {}", action, e);
    }
}

pub fn parse_areas(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}
