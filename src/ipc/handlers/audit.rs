use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_i64, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value};
use serde_json::json;

const DEFAULT_PAGE_SIZE: i64 = 50;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut where_sql = String::from(" WHERE 1=1");
    let mut params: Vec<Value> = Vec::new();
    if let Some(action) = optional_str(req, "action") {
        where_sql.push_str(" AND action = ?");
        params.push(Value::Text(action));
    }
    if let Some(actor) = optional_str(req, "actor") {
        where_sql.push_str(" AND actor = ?");
        params.push(Value::Text(actor));
    }
    if let Some(date) = optional_str(req, "date") {
        // RFC 3339 timestamps sort and prefix-match by calendar date.
        where_sql.push_str(" AND timestamp LIKE ?");
        params.push(Value::Text(format!("{}%", date)));
    }
    if let Some(route_id) = optional_str(req, "routeId") {
        where_sql.push_str(" AND route_id = ?");
        params.push(Value::Text(route_id));
    }

    let total: i64 = match conn.query_row(
        &format!("SELECT COUNT(*) FROM audit_logs{}", where_sql),
        params_from_iter(params.clone()),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let limit = optional_i64(req, "limit").unwrap_or(DEFAULT_PAGE_SIZE).max(1);
    let offset = optional_i64(req, "offset").unwrap_or(0).max(0);
    let sql = format!(
        "SELECT id, actor, action, entity_type, entity_id, route_id, details, timestamp
         FROM audit_logs{}
         ORDER BY timestamp DESC
         LIMIT ? OFFSET ?",
        where_sql
    );
    params.push(Value::Integer(limit));
    params.push(Value::Integer(offset));

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(params), |r| {
            let id: String = r.get(0)?;
            let actor: String = r.get(1)?;
            let action: String = r.get(2)?;
            let entity_type: String = r.get(3)?;
            let entity_id: Option<String> = r.get(4)?;
            let route_id: Option<String> = r.get(5)?;
            let details_raw: Option<String> = r.get(6)?;
            let timestamp: String = r.get(7)?;
            let details = details_raw
                .as_deref()
                .and_then(|d| serde_json::from_str::<serde_json::Value>(d).ok());
            Ok(json!({
                "id": id,
                "actor": actor,
                "action": action,
                "entityType": entity_type,
                "entityId": entity_id,
                "routeId": route_id,
                "details": details,
                "timestamp": timestamp,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(logs) => ok(
            &req.id,
            json!({ "logs": logs, "total": total, "limit": limit, "offset": offset }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_actors(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare("SELECT DISTINCT actor FROM audit_logs ORDER BY actor") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(actors) => ok(&req.id, json!({ "actors": actors })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Host-reported events (UI-level actions the daemon never sees directly).
fn handle_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor = match required_str(req, "actor") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let action = match required_str(req, "action") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let entity_type = match required_str(req, "entityType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let entity_id = optional_str(req, "entityId");
    let route_id = optional_str(req, "routeId");
    let details = req.params.get("details").cloned();

    db::record_audit(
        conn,
        &actor,
        &action,
        &entity_type,
        entity_id.as_deref(),
        route_id.as_deref(),
        details,
    );

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_list(state, req)),
        "audit.actors" => Some(handle_actors(state, req)),
        "audit.record" => Some(handle_record(state, req)),
        _ => None,
    }
}
