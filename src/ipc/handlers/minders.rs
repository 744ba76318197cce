use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{actor, db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::validate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn minder_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let phone: String = row.get(2)?;
    let driver_id: Option<String> = row.get(3)?;
    let route_id: Option<String> = row.get(4)?;
    Ok(json!({
        "id": id,
        "name": name,
        "phone": phone,
        "driverId": driver_id,
        "routeId": route_id,
    }))
}

fn fetch_minder(
    conn: &Connection,
    req: &Request,
    minder_id: &str,
) -> Result<serde_json::Value, serde_json::Value> {
    conn.query_row(
        "SELECT id, name, phone, driver_id, route_id FROM minders WHERE id = ?",
        [minder_id],
        minder_json,
    )
    .optional()
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
    .ok_or_else(|| err(&req.id, "not_found", "minder not found", None))
}

fn check_refs(
    conn: &Connection,
    req: &Request,
    driver_id: &Option<String>,
    route_id: &Option<String>,
) -> Result<(), serde_json::Value> {
    if let Some(driver_id) = driver_id {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM drivers WHERE id = ?", [driver_id], |r| r.get(0))
            .optional()
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        if found.is_none() {
            return Err(err(&req.id, "not_found", "driver not found", None));
        }
    }
    if let Some(route_id) = route_id {
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM routes WHERE id = ?", [route_id], |r| r.get(0))
            .optional()
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        if found.is_none() {
            return Err(err(&req.id, "not_found", "route not found", None));
        }
    }
    Ok(())
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn
        .prepare("SELECT id, name, phone, driver_id, route_id FROM minders ORDER BY name")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], minder_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(minders) => ok(&req.id, json!({ "minders": minders })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_list_with_details(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT m.id, m.name, m.phone, m.driver_id, m.route_id,
                d.name AS driver_name, r.name AS route_name
         FROM minders m
         LEFT JOIN drivers d ON d.id = m.driver_id
         LEFT JOIN routes r ON r.id = m.route_id
         ORDER BY m.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let mut value = minder_json(row)?;
            let driver_name: Option<String> = row.get(5)?;
            let route_name: Option<String> = row.get(6)?;
            value["driverName"] = json!(driver_name.unwrap_or_else(|| "N/A".to_string()));
            value["routeName"] = json!(route_name.unwrap_or_else(|| "N/A".to_string()));
            Ok(value)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(minders) => ok(&req.id, json!({ "minders": minders })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let minder_id = match required_str(req, "minderId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match fetch_minder(conn, req, &minder_id) {
        Ok(minder) => ok(&req.id, json!({ "minder": minder })),
        Err(e) => e,
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let phone = validate::format_phone_number(&match required_str(req, "phone") {
        Ok(v) => v,
        Err(e) => return e,
    });
    if !validate::validate_phone(&phone) {
        return err(
            &req.id,
            "bad_params",
            "phone must normalize to +254XXXXXXXXX",
            Some(json!({ "phone": phone })),
        );
    }
    let driver_id = optional_str(req, "driverId");
    let route_id = optional_str(req, "routeId");
    if let Err(e) = check_refs(conn, req, &driver_id, &route_id) {
        return e;
    }

    let minder_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO minders(id, name, phone, driver_id, route_id) VALUES(?, ?, ?, ?, ?)",
        (&minder_id, &name, &phone, &driver_id, &route_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "minders" })),
        );
    }

    db::record_audit(
        conn,
        &actor(req),
        "minder.create",
        "minder",
        Some(&minder_id),
        route_id.as_deref(),
        Some(json!({ "name": name })),
    );

    match fetch_minder(conn, req, &minder_id) {
        Ok(minder) => ok(&req.id, json!({ "minder": minder })),
        Err(e) => e,
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let minder_id = match required_str(req, "minderId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let existing = match fetch_minder(conn, req, &minder_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let name = optional_str(req, "name")
        .unwrap_or_else(|| existing["name"].as_str().unwrap_or_default().to_string());
    let phone = if req.params.get("phone").is_some() {
        let phone = validate::format_phone_number(&optional_str(req, "phone").unwrap_or_default());
        if !validate::validate_phone(&phone) {
            return err(
                &req.id,
                "bad_params",
                "phone must normalize to +254XXXXXXXXX",
                Some(json!({ "phone": phone })),
            );
        }
        phone
    } else {
        existing["phone"].as_str().unwrap_or_default().to_string()
    };
    let driver_id = if req.params.get("driverId").is_some() {
        optional_str(req, "driverId")
    } else {
        existing["driverId"].as_str().map(|s| s.to_string())
    };
    let route_id = if req.params.get("routeId").is_some() {
        optional_str(req, "routeId")
    } else {
        existing["routeId"].as_str().map(|s| s.to_string())
    };
    if let Err(e) = check_refs(conn, req, &driver_id, &route_id) {
        return e;
    }

    if let Err(e) = conn.execute(
        "UPDATE minders SET name = ?, phone = ?, driver_id = ?, route_id = ? WHERE id = ?",
        (&name, &phone, &driver_id, &route_id, &minder_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "minders" })),
        );
    }

    db::record_audit(
        conn,
        &actor(req),
        "minder.update",
        "minder",
        Some(&minder_id),
        route_id.as_deref(),
        Some(json!({ "name": name })),
    );

    match fetch_minder(conn, req, &minder_id) {
        Ok(minder) => ok(&req.id, json!({ "minder": minder })),
        Err(e) => e,
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let minder_id = match required_str(req, "minderId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = fetch_minder(conn, req, &minder_id) {
        return e;
    }

    if let Err(e) = conn.execute("DELETE FROM minders WHERE id = ?", [&minder_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    db::record_audit(
        conn,
        &actor(req),
        "minder.delete",
        "minder",
        Some(&minder_id),
        None,
        None,
    );

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "minders.list" => Some(handle_list(state, req)),
        "minders.listWithDetails" => Some(handle_list_with_details(state, req)),
        "minders.get" => Some(handle_get(state, req)),
        "minders.create" => Some(handle_create(state, req)),
        "minders.update" => Some(handle_update(state, req)),
        "minders.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
