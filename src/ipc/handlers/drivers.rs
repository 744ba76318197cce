use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{actor, db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::validate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn driver_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let name: String = row.get(1)?;
    let email: String = row.get(2)?;
    let phone: String = row.get(3)?;
    let route_id: Option<String> = row.get(4)?;
    let role: String = row.get(5)?;
    Ok(json!({
        "id": id,
        "name": name,
        "email": email,
        "phone": phone,
        "routeId": route_id,
        "role": role,
    }))
}

fn fetch_driver(
    conn: &Connection,
    req: &Request,
    driver_id: &str,
) -> Result<serde_json::Value, serde_json::Value> {
    conn.query_row(
        "SELECT id, name, email, phone, route_id, role FROM drivers WHERE id = ?",
        [driver_id],
        driver_json,
    )
    .optional()
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
    .ok_or_else(|| err(&req.id, "not_found", "driver not found", None))
}

fn normalized_phone(req: &Request) -> Result<String, serde_json::Value> {
    let phone = validate::format_phone_number(&required_str(req, "phone")?);
    if !validate::validate_phone(&phone) {
        return Err(err(
            &req.id,
            "bad_params",
            "phone must normalize to +254XXXXXXXXX",
            Some(json!({ "phone": phone })),
        ));
    }
    Ok(phone)
}

fn parse_role(req: &Request) -> Result<String, serde_json::Value> {
    let role = optional_str(req, "role").unwrap_or_else(|| "driver".to_string());
    if role == "driver" || role == "admin" {
        Ok(role)
    } else {
        Err(err(
            &req.id,
            "bad_params",
            "role must be one of: driver, admin",
            Some(json!({ "role": role })),
        ))
    }
}

fn check_route_ref(
    conn: &Connection,
    req: &Request,
    route_id: &Option<String>,
) -> Result<(), serde_json::Value> {
    let Some(route_id) = route_id else {
        return Ok(());
    };
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM routes WHERE id = ?", [route_id], |r| r.get(0))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(&req.id, "not_found", "route not found", None));
    }
    Ok(())
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn
        .prepare("SELECT id, name, email, phone, route_id, role FROM drivers ORDER BY name")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], driver_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(drivers) => ok(&req.id, json!({ "drivers": drivers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let driver_id = match required_str(req, "driverId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match fetch_driver(conn, req, &driver_id) {
        Ok(driver) => ok(&req.id, json!({ "driver": driver })),
        Err(e) => e,
    }
}

fn handle_by_route(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, name, email, phone, route_id, role FROM drivers WHERE route_id = ? ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&route_id], driver_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(drivers) => ok(&req.id, json!({ "drivers": drivers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
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
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !validate::validate_email(&email) {
        return err(
            &req.id,
            "bad_params",
            "email is not valid",
            Some(json!({ "email": email })),
        );
    }
    let phone = match normalized_phone(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let role = match parse_role(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = optional_str(req, "routeId");
    if let Err(e) = check_route_ref(conn, req, &route_id) {
        return e;
    }

    let driver_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO drivers(id, name, email, phone, route_id, role) VALUES(?, ?, ?, ?, ?, ?)",
        (&driver_id, &name, &email, &phone, &route_id, &role),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "drivers" })),
        );
    }

    db::record_audit(
        conn,
        &actor(req),
        "driver.create",
        "driver",
        Some(&driver_id),
        route_id.as_deref(),
        Some(json!({ "name": name })),
    );

    match fetch_driver(conn, req, &driver_id) {
        Ok(driver) => ok(&req.id, json!({ "driver": driver })),
        Err(e) => e,
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let driver_id = match required_str(req, "driverId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let existing = match fetch_driver(conn, req, &driver_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let name = optional_str(req, "name")
        .unwrap_or_else(|| existing["name"].as_str().unwrap_or_default().to_string());
    let email = optional_str(req, "email")
        .unwrap_or_else(|| existing["email"].as_str().unwrap_or_default().to_string());
    if !validate::validate_email(&email) {
        return err(
            &req.id,
            "bad_params",
            "email is not valid",
            Some(json!({ "email": email })),
        );
    }
    let phone = if req.params.get("phone").is_some() {
        match normalized_phone(req) {
            Ok(v) => v,
            Err(e) => return e,
        }
    } else {
        existing["phone"].as_str().unwrap_or_default().to_string()
    };
    let role = if req.params.get("role").is_some() {
        match parse_role(req) {
            Ok(v) => v,
            Err(e) => return e,
        }
    } else {
        existing["role"].as_str().unwrap_or_default().to_string()
    };
    let route_id = if req.params.get("routeId").is_some() {
        optional_str(req, "routeId")
    } else {
        existing["routeId"].as_str().map(|s| s.to_string())
    };
    if let Err(e) = check_route_ref(conn, req, &route_id) {
        return e;
    }

    if let Err(e) = conn.execute(
        "UPDATE drivers SET name = ?, email = ?, phone = ?, route_id = ?, role = ? WHERE id = ?",
        (&name, &email, &phone, &route_id, &role, &driver_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "drivers" })),
        );
    }

    db::record_audit(
        conn,
        &actor(req),
        "driver.update",
        "driver",
        Some(&driver_id),
        route_id.as_deref(),
        Some(json!({ "name": name })),
    );

    match fetch_driver(conn, req, &driver_id) {
        Ok(driver) => ok(&req.id, json!({ "driver": driver })),
        Err(e) => e,
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let driver_id = match required_str(req, "driverId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = fetch_driver(conn, req, &driver_id) {
        return e;
    }

    let minder_refs: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM minders WHERE driver_id = ?",
        [&driver_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if minder_refs > 0 {
        return err(
            &req.id,
            "driver_in_use",
            "driver still has minders assigned",
            Some(json!({ "minderCount": minder_refs })),
        );
    }

    if let Err(e) = conn.execute("DELETE FROM drivers WHERE id = ?", [&driver_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    db::record_audit(
        conn,
        &actor(req),
        "driver.delete",
        "driver",
        Some(&driver_id),
        None,
        None,
    );

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "drivers.list" => Some(handle_list(state, req)),
        "drivers.get" => Some(handle_get(state, req)),
        "drivers.byRoute" => Some(handle_by_route(state, req)),
        "drivers.create" => Some(handle_create(state, req)),
        "drivers.update" => Some(handle_update(state, req)),
        "drivers.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
