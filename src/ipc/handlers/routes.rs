use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{actor, db_conn, optional_bool, optional_str, required_i64, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct RouteRow {
    id: String,
    name: String,
    vehicle_no: String,
    areas: Vec<String>,
    term: String,
    year: i64,
    status: String,
}

fn map_route(row: &rusqlite::Row) -> rusqlite::Result<RouteRow> {
    let areas_raw: String = row.get(3)?;
    Ok(RouteRow {
        id: row.get(0)?,
        name: row.get(1)?,
        vehicle_no: row.get(2)?,
        areas: db::parse_areas(&areas_raw),
        term: row.get(4)?,
        year: row.get(5)?,
        status: row.get(6)?,
    })
}

fn route_json(route: &RouteRow, learner_count: i64) -> serde_json::Value {
    json!({
        "id": route.id,
        "name": route.name,
        "vehicleNo": route.vehicle_no,
        "areas": route.areas,
        "term": route.term,
        "year": route.year,
        "status": route.status,
        "learnerCount": learner_count,
    })
}

fn fetch_route(
    conn: &Connection,
    req: &Request,
    route_id: &str,
) -> Result<RouteRow, serde_json::Value> {
    conn.query_row(
        "SELECT id, name, vehicle_no, areas, term, year, status FROM routes WHERE id = ?",
        [route_id],
        map_route,
    )
    .optional()
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
    .ok_or_else(|| err(&req.id, "not_found", "route not found", None))
}

fn active_learner_count(
    conn: &Connection,
    req: &Request,
    route_id: &str,
) -> Result<i64, serde_json::Value> {
    conn.query_row(
        "SELECT COUNT(*) FROM learners WHERE route_id = ? AND active = 1",
        [route_id],
        |r| r.get(0),
    )
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn parse_area_list(req: &Request) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let Some(items) = req.params.get("areas").and_then(|v| v.as_array()) else {
        return out;
    };
    for item in items {
        let Some(area) = item.as_str() else { continue };
        let trimmed = area.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !out.iter().any(|a| a == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let status = optional_str(req, "status").unwrap_or_else(|| "active".to_string());

    // Active learner counts ride along for the dashboard, the same
    // correlated-subquery way the class list reports its sizes.
    let mut sql = "SELECT
           r.id, r.name, r.vehicle_no, r.areas, r.term, r.year, r.status,
           (SELECT COUNT(*) FROM learners l WHERE l.route_id = r.id AND l.active = 1) AS learner_count
         FROM routes r"
        .to_string();
    if status != "all" {
        sql.push_str(" WHERE r.status = ?");
    }
    sql.push_str(" ORDER BY r.name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mapper = |row: &rusqlite::Row| {
        let route = map_route(row)?;
        let count: i64 = row.get(7)?;
        Ok(route_json(&route, count))
    };
    let rows = if status != "all" {
        stmt.query_map([&status], mapper)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    } else {
        stmt.query_map([], mapper)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    };

    match rows {
        Ok(routes) => ok(&req.id, json!({ "routes": routes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route = match fetch_route(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let count = match active_learner_count(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    ok(&req.id, json!({ "route": route_json(&route, count) }))
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
    let vehicle_no = match required_str(req, "vehicleNo") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match required_str(req, "term") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year = match required_i64(req, "year") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let areas = parse_area_list(req);

    let route_id = Uuid::new_v4().to_string();
    let areas_json = serde_json::to_string(&areas).unwrap_or_else(|_| "[]".to_string());
    if let Err(e) = conn.execute(
        "INSERT INTO routes(id, name, vehicle_no, areas, term, year, status)
         VALUES(?, ?, ?, ?, ?, ?, 'active')",
        (&route_id, &name, &vehicle_no, &areas_json, &term, year),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "routes" })),
        );
    }

    db::record_audit(
        conn,
        &actor(req),
        "route.create",
        "route",
        Some(&route_id),
        Some(&route_id),
        Some(json!({ "name": name, "term": term, "year": year })),
    );

    let route = match fetch_route(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    ok(&req.id, json!({ "route": route_json(&route, 0) }))
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let existing = match fetch_route(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let name = optional_str(req, "name").unwrap_or(existing.name);
    let vehicle_no = optional_str(req, "vehicleNo").unwrap_or(existing.vehicle_no);
    let term = optional_str(req, "term").unwrap_or(existing.term);
    let year = req
        .params
        .get("year")
        .and_then(|v| v.as_i64())
        .unwrap_or(existing.year);
    let areas = if req.params.get("areas").is_some() {
        parse_area_list(req)
    } else {
        existing.areas
    };
    let areas_json = serde_json::to_string(&areas).unwrap_or_else(|_| "[]".to_string());

    if let Err(e) = conn.execute(
        "UPDATE routes SET name = ?, vehicle_no = ?, areas = ?, term = ?, year = ? WHERE id = ?",
        (&name, &vehicle_no, &areas_json, &term, year, &route_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "routes" })),
        );
    }

    db::record_audit(
        conn,
        &actor(req),
        "route.update",
        "route",
        Some(&route_id),
        Some(&route_id),
        Some(json!({ "name": name })),
    );

    let route = match fetch_route(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let count = match active_learner_count(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    ok(&req.id, json!({ "route": route_json(&route, count) }))
}

fn handle_archive(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = fetch_route(conn, req, &route_id) {
        return e;
    }

    if let Err(e) = conn.execute(
        "UPDATE routes SET status = 'archived' WHERE id = ?",
        [&route_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    db::record_audit(
        conn,
        &actor(req),
        "route.archive",
        "route",
        Some(&route_id),
        Some(&route_id),
        None,
    );

    let route = match fetch_route(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let count = match active_learner_count(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    ok(&req.id, json!({ "route": route_json(&route, count) }))
}

/// Term rollover: clone a route (and optionally its active roster) into a
/// fresh active route for the new term and year.
fn handle_duplicate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let new_term = match required_str(req, "newTerm") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let new_year = match required_i64(req, "newYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let copy_learners = optional_bool(req, "copyLearners").unwrap_or(false);

    let source = match fetch_route(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let new_route_id = Uuid::new_v4().to_string();
    let areas_json = serde_json::to_string(&source.areas).unwrap_or_else(|_| "[]".to_string());
    if let Err(e) = tx.execute(
        "INSERT INTO routes(id, name, vehicle_no, areas, term, year, status)
         VALUES(?, ?, ?, ?, ?, ?, 'active')",
        (
            &new_route_id,
            &source.name,
            &source.vehicle_no,
            &areas_json,
            &new_term,
            new_year,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "routes" })),
        );
    }

    let mut copied = 0i64;
    if copy_learners {
        // Admission numbers are globally unique, so clones carry a
        // year/term suffix tying them back to the source roster.
        let term_tag: String = new_term
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        let sql = format!(
            "SELECT {} FROM learners WHERE route_id = ? AND active = 1",
            db::LEARNER_COLUMNS
        );
        let learners = {
            let learners_result: rusqlite::Result<Vec<_>> = (|| {
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt
                    .query_map([&route_id], db::map_learner)?
                    .collect::<Result<Vec<_>, _>>();
                rows
            })();
            match learners_result {
                Ok(v) => v,
                Err(e) => {
                    let _ = tx.rollback();
                    return err(&req.id, "db_query_failed", e.to_string(), None);
                }
            }
        };

        for learner in learners {
            let clone_admission = format!("{}-{}-{}", learner.admission_no, new_year, term_tag);
            if let Err(e) = tx.execute(
                "INSERT INTO learners(id, route_id, admission_no, name, class, pickup_area,
                     pickup_time, dropoff_area, dropoff_time, father_phone, mother_phone,
                     active, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &new_route_id,
                    &clone_admission,
                    &learner.name,
                    &learner.class,
                    &learner.pickup_area,
                    &learner.pickup_time,
                    &learner.dropoff_area,
                    &learner.dropoff_time,
                    &learner.father_phone,
                    &learner.mother_phone,
                    db::now_rfc3339(),
                ),
            ) {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "learners" })),
                );
            }
            copied += 1;
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    db::record_audit(
        conn,
        &actor(req),
        "route.duplicate",
        "route",
        Some(&new_route_id),
        Some(&new_route_id),
        Some(json!({
            "sourceRouteId": route_id,
            "newTerm": new_term,
            "newYear": new_year,
            "copiedLearners": copied,
        })),
    );

    let route = match fetch_route(conn, req, &new_route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    ok(
        &req.id,
        json!({ "route": route_json(&route, copied), "copiedLearners": copied }),
    )
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = fetch_route(conn, req, &route_id) {
        return e;
    }

    // Learner history (active or not) pins a route; archive is the normal
    // end of life. Hard delete is an admin cleanup path for empty routes.
    let learner_refs: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM learners WHERE route_id = ?",
        [&route_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if learner_refs > 0 {
        return err(
            &req.id,
            "route_in_use",
            "route still has learner records; archive it instead",
            Some(json!({ "learnerCount": learner_refs })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE drivers SET route_id = NULL WHERE route_id = ?",
        [&route_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE minders SET route_id = NULL WHERE route_id = ?",
        [&route_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM routes WHERE id = ?", [&route_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    db::record_audit(
        conn,
        &actor(req),
        "route.delete",
        "route",
        Some(&route_id),
        Some(&route_id),
        None,
    );

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "routes.list" => Some(handle_list(state, req)),
        "routes.get" => Some(handle_get(state, req)),
        "routes.create" => Some(handle_create(state, req)),
        "routes.update" => Some(handle_update(state, req)),
        "routes.archive" => Some(handle_archive(state, req)),
        "routes.duplicate" => Some(handle_duplicate(state, req)),
        "routes.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
