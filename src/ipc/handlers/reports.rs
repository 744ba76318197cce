use crate::csv::csv_quote;
use crate::db::{self, LearnerRow};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, PickupTime};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct RouteInfo {
    name: String,
    vehicle_no: String,
    areas: Vec<String>,
    term: String,
    year: i64,
    status: String,
}

fn fetch_route(
    conn: &Connection,
    req: &Request,
    route_id: &str,
) -> Result<RouteInfo, serde_json::Value> {
    conn.query_row(
        "SELECT name, vehicle_no, areas, term, year, status FROM routes WHERE id = ?",
        [route_id],
        |r| {
            let areas_raw: String = r.get(2)?;
            Ok(RouteInfo {
                name: r.get(0)?,
                vehicle_no: r.get(1)?,
                areas: db::parse_areas(&areas_raw),
                term: r.get(3)?,
                year: r.get(4)?,
                status: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
    .ok_or_else(|| err(&req.id, "not_found", "route not found", None))
}

fn route_learners(
    conn: &Connection,
    req: &Request,
    route_id: &str,
) -> Result<Vec<LearnerRow>, serde_json::Value> {
    let sql = format!("SELECT {} FROM learners WHERE route_id = ?", db::LEARNER_COLUMNS);
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let mut learners = stmt
        .query_map([route_id], db::map_learner)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    learners.sort_by(|a, b| {
        let ka = PickupTime::parse(&a.pickup_time).map(|t| t.minute_of_day()).unwrap_or(u16::MAX);
        let kb = PickupTime::parse(&b.pickup_time).map(|t| t.minute_of_day()).unwrap_or(u16::MAX);
        ka.cmp(&kb).then_with(|| a.name.cmp(&b.name))
    });
    Ok(learners)
}

/// First staff member assigned to the route, as `(name, phone)`.
fn assigned_staff(
    conn: &Connection,
    req: &Request,
    table: &str,
    route_id: &str,
) -> Result<Option<(String, String)>, serde_json::Value> {
    let sql = format!(
        "SELECT name, phone FROM {} WHERE route_id = ? ORDER BY name LIMIT 1",
        table
    );
    conn.query_row(&sql, [route_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn handle_route_manifest(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let learners = match route_learners(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let driver = match assigned_staff(conn, req, "drivers", &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let minder = match assigned_staff(conn, req, "minders", &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let learner_rows = learners
        .iter()
        .enumerate()
        .map(|(i, l)| {
            json!({
                "position": i + 1,
                "admissionNo": l.admission_no,
                "name": l.name,
                "class": l.class,
                "pickupArea": l.pickup_area,
                "pickupTime": l.pickup_time,
                "fatherPhone": l.father_phone,
                "motherPhone": l.mother_phone,
                "status": if l.active { "Active" } else { "Inactive" },
            })
        })
        .collect::<Vec<_>>();

    // Per-area roll-up in first-seen pickup order.
    let mut area_order: Vec<String> = Vec::new();
    for l in &learners {
        if !area_order.iter().any(|a| a == &l.pickup_area) {
            area_order.push(l.pickup_area.clone());
        }
    }
    let area_summary = area_order
        .iter()
        .map(|area| {
            let in_area: Vec<&LearnerRow> =
                learners.iter().filter(|l| &l.pickup_area == area).collect();
            let active = in_area.iter().filter(|l| l.active).count();
            json!({
                "area": area,
                "total": in_area.len(),
                "active": active,
                "inactive": in_area.len() - active,
            })
        })
        .collect::<Vec<_>>();
    let active_total = learners.iter().filter(|l| l.active).count();

    let contacts = learners
        .iter()
        .filter(|l| l.active)
        .map(|l| {
            json!({
                "name": l.name,
                "class": l.class,
                "fatherPhone": l.father_phone,
                "motherPhone": l.mother_phone,
            })
        })
        .collect::<Vec<_>>();

    let (driver_name, driver_phone) = match driver {
        Some((name, phone)) => (name, phone),
        None => ("Not Assigned".to_string(), "N/A".to_string()),
    };
    let (minder_name, minder_phone) = match minder {
        Some((name, phone)) => (name, phone),
        None => ("Not Assigned".to_string(), "N/A".to_string()),
    };

    ok(
        &req.id,
        json!({
            "route": {
                "name": route.name,
                "vehicleNo": route.vehicle_no,
                "term": route.term,
                "year": route.year,
                "status": route.status,
                "areas": route.areas,
                "totalLearners": learners.len(),
                "totalAreas": route.areas.len(),
            },
            "personnel": {
                "driverName": driver_name,
                "driverPhone": driver_phone,
                "minderName": minder_name,
                "minderPhone": minder_phone,
            },
            "learners": learner_rows,
            "areaSummary": {
                "rows": area_summary,
                "total": learners.len(),
                "active": active_total,
                "inactive": learners.len() - active_total,
            },
            "contacts": contacts,
            "generated": Utc::now().format("%d/%m/%Y").to_string(),
        }),
    )
}

fn handle_conflict_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let groups = schedule::route_conflicts(conn, &route_id);
    let conflicts = groups
        .iter()
        .map(|g| {
            json!({
                "time": g.time,
                "areas": g.areas,
                "learners": g.learners,
                "message": schedule::conflict_message(&g.learners),
            })
        })
        .collect::<Vec<_>>();

    ok(
        &req.id,
        json!({
            "routeId": route_id,
            "conflictCount": conflicts.len(),
            "conflicts": conflicts,
            "generated": Utc::now().format("%d/%m/%Y").to_string(),
        }),
    )
}

fn handle_export_learners_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = fetch_route(conn, req, &route_id) {
        return e;
    }
    let learners = match route_learners(conn, req, &route_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut csv = String::from(
        "admission_no,name,class,pickup_area,pickup_time,father_phone,mother_phone,active\n",
    );
    for l in &learners {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{}\n",
            csv_quote(&l.admission_no),
            csv_quote(&l.name),
            csv_quote(&l.class),
            csv_quote(&l.pickup_area),
            csv_quote(&l.pickup_time),
            csv_quote(&l.father_phone),
            csv_quote(&l.mother_phone),
            if l.active { 1 } else { 0 },
        ));
    }

    if let Err(e) = std::fs::write(&path, csv) {
        return err(
            &req.id,
            "file_write_failed",
            format!("failed to write {}: {}", path, e),
            None,
        );
    }

    ok(&req.id, json!({ "path": path, "rows": learners.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.routeManifest" => Some(handle_route_manifest(state, req)),
        "reports.conflictSummary" => Some(handle_conflict_summary(state, req)),
        "reports.exportLearnersCsv" => Some(handle_export_learners_csv(state, req)),
        _ => None,
    }
}
