use crate::db::{self, LearnerRow};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{actor, db_conn, optional_bool, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, PickupTime};
use crate::validate;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use super::conflicts;

struct LearnerInput {
    admission_no: String,
    name: String,
    class: String,
    route_id: String,
    pickup_area: String,
    pickup_time: String,
    dropoff_area: Option<String>,
    dropoff_time: Option<String>,
    father_phone: String,
    mother_phone: String,
}

fn parse_learner_input(req: &Request) -> Result<LearnerInput, serde_json::Value> {
    let admission_no = required_str(req, "admissionNo")?;
    let name = required_str(req, "name")?;
    let class = required_str(req, "class")?;
    let route_id = required_str(req, "routeId")?;
    let pickup_area = required_str(req, "pickupArea")?;
    let pickup_time = required_str(req, "pickupTime")?;

    if !validate::validate_time(&pickup_time) {
        return Err(err(
            &req.id,
            "bad_params",
            "pickupTime must be zero-padded 24-hour HH:MM",
            Some(json!({ "pickupTime": pickup_time })),
        ));
    }

    let dropoff_area = optional_str(req, "dropoffArea");
    let dropoff_time = optional_str(req, "dropoffTime");
    if let Some(t) = &dropoff_time {
        if !validate::validate_time(t) {
            return Err(err(
                &req.id,
                "bad_params",
                "dropoffTime must be zero-padded 24-hour HH:MM",
                Some(json!({ "dropoffTime": t })),
            ));
        }
    }

    let father_phone = validate::format_phone_number(&required_str(req, "fatherPhone")?);
    let mother_phone = validate::format_phone_number(&required_str(req, "motherPhone")?);
    for (field, phone) in [("fatherPhone", &father_phone), ("motherPhone", &mother_phone)] {
        if !validate::validate_phone(phone) {
            return Err(err(
                &req.id,
                "bad_params",
                format!("{} must normalize to +254XXXXXXXXX", field),
                Some(json!({ field: phone })),
            ));
        }
    }

    Ok(LearnerInput {
        admission_no,
        name,
        class,
        route_id,
        pickup_area,
        pickup_time,
        dropoff_area,
        dropoff_time,
        father_phone,
        mother_phone,
    })
}

fn route_exists(conn: &Connection, req: &Request, route_id: &str) -> Result<(), serde_json::Value> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM routes WHERE id = ?", [route_id], |r| r.get(0))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(&req.id, "not_found", "route not found", None));
    }
    Ok(())
}

fn fetch_learner(
    conn: &Connection,
    req: &Request,
    learner_id: &str,
) -> Result<LearnerRow, serde_json::Value> {
    let sql = format!("SELECT {} FROM learners WHERE id = ?", db::LEARNER_COLUMNS);
    conn.query_row(&sql, [learner_id], db::map_learner)
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?
        .ok_or_else(|| err(&req.id, "not_found", "learner not found", None))
}

fn admission_in_use(
    conn: &Connection,
    req: &Request,
    admission_no: &str,
    exclude_learner_id: Option<&str>,
) -> Result<bool, serde_json::Value> {
    let mut sql = "SELECT COUNT(*) FROM learners WHERE admission_no = ?".to_string();
    let mut params: Vec<Value> = vec![Value::Text(admission_no.to_string())];
    if let Some(id) = exclude_learner_id {
        sql.push_str(" AND id <> ?");
        params.push(Value::Text(id.to_string()));
    }
    let count: i64 = conn
        .query_row(&sql, params_from_iter(params), |r| r.get(0))
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(count > 0)
}

/// Learners in pickup order: by minute of day, then name. Rows whose stored
/// time fails to parse sink to the end.
fn sort_by_pickup(learners: &mut [LearnerRow]) {
    learners.sort_by(|a, b| {
        let ka = PickupTime::parse(&a.pickup_time).map(|t| t.minute_of_day()).unwrap_or(u16::MAX);
        let kb = PickupTime::parse(&b.pickup_time).map(|t| t.minute_of_day()).unwrap_or(u16::MAX);
        ka.cmp(&kb).then_with(|| a.name.cmp(&b.name))
    });
}

fn conflict_warning(check: &schedule::ConflictCheck) -> Option<serde_json::Value> {
    if !check.has_conflict {
        return None;
    }
    Some(json!({
        "message": schedule::conflict_message(&check.conflicts),
        "conflicts": check.conflicts,
        "degraded": check.degraded,
    }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut sql = format!("SELECT {} FROM learners WHERE 1=1", db::LEARNER_COLUMNS);
    let mut params: Vec<Value> = Vec::new();
    if let Some(route_id) = optional_str(req, "routeId") {
        sql.push_str(" AND route_id = ?");
        params.push(Value::Text(route_id));
    }
    if let Some(active) = optional_bool(req, "active") {
        sql.push_str(" AND active = ?");
        params.push(Value::Integer(active as i64));
    }
    if let Some(class) = optional_str(req, "class") {
        sql.push_str(" AND class = ?");
        params.push(Value::Text(class));
    }

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(params), db::map_learner)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(mut learners) => {
            sort_by_pickup(&mut learners);
            ok(&req.id, json!({ "learners": learners }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let learner_id = match required_str(req, "learnerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match fetch_learner(conn, req, &learner_id) {
        Ok(learner) => ok(&req.id, json!({ "learner": learner })),
        Err(e) => e,
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let input = match parse_learner_input(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = route_exists(conn, req, &input.route_id) {
        return e;
    }
    match admission_in_use(conn, req, &input.admission_no, None) {
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_admission",
                "admission number already in use",
                Some(json!({ "admissionNo": input.admission_no })),
            )
        }
        Ok(false) => {}
        Err(e) => return e,
    }

    // Scheduling conflicts warn; they never block the save.
    let time = match PickupTime::parse(&input.pickup_time) {
        Some(t) => t,
        None => return err(&req.id, "bad_params", "invalid pickupTime", None),
    };
    let check = schedule::check_conflicts(
        conn,
        &input.route_id,
        time,
        &input.pickup_area,
        None,
        conflicts::default_policy(conn),
    );

    let learner_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO learners(id, route_id, admission_no, name, class, pickup_area, pickup_time,
             dropoff_area, dropoff_time, father_phone, mother_phone, active, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &learner_id,
            &input.route_id,
            &input.admission_no,
            &input.name,
            &input.class,
            &input.pickup_area,
            &input.pickup_time,
            &input.dropoff_area,
            &input.dropoff_time,
            &input.father_phone,
            &input.mother_phone,
            db::now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "learners" })),
        );
    }

    db::record_audit(
        conn,
        &actor(req),
        "learner.create",
        "learner",
        Some(&learner_id),
        Some(&input.route_id),
        Some(json!({ "admissionNo": input.admission_no, "name": input.name })),
    );

    let learner = match fetch_learner(conn, req, &learner_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut result = json!({ "learner": learner });
    if let Some(warning) = conflict_warning(&check) {
        result["conflictWarning"] = warning;
    }
    ok(&req.id, result)
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let learner_id = match required_str(req, "learnerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = fetch_learner(conn, req, &learner_id) {
        return e;
    }
    let input = match parse_learner_input(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = route_exists(conn, req, &input.route_id) {
        return e;
    }
    match admission_in_use(conn, req, &input.admission_no, Some(&learner_id)) {
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_admission",
                "admission number already in use",
                Some(json!({ "admissionNo": input.admission_no })),
            )
        }
        Ok(false) => {}
        Err(e) => return e,
    }

    let time = match PickupTime::parse(&input.pickup_time) {
        Some(t) => t,
        None => return err(&req.id, "bad_params", "invalid pickupTime", None),
    };
    let check = schedule::check_conflicts(
        conn,
        &input.route_id,
        time,
        &input.pickup_area,
        Some(&learner_id),
        conflicts::default_policy(conn),
    );

    let result = if let Some(active) = optional_bool(req, "active") {
        conn.execute(
            "UPDATE learners SET route_id = ?, admission_no = ?, name = ?, class = ?,
                 pickup_area = ?, pickup_time = ?, dropoff_area = ?, dropoff_time = ?,
                 father_phone = ?, mother_phone = ?, active = ?, updated_at = ?
             WHERE id = ?",
            (
                &input.route_id,
                &input.admission_no,
                &input.name,
                &input.class,
                &input.pickup_area,
                &input.pickup_time,
                &input.dropoff_area,
                &input.dropoff_time,
                &input.father_phone,
                &input.mother_phone,
                active as i64,
                db::now_rfc3339(),
                &learner_id,
            ),
        )
    } else {
        conn.execute(
            "UPDATE learners SET route_id = ?, admission_no = ?, name = ?, class = ?,
                 pickup_area = ?, pickup_time = ?, dropoff_area = ?, dropoff_time = ?,
                 father_phone = ?, mother_phone = ?, updated_at = ?
             WHERE id = ?",
            (
                &input.route_id,
                &input.admission_no,
                &input.name,
                &input.class,
                &input.pickup_area,
                &input.pickup_time,
                &input.dropoff_area,
                &input.dropoff_time,
                &input.father_phone,
                &input.mother_phone,
                db::now_rfc3339(),
                &learner_id,
            ),
        )
    };
    if let Err(e) = result {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "learners" })),
        );
    }

    db::record_audit(
        conn,
        &actor(req),
        "learner.update",
        "learner",
        Some(&learner_id),
        Some(&input.route_id),
        Some(json!({ "admissionNo": input.admission_no })),
    );

    let learner = match fetch_learner(conn, req, &learner_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut result = json!({ "learner": learner });
    if let Some(warning) = conflict_warning(&check) {
        result["conflictWarning"] = warning;
    }
    ok(&req.id, result)
}

fn handle_set_active(state: &mut AppState, req: &Request, active: bool) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let learner_id = match required_str(req, "learnerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let existing = match fetch_learner(conn, req, &learner_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "UPDATE learners SET active = ?, updated_at = ? WHERE id = ?",
        (active as i64, db::now_rfc3339(), &learner_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let action = if active {
        "learner.reactivate"
    } else {
        "learner.deactivate"
    };
    db::record_audit(
        conn,
        &actor(req),
        action,
        "learner",
        Some(&learner_id),
        Some(&existing.route_id),
        Some(json!({ "admissionNo": existing.admission_no })),
    );

    match fetch_learner(conn, req, &learner_id) {
        Ok(learner) => ok(&req.id, json!({ "learner": learner })),
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
    let active_only = optional_bool(req, "activeOnly").unwrap_or(true);

    let mut sql = format!("SELECT {} FROM learners WHERE route_id = ?", db::LEARNER_COLUMNS);
    if active_only {
        sql.push_str(" AND active = 1");
    }
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&route_id], db::map_learner)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(mut learners) => {
            sort_by_pickup(&mut learners);
            ok(&req.id, json!({ "learners": learners }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_count_by_route(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let active_only = optional_bool(req, "activeOnly").unwrap_or(true);

    let mut sql = "SELECT COUNT(*) FROM learners WHERE route_id = ?".to_string();
    if active_only {
        sql.push_str(" AND active = 1");
    }
    match conn.query_row(&sql, [&route_id], |r| r.get::<_, i64>(0)) {
        Ok(count) => ok(&req.id, json!({ "count": count })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_check_duplicate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let admission_no = match required_str(req, "admissionNo") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exclude = optional_str(req, "excludeLearnerId");
    match admission_in_use(conn, req, &admission_no, exclude.as_deref()) {
        Ok(duplicate) => ok(&req.id, json!({ "duplicate": duplicate })),
        Err(e) => e,
    }
}

fn handle_search(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = match required_str(req, "term") {
        Ok(v) => v.to_lowercase(),
        Err(e) => return e,
    };

    let mut sql = format!("SELECT {} FROM learners WHERE 1=1", db::LEARNER_COLUMNS);
    let mut params: Vec<Value> = Vec::new();
    if let Some(route_id) = optional_str(req, "routeId") {
        sql.push_str(" AND route_id = ?");
        params.push(Value::Text(route_id));
    }

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(params), db::map_learner)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(mut learners) => {
            learners.retain(|l| {
                l.name.to_lowercase().contains(&term)
                    || l.admission_no.to_lowercase().contains(&term)
                    || l.class.to_lowercase().contains(&term)
                    || l.pickup_area.to_lowercase().contains(&term)
            });
            sort_by_pickup(&mut learners);
            ok(&req.id, json!({ "learners": learners }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_unique_classes(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut stmt = match conn.prepare("SELECT DISTINCT class FROM learners ORDER BY class") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let labels = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let labels = match labels {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let grades = match super::settings::grade_names(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let classes = labels
        .iter()
        .map(|label| {
            let (grade, stream) = validate::parse_class_label(label, &grades);
            json!({ "label": label, "grade": grade, "stream": stream })
        })
        .collect::<Vec<_>>();

    ok(&req.id, json!({ "classes": classes }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "learners.list" => Some(handle_list(state, req)),
        "learners.get" => Some(handle_get(state, req)),
        "learners.create" => Some(handle_create(state, req)),
        "learners.update" => Some(handle_update(state, req)),
        "learners.deactivate" => Some(handle_set_active(state, req, false)),
        "learners.reactivate" => Some(handle_set_active(state, req, true)),
        "learners.byRoute" => Some(handle_by_route(state, req)),
        "learners.countByRoute" => Some(handle_count_by_route(state, req)),
        "learners.checkDuplicateAdmission" => Some(handle_check_duplicate(state, req)),
        "learners.search" => Some(handle_search(state, req)),
        "learners.uniqueClasses" => Some(handle_unique_classes(state, req)),
        _ => None,
    }
}
