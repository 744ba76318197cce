use crate::csv::{csv_quote, parse_csv_record};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{actor, db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use crate::validate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const DEFAULT_PICKUP_TIME: &str = "07:00";

fn header_index(header_line: &str) -> HashMap<String, usize> {
    let mut idx = HashMap::new();
    for (i, field) in parse_csv_record(header_line).into_iter().enumerate() {
        idx.insert(field.trim().to_ascii_lowercase(), i);
    }
    idx
}

fn field(fields: &[String], col: Option<usize>) -> String {
    col.and_then(|c| fields.get(c))
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
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

fn read_rows(
    req: &Request,
    path: &str,
) -> Result<(HashMap<String, usize>, Vec<(usize, Vec<String>)>), serde_json::Value> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        err(
            &req.id,
            "file_read_failed",
            format!("failed to read {}: {}", path, e),
            None,
        )
    })?;
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Err(err(&req.id, "bad_file", "file is empty", None));
    }
    let idx = header_index(lines[0]);
    let mut rows = Vec::new();
    for (line_no, raw_line) in lines.iter().enumerate().skip(1) {
        if raw_line.trim().is_empty() {
            continue;
        }
        // Spreadsheet row number: header is row 1.
        rows.push((line_no + 1, parse_csv_record(raw_line)));
    }
    Ok((idx, rows))
}

fn handle_import_learners(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = route_exists(conn, req, &route_id) {
        return e;
    }
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (idx, rows) = match read_rows(req, &path) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let admission_col = idx.get("admission number").copied();
    let name_col = idx.get("name").copied();
    let class_col = idx.get("class").copied();
    let area_col = idx.get("pickup area").copied();
    let time_col = idx.get("pickup time").copied();
    let father_col = idx.get("father phone").copied();
    let mother_col = idx.get("mother phone").copied();

    let total = rows.len();
    let mut successful = 0usize;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (row_no, fields) in rows {
        let admission_no = field(&fields, admission_col);
        let name = field(&fields, name_col);
        let class = field(&fields, class_col);
        if !validate::validate_admission_no(&admission_no) || name.is_empty() || class.is_empty() {
            errors.push(json!({ "row": row_no, "error": "Missing required fields" }));
            continue;
        }

        let father_phone = validate::format_phone_number(&field(&fields, father_col));
        let mother_phone = validate::format_phone_number(&field(&fields, mother_col));
        if !validate::validate_phone(&father_phone) || !validate::validate_phone(&mother_phone) {
            errors.push(json!({ "row": row_no, "error": "Invalid phone number format" }));
            continue;
        }

        let mut pickup_time = field(&fields, time_col);
        if pickup_time.is_empty() {
            pickup_time = DEFAULT_PICKUP_TIME.to_string();
        }
        if !validate::validate_time(&pickup_time) {
            errors.push(json!({ "row": row_no, "error": "Invalid pickup time format" }));
            continue;
        }

        let duplicate: Result<i64, _> = conn.query_row(
            "SELECT COUNT(*) FROM learners WHERE admission_no = ?",
            [&admission_no],
            |r| r.get(0),
        );
        match duplicate {
            Ok(0) => {}
            Ok(_) => {
                errors.push(json!({ "row": row_no, "error": "Duplicate admission number" }));
                continue;
            }
            Err(e) => {
                errors.push(json!({ "row": row_no, "error": e.to_string() }));
                continue;
            }
        }

        let pickup_area = field(&fields, area_col);
        let insert = conn.execute(
            "INSERT INTO learners(id, route_id, admission_no, name, class, pickup_area,
                 pickup_time, father_phone, mother_phone, active, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?)",
            (
                Uuid::new_v4().to_string(),
                &route_id,
                &admission_no,
                &name,
                &class,
                &pickup_area,
                &pickup_time,
                &father_phone,
                &mother_phone,
                db::now_rfc3339(),
            ),
        );
        match insert {
            Ok(_) => successful += 1,
            Err(e) => errors.push(json!({ "row": row_no, "error": e.to_string() })),
        }
    }

    db::record_audit(
        conn,
        &actor(req),
        "import.learners",
        "route",
        Some(&route_id),
        Some(&route_id),
        Some(json!({ "total": total, "successful": successful, "failed": errors.len() })),
    );

    ok(
        &req.id,
        json!({
            "total": total,
            "successful": successful,
            "failed": errors.len(),
            "errors": errors,
        }),
    )
}

fn handle_import_areas(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = route_exists(conn, req, &route_id) {
        return e;
    }
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (idx, rows) = match read_rows(req, &path) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let area_col = idx.get("area name").copied().or(Some(0));
    let total = rows.len();
    let mut areas: Vec<String> = Vec::new();
    for (_, fields) in rows {
        let area = field(&fields, area_col);
        if area.is_empty() {
            continue;
        }
        if !areas.iter().any(|a| a == &area) {
            areas.push(area);
        }
    }

    let areas_json = serde_json::to_string(&areas).unwrap_or_else(|_| "[]".to_string());
    if let Err(e) = conn.execute(
        "UPDATE routes SET areas = ? WHERE id = ?",
        (&areas_json, &route_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    db::record_audit(
        conn,
        &actor(req),
        "import.areas",
        "route",
        Some(&route_id),
        Some(&route_id),
        Some(json!({ "total": total, "areas": areas.len() })),
    );

    let successful = areas.len();
    ok(
        &req.id,
        json!({
            "total": total,
            "successful": successful,
            "failed": total.saturating_sub(successful),
            "areas": areas,
        }),
    )
}

fn write_template(req: &Request, path: &str, rows: &[Vec<&str>]) -> Result<(), serde_json::Value> {
    let mut out = String::new();
    for row in rows {
        let line = row
            .iter()
            .map(|cell| csv_quote(cell))
            .collect::<Vec<_>>()
            .join(",");
        out.push_str(&line);
        out.push('\n');
    }
    std::fs::write(path, out).map_err(|e| {
        err(
            &req.id,
            "file_write_failed",
            format!("failed to write {}: {}", path, e),
            None,
        )
    })
}

fn handle_learners_template(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = db_conn(state, req) {
        return e;
    }
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rows = vec![
        vec![
            "Admission Number",
            "Name",
            "Class",
            "Pickup Area",
            "Pickup Time",
            "Father Phone",
            "Mother Phone",
        ],
        vec![
            "12345",
            "John Doe",
            "Grade 1",
            "Westlands",
            "07:30",
            "+254712345678",
            "+254723456789",
        ],
        vec![
            "12346",
            "Jane Smith",
            "Grade 2",
            "Kilimani",
            "07:45",
            "+254734567890",
            "+254745678901",
        ],
    ];
    match write_template(req, &path, &rows) {
        Ok(()) => ok(&req.id, json!({ "path": path })),
        Err(e) => e,
    }
}

fn handle_areas_template(state: &mut AppState, req: &Request) -> serde_json::Value {
    if let Err(e) = db_conn(state, req) {
        return e;
    }
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rows = vec![
        vec!["Area Name"],
        vec!["Westlands"],
        vec!["Kilimani"],
        vec!["Lavington"],
        vec!["Parklands"],
    ];
    match write_template(req, &path, &rows) {
        Ok(()) => ok(&req.id, json!({ "path": path })),
        Err(e) => e,
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "import.learners" => Some(handle_import_learners(state, req)),
        "import.areas" => Some(handle_import_areas(state, req)),
        "import.learnersTemplate" => Some(handle_learners_template(state, req)),
        "import.areasTemplate" => Some(handle_areas_template(state, req)),
        _ => None,
    }
}
