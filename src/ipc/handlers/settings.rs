use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{actor, db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const DEFAULT_GRADES: [&str; 6] = [
    "Grade 1", "Grade 2", "Grade 3", "Grade 4", "Grade 5", "Grade 6",
];

/// Configured grade names in creation order, seeding the defaults into an
/// empty workspace on first use.
pub fn grade_names(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    seed_defaults_if_empty(conn)?;
    let mut stmt = conn
        .prepare("SELECT name FROM school_config WHERE type = 'grade' ORDER BY created_at, name")?;
    let rows = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>();
    rows
}

fn seed_defaults_if_empty(conn: &Connection) -> rusqlite::Result<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM school_config", [], |r| r.get(0))?;
    if count > 0 {
        return Ok(());
    }
    for name in DEFAULT_GRADES {
        conn.execute(
            "INSERT INTO school_config(id, type, name, parent_id, created_at)
             VALUES(?, 'grade', ?, NULL, ?)",
            (Uuid::new_v4().to_string(), name, db::now_rfc3339()),
        )?;
    }
    Ok(())
}

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = seed_defaults_if_empty(conn) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    let mut stmt = match conn.prepare(
        "SELECT id, type, name, parent_id FROM school_config ORDER BY created_at, name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let kind: String = r.get(1)?;
            let name: String = r.get(2)?;
            let parent_id: Option<String> = r.get(3)?;
            Ok((id, kind, name, parent_id))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut grades = Vec::new();
    for (id, _, name, _) in rows.iter().filter(|(_, kind, _, _)| kind == "grade") {
        let streams = rows
            .iter()
            .filter(|(_, k, _, parent)| k == "stream" && parent.as_deref() == Some(id.as_str()))
            .map(|(sid, _, sname, _)| json!({ "id": sid, "name": sname }))
            .collect::<Vec<_>>();
        grades.push(json!({ "id": id, "name": name, "streams": streams }));
    }

    ok(&req.id, json!({ "grades": grades }))
}

fn handle_grades_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let stream_names: Vec<String> = req
        .params
        .get("streams")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if let Err(e) = seed_defaults_if_empty(conn) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    let grade_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO school_config(id, type, name, parent_id, created_at)
         VALUES(?, 'grade', ?, NULL, ?)",
        (&grade_id, &name, db::now_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    let mut streams = Vec::new();
    for stream_name in &stream_names {
        let stream_id = Uuid::new_v4().to_string();
        if let Err(e) = conn.execute(
            "INSERT INTO school_config(id, type, name, parent_id, created_at)
             VALUES(?, 'stream', ?, ?, ?)",
            (&stream_id, stream_name, &grade_id, db::now_rfc3339()),
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
        streams.push(json!({ "id": stream_id, "name": stream_name }));
    }

    db::record_audit(
        conn,
        &actor(req),
        "settings.grade.add",
        "grade",
        Some(&grade_id),
        None,
        Some(json!({ "name": name, "streams": stream_names })),
    );

    ok(
        &req.id,
        json!({ "grade": { "id": grade_id, "name": name, "streams": streams } }),
    )
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM school_config WHERE id = ? AND type = 'grade'",
            [&grade_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "grade not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM school_config WHERE parent_id = ?",
        [&grade_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM school_config WHERE id = ?", [&grade_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    db::record_audit(
        conn,
        &actor(req),
        "settings.grade.delete",
        "grade",
        Some(&grade_id),
        None,
        None,
    );

    ok(&req.id, json!({ "ok": true }))
}

fn handle_streams_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM school_config WHERE id = ? AND type = 'grade'",
            [&grade_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "grade not found", None);
    }

    let stream_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO school_config(id, type, name, parent_id, created_at)
         VALUES(?, 'stream', ?, ?, ?)",
        (&stream_id, &name, &grade_id, db::now_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    db::record_audit(
        conn,
        &actor(req),
        "settings.stream.add",
        "stream",
        Some(&stream_id),
        None,
        Some(json!({ "name": name, "gradeId": grade_id })),
    );

    ok(
        &req.id,
        json!({ "stream": { "id": stream_id, "name": name, "gradeId": grade_id } }),
    )
}

fn handle_streams_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let stream_id = match required_str(req, "streamId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let affected = match conn.execute(
        "DELETE FROM school_config WHERE id = ? AND type = 'stream'",
        [&stream_id],
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if affected == 0 {
        return err(&req.id, "not_found", "stream not found", None);
    }

    db::record_audit(
        conn,
        &actor(req),
        "settings.stream.delete",
        "stream",
        Some(&stream_id),
        None,
        None,
    );

    ok(&req.id, json!({ "ok": true }))
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match required_str(req, "key") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::settings_get_json(conn, &key) {
        Ok(value) => ok(&req.id, json!({ "key": key, "value": value })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let key = match required_str(req, "key") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(value) = req.params.get("value") else {
        return err(&req.id, "bad_params", "missing value", None);
    };
    match db::settings_set_json(conn, &key, value) {
        Ok(()) => ok(&req.id, json!({ "key": key })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_get(state, req)),
        "settings.set" => Some(handle_set(state, req)),
        "settings.grades.list" => Some(handle_grades_list(state, req)),
        "settings.grades.add" => Some(handle_grades_add(state, req)),
        "settings.grades.delete" => Some(handle_grades_delete(state, req)),
        "settings.streams.add" => Some(handle_streams_add(state, req)),
        "settings.streams.delete" => Some(handle_streams_delete(state, req)),
        _ => None,
    }
}
