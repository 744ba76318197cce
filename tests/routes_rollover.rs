use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_transportd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn transportd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn duplicate_route_copies_active_roster() {
    let workspace = temp_dir("transportd-rollover");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "routes.create",
        json!({
            "name": "Route A",
            "vehicleNo": "KBX 123A",
            "areas": ["Westlands", "Kilimani"],
            "term": "Term 1",
            "year": 2026
        }),
    );
    let route_id = created["route"]["id"].as_str().expect("route id").to_string();

    for (i, admission) in ["1001", "1002", "1003"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("l{}", i),
            "learners.create",
            json!({
                "routeId": route_id,
                "admissionNo": admission,
                "name": format!("Learner {}", admission),
                "class": "Grade 1",
                "pickupArea": "Westlands",
                "pickupTime": "07:30",
                "fatherPhone": "0712345678",
                "motherPhone": "0712345679"
            }),
        );
    }
    // One deactivated learner must not roll over.
    let inactive = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "learners.create",
        json!({
            "routeId": route_id,
            "admissionNo": "1004",
            "name": "Learner 1004",
            "class": "Grade 1",
            "pickupArea": "Kilimani",
            "pickupTime": "07:45",
            "fatherPhone": "0712345678",
            "motherPhone": "0712345679"
        }),
    );
    let inactive_id = inactive["learner"]["id"].as_str().expect("id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "learners.deactivate",
        json!({ "learnerId": inactive_id }),
    );

    let duplicated = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "routes.duplicate",
        json!({
            "routeId": route_id,
            "newTerm": "Term 2",
            "newYear": 2026,
            "copyLearners": true
        }),
    );
    assert_eq!(duplicated["copiedLearners"].as_i64(), Some(3));
    let new_route = &duplicated["route"];
    let new_route_id = new_route["id"].as_str().expect("new route id").to_string();
    assert_ne!(new_route_id, route_id);
    assert_eq!(new_route["term"].as_str(), Some("Term 2"));
    assert_eq!(new_route["year"].as_i64(), Some(2026));
    assert_eq!(new_route["status"].as_str(), Some("active"));
    assert_eq!(
        new_route["areas"].as_array().map(|a| a.len()),
        Some(2),
        "area list rolls over with the route"
    );

    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "learners.byRoute",
        json!({ "routeId": new_route_id }),
    );
    let learners = roster["learners"].as_array().expect("learners");
    assert_eq!(learners.len(), 3);
    for learner in learners {
        let admission = learner["admissionNo"].as_str().unwrap_or_default();
        assert!(
            admission.ends_with("-2026-Term2"),
            "cloned admission keeps a term suffix: {}",
            admission
        );
        assert_eq!(learner["active"].as_bool(), Some(true));
    }

    // The source roster is untouched.
    let original = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "learners.countByRoute",
        json!({ "routeId": route_id }),
    );
    assert_eq!(original["count"].as_i64(), Some(3));
}

#[test]
fn archive_hides_route_from_active_list() {
    let workspace = temp_dir("transportd-archive");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "routes.create",
        json!({
            "name": "Route A",
            "vehicleNo": "KBX 123A",
            "areas": [],
            "term": "Term 1",
            "year": 2026
        }),
    );
    let route_id = created["route"]["id"].as_str().expect("route id").to_string();

    let archived = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "routes.archive",
        json!({ "routeId": route_id }),
    );
    assert_eq!(archived["route"]["status"].as_str(), Some("archived"));

    let active = request_ok(&mut stdin, &mut reader, "4", "routes.list", json!({}));
    assert_eq!(active["routes"].as_array().map(|a| a.len()), Some(0));

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "routes.list",
        json!({ "status": "all" }),
    );
    assert_eq!(all["routes"].as_array().map(|a| a.len()), Some(1));
}

#[test]
fn delete_refuses_while_learners_reference_route() {
    let workspace = temp_dir("transportd-route-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "routes.create",
        json!({
            "name": "Route A",
            "vehicleNo": "KBX 123A",
            "areas": [],
            "term": "Term 1",
            "year": 2026
        }),
    );
    let route_id = created["route"]["id"].as_str().expect("route id").to_string();

    let learner = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "learners.create",
        json!({
            "routeId": route_id,
            "admissionNo": "1001",
            "name": "Learner 1001",
            "class": "Grade 1",
            "pickupArea": "Westlands",
            "pickupTime": "07:30",
            "fatherPhone": "0712345678",
            "motherPhone": "0712345679"
        }),
    );
    let learner_id = learner["learner"]["id"].as_str().expect("id").to_string();
    // Soft-deleted history still pins the route.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "learners.deactivate",
        json!({ "learnerId": learner_id }),
    );

    let refused = request(
        &mut stdin,
        &mut reader,
        "5",
        "routes.delete",
        json!({ "routeId": route_id }),
    );
    assert_eq!(refused["ok"].as_bool(), Some(false));
    assert_eq!(refused["error"]["code"].as_str(), Some("route_in_use"));

    // An empty route can be hard-deleted.
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "routes.create",
        json!({
            "name": "Route B",
            "vehicleNo": "KBY 456B",
            "areas": [],
            "term": "Term 1",
            "year": 2026
        }),
    );
    let empty_id = empty["route"]["id"].as_str().expect("id").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "routes.delete",
        json!({ "routeId": empty_id }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "8",
        "routes.get",
        json!({ "routeId": empty_id }),
    );
    assert_eq!(gone["ok"].as_bool(), Some(false));
    assert_eq!(gone["error"]["code"].as_str(), Some("not_found"));
}
