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

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn seed_route_with_roster(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        "r1",
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

    for (i, (admission, time, area)) in [
        ("1001", "07:30", "Westlands"),
        ("1002", "07:30", "Kilimani"),
        ("1003", "08:00", "Kilimani"),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            stdin,
            reader,
            &format!("l{}", i),
            "learners.create",
            json!({
                "routeId": route_id,
                "admissionNo": admission,
                "name": format!("Learner {}", admission),
                "class": "Grade 1",
                "pickupArea": area,
                "pickupTime": time,
                "fatherPhone": "0712345678",
                "motherPhone": "0723456789"
            }),
        );
    }
    route_id
}

#[test]
fn route_manifest_sections() {
    let workspace = temp_dir("transportd-report-manifest");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let route_id = seed_route_with_roster(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "d1",
        "drivers.create",
        json!({
            "name": "David Driver",
            "email": "david@example.com",
            "phone": "0712000001",
            "routeId": route_id
        }),
    );
    // Deactivate one learner so the summary splits active/inactive.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "ls",
        "learners.byRoute",
        json!({ "routeId": route_id }),
    );
    let third = listed["learners"]
        .as_array()
        .and_then(|a| a.iter().find(|l| l["admissionNo"].as_str() == Some("1003")))
        .and_then(|l| l["id"].as_str())
        .expect("learner 1003 id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "deact",
        "learners.deactivate",
        json!({ "learnerId": third }),
    );

    let manifest = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "reports.routeManifest",
        json!({ "routeId": route_id }),
    );

    assert_eq!(manifest["route"]["name"].as_str(), Some("Route A"));
    assert_eq!(manifest["route"]["vehicleNo"].as_str(), Some("KBX 123A"));
    assert_eq!(manifest["route"]["totalLearners"].as_i64(), Some(3));
    assert_eq!(manifest["route"]["totalAreas"].as_i64(), Some(2));

    assert_eq!(
        manifest["personnel"]["driverName"].as_str(),
        Some("David Driver")
    );
    assert_eq!(
        manifest["personnel"]["driverPhone"].as_str(),
        Some("+254712000001")
    );
    // No minder assigned.
    assert_eq!(
        manifest["personnel"]["minderName"].as_str(),
        Some("Not Assigned")
    );
    assert_eq!(manifest["personnel"]["minderPhone"].as_str(), Some("N/A"));

    let rows = manifest["learners"].as_array().expect("learner rows");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["position"].as_i64(), Some(1));
    assert_eq!(rows[0]["pickupTime"].as_str(), Some("07:30"));
    assert_eq!(rows[2]["status"].as_str(), Some("Inactive"));

    let summary = &manifest["areaSummary"];
    assert_eq!(summary["total"].as_i64(), Some(3));
    assert_eq!(summary["active"].as_i64(), Some(2));
    assert_eq!(summary["inactive"].as_i64(), Some(1));
    let kilimani = summary["rows"]
        .as_array()
        .and_then(|a| a.iter().find(|r| r["area"].as_str() == Some("Kilimani")))
        .expect("Kilimani summary row");
    assert_eq!(kilimani["total"].as_i64(), Some(2));
    assert_eq!(kilimani["active"].as_i64(), Some(1));

    // Contacts carry active learners only.
    assert_eq!(manifest["contacts"].as_array().map(|a| a.len()), Some(2));
    assert!(manifest["generated"].as_str().is_some());
}

#[test]
fn conflict_summary_report() {
    let workspace = temp_dir("transportd-report-conflicts");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let route_id = seed_route_with_roster(&mut stdin, &mut reader);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.conflictSummary",
        json!({ "routeId": route_id }),
    );
    assert_eq!(report["conflictCount"].as_i64(), Some(1));
    let conflict = &report["conflicts"][0];
    assert_eq!(conflict["time"].as_str(), Some("07:30"));
    assert!(conflict["message"]
        .as_str()
        .unwrap_or_default()
        .contains("same pickup time in different areas"));
}

#[test]
fn csv_export_writes_roster() {
    let workspace = temp_dir("transportd-report-csv");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let route_id = seed_route_with_roster(&mut stdin, &mut reader);

    let out_path = workspace.join("roster_export.csv");
    let result = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.exportLearnersCsv",
        json!({ "routeId": route_id, "path": out_path.to_string_lossy() }),
    );
    assert_eq!(result["rows"].as_i64(), Some(3));

    let text = std::fs::read_to_string(&out_path).expect("export exists");
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("admission_no,name,class,pickup_area,pickup_time,father_phone,mother_phone,active")
    );
    assert_eq!(lines.clone().count(), 3);
    assert!(lines.any(|l| l.starts_with("1001,Learner 1001,Grade 1,Westlands,07:30")));
}
