use crate::db::{self, LearnerRow};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Minute-of-day pickup time.
///
/// Parsed only from strict zero-padded 24-hour `HH:MM`. Comparison, grouping,
/// and ordering all happen on the minute value; the canonical string is
/// re-derived for storage and display. Stored values that fail to parse are
/// skipped by the evaluator rather than compared as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PickupTime(u16);

impl PickupTime {
    pub fn parse(s: &str) -> Option<PickupTime> {
        let b = s.as_bytes();
        if b.len() != 5 || b[2] != b':' {
            return None;
        }
        if !b[0].is_ascii_digit()
            || !b[1].is_ascii_digit()
            || !b[3].is_ascii_digit()
            || !b[4].is_ascii_digit()
        {
            return None;
        }
        let hour = (b[0] - b'0') as u16 * 10 + (b[1] - b'0') as u16;
        let minute = (b[3] - b'0') as u16 * 10 + (b[4] - b'0') as u16;
        if hour > 23 || minute > 59 {
            return None;
        }
        Some(PickupTime(hour * 60 + minute))
    }

    pub fn minute_of_day(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PickupTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// What a degraded (storage-failure) conflict check reports.
///
/// `FailOpen` lets the save proceed with no conflict flagged; `FailClosed`
/// flags a conflict with no learner detail so a stricter host can block the
/// save during an outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    FailOpen,
    FailClosed,
}

impl ConflictPolicy {
    pub fn parse(s: &str) -> Option<ConflictPolicy> {
        match s {
            "failOpen" => Some(ConflictPolicy::FailOpen),
            "failClosed" => Some(ConflictPolicy::FailClosed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::FailOpen => "failOpen",
            ConflictPolicy::FailClosed => "failClosed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictCheck {
    pub has_conflict: bool,
    pub conflicts: Vec<LearnerRow>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictGroup {
    pub time: String,
    pub learners: Vec<LearnerRow>,
    pub areas: Vec<String>,
}

/// Other active learners on `route_id` sharing `pickup_time` exactly but
/// standing in a different pickup area. `exclude_learner_id` keeps an edited
/// learner from conflicting with itself. Storage failure resolves per
/// `policy` and never escapes this function.
pub fn check_conflicts(
    conn: &Connection,
    route_id: &str,
    pickup_time: PickupTime,
    pickup_area: &str,
    exclude_learner_id: Option<&str>,
    policy: ConflictPolicy,
) -> ConflictCheck {
    match query_conflicting(conn, route_id, pickup_time, pickup_area, exclude_learner_id) {
        Ok(conflicts) => ConflictCheck {
            has_conflict: !conflicts.is_empty(),
            conflicts,
            degraded: false,
        },
        Err(e) => {
            log::warn!("conflict check degraded for route {}: {}", route_id, e);
            ConflictCheck {
                has_conflict: matches!(policy, ConflictPolicy::FailClosed),
                conflicts: Vec::new(),
                degraded: true,
            }
        }
    }
}

fn query_conflicting(
    conn: &Connection,
    route_id: &str,
    pickup_time: PickupTime,
    pickup_area: &str,
    exclude_learner_id: Option<&str>,
) -> rusqlite::Result<Vec<LearnerRow>> {
    let mut sql = format!(
        "SELECT {} FROM learners
         WHERE route_id = ? AND active = 1 AND pickup_area <> ?",
        db::LEARNER_COLUMNS
    );
    let mut params: Vec<Value> = vec![
        Value::Text(route_id.to_string()),
        Value::Text(pickup_area.to_string()),
    ];
    if let Some(id) = exclude_learner_id {
        sql.push_str(" AND id <> ?");
        params.push(Value::Text(id.to_string()));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), db::map_learner)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter(|l| PickupTime::parse(&l.pickup_time) == Some(pickup_time))
        .collect())
}

/// Full-route conflict report: active learners grouped by exact pickup
/// minute; every group with more than one distinct pickup area yields one
/// record, ordered by time. Degrades to an empty report on storage failure.
pub fn route_conflicts(conn: &Connection, route_id: &str) -> Vec<ConflictGroup> {
    let learners = match active_learners(conn, route_id) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("route conflict report degraded for {}: {}", route_id, e);
            return Vec::new();
        }
    };

    let mut by_time: BTreeMap<PickupTime, Vec<LearnerRow>> = BTreeMap::new();
    for learner in learners {
        let Some(time) = PickupTime::parse(&learner.pickup_time) else {
            continue;
        };
        by_time.entry(time).or_default().push(learner);
    }

    let mut out = Vec::new();
    for (time, group) in by_time {
        if group.len() < 2 {
            continue;
        }
        let mut areas: Vec<String> = Vec::new();
        for learner in &group {
            if !areas.contains(&learner.pickup_area) {
                areas.push(learner.pickup_area.clone());
            }
        }
        if areas.len() > 1 {
            out.push(ConflictGroup {
                time: time.to_string(),
                learners: group,
                areas,
            });
        }
    }
    out
}

fn active_learners(conn: &Connection, route_id: &str) -> rusqlite::Result<Vec<LearnerRow>> {
    let sql = format!(
        "SELECT {} FROM learners WHERE route_id = ? AND active = 1 ORDER BY pickup_time",
        db::LEARNER_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([route_id], db::map_learner)?
        .collect::<Result<Vec<_>, _>>();
    rows
}

/// Single warning sentence listing each conflicting learner as
/// `name (area)`. Empty input yields an empty string.
pub fn conflict_message(conflicts: &[LearnerRow]) -> String {
    if conflicts.is_empty() {
        return String::new();
    }
    let list = conflicts
        .iter()
        .map(|l| format!("{} ({})", l.name, l.pickup_area))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "The following learner(s) have the same pickup time in different areas: {}. \
         This may cause scheduling conflicts.",
        list
    )
}

/// Monotonic guard against superseded in-flight checks. A caller tags each
/// check with a climbing generation number; results carrying a generation
/// older than the newest one observed are stale and must not overwrite
/// newer state.
#[derive(Debug, Default)]
pub struct GenerationGate {
    latest: u64,
}

impl GenerationGate {
    /// Returns true when `generation` is current (ties included), false when
    /// a newer generation has already been observed.
    pub fn observe(&mut self, generation: u64) -> bool {
        if generation >= self.latest {
            self.latest = generation;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        crate::db::create_schema(&conn).expect("create schema");
        conn
    }

    fn seed_route(conn: &Connection, id: &str) {
        conn.execute(
            "INSERT INTO routes(id, name, vehicle_no, areas, term, year, status)
             VALUES(?, 'Route A', 'KBX 123', '[]', 'Term 1', 2026, 'active')",
            [id],
        )
        .expect("insert route");
    }

    fn seed_learner(conn: &Connection, id: &str, route: &str, time: &str, area: &str, active: bool) {
        conn.execute(
            "INSERT INTO learners(id, route_id, admission_no, name, class, pickup_area,
                 pickup_time, father_phone, mother_phone, active)
             VALUES(?, ?, ?, ?, 'Grade 1', ?, ?, '+254712345678', '+254723456789', ?)",
            (
                id,
                route,
                format!("ADM-{}", id),
                format!("Learner {}", id),
                area,
                time,
                active as i64,
            ),
        )
        .expect("insert learner");
    }

    #[test]
    fn pickup_time_strict_parse() {
        assert_eq!(PickupTime::parse("07:30").map(|t| t.minute_of_day()), Some(450));
        assert_eq!(PickupTime::parse("00:00").map(|t| t.minute_of_day()), Some(0));
        assert_eq!(PickupTime::parse("23:59").map(|t| t.minute_of_day()), Some(1439));
        assert!(PickupTime::parse("7:30").is_none());
        assert!(PickupTime::parse("24:00").is_none());
        assert!(PickupTime::parse("12:60").is_none());
        assert!(PickupTime::parse("12-30").is_none());
        assert!(PickupTime::parse("").is_none());
    }

    #[test]
    fn pickup_time_canonical_display() {
        let t = PickupTime::parse("07:05").unwrap();
        assert_eq!(t.to_string(), "07:05");
    }

    #[test]
    fn no_conflict_when_same_area() {
        let conn = test_conn();
        seed_route(&conn, "r1");
        seed_learner(&conn, "a", "r1", "07:30", "Westlands", true);

        let time = PickupTime::parse("07:30").unwrap();
        let check = check_conflicts(&conn, "r1", time, "Westlands", None, ConflictPolicy::FailOpen);
        assert!(!check.has_conflict);
        assert!(check.conflicts.is_empty());
        assert!(!check.degraded);
    }

    #[test]
    fn conflict_when_same_time_different_area() {
        let conn = test_conn();
        seed_route(&conn, "r1");
        seed_learner(&conn, "a", "r1", "07:30", "Westlands", true);
        seed_learner(&conn, "b", "r1", "07:30", "Kilimani", true);

        let time = PickupTime::parse("07:30").unwrap();
        let check = check_conflicts(&conn, "r1", time, "Westlands", None, ConflictPolicy::FailOpen);
        assert!(check.has_conflict);
        assert_eq!(check.conflicts.len(), 1);
        assert_eq!(check.conflicts[0].id, "b");
    }

    #[test]
    fn adjacent_minutes_never_conflict() {
        let conn = test_conn();
        seed_route(&conn, "r1");
        seed_learner(&conn, "a", "r1", "07:29", "Kilimani", true);

        let time = PickupTime::parse("07:30").unwrap();
        let check = check_conflicts(&conn, "r1", time, "Westlands", None, ConflictPolicy::FailOpen);
        assert!(!check.has_conflict);
    }

    #[test]
    fn edit_excludes_own_record() {
        let conn = test_conn();
        seed_route(&conn, "r1");
        seed_learner(&conn, "a", "r1", "07:30", "Westlands", true);

        // Editing learner a itself: its stored row differs in area from the
        // proposed value but must not count as a conflict.
        let time = PickupTime::parse("07:30").unwrap();
        let check = check_conflicts(&conn, "r1", time, "Kilimani", Some("a"), ConflictPolicy::FailOpen);
        assert!(!check.has_conflict);
    }

    #[test]
    fn inactive_learners_are_ignored() {
        let conn = test_conn();
        seed_route(&conn, "r1");
        seed_learner(&conn, "a", "r1", "07:30", "Westlands", true);
        seed_learner(&conn, "b", "r1", "07:30", "Kilimani", false);

        let time = PickupTime::parse("07:30").unwrap();
        let check = check_conflicts(&conn, "r1", time, "Westlands", None, ConflictPolicy::FailOpen);
        assert!(!check.has_conflict);
    }

    #[test]
    fn other_routes_do_not_interfere() {
        let conn = test_conn();
        seed_route(&conn, "r1");
        seed_route(&conn, "r2");
        seed_learner(&conn, "a", "r2", "07:30", "Kilimani", true);

        let time = PickupTime::parse("07:30").unwrap();
        let check = check_conflicts(&conn, "r1", time, "Westlands", None, ConflictPolicy::FailOpen);
        assert!(!check.has_conflict);
    }

    #[test]
    fn storage_failure_fail_open() {
        let conn = test_conn();
        conn.execute("DROP TABLE learners", []).unwrap();

        let time = PickupTime::parse("07:30").unwrap();
        let check = check_conflicts(&conn, "r1", time, "Westlands", None, ConflictPolicy::FailOpen);
        assert!(!check.has_conflict);
        assert!(check.conflicts.is_empty());
        assert!(check.degraded);
    }

    #[test]
    fn storage_failure_fail_closed() {
        let conn = test_conn();
        conn.execute("DROP TABLE learners", []).unwrap();

        let time = PickupTime::parse("07:30").unwrap();
        let check = check_conflicts(&conn, "r1", time, "Westlands", None, ConflictPolicy::FailClosed);
        assert!(check.has_conflict);
        assert!(check.conflicts.is_empty());
        assert!(check.degraded);
    }

    #[test]
    fn route_report_one_record_per_conflicted_time() {
        let conn = test_conn();
        seed_route(&conn, "r1");
        seed_learner(&conn, "a", "r1", "07:30", "Westlands", true);
        seed_learner(&conn, "b", "r1", "07:30", "Kilimani", true);
        seed_learner(&conn, "c", "r1", "07:30", "Kilimani", true);
        seed_learner(&conn, "d", "r1", "08:00", "Lavington", true);
        seed_learner(&conn, "e", "r1", "08:00", "Lavington", true);
        seed_learner(&conn, "f", "r1", "08:15", "Parklands", true);

        let report = route_conflicts(&conn, "r1");
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].time, "07:30");
        assert_eq!(report[0].learners.len(), 3);
        assert_eq!(report[0].areas, vec!["Westlands", "Kilimani"]);
    }

    #[test]
    fn route_report_ordered_by_minute() {
        let conn = test_conn();
        seed_route(&conn, "r1");
        seed_learner(&conn, "a", "r1", "13:00", "Westlands", true);
        seed_learner(&conn, "b", "r1", "13:00", "Kilimani", true);
        seed_learner(&conn, "c", "r1", "06:45", "Lavington", true);
        seed_learner(&conn, "d", "r1", "06:45", "Parklands", true);

        let report = route_conflicts(&conn, "r1");
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].time, "06:45");
        assert_eq!(report[1].time, "13:00");
    }

    #[test]
    fn route_report_storage_failure_is_empty() {
        let conn = test_conn();
        conn.execute("DROP TABLE learners", []).unwrap();
        assert!(route_conflicts(&conn, "r1").is_empty());
    }

    #[test]
    fn conflict_message_formatting() {
        let conn = test_conn();
        seed_route(&conn, "r1");
        seed_learner(&conn, "a", "r1", "07:30", "Westlands", true);
        seed_learner(&conn, "b", "r1", "07:30", "Kilimani", true);

        let time = PickupTime::parse("07:30").unwrap();
        let check = check_conflicts(&conn, "r1", time, "Lavington", None, ConflictPolicy::FailOpen);
        let msg = conflict_message(&check.conflicts);
        assert!(msg.contains("Learner a (Westlands)"));
        assert!(msg.contains("Learner b (Kilimani)"));
        assert!(msg.ends_with("This may cause scheduling conflicts."));

        assert_eq!(conflict_message(&[]), "");
    }

    #[test]
    fn generation_gate_rejects_stale() {
        let mut gate = GenerationGate::default();
        assert!(gate.observe(1));
        assert!(gate.observe(3));
        assert!(!gate.observe(2));
        assert!(gate.observe(3));
        assert!(gate.observe(4));
    }
}
