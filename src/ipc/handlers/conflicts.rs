use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, ConflictPolicy, PickupTime};
use rusqlite::Connection;
use serde_json::json;

const POLICY_SETTING: &str = "conflicts.defaultPolicy";

/// Deployment-wide degradation policy, settable via `settings.set`.
/// Falls back to fail-open, the lenient historical behavior.
pub fn default_policy(conn: &Connection) -> ConflictPolicy {
    db::settings_get_json(conn, POLICY_SETTING)
        .ok()
        .flatten()
        .and_then(|v| v.as_str().and_then(ConflictPolicy::parse))
        .unwrap_or_default()
}

fn parse_policy(
    conn: &Connection,
    req: &Request,
) -> Result<ConflictPolicy, serde_json::Value> {
    match optional_str(req, "policy") {
        None => Ok(default_policy(conn)),
        Some(raw) => ConflictPolicy::parse(&raw).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                "policy must be one of: failOpen, failClosed",
                Some(json!({ "policy": raw })),
            )
        }),
    }
}

fn handle_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    // Observe the generation before anything can fail so that a newer check
    // always supersedes older in-flight ones, even ones that error out.
    let generation = req.params.get("generation").and_then(|v| v.as_u64());
    let stale = match generation {
        Some(g) => !state.conflict_gate.observe(g),
        None => false,
    };

    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let pickup_time = match required_str(req, "pickupTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(time) = PickupTime::parse(&pickup_time) else {
        return err(
            &req.id,
            "bad_params",
            "pickupTime must be zero-padded 24-hour HH:MM",
            Some(json!({ "pickupTime": pickup_time })),
        );
    };
    let pickup_area = match required_str(req, "pickupArea") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exclude = optional_str(req, "excludeLearnerId");
    let policy = match parse_policy(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let check = schedule::check_conflicts(
        conn,
        &route_id,
        time,
        &pickup_area,
        exclude.as_deref(),
        policy,
    );
    let message = schedule::conflict_message(&check.conflicts);

    ok(
        &req.id,
        json!({
            "hasConflict": check.has_conflict,
            "conflicts": check.conflicts,
            "degraded": check.degraded,
            "stale": stale,
            "message": message,
            "policy": policy.as_str(),
        }),
    )
}

fn handle_for_route(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let route_id = match required_str(req, "routeId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let groups = schedule::route_conflicts(conn, &route_id);
    let conflicts = groups
        .iter()
        .map(|g| {
            json!({
                "time": g.time,
                "learners": g.learners,
                "areas": g.areas,
                "message": schedule::conflict_message(&g.learners),
            })
        })
        .collect::<Vec<_>>();

    ok(&req.id, json!({ "conflicts": conflicts }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "conflicts.check" => Some(handle_check(state, req)),
        "conflicts.forRoute" => Some(handle_for_route(state, req)),
        _ => None,
    }
}
