//! The rule engine: a registry of pure functions `(document, last patch) ->
//! additional patches`, run synchronously after every accepted patch and
//! applied in a single bounded second pass so rule-produced patches cannot
//! feed back into themselves.

use relay_types::{Patch, PatchOp};
use serde_json::Value;

pub type Rule = fn(&Value, &Patch) -> Vec<PatchOp>;

pub const RULES: &[Rule] = &[anchor_drag_rule];

const EARTH_RADIUS_M: f64 = 6_371_000.0;

fn haversine_m(a_lat: f64, a_lon: f64, b_lat: f64, b_lon: f64) -> f64 {
    let (lat1, lat2) = (a_lat.to_radians(), b_lat.to_radians());
    let dlat = (b_lat - a_lat).to_radians();
    let dlon = (b_lon - a_lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Whenever the anchor is deployed and the vessel strays beyond
/// `criticalRange`, raise `anchor_dragging` into `alerts.active`; once the
/// distance drops below 90% of `criticalRange`, move it to
/// `alerts.resolved`.
fn anchor_drag_rule(document: &Value, last_patch: &Patch) -> Vec<PatchOp> {
    let touches_relevant_path = last_patch
        .ops
        .iter()
        .any(|op| matches!(op.top_level_group(), "anchor" | "navigation"));
    if !touches_relevant_path {
        return Vec::new();
    }

    let anchor = &document["anchor"];
    let deployed = anchor["deployed"].as_bool().unwrap_or(false);
    if !deployed {
        return Vec::new();
    }
    let (anchor_lat, anchor_lon) = match (anchor["location"]["lat"].as_f64(), anchor["location"]["lon"].as_f64()) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => return Vec::new(),
    };
    let critical_range = anchor["criticalRange"].as_f64().unwrap_or(f64::INFINITY);

    let position = &document["navigation"]["position"];
    let (pos_lat, pos_lon) = match (position["value"]["lat"].as_f64(), position["value"]["lon"].as_f64()) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => return Vec::new(),
    };

    let distance = haversine_m(anchor_lat, anchor_lon, pos_lat, pos_lon);
    let already_active = document["alerts"]["active"]
        .as_array()
        .map(|arr| arr.iter().any(|a| a["trigger"] == "anchor_dragging"))
        .unwrap_or(false);
    let mut ops = Vec::new();

    if distance > critical_range && !already_active {
        ops.push(PatchOp::Add {
            path: "/alerts/active/-".into(),
            value: serde_json::json!({
                "id": format!("anchor-drag-{}", now_ms()),
                "level": "warning",
                "trigger": "anchor_dragging",
                "distanceM": distance,
            }),
        });
    } else if distance < critical_range * 0.9 {
        if let Some(active_index) = document["alerts"]["active"]
            .as_array()
            .and_then(|arr| arr.iter().position(|a| a["trigger"] == "anchor_dragging"))
        {
            let alert = document["alerts"]["active"][active_index].clone();
            ops.push(PatchOp::Remove { path: format!("/alerts/active/{active_index}") });
            ops.push(PatchOp::Add { path: "/alerts/resolved/-".into(), value: alert });
        }
    }

    ops
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with(anchor_lat: f64, anchor_lon: f64, critical_range: f64, pos_lat: f64, pos_lon: f64) -> Value {
        serde_json::json!({
            "anchor": {
                "deployed": true,
                "location": {"lat": anchor_lat, "lon": anchor_lon},
                "criticalRange": critical_range,
            },
            "navigation": {
                "position": {"value": {"lat": pos_lat, "lon": pos_lon}},
            },
            "alerts": {"active": [], "resolved": []},
        })
    }

    #[test]
    fn raises_anchor_drag_alert_beyond_critical_range() {
        let document = doc_with(40.7128, -74.0060, 100.0, 40.7140, -74.0060);
        let patch = Patch::new(vec![PatchOp::Replace { path: "/navigation/position".into(), value: serde_json::json!({}) }]);
        let ops = anchor_drag_rule(&document, &patch);
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            PatchOp::Add { path, value } => {
                assert_eq!(path, "/alerts/active/-");
                assert_eq!(value["trigger"], "anchor_dragging");
            }
            _ => panic!("expected add op"),
        }
    }

    #[test]
    fn no_alert_when_within_range() {
        let document = doc_with(40.7128, -74.0060, 100.0, 40.71285, -74.00605);
        let patch = Patch::new(vec![PatchOp::Replace { path: "/navigation/position".into(), value: serde_json::json!({}) }]);
        assert!(anchor_drag_rule(&document, &patch).is_empty());
    }
}
