//! Push channel wire format.
//!
//! Messages are JSON objects distinguished by a `type` field:
//!
//! ```json
//! {"type": "location_update", "driver_id": "A1", "lat": 41.0, "lng": 29.0,
//!  "speed": 42.5, "status": "on_trip", "timestamp": 1718000000000}
//! {"type": "driver_status", "driver_id": "A1", "status": "at_home"}
//! ```
//!
//! The payload may also be wrapped as `{"type": ..., "data": {...}}`.
//! Timestamps are epoch milliseconds or RFC 3339 strings.
//!
//! Anything that fails to decode, or a location update with unusable
//! coordinates, yields `None`. A bad message is never a transport fault.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::{AgentPosition, AgentStatus, FleetError, PositionSource, Result};

/// A typed event from the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Full position report. `source` is always [`PositionSource::Push`].
    LocationUpdate(AgentPosition),
    /// Status-only change for an agent the store may already know.
    StatusChange {
        agent_id: String,
        status: AgentStatus,
        observed_at: Option<i64>,
    },
}

impl PushEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            PushEvent::LocationUpdate(position) => &position.agent_id,
            PushEvent::StatusChange { agent_id, .. } => agent_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    LocationUpdate(WireLocation),
    DriverStatus(WireStatus),
    Ping,
    Pong,
}

#[derive(Debug, Deserialize)]
struct WireLocation {
    #[serde(alias = "driver_id", alias = "id")]
    agent_id: WireId,
    #[serde(default, alias = "name", alias = "driver_name")]
    display_name: Option<String>,
    #[serde(alias = "lat")]
    latitude: f64,
    #[serde(alias = "lng", alias = "lon")]
    longitude: f64,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    status: Option<AgentStatus>,
    #[serde(default, alias = "timestamp")]
    observed_at: Option<WireTimestamp>,
    #[serde(default, alias = "province")]
    region_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStatus {
    #[serde(alias = "driver_id", alias = "id")]
    agent_id: WireId,
    status: AgentStatus,
    #[serde(default, alias = "timestamp")]
    observed_at: Option<WireTimestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(i64),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            WireId::Text(s) => s,
            WireId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Millis(i64),
    Fractional(f64),
    Text(String),
}

impl WireTimestamp {
    fn to_millis(&self) -> Option<i64> {
        match self {
            WireTimestamp::Millis(ms) => Some(*ms),
            WireTimestamp::Fractional(ms) if ms.is_finite() => Some(ms.round() as i64),
            WireTimestamp::Fractional(_) => None,
            WireTimestamp::Text(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp_millis())
                .ok()
                .or_else(|| s.trim().parse::<i64>().ok()),
        }
    }
}

impl WireLocation {
    fn into_position(self, received_at: i64, source: PositionSource) -> Option<AgentPosition> {
        let observed_at = match &self.observed_at {
            Some(ts) => ts.to_millis()?,
            None => received_at,
        };
        Some(AgentPosition {
            agent_id: self.agent_id.into_string(),
            display_name: self.display_name.unwrap_or_default(),
            latitude: self.latitude,
            longitude: self.longitude,
            speed: self.speed.unwrap_or(0.0),
            status: self.status.unwrap_or_default(),
            region_hint: self.region_hint,
            observed_at,
            source,
        })
    }
}

/// Decode one text frame, stamping reports that carry no timestamp with
/// the current time.
pub fn decode_message(text: &str) -> Option<PushEvent> {
    decode_message_at(text, Utc::now().timestamp_millis())
}

/// Decode one text frame; `received_at` is used when the report has no
/// timestamp of its own.
pub fn decode_message_at(text: &str, received_at: i64) -> Option<PushEvent> {
    let mut value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("[Protocol] Dropping undecodable frame: {}", e);
            return None;
        }
    };
    unwrap_envelope(&mut value);

    let message: WireMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(e) => {
            debug!("[Protocol] Dropping unrecognised message: {}", e);
            return None;
        }
    };

    match message {
        WireMessage::LocationUpdate(loc) => {
            let position = loc.into_position(received_at, PositionSource::Push)?;
            if !position.has_valid_coordinates() {
                debug!(
                    "[Protocol] Dropping location_update for {} with invalid coordinates ({}, {})",
                    position.agent_id, position.latitude, position.longitude
                );
                return None;
            }
            Some(PushEvent::LocationUpdate(position))
        }
        WireMessage::DriverStatus(st) => {
            let observed_at = match &st.observed_at {
                Some(ts) => Some(ts.to_millis()?),
                None => None,
            };
            Some(PushEvent::StatusChange {
                agent_id: st.agent_id.into_string(),
                status: st.status,
                observed_at,
            })
        }
        WireMessage::Ping | WireMessage::Pong => None,
    }
}

/// Decode a poll response body: a JSON array of position rows, or an object
/// wrapping that array under `data`, `drivers` or `positions`. Rows use the
/// same field names as `location_update` messages.
///
/// Rows that fail to decode are skipped. Rows with invalid coordinates are
/// kept so the store can count them as rejected.
pub fn decode_poll_body(text: &str, received_at: i64) -> Result<Vec<AgentPosition>> {
    let value: Value = serde_json::from_str(text)?;
    let rows = match value {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match ["data", "drivers", "positions"]
            .iter()
            .find_map(|k| match obj.remove(*k) {
                Some(Value::Array(rows)) => Some(rows),
                _ => None,
            }) {
            Some(rows) => rows,
            None => return Err(FleetError::Decode("poll body has no position array".to_string())),
        },
        other => {
            return Err(FleetError::Decode(format!("unexpected poll body: {}", json_kind(&other))));
        }
    };

    let total = rows.len();
    let positions: Vec<AgentPosition> = rows
        .into_iter()
        .filter_map(|row| match serde_json::from_value::<WireLocation>(row) {
            Ok(loc) => loc.into_position(received_at, PositionSource::Poll),
            Err(e) => {
                debug!("[Protocol] Skipping poll row: {}", e);
                None
            }
        })
        .collect();

    if positions.len() < total {
        debug!("[Protocol] Poll body: {}/{} rows decoded", positions.len(), total);
    }
    Ok(positions)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Lift `{"type": t, "data": {...}}` into `{"type": t, ...}`.
fn unwrap_envelope(value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    if let Some(Value::Object(data)) = obj.remove("data") {
        for (k, v) in data {
            obj.entry(k).or_insert(v);
        }
    }
}

/// The keepalive frame sent every heartbeat interval.
pub fn ping_message() -> String {
    serde_json::json!({ "type": "ping" }).to_string()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_718_000_000_000;

    fn position(event: Option<PushEvent>) -> AgentPosition {
        match event {
            Some(PushEvent::LocationUpdate(p)) => p,
            other => panic!("expected location update, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_flat_location_update() {
        let text = r#"{"type":"location_update","driver_id":"A1","driver_name":"Ayse",
            "lat":41.0,"lng":29.0,"speed":42.5,"status":"on_trip",
            "timestamp":1718000000500,"province":"Istanbul"}"#;
        let p = position(decode_message_at(text, NOW));

        assert_eq!(p.agent_id, "A1");
        assert_eq!(p.display_name, "Ayse");
        assert_eq!(p.latitude, 41.0);
        assert_eq!(p.longitude, 29.0);
        assert_eq!(p.speed, 42.5);
        assert_eq!(p.status, AgentStatus::OnTrip);
        assert_eq!(p.observed_at, 1_718_000_000_500);
        assert_eq!(p.region_hint.as_deref(), Some("Istanbul"));
        assert_eq!(p.source, PositionSource::Push);
    }

    #[test]
    fn test_decode_enveloped_location_update() {
        let text = r#"{"type":"location_update","data":{"agent_id":17,"latitude":41,"longitude":29,
            "observed_at":"2024-06-10T06:13:20Z"}}"#;
        let p = position(decode_message_at(text, NOW));

        assert_eq!(p.agent_id, "17");
        assert_eq!(p.latitude, 41.0);
        assert_eq!(p.observed_at, 1_718_000_000_000);
        assert_eq!(p.status, AgentStatus::Active);
    }

    #[test]
    fn test_missing_timestamp_uses_receive_time() {
        let text = r#"{"type":"location_update","id":"A1","lat":41.0,"lon":29.0}"#;
        assert_eq!(position(decode_message_at(text, NOW)).observed_at, NOW);
    }

    #[test]
    fn test_invalid_coordinates_dropped() {
        let text = r#"{"type":"location_update","driver_id":"A1","latitude":200,"longitude":29.0,"timestamp":1}"#;
        assert!(decode_message_at(text, NOW).is_none());

        let missing = r#"{"type":"location_update","driver_id":"A1","latitude":null,"longitude":29.0}"#;
        assert!(decode_message_at(missing, NOW).is_none());
    }

    #[test]
    fn test_malformed_and_unknown_dropped() {
        assert!(decode_message_at("not json", NOW).is_none());
        assert!(decode_message_at("[1,2,3]", NOW).is_none());
        assert!(decode_message_at(r#"{"type":"trip_started","driver_id":"A1"}"#, NOW).is_none());
        assert!(decode_message_at(r#"{"type":"pong"}"#, NOW).is_none());
        assert!(decode_message_at(r#"{"type":"driver_status","driver_id":"A1","status":"flying"}"#, NOW).is_none());
        assert!(decode_message_at(
            r#"{"type":"location_update","driver_id":"A1","lat":41,"lng":29,"timestamp":"yesterday"}"#,
            NOW
        )
        .is_none());
    }

    #[test]
    fn test_decode_status_change() {
        let text = r#"{"type":"driver_status","driver_id":"A1","status":"at_home"}"#;
        assert_eq!(
            decode_message_at(text, NOW),
            Some(PushEvent::StatusChange {
                agent_id: "A1".to_string(),
                status: AgentStatus::AtHome,
                observed_at: None,
            })
        );

        let stamped = r#"{"type":"driver_status","data":{"driver_id":"A1","status":"inactive","timestamp":5}}"#;
        match decode_message_at(stamped, NOW) {
            Some(PushEvent::StatusChange { observed_at, status, .. }) => {
                assert_eq!(observed_at, Some(5));
                assert_eq!(status, AgentStatus::Inactive);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_poll_body_shapes() {
        let flat = r#"[{"driver_id":"A1","lat":41.0,"lng":29.0,"timestamp":100},
                       {"id":7,"latitude":40.0,"longitude":30.0,"status":"at_home"}]"#;
        let rows = decode_poll_body(flat, NOW).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].observed_at, 100);
        assert_eq!(rows[1].agent_id, "7");
        assert_eq!(rows[1].observed_at, NOW);
        assert_eq!(rows[1].status, AgentStatus::AtHome);
        assert!(rows.iter().all(|p| p.source == PositionSource::Poll));

        let wrapped = r#"{"drivers":[{"driver_id":"A1","lat":41.0,"lng":29.0}]}"#;
        assert_eq!(decode_poll_body(wrapped, NOW).unwrap().len(), 1);
    }

    #[test]
    fn test_decode_poll_body_skips_bad_rows() {
        let body = r#"[{"driver_id":"A1","lat":41.0,"lng":29.0},
                       {"driver_id":"A2"},
                       {"driver_id":"A3","lat":300.0,"lng":29.0}]"#;
        let rows = decode_poll_body(body, NOW).unwrap();
        // The row with no coordinates is skipped; out-of-range coordinates
        // are left for the store to reject.
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].agent_id, "A3");
        assert!(!rows[1].has_valid_coordinates());
    }

    #[test]
    fn test_decode_poll_body_errors() {
        assert!(matches!(decode_poll_body("oops", NOW), Err(FleetError::Decode(_))));
        assert!(matches!(decode_poll_body(r#"{"count":0}"#, NOW), Err(FleetError::Decode(_))));
        assert!(matches!(decode_poll_body("42", NOW), Err(FleetError::Decode(_))));
    }

    #[test]
    fn test_ping_message() {
        let value: Value = serde_json::from_str(&ping_message()).unwrap();
        assert_eq!(value["type"], "ping");
    }
}
