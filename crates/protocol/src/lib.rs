//! Client wire protocol: the `req` / `res` / `event` frame envelopes spoken
//! over every client channel (WebSocket, adapters).
//!
//! This crate is the **single source of truth** for the frame shapes. Both
//! the gateway and any Rust client depend on it and never build protocol
//! JSON by hand — they only serialize/deserialize these types.

use serde::{Deserialize, Serialize};

use ab_domain::event::{EventKind, EventRecord};

/// Current protocol version. Sent in the `connect` handshake; the gateway
/// rejects anything else with a response and closes the connection.
pub const PROTOCOL_VERSION: u32 = 2;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every frame on a client channel deserializes into one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client → gateway: an RPC request.
    #[serde(rename = "req")]
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },

    /// Gateway → client: the response to a request, matched by `id`.
    #[serde(rename = "res")]
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Gateway → client: an unsolicited event from a run on this channel.
    #[serde(rename = "event")]
    Event {
        event: String,
        payload: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl Frame {
    pub fn res_ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Res {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn res_err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Res {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error.into()),
        }
    }

    /// Wrap a canonical log record as an outbound event frame. The payload
    /// carries the record fields minus the tag (which becomes `event`).
    pub fn from_record(rec: &EventRecord) -> Self {
        let mut payload = serde_json::to_value(&rec.event).unwrap_or_default();
        if let Some(obj) = payload.as_object_mut() {
            obj.remove("event");
            obj.insert("runId".into(), serde_json::Value::String(rec.run_id.clone()));
            obj.insert(
                "ts".into(),
                serde_json::Value::String(rec.ts.to_rfc3339()),
            );
        }
        Self::Event {
            event: rec.event.name().to_string(),
            payload,
            seq: Some(rec.seq),
        }
    }

    /// A synthetic event frame not backed by a log record (command replies).
    pub fn synthetic_event(kind: &EventKind, run_id: &str) -> Self {
        let mut payload = serde_json::to_value(kind).unwrap_or_default();
        if let Some(obj) = payload.as_object_mut() {
            obj.remove("event");
            obj.insert("runId".into(), serde_json::Value::String(run_id.into()));
        }
        Self::Event {
            event: kind.name().to_string(),
            payload,
            seq: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Methods
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every recognized request method. Anything else gets `ok = false`.
pub mod method {
    pub const CONNECT: &str = "connect";
    pub const AGENT: &str = "agent";
    pub const RUN_STOP: &str = "run.stop";
    pub const PERMISSION_RESPOND: &str = "permission.respond";
    pub const MEMORY_SEARCH: &str = "memory.search";
    pub const MEMORY_LIST: &str = "memory.list";
    pub const MEMORY_DELETE: &str = "memory.delete";
    pub const MEMORY_PIN: &str = "memory.pin";
    pub const SCHEDULES_LIST: &str = "schedules.list";
    pub const SCHEDULES_CREATE: &str = "schedules.create";
    pub const SCHEDULES_UPDATE: &str = "schedules.update";
    pub const SCHEDULES_DELETE: &str = "schedules.delete";
    pub const WORKERS_LIST: &str = "workers.list";
    pub const STATUS: &str = "status";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake params
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Params of the mandatory first `connect` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    pub version: u32,
    #[serde(rename = "clientType", default = "default_client_type")]
    pub client_type: String,
    #[serde(rename = "deviceId", default = "default_device_id")]
    pub device_id: String,
    /// Last event seq this client observed; the gateway replays newer events
    /// for this channel's runs (bounded window).
    #[serde(rename = "lastSeq", default, skip_serializing_if = "Option::is_none")]
    pub last_seq: Option<u64>,
}

fn default_client_type() -> String {
    "unknown".into()
}
fn default_device_id() -> String {
    "unknown".into()
}

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAck {
    #[serde(rename = "gatewayVersion")]
    pub gateway_version: String,
    #[serde(rename = "protocolVersion")]
    pub protocol_version: u32,
    #[serde(rename = "supportedMethods")]
    pub supported_methods: Vec<String>,
}

impl ConnectAck {
    pub fn new(gateway_version: impl Into<String>) -> Self {
        Self {
            gateway_version: gateway_version.into(),
            protocol_version: PROTOCOL_VERSION,
            supported_methods: vec![
                method::AGENT.into(),
                method::RUN_STOP.into(),
                method::PERMISSION_RESPOND.into(),
                method::MEMORY_SEARCH.into(),
                method::MEMORY_LIST.into(),
                method::MEMORY_DELETE.into(),
                method::MEMORY_PIN.into(),
                method::SCHEDULES_LIST.into(),
                method::SCHEDULES_CREATE.into(),
                method::SCHEDULES_UPDATE.into(),
                method::SCHEDULES_DELETE.into(),
                method::WORKERS_LIST.into(),
                method::STATUS.into(),
            ],
        }
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use ab_domain::event::{EventKind, RunState};
    use serde_json::json;

    // ── Golden serialization tests ─────────────────────────────────
    // These lock the exact JSON shape so accidental renames, missing
    // fields, or tag changes cause immediate test failures.

    #[test]
    fn golden_req() {
        let f = Frame::Req {
            id: "1".into(),
            method: method::AGENT.into(),
            params: json!({"message": "hello"}),
        };
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["type"], "req");
        assert_eq!(v["id"], "1");
        assert_eq!(v["method"], "agent");
        assert_eq!(v["params"]["message"], "hello");

        let rt: Frame = serde_json::from_value(v).unwrap();
        assert!(matches!(rt, Frame::Req { .. }));
    }

    #[test]
    fn golden_res_ok() {
        let f = Frame::res_ok("7", json!({"runId": "run_ab"}));
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["type"], "res");
        assert_eq!(v["ok"], true);
        assert_eq!(v["payload"]["runId"], "run_ab");
        assert!(v.get("error").is_none());
    }

    #[test]
    fn golden_res_err() {
        let f = Frame::res_err("9", "queue_full");
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"], "queue_full");
        assert!(v.get("payload").is_none());
    }

    #[test]
    fn golden_event_frame() {
        let f = Frame::Event {
            event: "token".into(),
            payload: json!({"runId": "run_x", "text": "hi"}),
            seq: Some(41),
        };
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["type"], "event");
        assert_eq!(v["event"], "token");
        assert_eq!(v["seq"], 41);
    }

    #[test]
    fn req_without_params_defaults_to_null() {
        let raw = json!({"type": "req", "id": "1", "method": "status"});
        let f: Frame = serde_json::from_value(raw).unwrap();
        match f {
            Frame::Req { params, .. } => assert!(params.is_null()),
            other => panic!("expected Req, got {other:?}"),
        }
    }

    #[test]
    fn from_record_moves_tag_to_event_field() {
        let rec = EventRecord {
            seq: 3,
            ts: chrono::Utc::now(),
            run_id: "run_q".into(),
            event: EventKind::RunStatus {
                status: RunState::Running,
            },
        };
        let f = Frame::from_record(&rec);
        let v = serde_json::to_value(&f).unwrap();
        assert_eq!(v["event"], "run.status");
        assert_eq!(v["seq"], 3);
        assert_eq!(v["payload"]["runId"], "run_q");
        assert_eq!(v["payload"]["status"], "running");
        // The tag must not be duplicated inside the payload.
        assert!(v["payload"].get("event").is_none());
    }

    #[test]
    fn connect_params_defaults() {
        let p: ConnectParams = serde_json::from_value(json!({"version": 2})).unwrap();
        assert_eq!(p.version, 2);
        assert_eq!(p.client_type, "unknown");
        assert_eq!(p.device_id, "unknown");
        assert!(p.last_seq.is_none());
    }

    #[test]
    fn connect_ack_lists_every_method() {
        let ack = ConnectAck::new("0.3.0");
        assert_eq!(ack.protocol_version, PROTOCOL_VERSION);
        for m in [
            method::AGENT,
            method::RUN_STOP,
            method::PERMISSION_RESPOND,
            method::STATUS,
        ] {
            assert!(ack.supported_methods.iter().any(|s| s == m), "missing {m}");
        }
    }

    #[test]
    fn malformed_frame_is_an_error() {
        let raw = json!({"type": "bogus", "id": "1"});
        assert!(serde_json::from_value::<Frame>(raw).is_err());
    }
}
