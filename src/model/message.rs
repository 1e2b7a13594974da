//! Control messages exchanged over the signaling link
//!
//! One JSON object per message. The recognized fields are independent and may
//! be combined, although a message usually serves a single purpose. Fields the
//! engine does not interpret (handshake metadata, status payloads) are kept in
//! [`ControlMessage::payload`] and passed through untouched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{Error, Result};

/// Application status payload, e.g. `{"nmea": "$GPRMC,..."}`.
pub type Status = Map<String, Value>;

/// One or many server URLs, as browsers accept both shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IceUrls {
    One(String),
    Many(Vec<String>),
}

impl IceUrls {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let urls = match self {
            IceUrls::One(url) => std::slice::from_ref(url),
            IceUrls::Many(urls) => urls.as_slice(),
        };
        urls.iter().map(String::as_str)
    }
}

/// Reachability server descriptor (STUN/TURN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: IceUrls,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// A single reachability candidate in its browser JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer describing one side's transport parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Application-level request sent by the monitoring party.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
    pub conning: Option<Value>,
    pub ice_servers: Option<Vec<IceServer>>,
    pub other: Map<String, Value>,
}

impl Request {
    /// Interprets a `request` field. Anything but an object is rejected; an
    /// unusable `iceServers` entry is dropped and the rest kept.
    pub fn from_value(value: &Value) -> Result<Request> {
        let Value::Object(fields) = value else {
            return Err(Error::InvalidRequest(value.to_string()));
        };
        let mut other = fields.clone();
        let conning = other.remove("conning");
        let ice_servers = other
            .remove("iceServers")
            .and_then(|servers| field("request.iceServers", servers));
        Ok(Request {
            conning,
            ice_servers,
            other,
        })
    }
}

/// The wire unit of the signaling link.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControlMessage {
    #[serde(rename = "iceServers", skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Vec<IceServer>>,
    /// `Some(None)` is an explicit `null`, the end-of-candidates marker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice: Option<Option<IceCandidate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    /// Kept raw; see [`Request::from_value`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hangup: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bye: Option<Value>,
    /// Set locally when an inbound payload failed to parse. Never sent.
    #[serde(skip)]
    pub error: Option<String>,
    /// The raw text of a payload that failed to parse.
    #[serde(skip)]
    pub raw: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Decodes one recognized field, dropping it when it has the wrong shape.
fn field<T: DeserializeOwned>(name: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!(field = name, "dropping malformed field: {}", e);
            None
        }
    }
}

/// JavaScript truthiness, used for the `hangup`/`bye` flags.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl ControlMessage {
    pub fn ice(candidate: Option<IceCandidate>) -> Self {
        Self {
            ice: Some(candidate),
            ..Default::default()
        }
    }

    pub fn sdp(description: SessionDescription) -> Self {
        Self {
            sdp: Some(description),
            ..Default::default()
        }
    }

    pub fn hangup() -> Self {
        Self {
            hangup: Some(Value::Bool(true)),
            ..Default::default()
        }
    }

    pub fn bye() -> Self {
        Self {
            bye: Some(Value::Bool(true)),
            ..Default::default()
        }
    }

    /// A bare status report, the status fields at the top level.
    pub fn status(status: &Status) -> Self {
        Self {
            payload: status.clone(),
            ..Default::default()
        }
    }

    /// The first message a vessel sends once the link is open.
    pub fn handshake(capabilities: Value, guidance: &str, status: &Status) -> Self {
        let mut payload = Map::new();
        payload.insert("capabilities".to_string(), capabilities);
        payload.insert("guidance".to_string(), Value::String(guidance.to_string()));
        for (key, value) in status {
            payload.insert(key.clone(), value.clone());
        }
        Self {
            payload,
            ..Default::default()
        }
    }

    /// Synthetic record standing in for an inbound payload that failed to parse.
    pub fn malformed(raw: impl Into<String>) -> Self {
        Self {
            error: Some("Received invalid message".to_string()),
            raw: Some(raw.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The session-end payload, from `hangup` or its legacy alias `bye`.
    pub fn hangup_signal(&self) -> Option<&Value> {
        self.hangup
            .as_ref()
            .filter(|v| truthy(v))
            .or_else(|| self.bye.as_ref().filter(|v| truthy(v)))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses one inbound payload. Never fails: text that is not a JSON
    /// object yields a [`ControlMessage::malformed`] record. Recognized fields
    /// are decoded one by one, so a bad field does not cost its siblings.
    pub fn decode(text: &str) -> ControlMessage {
        let mut fields = match serde_json::from_str(text) {
            Ok(Value::Object(fields)) => fields,
            _ => return ControlMessage::malformed(text),
        };
        let ice = fields.remove("ice").and_then(|ice| match ice {
            Value::Null => Some(None),
            candidate => field("ice", candidate).map(Some),
        });
        ControlMessage {
            ice_servers: fields
                .remove("iceServers")
                .and_then(|servers| field("iceServers", servers)),
            ice,
            sdp: fields.remove("sdp").and_then(|sdp| field("sdp", sdp)),
            request: fields.remove("request"),
            hangup: fields.remove("hangup"),
            bye: fields.remove("bye"),
            error: None,
            raw: None,
            payload: fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(msg: &ControlMessage) -> ControlMessage {
        ControlMessage::decode(&msg.encode().unwrap())
    }

    #[test]
    fn recognized_fields_survive_round_trip() {
        let server = IceServer {
            urls: IceUrls::Many(vec![
                "stun:stun.example.org:3478".to_string(),
                "turn:turn.example.org".to_string(),
            ]),
            username: Some("vessel".to_string()),
            credential: Some("secret".to_string()),
        };
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };
        let request = json!({
            "conning": "nmea",
            "iceServers": [{"urls": "stun:stun.example.org"}],
        });

        let messages = vec![
            ControlMessage {
                ice_servers: Some(vec![server.clone()]),
                ..Default::default()
            },
            ControlMessage::ice(Some(candidate.clone())),
            ControlMessage::ice(None),
            ControlMessage::sdp(SessionDescription::offer("v=0\r\n")),
            ControlMessage::sdp(SessionDescription::answer("v=0\r\n")),
            ControlMessage {
                request: Some(request),
                ..Default::default()
            },
            ControlMessage::hangup(),
            ControlMessage::bye(),
            ControlMessage {
                ice_servers: Some(vec![server]),
                ice: Some(Some(candidate)),
                hangup: Some(json!("done")),
                ..Default::default()
            },
        ];

        for msg in messages {
            assert_eq!(round_trip(&msg), msg);
        }
    }

    #[test]
    fn null_ice_is_distinct_from_absent_ice() {
        let end = ControlMessage::decode(r#"{"ice":null}"#);
        assert_eq!(end.ice, Some(None));
        assert_eq!(end.encode().unwrap(), r#"{"ice":null}"#);

        let absent = ControlMessage::decode(r#"{"hangup":true}"#);
        assert_eq!(absent.ice, None);
    }

    #[test]
    fn malformed_payload_yields_error_record() {
        for raw in ["{not json", "42", "[1]", r#""hangup""#] {
            let msg = ControlMessage::decode(raw);
            assert!(msg.is_error(), "{raw} should be reported as malformed");
            assert_eq!(msg.raw.as_deref(), Some(raw));
        }
    }

    #[test]
    fn error_record_is_never_serialized() {
        let msg = ControlMessage::malformed("garbage");
        assert_eq!(msg.encode().unwrap(), "{}");
    }

    #[test]
    fn handshake_merges_status_fields() {
        let mut status = Status::new();
        status.insert("nmea".to_string(), json!("$HEHDT,244.8,T*25"));
        let msg = ControlMessage::handshake(
            json!({"conning": {"formats": ["nmea"]}}),
            "recommendation",
            &status,
        );
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "capabilities": {"conning": {"formats": ["nmea"]}},
                "guidance": "recommendation",
                "nmea": "$HEHDT,244.8,T*25",
            })
        );
    }

    #[test]
    fn hangup_signal_follows_truthiness() {
        assert!(ControlMessage::decode(r#"{"hangup":true}"#).hangup_signal().is_some());
        assert!(ControlMessage::decode(r#"{"bye":1}"#).hangup_signal().is_some());
        assert!(ControlMessage::decode(r#"{"hangup":"operator left"}"#)
            .hangup_signal()
            .is_some());
        assert!(ControlMessage::decode(r#"{"hangup":false}"#).hangup_signal().is_none());
        assert!(ControlMessage::decode(r#"{"hangup":""}"#).hangup_signal().is_none());
        assert!(ControlMessage::decode(r#"{"nmea":"x"}"#).hangup_signal().is_none());
    }

    #[test]
    fn single_url_ice_server_is_accepted() {
        let msg = ControlMessage::decode(r#"{"iceServers":[{"urls":"stun:stun.example.org"}]}"#);
        let servers = msg.ice_servers.unwrap();
        assert_eq!(
            servers[0].urls.iter().collect::<Vec<_>>(),
            vec!["stun:stun.example.org"]
        );
    }

    #[test]
    fn unusable_field_is_dropped_and_siblings_kept() {
        let msg = ControlMessage::decode(r#"{"hangup":true,"sdp":{"type":"pranswer","sdp":""}}"#);
        assert!(!msg.is_error());
        assert_eq!(msg.sdp, None);
        assert!(msg.hangup_signal().is_some());

        let msg = ControlMessage::decode(r#"{"request":{"conning":"nmea"},"ice":{"sdpMid":"0"}}"#);
        assert!(!msg.is_error());
        assert_eq!(msg.ice, None);
        assert_eq!(msg.request, Some(json!({"conning": "nmea"})));

        let msg = ControlMessage::decode(r#"{"iceServers":"stun:x","nmea":"$GPRMC"}"#);
        assert_eq!(msg.ice_servers, None);
        assert_eq!(msg.payload.get("nmea"), Some(&json!("$GPRMC")));
    }

    #[test]
    fn request_must_be_an_object() {
        for shape in [json!("radar"), json!(42), json!(["conning"]), Value::Null] {
            assert!(
                matches!(Request::from_value(&shape), Err(Error::InvalidRequest(_))),
                "{shape}"
            );
        }

        let request =
            Request::from_value(&json!({"conning": "nmea", "iceServers": "stun:x", "radar": true}))
                .unwrap();
        assert_eq!(request.conning, Some(json!("nmea")));
        assert_eq!(request.ice_servers, None);
        assert_eq!(request.other.get("radar"), Some(&json!(true)));
    }
}
