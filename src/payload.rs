//! Inner payload decoding.
//!
//! The embedded peer emits two surface syntaxes for the same shapes: HTML
//! microdata (`itemscope`/`itemprop`) and JSON (compact single-letter keys
//! or legacy full keys). Handshake-era payloads try microdata first, then
//! JSON; STREAM data tries JSON first. Every decoder keeps the raw bytes
//! out of band so a failure can be logged verbatim.

use crate::common::Error;

use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};

/// Ownership as asserted in a discovery broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Unclaimed,
    Claimed,
    Owned,
}

impl Ownership {
    fn parse(s: &str) -> Option<Ownership> {
        match s {
            "unclaimed" => Some(Ownership::Unclaimed),
            "claimed" => Some(Ownership::Claimed),
            "owned" => Some(Ownership::Owned),
            _ => None,
        }
    }
}

/// A device presence broadcast (DISCOVERY frame body).
#[derive(Clone, Debug, PartialEq)]
pub struct DevicePresence {
    pub device_id: String,
    pub device_type: Option<String>,
    pub status: Option<String>,
    pub ownership: Option<Ownership>,
    pub capabilities: Vec<String>,
}

/// VC_RESPONSE status as reported by the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckStatus {
    Provisioned,
    AlreadyOwned,
    Revoked,
    OwnershipRevoked,
}

impl AckStatus {
    fn parse(s: &str) -> Option<AckStatus> {
        match s {
            "provisioned" => Some(AckStatus::Provisioned),
            "already_owned" => Some(AckStatus::AlreadyOwned),
            "revoked" => Some(AckStatus::Revoked),
            "ownership_revoked" => Some(AckStatus::OwnershipRevoked),
            _ => None,
        }
    }
}

/// The decoded body of a VC_RESPONSE frame.
#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeAck {
    pub status: AckStatus,
    pub owner: Option<String>,
    pub device_id: Option<String>,
    pub message: Option<String>,
}

/// The decoded body of a VC_INIT frame.
#[derive(Clone, Debug, PartialEq)]
pub struct VcInit {
    /// The presented credential, re-serialized as JSON bytes for the
    /// external verifier.
    pub credential: Vec<u8>,

    /// The subject named inside the credential, handed to the verifier as
    /// the expected subject.
    pub subject: Option<String>,

    /// Client-chosen handshake challenge.
    pub challenge: Option<Vec<u8>>,

    pub timestamp: Option<u64>,
}

/// Heartbeat frame body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Heartbeat {
    pub timestamp: u64,
    pub sequence: u64,
}

/// CONNECTION_CLOSE frame body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Close {
    pub code: u64,
    pub reason: String,
}

/// Extracts `itemprop` name/value pairs from an HTML microdata fragment.
///
/// This is a scanner, not an HTML parser: it looks for `itemprop="name"`,
/// skips to the end of the enclosing tag, and takes the text up to the next
/// `<`. That is exactly the subset the embedded peer emits.
pub fn parse_microdata(input: &str) -> Option<Map<String, Value>> {
    if !input.contains("itemprop") && !input.contains("itemscope") {
        return None;
    }

    let mut props = Map::new();
    let mut rest = input;

    while let Some(pos) = rest.find("itemprop=\"") {
        rest = &rest[pos + "itemprop=\"".len()..];
        let name_end = rest.find('"')?;
        let name = &rest[..name_end];
        rest = &rest[name_end..];

        let tag_end = rest.find('>')?;
        rest = &rest[tag_end + 1..];
        let text_end = rest.find('<').unwrap_or(rest.len());
        let value = rest[..text_end].trim();

        props.insert(name.to_string(), Value::String(value.to_string()));
        rest = &rest[text_end..];
    }

    if props.is_empty() {
        None
    } else {
        Some(props)
    }
}

fn parse_json_object(bytes: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Decodes a handshake-era payload: microdata first, then JSON.
pub fn decode_object(bytes: &[u8]) -> Result<Map<String, Value>, Error> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        if let Some(props) = parse_microdata(text) {
            return Ok(props);
        }
    }

    parse_json_object(bytes).ok_or_else(|| {
        debug!("undecodable payload: {:?}", String::from_utf8_lossy(bytes));
        Error::MalformedFramePayload
    })
}

/// Decodes STREAM data: JSON first, then microdata.
pub fn decode_stream_object(bytes: &[u8]) -> Result<Map<String, Value>, Error> {
    if let Some(map) = parse_json_object(bytes) {
        return Ok(map);
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        if let Some(props) = parse_microdata(text) {
            return Ok(props);
        }
    }

    debug!("undecodable stream payload: {:?}", String::from_utf8_lossy(bytes));
    Err(Error::MalformedFramePayload)
}

/// First string value among the given keys. Compact and legacy JSON name the
/// same field differently, so every accessor goes through a synonym list.
fn get_str<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| map.get(*k).and_then(Value::as_str))
}

fn get_u64(map: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|k| {
        let v = map.get(*k)?;
        v.as_u64().or_else(|| v.as_str()?.parse().ok())
    })
}

impl DevicePresence {
    pub fn from_bytes(bytes: &[u8]) -> Result<DevicePresence, Error> {
        let map = decode_object(bytes)?;

        let device_id = get_str(&map, &["i", "deviceId", "device_id", "id"])
            .ok_or(Error::MalformedFramePayload)?
            .to_string();

        let capabilities = match map.get("c").or_else(|| map.get("capabilities")) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => s.split(',').map(|c| c.trim().to_string()).collect(),
            _ => Vec::new(),
        };

        Ok(DevicePresence {
            device_id,
            device_type: get_str(&map, &["dt", "deviceType", "device_type"])
                .map(str::to_string),
            status: get_str(&map, &["s", "status"]).map(str::to_string),
            ownership: get_str(&map, &["o", "ownership"]).and_then(Ownership::parse),
            capabilities,
        })
    }
}

impl HandshakeAck {
    pub fn from_bytes(bytes: &[u8]) -> Result<HandshakeAck, Error> {
        let map = decode_object(bytes)?;

        let status = get_str(&map, &["status", "s"])
            .and_then(AckStatus::parse)
            .ok_or(Error::MalformedFramePayload)?;

        Ok(HandshakeAck {
            status,
            owner: get_str(&map, &["owner", "o"]).map(str::to_string),
            device_id: get_str(&map, &["device_id", "deviceId", "i"]).map(str::to_string),
            message: get_str(&map, &["message", "m"]).map(str::to_string),
        })
    }
}

impl VcInit {
    pub fn from_bytes(bytes: &[u8]) -> Result<VcInit, Error> {
        let map = decode_object(bytes)?;

        let credential_value = map
            .get("credential")
            .or_else(|| map.get("vc"))
            .ok_or(Error::MalformedFramePayload)?;

        let subject = credential_value
            .get("subject")
            .and_then(Value::as_str)
            .map(str::to_string);

        let challenge = get_str(&map, &["challenge"]).and_then(|s| hex::decode(s).ok());

        Ok(VcInit {
            credential: serde_json::to_vec(credential_value)?,
            subject,
            challenge,
            timestamp: get_u64(&map, &["timestamp", "ts"]),
        })
    }

    /// Builds the JSON body of a VC_INIT frame.
    pub fn to_bytes(credential: &Value, challenge: &[u8], timestamp: u64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "credential": credential,
            "challenge": hex::encode(challenge),
            "timestamp": timestamp,
        }))
        .expect("vc_init body serializes")
    }
}

impl Heartbeat {
    pub fn from_bytes(bytes: &[u8]) -> Result<Heartbeat, Error> {
        let map = decode_object(bytes)?;

        Ok(Heartbeat {
            timestamp: get_u64(&map, &["timestamp", "ts"]).unwrap_or(0),
            sequence: get_u64(&map, &["sequence", "seq"]).unwrap_or(0),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("heartbeat body serializes")
    }
}

impl Close {
    /// Close payloads are JSON `{"code", "reason"}`; anything else is taken
    /// as a bare UTF-8 reason string.
    pub fn from_bytes(bytes: &[u8]) -> Close {
        if let Some(map) = parse_json_object(bytes) {
            return Close {
                code: get_u64(&map, &["code"]).unwrap_or(0),
                reason: get_str(&map, &["reason", "message"])
                    .unwrap_or("")
                    .to_string(),
            };
        }

        Close {
            code: 0,
            reason: String::from_utf8_lossy(bytes).trim().to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("close body serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_discovery_json() {
        let bytes = br#"{"t":"DevicePresence","i":"esp32-112233","s":"online","o":"unclaimed"}"#;
        let presence = DevicePresence::from_bytes(bytes).unwrap();
        assert_eq!(presence.device_id, "esp32-112233");
        assert_eq!(presence.status.as_deref(), Some("online"));
        assert_eq!(presence.ownership, Some(Ownership::Unclaimed));
    }

    #[test]
    fn microdata_discovery() {
        let html = br#"<div itemscope itemtype="https://schema.org/Thing">
            <span itemprop="deviceId">esp32-aabbcc</span>
            <span itemprop="ownership">owned</span>
            <span itemprop="status">online</span></div>"#;
        let presence = DevicePresence::from_bytes(html).unwrap();
        assert_eq!(presence.device_id, "esp32-aabbcc");
        assert_eq!(presence.ownership, Some(Ownership::Owned));
    }

    #[test]
    fn discovery_without_ownership_assertion() {
        let bytes = br#"{"i":"esp32-0","s":"online"}"#;
        let presence = DevicePresence::from_bytes(bytes).unwrap();
        assert_eq!(presence.ownership, None);
    }

    #[test]
    fn handshake_ack_json() {
        let bytes =
            br#"{"status":"already_owned","owner":"p-1","device_id":"esp32-aabbcc"}"#;
        let ack = HandshakeAck::from_bytes(bytes).unwrap();
        assert_eq!(ack.status, AckStatus::AlreadyOwned);
        assert_eq!(ack.owner.as_deref(), Some("p-1"));
        assert_eq!(ack.device_id.as_deref(), Some("esp32-aabbcc"));
    }

    #[test]
    fn handshake_ack_microdata() {
        let html = br#"<div itemscope><span itemprop="status">provisioned</span>
            <span itemprop="owner">p-9</span></div>"#;
        let ack = HandshakeAck::from_bytes(html).unwrap();
        assert_eq!(ack.status, AckStatus::Provisioned);
        assert_eq!(ack.owner.as_deref(), Some("p-9"));
    }

    #[test]
    fn handshake_ack_unknown_status() {
        let bytes = br#"{"status":"confused"}"#;
        assert_eq!(
            HandshakeAck::from_bytes(bytes),
            Err(Error::MalformedFramePayload)
        );
    }

    #[test]
    fn vc_init_round_trip() {
        let credential = serde_json::json!({
            "id": "vc-1",
            "issuer": "p-owner",
            "subject": "esp32-aabbcc",
        });
        let challenge = [7u8; 32];
        let bytes = VcInit::to_bytes(&credential, &challenge, 1234);

        let parsed = VcInit::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.subject.as_deref(), Some("esp32-aabbcc"));
        assert_eq!(parsed.challenge.as_deref(), Some(&challenge[..]));
        assert_eq!(parsed.timestamp, Some(1234));
        let embedded: Value = serde_json::from_slice(&parsed.credential).unwrap();
        assert_eq!(embedded, credential);
    }

    #[test]
    fn heartbeat_round_trip() {
        let hb = Heartbeat {
            timestamp: 1_700_000_000_000,
            sequence: 9,
        };
        assert_eq!(Heartbeat::from_bytes(&hb.to_bytes()).unwrap(), hb);
    }

    #[test]
    fn close_fallback_to_plain_text() {
        let close = Close::from_bytes(b"going away");
        assert_eq!(close.reason, "going away");
        assert_eq!(close.code, 0);
    }

    #[test]
    fn stream_payload_prefers_json() {
        // valid JSON that also contains angle brackets in a value
        let bytes = br#"{"type":"ownership_remove_ack","note":"<ok>"}"#;
        let map = decode_stream_object(bytes).unwrap();
        assert_eq!(map.get("type").unwrap(), "ownership_remove_ack");
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(decode_object(b"\xff\xfe"), Err(Error::MalformedFramePayload));
        assert_eq!(
            decode_stream_object(b"not json, not html"),
            Err(Error::MalformedFramePayload)
        );
    }
}
