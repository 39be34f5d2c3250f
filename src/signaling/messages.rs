//! JSON frame codec. Every frame is `{"event": <name>, "data": <payload>}`.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use thiserror::Error;

use super::types::{ConnectionId, OutboundMessage, RoomId};

/// Reasons an inbound frame is ignored
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("{0}: missing payload")]
    MissingData(&'static str),

    #[error("{event}: missing field `{field}`")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
}

/// The three negotiation messages relayed point to point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn event_name(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }

    /// Name of the field carrying the opaque blob, inbound and outbound
    pub fn payload_field(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "candidate",
        }
    }
}

/// Room-scoped application events relayed to every other room member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Message,
    ProposeTime,
    SessionScheduled,
    ProposalResponse,
}

impl CastKind {
    pub fn event_name(self) -> &'static str {
        match self {
            CastKind::Message => "message",
            CastKind::ProposeTime => "propose-time",
            CastKind::SessionScheduled => "session-scheduled",
            CastKind::ProposalResponse => "proposal-response",
        }
    }

    fn stamps_time(self) -> bool {
        !matches!(self, CastKind::SessionScheduled)
    }
}

/// Decoded inbound event
#[derive(Debug)]
pub enum ClientEvent {
    JoinRoom(RoomId),
    LeaveRoom(RoomId),
    Signal {
        kind: SignalKind,
        target: ConnectionId,
        payload: Box<RawValue>,
    },
    RoomCast {
        kind: CastKind,
        room: RoomId,
        fields: RawFields,
    },
}

/// Members of a JSON object in wire order, values kept as raw JSON text.
#[derive(Debug, Clone, Default)]
pub struct RawFields(Vec<(String, Box<RawValue>)>);

impl RawFields {
    pub fn get(&self, key: &str) -> Option<&RawValue> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| &**v)
    }

    /// Remove every member named `key`, returning the last one (JSON
    /// duplicate keys resolve to the last occurrence).
    pub fn remove(&mut self, key: &str) -> Option<Box<RawValue>> {
        let mut found = None;
        while let Some(pos) = self.0.iter().position(|(k, _)| k == key) {
            found = Some(self.0.remove(pos).1);
        }
        found
    }

    pub fn push(&mut self, key: impl Into<String>, value: Box<RawValue>) {
        self.0.push((key.into(), value));
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), &**v))
    }
}

impl<'de> Deserialize<'de> for RawFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldsVisitor;

        impl<'de> Visitor<'de> for FieldsVisitor {
            type Value = RawFields;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RawFields, A::Error> {
                let mut fields = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, Box<RawValue>>()? {
                    fields.push((key, value));
                }
                Ok(RawFields(fields))
            }
        }

        deserializer.deserialize_map(FieldsVisitor)
    }
}

impl Serialize for RawFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

fn is_null(value: &RawValue) -> bool {
    value.get().trim() == "null"
}

pub type Decoder = fn(Option<&RawValue>) -> Result<ClientEvent, FrameError>;

/// Inbound event name -> decoder. Anything not listed is ignored.
pub const INBOUND_EVENTS: &[(&str, Decoder)] = &[
    ("join-room", decode_join_room),
    ("leave-room", decode_leave_room),
    ("offer", decode_offer),
    ("answer", decode_answer),
    ("ice-candidate", decode_ice_candidate),
    ("message", decode_message),
    ("propose-time", decode_propose_time),
    ("session-scheduled", decode_session_scheduled),
    ("proposal-response", decode_proposal_response),
];

#[derive(Deserialize)]
struct Envelope<'a> {
    event: &'a str,
    #[serde(borrow, default)]
    data: Option<&'a RawValue>,
}

/// `join-room`/`leave-room` accept either a bare string or `{"roomId": ..}`
#[derive(Deserialize)]
#[serde(untagged)]
enum RoomRef {
    Bare(RoomId),
    Keyed {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
}

impl RoomRef {
    fn into_room(self) -> RoomId {
        match self {
            RoomRef::Bare(room) | RoomRef::Keyed { room_id: room } => room,
        }
    }
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let envelope: Envelope<'_> = serde_json::from_str(text)?;
        let decode = INBOUND_EVENTS
            .iter()
            .find(|(name, _)| *name == envelope.event)
            .map(|(_, decode)| *decode)
            .ok_or_else(|| FrameError::UnknownEvent(envelope.event.to_owned()))?;
        decode(envelope.data)
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => "join-room",
            ClientEvent::LeaveRoom(_) => "leave-room",
            ClientEvent::Signal { kind, .. } => kind.event_name(),
            ClientEvent::RoomCast { kind, .. } => kind.event_name(),
        }
    }
}

fn require<'a>(event: &'static str, data: Option<&'a RawValue>) -> Result<&'a RawValue, FrameError> {
    data.ok_or(FrameError::MissingData(event))
}

fn decode_room(event: &'static str, data: Option<&RawValue>) -> Result<RoomId, FrameError> {
    let room: RoomRef = serde_json::from_str(require(event, data)?.get())?;
    Ok(room.into_room())
}

fn decode_join_room(data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    decode_room("join-room", data).map(ClientEvent::JoinRoom)
}

fn decode_leave_room(data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    decode_room("leave-room", data).map(ClientEvent::LeaveRoom)
}

fn decode_signal(kind: SignalKind, data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    let event = kind.event_name();
    let mut fields: RawFields = serde_json::from_str(require(event, data)?.get())?;

    let target = fields.remove("target").ok_or(FrameError::MissingField {
        event,
        field: "target",
    })?;
    let target: ConnectionId = serde_json::from_str(target.get())?;

    let payload = fields
        .remove(kind.payload_field())
        .ok_or(FrameError::MissingField {
            event,
            field: kind.payload_field(),
        })?;

    Ok(ClientEvent::Signal {
        kind,
        target,
        payload,
    })
}

fn decode_offer(data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    decode_signal(SignalKind::Offer, data)
}

fn decode_answer(data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    decode_signal(SignalKind::Answer, data)
}

fn decode_ice_candidate(data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    decode_signal(SignalKind::IceCandidate, data)
}

fn decode_room_cast(kind: CastKind, data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    let event = kind.event_name();
    let mut fields: RawFields = serde_json::from_str(require(event, data)?.get())?;
    let room = fields.remove("roomId").ok_or(FrameError::MissingField {
        event,
        field: "roomId",
    })?;
    let room: RoomId = serde_json::from_str(room.get())?;
    // the relay stamps its own sender
    fields.remove("sender");

    Ok(ClientEvent::RoomCast { kind, room, fields })
}

fn decode_message(data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    decode_room_cast(CastKind::Message, data)
}

fn decode_propose_time(data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    decode_room_cast(CastKind::ProposeTime, data)
}

fn decode_session_scheduled(data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    decode_room_cast(CastKind::SessionScheduled, data)
}

fn decode_proposal_response(data: Option<&RawValue>) -> Result<ClientEvent, FrameError> {
    decode_room_cast(CastKind::ProposalResponse, data)
}

/// Outbound event
#[derive(Debug)]
pub enum ServerEvent<'a> {
    /// Sent once to a new connection with its own id
    Connected(ConnectionId),
    UserJoined(ConnectionId),
    UserLeft(ConnectionId),
    Signal {
        kind: SignalKind,
        sender: ConnectionId,
        payload: &'a RawValue,
    },
    RoomCast {
        kind: CastKind,
        sender: ConnectionId,
        fields: &'a RawFields,
    },
}

#[derive(Serialize)]
struct Frame<T: Serialize> {
    event: &'static str,
    data: T,
}

struct SignalData<'a> {
    field: &'static str,
    payload: &'a RawValue,
    sender: ConnectionId,
}

impl Serialize for SignalData<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(self.field, self.payload)?;
        map.serialize_entry("sender", &self.sender)?;
        map.end()
    }
}

struct CastData<'a> {
    fields: &'a RawFields,
    sender: ConnectionId,
    /// Replaces an absent or null client timestamp
    timestamp: Option<String>,
}

impl Serialize for CastData<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (key, value) in self.fields.iter() {
            if key == "timestamp" && self.timestamp.is_some() {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("sender", &self.sender)?;
        if let Some(timestamp) = &self.timestamp {
            map.serialize_entry("timestamp", timestamp)?;
        }
        map.end()
    }
}

impl ServerEvent<'_> {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::Connected(_) => "connected",
            ServerEvent::UserJoined(_) => "user-joined",
            ServerEvent::UserLeft(_) => "user-left",
            ServerEvent::Signal { kind, .. } => kind.event_name(),
            ServerEvent::RoomCast { kind, .. } => kind.event_name(),
        }
    }

    /// Encode once; the result is cheap to clone for fan-out.
    pub fn encode(&self) -> OutboundMessage {
        let event = self.event_name();
        let json = match self {
            ServerEvent::Connected(id) | ServerEvent::UserJoined(id) | ServerEvent::UserLeft(id) => {
                serde_json::to_string(&Frame { event, data: id })
            }
            ServerEvent::Signal {
                kind,
                sender,
                payload,
            } => serde_json::to_string(&Frame {
                event,
                data: SignalData {
                    field: kind.payload_field(),
                    payload,
                    sender: *sender,
                },
            }),
            ServerEvent::RoomCast {
                kind,
                sender,
                fields,
            } => {
                let needs_time = kind.stamps_time() && fields.get("timestamp").is_none_or(is_null);
                let timestamp =
                    needs_time.then(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
                serde_json::to_string(&Frame {
                    event,
                    data: CastData {
                        fields,
                        sender: *sender,
                        timestamp,
                    },
                })
            }
        };
        OutboundMessage::from(json.expect("ServerEvent serialization should never fail"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn conn(n: u64) -> ConnectionId {
        ConnectionId::from_u64(n)
    }

    fn fields(json: &str) -> RawFields {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn dispatch_table_has_unique_names() {
        let mut names: Vec<&str> = INBOUND_EVENTS.iter().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), INBOUND_EVENTS.len());
    }

    #[test]
    fn parse_join_room_bare_string() {
        let msg = ClientEvent::parse(r#"{"event": "join-room", "data": "Room-1"}"#).unwrap();
        match msg {
            ClientEvent::JoinRoom(room) => assert_eq!(room.as_str(), "Room-1"),
            other => panic!("Expected JoinRoom, got {:?}", other),
        }
    }

    #[test]
    fn parse_leave_room_keyed() {
        let msg = ClientEvent::parse(r#"{"data": {"roomId": "x"}, "event": "leave-room"}"#).unwrap();
        match msg {
            ClientEvent::LeaveRoom(room) => assert_eq!(room.as_str(), "x"),
            other => panic!("Expected LeaveRoom, got {:?}", other),
        }
    }

    #[test]
    fn parse_offer_keeps_payload_verbatim() {
        let text = r#"{"event":"offer","data":{"offer": {"type":"offer", "sdp":"v=0\r\n","n":1.50},"target":"conn_000000000000002a"}}"#;
        match ClientEvent::parse(text).unwrap() {
            ClientEvent::Signal {
                kind,
                target,
                payload,
            } => {
                assert_eq!(kind, SignalKind::Offer);
                assert_eq!(target, conn(42));
                assert_eq!(payload.get(), r#"{"type":"offer", "sdp":"v=0\r\n","n":1.50}"#);
            }
            other => panic!("Expected Signal, got {:?}", other),
        }
    }

    #[test]
    fn parse_ice_candidate_uses_candidate_field() {
        let text = r#"{"event":"ice-candidate","data":{"target":"conn_0000000000000001","candidate":null}}"#;
        match ClientEvent::parse(text).unwrap() {
            ClientEvent::Signal { kind, payload, .. } => {
                assert_eq!(kind, SignalKind::IceCandidate);
                assert_eq!(payload.get(), "null");
            }
            other => panic!("Expected Signal, got {:?}", other),
        }
    }

    #[test]
    fn parse_room_cast_strips_room_id() {
        let text = r#"{"event":"message","data":{"roomId":"r","message":"hi","senderType":"mentor"}}"#;
        match ClientEvent::parse(text).unwrap() {
            ClientEvent::RoomCast { kind, room, fields } => {
                assert_eq!(kind, CastKind::Message);
                assert_eq!(room.as_str(), "r");
                assert!(!fields.contains_key("roomId"));
                assert_eq!(fields.get("message").unwrap().get(), r#""hi""#);
            }
            other => panic!("Expected RoomCast, got {:?}", other),
        }
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            ClientEvent::parse("not json"),
            Err(FrameError::Json(_))
        ));
        assert!(matches!(
            ClientEvent::parse(r#"{"event":"create_room"}"#),
            Err(FrameError::UnknownEvent(_))
        ));
        assert!(matches!(
            ClientEvent::parse(r#"{"event":"join-room"}"#),
            Err(FrameError::MissingData("join-room"))
        ));
        assert!(matches!(
            ClientEvent::parse(r#"{"event":"offer","data":{"offer":{}}}"#),
            Err(FrameError::MissingField { field: "target", .. })
        ));
        assert!(matches!(
            ClientEvent::parse(r#"{"event":"answer","data":{"target":"conn_0000000000000001"}}"#),
            Err(FrameError::MissingField { field: "answer", .. })
        ));
        assert!(ClientEvent::parse(r#"{"event":"offer","data":{"target":"bob","offer":{}}}"#).is_err());
        assert!(ClientEvent::parse(r#"{"event":"message","data":{"message":"no room"}}"#).is_err());
    }

    #[test]
    fn encode_user_joined() {
        let msg = ServerEvent::UserJoined(conn(1)).encode();
        assert_eq!(
            msg.as_str(),
            r#"{"event":"user-joined","data":"conn_0000000000000001"}"#
        );
    }

    #[test]
    fn encode_signal_is_verbatim_with_sender() {
        let payload = RawValue::from_string(r#"{"sdp": "a=x", "type": "answer"}"#.to_owned()).unwrap();
        let msg = ServerEvent::Signal {
            kind: SignalKind::Answer,
            sender: conn(7),
            payload: &payload,
        }
        .encode();
        assert_eq!(
            msg.as_str(),
            r#"{"event":"answer","data":{"answer":{"sdp": "a=x", "type": "answer"},"sender":"conn_0000000000000007"}}"#
        );
    }

    #[test]
    fn encode_room_cast_stamps_sender_and_timestamp() {
        let fields = fields(r#"{"message":"hello"}"#);
        let msg = ServerEvent::RoomCast {
            kind: CastKind::Message,
            sender: conn(3),
            fields: &fields,
        }
        .encode();
        let value: Value = serde_json::from_str(msg.as_str()).unwrap();
        assert_eq!(value["event"], "message");
        assert_eq!(value["data"]["message"], "hello");
        assert_eq!(value["data"]["sender"], "conn_0000000000000003");
        assert!(value["data"]["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn encode_room_cast_keeps_client_timestamp() {
        let fields = fields(r#"{"timestamp":"2024-01-01T00:00:00.000Z"}"#);
        let msg = ServerEvent::RoomCast {
            kind: CastKind::ProposeTime,
            sender: conn(3),
            fields: &fields,
        }
        .encode();
        let value: Value = serde_json::from_str(msg.as_str()).unwrap();
        assert_eq!(value["data"]["timestamp"], "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn session_scheduled_is_not_timestamped() {
        let fields = RawFields::default();
        let msg = ServerEvent::RoomCast {
            kind: CastKind::SessionScheduled,
            sender: conn(3),
            fields: &fields,
        }
        .encode();
        let value: Value = serde_json::from_str(msg.as_str()).unwrap();
        assert!(value["data"].get("timestamp").is_none());
    }

    #[test]
    fn room_cast_fields_pass_through_untouched() {
        let text = r#"{"event":"message","data":{"roomId":"r","z":1,"amount":1.50,"big":123456789012345678901234,"a":2,"note":"xé"}}"#;
        let ClientEvent::RoomCast { kind, fields, .. } = ClientEvent::parse(text).unwrap() else {
            panic!("Expected RoomCast");
        };
        let msg = ServerEvent::RoomCast {
            kind,
            sender: conn(5),
            fields: &fields,
        }
        .encode();
        assert!(msg.as_str().starts_with(
            r#"{"event":"message","data":{"z":1,"amount":1.50,"big":123456789012345678901234,"a":2,"note":"xé","sender":"conn_0000000000000005","timestamp":""#
        ));
    }

    #[test]
    fn room_cast_replaces_client_sender() {
        let text = r#"{"event":"proposal-response","data":{"roomId":"r","sender":"spoofed","response":"accepted"}}"#;
        let ClientEvent::RoomCast { kind, fields, .. } = ClientEvent::parse(text).unwrap() else {
            panic!("Expected RoomCast");
        };
        let msg = ServerEvent::RoomCast {
            kind,
            sender: conn(5),
            fields: &fields,
        }
        .encode();
        let value: Value = serde_json::from_str(msg.as_str()).unwrap();
        assert_eq!(value["data"]["sender"], "conn_0000000000000005");
        assert!(!msg.as_str().contains("spoofed"));
    }

    #[test]
    fn null_timestamp_is_filled_in() {
        let fields = fields(r#"{"message":"hi","timestamp":null}"#);
        let msg = ServerEvent::RoomCast {
            kind: CastKind::Message,
            sender: conn(3),
            fields: &fields,
        }
        .encode();
        let value: Value = serde_json::from_str(msg.as_str()).unwrap();
        assert!(value["data"]["timestamp"].as_str().unwrap().ends_with('Z'));
        assert_eq!(msg.as_str().matches("timestamp").count(), 1);
    }

    #[test]
    fn raw_fields_last_duplicate_wins() {
        let mut fields = fields(r#"{"k":1,"other":true,"k":2}"#);
        assert_eq!(fields.get("k").unwrap().get(), "2");
        assert_eq!(fields.remove("k").unwrap().get(), "2");
        assert!(!fields.contains_key("k"));
        assert_eq!(fields.iter().count(), 1);
    }
}
