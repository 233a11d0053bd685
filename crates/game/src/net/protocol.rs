use crate::sync::ShareScope;

use super::codec::{DecodeError, FieldReader, FieldWriter, Record, WireValue};

/// Reserved stand-in for 0.0 at the wire boundary. Absent numeric fields
/// decode as zero, so a literal zero travels as this sentinel to stay
/// distinguishable from "field not set". Storage always holds the literal
/// value.
pub const WIRE_ZERO: f64 = f64::MIN;

pub fn to_wire_value(value: f64) -> f64 {
    if value == 0.0 { WIRE_ZERO } else { value }
}

pub fn from_wire_value(value: f64) -> f64 {
    if value == WIRE_ZERO { 0.0 } else { value }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("envelope shorter than type id")]
    ShortEnvelope,
    #[error("malformed payload for type {type_id}: {source}")]
    MalformedPayload { type_id: i32, source: DecodeError },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Authenticate {
    pub token: String,
}

impl Record for Authenticate {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.write_str(1, &self.token);
    }

    fn apply_field(&mut self, field: u32, value: WireValue<'_>) -> Result<(), DecodeError> {
        if field == 1 {
            self.token = value.as_str(field)?.to_string();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Authenticated {
    pub player_id: u64,
    pub name: String,
    pub channel_id: u32,
    pub key: Vec<u8>,
}

impl Record for Authenticated {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.write_u64(1, self.player_id);
        w.write_str(2, &self.name);
        w.write_u32(3, self.channel_id);
        w.write_bytes(4, &self.key);
    }

    fn apply_field(&mut self, field: u32, value: WireValue<'_>) -> Result<(), DecodeError> {
        match field {
            1 => self.player_id = value.as_u64(),
            2 => self.name = value.as_str(field)?.to_string(),
            3 => self.channel_id = value.as_u32(),
            4 => self.key = value.as_bytes().to_vec(),
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Notice {
    pub text: String,
}

impl Record for Notice {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.write_str(1, &self.text);
    }

    fn apply_field(&mut self, field: u32, value: WireValue<'_>) -> Result<(), DecodeError> {
        if field == 1 {
            self.text = value.as_str(field)?.to_string();
        }
        Ok(())
    }
}

pub const CLOSE_POLICY_VIOLATION: u32 = 1008;
pub const CLOSE_GOING_AWAY: u32 = 1001;

/// Coded close reason, sent right before the socket is closed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Goodbye {
    pub code: u32,
    pub reason: String,
}

impl Record for Goodbye {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.write_u32(1, self.code);
        w.write_str(2, &self.reason);
    }

    fn apply_field(&mut self, field: u32, value: WireValue<'_>) -> Result<(), DecodeError> {
        match field {
            1 => self.code = value.as_u32(),
            2 => self.reason = value.as_str(field)?.to_string(),
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Ping {
    pub timestamp: u64,
}

impl Record for Ping {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.write_u64(1, self.timestamp);
    }

    fn apply_field(&mut self, field: u32, value: WireValue<'_>) -> Result<(), DecodeError> {
        if field == 1 {
            self.timestamp = value.as_u64();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pong {
    pub timestamp: u64,
}

impl Record for Pong {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.write_u64(1, self.timestamp);
    }

    fn apply_field(&mut self, field: u32, value: WireValue<'_>) -> Result<(), DecodeError> {
        if field == 1 {
            self.timestamp = value.as_u64();
        }
        Ok(())
    }
}

/// One scalar of game state on the wire. `value` carries the sentinel
/// transform; [`StateEntry::new`] and [`StateEntry::value`] stay in
/// literal space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateEntry {
    pub group: String,
    pub name: String,
    wire_value: f64,
}

impl StateEntry {
    pub fn new(group: &str, name: &str, value: f64) -> Self {
        Self {
            group: group.to_string(),
            name: name.to_string(),
            wire_value: to_wire_value(value),
        }
    }

    pub fn value(&self) -> f64 {
        from_wire_value(self.wire_value)
    }
}

impl Record for StateEntry {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.write_str(1, &self.group);
        w.write_str(2, &self.name);
        w.write_f64(3, self.wire_value);
    }

    fn apply_field(&mut self, field: u32, value: WireValue<'_>) -> Result<(), DecodeError> {
        match field {
            1 => self.group = value.as_str(field)?.to_string(),
            2 => self.name = value.as_str(field)?.to_string(),
            3 => self.wire_value = value.as_f64(),
            _ => {}
        }
        Ok(())
    }
}

/// Batched state writes (client to server) or merge results (server to
/// client).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub scope: ShareScope,
    pub entries: Vec<StateEntry>,
}

impl Record for StateUpdate {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.write_u32(1, self.scope as u32);
        for entry in &self.entries {
            w.write_record(2, |nested| entry.encode_fields(nested));
        }
    }

    fn apply_field(&mut self, field: u32, value: WireValue<'_>) -> Result<(), DecodeError> {
        match field {
            1 => {
                // informational only; the registered strategy decides the
                // actual scope, so a value from a newer peer degrades to
                // the default instead of killing the decode
                self.scope = ShareScope::from_wire(value.as_u32()).unwrap_or_default();
            }
            2 => {
                let mut entry = StateEntry::default();
                let mut reader = FieldReader::new(value.as_bytes());
                while let Some((f, v)) = reader.next_field()? {
                    entry.apply_field(f, v)?;
                }
                self.entries.push(entry);
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ObjectiveClaim {
    pub objective_id: u32,
}

impl Record for ObjectiveClaim {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.write_u32(1, self.objective_id);
    }

    fn apply_field(&mut self, field: u32, value: WireValue<'_>) -> Result<(), DecodeError> {
        if field == 1 {
            self.objective_id = value.as_u32();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MatchReady {}

impl Record for MatchReady {
    fn encode_fields(&self, _w: &mut FieldWriter) {}

    fn apply_field(&mut self, _field: u32, _value: WireValue<'_>) -> Result<(), DecodeError> {
        Ok(())
    }
}

/// Closed union of every registered message. The match arms below are the
/// single id <-> schema table, bijective in both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Authenticate(Authenticate),
    Authenticated(Authenticated),
    Notice(Notice),
    Goodbye(Goodbye),
    Ping(Ping),
    Pong(Pong),
    StateUpdate(StateUpdate),
    ObjectiveClaim(ObjectiveClaim),
    MatchReady(MatchReady),
}

impl Message {
    pub fn type_id(&self) -> i32 {
        match self {
            Message::Authenticate(_) => 1,
            Message::Authenticated(_) => 2,
            Message::Notice(_) => 3,
            Message::Goodbye(_) => 4,
            Message::Ping(_) => 5,
            Message::Pong(_) => 6,
            Message::StateUpdate(_) => 7,
            Message::ObjectiveClaim(_) => 8,
            Message::MatchReady(_) => 9,
        }
    }

    /// Outer envelope: big-endian type id followed by the payload bytes.
    pub fn encode_envelope(&self) -> Vec<u8> {
        let payload = match self {
            Message::Authenticate(m) => m.encode(),
            Message::Authenticated(m) => m.encode(),
            Message::Notice(m) => m.encode(),
            Message::Goodbye(m) => m.encode(),
            Message::Ping(m) => m.encode(),
            Message::Pong(m) => m.encode(),
            Message::StateUpdate(m) => m.encode(),
            Message::ObjectiveClaim(m) => m.encode(),
            Message::MatchReady(m) => m.encode(),
        };
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&self.type_id().to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decodes one envelope. An unregistered type id is not an error: the
    /// message is dropped (`Ok(None)`) so newer peers can talk to older
    /// servers. A malformed payload for a known id is fatal to the caller.
    pub fn decode_envelope(frame: &[u8]) -> Result<Option<Message>, ProtocolError> {
        if frame.len() < 4 {
            return Err(ProtocolError::ShortEnvelope);
        }
        let type_id = i32::from_be_bytes(frame[..4].try_into().unwrap());
        let payload = &frame[4..];

        fn parse<R: Record>(
            type_id: i32,
            payload: &[u8],
            wrap: impl FnOnce(R) -> Message,
        ) -> Result<Option<Message>, ProtocolError> {
            R::decode(payload)
                .map(|m| Some(wrap(m)))
                .map_err(|source| ProtocolError::MalformedPayload { type_id, source })
        }

        match type_id {
            1 => parse(type_id, payload, Message::Authenticate),
            2 => parse(type_id, payload, Message::Authenticated),
            3 => parse(type_id, payload, Message::Notice),
            4 => parse(type_id, payload, Message::Goodbye),
            5 => parse(type_id, payload, Message::Ping),
            6 => parse(type_id, payload, Message::Pong),
            7 => parse(type_id, payload, Message::StateUpdate),
            8 => parse(type_id, payload, Message::ObjectiveClaim),
            9 => parse(type_id, payload, Message::MatchReady),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_registered() -> Vec<Message> {
        vec![
            Message::Authenticate(Authenticate {
                token: "secret:7:alice".to_string(),
            }),
            Message::Authenticated(Authenticated {
                player_id: 7,
                name: "alice".to_string(),
                channel_id: 42,
                key: vec![1; 16],
            }),
            Message::Notice(Notice {
                text: "hello".to_string(),
            }),
            Message::Goodbye(Goodbye {
                code: CLOSE_POLICY_VIOLATION,
                reason: "unauthenticated traffic".to_string(),
            }),
            Message::Ping(Ping { timestamp: 123 }),
            Message::Pong(Pong { timestamp: 123 }),
            Message::StateUpdate(StateUpdate {
                scope: ShareScope::World,
                entries: vec![
                    StateEntry::new("score", "kills", 5.0),
                    StateEntry::new("score", "deaths", 0.0),
                ],
            }),
            Message::ObjectiveClaim(ObjectiveClaim { objective_id: 3 }),
            Message::MatchReady(MatchReady {}),
        ]
    }

    #[test]
    fn envelope_round_trip_every_type() {
        for message in all_registered() {
            let frame = message.encode_envelope();
            let decoded = Message::decode_envelope(&frame).unwrap();
            assert_eq!(decoded, Some(message));
        }
    }

    #[test]
    fn unknown_type_id_is_dropped() {
        let mut frame = 12345i32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"whatever bytes");
        assert_eq!(Message::decode_envelope(&frame).unwrap(), None);
    }

    #[test]
    fn short_envelope_is_an_error() {
        assert!(Message::decode_envelope(&[0, 0, 1]).is_err());
    }

    #[test]
    fn malformed_known_payload_is_fatal() {
        let mut frame = 2i32.to_be_bytes().to_vec();
        // field 2 (name) claims 200 bytes of content but carries none
        frame.extend_from_slice(&[0x12, 0xc8, 0x01]);
        assert!(matches!(
            Message::decode_envelope(&frame),
            Err(ProtocolError::MalformedPayload { type_id: 2, .. })
        ));
    }

    #[test]
    fn unknown_scope_decodes_with_default() {
        let mut w = FieldWriter::new();
        // scope value from a future protocol revision
        w.write_u32(1, 9);
        w.write_record(2, |nested| {
            StateEntry::new("score", "kills", 5.0).encode_fields(nested)
        });
        let update = StateUpdate::decode(&w.into_bytes()).unwrap();
        assert_eq!(update.scope, ShareScope::Player);
        assert_eq!(update.entries.len(), 1);
        assert_eq!(update.entries[0].value(), 5.0);
    }

    #[test]
    fn zero_travels_as_sentinel() {
        let entry = StateEntry::new("score", "deaths", 0.0);
        let bytes = entry.encode();
        // the sentinel is a real fixed64 field, not an omitted default
        assert!(!bytes.is_empty());
        assert_eq!(StateEntry::decode(&bytes).unwrap().value(), 0.0);

        let entry = StateEntry::new("score", "kills", 5.0);
        assert_eq!(StateEntry::decode(&entry.encode()).unwrap().value(), 5.0);
    }
}
