//! Voice gateway packets.
//!
//! Every frame on the voice websocket is `{"op": <u8>, "d": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::error::Error;

#[derive(Clone, Copy, Debug, Deserialize_repr, PartialEq, Serialize_repr)]
#[repr(u8)]
pub enum OpCode {
    Identify = 0,
    SelectProtocol = 1,
    Ready = 2,
    Heartbeat = 3,
    SessionDescription = 4,
    Speaking = 5,
    HeartbeatAck = 6,
    Resume = 7,
    Hello = 8,
    Resumed = 9,
    ClientDisconnect = 13,
}

/// A raw voice gateway frame.
#[derive(Debug, Deserialize, Serialize)]
pub struct Packet {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Value>,
}

impl Packet {
    /// Wraps a payload into a frame.
    pub fn new<T: Serialize>(op: OpCode, d: &T) -> Result<Packet, Error> {
        Ok(Packet {
            op: op as u8,
            d: Some(serde_json::to_value(d).map_err(Error::Json)?),
        })
    }

    fn payload<T: for<'de> Deserialize<'de>>(self) -> Result<T, Error> {
        let d = self.d.ok_or(Error::MissingPayload)?;

        serde_json::from_value(d).map_err(Error::Json)
    }
}

/// A decoded voice gateway event.
#[derive(Debug)]
pub enum VoiceEvent {
    Hello(Hello),
    Ready(Ready),
    SessionDescription(SessionDescription),
    Speaking(Speaking),
    HeartbeatAck(u64),
    Resumed,
    ClientDisconnect,
    /// An opcode this server has no use for.
    Other(u8),
}

impl TryFrom<Packet> for VoiceEvent {
    type Error = Error;

    fn try_from(packet: Packet) -> Result<VoiceEvent, Error> {
        match packet.op {
            2 => packet.payload().map(VoiceEvent::Ready),
            4 => packet.payload().map(VoiceEvent::SessionDescription),
            5 => packet.payload().map(VoiceEvent::Speaking),
            6 => packet.payload().map(VoiceEvent::HeartbeatAck),
            8 => packet.payload().map(VoiceEvent::Hello),
            9 => Ok(VoiceEvent::Resumed),
            13 => Ok(VoiceEvent::ClientDisconnect),
            op => Ok(VoiceEvent::Other(op)),
        }
    }
}

/// The `IDENTIFY` payload.
#[derive(Debug, Serialize)]
pub struct Identify {
    pub server_id: String,
    pub user_id: String,
    pub session_id: String,
    pub token: String,
}

/// The `SELECT_PROTOCOL` payload.
#[derive(Debug, Serialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: SelectProtocolData,
}

#[derive(Debug, Serialize)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

/// The `READY` payload.
#[derive(Debug, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
}

/// The `SESSION_DESCRIPTION` payload.
#[derive(Debug, Deserialize)]
pub struct SessionDescription {
    pub mode: String,
    pub secret_key: [u8; 32],
}

/// The `SPEAKING` payload.
#[derive(Debug, Deserialize, Serialize)]
pub struct Speaking {
    pub speaking: u8,
    #[serde(default)]
    pub delay: Option<u32>,
    pub ssrc: u32,
}

/// The `RESUME` payload.
#[derive(Debug, Serialize)]
pub struct Resume {
    pub server_id: String,
    pub session_id: String,
    pub token: String,
}

/// The `HELLO` payload.
#[derive(Debug, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_ready() {
        let packet: Packet = serde_json::from_str(
            r#"{"op":2,"d":{"ssrc":1,"ip":"127.0.0.1","port":1234,"modes":["xsalsa20_poly1305"]}}"#,
        )
        .unwrap();

        match VoiceEvent::try_from(packet).unwrap() {
            VoiceEvent::Ready(ready) => {
                assert_eq!(ready.ssrc, 1);
                assert_eq!(ready.port, 1234);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn unknown_opcode_is_other() {
        let packet: Packet = serde_json::from_str(r#"{"op":18,"d":null}"#).unwrap();

        assert!(matches!(
            VoiceEvent::try_from(packet).unwrap(),
            VoiceEvent::Other(18),
        ));
    }

    #[test]
    fn encodes_identify_with_op() {
        let packet = Packet::new(
            OpCode::Identify,
            &Identify {
                server_id: String::from("100"),
                user_id: String::from("42"),
                session_id: String::from("s"),
                token: String::from("t"),
            },
        )
        .unwrap();

        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["op"], 0);
        assert_eq!(json["d"]["server_id"], "100");
    }
}
