//! JSON wire codec.
//!
//! ```json
//! { "PROCESS_ID": 2, "type": "REQUEST", "payload": { "clock": 5 } }
//! { "PROCESS_ID": 3, "type": "ACK", "payload": { "clock": 5 } }
//! { "PROCESS_ID": 2, "type": "UPDATE", "payload": { "clock": 5 },
//!   "updatedBufferValue": { "position": 3, "value": 42 } }
//! ```
//!
//! For an ACK, `payload.clock` echoes the request being granted. For an
//! UPDATE it is the writer's request clock, and may be left out.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::types::{LogicalTime, Message, MessageKind, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum PacketType {
    Request,
    Ack,
    Update,
}

impl PacketType {
    fn label(self) -> &'static str {
        match self {
            PacketType::Request => "REQUEST",
            PacketType::Ack => "ACK",
            PacketType::Update => "UPDATE",
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    clock: Option<LogicalTime>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BufferValue {
    position: i64,
    /// Any JSON; anything but an integer is rejected on decode
    value: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct Packet {
    #[serde(rename = "PROCESS_ID")]
    process_id: u32,
    #[serde(rename = "type")]
    kind: PacketType,
    #[serde(default)]
    payload: Payload,
    #[serde(
        rename = "updatedBufferValue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    updated_buffer_value: Option<BufferValue>,
}

pub struct MessageCodec;

impl MessageCodec {
    pub fn encode(message: &Message) -> Result<Bytes, CodecError> {
        let packet = match message.kind {
            MessageKind::Request { clock } => Packet {
                process_id: message.sender.get(),
                kind: PacketType::Request,
                payload: Payload { clock: Some(clock) },
                updated_buffer_value: None,
            },
            MessageKind::Ack { clock } => Packet {
                process_id: message.sender.get(),
                kind: PacketType::Ack,
                payload: Payload { clock: Some(clock) },
                updated_buffer_value: None,
            },
            MessageKind::Update {
                position,
                value,
                clock,
            } => Packet {
                process_id: message.sender.get(),
                kind: PacketType::Update,
                payload: Payload { clock: Some(clock) },
                updated_buffer_value: Some(BufferValue {
                    position: position as i64,
                    value: serde_json::Value::from(value),
                }),
            },
        };
        Ok(Bytes::from(serde_json::to_vec(&packet)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
        let packet: Packet = serde_json::from_slice(bytes)?;
        if packet.process_id == 0 {
            return Err(CodecError::InvalidIdentity(packet.process_id));
        }
        let sender = PeerId::new(packet.process_id);
        let label = packet.kind.label();
        let required_clock = || {
            packet.payload.clock.ok_or(CodecError::MissingField {
                kind: label,
                field: "payload.clock",
            })
        };

        let kind = match packet.kind {
            PacketType::Request => MessageKind::Request {
                clock: required_clock()?,
            },
            PacketType::Ack => MessageKind::Ack {
                clock: required_clock()?,
            },
            PacketType::Update => {
                // An unversioned UPDATE loses to any stamped write
                let clock = packet.payload.clock.unwrap_or(0);
                let update = packet
                    .updated_buffer_value
                    .ok_or(CodecError::MissingField {
                        kind: label,
                        field: "updatedBufferValue",
                    })?;
                if update.position < 0 {
                    return Err(CodecError::InvalidPosition(update.position));
                }
                let value = update
                    .value
                    .as_i64()
                    .ok_or_else(|| CodecError::InvalidValue(update.value.to_string()))?;
                MessageKind::Update {
                    position: update.position as usize,
                    value,
                    clock,
                }
            }
        };

        Ok(Message { sender, kind })
    }
}

// ─── Topic framing ──────────────────────────────────────────────────────────

/// Prefix `payload` with the destination topic (4 bytes, big-endian)
pub fn frame_with_topic(topic: PeerId, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(topic.get());
    frame.put_slice(payload);
    frame.freeze()
}

/// Split a topic-prefixed frame
pub fn split_topic(mut frame: Bytes) -> Result<(PeerId, Bytes), CodecError> {
    if frame.len() < 4 {
        return Err(CodecError::ShortFrame(frame.len()));
    }
    let payload = frame.split_off(4);
    let topic = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    Ok((PeerId::new(topic), payload))
}
