#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::{Value, json};

    use crate::codec::{MessageCodec, frame_with_topic, split_topic};
    use crate::error::CodecError;
    use crate::types::{Message, MessageKind, Mutation, PeerId, RequestStamp};

    fn peer(id: u32) -> PeerId {
        PeerId::new(id)
    }

    fn as_json(message: &Message) -> Value {
        let bytes = MessageCodec::encode(message).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn decode(value: Value) -> Result<Message, CodecError> {
        MessageCodec::decode(&serde_json::to_vec(&value).unwrap())
    }

    // =========================================================================
    // Wire shape
    // =========================================================================

    #[test]
    fn request_wire_shape() {
        assert_eq!(
            as_json(&Message::request(peer(2), 5)),
            json!({ "PROCESS_ID": 2, "type": "REQUEST", "payload": { "clock": 5 } })
        );
    }

    #[test]
    fn ack_echoes_request_clock() {
        assert_eq!(
            as_json(&Message::ack(peer(3), 5)),
            json!({ "PROCESS_ID": 3, "type": "ACK", "payload": { "clock": 5 } })
        );
    }

    #[test]
    fn update_wire_shape() {
        let mutation = Mutation {
            position: 3,
            value: 42,
            stamp: RequestStamp::new(5, peer(2)),
        };
        assert_eq!(
            as_json(&Message::update(peer(2), mutation)),
            json!({
                "PROCESS_ID": 2,
                "type": "UPDATE",
                "payload": { "clock": 5 },
                "updatedBufferValue": { "position": 3, "value": 42 }
            })
        );
    }

    #[test]
    fn every_kind_decodes_back() {
        let messages = [
            Message::request(peer(1), 9),
            Message::ack(peer(4), 12),
            Message {
                sender: peer(2),
                kind: MessageKind::Update {
                    position: 7,
                    value: -3,
                    clock: 8,
                },
            },
        ];
        for message in messages {
            let bytes = MessageCodec::encode(&message).unwrap();
            assert_eq!(MessageCodec::decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        let message = decode(json!({
            "PROCESS_ID": 1,
            "type": "REQUEST",
            "payload": { "clock": 2, "note": "hi" },
            "extra": true
        }))
        .unwrap();
        assert_eq!(message, Message::request(peer(1), 2));
    }

    // =========================================================================
    // Rejections
    // =========================================================================

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            MessageCodec::decode(b"not json"),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = decode(json!({ "PROCESS_ID": 1, "type": "RELEASE", "payload": { "clock": 1 } }));
        assert!(matches!(result, Err(CodecError::Json(_))));
    }

    #[test]
    fn missing_or_zero_identity_is_rejected() {
        let missing = decode(json!({ "type": "ACK", "payload": { "clock": 1 } }));
        assert!(matches!(missing, Err(CodecError::Json(_))));

        let zero = decode(json!({ "PROCESS_ID": 0, "type": "ACK", "payload": { "clock": 1 } }));
        assert!(matches!(zero, Err(CodecError::InvalidIdentity(0))));

        let negative = decode(json!({ "PROCESS_ID": -1, "type": "ACK", "payload": { "clock": 1 } }));
        assert!(matches!(negative, Err(CodecError::Json(_))));
    }

    #[test]
    fn missing_clock_is_rejected() {
        let result = decode(json!({ "PROCESS_ID": 1, "type": "REQUEST", "payload": {} }));
        assert!(matches!(
            result,
            Err(CodecError::MissingField { kind: "REQUEST", field: "payload.clock" })
        ));

        let result = decode(json!({ "PROCESS_ID": 1, "type": "ACK" }));
        assert!(matches!(result, Err(CodecError::MissingField { kind: "ACK", .. })));
    }

    #[test]
    fn update_without_clock_is_unversioned() {
        let message = decode(json!({
            "PROCESS_ID": 3,
            "type": "UPDATE",
            "updatedBufferValue": { "position": 1, "value": 9 }
        }))
        .unwrap();
        assert_eq!(
            message.kind,
            MessageKind::Update { position: 1, value: 9, clock: 0 }
        );
    }

    #[test]
    fn update_without_value_is_rejected() {
        let result = decode(json!({ "PROCESS_ID": 1, "type": "UPDATE", "payload": { "clock": 1 } }));
        assert!(matches!(
            result,
            Err(CodecError::MissingField { field: "updatedBufferValue", .. })
        ));
    }

    #[test]
    fn non_integer_value_is_rejected() {
        let result = decode(json!({
            "PROCESS_ID": 1,
            "type": "UPDATE",
            "payload": { "clock": 1 },
            "updatedBufferValue": { "position": 0, "value": 2.5 }
        }));
        assert!(matches!(result, Err(CodecError::InvalidValue(v)) if v == "2.5"));

        let result = decode(json!({
            "PROCESS_ID": 1,
            "type": "UPDATE",
            "payload": { "clock": 1 },
            "updatedBufferValue": { "position": 0, "value": "7" }
        }));
        assert!(matches!(result, Err(CodecError::InvalidValue(v)) if v == "\"7\""));

        let result = decode(json!({
            "PROCESS_ID": 1,
            "type": "UPDATE",
            "payload": { "clock": 1 },
            "updatedBufferValue": { "position": 0, "value": [1] }
        }));
        assert!(matches!(result, Err(CodecError::InvalidValue(_))));
    }

    #[test]
    fn negative_position_is_rejected() {
        let result = decode(json!({
            "PROCESS_ID": 1,
            "type": "UPDATE",
            "payload": { "clock": 1 },
            "updatedBufferValue": { "position": -2, "value": 7 }
        }));
        assert!(matches!(result, Err(CodecError::InvalidPosition(-2))));
    }

    // =========================================================================
    // Topic framing
    // =========================================================================

    #[test]
    fn topic_prefix_is_big_endian() {
        let frame = frame_with_topic(peer(258), b"{}");
        assert_eq!(&frame[..], &[0, 0, 1, 2, b'{', b'}']);

        let (topic, payload) = split_topic(frame).unwrap();
        assert_eq!(topic, peer(258));
        assert_eq!(payload, Bytes::from_static(b"{}"));
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(matches!(
            split_topic(Bytes::from_static(&[0, 1])),
            Err(CodecError::ShortFrame(2))
        ));
    }
}
