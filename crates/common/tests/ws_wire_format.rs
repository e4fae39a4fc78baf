// Byte-level layout of the frames every y-sync client expects.

use std::collections::HashMap;

use cosync_common::protocol::ws::{
    decode_frame, encode_awareness, encode_sync_step1, encode_sync_step2, encode_sync_update,
    InboundFrame, MessageType,
};
use yrs::sync::awareness::AwarenessUpdateEntry;
use yrs::sync::{AwarenessUpdate, SyncMessage};
use yrs::StateVector;

#[test]
fn empty_state_vector_step1_layout() {
    // message type, sync step, buffer length, empty state vector
    assert_eq!(encode_sync_step1(StateVector::default()), vec![0, 0, 1, 0]);
}

#[test]
fn step2_and_update_carry_payload_as_length_prefixed_buffer() {
    assert_eq!(encode_sync_step2(vec![9]), vec![0, 1, 1, 9]);
    assert_eq!(encode_sync_update(vec![1, 2, 3]), vec![0, 2, 3, 1, 2, 3]);
}

#[test]
fn awareness_frame_layout() {
    let mut clients = HashMap::new();
    clients.insert(10, AwarenessUpdateEntry { clock: 1, json: "{}".into() });

    let frame = encode_awareness(AwarenessUpdate { clients });
    // message type, payload length, entry count, client id, clock, json
    assert_eq!(frame, vec![1, 6, 1, 10, 1, 2, b'{', b'}']);
}

#[test]
fn hand_built_update_frame_decodes() {
    let decoded = decode_frame(&[0, 2, 3, 1, 2, 3]).expect("frame should decode");
    assert_eq!(decoded.message_type(), Some(MessageType::Sync));
    match decoded {
        InboundFrame::Sync(SyncMessage::Update(payload)) => assert_eq!(payload, vec![1, 2, 3]),
        other => panic!("expected sync update, got {other:?}"),
    }
}

#[test]
fn large_message_type_tag_is_unknown() {
    // varint 300
    let decoded = decode_frame(&[0xac, 0x02]).expect("unknown type should decode");
    assert!(matches!(decoded, InboundFrame::Unknown(300)));
}
