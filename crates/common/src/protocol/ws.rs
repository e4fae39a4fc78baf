// Binary frames for the y-sync WebSocket protocol.
//
// Every frame starts with a varint message type. Sync frames carry a y-sync
// sub-message (step 1, step 2 or update); awareness frames carry a
// length-prefixed awareness update. Everything after the type tag is produced
// and consumed by `yrs`.

use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::sync::{AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::{Decode, DecoderV1};
use yrs::updates::encoder::Encode;
use yrs::StateVector;

/// Message type tag for document synchronization frames.
pub const MESSAGE_SYNC: u32 = 0;
/// Message type tag for awareness (presence) frames.
pub const MESSAGE_AWARENESS: u32 = 1;

/// Known top-level message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Sync,
    Awareness,
}

impl MessageType {
    pub const fn tag(self) -> u32 {
        match self {
            Self::Sync => MESSAGE_SYNC,
            Self::Awareness => MESSAGE_AWARENESS,
        }
    }

    pub const fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            MESSAGE_SYNC => Some(Self::Sync),
            MESSAGE_AWARENESS => Some(Self::Awareness),
            _ => None,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum InboundFrame {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
    /// A message type this server does not handle. Callers ignore it so newer
    /// clients can add message types without breaking older servers.
    Unknown(u32),
}

impl InboundFrame {
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            Self::Sync(_) => Some(MessageType::Sync),
            Self::Awareness(_) => Some(MessageType::Awareness),
            Self::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("failed to decode message type: {0}")]
    MessageType(#[source] read::Error),
    #[error("failed to decode sync message: {0}")]
    Sync(#[source] read::Error),
    #[error("failed to decode awareness update: {0}")]
    Awareness(#[source] read::Error),
}

/// Decode one inbound frame.
///
/// Only the leading type tag is interpreted for unknown message types; the
/// remainder of such frames is left untouched.
pub fn decode_frame(frame: &[u8]) -> Result<InboundFrame, ProtocolError> {
    if frame.is_empty() {
        return Err(ProtocolError::EmptyFrame);
    }

    let mut decoder = DecoderV1::new(Cursor::new(frame));
    let tag: u32 = decoder.read_var().map_err(ProtocolError::MessageType)?;

    match MessageType::from_tag(tag) {
        Some(MessageType::Sync) => {
            let message = SyncMessage::decode(&mut decoder).map_err(ProtocolError::Sync)?;
            Ok(InboundFrame::Sync(message))
        }
        Some(MessageType::Awareness) => {
            let payload = decoder.read_buf().map_err(ProtocolError::Awareness)?;
            let update = AwarenessUpdate::decode_v1(payload).map_err(ProtocolError::Awareness)?;
            Ok(InboundFrame::Awareness(update))
        }
        None => Ok(InboundFrame::Unknown(tag)),
    }
}

/// Sync step 1: announce the sender's state vector.
pub fn encode_sync_step1(state_vector: StateVector) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep1(state_vector)).encode_v1()
}

/// Sync step 2: the diff the receiver is missing.
pub fn encode_sync_step2(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::SyncStep2(update)).encode_v1()
}

/// An incremental document update.
pub fn encode_sync_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

pub fn encode_awareness(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use yrs::sync::awareness::AwarenessUpdateEntry;
    use yrs::sync::{AwarenessUpdate, SyncMessage};
    use yrs::updates::encoder::Encode;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

    use super::*;

    #[test]
    fn sync_step1_round_trips_state_vector() {
        let doc = Doc::with_client_id(3);
        let text = doc.get_or_insert_text("content");
        text.push(&mut doc.transact_mut(), "hello");
        let state_vector = doc.transact().state_vector();

        let frame = encode_sync_step1(state_vector.clone());
        assert_eq!(frame[0], MESSAGE_SYNC as u8);

        match decode_frame(&frame).expect("step 1 frame should decode") {
            InboundFrame::Sync(SyncMessage::SyncStep1(decoded)) => {
                assert_eq!(decoded, state_vector);
            }
            other => panic!("expected sync step 1, got {other:?}"),
        }
    }

    #[test]
    fn sync_update_payload_applies_to_another_doc() {
        let source = Doc::with_client_id(1);
        let update = {
            let text = source.get_or_insert_text("content");
            let mut txn = source.transact_mut();
            text.push(&mut txn, "shared");
            txn.encode_update_v1()
        };

        let frame = encode_sync_update(update);
        let InboundFrame::Sync(SyncMessage::Update(payload)) =
            decode_frame(&frame).expect("update frame should decode")
        else {
            panic!("expected sync update");
        };

        let target = Doc::with_client_id(2);
        target
            .transact_mut()
            .apply_update(Update::decode_v1(&payload).expect("payload should be a v1 update"))
            .expect("update should apply");
        let text = target.get_or_insert_text("content");
        assert_eq!(text.get_string(&target.transact()), "shared");
    }

    #[test]
    fn awareness_frame_decodes_client_entries() {
        let mut clients = HashMap::new();
        clients.insert(42, AwarenessUpdateEntry { clock: 1, json: r#"{"cursor":5}"#.into() });
        let frame = encode_awareness(AwarenessUpdate { clients });
        assert_eq!(frame[0], MESSAGE_AWARENESS as u8);

        let InboundFrame::Awareness(update) =
            decode_frame(&frame).expect("awareness frame should decode")
        else {
            panic!("expected awareness frame");
        };
        let entry = update.clients.get(&42).expect("client 42 should be present");
        assert_eq!(entry.clock, 1);
        assert_eq!(&*entry.json, r#"{"cursor":5}"#);
    }

    #[test]
    fn unknown_message_type_is_reported_not_rejected() {
        let frame = [7u8, 1, 2, 3];
        let decoded = decode_frame(&frame).expect("unknown type should not be an error");
        assert!(matches!(decoded, InboundFrame::Unknown(7)));
        assert_eq!(decoded.message_type(), None);
    }

    #[test]
    fn empty_and_truncated_frames_are_errors() {
        assert!(matches!(decode_frame(&[]), Err(ProtocolError::EmptyFrame)));
        assert!(matches!(decode_frame(&[MESSAGE_SYNC as u8]), Err(ProtocolError::Sync(_))));
        assert!(matches!(
            decode_frame(&[MESSAGE_AWARENESS as u8, 10, 1]),
            Err(ProtocolError::Awareness(_))
        ));
    }

    #[test]
    fn message_type_tags_match_wire_values() {
        assert_eq!(MessageType::Sync.tag(), 0);
        assert_eq!(MessageType::Awareness.tag(), 1);
        assert_eq!(MessageType::from_tag(2), None);
        assert_eq!(encode_sync_step2(Vec::new())[0], 0);
    }
}
