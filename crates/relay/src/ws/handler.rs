// Inbound frame dispatch for one connection.

use cosync_common::protocol::ws::{decode_frame, InboundFrame, MessageType};
use tracing::{debug, warn};
use yrs::updates::encoder::Encode;

use crate::metrics;
use crate::sync::{ConnectionId, Session};

/// What happened to an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Applied,
    /// Unknown message type; left for newer servers.
    Ignored,
    /// Malformed or rejected; logged and dropped, the connection stays open.
    Dropped,
}

/// Decode one binary frame from `connection_id` and apply it to `session`.
///
/// Sync replies go to the sender alone, and only when the protocol produced
/// one. Document updates and awareness changes are broadcast by the session
/// itself.
pub fn handle_frame(
    session: &mut Session,
    connection_id: ConnectionId,
    frame: &[u8],
) -> FrameOutcome {
    let inbound = match decode_frame(frame) {
        Ok(inbound) => inbound,
        Err(error) => {
            warn!(doc = session.name(), connection_id, %error, "dropping malformed frame");
            metrics::record_frame_dropped();
            return FrameOutcome::Dropped;
        }
    };

    metrics::record_frame_received(message_type_label(inbound.message_type()));
    match inbound {
        InboundFrame::Sync(message) => {
            match session.handle_sync_message(message) {
                Ok(Some(reply)) => {
                    session.send_to(connection_id, reply.encode_v1());
                    FrameOutcome::Applied
                }
                Ok(None) => FrameOutcome::Applied,
                Err(error) => {
                    warn!(doc = session.name(), connection_id, ?error, "dropping sync frame");
                    metrics::record_frame_dropped();
                    FrameOutcome::Dropped
                }
            }
        }
        InboundFrame::Awareness(update) => {
            match session.handle_awareness_update(Some(connection_id), update) {
                Ok(()) => FrameOutcome::Applied,
                Err(error) => {
                    warn!(doc = session.name(), connection_id, ?error, "dropping awareness frame");
                    metrics::record_frame_dropped();
                    FrameOutcome::Dropped
                }
            }
        }
        InboundFrame::Unknown(tag) => {
            debug!(doc = session.name(), connection_id, tag, "ignoring unknown message type");
            FrameOutcome::Ignored
        }
    }
}

fn message_type_label(message_type: Option<MessageType>) -> &'static str {
    match message_type {
        Some(MessageType::Sync) => "sync",
        Some(MessageType::Awareness) => "awareness",
        None => "unknown",
    }
}
