//! Dispatch of inbound text frames by message kind

use tokio_tungstenite::tungstenite::Utf8Bytes;
use tracing::{debug, info};

use super::messages::SignalMessage;
use super::registry::{JoinOutcome, RoomRegistryHandle};
use super::types::{ConnectionId, OutboundMessage, PeerSender, RoomId, SignalingError};

/// Why a frame was dropped without effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not JSON, no `type` tag, or the payload has the wrong shape
    Malformed,
    /// `type` tag this server does not know
    UnknownType,
    /// Known kind that clients are not allowed to send (`ready`, `error`)
    NotRelayable,
}

/// What to do with one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Join(RoomId),
    Relay,
    Drop(DropReason),
}

/// Decide what an inbound frame means without touching any state
pub fn classify(text: &str) -> Route {
    let msg: SignalMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => return Route::Drop(DropReason::Malformed),
    };

    match msg {
        SignalMessage::Join { room } => Route::Join(room),
        SignalMessage::Offer { .. }
        | SignalMessage::Answer { .. }
        | SignalMessage::Candidate { .. }
        | SignalMessage::Translation(_) => Route::Relay,
        SignalMessage::Ready { .. } | SignalMessage::Error { .. } => {
            Route::Drop(DropReason::NotRelayable)
        }
        SignalMessage::Unknown => Route::Drop(DropReason::UnknownType),
    }
}

/// Route one text frame from `id`.
///
/// Relayed frames are forwarded byte-for-byte. A rejected join is answered
/// with an `error` message on the sender's own channel; everything else is
/// silent towards the sender.
pub async fn dispatch(
    text: Utf8Bytes,
    id: ConnectionId,
    tx: &PeerSender,
    registry: &RoomRegistryHandle,
) -> Result<(), SignalingError> {
    match classify(text.as_str()) {
        Route::Join(room) => match registry.join(room.clone(), id, tx.clone()).await {
            Ok(JoinOutcome::Ignored) => Ok(()),
            Ok(JoinOutcome::Waiting) => {
                debug!("{} waiting for a peer in room {}", id, room);
                Ok(())
            }
            Ok(JoinOutcome::Paired) => Ok(()),
            Err(e @ (SignalingError::RoomFull(_) | SignalingError::AlreadyInRoom(_))) => {
                info!("Join from {} rejected: {}", id, e);
                let err = SignalMessage::Error {
                    message: e.to_string(),
                };
                if let Ok(msg) = err.to_outbound() {
                    let _ = tx.send(msg);
                }
                Ok(())
            }
            Err(e) => Err(e),
        },

        Route::Relay => {
            registry.relay(&id, OutboundMessage::from(text)).await;
            Ok(())
        }

        Route::Drop(reason) => {
            debug!("Dropping frame from {}: {:?}", id, reason);
            Ok(())
        }
    }
}
