//! WebSocket signaling relay pairing two clients per room

mod messages;
mod registry;
mod router;
mod server;
mod types;

pub use messages::{IceCandidate, SdpType, SessionDescription, SignalMessage, Translation};
pub use registry::{JoinOutcome, MemberInfo, ROOM_CAPACITY, RoomRegistryHandle, RoomTable};
pub use router::{DropReason, Route, classify, dispatch};
pub use server::{DEFAULT_SIGNALING_PORT, SignalingServer};
pub use types::{ConnectionId, OutboundMessage, PeerSender, Role, RoomId, SignalingError};
