//! Client side of a call: the offer/answer handshake driven by relayed messages

mod client;
mod link;
mod state;

pub use client::{CallClient, CallError, CallEvent, CallHandle, CallStatus};
pub use link::{LinkEvent, LinkState, PeerLink, PeerLinkError};
pub use state::{CandidateBuffer, NegotiationSession, NegotiationState};
