use std::future::Future;

use thiserror::Error;

use crate::signaling::{IceCandidate, SessionDescription};

/// Failures reported by the media library
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerLinkError {
    #[error("local media unavailable: {0}")]
    Media(String),

    #[error("session description rejected: {0}")]
    Description(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("peer link closed")]
    Closed,
}

/// Connectivity state as reported by the media library
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Things the media library tells the call while it runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A locally gathered candidate; `None` once gathering is complete
    LocalCandidate(Option<IceCandidate>),
    StateChanged(LinkState),
}

/// The peer-to-peer media connection the negotiation drives.
///
/// Implemented on top of whatever WebRTC stack the application uses; the
/// negotiation only needs description and candidate plumbing plus teardown.
/// Asynchronous events (local candidates, state changes) are delivered
/// separately as [`LinkEvent`]s.
pub trait PeerLink: Send {
    /// Acquire camera/microphone and attach the tracks to the link
    fn start_local_media(&mut self) -> impl Future<Output = Result<(), PeerLinkError>> + Send;

    fn create_offer(
        &mut self,
    ) -> impl Future<Output = Result<SessionDescription, PeerLinkError>> + Send;

    fn create_answer(
        &mut self,
    ) -> impl Future<Output = Result<SessionDescription, PeerLinkError>> + Send;

    fn set_local_description(
        &mut self,
        desc: SessionDescription,
    ) -> impl Future<Output = Result<(), PeerLinkError>> + Send;

    fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> impl Future<Output = Result<(), PeerLinkError>> + Send;

    fn add_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> impl Future<Output = Result<(), PeerLinkError>> + Send;

    /// Stop every local track. Must be safe to call more than once.
    fn stop_local_media(&mut self);

    /// Close the connection. Must be safe to call more than once.
    fn close(&mut self);
}
