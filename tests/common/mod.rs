#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use duet::negotiation::{PeerLink, PeerLinkError};
use duet::signaling::{IceCandidate, RoomId, RoomRegistryHandle, SessionDescription, SignalingServer};

pub const WAIT: Duration = Duration::from_secs(5);

/// Start a server on an ephemeral port; returns its ws:// url
pub async fn start_server() -> (String, RoomRegistryHandle) {
    let server = SignalingServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    tokio::spawn(server.run());
    (format!("ws://{}", addr), registry)
}

/// Poll the registry until `room` holds `count` members
pub async fn wait_for_members(registry: &RoomRegistryHandle, room: &str, count: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            let members = registry.members(RoomId::from(room)).await.unwrap();
            if members.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room {} never reached {} members", room, count));
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    StartMedia,
    CreateOffer,
    CreateAnswer,
    SetLocal(SessionDescription),
    SetRemote(SessionDescription),
    AddCandidate(String),
    StopMedia,
    Close,
}

/// Media link stand-in that records every call
#[derive(Clone, Default)]
pub struct RecordingLink {
    pub name: &'static str,
    pub ops: Arc<Mutex<Vec<Op>>>,
    pub deny_media: bool,
    /// `create_offer` never completes
    pub stall_offer: bool,
}

impl RecordingLink {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    fn push(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    /// Poll until `pred` holds for the recorded ops
    pub async fn wait_until<F: Fn(&[Op]) -> bool>(&self, pred: F) {
        tokio::time::timeout(WAIT, async {
            loop {
                if pred(&self.ops()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{}: condition never met, ops: {:?}", self.name, self.ops()));
    }
}

impl PeerLink for RecordingLink {
    async fn start_local_media(&mut self) -> Result<(), PeerLinkError> {
        if self.deny_media {
            return Err(PeerLinkError::Media("permission denied".into()));
        }
        self.push(Op::StartMedia);
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, PeerLinkError> {
        self.push(Op::CreateOffer);
        if self.stall_offer {
            std::future::pending::<()>().await;
        }
        Ok(SessionDescription::offer(format!("offer-from-{}", self.name)))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, PeerLinkError> {
        self.push(Op::CreateAnswer);
        Ok(SessionDescription::answer(format!("answer-from-{}", self.name)))
    }

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), PeerLinkError> {
        self.push(Op::SetLocal(desc));
        Ok(())
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), PeerLinkError> {
        self.push(Op::SetRemote(desc));
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), PeerLinkError> {
        self.push(Op::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn stop_local_media(&mut self) {
        self.push(Op::StopMedia);
    }

    fn close(&mut self) {
        self.push(Op::Close);
    }
}
