use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::SignalMessage;
use super::types::{ConnectionId, OutboundMessage, PeerSender, Role, RoomId, SignalingError};

/// Two participants per room: one caller, one callee
pub const ROOM_CAPACITY: usize = 2;

const COMMAND_QUEUE: usize = 1024;

/// Result of a successful join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Room id was empty; nothing happened
    Ignored,
    /// Joined, alone in the room
    Waiting,
    /// Joined as the second member; both members were sent `ready`
    Paired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: ConnectionId,
    /// Set once the room pairs up, never changed afterwards
    pub role: Option<Role>,
}

#[derive(Debug)]
struct Member {
    id: ConnectionId,
    role: Option<Role>,
    tx: PeerSender,
}

#[derive(Debug, Default)]
struct Room {
    members: Vec<Member>,
}

/// Room membership state. Owned by the registry actor; every method is one
/// atomic step with respect to the others.
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: HashMap<RoomId, Room>,
    memberships: HashMap<ConnectionId, RoomId>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to `room`, creating the room if needed.
    ///
    /// When the room reaches two members, roles are assigned by arrival order
    /// and each member is sent a `ready` carrying its own role.
    pub fn join(
        &mut self,
        room: RoomId,
        id: ConnectionId,
        tx: PeerSender,
    ) -> Result<JoinOutcome, SignalingError> {
        if room.is_empty() {
            debug!("Ignoring join with empty room id from {}", id);
            return Ok(JoinOutcome::Ignored);
        }

        if let Some(current) = self.memberships.get(&id) {
            return Err(SignalingError::AlreadyInRoom(current.clone()));
        }

        let entry = self.rooms.entry(room.clone()).or_default();
        if entry.members.len() >= ROOM_CAPACITY {
            return Err(SignalingError::RoomFull(room));
        }

        entry.members.push(Member { id, role: None, tx });
        self.memberships.insert(id, room.clone());
        info!("Connection {} joined room {}", id, room);

        if entry.members.len() < ROOM_CAPACITY {
            return Ok(JoinOutcome::Waiting);
        }

        for (index, member) in entry.members.iter_mut().enumerate() {
            let role = Role::for_position(index);
            member.role = Some(role);

            match (SignalMessage::Ready { role }).to_outbound() {
                Ok(msg) => {
                    let _ = member.tx.send(msg);
                }
                Err(e) => warn!("Failed to encode ready for {}: {}", member.id, e),
            }
        }
        info!("Room {} paired", room);

        Ok(JoinOutcome::Paired)
    }

    /// Remove `id` from its room, dropping the room once empty.
    /// Returns the room it was in, if any.
    pub fn leave(&mut self, id: &ConnectionId) -> Option<RoomId> {
        let code = self.memberships.remove(id)?;

        if let Some(room) = self.rooms.get_mut(&code) {
            room.members.retain(|m| m.id != *id);

            if room.members.is_empty() {
                self.rooms.remove(&code);
                info!("Room {} removed (empty)", code);
            }
        }
        info!("Connection {} left room {}", id, code);
        Some(code)
    }

    /// Forward `msg` to every other member of the sender's room.
    /// Returns how many members it was handed to.
    pub fn relay(&self, from: &ConnectionId, msg: &OutboundMessage) -> usize {
        let Some(room) = self
            .memberships
            .get(from)
            .and_then(|code| self.rooms.get(code))
        else {
            debug!("Dropping relay from {}: not in a room", from);
            return 0;
        };

        let mut delivered = 0;
        for member in room.members.iter().filter(|m| m.id != *from) {
            if member.tx.send(msg.clone()).is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            debug!("Dropping relay from {}: no other member", from);
        }
        delivered
    }

    pub fn room_of(&self, id: &ConnectionId) -> Option<&RoomId> {
        self.memberships.get(id)
    }

    pub fn members(&self, room: &RoomId) -> Vec<MemberInfo> {
        self.rooms
            .get(room)
            .map(|r| {
                r.members
                    .iter()
                    .map(|m| MemberInfo {
                        id: m.id,
                        role: m.role,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// Commands sent to the room registry actor
pub(crate) enum RoomCommand {
    Join {
        room: RoomId,
        id: ConnectionId,
        peer_tx: PeerSender,
        reply: oneshot::Sender<Result<JoinOutcome, SignalingError>>,
    },
    Leave {
        id: ConnectionId,
    },
    Relay {
        from: ConnectionId,
        msg: OutboundMessage,
    },
    Members {
        room: RoomId,
        reply: oneshot::Sender<Vec<MemberInfo>>,
    },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
}

pub(crate) async fn room_registry_actor(mut rx: mpsc::Receiver<RoomCommand>) {
    let mut table = RoomTable::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RoomCommand::Join {
                room,
                id,
                peer_tx,
                reply,
            } => {
                let _ = reply.send(table.join(room, id, peer_tx));
            }

            RoomCommand::Leave { id } => {
                table.leave(&id);
            }

            RoomCommand::Relay { from, msg } => {
                table.relay(&from, &msg);
            }

            RoomCommand::Members { room, reply } => {
                let _ = reply.send(table.members(&room));
            }

            RoomCommand::RoomCount { reply } => {
                let _ = reply.send(table.room_count());
            }
        }
    }
}

/// Handle to communicate with the room registry actor
#[derive(Clone)]
pub struct RoomRegistryHandle {
    pub(crate) tx: mpsc::Sender<RoomCommand>,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor on the current runtime
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<RoomCommand>(COMMAND_QUEUE);
        tokio::spawn(room_registry_actor(rx));
        Self { tx }
    }

    /// Join (or create) a room
    pub async fn join(
        &self,
        room: RoomId,
        id: ConnectionId,
        peer_tx: PeerSender,
    ) -> Result<JoinOutcome, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RoomCommand::Join {
                room,
                id,
                peer_tx,
                reply: reply_tx,
            })
            .await;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))?
    }

    /// Leave whatever room the connection is in
    pub async fn leave(&self, id: &ConnectionId) {
        let _ = self.tx.send(RoomCommand::Leave { id: *id }).await;
    }

    /// Fan `msg` out to the other members of the sender's room
    pub async fn relay(&self, from: &ConnectionId, msg: OutboundMessage) {
        let _ = self.tx.send(RoomCommand::Relay { from: *from, msg }).await;
    }

    pub async fn members(&self, room: RoomId) -> Result<Vec<MemberInfo>, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RoomCommand::Members {
                room,
                reply: reply_tx,
            })
            .await;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }

    pub async fn room_count(&self) -> Result<usize, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.tx.send(RoomCommand::RoomCount { reply: reply_tx }).await;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("actor channel closed".to_string()))
    }
}
