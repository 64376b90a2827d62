use std::fmt;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::link::{LinkEvent, PeerLink, PeerLinkError};
use super::state::{NegotiationSession, NegotiationState};
use crate::signaling::{Role, RoomId, SignalMessage, Translation};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long a hang-up waits for the close handshake to go out
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CallError {
    #[error("please enter a meeting id to join")]
    EmptyRoomId,

    #[error("signaling channel error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("camera or microphone access denied: {0}")]
    Media(#[source] PeerLinkError),
}

/// Progress of a call, in the words shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    WaitingForPeer(RoomId),
    OfferSent,
    WaitingForOffer,
    AnswerSent,
    AnswerReceived,
    Connected,
    PeerDisconnected,
    Failed,
    Rejected(String),
    ConnectionLost,
    Ended,
}

impl CallStatus {
    fn from_state(state: &NegotiationState) -> Option<Self> {
        Some(match state {
            NegotiationState::Idle | NegotiationState::AwaitingRole { .. } => return None,
            NegotiationState::Offering { .. } => CallStatus::OfferSent,
            NegotiationState::AwaitingOffer { .. } => CallStatus::WaitingForOffer,
            NegotiationState::DescriptionExchanged { role: Role::Callee } => {
                CallStatus::AnswerSent
            }
            NegotiationState::DescriptionExchanged { role: Role::Caller } => {
                CallStatus::AnswerReceived
            }
            NegotiationState::Connected { .. } => CallStatus::Connected,
            NegotiationState::Failed => CallStatus::Failed,
            NegotiationState::PeerDisconnected { .. } => CallStatus::PeerDisconnected,
            NegotiationState::Disconnected => CallStatus::ConnectionLost,
        })
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::WaitingForPeer(room) => {
                write!(f, "Joined room {}. Waiting for peer...", room)
            }
            CallStatus::OfferSent => f.write_str("Offer sent. Waiting for answer..."),
            CallStatus::WaitingForOffer => f.write_str("Ready. Waiting for offer..."),
            CallStatus::AnswerSent => f.write_str("Answer sent. Establishing connection..."),
            CallStatus::AnswerReceived => {
                f.write_str("Answer received. Establishing connection...")
            }
            CallStatus::Connected => f.write_str("Connected. Streaming media..."),
            CallStatus::PeerDisconnected => f.write_str("Peer disconnected."),
            CallStatus::Failed => f.write_str("Connection failed."),
            CallStatus::Rejected(reason) => write!(f, "Could not join: {}.", reason),
            CallStatus::ConnectionLost => f.write_str("Connection lost."),
            CallStatus::Ended => f.write_str("Call ended."),
        }
    }
}

/// What the call reports back to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Status(CallStatus),
    /// Translation relayed from the other participant
    Translation(Translation),
}

enum CallCommand {
    SendTranslation(Translation),
}

/// Connects to a signaling server and runs one call at a time
#[derive(Debug, Clone)]
pub struct CallClient {
    url: String,
}

impl CallClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Start a call in a new room. Without an id a short one is generated.
    pub async fn create_room<L>(
        &self,
        room: Option<RoomId>,
        link: L,
        link_events: async_channel::Receiver<LinkEvent>,
    ) -> Result<CallHandle, CallError>
    where
        L: PeerLink + 'static,
    {
        let room = room
            .filter(|r| !r.as_str().trim().is_empty())
            .unwrap_or_else(RoomId::generate);
        info!("Room created: {}", room);
        self.join_room(room, link, link_events).await
    }

    /// Join the room `room`, creating it on the server if nobody is there yet
    pub async fn join_room<L>(
        &self,
        room: RoomId,
        mut link: L,
        link_events: async_channel::Receiver<LinkEvent>,
    ) -> Result<CallHandle, CallError>
    where
        L: PeerLink + 'static,
    {
        let room = RoomId::from(room.as_str().trim());
        if room.is_empty() {
            return Err(CallError::EmptyRoomId);
        }

        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut ws_tx, ws_rx) = ws.split();

        if let Err(e) = link.start_local_media().await {
            warn!("Local media unavailable: {}", e);
            link.close();
            let _ = ws_tx.close().await;
            return Err(CallError::Media(e));
        }

        let mut session = NegotiationSession::new();
        send_signal(&mut ws_tx, &SignalMessage::Join { room: room.clone() }).await?;
        session.start();
        info!("Joined room {}. Waiting for peer...", room);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = oneshot::channel();

        let _ = events_tx.send(CallEvent::Status(CallStatus::WaitingForPeer(room.clone())));

        let call = Call {
            session,
            link,
            ws_tx,
            ws_rx,
            link_events,
            commands: cmd_rx,
            events: events_tx,
        };
        let task = tokio::spawn(call.run(end_rx));

        Ok(CallHandle {
            room,
            end_tx: Some(end_tx),
            commands: cmd_tx,
            events: events_rx,
            task: Some(task),
        })
    }
}

/// Control over a running call. Dropping it ends the call.
pub struct CallHandle {
    room: RoomId,
    end_tx: Option<oneshot::Sender<()>>,
    commands: mpsc::UnboundedSender<CallCommand>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    task: Option<JoinHandle<()>>,
}

impl CallHandle {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Next status change or relayed translation; `None` once the call is over
    pub async fn next_event(&mut self) -> Option<CallEvent> {
        self.events.recv().await
    }

    /// Relay a translated transcript to the other participant
    pub fn send_translation(&self, translation: Translation) -> bool {
        self.commands
            .send(CallCommand::SendTranslation(translation))
            .is_ok()
    }

    /// Hang up: interrupts any negotiation step in progress and releases
    /// media, peer link and signaling channel.
    pub async fn end_call(mut self) {
        if let Some(end_tx) = self.end_tx.take() {
            let _ = end_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

enum Exit {
    Ended,
    ChannelLost,
}

struct Call<L> {
    session: NegotiationSession,
    link: L,
    ws_tx: WsSink,
    ws_rx: WsSource,
    link_events: async_channel::Receiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    events: mpsc::UnboundedSender<CallEvent>,
}

impl<L: PeerLink + 'static> Call<L> {
    async fn run(mut self, mut end_rx: oneshot::Receiver<()>) {
        let exit = self.event_loop(&mut end_rx).await;

        if let Exit::ChannelLost = exit {
            self.session.on_channel_lost();
            self.emit(CallStatus::ConnectionLost);
            // hold media until the application hangs up
            let _ = (&mut end_rx).await;
        }

        self.session.end(&mut self.link);
        if tokio::time::timeout(CLOSE_TIMEOUT, self.ws_tx.close())
            .await
            .is_err()
        {
            debug!("Signaling channel did not close in time, dropping it");
        }
        self.emit(CallStatus::Ended);
        info!("Call ended");
    }

    async fn event_loop(&mut self, end_rx: &mut oneshot::Receiver<()>) -> Exit {
        let mut link_open = true;
        let mut commands_open = true;

        loop {
            tokio::select! {
                biased;

                _ = &mut *end_rx => return Exit::Ended,

                frame = self.ws_rx.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => return Exit::ChannelLost,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("Signaling channel error: {}", e);
                            return Exit::ChannelLost;
                        }
                    };

                    let before = self.session.state().clone();
                    let reply = tokio::select! {
                        biased;
                        _ = &mut *end_rx => return Exit::Ended,
                        reply = self.handle_frame(text.as_str()) => reply,
                    };
                    if let Some(reply) = reply
                        && let Some(exit) = self.send(&reply, end_rx).await
                    {
                        return exit;
                    }
                    self.report_transition(&before);
                }

                event = self.link_events.recv(), if link_open => match event {
                    Ok(LinkEvent::LocalCandidate(candidate)) => {
                        if let Some(msg) = self.session.on_local_candidate(candidate)
                            && let Some(exit) = self.send(&msg, end_rx).await
                        {
                            return exit;
                        }
                    }
                    Ok(LinkEvent::StateChanged(link_state)) => {
                        let before = self.session.state().clone();
                        self.session.on_link_state(link_state);
                        self.report_transition(&before);
                    }
                    Err(_) => link_open = false,
                },

                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(CallCommand::SendTranslation(t)) => {
                        let msg = SignalMessage::Translation(t);
                        if let Some(exit) = self.send(&msg, end_rx).await {
                            return exit;
                        }
                    }
                    None => commands_open = false,
                },
            }
        }
    }

    /// Feed one relayed frame to the session; returns the reply to send
    async fn handle_frame(&mut self, text: &str) -> Option<SignalMessage> {
        let msg: SignalMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!("Ignoring malformed frame: {}", e);
                return None;
            }
        };

        match msg {
            SignalMessage::Ready { role } => self.session.on_ready(role, &mut self.link).await,
            SignalMessage::Offer { offer } => self.session.on_offer(offer, &mut self.link).await,
            SignalMessage::Answer { answer } => {
                self.session.on_answer(answer, &mut self.link).await;
                None
            }
            SignalMessage::Candidate { candidate } => {
                self.session.on_candidate(candidate, &mut self.link).await;
                None
            }
            SignalMessage::Translation(t) => {
                let _ = self.events.send(CallEvent::Translation(t));
                None
            }
            SignalMessage::Error { message } => {
                warn!("Server rejected join: {}", message);
                self.session.on_join_rejected();
                self.emit(CallStatus::Rejected(message));
                None
            }
            SignalMessage::Join { .. } | SignalMessage::Unknown => {
                debug!("Ignoring {} frame", msg.kind());
                None
            }
        }
    }

    /// Write one message, giving up as soon as the call is ended.
    /// `None` means the message went out.
    async fn send(
        &mut self,
        msg: &SignalMessage,
        end_rx: &mut oneshot::Receiver<()>,
    ) -> Option<Exit> {
        tokio::select! {
            biased;
            _ = &mut *end_rx => Some(Exit::Ended),
            sent = send_signal(&mut self.ws_tx, msg) => match sent {
                Ok(()) => None,
                Err(e) => {
                    warn!("Failed to send {}: {}", msg.kind(), e);
                    Some(Exit::ChannelLost)
                }
            },
        }
    }

    fn report_transition(&self, before: &NegotiationState) {
        let after = self.session.state();
        if after.name() == before.name() && after.role() == before.role() {
            return;
        }
        debug!("Negotiation {} -> {}", before, after);
        if let Some(status) = CallStatus::from_state(after) {
            self.emit(status);
        }
    }

    fn emit(&self, status: CallStatus) {
        info!("{}", status);
        let _ = self.events.send(CallEvent::Status(status));
    }
}

async fn send_signal(ws_tx: &mut WsSink, msg: &SignalMessage) -> Result<(), CallError> {
    let text = serde_json::to_string(msg)?;
    ws_tx.send(Message::Text(text.into())).await?;
    Ok(())
}
