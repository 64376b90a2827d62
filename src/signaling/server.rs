use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

use super::registry::RoomRegistryHandle;
use super::router;
use super::types::{ConnectionId, OutboundMessage, PeerSender};

pub const DEFAULT_SIGNALING_PORT: u16 = 8080;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SignalingServer {
    listener: TcpListener,
    handle: RoomRegistryHandle,
}

impl SignalingServer {
    /// Bind the listener and spawn the room registry
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signaling server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            handle: RoomRegistryHandle::spawn(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> RoomRegistryHandle {
        self.handle.clone()
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let registry = self.handle.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, registry).await {
                    error!("Connection error from {}: {}", addr, e);
                }
            });
        }
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// One accepted client: its id, the sender the registry fans out to, and
/// the control lane for pings.
struct Connection {
    id: ConnectionId,
    tx: PeerSender,
    ctrl_tx: mpsc::UnboundedSender<Message>,
    registry: RoomRegistryHandle,
}

/// Whether the read loop keeps going after a frame
enum Flow {
    Continue,
    Stop,
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: RoomRegistryHandle,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, rx) = mpsc::unbounded_channel();
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    let writer = spawn_writer(ws_tx, rx, ctrl_rx);

    let conn = Connection {
        id: ConnectionId::generate(),
        tx,
        ctrl_tx,
        registry,
    };
    info!("WebSocket connection {} from {}", conn.id, addr);

    let mut liveness = Liveness::new();
    loop {
        let flow = tokio::select! {
            check = liveness.next() => conn.on_liveness(check),
            frame = ws_rx.next() => match frame {
                Some(Ok(msg)) => conn.on_frame(msg, &mut liveness).await,
                Some(Err(e)) => {
                    warn!("WebSocket error on {}: {}", conn.id, e);
                    Flow::Stop
                }
                None => Flow::Stop,
            },
        };
        if let Flow::Stop = flow {
            break;
        }
    }

    conn.registry.leave(&conn.id).await;
    writer.abort();
    info!("WebSocket disconnected: {}", conn.id);

    Ok(())
}

impl Connection {
    async fn on_frame(&self, msg: Message, liveness: &mut Liveness) -> Flow {
        match msg {
            Message::Text(text) => {
                if let Err(e) = router::dispatch(text, self.id, &self.tx, &self.registry).await {
                    warn!("Message handling error on {}: {}", self.id, e);
                }
            }
            Message::Pong(_) => {
                liveness.pong_received();
                debug!("Pong received from {}", self.id);
            }
            Message::Close(_) => {
                info!("Close received from {}", self.id);
                return Flow::Stop;
            }
            // the protocol is text only
            Message::Binary(data) => {
                debug!("Dropping {}-byte binary frame from {}", data.len(), self.id);
            }
            Message::Ping(_) | Message::Frame(_) => {}
        }
        Flow::Continue
    }

    fn on_liveness(&self, check: LivenessCheck) -> Flow {
        match check {
            LivenessCheck::PingDue => {
                if self.ctrl_tx.send(Message::Ping(Bytes::new())).is_err() {
                    return Flow::Stop;
                }
                debug!("Ping sent to {}", self.id);
                Flow::Continue
            }
            LivenessCheck::Silent => {
                warn!("No pong from {} within {:?}, disconnecting", self.id, PONG_TIMEOUT);
                Flow::Stop
            }
        }
    }
}

/// Forward relayed messages and control frames to the socket until the
/// socket fails or both lanes close. Control frames go first.
fn spawn_writer(
    mut ws_tx: WsSink,
    mut rx: mpsc::UnboundedReceiver<OutboundMessage>,
    mut ctrl_rx: mpsc::UnboundedReceiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                biased;
                Some(ctrl) = ctrl_rx.recv() => ctrl,
                Some(out) = rx.recv() => Message::Text(out.into_inner()),
                else => break,
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    })
}

enum LivenessCheck {
    PingDue,
    /// A ping went unanswered
    Silent,
}

/// Ping every `PING_INTERVAL`; a ping not answered within `PONG_TIMEOUT`
/// marks the peer dead.
struct Liveness {
    interval: Interval,
    pong_deadline: Option<Instant>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            interval: tokio::time::interval(PING_INTERVAL),
            pong_deadline: None,
        }
    }

    async fn next(&mut self) -> LivenessCheck {
        let deadline = self.pong_deadline;
        let overdue = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = self.interval.tick() => {
                if self.pong_deadline.is_some() {
                    return LivenessCheck::Silent;
                }
                self.pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
                LivenessCheck::PingDue
            }
            _ = overdue => LivenessCheck::Silent,
        }
    }

    fn pong_received(&mut self) {
        self.pong_deadline = None;
    }
}
