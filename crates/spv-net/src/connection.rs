//! Per-peer connection handling.
//!
//! Each connection runs as its own task owning the socket, the framed codec
//! and all of its timers, so dropping the task releases every resource on
//! any exit path. The task reports upward through [`PeerEvent`] and accepts
//! [`PeerCommand`] from the client.
//!
//! Handshake: `version` is sent the moment the TCP connection opens; the
//! remote's `version` is answered with `verack`; the remote's `verack`
//! completes the handshake and fires `PeerEvent::Connected` exactly once.
//! After that a ping heartbeat runs until the connection dies.

use crate::codec::MessageCodec;
use crate::message::{BlockLocator, Inv, Message, NetAddr, VersionMessage, VersionNetAddr};
use crate::peer::Peer;
use crate::{NetworkError, NetworkResult};
use futures::{SinkExt, StreamExt};
use spv_chain::{BlockHeader, Hash, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Network magic for the codec.
    pub magic: u32,
    /// Protocol version to advertise.
    pub protocol_version: i32,
    /// User agent for the `version` message.
    pub user_agent: String,
    /// Service bitmap to advertise; zero for a leaf client.
    pub services: u64,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Deadline for completing the version/verack exchange.
    pub handshake_timeout: Duration,
    /// Heartbeat ping interval.
    pub ping_interval: Duration,
    /// Deadline for the matching pong.
    pub pong_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            magic: spv_chain::Network::Testnet.magic(),
            protocol_version: PROTOCOL_VERSION,
            user_agent: concat!("/spv:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            services: 0,
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

/// Events a connection task reports to the client.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed in both directions; fired exactly once.
    Connected { addr: SocketAddr, peer: Peer },
    /// Gossiped peer addresses arrived.
    Addrs {
        addr: SocketAddr,
        entries: Vec<NetAddr>,
    },
    /// A `headers` reply arrived.
    Headers {
        addr: SocketAddr,
        headers: Vec<BlockHeader>,
    },
    /// Inventory announcements arrived.
    Invs {
        addr: SocketAddr,
        entries: Vec<Inv>,
    },
    /// The connection finished; always the final event for `addr`.
    Closed { addr: SocketAddr, reason: String },
}

/// Commands the client may issue to a connection task.
#[derive(Debug)]
pub enum PeerCommand {
    /// Request headers after the most recent locator match.
    GetHeaders {
        locator: Vec<Hash>,
        hash_stop: Hash,
    },
    /// Request a single inventory object.
    GetData(Inv),
    /// Close the connection.
    Shutdown,
}

/// A P2P connection over any byte stream.
pub struct Connection<S> {
    addr: SocketAddr,
    framed: Framed<S, MessageCodec>,
    config: ConnectionConfig,
    start_height: i32,
    peer: Peer,
    our_nonce: u64,
    have_version: bool,
    have_verack: bool,
    announced: bool,
    ping_nonce: Option<u64>,
    pong_deadline: Option<Instant>,
}

impl Connection<TcpStream> {
    /// Dial a peer, bounded by the connect timeout.
    pub async fn connect(
        addr: SocketAddr,
        start_height: i32,
        config: ConnectionConfig,
    ) -> NetworkResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Timeout(format!("connect to {}", addr)))?
            .map_err(NetworkError::Io)?;
        debug!(%addr, "connected to peer");
        Ok(Self::new(stream, addr, start_height, config))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    /// Wrap an established stream.
    pub fn new(stream: S, addr: SocketAddr, start_height: i32, config: ConnectionConfig) -> Self {
        let framed = Framed::new(stream, MessageCodec::new(config.magic));
        Self {
            addr,
            framed,
            config,
            start_height,
            peer: Peer::new(addr),
            our_nonce: rand::random(),
            have_version: false,
            have_verack: false,
            announced: false,
            ping_nonce: None,
            pong_deadline: None,
        }
    }

    /// Handshake completed in both directions.
    pub fn connected(&self) -> bool {
        self.have_version && self.have_verack
    }

    /// Peer identity, completed once its `version` arrived.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Send an application message; rejected until the handshake completes.
    pub async fn send_app(&mut self, message: Message) -> NetworkResult<()> {
        if !self.connected() {
            return Err(NetworkError::NotConnected);
        }
        self.framed.send(message).await
    }

    /// Run the connection until it closes, reporting the exit upward.
    pub async fn run(
        mut self,
        events: mpsc::Sender<PeerEvent>,
        mut commands: mpsc::Receiver<PeerCommand>,
    ) {
        let addr = self.addr;
        let reason = match self.drive(&events, &mut commands).await {
            Ok(reason) => reason,
            Err(e) => e.to_string(),
        };
        let _ = self.framed.get_mut().shutdown().await;
        debug!(%addr, %reason, "connection finished");
        let _ = events.send(PeerEvent::Closed { addr, reason }).await;
    }

    async fn drive(
        &mut self,
        events: &mpsc::Sender<PeerEvent>,
        commands: &mut mpsc::Receiver<PeerCommand>,
    ) -> NetworkResult<String> {
        self.send_version().await?;

        let handshake_deadline = Instant::now() + self.config.handshake_timeout;
        let mut ping_timer = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(message)) => self.handle_message(message, events).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Ok("closed by peer".to_string()),
                },

                command = commands.recv() => match command {
                    Some(PeerCommand::GetHeaders { locator, hash_stop }) => {
                        self.send_app(Message::GetHeaders(BlockLocator {
                            version: self.config.protocol_version as u32,
                            locator,
                            hash_stop,
                        }))
                        .await?;
                    }
                    Some(PeerCommand::GetData(inv)) => {
                        self.send_app(Message::GetData(vec![inv])).await?;
                    }
                    Some(PeerCommand::Shutdown) | None => {
                        return Ok("shutdown".to_string());
                    }
                },

                _ = sleep_until(handshake_deadline), if !self.connected() => {
                    return Err(NetworkError::Timeout("handshake".to_string()));
                }

                _ = ping_timer.tick(), if self.connected() => {
                    let nonce = rand::random::<u64>();
                    self.ping_nonce = Some(nonce);
                    self.pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    debug!(addr = %self.addr, nonce, "sending heartbeat ping");
                    self.framed.send(Message::Ping(nonce)).await?;
                }

                _ = wait_for(self.pong_deadline), if self.pong_deadline.is_some() => {
                    return Err(NetworkError::Timeout("pong".to_string()));
                }
            }
        }
    }

    async fn send_version(&mut self) -> NetworkResult<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let version = VersionMessage {
            version: self.config.protocol_version,
            services: self.config.services,
            timestamp,
            receiver: VersionNetAddr {
                services: 0,
                addr: self.addr,
            },
            sender: VersionNetAddr::unspecified(),
            nonce: self.our_nonce,
            user_agent: self.config.user_agent.clone(),
            start_height: self.start_height,
            relay: false,
        };
        self.framed.send(Message::Version(version)).await
    }

    async fn handle_message(
        &mut self,
        message: Message,
        events: &mpsc::Sender<PeerEvent>,
    ) -> NetworkResult<()> {
        match message {
            Message::Version(version) => self.handle_version(version, events).await,
            Message::Verack => {
                // Repeated veracks are harmless.
                self.have_verack = true;
                self.maybe_connected(events).await
            }
            Message::Ping(nonce) => {
                if self.connected() {
                    self.framed.send(Message::Pong(nonce)).await?;
                } else {
                    debug!(addr = %self.addr, "ignoring ping before handshake");
                }
                Ok(())
            }
            Message::Pong(nonce) => {
                match self.ping_nonce {
                    Some(expected) if expected == nonce => {
                        self.ping_nonce = None;
                        self.pong_deadline = None;
                    }
                    _ => warn!(addr = %self.addr, nonce, "ignoring unexpected pong"),
                }
                Ok(())
            }
            Message::Addr(entries) => {
                if self.connected() {
                    let _ = events
                        .send(PeerEvent::Addrs {
                            addr: self.addr,
                            entries,
                        })
                        .await;
                } else {
                    debug!(addr = %self.addr, "ignoring addr before handshake");
                }
                Ok(())
            }
            Message::Headers(headers) => {
                if self.connected() {
                    let _ = events
                        .send(PeerEvent::Headers {
                            addr: self.addr,
                            headers,
                        })
                        .await;
                } else {
                    debug!(addr = %self.addr, "ignoring headers before handshake");
                }
                Ok(())
            }
            Message::Inv(entries) => {
                if self.connected() {
                    let _ = events
                        .send(PeerEvent::Invs {
                            addr: self.addr,
                            entries,
                        })
                        .await;
                } else {
                    debug!(addr = %self.addr, "ignoring inv before handshake");
                }
                Ok(())
            }
            Message::Reject(reject) => {
                warn!(
                    addr = %self.addr,
                    message = %reject.message,
                    code = ?reject.code,
                    reason = %reject.reason,
                    "peer rejected our message"
                );
                if reject.message == "version" {
                    return Err(NetworkError::ProtocolViolation(
                        "peer rejected our version".to_string(),
                    ));
                }
                Ok(())
            }
            Message::GetAddr
            | Message::GetHeaders(_)
            | Message::GetBlocks(_)
            | Message::GetData(_)
            | Message::Mempool
            | Message::SendHeaders => {
                // Leaf client; we consume headers but serve nothing.
                debug!(
                    addr = %self.addr,
                    command = message.command().as_str(),
                    "ignoring peer request"
                );
                Ok(())
            }
            Message::Unknown {
                command,
                payload_len,
            } => {
                debug!(addr = %self.addr, command, payload_len, "ignoring unknown command");
                Ok(())
            }
        }
    }

    async fn handle_version(
        &mut self,
        version: VersionMessage,
        events: &mpsc::Sender<PeerEvent>,
    ) -> NetworkResult<()> {
        if self.have_version {
            debug!(addr = %self.addr, "ignoring duplicate version");
            return Ok(());
        }
        self.peer = Peer {
            addr: self.addr,
            services: version.services,
            version: version.version,
            user_agent: version.user_agent,
            start_height: version.start_height,
            nonce: version.nonce,
        };
        self.have_version = true;
        info!(
            addr = %self.addr,
            agent = %self.peer.user_agent,
            version = self.peer.version,
            height = self.peer.start_height,
            "peer version received"
        );
        self.framed.send(Message::Verack).await?;
        self.maybe_connected(events).await
    }

    async fn maybe_connected(&mut self, events: &mpsc::Sender<PeerEvent>) -> NetworkResult<()> {
        if self.connected() && !self.announced {
            self.announced = true;
            // Harvest peer addresses as soon as the peer will talk to us.
            self.framed.send(Message::GetAddr).await?;
            let _ = events
                .send(PeerEvent::Connected {
                    addr: self.addr,
                    peer: self.peer.clone(),
                })
                .await;
        }
        Ok(())
    }
}

/// Sleep until an optional deadline; pends forever when unarmed. Callers
/// pair this with a `select!` guard on `is_some()`.
pub(crate) async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => futures::future::pending().await,
    }
}
