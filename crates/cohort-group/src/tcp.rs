//! TCP transport
//!
//! Each channel is a TCP connection framed with a length-delimited codec and
//! carrying JSON-encoded [`Frame`]s. Before any frame is exchanged the
//! connecting side sends the protocol stack preamble; the accepting side
//! answers with its own preamble, or with [`STACK_FULL`] when it is at its
//! connection limit, and drops the connection on a mismatch.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cohort_core::PROTOCOL_VERSION;

use crate::error::{GroupError, GroupResult};
use crate::transport::{
    Channel, ChannelId, ChannelRef, Frame, SentCallback, Transport, TransportEvent,
    TransportEvents,
};

/// Preamble answered by a server that cannot take more connections
pub const STACK_FULL: &str = "cohort-group/full";

/// Largest accepted frame
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

fn stack_preamble() -> String {
    format!("cohort-group/{}", PROTOCOL_VERSION)
}

type WireFrame = Framed<TcpStream, LengthDelimitedCodec>;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Address the listener binds to
    pub bind_address: String,
    /// Timeout for connecting and for the preamble exchange
    pub connect_timeout: Duration,
    /// Inbound channel limit
    pub max_connections: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            connect_timeout: Duration::from_secs(2),
            max_connections: 64,
        }
    }
}

impl From<&cohort_core::config::GroupConfigSection> for TcpTransportConfig {
    fn from(section: &cohort_core::config::GroupConfigSection) -> Self {
        Self {
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            max_connections: section.max_connections,
            ..Default::default()
        }
    }
}

/// Transport over TCP connections
pub struct TcpTransport {
    config: TcpTransportConfig,
    shared: Arc<Shared>,
}

struct Shared {
    next_id: AtomicU64,
    inbound: AtomicUsize,
    events: Mutex<Option<TransportEvents>>,
    channels: Mutex<HashMap<ChannelId, Weak<TcpChannel>>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                inbound: AtomicUsize::new(0),
                events: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn events(&self) -> GroupResult<TransportEvents> {
        self.shared
            .events
            .lock()
            .clone()
            .ok_or_else(|| GroupError::Transport("transport not started".to_string()))
    }

    fn codec() -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec()
    }

    async fn accept_inbound(
        shared: Arc<Shared>,
        config: TcpTransportConfig,
        stream: TcpStream,
        remote: String,
        events: TransportEvents,
    ) -> GroupResult<()> {
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, Self::codec());

        let preamble = timeout(config.connect_timeout, framed.next())
            .await
            .map_err(|_| GroupError::ConnectTimeout(remote.clone()))?
            .ok_or_else(|| GroupError::Transport(format!("{} closed during preamble", remote)))??;

        let expected = stack_preamble();
        if preamble.as_ref() != expected.as_bytes() {
            framed.send(Bytes::from(expected.clone())).await?;
            return Err(GroupError::StackMismatch {
                expected,
                got: String::from_utf8_lossy(&preamble).into_owned(),
            });
        }

        if shared.inbound.load(Ordering::Acquire) >= config.max_connections {
            framed.send(Bytes::from_static(STACK_FULL.as_bytes())).await?;
            return Err(GroupError::MaxConnectionsExceeded(remote));
        }

        framed.send(Bytes::from(expected)).await?;
        let channel = spawn_channel(&shared, framed, remote, events.clone(), true);
        let _ = events.send(TransportEvent::ChannelCreated(channel as ChannelRef));
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self, listen_port: u16, events: TransportEvents) -> GroupResult<()> {
        let listener = TcpListener::bind((self.config.bind_address.as_str(), listen_port)).await?;
        info!(
            "Group transport listening on {}:{}",
            self.config.bind_address, listen_port
        );
        *self.shared.events.lock() = Some(events.clone());

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&shared);
                            let config = config.clone();
                            let events = events.clone();
                            tokio::spawn(async move {
                                let remote = addr.to_string();
                                if let Err(e) = Self::accept_inbound(shared, config, stream, remote.clone(), events).await {
                                    warn!("Rejected inbound group connection from {}: {}", remote, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Group transport accept failed: {}", e);
                        }
                    },
                }
            }
            debug!("Group transport accept loop stopped");
        });

        Ok(())
    }

    async fn connect(&self, host: &str, port: u16) -> GroupResult<ChannelRef> {
        let events = self.events()?;
        let addr = format!("{}:{}", host, port);

        let target = tokio::net::lookup_host(&addr)
            .await
            .map_err(|_| GroupError::UnknownHost(addr.clone()))?
            .next()
            .ok_or_else(|| GroupError::UnknownHost(addr.clone()))?;

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| GroupError::ConnectTimeout(addr.clone()))??;
        stream.set_nodelay(true)?;

        let mut framed = Framed::new(stream, Self::codec());
        let expected = stack_preamble();
        framed.send(Bytes::from(expected.clone())).await?;

        let reply = timeout(self.config.connect_timeout, framed.next())
            .await
            .map_err(|_| GroupError::ConnectTimeout(addr.clone()))?
            .ok_or_else(|| GroupError::Transport(format!("{} closed during preamble", addr)))??;

        if reply.as_ref() == STACK_FULL.as_bytes() {
            return Err(GroupError::MaxConnectionsExceeded(addr));
        }
        if reply.as_ref() != expected.as_bytes() {
            return Err(GroupError::StackMismatch {
                expected,
                got: String::from_utf8_lossy(&reply).into_owned(),
            });
        }

        Ok(spawn_channel(&self.shared, framed, addr, events, false))
    }

    async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let channels: Vec<_> = self
            .shared
            .channels
            .lock()
            .drain()
            .filter_map(|(_, c)| c.upgrade())
            .collect();
        for channel in channels {
            channel.close();
        }
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("bind_address", &self.config.bind_address)
            .field("inbound", &self.shared.inbound.load(Ordering::Relaxed))
            .finish()
    }
}

type Outbound = (Bytes, Option<SentCallback>);

/// A framed TCP connection
pub struct TcpChannel {
    id: ChannelId,
    remote_addr: String,
    open: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: CancellationToken,
}

/// Split the connection into a writer and a reader task and track the channel.
///
/// The reader reports every frame and, when the connection ends for any
/// reason, a single `ChannelRemoved`.
fn spawn_channel(
    shared: &Arc<Shared>,
    framed: WireFrame,
    remote_addr: String,
    events: TransportEvents,
    inbound: bool,
) -> Arc<TcpChannel> {
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let channel = Arc::new(TcpChannel {
        id: shared.next_id.fetch_add(1, Ordering::Relaxed),
        remote_addr,
        open: AtomicBool::new(true),
        outbound,
        closed: shared.shutdown.child_token(),
    });
    {
        let mut channels = shared.channels.lock();
        channels.retain(|_, c| c.strong_count() > 0);
        channels.insert(channel.id, Arc::downgrade(&channel));
    }
    if inbound {
        shared.inbound.fetch_add(1, Ordering::AcqRel);
    }

    let (mut sink, mut stream) = framed.split();

    let closed = channel.closed.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                next = outbound_rx.recv() => match next {
                    Some((bytes, sent)) => {
                        if sink.send(bytes).await.is_err() {
                            closed.cancel();
                            break;
                        }
                        if let Some(sent) = sent {
                            sent();
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = sink.close().await;
    });

    let reader = Arc::clone(&channel);
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reader.closed.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(bytes)) => match Frame::decode(&bytes) {
                        Ok(frame) => {
                            let _ = events.send(TransportEvent::Received {
                                channel: Arc::clone(&reader) as ChannelRef,
                                frame,
                            });
                        }
                        Err(e) => {
                            warn!("Dropping channel {} after undecodable frame: {}", reader.id, e);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        debug!("Channel {} read failed: {}", reader.id, e);
                        break;
                    }
                    None => break,
                },
            }
        }

        reader.close();
        if inbound {
            shared.inbound.fetch_sub(1, Ordering::AcqRel);
        }
        shared.channels.lock().remove(&reader.id);
        let _ = events.send(TransportEvent::ChannelRemoved(reader as ChannelRef));
    });

    channel
}

impl Channel for TcpChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.closed.is_cancelled()
    }

    fn send(&self, frame: Frame, sent: Option<SentCallback>) -> GroupResult<()> {
        if !self.is_open() {
            return Err(GroupError::ChannelClosed(self.id));
        }
        let bytes = frame.encode()?;
        self.outbound
            .send((bytes, sent))
            .map_err(|_| GroupError::ChannelClosed(self.id))
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.closed.cancel();
    }
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HandshakeMessage;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn local_config() -> TcpTransportConfig {
        TcpTransportConfig {
            bind_address: "127.0.0.1".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_exchange_frames() {
        let port = free_port().await;
        let server = TcpTransport::new(local_config());
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        server.start(port, server_tx).await.unwrap();

        let client = TcpTransport::new(local_config());
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        client.start(free_port().await, client_tx).await.unwrap();

        let channel = client.connect("127.0.0.1", port).await.unwrap();
        let accepted = match server_rx.recv().await.unwrap() {
            TransportEvent::ChannelCreated(c) => c,
            other => panic!("Unexpected event: {:?}", other),
        };

        channel
            .send(Frame::Handshake(HandshakeMessage::Ok), None)
            .unwrap();
        match server_rx.recv().await.unwrap() {
            TransportEvent::Received { frame, .. } => {
                assert!(matches!(frame, Frame::Handshake(HandshakeMessage::Ok)));
            }
            other => panic!("Unexpected event: {:?}", other),
        }

        accepted.close();
        assert!(matches!(
            server_rx.recv().await.unwrap(),
            TransportEvent::ChannelRemoved(_)
        ));
        assert!(matches!(
            client_rx.recv().await.unwrap(),
            TransportEvent::ChannelRemoved(_)
        ));

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let port = free_port().await;
        let server = TcpTransport::new(TcpTransportConfig {
            max_connections: 0,
            ..local_config()
        });
        let (server_tx, _server_rx) = mpsc::unbounded_channel();
        server.start(port, server_tx).await.unwrap();

        let client = TcpTransport::new(local_config());
        let (client_tx, _client_rx) = mpsc::unbounded_channel();
        client.start(free_port().await, client_tx).await.unwrap();

        assert!(matches!(
            client.connect("127.0.0.1", port).await,
            Err(GroupError::MaxConnectionsExceeded(_))
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let client = TcpTransport::new(local_config());
        let (client_tx, _client_rx) = mpsc::unbounded_channel();
        client.start(free_port().await, client_tx).await.unwrap();

        assert!(matches!(
            client.connect("no-such-host.invalid", 1).await,
            Err(GroupError::UnknownHost(_))
        ));
    }
}
