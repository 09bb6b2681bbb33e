//! In-process transport
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryTransport`]s living in
//! the same process. Channels are pairs of endpoints sharing one link; frames
//! are delivered straight into the receiving transport's event sink, so
//! per-channel ordering follows from the sink being a FIFO.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{GroupError, GroupResult};
use crate::transport::{
    Channel, ChannelId, ChannelRef, Frame, SentCallback, Transport, TransportEvent,
    TransportEvents,
};

/// Shared hub the in-memory transports listen on
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: Mutex<HashMap<String, Listener>>,
}

#[derive(Clone)]
struct Listener {
    events: TransportEvents,
    endpoint: Weak<Endpoint>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether something listens on `host:port`
    pub fn is_listening(&self, host: &str, port: u16) -> bool {
        self.listeners.lock().contains_key(&format!("{}:{}", host, port))
    }

    fn knows_host(&self, host: &str) -> bool {
        let prefix = format!("{}:", host);
        self.listeners.lock().keys().any(|k| k.starts_with(&prefix))
    }
}

/// State shared by one transport and the channels it owns
struct Endpoint {
    host: String,
    next_id: AtomicU64,
    events: OnceLock<TransportEvents>,
    channels: Mutex<HashMap<ChannelId, Weak<MemoryChannel>>>,
}

impl Endpoint {
    fn track(&self, channel: &Arc<MemoryChannel>) {
        let mut channels = self.channels.lock();
        channels.retain(|_, c| c.strong_count() > 0);
        channels.insert(channel.id, Arc::downgrade(channel));
    }
}

/// Transport over a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    endpoint: Arc<Endpoint>,
    listen_key: Mutex<Option<String>>,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>, host: impl Into<String>) -> Self {
        Self {
            network,
            endpoint: Arc::new(Endpoint {
                host: host.into(),
                next_id: AtomicU64::new(1),
                events: OnceLock::new(),
                channels: Mutex::new(HashMap::new()),
            }),
            listen_key: Mutex::new(None),
        }
    }

    /// Number of channels of this transport that are still open
    pub fn open_channels(&self) -> usize {
        self.endpoint
            .channels
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_open())
            .count()
    }

    fn events(&self) -> GroupResult<TransportEvents> {
        self.endpoint
            .events
            .get()
            .cloned()
            .ok_or_else(|| GroupError::Transport("transport not started".to_string()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&self, listen_port: u16, events: TransportEvents) -> GroupResult<()> {
        let key = format!("{}:{}", self.endpoint.host, listen_port);
        let mut listeners = self.network.listeners.lock();
        if listeners.contains_key(&key) {
            return Err(GroupError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                key,
            )));
        }
        if self.endpoint.events.set(events.clone()).is_err() {
            return Err(GroupError::Transport("transport already started".to_string()));
        }
        listeners.insert(
            key.clone(),
            Listener {
                events,
                endpoint: Arc::downgrade(&self.endpoint),
            },
        );
        *self.listen_key.lock() = Some(key);
        Ok(())
    }

    async fn connect(&self, host: &str, port: u16) -> GroupResult<ChannelRef> {
        let events = self.events()?;
        let key = format!("{}:{}", host, port);

        let listener = self.network.listeners.lock().get(&key).cloned();
        let (listener, remote) = match listener.and_then(|l| l.endpoint.upgrade().map(|e| (l, e))) {
            Some(found) => found,
            None if !self.network.knows_host(host) => return Err(GroupError::UnknownHost(key)),
            None => {
                return Err(GroupError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    key,
                )))
            }
        };

        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            ends: OnceLock::new(),
        });
        let local = Arc::new(MemoryChannel {
            id: self.endpoint.next_id.fetch_add(1, Ordering::Relaxed),
            remote_addr: key,
            side: 0,
            link: Arc::clone(&link),
        });
        let accepted = Arc::new(MemoryChannel {
            id: remote.next_id.fetch_add(1, Ordering::Relaxed),
            remote_addr: format!("{}:0", self.endpoint.host),
            side: 1,
            link: Arc::clone(&link),
        });
        let _ = link.ends.set([
            LinkEnd {
                channel: Arc::downgrade(&local),
                events,
            },
            LinkEnd {
                channel: Arc::downgrade(&accepted),
                events: listener.events.clone(),
            },
        ]);
        self.endpoint.track(&local);
        remote.track(&accepted);

        debug!(
            "Memory channel {} -> {} (remote id {})",
            local.id, local.remote_addr, accepted.id
        );
        let _ = listener
            .events
            .send(TransportEvent::ChannelCreated(accepted as ChannelRef));

        Ok(local)
    }

    async fn shutdown(&self) {
        if let Some(key) = self.listen_key.lock().take() {
            self.network.listeners.lock().remove(&key);
        }
        let channels: Vec<_> = self
            .endpoint
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

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("host", &self.endpoint.host)
            .field("listen", &*self.listen_key.lock())
            .finish()
    }
}

struct LinkEnd {
    channel: Weak<MemoryChannel>,
    events: TransportEvents,
}

struct Link {
    open: AtomicBool,
    ends: OnceLock<[LinkEnd; 2]>,
}

/// One endpoint of an in-memory channel
pub struct MemoryChannel {
    id: ChannelId,
    remote_addr: String,
    side: usize,
    link: Arc<Link>,
}

impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::Acquire)
    }

    fn send(&self, frame: Frame, sent: Option<SentCallback>) -> GroupResult<()> {
        if !self.is_open() {
            return Err(GroupError::ChannelClosed(self.id));
        }
        let peer = self
            .link
            .ends
            .get()
            .map(|ends| &ends[1 - self.side])
            .and_then(|end| end.channel.upgrade().map(|c| (c, &end.events)));

        let Some((channel, events)) = peer else {
            self.close();
            return Err(GroupError::ChannelClosed(self.id));
        };
        events
            .send(TransportEvent::Received {
                channel: channel as ChannelRef,
                frame,
            })
            .map_err(|_| GroupError::ChannelClosed(self.id))?;

        if let Some(sent) = sent {
            sent();
        }
        Ok(())
    }

    fn close(&self) {
        if !self.link.open.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(ends) = self.link.ends.get() {
            for end in ends {
                if let Some(channel) = end.channel.upgrade() {
                    let _ = end
                        .events
                        .send(TransportEvent::ChannelRemoved(channel as ChannelRef));
                }
            }
        }
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
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
    use tokio::sync::mpsc;

    async fn started(
        network: &Arc<MemoryNetwork>,
        host: &str,
        port: u16,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = MemoryTransport::new(Arc::clone(network), host);
        let (tx, rx) = mpsc::unbounded_channel();
        transport.start(port, tx).await.unwrap();
        (transport, rx)
    }

    #[tokio::test]
    async fn test_connect_send_close() {
        let network = MemoryNetwork::new();
        let (a, mut a_events) = started(&network, "a", 1).await;
        let (_b, mut b_events) = started(&network, "b", 1).await;

        let channel = a.connect("b", 1).await.unwrap();
        let accepted = match b_events.recv().await.unwrap() {
            TransportEvent::ChannelCreated(c) => c,
            other => panic!("Unexpected event: {:?}", other),
        };

        channel
            .send(Frame::Handshake(HandshakeMessage::Ack), None)
            .unwrap();
        match b_events.recv().await.unwrap() {
            TransportEvent::Received { channel, frame } => {
                assert_eq!(channel.id(), accepted.id());
                assert!(matches!(frame, Frame::Handshake(HandshakeMessage::Ack)));
            }
            other => panic!("Unexpected event: {:?}", other),
        }

        accepted.close();
        assert!(!channel.is_open());
        assert!(matches!(
            a_events.recv().await.unwrap(),
            TransportEvent::ChannelRemoved(_)
        ));
        assert!(matches!(
            b_events.recv().await.unwrap(),
            TransportEvent::ChannelRemoved(_)
        ));
        assert!(channel
            .send(Frame::Handshake(HandshakeMessage::Ack), None)
            .is_err());
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let network = MemoryNetwork::new();
        let (a, _events) = started(&network, "a", 1).await;

        assert!(matches!(
            a.connect("nowhere", 1).await,
            Err(GroupError::UnknownHost(_))
        ));
        assert!(matches!(a.connect("a", 2).await, Err(GroupError::Io(_))));
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels() {
        let network = MemoryNetwork::new();
        let (a, _a_events) = started(&network, "a", 1).await;
        let (_b, _b_events) = started(&network, "b", 1).await;

        let channel = a.connect("b", 1).await.unwrap();
        assert_eq!(a.open_channels(), 1);

        a.shutdown().await;
        assert!(!channel.is_open());
        assert!(!network.is_listening("a", 1));
        assert_eq!(a.open_channels(), 0);
    }
}
