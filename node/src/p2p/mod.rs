//! P2P control plane: host construction, DHT access, peer directory and the
//! peer-announcement protocol.
//!
//! The swarm is owned by a single event-loop task. Engines hold a cheap
//! clonable [`P2pClient`] that reaches the loop over a command channel and
//! opens or accepts raw protocol streams through `libp2p-stream`.

use std::time::Duration;

use futures::StreamExt as _;
use libp2p::{
    autonat, dcutr, identify, identity::Keypair, kad, multiaddr::Protocol, noise, ping, relay,
    swarm::NetworkBehaviour, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm,
};
use orcanet_shared::{FramedStream, PEER_EXCHANGE_PROTOCOL, WANT_TIMEOUT};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result as NodeResult};
use crate::settings::Settings;

mod event_loop;

use event_loop::EventLoop;

/// Deadline for a direct dial before falling back to the relay.
const DIRECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for each step of the login bootstrap sequence.
const SETUP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(NetworkBehaviour)]
pub(crate) struct Behaviour {
    pub(crate) kad: kad::Behaviour<kad::store::MemoryStore>,
    pub(crate) identify: identify::Behaviour,
    pub(crate) ping: ping::Behaviour,
    pub(crate) relay_client: relay::client::Behaviour,
    pub(crate) dcutr: dcutr::Behaviour,
    pub(crate) autonat: autonat::Behaviour,
    pub(crate) stream: libp2p_stream::Behaviour,
}

/// Addresses of the external relay and bootstrap peers, parsed from settings.
#[derive(Clone, Debug)]
pub struct P2pConfig {
    pub relay_address: Multiaddr,
    pub relay_peer_id: PeerId,
    pub bootstrap_addresses: Vec<Multiaddr>,
}

impl P2pConfig {
    /// Parse and validate the configured addresses.
    pub fn from_settings(settings: &Settings) -> NodeResult<Self> {
        let relay_address: Multiaddr = settings.relay_address.parse().map_err(|e| {
            tracing::error!("invalid relay address '{}': {e}", settings.relay_address);
            Error::InvalidParams
        })?;
        let relay_peer_id = peer_id_from_multiaddr(&relay_address).ok_or_else(|| {
            tracing::error!("relay address is missing a /p2p/ peer id");
            Error::InvalidParams
        })?;

        let bootstrap_addresses = settings
            .bootstrap_addresses
            .iter()
            .map(|s| {
                s.parse::<Multiaddr>().map_err(|e| {
                    tracing::error!("invalid bootstrap address '{s}': {e}");
                    Error::InvalidParams
                })
            })
            .collect::<NodeResult<Vec<_>>>()?;
        if bootstrap_addresses.is_empty() {
            tracing::error!("no bootstrap addresses are configured");
            return Err(Error::InvalidParams);
        }

        Ok(Self {
            relay_address,
            relay_peer_id,
            bootstrap_addresses,
        })
    }
}

/// Pull the `/p2p/` peer id out of a multi-address.
pub(crate) fn peer_id_from_multiaddr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|protocol| match protocol {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

/// A peer as seen through the local directory.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PeerStatus {
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub is_connected: bool,
}

pub(crate) enum Command {
    Dial {
        peer_id: PeerId,
        relayed: bool,
        reply: oneshot::Sender<NodeResult<()>>,
    },
    FindPeer {
        peer_id: PeerId,
        reply: oneshot::Sender<NodeResult<PeerStatus>>,
    },
    GetPeers {
        reply: oneshot::Sender<Vec<PeerStatus>>,
    },
    StartProviding {
        key: kad::RecordKey,
        reply: oneshot::Sender<NodeResult<()>>,
    },
    GetProviders {
        key: kad::RecordKey,
        reply: oneshot::Sender<NodeResult<Vec<PeerId>>>,
    },
    GetRecord {
        key: String,
        reply: oneshot::Sender<NodeResult<Vec<u8>>>,
    },
    PutRecord {
        key: String,
        value: Vec<u8>,
        reply: oneshot::Sender<NodeResult<()>>,
    },
    Shutdown,
}

/// Handle engines use to reach the p2p host. Cloning is cheap.
#[derive(Clone)]
pub struct P2pClient {
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    local_peer_id: PeerId,
    relay_peer_id: PeerId,
}

impl P2pClient {
    #[must_use]
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    #[must_use]
    pub fn relay_peer_id(&self) -> PeerId {
        self.relay_peer_id
    }

    async fn send(&self, command: Command) -> NodeResult<()> {
        self.commands.send(command).await.map_err(|_| {
            tracing::warn!("p2p event loop is gone");
            Error::Internal
        })
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<NodeResult<T>>,
    ) -> NodeResult<T> {
        self.send(command).await?;
        rx.await.map_err(|_| Error::Internal)?
    }

    async fn dial(&self, peer_id: PeerId, relayed: bool) -> NodeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dial {
            peer_id,
            relayed,
            reply,
        })
        .await?;
        match tokio::time::timeout(DIRECT_DIAL_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Internal),
            Err(_) => Err(Error::PeerConnection),
        }
    }

    /// Connect to a peer by id: an existing connection is reused, then a
    /// direct dial with a deadline, then a relayed `/p2p-circuit` dial.
    pub async fn connect_to_peer(&self, peer_id: PeerId) -> NodeResult<()> {
        if peer_id == self.local_peer_id {
            return Ok(());
        }
        match self.dial(peer_id, false).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::debug!("direct connection to {peer_id} failed ({e}), trying the relay");
            }
        }
        self.dial(peer_id, true).await.map_err(|e| {
            tracing::debug!("relayed connection to {peer_id} failed: {e}");
            Error::PeerConnection
        })
    }

    /// Look a peer up: self, then the local peerstore, then the DHT.
    pub async fn find_peer(&self, peer_id: PeerId) -> NodeResult<PeerStatus> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::FindPeer { peer_id, reply }, rx).await
    }

    /// Every peer the peerstore has addresses for.
    pub async fn get_peers(&self) -> NodeResult<Vec<PeerStatus>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetPeers { reply }).await?;
        rx.await.map_err(|_| Error::Internal)
    }

    /// Announce this node as a provider for a content id.
    pub async fn provide(&self, cid: &cid::Cid) -> NodeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::StartProviding {
                key: kad::RecordKey::new(&cid.to_bytes()),
                reply,
            },
            rx,
        )
        .await
    }

    /// Ask the DHT for providers of a content id, bounded by `timeout`.
    pub async fn find_providers(&self, cid: &cid::Cid, timeout: Duration) -> NodeResult<Vec<PeerId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetProviders {
            key: kad::RecordKey::new(&cid.to_bytes()),
            reply,
        })
        .await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Internal),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Fetch an opaque value from the DHT under the `/orcanet/` namespace.
    pub async fn get_value(&self, key: &str) -> NodeResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::GetRecord {
                key: format!("{}{key}", orcanet_shared::DHT_KEY_NAMESPACE),
                reply,
            },
            rx,
        )
        .await
    }

    /// Store an opaque value in the DHT under the `/orcanet/` namespace.
    pub async fn put_value(&self, key: &str, value: Vec<u8>) -> NodeResult<()> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::PutRecord {
                key: format!("{}{key}", orcanet_shared::DHT_KEY_NAMESPACE),
                value,
                reply,
            },
            rx,
        )
        .await
    }

    /// Open a framed protocol stream to a peer, connecting first if needed.
    /// The timeout covers connection setup and stream negotiation together.
    pub async fn open_stream(
        &self,
        peer_id: PeerId,
        protocol: &'static str,
        timeout: Duration,
    ) -> NodeResult<FramedStream<libp2p::Stream>> {
        let open = async {
            self.connect_to_peer(peer_id).await?;
            let stream = self
                .control
                .clone()
                .open_stream(peer_id, StreamProtocol::new(protocol))
                .await
                .map_err(|e| {
                    tracing::debug!("failed to open {protocol} stream to {peer_id}: {e}");
                    Error::PeerConnection
                })?;
            Ok(FramedStream::new(stream, peer_id.to_string()))
        };
        tokio::time::timeout(timeout, open)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Register as the handler for a stream protocol and receive its inbound
    /// streams.
    pub fn accept_protocol(&self, protocol: &'static str) -> NodeResult<libp2p_stream::IncomingStreams> {
        self.control
            .clone()
            .accept(StreamProtocol::new(protocol))
            .map_err(|e| {
                tracing::error!("protocol {protocol} is already registered: {e}");
                Error::Internal
            })
    }

    pub(crate) async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// A running p2p host. Dropping it (after [`P2pHost::shutdown`]) releases
/// every connection and stream.
pub struct P2pHost {
    client: P2pClient,
    task: tokio::task::JoinHandle<()>,
}

impl P2pHost {
    /// Create the host around an identity key and join the network: listen
    /// on an ephemeral port, connect to the relay, reserve a relay slot,
    /// connect to at least one bootstrap peer and bootstrap the DHT. Any
    /// failure tears the half-built host down.
    pub async fn start(keypair: Keypair, config: P2pConfig) -> NodeResult<P2pHost> {
        let local_peer_id = keypair.public().to_peer_id();
        let relay_peer_id = config.relay_peer_id;
        let swarm = build_swarm(keypair)?;
        let control = swarm.behaviour().stream.new_control();

        let (commands, command_rx) = mpsc::channel(64);
        let mut event_loop = EventLoop::new(swarm, config, command_rx);
        event_loop.establish().await?;
        let task = tokio::spawn(event_loop.run());

        let client = P2pClient {
            commands,
            control,
            local_peer_id,
            relay_peer_id,
        };
        spawn_peer_exchange_handler(&client)?;
        tracing::info!("p2p host is up with peer id {local_peer_id}");

        Ok(P2pHost {
            client,
            task,
        })
    }

    #[must_use]
    pub fn client(&self) -> P2pClient {
        self.client.clone()
    }

    /// Stop the event loop and drop the swarm, closing every stream.
    pub async fn shutdown(self) {
        self.client.shutdown().await;
        if let Err(e) = self.task.await {
            tracing::warn!("p2p event loop task ended abnormally: {e}");
        }
    }
}

fn build_swarm(keypair: Keypair) -> NodeResult<Swarm<Behaviour>> {
    let internal = |e: &dyn std::fmt::Display| {
        tracing::error!("failed to build the p2p host: {e}");
        Error::Internal
    };

    let swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| internal(&e))?
        .with_dns()
        .map_err(|e| internal(&e))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| internal(&e))?
        .with_behaviour(|key, relay_client| {
            let local_peer_id = key.public().to_peer_id();
            let mut kad_config = kad::Config::new(StreamProtocol::new("/ipfs/kad/1.0.0"));
            kad_config.set_query_timeout(Duration::from_secs(30));
            let store = kad::store::MemoryStore::new(local_peer_id);
            let mut kad = kad::Behaviour::with_config(local_peer_id, store, kad_config);
            kad.set_mode(Some(kad::Mode::Client));

            Behaviour {
                kad,
                identify: identify::Behaviour::new(identify::Config::new(
                    "/orcanet/id/1.0.0".to_owned(),
                    key.public(),
                )),
                ping: ping::Behaviour::new(ping::Config::new()),
                relay_client,
                dcutr: dcutr::Behaviour::new(local_peer_id),
                autonat: autonat::Behaviour::new(local_peer_id, autonat::Config::default()),
                stream: libp2p_stream::Behaviour::new(),
            }
        })
        .map_err(|e| internal(&e))?
        .with_swarm_config(|config| config.with_idle_connection_timeout(Duration::from_secs(120)))
        .build();
    Ok(swarm)
}

#[derive(serde::Deserialize)]
struct PeerAnnouncement {
    known_peers: Vec<AnnouncedPeer>,
}

#[derive(serde::Deserialize)]
struct AnnouncedPeer {
    peer_id: String,
}

/// Accept `/orcanet/p2p` streams: each carries one JSON line of known peers,
/// and we schedule a connection attempt to every entry except the relay.
fn spawn_peer_exchange_handler(client: &P2pClient) -> NodeResult<()> {
    let mut incoming = client.accept_protocol(PEER_EXCHANGE_PROTOCOL)?;
    let client = client.clone();
    tokio::spawn(async move {
        while let Some((peer_id, stream)) = incoming.next().await {
            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_peer_announcement(client, peer_id, stream).await {
                    tracing::debug!("peer announcement from {peer_id} failed: {e}");
                }
            });
        }
        tracing::debug!("peer announcement listener closed");
    });
    Ok(())
}

async fn handle_peer_announcement(
    client: P2pClient,
    peer_id: PeerId,
    stream: libp2p::Stream,
) -> NodeResult<()> {
    let mut stream = FramedStream::new(stream, peer_id.to_string());
    let line = stream.read_string(b'\n', WANT_TIMEOUT).await?;
    let announcement: PeerAnnouncement =
        serde_json::from_str(line.trim_end()).map_err(|_| Error::UnexpectedResponse)?;

    for entry in announcement.known_peers {
        let Ok(announced) = entry.peer_id.parse::<PeerId>() else {
            tracing::debug!("ignoring malformed announced peer id '{}'", entry.peer_id);
            continue;
        };
        if announced == client.relay_peer_id() || announced == client.local_peer_id() {
            continue;
        }
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.connect_to_peer(announced).await {
                tracing::debug!("connection to announced peer {announced} failed: {e}");
            }
        });
    }
    Ok(())
}

/// A client whose event loop is a stub: dials fail, lookups come back
/// empty, stores succeed. Lets engines run without a live swarm.
#[cfg(test)]
pub(crate) fn stub_client() -> P2pClient {
    let (commands, mut rx) = mpsc::channel(16);
    let behaviour = libp2p_stream::Behaviour::new();
    let control = behaviour.new_control();
    tokio::spawn(async move {
        let _behaviour = behaviour;
        while let Some(command) = rx.recv().await {
            match command {
                Command::Dial { reply, .. } => {
                    let _ = reply.send(Err(Error::PeerConnection));
                }
                Command::FindPeer { reply, .. } => {
                    let _ = reply.send(Err(Error::PeerNotFound));
                }
                Command::GetPeers { reply } => {
                    let _ = reply.send(Vec::new());
                }
                Command::StartProviding { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
                Command::GetProviders { reply, .. } => {
                    let _ = reply.send(Ok(Vec::new()));
                }
                Command::GetRecord { reply, .. } => {
                    let _ = reply.send(Err(Error::KeyNotFound));
                }
                Command::PutRecord { reply, .. } => {
                    let _ = reply.send(Ok(()));
                }
                Command::Shutdown => break,
            }
        }
    });
    P2pClient {
        commands,
        control,
        local_peer_id: PeerId::random(),
        relay_peer_id: PeerId::random(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_relay_peer_id_and_bootstrap() {
        let mut settings = Settings::default();
        settings.relay_address = "/ip4/127.0.0.1/tcp/4001".to_owned();
        settings.bootstrap_addresses =
            vec!["/ip4/127.0.0.1/tcp/4002/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"
                .to_owned()];
        // Relay address lacks a /p2p/ component.
        assert_eq!(
            P2pConfig::from_settings(&settings).unwrap_err(),
            Error::InvalidParams
        );

        settings.relay_address =
            "/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"
                .to_owned();
        let config = P2pConfig::from_settings(&settings).expect("valid config");
        assert_eq!(config.bootstrap_addresses.len(), 1);

        settings.bootstrap_addresses.clear();
        assert_eq!(
            P2pConfig::from_settings(&settings).unwrap_err(),
            Error::InvalidParams
        );
    }

    #[test]
    fn multiaddr_peer_id_extraction() {
        let addr: Multiaddr =
            "/ip4/127.0.0.1/tcp/4001/p2p/12D3KooWDpJ7As7BWAwRMfu1VU2WCqNjvq387JEYKDBj4kx6nXTN"
                .parse()
                .expect("valid multiaddr");
        assert!(peer_id_from_multiaddr(&addr).is_some());

        let bare: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().expect("valid multiaddr");
        assert!(peer_id_from_multiaddr(&bare).is_none());
    }
}
