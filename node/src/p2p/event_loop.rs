use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::StreamExt as _;
use libp2p::{
    identify, kad,
    multiaddr::Protocol,
    relay,
    swarm::{
        dial_opts::{DialOpts, PeerCondition},
        DialError, SwarmEvent,
    },
    Multiaddr, PeerId, Swarm,
};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

use super::{
    peer_id_from_multiaddr, Behaviour, BehaviourEvent, Command, P2pConfig, PeerStatus,
    SETUP_TIMEOUT,
};

enum PendingQuery {
    StartProviding(oneshot::Sender<Result<()>>),
    GetProviders {
        providers: HashSet<PeerId>,
        reply: Option<oneshot::Sender<Result<Vec<PeerId>>>>,
    },
    GetRecord(oneshot::Sender<Result<Vec<u8>>>),
    PutRecord(oneshot::Sender<Result<()>>),
    FindPeer {
        target: PeerId,
        reply: oneshot::Sender<Result<PeerStatus>>,
    },
}

/// Owns the swarm and every piece of state keyed off its events.
pub(crate) struct EventLoop {
    swarm: Swarm<Behaviour>,
    config: P2pConfig,
    commands: mpsc::Receiver<Command>,

    /// Peers with observed addresses: explicit connections and identify
    /// reports. Addresses learned purely through DHT walks stay out of here.
    peerstore: HashMap<PeerId, HashSet<Multiaddr>>,

    /// Addresses learned from DHT routing updates and lookups.
    dht_addresses: HashMap<PeerId, HashSet<Multiaddr>>,

    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<Result<()>>>>,
    pending_queries: HashMap<kad::QueryId, PendingQuery>,
}

impl EventLoop {
    pub(crate) fn new(
        swarm: Swarm<Behaviour>,
        config: P2pConfig,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            swarm,
            config,
            commands,
            peerstore: HashMap::new(),
            dht_addresses: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_queries: HashMap::new(),
        }
    }

    /// Join the network. Runs before the loop is spawned so login observes
    /// every failure synchronously.
    pub(crate) async fn establish(&mut self) -> Result<()> {
        let listen_addr: Multiaddr = "/ip4/0.0.0.0/tcp/0"
            .parse()
            .expect("static listen address parses");
        self.swarm.listen_on(listen_addr).map_err(|e| {
            tracing::error!("failed to listen on an ephemeral port: {e}");
            Error::Internal
        })?;

        // Connect to the relay.
        let relay_peer_id = self.config.relay_peer_id;
        self.swarm
            .dial(self.config.relay_address.clone())
            .map_err(|e| {
                tracing::error!("failed to dial the relay: {e}");
                Error::PeerConnection
            })?;
        self.await_connection(relay_peer_id, SETUP_TIMEOUT)
            .await
            .map_err(|e| {
                tracing::error!("could not reach the relay: {e}");
                Error::PeerConnection
            })?;

        // Reserve a slot on the relay; without it other peers cannot reach
        // us through a circuit.
        let circuit = self
            .config
            .relay_address
            .clone()
            .with(Protocol::P2pCircuit);
        self.swarm.listen_on(circuit).map_err(|e| {
            tracing::error!("failed to request a relay circuit listener: {e}");
            Error::Internal
        })?;
        self.await_reservation(SETUP_TIMEOUT).await?;

        // Connect to the bootstrap list; at least one peer is required.
        let mut connected = 0usize;
        for addr in self.config.bootstrap_addresses.clone() {
            let Some(peer_id) = peer_id_from_multiaddr(&addr) else {
                tracing::warn!("bootstrap address '{addr}' is missing a /p2p/ peer id");
                continue;
            };
            if self.swarm.dial(addr.clone()).is_err() {
                continue;
            }
            if self
                .await_connection(peer_id, SETUP_TIMEOUT)
                .await
                .is_ok()
            {
                self.swarm
                    .behaviour_mut()
                    .kad
                    .add_address(&peer_id, addr);
                connected += 1;
            } else {
                tracing::warn!("bootstrap peer {peer_id} is unreachable");
            }
        }
        if connected == 0 {
            tracing::error!("could not reach any bootstrap peer");
            return Err(Error::PeerConnection);
        }

        if let Err(e) = self.swarm.behaviour_mut().kad.bootstrap() {
            tracing::warn!("DHT bootstrap did not start: {e}");
        }
        Ok(())
    }

    async fn await_connection(&mut self, peer_id: PeerId, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.swarm.select_next_some())
                .await
                .map_err(|_| Error::Timeout)?;
            match &event {
                SwarmEvent::ConnectionEstablished { peer_id: p, .. } if *p == peer_id => {
                    self.handle_event(event);
                    return Ok(());
                }
                SwarmEvent::OutgoingConnectionError {
                    peer_id: Some(p), ..
                } if *p == peer_id => {
                    self.handle_event(event);
                    return Err(Error::PeerConnection);
                }
                _ => self.handle_event(event),
            }
        }
    }

    async fn await_reservation(&mut self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::time::timeout_at(deadline, self.swarm.select_next_some())
                .await
                .map_err(|_| {
                    tracing::error!("relay reservation timed out");
                    Error::PeerConnection
                })?;
            if let SwarmEvent::Behaviour(BehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted { .. },
            )) = &event
            {
                tracing::info!("reserved a slot on the relay");
                self.handle_event(event);
                return Ok(());
            }
            self.handle_event(event);
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }
        tracing::debug!("p2p event loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial {
                peer_id,
                relayed,
                reply,
            } => self.handle_dial(peer_id, relayed, reply),
            Command::FindPeer { peer_id, reply } => self.handle_find_peer(peer_id, reply),
            Command::GetPeers { reply } => {
                let _ = reply.send(self.peer_statuses());
            }
            Command::StartProviding { key, reply } => {
                match self.swarm.behaviour_mut().kad.start_providing(key) {
                    Ok(id) => {
                        self.pending_queries
                            .insert(id, PendingQuery::StartProviding(reply));
                    }
                    Err(e) => {
                        tracing::warn!("failed to start providing: {e}");
                        let _ = reply.send(Err(Error::Internal));
                    }
                }
            }
            Command::GetProviders { key, reply } => {
                let id = self.swarm.behaviour_mut().kad.get_providers(key);
                self.pending_queries.insert(
                    id,
                    PendingQuery::GetProviders {
                        providers: HashSet::new(),
                        reply: Some(reply),
                    },
                );
            }
            Command::GetRecord { key, reply } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .get_record(kad::RecordKey::new(&key));
                self.pending_queries.insert(id, PendingQuery::GetRecord(reply));
            }
            Command::PutRecord { key, value, reply } => {
                let record = kad::Record::new(kad::RecordKey::new(&key), value);
                match self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .put_record(record, kad::Quorum::One)
                {
                    Ok(id) => {
                        self.pending_queries.insert(id, PendingQuery::PutRecord(reply));
                    }
                    Err(e) => {
                        tracing::warn!("failed to put record: {e}");
                        let _ = reply.send(Err(Error::Internal));
                    }
                }
            }
            Command::Shutdown => {}
        }
    }

    fn handle_dial(
        &mut self,
        peer_id: PeerId,
        relayed: bool,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if self.swarm.is_connected(&peer_id) {
            let _ = reply.send(Ok(()));
            return;
        }

        let opts = if relayed {
            let addr = self
                .config
                .relay_address
                .clone()
                .with(Protocol::P2pCircuit)
                .with(Protocol::P2p(peer_id));
            DialOpts::peer_id(peer_id)
                .addresses(vec![addr])
                .condition(PeerCondition::Always)
                .build()
        } else {
            let addresses: Vec<Multiaddr> = self
                .peerstore
                .get(&peer_id)
                .into_iter()
                .chain(self.dht_addresses.get(&peer_id))
                .flatten()
                .cloned()
                .collect();
            DialOpts::peer_id(peer_id)
                .addresses(addresses)
                .extend_addresses_through_behaviour()
                .build()
        };

        match self.swarm.dial(opts) {
            Ok(()) => self.pending_dials.entry(peer_id).or_default().push(reply),
            Err(DialError::DialPeerConditionFalse(_)) => {
                // A dial to this peer is already in flight; share its outcome.
                self.pending_dials.entry(peer_id).or_default().push(reply);
            }
            Err(e) => {
                tracing::debug!("dial to {peer_id} failed to start: {e}");
                let _ = reply.send(Err(Error::PeerConnection));
            }
        }
    }

    fn handle_find_peer(&mut self, peer_id: PeerId, reply: oneshot::Sender<Result<PeerStatus>>) {
        if peer_id == *self.swarm.local_peer_id() {
            let addresses = self.swarm.listeners().map(ToString::to_string).collect();
            let _ = reply.send(Ok(PeerStatus {
                peer_id: peer_id.to_string(),
                addresses,
                is_connected: true,
            }));
            return;
        }
        if let Some(addrs) = self.peerstore.get(&peer_id) {
            let _ = reply.send(Ok(PeerStatus {
                peer_id: peer_id.to_string(),
                addresses: addrs.iter().map(ToString::to_string).collect(),
                is_connected: self.swarm.is_connected(&peer_id),
            }));
            return;
        }
        let id = self.swarm.behaviour_mut().kad.get_closest_peers(peer_id);
        self.pending_queries.insert(
            id,
            PendingQuery::FindPeer {
                target: peer_id,
                reply,
            },
        );
    }

    fn peer_statuses(&self) -> Vec<PeerStatus> {
        self.peerstore
            .iter()
            .map(|(peer_id, addrs)| PeerStatus {
                peer_id: peer_id.to_string(),
                addresses: addrs.iter().map(ToString::to_string).collect(),
                is_connected: self.swarm.is_connected(peer_id),
            })
            .collect()
    }

    fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("listening on {address}");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                self.peerstore
                    .entry(peer_id)
                    .or_default()
                    .insert(endpoint.get_remote_address().clone());
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                tracing::debug!("outgoing connection to {peer_id} failed: {error}");
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for waiter in waiters {
                        let _ = waiter.send(Err(Error::PeerConnection));
                    }
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                let store = self.peerstore.entry(peer_id).or_default();
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&peer_id, addr.clone());
                    store.insert(addr);
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::OutboundQueryProgressed {
                id,
                result,
                step,
                ..
            })) => self.handle_query_progress(id, result, step.last),
            SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::RoutingUpdated {
                peer,
                addresses,
                ..
            })) => {
                self.dht_addresses
                    .entry(peer)
                    .or_default()
                    .extend(addresses.into_vec());
            }
            SwarmEvent::Behaviour(BehaviourEvent::RelayClient(event)) => {
                tracing::debug!("relay client event: {event:?}");
            }
            SwarmEvent::Behaviour(BehaviourEvent::Dcutr(event)) => {
                tracing::debug!("hole punching event: {event:?}");
            }
            SwarmEvent::Behaviour(BehaviourEvent::Autonat(event)) => {
                tracing::debug!("NAT detection event: {event:?}");
            }
            _ => {}
        }
    }

    fn handle_query_progress(&mut self, id: kad::QueryId, result: kad::QueryResult, last: bool) {
        match result {
            kad::QueryResult::StartProviding(result) => {
                if let Some(PendingQuery::StartProviding(reply)) = self.pending_queries.remove(&id)
                {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| {
                        tracing::warn!("provider announcement failed: {e}");
                        Error::Internal
                    }));
                }
            }
            kad::QueryResult::GetProviders(result) => {
                let Some(PendingQuery::GetProviders { providers, reply }) =
                    self.pending_queries.get_mut(&id)
                else {
                    return;
                };
                match result {
                    Ok(kad::GetProvidersOk::FoundProviders {
                        providers: found, ..
                    }) => {
                        providers.extend(found);
                        // The first batch is enough; stop walking the DHT.
                        if let Some(reply) = reply.take() {
                            let _ = reply.send(Ok(providers.iter().copied().collect()));
                        }
                        if let Some(mut query) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                            query.finish();
                        }
                    }
                    Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {
                        if let Some(reply) = reply.take() {
                            let _ = reply.send(Ok(providers.iter().copied().collect()));
                        }
                    }
                    Err(e) => {
                        tracing::debug!("provider lookup failed: {e}");
                        if let Some(reply) = reply.take() {
                            let _ = reply.send(Err(Error::Timeout));
                        }
                    }
                }
                if last {
                    self.pending_queries.remove(&id);
                }
            }
            kad::QueryResult::GetRecord(result) => match result {
                Ok(kad::GetRecordOk::FoundRecord(record)) => {
                    if let Some(PendingQuery::GetRecord(reply)) = self.pending_queries.remove(&id)
                    {
                        let _ = reply.send(Ok(record.record.value));
                    }
                    if let Some(mut query) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                        query.finish();
                    }
                }
                Ok(kad::GetRecordOk::FinishedWithNoAdditionalRecord { .. }) => {
                    if last {
                        if let Some(PendingQuery::GetRecord(reply)) =
                            self.pending_queries.remove(&id)
                        {
                            let _ = reply.send(Err(Error::KeyNotFound));
                        }
                    }
                }
                Err(kad::GetRecordError::NotFound { .. }) => {
                    if let Some(PendingQuery::GetRecord(reply)) = self.pending_queries.remove(&id)
                    {
                        let _ = reply.send(Err(Error::KeyNotFound));
                    }
                }
                Err(e) => {
                    tracing::debug!("record lookup failed: {e}");
                    if let Some(PendingQuery::GetRecord(reply)) = self.pending_queries.remove(&id)
                    {
                        let _ = reply.send(Err(Error::KeyNotFound));
                    }
                }
            },
            kad::QueryResult::PutRecord(result) => {
                if let Some(PendingQuery::PutRecord(reply)) = self.pending_queries.remove(&id) {
                    let _ = reply.send(result.map(|_| ()).map_err(|e| {
                        tracing::warn!("record store failed: {e}");
                        Error::Internal
                    }));
                }
            }
            kad::QueryResult::GetClosestPeers(result) => {
                let Some(PendingQuery::FindPeer { target, .. }) = self.pending_queries.get(&id)
                else {
                    return;
                };
                let target = *target;
                let found = match &result {
                    Ok(ok) => ok.peers.iter().find(|info| info.peer_id == target).cloned(),
                    Err(_) => None,
                };
                if let Some(info) = found {
                    if let Some(PendingQuery::FindPeer { reply, .. }) =
                        self.pending_queries.remove(&id)
                    {
                        // DHT results stay out of the peerstore view.
                        self.dht_addresses
                            .entry(target)
                            .or_default()
                            .extend(info.addrs.iter().cloned());
                        let _ = reply.send(Ok(PeerStatus {
                            peer_id: target.to_string(),
                            addresses: info.addrs.iter().map(ToString::to_string).collect(),
                            is_connected: self.swarm.is_connected(&target),
                        }));
                    }
                    if let Some(mut query) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                        query.finish();
                    }
                } else if last {
                    if let Some(PendingQuery::FindPeer { reply, .. }) =
                        self.pending_queries.remove(&id)
                    {
                        let _ = reply.send(Err(Error::PeerNotFound));
                    }
                }
            }
            kad::QueryResult::Bootstrap(result) => {
                tracing::debug!("DHT bootstrap progressed: {result:?}");
            }
            _ => {}
        }
    }
}
