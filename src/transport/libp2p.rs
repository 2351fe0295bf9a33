//! libp2p-backed transport. An actor owns the `Swarm` and runs in a
//! background task; the [`Libp2pTransport`] handle talks to it over a
//! command channel. Events travel as bincode frames on a single
//! gossipsub topic. Gossipsub does not hand a node its own messages
//! back, so `publish` loops the event into local subscribers before
//! putting it on the wire — that is what gives the contract its
//! self-delivery guarantee.

use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::prelude::*;
use libp2p::{
    core::upgrade::Version,
    gossipsub, identify,
    identity::Keypair,
    mdns, noise, ping,
    swarm::{NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Transport as _,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::job::JobEvent;
use crate::shutdown::Shutdown;
use crate::transport::Transport;
use crate::types::{FlotillaError, FlotillaResult, NodeId};

const JOB_EVENTS_TOPIC: &str = "flotilla-job-events";

/// Transport configuration, threaded in from the CLI.
#[derive(Debug, Clone)]
pub struct Libp2pTransportConfig {
    /// Port to listen on for swarm connections.
    pub port: u16,
    /// Peers to dial at startup.
    pub peers: Vec<Multiaddr>,
    /// Protobuf-encoded identity keypair; generated when absent.
    pub keypair: Option<Vec<u8>>,
}

impl Default for Libp2pTransportConfig {
    fn default() -> Self {
        Self {
            port: 1235,
            peers: Vec::new(),
            keypair: None,
        }
    }
}

#[derive(NetworkBehaviour)]
struct FlotillaBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
    mdns: mdns::tokio::Behaviour,
}

enum TransportCommand {
    Publish {
        frame: Vec<u8>,
        response: oneshot::Sender<FlotillaResult<()>>,
    },
}

/// Handle side of the transport actor.
pub struct Libp2pTransport {
    local_peer_id: PeerId,
    command_sender: mpsc::Sender<TransportCommand>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>,
}

impl Libp2pTransport {
    /// Build the swarm, spawn the actor, and return the handle.
    pub fn new(
        config: Libp2pTransportConfig,
        shutdown: Shutdown,
    ) -> FlotillaResult<std::sync::Arc<Self>> {
        let keypair = match &config.keypair {
            Some(bytes) => Keypair::from_protobuf_encoding(bytes)
                .map_err(|e| FlotillaError::Fatal(format!("failed to decode keypair: {}", e)))?,
            None => Keypair::generate_ed25519(),
        };
        let local_peer_id = PeerId::from(keypair.public());
        info!("local peer id: {}", local_peer_id);

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(Version::V1)
            .authenticate(
                noise::Config::new(&keypair)
                    .map_err(|e| FlotillaError::Fatal(format!("noise config: {}", e)))?,
            )
            .multiplex(yamux::Config::default())
            .timeout(Duration::from_secs(30))
            .boxed();

        let behaviour = build_behaviour(&keypair)
            .map_err(|e| FlotillaError::Fatal(format!("behaviour: {}", e)))?;

        let swarm = Swarm::new(
            transport,
            behaviour,
            local_peer_id,
            libp2p::swarm::Config::with_tokio_executor(),
        );

        let (command_sender, command_receiver) = mpsc::channel(128);

        let handle = std::sync::Arc::new(Self {
            local_peer_id,
            command_sender,
            subscribers: Mutex::new(Vec::new()),
        });

        let actor = TransportActor {
            swarm,
            config,
            command_receiver,
            handle: std::sync::Arc::downgrade(&handle),
            topic: gossipsub::IdentTopic::new(JOB_EVENTS_TOPIC),
        };
        tokio::spawn(actor.run(shutdown));

        Ok(handle)
    }

    fn deliver_local(&self, event: JobEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl Transport for Libp2pTransport {
    async fn publish(&self, event: JobEvent) -> FlotillaResult<()> {
        let frame = bincode::serialize(&event)
            .map_err(|e| FlotillaError::Fatal(format!("event encode: {}", e)))?;

        // Self-delivery first: the local controller must apply our own
        // events whether or not any peer is reachable.
        self.deliver_local(event);

        let (tx, rx) = oneshot::channel();
        self.command_sender
            .send(TransportCommand::Publish {
                frame,
                response: tx,
            })
            .await
            .map_err(|_| FlotillaError::Transient("transport actor stopped".into()))?;
        rx.await
            .map_err(|_| FlotillaError::Transient("transport actor dropped response".into()))?
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn host_id(&self) -> NodeId {
        NodeId::new(self.local_peer_id.to_string())
    }
}

fn build_behaviour(keypair: &Keypair) -> anyhow::Result<FlotillaBehaviour> {
    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(1))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .build()
        .context("failed to build gossipsub config")?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(keypair.clone()),
        gossipsub_config,
    )
    .map_err(|e| anyhow!("failed to create gossipsub behaviour: {}", e))?;

    let identify = identify::Behaviour::new(
        identify::Config::new("/flotilla/0.2.0".to_string(), keypair.public())
            .with_agent_version(format!("flotilla/{}", env!("CARGO_PKG_VERSION"))),
    );

    let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(30)));

    let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), keypair.public().to_peer_id())
        .context("failed to create mDNS behaviour")?;

    Ok(FlotillaBehaviour {
        gossipsub,
        identify,
        ping,
        mdns,
    })
}

struct TransportActor {
    swarm: Swarm<FlotillaBehaviour>,
    config: Libp2pTransportConfig,
    command_receiver: mpsc::Receiver<TransportCommand>,
    handle: std::sync::Weak<Libp2pTransport>,
    topic: gossipsub::IdentTopic,
}

impl TransportActor {
    async fn run(mut self, shutdown: Shutdown) {
        let listen_addr: Multiaddr = match format!("/ip4/0.0.0.0/tcp/{}", self.config.port).parse()
        {
            Ok(addr) => addr,
            Err(e) => {
                error!("bad listen address: {}", e);
                return;
            }
        };
        if let Err(e) = self.swarm.listen_on(listen_addr) {
            error!("failed to listen for swarm connections: {}", e);
            return;
        }

        if let Err(e) = self.swarm.behaviour_mut().gossipsub.subscribe(&self.topic) {
            error!("failed to subscribe to {}: {}", JOB_EVENTS_TOPIC, e);
            return;
        }

        for peer in self.config.peers.clone() {
            match self.swarm.dial(peer.clone()) {
                Ok(()) => info!(peer = %peer, "dialing bootstrap peer"),
                Err(e) => warn!(peer = %peer, "failed to dial bootstrap peer: {}", e),
            }
        }

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                command = self.command_receiver.recv() => {
                    match command {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            info!("transport command channel closed, stopping actor");
                            break;
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("transport actor shutting down");
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Publish { frame, response } => {
                let result = match self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(self.topic.clone(), frame)
                {
                    Ok(_) => Ok(()),
                    // A lone node has no mesh peers yet; self-delivery
                    // already happened, so this is not a failure.
                    Err(gossipsub::PublishError::InsufficientPeers) => Ok(()),
                    Err(e) => Err(FlotillaError::Transient(format!(
                        "gossip publish failed: {}",
                        e
                    ))),
                };
                let _ = response.send(result);
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<FlotillaBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                info!("connected to peer: {}", peer_id);
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!("disconnected from peer: {}", peer_id);
            }
            SwarmEvent::Behaviour(FlotillaBehaviourEvent::Gossipsub(
                gossipsub::Event::Message { message, .. },
            )) => {
                self.handle_gossip_frame(&message.data);
            }
            SwarmEvent::Behaviour(FlotillaBehaviourEvent::Mdns(mdns::Event::Discovered(
                peers,
            ))) => {
                for (peer_id, addr) in peers {
                    debug!(peer = %peer_id, %addr, "discovered local peer");
                    self.swarm
                        .behaviour_mut()
                        .gossipsub
                        .add_explicit_peer(&peer_id);
                }
            }
            SwarmEvent::Behaviour(FlotillaBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                ..
            })) => {
                debug!(peer = %peer_id, "identified peer");
            }
            _ => {}
        }
    }

    fn handle_gossip_frame(&mut self, data: &[u8]) {
        match bincode::deserialize::<JobEvent>(data) {
            Ok(event) => {
                debug!(kind = %event.kind, job_id = %event.job_id, "received gossip event");
                if let Some(handle) = self.handle.upgrade() {
                    handle.deliver_local(event);
                }
            }
            Err(e) => {
                warn!("dropping undecodable gossip frame: {}", e);
            }
        }
    }
}
