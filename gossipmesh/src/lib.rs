use anyhow::{anyhow, bail, Context as _, Result};
use gossipmesh_runtime::RuntimeExt;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::thread_rng;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio::time::{self, Instant};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Encoder;
use tracing::{debug, info, instrument, warn};

use crate::{
    codec::MessageCodec,
    listener::Listeners,
    members::{MergeAction, Membership},
    message::{Message, MessageKind},
    runtime::{GossipRuntime, TaskId},
};

pub use codec::CodecError;
pub use config::{GossiperConfig, GossiperConfigBuilder};
pub use event::MemberEvent;
pub use listener::{MemberEventsListener, MemberListener};
pub use member::{is_later_generation, Member};
pub use state::MemberState;
pub use transport::{Datagram, DatagramTransport, DefaultTransport};

mod codec;
pub mod config;
mod event;
mod listener;
mod member;
mod members;
mod message;
#[cfg(test)]
mod mock_transport;
mod runtime;
mod state;
mod timers;
mod transport;

// SWIM Protocol Implementation for GOSSIPMESH

/// This crate implements a SWIM (Scalable Weakly-consistent Infection-style
/// Membership) gossip engine over UDP. The implementation is split into:
///
/// * Gossiper: the protocol engine. It owns the receive loop, the probe cycle,
///   the bootstrap loop and the sweeper, and answers every message type.
///
/// * Membership: the local table of peer records. All received records go
///   through a single `merge` entry point that applies the generation and state
///   precedence rules and refutes claims about this node.
///
/// * Codec: the compact binary wire format. Every datagram carries the sender's
///   own record and as many piggybacked member records as fit in one packet.
///
/// Failure detection:
/// 1. Once per protocol period, pick a random member and PING it.
/// 2. No ACK within half a period: ask a few other members to probe it for us
///    (REQUEST_PING, relayed as FORWARDED_PING, answered through REQUEST_ACK and
///    FORWARDED_ACK).
/// 3. Still no ACK after another half period: mark it SUSPICIOUS locally.
/// 4. No ACK at all within five periods: mark it DEAD.
/// 5. After the dead cool-off the member stops being gossiped, and after the
///    prune timeout it is removed from the table.
///
/// Dissemination happens only by piggybacking on these messages. A member that
/// learns it is suspected bumps its generation, which outranks any older claim.
pub struct Gossiper {
    inner: Arc<InnerGossiper>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GossiperState {
    Idle,
    Running,
    Stopped,
}

// Generation a node starts with on every launch.
const INITIAL_GENERATION: u8 = 1;

pub(crate) struct InnerGossiper {
    /// Configuration settings for the Gossiper
    config: GossiperConfig,

    /// This node's own record and everything it knows about its peers
    members: Membership,

    /// Communication layer for sending and receiving datagrams
    transport: Arc<dyn DatagramTransport>,

    /// Registered observers of membership events
    listeners: Listeners,

    /// Current state of the Gossiper
    state: RwLock<GossiperState>,

    /// Channel sender for initiating shutdown
    shutdown: broadcast::Sender<()>,

    // runtime owning the receive, bootstrap, probe and sweep loops
    runtime: Arc<GossipRuntime>,
}

impl Clone for Gossiper {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Gossiper {
    /// Creates a new [`Gossiper`] bound to a UDP socket on the configured address.
    pub async fn new(config: GossiperConfig) -> Result<Self> {
        let transport = DefaultTransport::new(config.ip_addr(), config.port()).await?;
        Gossiper::with_transport(config, Arc::new(transport)).await
    }

    /// Creates a new [`Gossiper`] on top of any datagram transport. The
    /// transport's local address is this node's identity.
    pub async fn with_transport(config: GossiperConfig, transport: Arc<dyn DatagramTransport>) -> Result<Self> {
        let local_addr = match transport.local_addr()? {
            SocketAddr::V4(addr) => addr,
            other => bail!("gossip transport must be bound to an IPv4 address, got {}", other),
        };

        let local = Member::new(
            MemberState::Alive,
            local_addr,
            INITIAL_GENERATION,
            config.service,
            config.service_port,
        );
        let members = Membership::new(local, config.dead_cool_off, config.prune_timeout);
        let listeners = Listeners::new(config.member_listeners.clone(), config.member_events_listeners.clone());

        let (shutdown_tx, _) = broadcast::channel(1);
        let runtime: Arc<GossipRuntime> = GossipRuntime::builder()
            .with_metrics_enabled(true)
            .build::<TaskId>();

        Ok(Self {
            inner: Arc::new(InnerGossiper {
                config,
                members,
                transport,
                listeners,
                state: RwLock::new(GossiperState::Idle),
                shutdown: shutdown_tx,
                runtime,
            }),
        })
    }

    /// Runs the gossiper until [`Gossiper::stop`] is called.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let shutdown_rx = self.inner.shutdown.subscribe();
        self.mark_running()?;
        info!(addr = %self.local_addr(), "> [GOSSIPMESH] Server Started");

        let local = self.inner.members.local_member();
        self.inner
            .listeners
            .notify_member_updated(MemberEvent::new(local.endpoint(), SystemTime::now(), &local));

        self.launch_receiver().await?;
        self.launch_bootstrapper().await?;
        self.launch_prober().await?;
        self.launch_sweeper().await?;

        self.wait_till_completion(shutdown_rx).await
    }

    /// Signals the running gossiper to shut down.
    pub async fn stop(&self) -> Result<()> {
        if self.inner.shutdown.send(()).is_err() {
            debug!("Gossiper is not running, nothing to stop");
        }
        Ok(())
    }

    /// Leaves the cluster: marks this node as Left and tells up to `fanout`
    /// random members directly. Gossip spreads it to everyone else.
    pub async fn leave(&self) -> Result<()> {
        self.inner.members.set_local_state(MemberState::Left);

        let targets = self.inner.members.random_members(self.inner.config.fanout, &[]);
        info!("> [GOSSIPMESH] Leaving the cluster, notifying {} members", targets.len());
        for member in targets {
            if let Err(e) = self.send_message(member.endpoint(), MessageKind::Ping).await {
                warn!("Failed to announce departure to {}: {:#}", member.endpoint(), e);
            }
        }
        Ok(())
    }

    /// All members currently in the table, including down members that have not
    /// been pruned yet.
    pub fn members(&self) -> Vec<Member> {
        self.inner.members.members()
    }

    pub fn member(&self, endpoint: SocketAddrV4) -> Option<Member> {
        self.inner.members.member(&endpoint)
    }

    pub fn local_member(&self) -> Member {
        self.inner.members.local_member()
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.inner.members.local_endpoint()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.state.read() == GossiperState::Running
    }

    fn mark_running(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        match *state {
            GossiperState::Idle => {
                *state = GossiperState::Running;
                Ok(())
            }
            GossiperState::Running => Err(anyhow!("gossiper is already running")),
            GossiperState::Stopped => Err(anyhow!("gossiper has been stopped and cannot be restarted")),
        }
    }

    fn runtime(&self) -> Arc<GossipRuntime> {
        self.inner.runtime.clone()
    }

    // handle shutdown signal
    async fn wait_till_completion(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let _ = shutdown_rx.recv().await;
        info!("> [RECV] Initiating graceful shutdown..");
        self.graceful_shutdown().await
    }

    async fn graceful_shutdown(&self) -> Result<()> {
        if let Err(e) = self.inner.runtime.destroy().await {
            warn!("Failed to stop gossip tasks: {:#}", e);
        }
        *self.inner.state.write() = GossiperState::Stopped;
        self.inner.transport.shutdown().await?;

        info!("> [GOSSIPMESH] Gracefully shut down completed.");
        Ok(())
    }

    /// Launches the receive loop. Datagrams are handled one at a time, in the
    /// order the transport hands them over.
    async fn launch_receiver(&self) -> Result<()> {
        let gossiper = self.clone();
        self.runtime()
            .spawn_task(TaskId::Receiver, async move {
                loop {
                    match gossiper.inner.transport.recv().await {
                        Ok(datagram) => gossiper.handle_datagram(datagram).await,
                        Err(e) => {
                            if gossiper.inner.transport.is_closed() {
                                debug!("Transport closed, stopping receiver");
                                break;
                            }
                            warn!("Failed to receive datagram: {:#}", e);
                        }
                    }
                }
                Ok(())
            })
            .await
    }

    /// Launches the bootstrap loop: while the table is empty, ping a random seed
    /// once per protocol period.
    async fn launch_bootstrapper(&self) -> Result<()> {
        let local_addr = self.local_addr();
        let seeds: Vec<SocketAddrV4> = self
            .inner
            .config
            .seeds()
            .iter()
            .copied()
            .filter(|seed| *seed != local_addr)
            .collect();
        if seeds.is_empty() {
            debug!("No seeds to bootstrap from");
            return Ok(());
        }

        let gossiper = self.clone();
        let period = self.inner.config.protocol_period;
        self.runtime()
            .spawn_task(TaskId::Bootstrapper, async move {
                let mut interval = time::interval(period);
                loop {
                    interval.tick().await;
                    if !gossiper.inner.members.is_empty() {
                        break;
                    }
                    let seed = {
                        let mut rng = thread_rng();
                        seeds.choose(&mut rng).copied()
                    };
                    let Some(seed) = seed else {
                        break;
                    };
                    debug!("Bootstrapping from seed {}", seed);
                    if let Err(e) = gossiper.send_message(seed, MessageKind::Ping).await {
                        warn!("Failed to ping seed {}: {:#}", seed, e);
                    }
                }
                info!("> [GOSSIPMESH] Bootstrap completed");
                Ok(())
            })
            .await
    }

    /// Launches the prober, one probe cycle per protocol period.
    async fn launch_prober(&self) -> Result<()> {
        let gossiper = self.clone();
        self.runtime()
            .spawn_recurrent_task(TaskId::Prober, self.inner.config.protocol_period, move || {
                let gossiper = gossiper.clone();
                Box::pin(async move {
                    if !gossiper.is_running() {
                        debug!("Gossiper is no longer running, skipping probe");
                        return Ok(());
                    }
                    gossiper.probe().await;
                    Ok(())
                })
            })
            .await
    }

    /// Launches the sweeper, which expires ACK, cool-off and prune deadlines
    /// once per protocol period.
    async fn launch_sweeper(&self) -> Result<()> {
        let gossiper = self.clone();
        self.runtime()
            .spawn_recurrent_task(TaskId::Sweeper, self.inner.config.protocol_period, move || {
                let gossiper = gossiper.clone();
                Box::pin(async move {
                    gossiper.sweep();
                    Ok(())
                })
            })
            .await
    }

    pub(crate) async fn probe(&self) {
        match self.inner.members.random_member() {
            Some(target) => self.probe_member(target.endpoint()).await,
            None => debug!("No member to probe"),
        }
    }

    pub(crate) async fn probe_member(&self, target: SocketAddrV4) {
        let ack_timeout = self.inner.config.ack_timeout;
        let members = &self.inner.members;

        members.await_ack(target, Instant::now() + self.inner.config.dead_timeout);
        debug!("[PING] Probing {}", target);
        if let Err(e) = self.send_message(target, MessageKind::Ping).await {
            warn!("Failed to ping {}: {:#}", target, e);
        }

        time::sleep(ack_timeout).await;
        if !members.is_awaiting_ack(&target) {
            return;
        }

        let relays = members.random_members(self.inner.config.indirect_endpoints, &[target]);
        debug!("No ACK from {}, asking {} members to probe it", target, relays.len());
        for relay in relays {
            let relay = relay.endpoint();
            if let Err(e) = self.send_message(relay, MessageKind::RequestPing { destination: target }).await {
                warn!("Failed to send indirect probe request to {}: {:#}", relay, e);
            }
        }

        time::sleep(ack_timeout).await;
        if !members.is_awaiting_ack(&target) {
            return;
        }

        if let Some(event) = members.update_state(target, MemberState::Suspicious, Instant::now()) {
            info!("> [GOSSIPMESH] Member {} is now {}", target, event.state);
            self.inner.listeners.notify_local(vec![event]);
        }
    }

    pub(crate) fn sweep(&self) {
        let events = self.inner.members.sweep(Instant::now());
        for event in &events {
            info!("> [GOSSIPMESH] Member {} is now {}", event.member_endpoint(), event.state);
        }
        self.inner.listeners.notify_local(events);
    }

    pub(crate) async fn handle_datagram(&self, datagram: Datagram) {
        let remote = match datagram.remote_addr {
            SocketAddr::V4(remote) => remote,
            other => {
                debug!("Dropping datagram from non-IPv4 sender {}", other);
                return;
            }
        };

        let message = match Message::from_datagram(&datagram.data) {
            Ok(message) => message,
            Err(CodecError::IncompatibleVersion(version)) => {
                info!("Dropping datagram from {} with incompatible protocol version {}", remote, version);
                return;
            }
            Err(e) => {
                warn!("Failed to decode datagram from {}: {}", remote, e);
                return;
            }
        };
        debug!("[RECV] {} from {} with {} records", message.kind.message_type(), remote, message.members.len());

        self.merge_message(remote, &message);
        if let Err(e) = self.respond(remote, message.kind).await {
            warn!("Failed to answer {} from {}: {:#}", message.kind.message_type(), remote, e);
        }
    }

    fn merge_message(&self, remote: SocketAddrV4, message: &Message) {
        let received_at = SystemTime::now();
        let now = Instant::now();

        // Whatever address the sender believes it has, it is known by the one it sends from.
        let mut sender = message.sender.clone();
        sender.ip = *remote.ip();
        sender.gossip_port = remote.port();

        let mut batch = Vec::with_capacity(message.members.len() + 2);
        for record in std::iter::once(&sender).chain(message.members.iter()) {
            batch.push(MemberEvent::new(remote, received_at, record));
            match self.inner.members.merge(remote, received_at, record, now) {
                MergeAction::Added(event) => {
                    info!("> [GOSSIPMESH] Member {} joined as {}", event.member_endpoint(), event.state);
                    self.inner.listeners.notify_member_updated(event);
                }
                MergeAction::Updated { old_state, event } => {
                    info!(
                        "> [GOSSIPMESH] Member {} changed from {} to {} (generation {})",
                        event.member_endpoint(),
                        old_state,
                        event.state,
                        event.generation,
                    );
                    self.inner.listeners.notify_member_updated(event);
                }
                MergeAction::Refuted(event) => {
                    info!("> [GOSSIPMESH] Refuted {} claim from {}, generation is now {}", record.state, remote, event.generation);
                    batch.push(event);
                }
                MergeAction::Unchanged => {}
            }
        }
        self.inner.listeners.notify_member_events(batch);
    }

    async fn respond(&self, remote: SocketAddrV4, kind: MessageKind) -> Result<()> {
        match kind {
            MessageKind::Ping => self.send_message(remote, MessageKind::Ack).await,
            MessageKind::Ack => {
                self.inner.members.ack_received(&remote);
                Ok(())
            }
            MessageKind::RequestPing { destination } if destination == self.local_addr() => {
                self.send_message(remote, MessageKind::Ack).await
            }
            MessageKind::RequestPing { destination } => {
                self.send_message(destination, MessageKind::ForwardedPing { source: remote }).await
            }
            MessageKind::RequestAck { destination } => {
                self.send_message(destination, MessageKind::ForwardedAck { source: remote }).await
            }
            MessageKind::ForwardedPing { source } => {
                self.send_message(remote, MessageKind::RequestAck { destination: source }).await
            }
            MessageKind::ForwardedAck { source } => {
                self.inner.members.ack_received(&source);
                Ok(())
            }
        }
    }

    pub(crate) async fn send_message(&self, target: SocketAddrV4, kind: MessageKind) -> Result<()> {
        let bytes = self.encode_message(kind, target)?;
        self.inner
            .transport
            .send_to(SocketAddr::V4(target), &bytes)
            .await
            .with_context(|| format!("Failed to send {} to {}", kind.message_type(), target))
    }

    /// Encodes a message to `destination` with as many piggybacked records as fit
    /// in one packet, and counts each included record as gossiped once more.
    fn encode_message(&self, kind: MessageKind, destination: SocketAddrV4) -> Result<BytesMut> {
        let max_packet_size = self.inner.config.max_udp_packet_size;
        let mut message = Message::new(kind, self.inner.members.local_member());
        let mut size = message.encoded_len();

        let mut included = Vec::new();
        for member in self.inner.members.snapshot(Some(destination)) {
            let len = member.encoded_len();
            if size + len > max_packet_size {
                break;
            }
            size += len;
            included.push(member.endpoint());
            message.members.push(member);
        }

        let mut codec = MessageCodec::new(max_packet_size);
        let mut dst = BytesMut::with_capacity(size);
        codec.encode(message, &mut dst)?;

        self.inner.members.mark_gossiped(&included);
        Ok(dst)
    }
}
