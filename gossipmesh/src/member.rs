use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::state::MemberState;

/// Size of the generation window, in either direction, inside which a generation
/// counts as newer. Anything further away is treated as having wrapped.
const GENERATION_WINDOW: i16 = 191;

/// Reports whether `candidate` is a later generation than `current`.
///
/// Generations are a single wrapping byte, so the comparison works on the signed
/// distance between the two: a candidate is later when it sits up to 190 steps
/// ahead, or when it is at least 191 steps behind (it has wrapped past 255).
pub fn is_later_generation(current: u8, candidate: u8) -> bool {
    let diff = candidate as i16 - current as i16;
    (diff > 0 && diff < GENERATION_WINDOW) || diff <= -GENERATION_WINDOW
}

/// [`Member`] is what this node currently believes about one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub state: MemberState,
    pub ip: Ipv4Addr,
    pub gossip_port: u16,
    pub generation: u8,
    pub service: u8,
    pub service_port: u16,

    // Number of outgoing packets that carried this record since its last update.
    // Members with the lowest count are gossiped first.
    pub(crate) gossip_counter: u64,
}

impl Member {
    pub fn new(
        state: MemberState,
        endpoint: SocketAddrV4,
        generation: u8,
        service: u8,
        service_port: u16,
    ) -> Self {
        Self {
            state,
            ip: *endpoint.ip(),
            gossip_port: endpoint.port(),
            generation,
            service,
            service_port,
            gossip_counter: 0,
        }
    }

    /// Identity of the member on the gossip network.
    pub fn endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.gossip_port)
    }

    /// Endpoint of the advertised service, when the member is alive.
    pub fn service_endpoint(&self) -> Option<SocketAddrV4> {
        (self.state == MemberState::Alive).then(|| SocketAddrV4::new(self.ip, self.service_port))
    }

    pub fn gossip_counter(&self) -> u64 {
        self.gossip_counter
    }

    pub fn is_later_generation(&self, generation: u8) -> bool {
        is_later_generation(self.generation, generation)
    }

    /// Whether `incoming` should replace this record: it carries a later
    /// generation, or the same generation with a higher-precedence state.
    pub(crate) fn is_superseded_by(&self, incoming: &Member) -> bool {
        self.is_later_generation(incoming.generation)
            || (incoming.generation == self.generation && incoming.state > self.state)
    }

    /// Applies an accepted record. Only Alive records carry service details, so
    /// the last known service is kept otherwise.
    pub(crate) fn apply(&mut self, incoming: &Member) {
        self.state = incoming.state;
        self.generation = incoming.generation;
        if incoming.state == MemberState::Alive {
            self.service = incoming.service;
            self.service_port = incoming.service_port;
        }
        self.gossip_counter = 0;
    }

    pub(crate) fn set_state(&mut self, state: MemberState) {
        self.state = state;
        self.gossip_counter = 0;
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] gen={} service={}:{}",
            self.endpoint(),
            self.state,
            self.generation,
            self.service,
            self.service_port,
        )
    }
}
