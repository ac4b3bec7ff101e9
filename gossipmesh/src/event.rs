use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::SystemTime;

use crate::member::Member;
use crate::state::MemberState;

/// [`MemberEvent`] is an immutable snapshot of a member's record as observed from
/// `sender` at `received_at`.
///
/// Events are produced when a datagram is received (one observation per carried
/// record), when the membership table accepts a change, and when this node changes
/// a member locally (suspicion, death, pruning). They are handed to listeners and
/// never kept by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEvent {
    pub sender: SocketAddrV4,
    pub received_at: SystemTime,
    pub state: MemberState,
    pub ip: Ipv4Addr,
    pub gossip_port: u16,
    pub generation: u8,
    pub service: u8,
    pub service_port: u16,
}

impl MemberEvent {
    pub(crate) fn new(sender: SocketAddrV4, received_at: SystemTime, member: &Member) -> Self {
        Self {
            sender,
            received_at,
            state: member.state,
            ip: member.ip,
            gossip_port: member.gossip_port,
            generation: member.generation,
            service: member.service,
            service_port: member.service_port,
        }
    }

    /// Same record, but reporting a different state. Used for pruning, which
    /// removes the member instead of storing a new state.
    pub(crate) fn with_state(mut self, state: MemberState) -> Self {
        self.state = state;
        self
    }

    /// Endpoint of the member this event is about.
    pub fn member_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.gossip_port)
    }

    /// Whether the event describes the same member record as `other`, ignoring
    /// who reported it and when.
    pub fn is_same_record(&self, other: &MemberEvent) -> bool {
        self.member_endpoint() == other.member_endpoint()
            && self.state == other.state
            && self.generation == other.generation
    }
}

impl fmt::Display for MemberEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reports {} [{}] gen={}",
            self.sender,
            self.member_endpoint(),
            self.state,
            self.generation,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_copies_member_fields() {
        let sender = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 5870);
        let endpoint = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 5870);
        let member = Member::new(MemberState::Suspicious, endpoint, 9, 2, 9090);
        let received_at = SystemTime::now();

        let event = MemberEvent::new(sender, received_at, &member);
        assert_eq!(event.sender, sender);
        assert_eq!(event.member_endpoint(), endpoint);
        assert_eq!(event.state, MemberState::Suspicious);
        assert_eq!(event.generation, 9);
        assert_eq!(event.service_port, 9090);

        let pruned = event.clone().with_state(MemberState::Pruned);
        assert_eq!(pruned.state, MemberState::Pruned);
        assert!(!pruned.is_same_record(&event));
    }

    #[test]
    fn test_event_serializes_to_json() {
        let sender = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5870);
        let member = Member::new(MemberState::Alive, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5871), 1, 3, 80);
        let event = MemberEvent::new(sender, SystemTime::UNIX_EPOCH, &member);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "Alive");
        assert_eq!(json["gossip_port"], 5871);
        assert_eq!(json["sender"], "127.0.0.1:5870");
    }
}
