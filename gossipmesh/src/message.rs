// Gossip message and message type.
use core::fmt;
use std::net::SocketAddrV4;
use tokio_util::{bytes::BytesMut, codec::Decoder};

use crate::codec::{CodecError, MessageCodec, ENDPOINT_LEN, HEADER_LEN};
use crate::member::Member;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageType {
    Ping = 0,
    Ack = 1,
    RequestPing = 2,
    RequestAck = 3,
    ForwardedPing = 4,
    ForwardedAck = 5,
}

impl MessageType {
    pub(crate) fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(MessageType::Ping),
            1 => Ok(MessageType::Ack),
            2 => Ok(MessageType::RequestPing),
            3 => Ok(MessageType::RequestAck),
            4 => Ok(MessageType::ForwardedPing),
            5 => Ok(MessageType::ForwardedAck),
            _ => Err(CodecError::UnknownMessageType(value)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Ping => write!(f, "PING"),
            MessageType::Ack => write!(f, "ACK"),
            MessageType::RequestPing => write!(f, "REQUEST_PING"),
            MessageType::RequestAck => write!(f, "REQUEST_ACK"),
            MessageType::ForwardedPing => write!(f, "FORWARDED_PING"),
            MessageType::ForwardedAck => write!(f, "FORWARDED_ACK"),
        }
    }
}

/// Message type together with its type-specific header.
///
/// Request messages ask a relay to reach `destination` on the sender's behalf.
/// Forwarded messages are sent by a relay and name the member the relay acts for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum MessageKind {
    Ping,
    Ack,
    RequestPing { destination: SocketAddrV4 },
    RequestAck { destination: SocketAddrV4 },
    ForwardedPing { source: SocketAddrV4 },
    ForwardedAck { source: SocketAddrV4 },
}

impl MessageKind {
    pub(crate) fn message_type(&self) -> MessageType {
        match self {
            MessageKind::Ping => MessageType::Ping,
            MessageKind::Ack => MessageType::Ack,
            MessageKind::RequestPing { .. } => MessageType::RequestPing,
            MessageKind::RequestAck { .. } => MessageType::RequestAck,
            MessageKind::ForwardedPing { .. } => MessageType::ForwardedPing,
            MessageKind::ForwardedAck { .. } => MessageType::ForwardedAck,
        }
    }

    /// The endpoint carried in the header, if the type has one.
    pub(crate) fn endpoint(&self) -> Option<SocketAddrV4> {
        match *self {
            MessageKind::Ping | MessageKind::Ack => None,
            MessageKind::RequestPing { destination } | MessageKind::RequestAck { destination } => Some(destination),
            MessageKind::ForwardedPing { source } | MessageKind::ForwardedAck { source } => Some(source),
        }
    }
}

/// A decoded datagram: the header, the sender's own record, then any number of
/// piggybacked member records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Message {
    pub(crate) kind: MessageKind,
    pub(crate) sender: Member,
    pub(crate) members: Vec<Member>,
}

impl Message {
    pub(crate) fn new(kind: MessageKind, sender: Member) -> Self {
        Self {
            kind,
            sender,
            members: Vec::new(),
        }
    }

    pub(crate) fn from_datagram(data: &[u8]) -> Result<Self, CodecError> {
        let mut codec = MessageCodec::default();
        let mut bytes = BytesMut::from(data);
        codec.decode(&mut bytes)?.ok_or(CodecError::EndOfBuffer {
            needed: HEADER_LEN,
            remaining: 0,
        })
    }

    /// Number of bytes the message takes on the wire.
    pub(crate) fn encoded_len(&self) -> usize {
        let header = HEADER_LEN + self.kind.endpoint().map_or(0, |_| ENDPOINT_LEN);
        header
            + self.sender.encoded_len()
            + self.members.iter().map(Member::encoded_len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_message_type_from_u8() {
        for value in 0..=5u8 {
            assert_eq!(MessageType::from_u8(value).unwrap() as u8, value);
        }
        assert!(matches!(MessageType::from_u8(6), Err(CodecError::UnknownMessageType(6))));
    }

    #[test]
    fn test_kind_header_endpoint() {
        let endpoint = SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 7000);
        assert_eq!(MessageKind::Ping.endpoint(), None);
        assert_eq!(MessageKind::RequestAck { destination: endpoint }.endpoint(), Some(endpoint));
        assert_eq!(MessageKind::ForwardedPing { source: endpoint }.endpoint(), Some(endpoint));
        assert_eq!(MessageKind::ForwardedAck { source: endpoint }.message_type().to_string(), "FORWARDED_ACK");
    }
}
