use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;
use tokio_util::{bytes::{Buf, BufMut as _, BytesMut}, codec::{Decoder, Encoder}};

use crate::config::DEFAULT_MAX_UDP_PACKET_SIZE;
use crate::member::Member;
use crate::message::{Message, MessageKind, MessageType};
use crate::state::MemberState;

pub(crate) const PROTOCOL_VERSION: u8 = 0x00;
pub(crate) const HEADER_LEN: usize = 2; // version + message type
pub(crate) const IP_ADDRESS_LEN: usize = 4;
pub(crate) const PORT_LEN: usize = 2;
pub(crate) const ENDPOINT_LEN: usize = IP_ADDRESS_LEN + PORT_LEN;
pub(crate) const MEMBER_RECORD_LEN: usize = 1 + ENDPOINT_LEN + 1; // state, endpoint, generation
pub(crate) const SERVICE_LEN: usize = 1 + PORT_LEN;
pub(crate) const MAX_MEMBER_RECORD_LEN: usize = MEMBER_RECORD_LEN + SERVICE_LEN;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("end of buffer: needed {needed} bytes, {remaining} remaining")]
    EndOfBuffer { needed: usize, remaining: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("unknown member state {0:#04x}")]
    UnknownMemberState(u8),

    #[error("incompatible protocol version {0:#04x}")]
    IncompatibleVersion(u8),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// [`MessageCodec`] reads and writes the gossip wire format.
///
/// ```text
/// [version:1][type:1]{endpoint:6 for request and forwarded types}
/// [sender record]{member record}*
///
/// member record: [state:1][ip:4][port:2][generation:1] then, only when
///                Alive, [service:1][service port:2]
/// ```
///
/// Multi-byte integers are big-endian. Every read checks the remaining length
/// first, and every write checks the remaining packet budget first, so a short
/// buffer or a full packet fails with [`CodecError::EndOfBuffer`] and never
/// leaves a half-written field behind.
pub(crate) struct MessageCodec {
    max_packet_size: usize,
}

impl MessageCodec {
    pub(crate) fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    fn ensure_remaining<B: Buf>(src: &B, needed: usize) -> Result<(), CodecError> {
        if src.remaining() < needed {
            return Err(CodecError::EndOfBuffer {
                needed,
                remaining: src.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn read_ip_address<B: Buf>(src: &mut B) -> Result<Ipv4Addr, CodecError> {
        Self::ensure_remaining(&*src, IP_ADDRESS_LEN)?;
        Ok(Ipv4Addr::from(src.get_u32()))
    }

    pub(crate) fn read_port<B: Buf>(src: &mut B) -> Result<u16, CodecError> {
        Self::ensure_remaining(&*src, PORT_LEN)?;
        Ok(src.get_u16())
    }

    pub(crate) fn read_ip_endpoint<B: Buf>(src: &mut B) -> Result<SocketAddrV4, CodecError> {
        Self::ensure_remaining(&*src, ENDPOINT_LEN)?;
        let ip = Self::read_ip_address(src)?;
        let port = Self::read_port(src)?;
        Ok(SocketAddrV4::new(ip, port))
    }

    pub(crate) fn read_message_type<B: Buf>(src: &mut B) -> Result<MessageType, CodecError> {
        Self::ensure_remaining(&*src, 1)?;
        MessageType::from_u8(src.get_u8())
    }

    pub(crate) fn read_member_state<B: Buf>(src: &mut B) -> Result<MemberState, CodecError> {
        Self::ensure_remaining(&*src, 1)?;
        MemberState::from_u8(src.get_u8())
    }

    pub(crate) fn read_member<B: Buf>(src: &mut B) -> Result<Member, CodecError> {
        let state = Self::read_member_state(src)?;
        let endpoint = Self::read_ip_endpoint(src)?;
        Self::ensure_remaining(&*src, 1)?;
        let generation = src.get_u8();

        let (service, service_port) = if state == MemberState::Alive {
            Self::ensure_remaining(&*src, SERVICE_LEN)?;
            (src.get_u8(), src.get_u16())
        } else {
            (0, 0)
        };

        Ok(Member::new(state, endpoint, generation, service, service_port))
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UDP_PACKET_SIZE)
    }
}

impl Member {
    /// Bytes taken by this member's record on the wire.
    pub(crate) fn encoded_len(&self) -> usize {
        if self.state == MemberState::Alive {
            MAX_MEMBER_RECORD_LEN
        } else {
            MEMBER_RECORD_LEN
        }
    }
}

/// [`WireWriter`] appends fields to a buffer without ever growing it past the
/// capacity it was created with.
pub(crate) struct WireWriter<'a> {
    dst: &'a mut BytesMut,
    limit: usize,
}

impl<'a> WireWriter<'a> {
    pub(crate) fn new(dst: &'a mut BytesMut, capacity: usize) -> Self {
        let limit = dst.len() + capacity;
        Self { dst, limit }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.dst.len())
    }

    fn ensure_capacity(&self, needed: usize) -> Result<(), CodecError> {
        if self.remaining() < needed {
            return Err(CodecError::EndOfBuffer {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn write_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.ensure_capacity(1)?;
        self.dst.put_u8(value);
        Ok(())
    }

    pub(crate) fn write_port(&mut self, port: u16) -> Result<(), CodecError> {
        self.ensure_capacity(PORT_LEN)?;
        self.dst.put_u16(port);
        Ok(())
    }

    pub(crate) fn write_ip_address(&mut self, ip: IpAddr) -> Result<(), CodecError> {
        let IpAddr::V4(ip) = ip else {
            return Err(CodecError::InvalidArgument("only IPv4 addresses can be encoded"));
        };
        self.ensure_capacity(IP_ADDRESS_LEN)?;
        self.dst.put_slice(&ip.octets());
        Ok(())
    }

    pub(crate) fn write_ip_endpoint(&mut self, endpoint: SocketAddr) -> Result<(), CodecError> {
        if endpoint.is_ipv6() {
            return Err(CodecError::InvalidArgument("only IPv4 endpoints can be encoded"));
        }
        self.ensure_capacity(ENDPOINT_LEN)?;
        self.write_ip_address(endpoint.ip())?;
        self.write_port(endpoint.port())
    }

    pub(crate) fn write_message_type(&mut self, message_type: MessageType) -> Result<(), CodecError> {
        self.write_u8(message_type as u8)
    }

    pub(crate) fn write_member_state(&mut self, state: MemberState) -> Result<(), CodecError> {
        if state == MemberState::Pruned {
            return Err(CodecError::InvalidArgument("pruned members are never sent"));
        }
        self.write_u8(state as u8)
    }

    pub(crate) fn write_member(&mut self, member: &Member) -> Result<(), CodecError> {
        if member.state == MemberState::Pruned {
            return Err(CodecError::InvalidArgument("pruned members are never sent"));
        }
        self.ensure_capacity(member.encoded_len())?;
        self.write_member_state(member.state)?;
        self.write_ip_endpoint(SocketAddr::V4(member.endpoint()))?;
        self.write_u8(member.generation)?;
        if member.state == MemberState::Alive {
            self.write_u8(member.service)?;
            self.write_port(member.service_port)?;
        }
        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    /// Encodes a `Message` into `dst`. Fails if the message does not fit in the
    /// configured maximum packet size.
    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut writer = WireWriter::new(dst, self.max_packet_size);
        writer.write_u8(PROTOCOL_VERSION)?;
        writer.write_message_type(item.kind.message_type())?;
        if let Some(endpoint) = item.kind.endpoint() {
            writer.write_ip_endpoint(SocketAddr::V4(endpoint))?;
        }

        writer.write_member(&item.sender)?;
        for member in &item.members {
            writer.write_member(member)?;
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    /// Decodes one whole datagram. Any trailing bytes must form complete member
    /// records, otherwise the datagram is rejected.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let version = src.get_u8();
        if version != PROTOCOL_VERSION {
            src.clear();
            return Err(CodecError::IncompatibleVersion(version));
        }

        let kind = match Self::read_message_type(src)? {
            MessageType::Ping => MessageKind::Ping,
            MessageType::Ack => MessageKind::Ack,
            MessageType::RequestPing => MessageKind::RequestPing { destination: Self::read_ip_endpoint(src)? },
            MessageType::RequestAck => MessageKind::RequestAck { destination: Self::read_ip_endpoint(src)? },
            MessageType::ForwardedPing => MessageKind::ForwardedPing { source: Self::read_ip_endpoint(src)? },
            MessageType::ForwardedAck => MessageKind::ForwardedAck { source: Self::read_ip_endpoint(src)? },
        };

        let sender = Self::read_member(src)?;
        let mut members = Vec::new();
        while src.has_remaining() {
            members.push(Self::read_member(src)?);
        }

        Ok(Some(Message { kind, sender, members }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn endpoint(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, last), port)
    }

    fn alive(last: u8) -> Member {
        Member::new(MemberState::Alive, endpoint(last, 5870), 1, 2, 8080)
    }

    #[test]
    fn test_ip_address_and_port_round_trip() {
        let mut buffer = BytesMut::new();
        let mut writer = WireWriter::new(&mut buffer, 6);
        writer.write_ip_address(IpAddr::V4(Ipv4Addr::new(10, 20, 30, 40))).unwrap();
        writer.write_port(0xBEEF).unwrap();
        assert_eq!(&buffer[..], &[10, 20, 30, 40, 0xBE, 0xEF]);

        let mut src = buffer.freeze();
        assert_eq!(MessageCodec::read_ip_address(&mut src).unwrap(), Ipv4Addr::new(10, 20, 30, 40));
        assert_eq!(MessageCodec::read_port(&mut src).unwrap(), 0xBEEF);
    }

    #[test]
    fn test_endpoint_round_trip() {
        let addr = endpoint(7, 65535);
        let mut buffer = BytesMut::new();
        WireWriter::new(&mut buffer, ENDPOINT_LEN).write_ip_endpoint(SocketAddr::V4(addr)).unwrap();
        assert_eq!(buffer.len(), ENDPOINT_LEN);

        let decoded = MessageCodec::read_ip_endpoint(&mut buffer).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn test_member_round_trip() {
        let members = vec![
            alive(1),
            Member::new(MemberState::Suspicious, endpoint(2, 1000), 255, 0, 0),
            Member::new(MemberState::Left, endpoint(3, 1), 0, 0, 0),
        ];

        let mut buffer = BytesMut::new();
        let mut writer = WireWriter::new(&mut buffer, 64);
        for member in &members {
            writer.write_member(member).unwrap();
        }
        assert_eq!(buffer.len(), MAX_MEMBER_RECORD_LEN + 2 * MEMBER_RECORD_LEN);

        for member in &members {
            assert_eq!(&MessageCodec::read_member(&mut buffer).unwrap(), member);
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_short_buffers_fail_with_end_of_buffer() {
        let mut src = &[10u8, 0, 0][..];
        assert!(matches!(
            MessageCodec::read_ip_address(&mut src),
            Err(CodecError::EndOfBuffer { needed: 4, remaining: 3 })
        ));

        let mut src = &[1u8][..];
        assert!(matches!(MessageCodec::read_port(&mut src), Err(CodecError::EndOfBuffer { .. })));

        let mut src = &[1u8, 2, 3, 4, 5][..];
        assert!(matches!(MessageCodec::read_ip_endpoint(&mut src), Err(CodecError::EndOfBuffer { .. })));

        // Alive record missing its service fields
        let mut src = &[0u8, 127, 0, 0, 1, 0x16, 0xEE, 1, 2][..];
        assert!(matches!(MessageCodec::read_member(&mut src), Err(CodecError::EndOfBuffer { .. })));

        let mut src = &[][..];
        assert!(matches!(MessageCodec::read_message_type(&mut src), Err(CodecError::EndOfBuffer { .. })));
    }

    #[test]
    fn test_writes_past_capacity_fail_without_partial_output() {
        let mut buffer = BytesMut::new();
        let mut writer = WireWriter::new(&mut buffer, 5);
        assert!(matches!(
            writer.write_ip_endpoint(SocketAddr::V4(endpoint(1, 80))),
            Err(CodecError::EndOfBuffer { needed: 6, remaining: 5 })
        ));
        assert!(matches!(writer.write_member(&alive(1)), Err(CodecError::EndOfBuffer { .. })));
        assert_eq!(writer.remaining(), 5);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_invalid_arguments() {
        let mut buffer = BytesMut::new();
        let mut writer = WireWriter::new(&mut buffer, 64);
        assert!(matches!(
            writer.write_ip_address(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            Err(CodecError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.write_ip_endpoint("[::1]:80".parse().unwrap()),
            Err(CodecError::InvalidArgument(_))
        ));

        let mut pruned = alive(1);
        pruned.state = MemberState::Pruned;
        assert!(matches!(writer.write_member(&pruned), Err(CodecError::InvalidArgument(_))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_message_round_trip() {
        let mut message = Message::new(MessageKind::RequestPing { destination: endpoint(9, 5870) }, alive(1));
        message.members.push(alive(2));
        message.members.push(Member::new(MemberState::Dead, endpoint(3, 5870), 4, 0, 0));
        let expected_len = message.encoded_len();

        let mut codec = MessageCodec::default();
        let mut buffer = BytesMut::new();
        codec.encode(message.clone(), &mut buffer).unwrap();
        assert_eq!(buffer.len(), expected_len);
        assert_eq!(buffer[0], PROTOCOL_VERSION);
        assert_eq!(buffer[1], MessageType::RequestPing as u8);

        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_encode_rejects_oversized_message() {
        let mut message = Message::new(MessageKind::Ping, alive(1));
        for last in 2..10 {
            message.members.push(alive(last));
        }

        let mut codec = MessageCodec::new(HEADER_LEN + 3 * MAX_MEMBER_RECORD_LEN);
        let mut buffer = BytesMut::new();
        assert!(matches!(codec.encode(message, &mut buffer), Err(CodecError::EndOfBuffer { .. })));
    }

    #[test]
    fn test_decode_rejects_bad_datagrams() {
        let mut codec = MessageCodec::default();

        let mut wrong_version = BytesMut::from(&[0x01u8, 0x00][..]);
        assert!(matches!(codec.decode(&mut wrong_version), Err(CodecError::IncompatibleVersion(1))));

        let mut unknown_type = BytesMut::from(&[PROTOCOL_VERSION, 0x09][..]);
        assert!(matches!(codec.decode(&mut unknown_type), Err(CodecError::UnknownMessageType(9))));

        let mut missing_sender = BytesMut::from(&[PROTOCOL_VERSION, MessageType::Ack as u8][..]);
        assert!(matches!(codec.decode(&mut missing_sender), Err(CodecError::EndOfBuffer { .. })));

        let mut empty = BytesMut::new();
        assert!(codec.decode(&mut empty).unwrap().is_none());
        assert!(Message::from_datagram(&[]).is_err());
    }
}
