use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Payloads that can cross a node boundary. The controllers themselves treat the
///  payload as opaque; only the wire codec (and the event-sourced durable queue,
///  which persists payloads) need this.
pub trait WirePayload: Sized {
    fn ser(&self, buf: &mut BytesMut);
    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self>;
}

impl WirePayload for String {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, self);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        try_get_string(buf)
    }
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        return Err(anyhow!("string of length {} exceeds remaining buffer", len));
    }
    let raw = buf.copy_to_bytes(len);
    Ok(String::from_utf8(raw.to_vec())?)
}

fn put_bool(buf: &mut BytesMut, b: bool) {
    buf.put_u8(b as u8);
}

fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        n => Err(anyhow!("invalid bool encoding: {}", n)),
    }
}

/// The network address of a remote controller: socket address plus a unique part
///  disambiguating incarnations behind the same address. This is the wire-level
///  stand-in for a local reference - a remoting transport maps between the two
///  at the node boundary.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct PeerAddr {
    pub unique: u64,
    pub socket_addr: SocketAddr,
}

impl PeerAddr {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.unique);
        match &self.socket_addr {
            SocketAddr::V4(data) => {
                buf.put_u8(4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            SocketAddr::V6(data) => {
                buf.put_u8(6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerAddr> {
        let unique = buf.try_get_u64()?;
        let socket_addr = match buf.try_get_u8()? {
            4 => {
                let ip = buf.try_get_u32()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            6 => {
                let ip = buf.try_get_u128()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
            }
            n => return Err(anyhow!("invalid socket address discriminator: {}", n)),
        };
        Ok(PeerAddr {
            unique,
            socket_addr,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedMessageData<A> {
    pub producer_id: String,
    pub seq_nr: u64,
    pub first: bool,
    pub ack: bool,
    pub producer_addr: PeerAddr,
    pub msg: A,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestData {
    pub confirmed_seq_nr: u64,
    pub up_to_seq_nr: u64,
    pub support_resend: bool,
    pub via_timeout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendData {
    pub from_seq_nr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckData {
    pub confirmed_seq_nr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterConsumerData {
    pub consumer_addr: PeerAddr,
}

const ID_SEQUENCED_MESSAGE: u8 = 1;
const ID_REQUEST: u8 = 2;
const ID_RESEND: u8 = 3;
const ID_ACK: u8 = 4;
const ID_REGISTER_CONSUMER: u8 = 5;

/// All frames exchanged between a ProducerController and a ConsumerController
///  across a node boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryWireMessage<A> {
    SequencedMessage(SequencedMessageData<A>),
    Request(RequestData),
    Resend(ResendData),
    Ack(AckData),
    RegisterConsumer(RegisterConsumerData),
}

impl<A: WirePayload> DeliveryWireMessage<A> {
    pub fn id(&self) -> u8 {
        match self {
            DeliveryWireMessage::SequencedMessage(_) => ID_SEQUENCED_MESSAGE,
            DeliveryWireMessage::Request(_) => ID_REQUEST,
            DeliveryWireMessage::Resend(_) => ID_RESEND,
            DeliveryWireMessage::Ack(_) => ID_ACK,
            DeliveryWireMessage::RegisterConsumer(_) => ID_REGISTER_CONSUMER,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id());
        match self {
            DeliveryWireMessage::SequencedMessage(data) => Self::ser_sequenced(data, buf),
            DeliveryWireMessage::Request(data) => Self::ser_request(data, buf),
            DeliveryWireMessage::Resend(data) => buf.put_u64(data.from_seq_nr),
            DeliveryWireMessage::Ack(data) => buf.put_u64(data.confirmed_seq_nr),
            DeliveryWireMessage::RegisterConsumer(data) => data.consumer_addr.ser(buf),
        }
    }

    fn ser_sequenced(data: &SequencedMessageData<A>, buf: &mut BytesMut) {
        put_string(buf, &data.producer_id);
        buf.put_u64(data.seq_nr);
        put_bool(buf, data.first);
        put_bool(buf, data.ack);
        data.producer_addr.ser(buf);
        data.msg.ser(buf);
    }

    fn ser_request(data: &RequestData, buf: &mut BytesMut) {
        buf.put_u64(data.confirmed_seq_nr);
        buf.put_u64(data.up_to_seq_nr);
        put_bool(buf, data.support_resend);
        put_bool(buf, data.via_timeout);
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<DeliveryWireMessage<A>> {
        match buf.try_get_u8()? {
            ID_SEQUENCED_MESSAGE => Self::try_deser_sequenced(buf),
            ID_REQUEST => Self::try_deser_request(buf),
            ID_RESEND => Ok(DeliveryWireMessage::Resend(ResendData {
                from_seq_nr: buf.try_get_u64()?,
            })),
            ID_ACK => Ok(DeliveryWireMessage::Ack(AckData {
                confirmed_seq_nr: buf.try_get_u64()?,
            })),
            ID_REGISTER_CONSUMER => Ok(DeliveryWireMessage::RegisterConsumer(
                RegisterConsumerData {
                    consumer_addr: PeerAddr::try_deser(buf)?,
                },
            )),
            id => Err(anyhow!("invalid message discriminator {}", id)),
        }
    }

    fn try_deser_sequenced(buf: &mut impl Buf) -> anyhow::Result<DeliveryWireMessage<A>> {
        let producer_id = try_get_string(buf)?;
        let seq_nr = buf.try_get_u64()?;
        let first = try_get_bool(buf)?;
        let ack = try_get_bool(buf)?;
        let producer_addr = PeerAddr::try_deser(buf)?;
        let msg = A::try_deser(buf)?;

        Ok(DeliveryWireMessage::SequencedMessage(SequencedMessageData {
            producer_id,
            seq_nr,
            first,
            ack,
            producer_addr,
            msg,
        }))
    }

    fn try_deser_request(buf: &mut impl Buf) -> anyhow::Result<DeliveryWireMessage<A>> {
        let confirmed_seq_nr = buf.try_get_u64()?;
        let up_to_seq_nr = buf.try_get_u64()?;
        let support_resend = try_get_bool(buf)?;
        let via_timeout = try_get_bool(buf)?;

        if confirmed_seq_nr > up_to_seq_nr {
            return Err(anyhow!(
                "invalid request: confirmed seq nr {} is above requested-up-to {}",
                confirmed_seq_nr,
                up_to_seq_nr
            ));
        }

        Ok(DeliveryWireMessage::Request(RequestData {
            confirmed_seq_nr,
            up_to_seq_nr,
            support_resend,
            via_timeout,
        }))
    }
}
