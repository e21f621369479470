use std::collections::BTreeMap;
use std::collections::VecDeque;

use anyhow::anyhow;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use tokio::sync::oneshot;

use crate::wire_messages::{put_string, try_get_string, WirePayload};

pub mod event_sourced;

/// The empty qualifier denotes the point-to-point case. Sharding partitions one
///  queue's stream by entity id instead.
pub const NO_QUALIFIER: &str = "";

/// A message that was handed to the transmission path and is not confirmed yet.
///  This is what gets persisted before the producer controller considers the
///  message sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSent<A> {
    pub seq_nr: u64,
    pub msg: A,
    pub ack: bool,
    pub qualifier: String,
}

const ID_MESSAGE_SENT: u8 = 1;
const ID_CONFIRMED: u8 = 2;

/// The two persisted event kinds of a durable producer queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent<A> {
    MessageSent(MessageSent<A>),
    Confirmed { seq_nr: u64, qualifier: String },
}

impl<A: WirePayload> QueueEvent<A> {
    pub fn id(&self) -> u8 {
        match self {
            QueueEvent::MessageSent(_) => ID_MESSAGE_SENT,
            QueueEvent::Confirmed { .. } => ID_CONFIRMED,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.id());
        match self {
            QueueEvent::MessageSent(sent) => ser_message_sent(sent, buf),
            QueueEvent::Confirmed { seq_nr, qualifier } => {
                buf.put_u64(*seq_nr);
                put_string(buf, qualifier);
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<QueueEvent<A>> {
        match buf.try_get_u8()? {
            ID_MESSAGE_SENT => Ok(QueueEvent::MessageSent(try_deser_message_sent(buf)?)),
            ID_CONFIRMED => {
                let seq_nr = buf.try_get_u64()?;
                let qualifier = try_get_string(buf)?;
                Ok(QueueEvent::Confirmed { seq_nr, qualifier })
            }
            id => Err(anyhow!("invalid queue event discriminator {}", id)),
        }
    }
}

fn ser_message_sent<A: WirePayload>(sent: &MessageSent<A>, buf: &mut BytesMut) {
    buf.put_u64(sent.seq_nr);
    buf.put_u8(sent.ack as u8);
    put_string(buf, &sent.qualifier);
    sent.msg.ser(buf);
}

fn try_deser_message_sent<A: WirePayload>(buf: &mut impl Buf) -> anyhow::Result<MessageSent<A>> {
    let seq_nr = buf.try_get_u64()?;
    let ack = buf.try_get_u8()? != 0;
    let qualifier = try_get_string(buf)?;
    let msg = A::try_deser(buf)?;
    Ok(MessageSent {
        seq_nr,
        msg,
        ack,
        qualifier,
    })
}

/// The queue's state as reloaded into a restarting producer controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueState<A> {
    /// the next sequence number to assign
    pub current_seq_nr: u64,
    pub highest_confirmed_seq_nr: u64,
    pub confirmed_seq_nr_by_qualifier: BTreeMap<String, u64>,
    pub unconfirmed: VecDeque<MessageSent<A>>,
}

impl<A> QueueState<A> {
    pub fn initial() -> QueueState<A> {
        QueueState {
            current_seq_nr: 1,
            highest_confirmed_seq_nr: 0,
            confirmed_seq_nr_by_qualifier: BTreeMap::new(),
            unconfirmed: VecDeque::new(),
        }
    }

    pub fn apply(&mut self, event: QueueEvent<A>) {
        match event {
            QueueEvent::MessageSent(sent) => {
                self.current_seq_nr = sent.seq_nr + 1;
                self.unconfirmed.push_back(sent);
            }
            QueueEvent::Confirmed { seq_nr, qualifier } => {
                self.unconfirmed
                    .retain(|m| m.qualifier != qualifier || m.seq_nr > seq_nr);

                let by_qualifier = self
                    .confirmed_seq_nr_by_qualifier
                    .entry(qualifier)
                    .or_insert(0);
                *by_qualifier = (*by_qualifier).max(seq_nr);
                self.highest_confirmed_seq_nr = self.highest_confirmed_seq_nr.max(seq_nr);
            }
        }
    }

    pub fn confirmed_seq_nr_for(&self, qualifier: &str) -> u64 {
        self.confirmed_seq_nr_by_qualifier
            .get(qualifier)
            .copied()
            .unwrap_or(0)
    }
}

impl<A: WirePayload> QueueState<A> {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u64(self.current_seq_nr);
        buf.put_u64(self.highest_confirmed_seq_nr);
        buf.put_usize_varint(self.confirmed_seq_nr_by_qualifier.len());
        for (qualifier, seq_nr) in &self.confirmed_seq_nr_by_qualifier {
            put_string(buf, qualifier);
            buf.put_u64(*seq_nr);
        }
        buf.put_usize_varint(self.unconfirmed.len());
        for sent in &self.unconfirmed {
            ser_message_sent(sent, buf);
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<QueueState<A>> {
        let current_seq_nr = buf.try_get_u64()?;
        let highest_confirmed_seq_nr = buf.try_get_u64()?;

        let num_qualifiers = buf.try_get_usize_varint()?;
        let mut confirmed_seq_nr_by_qualifier = BTreeMap::new();
        for _ in 0..num_qualifiers {
            let qualifier = try_get_string(buf)?;
            let seq_nr = buf.try_get_u64()?;
            confirmed_seq_nr_by_qualifier.insert(qualifier, seq_nr);
        }

        let num_unconfirmed = buf.try_get_usize_varint()?;
        let mut unconfirmed = VecDeque::with_capacity(num_unconfirmed);
        for _ in 0..num_unconfirmed {
            unconfirmed.push_back(try_deser_message_sent(buf)?);
        }

        Ok(QueueState {
            current_seq_nr,
            highest_confirmed_seq_nr,
            confirmed_seq_nr_by_qualifier,
            unconfirmed,
        })
    }
}

pub struct StoreMessageSentAck {
    pub stored_seq_nr: u64,
}

/// The commands a durable producer queue consumes. The queue is an exclusive
///  child of its producer controller; LoadState and StoreMessageSent are
///  request/reply, StoreMessageConfirmed is write-behind.
pub enum DurableQueueCommand<A> {
    LoadState {
        reply_to: oneshot::Sender<QueueState<A>>,
    },
    StoreMessageSent {
        sent: MessageSent<A>,
        reply_to: oneshot::Sender<StoreMessageSentAck>,
    },
    StoreMessageConfirmed {
        seq_nr: u64,
        qualifier: String,
    },
}
