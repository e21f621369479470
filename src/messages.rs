use crate::consumer::consumer_messages::ConsumerControllerMsg;
use crate::consumer::ConsumerControllerRef;
use crate::producer::ProducerControllerRef;

/// The envelope a producer controller wraps every application message in before
///  it goes to the consumer side.
///
/// `seq_nr` is gap-free and monotone within one producer epoch. `first` marks the
///  epoch's leading message (and its retransmissions) - it is what bootstraps a
///  fresh consumer and what re-binds one after a producer change. `ack` asks the
///  consumer side for a prompt Ack on confirmation instead of waiting for the
///  next Request refresh.
///
/// `producer_controller` is the back-reference the consumer side replies to; its
///  identity is also how a producer change is detected.
#[derive(Debug, Clone)]
pub struct SequencedMessage<A> {
    pub producer_id: String,
    pub seq_nr: u64,
    pub msg: A,
    pub first: bool,
    pub ack: bool,
    pub producer_controller: ProducerControllerRef<A>,
}

/// Where a producer controller transmits its SequencedMessages.
///
/// The default target is the registered consumer controller's inbox; the
///  sharding wrapper registers a sink that wraps messages into a
///  ShardingEnvelope instead, and tests register lossy links.
pub trait SequencedMessageSink<A>: Send + Sync + 'static {
    fn send_sequenced(&self, seq_msg: SequencedMessage<A>);
}

impl<A: Send + 'static> SequencedMessageSink<A> for ConsumerControllerRef<A> {
    fn send_sequenced(&self, seq_msg: SequencedMessage<A>) {
        self.try_send(ConsumerControllerMsg::SequencedMessage(seq_msg));
    }
}
