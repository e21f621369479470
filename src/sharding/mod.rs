use tokio::sync::mpsc;
use tracing::debug;

use crate::messages::{SequencedMessage, SequencedMessageSink};

mod sharding_consumer;
mod sharding_producer;

pub use sharding_consumer::{
    run_sharding_consumer_controller, sharding_consumer_controller_channel,
    ShardingConsumerControllerRef, ShardingConsumerMsg,
};
pub use sharding_producer::{
    run_sharding_producer_controller, sharding_producer_controller_channel,
    ShardingProducerControllerRef, ShardingProducerMsg, ShardingRequestNext,
};

/// Routing envelope: tells the sharding router which entity a message is for.
#[derive(Debug, Clone)]
pub struct ShardingEnvelope<M> {
    pub entity_id: String,
    pub msg: M,
}

/// Send sink for a per-entity producer controller: every outbound
///  SequencedMessage is wrapped in a [ShardingEnvelope] and handed to the
///  sharding router.
pub struct EntitySink<A> {
    pub entity_id: String,
    pub router: mpsc::Sender<ShardingEnvelope<SequencedMessage<A>>>,
}

impl<A: Clone + Send + 'static> SequencedMessageSink<A> for EntitySink<A> {
    fn send_sequenced(&self, seq_msg: SequencedMessage<A>) {
        let envelope = ShardingEnvelope {
            entity_id: self.entity_id.clone(),
            msg: seq_msg,
        };
        if self.router.try_send(envelope).is_err() {
            debug!(
                "sharding router not accepting messages for entity {:?} - dropping",
                self.entity_id
            );
        }
    }
}
