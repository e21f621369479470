use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::DeliveryConfig;
use crate::consumer::consumer_messages::ConsumerControllerMsg;
use crate::consumer::{consumer_controller_channel, run_consumer_controller, ConsumerControllerRef, Delivery};
use crate::messages::SequencedMessage;
use crate::refs::LocalRef;

pub type ShardingConsumerControllerRef<A> = LocalRef<ShardingConsumerMsg<A>>;

/// There is no RegisterConsumer handshake on the sharded consumer side: the
///  first SequencedMessage from a producer *is* the registration.
pub enum ShardingConsumerMsg<A> {
    Start {
        consumer: mpsc::Sender<Delivery<A>>,
    },
    SequencedMessage(SequencedMessage<A>),
}

const INBOX_CAPACITY: usize = 256;

pub fn sharding_consumer_controller_channel<A>() -> (
    ShardingConsumerControllerRef<A>,
    mpsc::Receiver<ShardingConsumerMsg<A>>,
) {
    LocalRef::channel(INBOX_CAPACITY)
}

/// Runs the fan-in side of sharded delivery: one consumer controller per
///  producer id, all delivering to the same application consumer. Each
///  producer's sequence space is independent.
pub async fn run_sharding_consumer_controller<A: Clone + Debug + Send + 'static>(
    config: Arc<DeliveryConfig>,
    resend_lost: bool,
    mut inbox: mpsc::Receiver<ShardingConsumerMsg<A>>,
) -> anyhow::Result<()> {
    // bounded stash until the application consumer shows up
    let mut stash: VecDeque<SequencedMessage<A>> = VecDeque::new();
    let mut consumer = loop {
        match inbox.recv().await {
            None => return Ok(()),
            Some(ShardingConsumerMsg::Start { consumer }) => break consumer,
            Some(ShardingConsumerMsg::SequencedMessage(seq_msg)) => {
                if stash.len() < config.sharding_buffer_size {
                    stash.push_back(seq_msg);
                } else {
                    warn!(
                        "stash full while waiting for Start - dropping seq nr {} of producer {:?}",
                        seq_msg.seq_nr, seq_msg.producer_id
                    );
                }
            }
        }
    };

    let mut controllers: FxHashMap<String, ConsumerControllerRef<A>> = FxHashMap::default();
    for seq_msg in stash {
        forward(&config, resend_lost, &consumer, &mut controllers, seq_msg);
    }

    loop {
        match inbox.recv().await {
            None => {
                debug!("all references to sharding consumer controller dropped - stopping");
                return Ok(());
            }
            Some(ShardingConsumerMsg::Start { consumer: new_consumer }) => {
                info!("registered new application consumer");
                for controller in controllers.values() {
                    controller.try_send(ConsumerControllerMsg::Start {
                        consumer: new_consumer.clone(),
                    });
                }
                consumer = new_consumer;
            }
            Some(ShardingConsumerMsg::SequencedMessage(seq_msg)) => {
                forward(&config, resend_lost, &consumer, &mut controllers, seq_msg);
            }
        }
    }
}

fn forward<A: Clone + Debug + Send + 'static>(
    config: &Arc<DeliveryConfig>,
    resend_lost: bool,
    consumer: &mpsc::Sender<Delivery<A>>,
    controllers: &mut FxHashMap<String, ConsumerControllerRef<A>>,
    seq_msg: SequencedMessage<A>,
) {
    if !controllers.contains_key(&seq_msg.producer_id) {
        info!(
            producer_id = %seq_msg.producer_id,
            "spawning consumer controller for new producer"
        );
        let (cc_ref, cc_inbox) = consumer_controller_channel();
        {
            let config = config.clone();
            let cc_ref = cc_ref.clone();
            let producer_id = seq_msg.producer_id.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    run_consumer_controller(config, resend_lost, cc_ref, cc_inbox).await
                {
                    error!("consumer controller for producer {} failed: {}", producer_id, e);
                }
            });
        }
        cc_ref.try_send(ConsumerControllerMsg::Start {
            consumer: consumer.clone(),
        });
        controllers.insert(seq_msg.producer_id.clone(), cc_ref);
    }

    controllers
        .get(&seq_msg.producer_id)
        .expect("inserted above")
        .try_send(ConsumerControllerMsg::SequencedMessage(seq_msg));
}
