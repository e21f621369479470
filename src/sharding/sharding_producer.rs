use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::anyhow;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::DeliveryConfig;
use crate::durable_queue::{DurableQueueCommand, MessageSent, QueueState};
use crate::messages::SequencedMessage;
use crate::producer::producer_messages::{ProducerControllerMsg, ProducerControllerRef, RequestNext};
use crate::producer::{load_initial_state, producer_controller_channel, run_producer_controller};
use crate::refs::LocalRef;
use crate::sharding::{EntitySink, ShardingEnvelope};

pub type ShardingProducerControllerRef<A> = LocalRef<ShardingProducerMsg<A>>;

pub enum ShardingProducerMsg<A> {
    Start {
        producer: mpsc::Sender<ShardingRequestNext<A>>,
    },
    Msg(ShardingEnvelope<A>),
    MsgWithConfirmation {
        envelope: ShardingEnvelope<A>,
        reply_to: oneshot::Sender<u64>,
    },
    /// demand signal from one of the per-entity producer controllers
    WrappedRequestNext {
        entity_id: String,
        inner: RequestNext<A>,
    },
}

/// Demand signal to the application producer. Unlike the point-to-point
///  [RequestNext] this is not one-at-a-time: messages for entities without
///  demand are buffered (bounded), and the signal is re-emitted whenever the
///  demand picture changes.
#[derive(Debug, Clone)]
pub struct ShardingRequestNext<A> {
    pub producer_id: String,
    pub send_next_to: ShardingProducerControllerRef<A>,
    pub entities_with_demand: BTreeSet<String>,
    pub buffered_for_entities_without_demand: BTreeMap<String, usize>,
}

impl<A> ShardingRequestNext<A> {
    pub async fn send_next(&self, entity_id: impl Into<String>, msg: A) -> anyhow::Result<()> {
        self.send_next_to
            .send(ShardingProducerMsg::Msg(ShardingEnvelope {
                entity_id: entity_id.into(),
                msg,
            }))
            .await
    }

    pub async fn ask_next(&self, entity_id: impl Into<String>, msg: A) -> anyhow::Result<u64> {
        let (reply_to, reply) = oneshot::channel();
        self.send_next_to
            .send(ShardingProducerMsg::MsgWithConfirmation {
                envelope: ShardingEnvelope {
                    entity_id: entity_id.into(),
                    msg,
                },
                reply_to,
            })
            .await?;
        Ok(reply.await?)
    }
}

const INBOX_CAPACITY: usize = 256;

pub fn sharding_producer_controller_channel<A>() -> (
    ShardingProducerControllerRef<A>,
    mpsc::Receiver<ShardingProducerMsg<A>>,
) {
    LocalRef::channel(INBOX_CAPACITY)
}

struct Buffered<A> {
    msg: A,
    /// the durable (outer) seq nr if the message was already stored
    outer_seq_nr: Option<u64>,
    reply_to: Option<oneshot::Sender<u64>>,
}

struct OutState<A> {
    producer_controller: ProducerControllerRef<A>,
    /// the inner seq nr the entity's controller will assign next, while it has
    ///  demand outstanding
    next_inner_seq_nr: Option<u64>,
    buffered: VecDeque<Buffered<A>>,
    /// durable bookkeeping: (outer seq nr, inner seq nr) of routed messages
    unconfirmed: VecDeque<(u64, u64)>,
}

struct ShardingProducerController<A> {
    config: Arc<DeliveryConfig>,
    producer_id: String,
    self_ref: ShardingProducerControllerRef<A>,
    router: mpsc::Sender<ShardingEnvelope<SequencedMessage<A>>>,
    durable_queue: Option<mpsc::Sender<DurableQueueCommand<A>>>,
    producer: mpsc::Sender<ShardingRequestNext<A>>,

    out: FxHashMap<String, OutState<A>>,
    /// next durable (outer) seq nr, counting messages across all entities
    current_seq_nr: u64,
    last_summary: Option<(BTreeSet<String>, BTreeMap<String, usize>)>,
}

/// Runs the fan-out side of sharded delivery: one producer controller per
///  entity id behind a single demand-aggregating facade.
///
/// When a durable queue is attached the facade owns it: messages are persisted
///  (qualifier = entity id) before they are routed, and per-entity confirmations
///  are written back as the inner controllers report progress.
pub async fn run_sharding_producer_controller<A: Clone + Debug + Send + Sync + 'static>(
    config: Arc<DeliveryConfig>,
    producer_id: String,
    self_ref: ShardingProducerControllerRef<A>,
    mut inbox: mpsc::Receiver<ShardingProducerMsg<A>>,
    router: mpsc::Sender<ShardingEnvelope<SequencedMessage<A>>>,
    durable_queue: Option<mpsc::Sender<DurableQueueCommand<A>>>,
) -> anyhow::Result<()> {
    let loaded = match &durable_queue {
        Some(queue) => load_initial_state(queue, &config).await?,
        None => QueueState::initial(),
    };

    let mut stash = Vec::new();
    let producer = loop {
        match inbox.recv().await {
            None => return Ok(()),
            Some(ShardingProducerMsg::Start { producer }) => break producer,
            Some(other) => stash.push(other),
        }
    };

    let mut controller = ShardingProducerController {
        config,
        producer_id,
        self_ref,
        router,
        durable_queue,
        producer,
        out: FxHashMap::default(),
        current_seq_nr: loaded.current_seq_nr,
        last_summary: None,
    };

    // unconfirmed messages from a previous incarnation go back into the
    //  per-entity buffers, ahead of anything new
    for sent in loaded.unconfirmed {
        controller.ensure_out(&sent.qualifier);
        let out = controller
            .out
            .get_mut(&sent.qualifier)
            .expect("ensure_out inserts the entry");
        out.buffered.push_back(Buffered {
            msg: sent.msg,
            outer_seq_nr: Some(sent.seq_nr),
            reply_to: None,
        });
    }
    controller.emit_request_next_if_changed().await;

    for msg in stash {
        on_message(&mut controller, msg).await?;
    }
    loop {
        match inbox.recv().await {
            None => {
                debug!(
                    "all references to sharding producer controller {} dropped - stopping",
                    controller.producer_id
                );
                return Ok(());
            }
            Some(msg) => on_message(&mut controller, msg).await?,
        }
    }
}

async fn on_message<A: Clone + Debug + Send + Sync + 'static>(
    controller: &mut ShardingProducerController<A>,
    msg: ShardingProducerMsg<A>,
) -> anyhow::Result<()> {
    match msg {
        ShardingProducerMsg::Start { producer } => {
            info!(
                producer_id = %controller.producer_id,
                "registered new application producer"
            );
            controller.producer = producer;
            controller.last_summary = None;
            controller.emit_request_next_if_changed().await;
            Ok(())
        }
        ShardingProducerMsg::Msg(envelope) => {
            controller.on_msg(envelope.entity_id, envelope.msg, None).await
        }
        ShardingProducerMsg::MsgWithConfirmation { envelope, reply_to } => {
            controller
                .on_msg(envelope.entity_id, envelope.msg, Some(reply_to))
                .await
        }
        ShardingProducerMsg::WrappedRequestNext { entity_id, inner } => {
            controller.on_wrapped_request_next(entity_id, inner).await
        }
    }
}

impl<A: Clone + Debug + Send + Sync + 'static> ShardingProducerController<A> {
    async fn on_msg(
        &mut self,
        entity_id: String,
        msg: A,
        mut reply_to: Option<oneshot::Sender<u64>>,
    ) -> anyhow::Result<()> {
        let ack = reply_to.is_some();

        let mut outer_seq_nr = None;
        if self.durable_queue.is_some() {
            let seq_nr = self.current_seq_nr;
            let stored_seq_nr = self
                .ask_store_message_sent(MessageSent {
                    seq_nr,
                    msg: msg.clone(),
                    ack,
                    qualifier: entity_id.clone(),
                })
                .await?;
            if stored_seq_nr != seq_nr {
                return Err(anyhow!(
                    "stored seq nr {} does not match assigned seq nr {}",
                    stored_seq_nr,
                    seq_nr
                ));
            }
            self.current_seq_nr += 1;
            outer_seq_nr = Some(seq_nr);
            if let Some(reply_to) = reply_to.take() {
                let _ = reply_to.send(seq_nr);
            }
        }

        let total_buffered = self.total_buffered();
        self.ensure_out(&entity_id);
        let out = self
            .out
            .get_mut(&entity_id)
            .expect("ensure_out inserts the entry");

        if let Some(inner_seq_nr) = out.next_inner_seq_nr.take() {
            hand_over(
                out,
                Buffered {
                    msg,
                    outer_seq_nr,
                    reply_to,
                },
                inner_seq_nr,
            )
            .await;
        } else if total_buffered >= self.config.sharding_buffer_size {
            // dropping the reply channel makes a pending ask fail over there
            warn!(
                "sharding buffer full ({} messages) - dropping message for entity {:?}",
                total_buffered, entity_id
            );
        } else {
            out.buffered.push_back(Buffered {
                msg,
                outer_seq_nr,
                reply_to,
            });
        }

        self.emit_request_next_if_changed().await;
        Ok(())
    }

    async fn on_wrapped_request_next(
        &mut self,
        entity_id: String,
        inner: RequestNext<A>,
    ) -> anyhow::Result<()> {
        let Some(out) = self.out.get_mut(&entity_id) else {
            warn!("demand for unknown entity {:?}", entity_id);
            return Ok(());
        };

        // inner confirmations map back to the durable (outer) watermark of this
        //  entity's qualifier
        let mut confirmed_outer_seq_nr = None;
        while out
            .unconfirmed
            .front()
            .map(|(_, inner_seq_nr)| *inner_seq_nr <= inner.confirmed_seq_nr)
            .unwrap_or(false)
        {
            confirmed_outer_seq_nr = out.unconfirmed.pop_front().map(|(outer, _)| outer);
        }
        if let (Some(seq_nr), Some(queue)) = (confirmed_outer_seq_nr, &self.durable_queue) {
            let cmd = DurableQueueCommand::StoreMessageConfirmed {
                seq_nr,
                qualifier: entity_id.clone(),
            };
            if queue.try_send(cmd).is_err() {
                warn!(
                    "durable queue not accepting confirmed watermark for entity {:?}",
                    entity_id
                );
            }
        }

        if let Some(buffered) = out.buffered.pop_front() {
            hand_over(out, buffered, inner.current_seq_nr).await;
        } else {
            out.next_inner_seq_nr = Some(inner.current_seq_nr);
        }

        self.emit_request_next_if_changed().await;
        Ok(())
    }

    fn ensure_out(&mut self, entity_id: &str) {
        if self.out.contains_key(entity_id) {
            return;
        }
        info!(
            producer_id = %self.producer_id,
            "spawning producer controller for entity {:?}", entity_id
        );

        let (pc_ref, pc_inbox) = producer_controller_channel();
        let inner_producer_id = format!("{}-{}", self.producer_id, entity_id);
        let sink = EntitySink {
            entity_id: entity_id.to_string(),
            router: self.router.clone(),
        };
        {
            let config = self.config.clone();
            let pc_ref = pc_ref.clone();
            let inner_producer_id = inner_producer_id.clone();
            tokio::spawn(async move {
                if let Err(e) = run_producer_controller(
                    config,
                    inner_producer_id.clone(),
                    pc_ref.clone(),
                    pc_inbox,
                    None,
                    Some(Box::new(sink)),
                )
                .await
                {
                    error!("producer controller {} failed: {}", inner_producer_id, e);
                }
            });
        }

        // demand from the inner controller is tagged with the entity id and fed
        //  back into our own inbox
        let (request_next_tx, mut request_next_rx) = mpsc::channel(4);
        pc_ref.try_send(ProducerControllerMsg::Start {
            producer: request_next_tx,
        });
        {
            let outer = self.self_ref.clone();
            let entity_id = entity_id.to_string();
            tokio::spawn(async move {
                while let Some(inner) = request_next_rx.recv().await {
                    let msg = ShardingProducerMsg::WrappedRequestNext {
                        entity_id: entity_id.clone(),
                        inner,
                    };
                    if outer.send(msg).await.is_err() {
                        break;
                    }
                }
            });
        }

        self.out.insert(
            entity_id.to_string(),
            OutState {
                producer_controller: pc_ref,
                next_inner_seq_nr: None,
                buffered: VecDeque::new(),
                unconfirmed: VecDeque::new(),
            },
        );
    }

    fn total_buffered(&self) -> usize {
        self.out.values().map(|o| o.buffered.len()).sum()
    }

    async fn emit_request_next_if_changed(&mut self) {
        let entities_with_demand = self
            .out
            .iter()
            .filter(|(_, o)| o.next_inner_seq_nr.is_some())
            .map(|(entity_id, _)| entity_id.clone())
            .collect::<BTreeSet<_>>();
        let buffered = self
            .out
            .iter()
            .filter(|(_, o)| !o.buffered.is_empty())
            .map(|(entity_id, o)| (entity_id.clone(), o.buffered.len()))
            .collect::<BTreeMap<_, _>>();

        let summary = (entities_with_demand, buffered);
        if self.last_summary.as_ref() == Some(&summary) {
            return;
        }
        self.last_summary = Some(summary.clone());

        let request_next = ShardingRequestNext {
            producer_id: self.producer_id.clone(),
            send_next_to: self.self_ref.clone(),
            entities_with_demand: summary.0,
            buffered_for_entities_without_demand: summary.1,
        };
        if self.producer.send(request_next).await.is_err() {
            warn!(
                producer_id = %self.producer_id,
                "application producer is gone - holding demand until a new Start"
            );
        }
    }

    async fn ask_store_message_sent(&self, sent: MessageSent<A>) -> anyhow::Result<u64> {
        let queue = self
            .durable_queue
            .as_ref()
            .ok_or_else(|| anyhow!("no durable queue configured"))?;

        for attempt in 1..=self.config.durable_retry_attempts {
            let (reply_to, reply) = oneshot::channel();
            queue
                .send(DurableQueueCommand::StoreMessageSent {
                    sent: sent.clone(),
                    reply_to,
                })
                .await
                .map_err(|_| anyhow!("durable queue terminated"))?;

            match time::timeout(self.config.durable_store_timeout, reply).await {
                Ok(Ok(ack)) => return Ok(ack.stored_seq_nr),
                Ok(Err(_)) => return Err(anyhow!("durable queue dropped the store-sent reply")),
                Err(_) => warn!(
                    "storing seq nr {} for entity {:?} timed out (attempt {})",
                    sent.seq_nr, sent.qualifier, attempt
                ),
            }
        }
        Err(anyhow!(
            "giving up storing seq nr {} after {} attempts",
            sent.seq_nr,
            self.config.durable_retry_attempts
        ))
    }
}

/// routes one message to the entity's producer controller, consuming its demand
async fn hand_over<A: Clone + Debug + Send + 'static>(
    out: &mut OutState<A>,
    buffered: Buffered<A>,
    inner_seq_nr: u64,
) {
    let msg = match buffered.reply_to {
        Some(reply_to) => ProducerControllerMsg::MsgWithConfirmation {
            msg: buffered.msg,
            reply_to,
        },
        None => ProducerControllerMsg::Msg(buffered.msg),
    };
    if out.producer_controller.send(msg).await.is_err() {
        warn!(
            "producer controller {:?} is gone - dropping message",
            out.producer_controller
        );
        return;
    }
    if let Some(outer_seq_nr) = buffered.outer_seq_nr {
        out.unconfirmed.push_back((outer_seq_nr, inner_seq_nr));
    }
}
