use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::durable_queue::{DurableQueueCommand, MessageSent, QueueState, NO_QUALIFIER};
use crate::messages::{SequencedMessage, SequencedMessageSink};
use crate::producer::producer_messages::{ProducerControllerRef, RequestNext};

/// The producer side state machine: assigns sequence numbers, enforces the
///  consumer-driven window, buffers unconfirmed messages for retransmission and
///  interleaves durable-queue writes with the demand handshake.
///
/// All methods are driven from the controller's run loop, one inbox message at
///  a time.
pub struct ProducerController<A> {
    config: Arc<DeliveryConfig>,
    producer_id: String,
    self_ref: ProducerControllerRef<A>,
    producer: mpsc::Sender<RequestNext<A>>,
    send: Box<dyn SequencedMessageSink<A>>,
    durable_queue: Option<mpsc::Sender<DurableQueueCommand<A>>>,

    /// is a RequestNext outstanding towards the application producer?
    requested: bool,
    /// the next sequence number to assign
    current_seq_nr: u64,
    confirmed_seq_nr: u64,
    /// upper bound of the window granted by the consumer side
    requested_seq_nr: u64,
    /// sequence number of the current epoch's leading message
    first_seq_nr: u64,
    support_resend: bool,
    unconfirmed: VecDeque<SequencedMessage<A>>,
    /// pending MsgWithConfirmation replies, keyed by assigned sequence number
    reply_after_store: BTreeMap<u64, oneshot::Sender<u64>>,
    resend_first_active: bool,
}

impl<A: Clone + Debug + Send + 'static> ProducerController<A> {
    pub fn new(
        config: Arc<DeliveryConfig>,
        producer_id: String,
        self_ref: ProducerControllerRef<A>,
        producer: mpsc::Sender<RequestNext<A>>,
        send: Box<dyn SequencedMessageSink<A>>,
        durable_queue: Option<mpsc::Sender<DurableQueueCommand<A>>>,
        loaded: QueueState<A>,
    ) -> ProducerController<A> {
        let current_seq_nr = loaded.current_seq_nr.max(1);

        // re-wrap reloaded unconfirmed messages, the head becomes the epoch's
        //  first message
        let first_seq_nr = loaded
            .unconfirmed
            .front()
            .map(|m| m.seq_nr)
            .unwrap_or(current_seq_nr);
        let unconfirmed = loaded
            .unconfirmed
            .into_iter()
            .map(|sent| SequencedMessage {
                producer_id: producer_id.clone(),
                seq_nr: sent.seq_nr,
                msg: sent.msg,
                first: sent.seq_nr == first_seq_nr,
                ack: sent.ack,
                producer_controller: self_ref.clone(),
            })
            .collect::<VecDeque<_>>();

        ProducerController {
            config,
            producer_id,
            self_ref,
            producer,
            send,
            durable_queue,
            requested: false,
            current_seq_nr,
            confirmed_seq_nr: loaded.highest_confirmed_seq_nr,
            // the window admits exactly the epoch's first message until the
            //  consumer's first Request arrives
            requested_seq_nr: current_seq_nr,
            first_seq_nr,
            support_resend: true,
            unconfirmed,
            reply_after_store: BTreeMap::new(),
            resend_first_active: false,
        }
    }

    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn resend_first_active(&self) -> bool {
        self.resend_first_active
    }

    /// called once start-up gathering is complete
    pub async fn activate(&mut self) {
        info!(
            producer_id = %self.producer_id,
            "producer controller active: current seq nr {}, confirmed {}, {} unconfirmed",
            self.current_seq_nr,
            self.confirmed_seq_nr,
            self.unconfirmed.len()
        );

        if self.unconfirmed.is_empty() {
            self.requested = true;
            self.send_request_next().await;
        } else {
            // reloaded messages go out first; new demand is signalled once the
            //  consumer starts confirming them
            self.resend_first_active = true;
            self.on_resend_first_tick();
        }
    }

    /// the next application message, with an optional confirmation reply channel
    pub async fn on_msg(&mut self, msg: A, reply_to: Option<oneshot::Sender<u64>>) -> anyhow::Result<()> {
        if !self.requested || self.current_seq_nr > self.requested_seq_nr {
            return Err(anyhow!(
                "producer {} sent a message without demand: seq nr {} is outside the requested window up to {}",
                self.producer_id,
                self.current_seq_nr,
                self.requested_seq_nr
            ));
        }

        let seq_nr = self.current_seq_nr;
        let ack = reply_to.is_some();

        if self.durable_queue.is_some() {
            let stored_seq_nr = self
                .ask_store_message_sent(MessageSent {
                    seq_nr,
                    msg: msg.clone(),
                    ack,
                    qualifier: NO_QUALIFIER.to_string(),
                })
                .await?;
            if stored_seq_nr != seq_nr {
                return Err(anyhow!(
                    "stored seq nr {} does not match assigned seq nr {}",
                    stored_seq_nr,
                    seq_nr
                ));
            }
            if let Some(reply_to) = reply_to {
                let _ = reply_to.send(seq_nr);
            }
        } else if let Some(reply_to) = reply_to {
            self.reply_after_store.insert(seq_nr, reply_to);
        }

        let seq_msg = SequencedMessage {
            producer_id: self.producer_id.clone(),
            seq_nr,
            msg,
            first: seq_nr == self.first_seq_nr,
            ack,
            producer_controller: self.self_ref.clone(),
        };

        if self.support_resend {
            self.unconfirmed.push_back(seq_msg.clone());
        }
        if seq_msg.first {
            self.resend_first_active = true;
        }

        debug!(producer_id = %self.producer_id, "sending seq nr {}", seq_nr);
        self.send.send_sequenced(seq_msg);
        self.current_seq_nr += 1;

        if self.current_seq_nr <= self.requested_seq_nr {
            self.requested = true;
            self.send_request_next().await;
        } else {
            self.requested = false;
        }
        Ok(())
    }

    pub async fn on_request(
        &mut self,
        confirmed_seq_nr: u64,
        up_to_seq_nr: u64,
        support_resend: bool,
        via_timeout: bool,
    ) -> anyhow::Result<()> {
        if confirmed_seq_nr > up_to_seq_nr {
            return Err(anyhow!(
                "invalid request: confirmed seq nr {} is above requested-up-to {}",
                confirmed_seq_nr,
                up_to_seq_nr
            ));
        }
        debug!(
            producer_id = %self.producer_id,
            "request: confirmed {} up to {} (resend={}, via timeout={})",
            confirmed_seq_nr,
            up_to_seq_nr,
            support_resend,
            via_timeout
        );

        let confirmed_seq_nr = self.on_ack_internal(confirmed_seq_nr);

        self.support_resend = support_resend;
        if !support_resend {
            self.unconfirmed.clear();
            self.resend_first_active = false;
        } else if via_timeout || confirmed_seq_nr == self.first_seq_nr {
            // the tail of the window may have been lost without the consumer
            //  ever seeing a gap - push the whole buffer again
            self.resend_unconfirmed(0);
        }

        let new_requested_seq_nr = if !support_resend && up_to_seq_nr < self.current_seq_nr {
            // flow-control-only and everything in flight was lost: grant a fresh
            //  window on top of what was already sent
            self.current_seq_nr + (up_to_seq_nr - confirmed_seq_nr)
        } else {
            up_to_seq_nr
        };

        if new_requested_seq_nr > self.requested_seq_nr {
            self.requested_seq_nr = new_requested_seq_nr;
            if !self.requested && self.current_seq_nr <= self.requested_seq_nr {
                self.requested = true;
                self.send_request_next().await;
            }
        }
        Ok(())
    }

    pub fn on_ack(&mut self, confirmed_seq_nr: u64) {
        debug!(producer_id = %self.producer_id, "ack up to {}", confirmed_seq_nr);
        let confirmed_seq_nr = self.on_ack_internal(confirmed_seq_nr);

        if confirmed_seq_nr == self.first_seq_nr && !self.unconfirmed.is_empty() {
            // the first message made it but everything after it may be lost
            //  without a Request ever telling us
            self.resend_unconfirmed(0);
        }
    }

    pub fn on_resend(&mut self, from_seq_nr: u64) {
        debug!(producer_id = %self.producer_id, "resend demanded from seq nr {}", from_seq_nr);
        self.resend_unconfirmed(from_seq_nr);
    }

    pub fn on_resend_first_tick(&mut self) {
        match self.unconfirmed.front() {
            Some(head) if head.seq_nr == self.first_seq_nr => {
                debug!(producer_id = %self.producer_id, "retransmitting first message {}", head.seq_nr);
                let mut seq_msg = head.clone();
                seq_msg.first = true;
                self.send.send_sequenced(seq_msg);
            }
            _ => {
                if self.current_seq_nr > self.first_seq_nr {
                    self.resend_first_active = false;
                }
            }
        }
    }

    pub async fn on_start(&mut self, producer: mpsc::Sender<RequestNext<A>>) {
        info!(producer_id = %self.producer_id, "registered new application producer");
        self.producer = producer;
        if self.requested {
            self.send_request_next().await;
        }
    }

    pub fn on_register_consumer(&mut self, send: Box<dyn SequencedMessageSink<A>>) {
        info!(producer_id = %self.producer_id, "registered consumer");
        self.send = send;
        self.first_seq_nr = self
            .unconfirmed
            .front()
            .map(|m| m.seq_nr)
            .unwrap_or(self.current_seq_nr);
        if !self.unconfirmed.is_empty() {
            self.resend_first_active = true;
            self.on_resend_first_tick();
        }
    }

    /// confirmation bookkeeping shared by Request and Ack. Returns the (possibly
    ///  clamped) confirmed sequence number.
    fn on_ack_internal(&mut self, confirmed_seq_nr: u64) -> u64 {
        let confirmed_seq_nr = if confirmed_seq_nr >= self.current_seq_nr {
            warn!(
                producer_id = %self.producer_id,
                "peer confirmed seq nr {} which was never sent - clamping to {}",
                confirmed_seq_nr,
                self.current_seq_nr - 1
            );
            self.current_seq_nr - 1
        } else {
            confirmed_seq_nr
        };

        let replies = self
            .reply_after_store
            .range(..=confirmed_seq_nr)
            .map(|(seq_nr, _)| *seq_nr)
            .collect::<Vec<_>>();
        for seq_nr in replies {
            if let Some(reply_to) = self.reply_after_store.remove(&seq_nr) {
                let _ = reply_to.send(seq_nr);
            }
        }

        while self
            .unconfirmed
            .front()
            .map(|m| m.seq_nr <= confirmed_seq_nr)
            .unwrap_or(false)
        {
            self.unconfirmed.pop_front();
        }

        if confirmed_seq_nr == self.first_seq_nr {
            self.resend_first_active = false;
        }

        if confirmed_seq_nr > self.confirmed_seq_nr {
            self.confirmed_seq_nr = confirmed_seq_nr;
            if let Some(queue) = &self.durable_queue {
                // write-behind: losing the watermark only causes replay
                let cmd = DurableQueueCommand::StoreMessageConfirmed {
                    seq_nr: confirmed_seq_nr,
                    qualifier: NO_QUALIFIER.to_string(),
                };
                if queue.try_send(cmd).is_err() {
                    warn!(
                        producer_id = %self.producer_id,
                        "durable queue not accepting confirmed watermark {}", confirmed_seq_nr
                    );
                }
            }
        }
        confirmed_seq_nr
    }

    fn resend_unconfirmed(&self, from_seq_nr: u64) {
        for seq_msg in self.unconfirmed.iter().filter(|m| m.seq_nr >= from_seq_nr) {
            debug!(producer_id = %self.producer_id, "retransmitting seq nr {}", seq_msg.seq_nr);
            self.send.send_sequenced(seq_msg.clone());
        }
    }

    async fn send_request_next(&mut self) {
        let request_next = RequestNext {
            producer_id: self.producer_id.clone(),
            current_seq_nr: self.current_seq_nr,
            confirmed_seq_nr: self.confirmed_seq_nr,
            send_next_to: self.self_ref.clone(),
        };
        if self.producer.send(request_next).await.is_err() {
            // keep `requested` as is: a new Start re-sends the demand signal
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
                Ok(Err(_)) => {
                    return Err(anyhow!("durable queue dropped the store-sent reply"));
                }
                Err(_) => {
                    warn!(
                        producer_id = %self.producer_id,
                        "storing seq nr {} timed out (attempt {})", sent.seq_nr, attempt
                    );
                }
            }
        }
        Err(anyhow!(
            "giving up storing seq nr {} after {} attempts",
            sent.seq_nr,
            self.config.durable_retry_attempts
        ))
    }
}
