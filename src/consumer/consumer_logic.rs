use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::consumer::consumer_messages::{ConsumerControllerRef, Delivery};
use crate::messages::SequencedMessage;
use crate::producer::producer_messages::{ProducerControllerMsg, ProducerControllerRef};

enum Phase {
    Active,
    /// one Delivery is outstanding; further messages are stashed
    WaitingForConfirmation { first: bool, ack: bool },
    /// a gap was detected and a Resend is out; everything but the expected
    ///  sequence number is dropped
    Resending,
}

/// The consumer side state machine: accepts the sequenced stream, detects gaps
///  and duplicates, delivers one message at a time to the application consumer
///  and keeps the producer's window topped up.
pub struct ConsumerController<A> {
    config: Arc<DeliveryConfig>,
    resend_lost: bool,
    self_ref: ConsumerControllerRef<A>,
    consumer: mpsc::Sender<Delivery<A>>,
    producer: Option<ProducerControllerRef<A>>,

    /// highest sequence number accepted for delivery
    received_seq_nr: u64,
    confirmed_seq_nr: u64,
    /// upper bound of the window granted to the producer
    requested_seq_nr: u64,
    /// Some while a rebind to a new producer controller is pending. Only a
    ///  first-flagged message from that controller completes the switch; other
    ///  traffic is discarded so two producer streams cannot interleave.
    registering: Option<ProducerControllerRef<A>>,

    phase: Phase,
    stash: VecDeque<SequencedMessage<A>>,
    stopped: bool,
    retry_timer_reset: bool,
}

impl<A: Clone + Debug + Send + 'static> ConsumerController<A> {
    pub fn new(
        config: Arc<DeliveryConfig>,
        resend_lost: bool,
        self_ref: ConsumerControllerRef<A>,
        consumer: mpsc::Sender<Delivery<A>>,
        registering: Option<ProducerControllerRef<A>>,
    ) -> ConsumerController<A> {
        ConsumerController {
            config,
            resend_lost,
            self_ref,
            consumer,
            producer: None,
            received_seq_nr: 0,
            confirmed_seq_nr: 0,
            requested_seq_nr: 0,
            registering,
            phase: Phase::Active,
            stash: VecDeque::new(),
            stopped: false,
            retry_timer_reset: false,
        }
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn consumer_clone(&self) -> mpsc::Sender<Delivery<A>> {
        self.consumer.clone()
    }

    pub fn take_retry_reset(&mut self) -> bool {
        std::mem::take(&mut self.retry_timer_reset)
    }

    /// leaves the idle phase: the window is derived from the earliest stashed
    ///  message and announced to its producer controller, then the stash is
    ///  replayed
    pub async fn activate(&mut self, mut stash: VecDeque<SequencedMessage<A>>) -> anyhow::Result<()> {
        if let Some(head) = stash.front() {
            info!(
                producer_id = %head.producer_id,
                "consumer controller active, stream starts at seq nr {}", head.seq_nr
            );
            self.requested_seq_nr = head.seq_nr - 1 + self.config.request_window;
            self.producer = Some(head.producer_controller.clone());
            self.send_request(false);
        }
        while let Some(seq_msg) = stash.pop_front() {
            self.on_sequenced_message(seq_msg).await?;
        }
        Ok(())
    }

    pub async fn on_sequenced_message(&mut self, seq_msg: SequencedMessage<A>) -> anyhow::Result<()> {
        if self.stopped {
            return Ok(());
        }
        if matches!(self.phase, Phase::WaitingForConfirmation { .. }) {
            if (self.stash.len() as u64) < self.config.request_window {
                self.stash.push_back(seq_msg);
            } else {
                warn!(
                    "stash full - dropping seq nr {}, the producer will resend",
                    seq_msg.seq_nr
                );
            }
            return Ok(());
        }
        if self.registering_gate(&seq_msg) {
            return Ok(());
        }
        if matches!(self.phase, Phase::Resending) {
            self.on_sequenced_message_resending(seq_msg).await
        } else {
            self.on_sequenced_message_active(seq_msg).await
        }
    }

    async fn on_sequenced_message_active(&mut self, seq_msg: SequencedMessage<A>) -> anyhow::Result<()> {
        let expected_seq_nr = self.received_seq_nr + 1;
        let producer_changed = self.producer.as_ref() != Some(&seq_msg.producer_controller);

        if seq_msg.first && (producer_changed || seq_msg.seq_nr >= expected_seq_nr) {
            // start of an epoch: bootstraps a fresh stream, resets after loss of
            //  everything since the first message, or re-binds after a producer
            //  change
            if producer_changed {
                info!(
                    producer_id = %seq_msg.producer_id,
                    "now consuming from producer controller {:?}", seq_msg.producer_controller
                );
                self.producer = Some(seq_msg.producer_controller.clone());
            }
            self.deliver(seq_msg).await
        } else if producer_changed {
            debug!(
                "dropping seq nr {} from producer controller {:?}: not flagged as first",
                seq_msg.seq_nr, seq_msg.producer_controller
            );
            Ok(())
        } else if seq_msg.seq_nr == expected_seq_nr {
            self.deliver(seq_msg).await
        } else if seq_msg.seq_nr > expected_seq_nr {
            if self.resend_lost {
                debug!(
                    "gap detected: expected seq nr {}, got {} - demanding resend",
                    expected_seq_nr, seq_msg.seq_nr
                );
                if let Some(producer) = &self.producer {
                    producer.try_send(ProducerControllerMsg::Resend {
                        from_seq_nr: expected_seq_nr,
                    });
                }
                self.phase = Phase::Resending;
                Ok(())
            } else {
                // flow control only: the lost messages stay lost
                self.deliver(seq_msg).await
            }
        } else {
            debug!(
                "deduplicating seq nr {} (expected {})",
                seq_msg.seq_nr, expected_seq_nr
            );
            if seq_msg.first {
                // the producer is still retransmitting its first message, so our
                //  Request after delivering it got lost
                self.send_request(false);
            }
            Ok(())
        }
    }

    async fn on_sequenced_message_resending(&mut self, seq_msg: SequencedMessage<A>) -> anyhow::Result<()> {
        let expected_seq_nr = self.received_seq_nr + 1;
        let producer_changed = self.producer.as_ref() != Some(&seq_msg.producer_controller);

        if seq_msg.first && producer_changed {
            // a new epoch overrides the pending resend
            info!(
                producer_id = %seq_msg.producer_id,
                "now consuming from producer controller {:?}", seq_msg.producer_controller
            );
            self.producer = Some(seq_msg.producer_controller.clone());
            self.deliver(seq_msg).await
        } else if !producer_changed && seq_msg.seq_nr == expected_seq_nr {
            self.deliver(seq_msg).await
        } else {
            debug!(
                "dropping seq nr {} while waiting for resend of {}",
                seq_msg.seq_nr, expected_seq_nr
            );
            Ok(())
        }
    }

    pub async fn on_confirmed(&mut self, seq_nr: u64) -> anyhow::Result<()> {
        if self.stopped {
            return Ok(());
        }
        let (first, ack) = match self.phase {
            Phase::WaitingForConfirmation { first, ack } => (first, ack),
            _ => {
                if seq_nr > self.received_seq_nr {
                    return Err(anyhow!(
                        "got confirmation of seq nr {} but nothing was delivered beyond {}",
                        seq_nr,
                        self.received_seq_nr
                    ));
                }
                debug!("late confirmation of seq nr {} - ignoring", seq_nr);
                return Ok(());
            }
        };

        if seq_nr > self.received_seq_nr {
            return Err(anyhow!(
                "got confirmation of seq nr {} but nothing was delivered beyond {}",
                seq_nr,
                self.received_seq_nr
            ));
        }
        if seq_nr < self.received_seq_nr {
            info!(
                "got confirmation of seq nr {} while waiting for {} - was the consumer restarted?",
                seq_nr, self.received_seq_nr
            );
        }

        self.confirmed_seq_nr = seq_nr;
        let half_window = self.config.request_window / 2;
        if first {
            // the first-half request; it also stops the producer's first-message
            //  retransmission
            self.requested_seq_nr = seq_nr - 1 + self.config.request_window;
            self.send_request(false);
        } else if seq_nr > self.requested_seq_nr {
            // flow-control-only mode can deliver past the window when the
            //  producer expanded it after total loss - re-base the window
            self.requested_seq_nr = seq_nr - 1 + self.config.request_window;
            self.send_request(false);
        } else if self.requested_seq_nr.saturating_sub(seq_nr) == half_window {
            self.requested_seq_nr += half_window;
            self.send_request(false);
        } else if ack {
            if let Some(producer) = &self.producer {
                producer.try_send(ProducerControllerMsg::Ack {
                    confirmed_seq_nr: seq_nr,
                });
            }
        }

        self.phase = Phase::Active;
        self.drain_stash().await
    }

    pub fn on_start(&mut self, consumer: mpsc::Sender<Delivery<A>>) {
        info!("registered new application consumer");
        self.consumer = consumer;
    }

    pub fn on_register_to_producer(&mut self, producer: ProducerControllerRef<A>) {
        if self.producer.as_ref() == Some(&producer) {
            debug!("already consuming from producer controller {:?}", producer);
            return;
        }
        info!("registering with producer controller {:?}", producer);
        producer.try_send(ProducerControllerMsg::RegisterConsumer {
            consumer: self.self_ref.clone(),
        });
        self.registering = Some(producer);
    }

    pub fn on_retry_tick(&mut self) {
        if let Some(registering) = &self.registering {
            debug!("retrying registration with producer controller {:?}", registering);
            registering.try_send(ProducerControllerMsg::RegisterConsumer {
                consumer: self.self_ref.clone(),
            });
            return;
        }
        match self.phase {
            Phase::Active => self.send_request(true),
            Phase::Resending => {
                if let Some(producer) = &self.producer {
                    producer.try_send(ProducerControllerMsg::Resend {
                        from_seq_nr: self.received_seq_nr + 1,
                    });
                }
            }
            Phase::WaitingForConfirmation { .. } => {}
        }
    }

    /// true if the message must be discarded because a producer switch is pending
    fn registering_gate(&mut self, seq_msg: &SequencedMessage<A>) -> bool {
        match &self.registering {
            None => false,
            Some(registering) if seq_msg.producer_controller == *registering && seq_msg.first => {
                info!(
                    producer_id = %seq_msg.producer_id,
                    "registration with {:?} complete", registering
                );
                self.registering = None;
                false
            }
            Some(_) => {
                debug!(
                    "dropping seq nr {} from {:?} while switching producers",
                    seq_msg.seq_nr, seq_msg.producer_controller
                );
                true
            }
        }
    }

    async fn deliver(&mut self, seq_msg: SequencedMessage<A>) -> anyhow::Result<()> {
        let first = seq_msg.first;
        let ack = seq_msg.ack;
        self.received_seq_nr = seq_msg.seq_nr;
        self.phase = Phase::WaitingForConfirmation { first, ack };

        let delivery = Delivery {
            producer_id: seq_msg.producer_id,
            seq_nr: seq_msg.seq_nr,
            msg: seq_msg.msg,
            confirm_to: self.self_ref.clone(),
        };
        if self.consumer.send(delivery).await.is_err() {
            info!("application consumer terminated - stopping");
            self.stopped = true;
        }
        Ok(())
    }

    async fn drain_stash(&mut self) -> anyhow::Result<()> {
        while matches!(self.phase, Phase::Active) && !self.stopped {
            match self.stash.pop_front() {
                None => break,
                Some(seq_msg) => self.on_sequenced_message(seq_msg).await?,
            }
        }
        Ok(())
    }

    fn send_request(&mut self, via_timeout: bool) {
        if let Some(producer) = &self.producer {
            debug!(
                "requesting: confirmed {} up to {} (via timeout={})",
                self.confirmed_seq_nr, self.requested_seq_nr, via_timeout
            );
            producer.try_send(ProducerControllerMsg::Request {
                confirmed_seq_nr: self.confirmed_seq_nr,
                up_to_seq_nr: self.requested_seq_nr,
                support_resend: self.resend_lost,
                via_timeout,
            });
            if !via_timeout {
                self.retry_timer_reset = true;
            }
        }
    }
}
