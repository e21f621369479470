use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;

use tokio::select;
use tokio::sync::mpsc;
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::DeliveryConfig;
use crate::consumer::consumer_logic::ConsumerController;
use crate::consumer::consumer_messages::ConsumerControllerMsg;
use crate::messages::SequencedMessage;
use crate::producer::producer_messages::{ProducerControllerMsg, ProducerControllerRef};
use crate::refs::LocalRef;

mod consumer_logic;
pub mod consumer_messages;

pub use consumer_messages::{ConsumerControllerRef, Delivery};

const INBOX_CAPACITY: usize = 256;

pub fn consumer_controller_channel<A>() -> (
    ConsumerControllerRef<A>,
    mpsc::Receiver<ConsumerControllerMsg<A>>,
) {
    LocalRef::channel(INBOX_CAPACITY)
}

/// Runs a consumer controller until its application consumer terminates, all
///  references to it are dropped, or it hits a fatal error.
///
/// The controller idles until both `Start` and the stream's earliest
///  SequencedMessage have arrived (messages are stashed meanwhile, bounded by
///  the request window). `resend_lost = false` degrades the stream to flow
///  control only: gaps are accepted as loss instead of triggering Resend.
pub async fn run_consumer_controller<A: Clone + Debug + Send + 'static>(
    config: Arc<DeliveryConfig>,
    resend_lost: bool,
    self_ref: ConsumerControllerRef<A>,
    mut inbox: mpsc::Receiver<ConsumerControllerMsg<A>>,
) -> anyhow::Result<()> {
    let mut retry_ticks = time::interval_at(
        time::Instant::now() + config.retry_interval,
        config.retry_interval,
    );
    retry_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // idle: gather Start and the stream's earliest message
    let mut consumer = None;
    let mut registering: Option<ProducerControllerRef<A>> = None;
    let mut stash: VecDeque<SequencedMessage<A>> = VecDeque::new();
    loop {
        select! {
            opt_msg = inbox.recv() => {
                match opt_msg {
                    None => return Ok(()),
                    Some(ConsumerControllerMsg::Start { consumer: c }) => consumer = Some(c),
                    Some(ConsumerControllerMsg::RegisterToProducerController { producer }) => {
                        producer.try_send(ProducerControllerMsg::RegisterConsumer {
                            consumer: self_ref.clone(),
                        });
                        registering = Some(producer);
                    }
                    Some(ConsumerControllerMsg::SequencedMessage(seq_msg)) => {
                        if (stash.len() as u64) < config.request_window {
                            stash.push_back(seq_msg);
                        } else {
                            warn!(
                                "stash full while waiting for Start - dropping seq nr {}",
                                seq_msg.seq_nr
                            );
                        }
                    }
                    Some(ConsumerControllerMsg::Confirmed { seq_nr }) => {
                        warn!("unexpected confirmation of seq nr {} before Start", seq_nr);
                    }
                }
            }
            _ = retry_ticks.tick() => {
                if let Some(producer) = &registering {
                    producer.try_send(ProducerControllerMsg::RegisterConsumer {
                        consumer: self_ref.clone(),
                    });
                }
            }
        }
        if consumer.is_some() && !stash.is_empty() {
            break;
        }
    }

    let mut controller = ConsumerController::new(
        config,
        resend_lost,
        self_ref,
        consumer.expect("idle loop ensures consumer"),
        registering,
    );
    let mut watched_consumer = controller.consumer_clone();
    controller.activate(stash).await?;

    loop {
        if controller.stopped() {
            return Ok(());
        }
        select! {
            opt_msg = inbox.recv() => {
                match opt_msg {
                    None => {
                        debug!("all references to consumer controller dropped - stopping");
                        return Ok(());
                    }
                    Some(msg) => on_message(&mut controller, msg).await?,
                }
            }
            _ = retry_ticks.tick() => controller.on_retry_tick(),
            _ = watched_consumer.closed() => {
                info!("application consumer terminated - stopping");
                return Ok(());
            }
        }
        if controller.take_retry_reset() {
            retry_ticks.reset();
        }
        if !watched_consumer.same_channel(&controller.consumer_clone()) {
            watched_consumer = controller.consumer_clone();
        }
    }
}

async fn on_message<A: Clone + Debug + Send + 'static>(
    controller: &mut ConsumerController<A>,
    msg: ConsumerControllerMsg<A>,
) -> anyhow::Result<()> {
    match msg {
        ConsumerControllerMsg::Start { consumer } => {
            controller.on_start(consumer);
            Ok(())
        }
        ConsumerControllerMsg::RegisterToProducerController { producer } => {
            controller.on_register_to_producer(producer);
            Ok(())
        }
        ConsumerControllerMsg::SequencedMessage(seq_msg) => {
            controller.on_sequenced_message(seq_msg).await
        }
        ConsumerControllerMsg::Confirmed { seq_nr } => controller.on_confirmed(seq_nr).await,
    }
}
