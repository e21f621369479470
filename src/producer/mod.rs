use std::fmt::Debug;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::DeliveryConfig;
use crate::durable_queue::{DurableQueueCommand, QueueState};
use crate::messages::SequencedMessageSink;
use crate::producer::producer_logic::ProducerController;
use crate::producer::producer_messages::ProducerControllerMsg;
use crate::refs::LocalRef;

mod producer_logic;
pub mod producer_messages;

pub use producer_messages::{ProducerControllerRef, RequestNext};

const INBOX_CAPACITY: usize = 256;

pub fn producer_controller_channel<A>() -> (
    ProducerControllerRef<A>,
    mpsc::Receiver<ProducerControllerMsg<A>>,
) {
    LocalRef::channel(INBOX_CAPACITY)
}

/// Runs a producer controller until all references to it are dropped or it hits
///  a fatal error.
///
/// Start-up gathers three things before the controller becomes active: the
///  application's `Start`, a transmission target (`RegisterConsumer`, unless
///  `custom_send` is provided, as the sharding wrapper does), and - if a durable
///  queue is attached - its reloaded state. Early consumer-side traffic is
///  stashed and replayed on activation.
pub async fn run_producer_controller<A: Clone + Debug + Send + 'static>(
    config: Arc<DeliveryConfig>,
    producer_id: String,
    self_ref: ProducerControllerRef<A>,
    mut inbox: mpsc::Receiver<ProducerControllerMsg<A>>,
    durable_queue: Option<mpsc::Sender<DurableQueueCommand<A>>>,
    custom_send: Option<Box<dyn SequencedMessageSink<A>>>,
) -> anyhow::Result<()> {
    let loaded = match &durable_queue {
        Some(queue) => load_initial_state(queue, &config).await?,
        None => QueueState::initial(),
    };

    let mut producer = None;
    let mut send = custom_send;
    let mut stash = Vec::new();
    while producer.is_none() || send.is_none() {
        match inbox.recv().await {
            None => return Ok(()),
            Some(ProducerControllerMsg::Start { producer: p }) => producer = Some(p),
            Some(ProducerControllerMsg::RegisterConsumer { consumer }) => {
                send = Some(Box::new(consumer) as Box<dyn SequencedMessageSink<A>>)
            }
            Some(other) => stash.push(other),
        }
    }

    let mut controller = ProducerController::new(
        config.clone(),
        producer_id,
        self_ref,
        producer.expect("gathering loop ensures producer"),
        send.expect("gathering loop ensures send"),
        durable_queue,
        loaded,
    );
    controller.activate().await;
    for msg in stash {
        on_message(&mut controller, msg).await?;
    }

    let mut resend_first_ticks = time::interval_at(
        time::Instant::now() + config.resend_first_interval,
        config.resend_first_interval,
    );
    resend_first_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            opt_msg = inbox.recv() => {
                match opt_msg {
                    None => {
                        debug!("all references to producer controller {} dropped - stopping", controller.producer_id());
                        return Ok(());
                    }
                    Some(msg) => on_message(&mut controller, msg).await?,
                }
            }
            _ = resend_first_ticks.tick(), if controller.resend_first_active() => {
                controller.on_resend_first_tick();
            }
        }
    }
}

async fn on_message<A: Clone + Debug + Send + 'static>(
    controller: &mut ProducerController<A>,
    msg: ProducerControllerMsg<A>,
) -> anyhow::Result<()> {
    match msg {
        ProducerControllerMsg::Start { producer } => {
            controller.on_start(producer).await;
            Ok(())
        }
        ProducerControllerMsg::RegisterConsumer { consumer } => {
            controller.on_register_consumer(Box::new(consumer));
            Ok(())
        }
        ProducerControllerMsg::Msg(msg) => controller.on_msg(msg, None).await,
        ProducerControllerMsg::MsgWithConfirmation { msg, reply_to } => {
            controller.on_msg(msg, Some(reply_to)).await
        }
        ProducerControllerMsg::Request {
            confirmed_seq_nr,
            up_to_seq_nr,
            support_resend,
            via_timeout,
        } => {
            controller
                .on_request(confirmed_seq_nr, up_to_seq_nr, support_resend, via_timeout)
                .await
        }
        ProducerControllerMsg::Resend { from_seq_nr } => {
            controller.on_resend(from_seq_nr);
            Ok(())
        }
        ProducerControllerMsg::Ack { confirmed_seq_nr } => {
            controller.on_ack(confirmed_seq_nr);
            Ok(())
        }
    }
}

pub(crate) async fn load_initial_state<A>(
    queue: &mpsc::Sender<DurableQueueCommand<A>>,
    config: &DeliveryConfig,
) -> anyhow::Result<QueueState<A>> {
    for attempt in 1..=config.durable_retry_attempts {
        let (reply_to, reply) = oneshot::channel();
        queue
            .send(DurableQueueCommand::LoadState { reply_to })
            .await
            .map_err(|_| anyhow!("durable queue terminated"))?;

        match time::timeout(config.durable_load_timeout, reply).await {
            Ok(Ok(state)) => return Ok(state),
            Ok(Err(_)) => return Err(anyhow!("durable queue dropped the load-state reply")),
            Err(_) => warn!("loading durable state timed out (attempt {})", attempt),
        }
    }
    Err(anyhow!(
        "giving up loading durable state after {} attempts",
        config.durable_retry_attempts
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::durable_queue::event_sourced::{run_event_sourced_queue, InMemJournal};

    use super::*;

    #[tokio::test]
    async fn test_no_demand_before_start_and_register() {
        let (self_ref, inbox) = producer_controller_channel::<String>();
        tokio::spawn(run_producer_controller(
            Arc::new(DeliveryConfig::new()),
            "p-1".to_string(),
            self_ref.clone(),
            inbox,
            None,
            None,
        ));

        let (producer_tx, mut producer_rx) = mpsc::channel(8);
        self_ref.try_send(ProducerControllerMsg::Start {
            producer: producer_tx,
        });
        // Start alone is not enough, a transmission target is missing
        assert!(producer_rx.try_recv().is_err());

        let (consumer_ref, _consumer_inbox) = crate::consumer::consumer_controller_channel::<String>();
        self_ref.try_send(ProducerControllerMsg::RegisterConsumer {
            consumer: consumer_ref,
        });

        let request_next = producer_rx.recv().await.unwrap();
        assert_eq!(request_next.producer_id, "p-1");
        assert_eq!(request_next.current_seq_nr, 1);
    }

    #[tokio::test]
    async fn test_message_without_demand_is_fatal() {
        let (self_ref, inbox) = producer_controller_channel::<String>();
        let handle = tokio::spawn(run_producer_controller(
            Arc::new(DeliveryConfig::new()),
            "p-1".to_string(),
            self_ref.clone(),
            inbox,
            None,
            None,
        ));

        let (producer_tx, mut producer_rx) = mpsc::channel(8);
        self_ref.try_send(ProducerControllerMsg::Start {
            producer: producer_tx,
        });
        let (consumer_ref, _consumer_inbox) = crate::consumer::consumer_controller_channel::<String>();
        self_ref.try_send(ProducerControllerMsg::RegisterConsumer {
            consumer: consumer_ref,
        });
        let request_next = producer_rx.recv().await.unwrap();

        request_next.send_next("a".to_string()).await.unwrap();
        // no RequestNext was issued for this one
        self_ref.try_send(ProducerControllerMsg::Msg("b".to_string()));

        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_loads_durable_state_before_activation() {
        let journal = InMemJournal::new();
        let (queue_tx, queue_rx) = mpsc::channel(16);
        tokio::spawn(run_event_sourced_queue::<String>(journal, queue_rx));

        let (self_ref, inbox) = producer_controller_channel::<String>();
        tokio::spawn(run_producer_controller(
            Arc::new(DeliveryConfig::new()),
            "p-1".to_string(),
            self_ref.clone(),
            inbox,
            Some(queue_tx),
            None,
        ));

        let (producer_tx, mut producer_rx) = mpsc::channel(8);
        self_ref.try_send(ProducerControllerMsg::Start {
            producer: producer_tx,
        });
        let (consumer_ref, _consumer_inbox) = crate::consumer::consumer_controller_channel::<String>();
        self_ref.try_send(ProducerControllerMsg::RegisterConsumer {
            consumer: consumer_ref,
        });

        let request_next = producer_rx.recv().await.unwrap();
        assert_eq!(request_next.current_seq_nr, 1);
    }
}
