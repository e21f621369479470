//! End to end scenarios driving real producer and consumer controllers over an
//! (optionally lossy) in-process link.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;

use crate::config::DeliveryConfig;
use crate::consumer::consumer_messages::ConsumerControllerMsg;
use crate::consumer::{consumer_controller_channel, run_consumer_controller, ConsumerControllerRef, Delivery};
use crate::durable_queue::event_sourced::{run_event_sourced_queue, InMemJournal};
use crate::durable_queue::DurableQueueCommand;
use crate::producer::producer_messages::ProducerControllerMsg;
use crate::producer::{producer_controller_channel, run_producer_controller, RequestNext};
use crate::test_util::LossyLink;

type DeliveryLog = Arc<Mutex<Vec<(u64, String)>>>;

fn spawn_consumer_controller(
    config: &Arc<DeliveryConfig>,
    resend_lost: bool,
) -> ConsumerControllerRef<String> {
    let (cc_ref, cc_inbox) = consumer_controller_channel();
    tokio::spawn(run_consumer_controller(
        config.clone(),
        resend_lost,
        cc_ref.clone(),
        cc_inbox,
    ));
    cc_ref
}

/// application consumer that confirms every delivery and records it
fn spawn_auto_confirming_consumer(cc_ref: &ConsumerControllerRef<String>) -> DeliveryLog {
    let (deliver_tx, mut deliveries) = mpsc::channel::<Delivery<String>>(16);
    cc_ref.try_send(ConsumerControllerMsg::Start {
        consumer: deliver_tx,
    });

    let log: DeliveryLog = Arc::new(Mutex::new(Vec::new()));
    let writer = log.clone();
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            writer
                .lock()
                .expect("delivery log lock poisoned")
                .push((delivery.seq_nr, delivery.msg.clone()));
            delivery.confirm();
        }
    });
    log
}

async fn await_deliveries(log: &DeliveryLog, n: usize) -> Vec<(u64, String)> {
    for _ in 0..1000 {
        time::sleep(Duration::from_millis(50)).await;
        let current = log.lock().expect("delivery log lock poisoned").clone();
        if current.len() >= n {
            return current;
        }
    }
    panic!(
        "expected {} deliveries, got {:?}",
        n,
        log.lock().expect("delivery log lock poisoned")
    );
}

fn entry(seq_nr: u64, msg: &str) -> (u64, String) {
    (seq_nr, msg.to_string())
}

#[tokio::test(start_paused = true)]
async fn test_basic_delivery_and_confirmation() {
    let config = Arc::new(DeliveryConfig::new());

    let (pc_ref, pc_inbox) = producer_controller_channel::<String>();
    tokio::spawn(run_producer_controller(
        config.clone(),
        "p-1".to_string(),
        pc_ref.clone(),
        pc_inbox,
        None,
        None,
    ));
    let cc_ref = spawn_consumer_controller(&config, true);
    let log = spawn_auto_confirming_consumer(&cc_ref);

    let (producer_tx, mut request_nexts) = mpsc::channel::<RequestNext<String>>(8);
    pc_ref.try_send(ProducerControllerMsg::Start {
        producer: producer_tx,
    });
    cc_ref.try_send(ConsumerControllerMsg::RegisterToProducerController {
        producer: pc_ref.clone(),
    });

    let request_next = request_nexts.recv().await.unwrap();
    request_next.send_next("a".to_string()).await.unwrap();

    // ask-style: without a durable queue the reply comes once the consumer
    //  confirmed the message
    let request_next = request_nexts.recv().await.unwrap();
    assert_eq!(request_next.ask_next("b".to_string()).await.unwrap(), 2);

    let request_next = request_nexts.recv().await.unwrap();
    request_next.send_next("c".to_string()).await.unwrap();

    let deliveries = await_deliveries(&log, 3).await;
    assert_eq!(
        deliveries,
        vec![entry(1, "a"), entry(2, "b"), entry(3, "c")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_lost_messages_are_resent_and_delivered_in_order() {
    let config = Arc::new(DeliveryConfig::new());

    let cc_ref = spawn_consumer_controller(&config, true);
    let log = spawn_auto_confirming_consumer(&cc_ref);

    // the transport loses the first transmission of 3 and 4
    let link = Arc::new(LossyLink::dropping_once(cc_ref.clone(), [3, 4]));
    let (pc_ref, pc_inbox) = producer_controller_channel::<String>();
    tokio::spawn(run_producer_controller(
        config.clone(),
        "p-1".to_string(),
        pc_ref.clone(),
        pc_inbox,
        None,
        Some(Box::new(link.clone())),
    ));

    let (producer_tx, mut request_nexts) = mpsc::channel::<RequestNext<String>>(8);
    pc_ref.try_send(ProducerControllerMsg::Start {
        producer: producer_tx,
    });

    for msg in ["a", "b", "c", "d", "e"] {
        let request_next = request_nexts.recv().await.unwrap();
        request_next.send_next(msg.to_string()).await.unwrap();
    }

    let deliveries = await_deliveries(&log, 5).await;
    assert_eq!(
        deliveries,
        vec![
            entry(1, "a"),
            entry(2, "b"),
            entry(3, "c"),
            entry(4, "d"),
            entry(5, "e")
        ]
    );

    // 3 was transmitted at least twice: dropped once, resent on demand
    let offered_3 = link.offered().iter().filter(|(s, _)| *s == 3).count();
    assert!(offered_3 >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_producer_restart_resumes_from_durable_queue() {
    let config = Arc::new(DeliveryConfig::new());
    let journal = InMemJournal::new();

    let (queue_tx, queue_rx) = mpsc::channel::<DurableQueueCommand<String>>(64);
    let queue_handle = tokio::spawn(run_event_sourced_queue::<String>(journal.clone(), queue_rx));

    let cc_ref = spawn_consumer_controller(&config, true);
    let log = spawn_auto_confirming_consumer(&cc_ref);

    // first incarnation: b and c never make it across
    let link = Arc::new(LossyLink::dropping_always(cc_ref.clone(), [2, 3]));
    let (pc1_ref, pc1_inbox) = producer_controller_channel::<String>();
    let pc1_handle = tokio::spawn(run_producer_controller(
        config.clone(),
        "p-1".to_string(),
        pc1_ref.clone(),
        pc1_inbox,
        Some(queue_tx.clone()),
        Some(Box::new(link)),
    ));

    let (producer_tx, mut request_nexts) = mpsc::channel::<RequestNext<String>>(8);
    pc1_ref.try_send(ProducerControllerMsg::Start {
        producer: producer_tx,
    });

    let request_next = request_nexts.recv().await.unwrap();
    request_next.send_next("a".to_string()).await.unwrap();
    // with a durable queue the ask resolves once the message is stored, even
    //  though it will not reach the consumer in this incarnation
    let request_next = request_nexts.recv().await.unwrap();
    assert_eq!(request_next.ask_next("b".to_string()).await.unwrap(), 2);
    let request_next = request_nexts.recv().await.unwrap();
    request_next.send_next("c".to_string()).await.unwrap();

    assert_eq!(await_deliveries(&log, 1).await, vec![entry(1, "a")]);

    // wait for the confirmed watermark to hit the journal, then crash the
    //  producer
    loop {
        time::sleep(Duration::from_millis(50)).await;
        let (state_tx, state_rx) = tokio::sync::oneshot::channel();
        queue_tx
            .send(DurableQueueCommand::LoadState { reply_to: state_tx })
            .await
            .unwrap();
        if state_rx.await.unwrap().highest_confirmed_seq_nr == 1 {
            break;
        }
    }
    pc1_handle.abort();
    queue_handle.abort();

    // second incarnation on the same journal
    let (queue_tx, queue_rx) = mpsc::channel::<DurableQueueCommand<String>>(64);
    tokio::spawn(run_event_sourced_queue::<String>(journal, queue_rx));
    let (pc2_ref, pc2_inbox) = producer_controller_channel::<String>();
    tokio::spawn(run_producer_controller(
        config.clone(),
        "p-1".to_string(),
        pc2_ref.clone(),
        pc2_inbox,
        Some(queue_tx),
        None,
    ));
    let (producer_tx, mut request_nexts) = mpsc::channel::<RequestNext<String>>(8);
    pc2_ref.try_send(ProducerControllerMsg::Start {
        producer: producer_tx,
    });
    cc_ref.try_send(ConsumerControllerMsg::RegisterToProducerController {
        producer: pc2_ref.clone(),
    });

    // b and c are redelivered from the reloaded unconfirmed buffer
    let deliveries = await_deliveries(&log, 3).await;
    assert_eq!(
        deliveries,
        vec![entry(1, "a"), entry(2, "b"), entry(3, "c")]
    );

    // and new messages continue the sequence at 4
    let request_next = request_nexts.recv().await.unwrap();
    request_next.send_next("d".to_string()).await.unwrap();
    let deliveries = await_deliveries(&log, 4).await;
    assert_eq!(deliveries[3], entry(4, "d"));
}

#[tokio::test(start_paused = true)]
async fn test_first_message_is_retransmitted_until_consumer_starts() {
    let config = Arc::new(DeliveryConfig::new());

    let cc_ref = spawn_consumer_controller(&config, true);
    let link = Arc::new(LossyLink::dropping_once(cc_ref.clone(), []));
    let (pc_ref, pc_inbox) = producer_controller_channel::<String>();
    tokio::spawn(run_producer_controller(
        config.clone(),
        "p-1".to_string(),
        pc_ref.clone(),
        pc_inbox,
        None,
        Some(Box::new(link.clone())),
    ));

    let (producer_tx, mut request_nexts) = mpsc::channel::<RequestNext<String>>(8);
    pc_ref.try_send(ProducerControllerMsg::Start {
        producer: producer_tx,
    });
    let request_next = request_nexts.recv().await.unwrap();
    request_next.send_next("a".to_string()).await.unwrap();

    // the consumer controller has no Start yet: it stashes, and the producer
    //  keeps retransmitting the first message
    time::sleep(Duration::from_millis(3500)).await;
    let offered = link.offered();
    assert!(
        offered.len() >= 3,
        "expected repeated first-message transmissions, got {:?}",
        offered
    );
    assert!(offered.iter().all(|(seq_nr, first)| *seq_nr == 1 && *first));

    // once Start arrives the stashed message is processed exactly once
    let (deliver_tx, mut deliveries) = mpsc::channel::<Delivery<String>>(16);
    cc_ref.try_send(ConsumerControllerMsg::Start {
        consumer: deliver_tx,
    });
    let delivery = deliveries.recv().await.unwrap();
    assert_eq!((delivery.seq_nr, delivery.msg.as_str()), (1, "a"));
    delivery.confirm();

    // later retransmissions of the first message are deduplicated
    time::sleep(Duration::from_millis(3000)).await;
    assert!(deliveries.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_flow_control_only_mode_accepts_loss() {
    let config = Arc::new(DeliveryConfig::new());

    let cc_ref = spawn_consumer_controller(&config, false);
    let log = spawn_auto_confirming_consumer(&cc_ref);

    // 2 and 5..=34 are lost for good; without resend support nothing brings
    //  them back
    let lost = std::iter::once(2u64).chain(5..=34);
    let link = Arc::new(LossyLink::dropping_once(cc_ref.clone(), lost));
    let (pc_ref, pc_inbox) = producer_controller_channel::<String>();
    tokio::spawn(run_producer_controller(
        config.clone(),
        "p-1".to_string(),
        pc_ref.clone(),
        pc_inbox,
        None,
        Some(Box::new(link.clone())),
    ));

    let (producer_tx, mut request_nexts) = mpsc::channel::<RequestNext<String>>(8);
    pc_ref.try_send(ProducerControllerMsg::Start {
        producer: producer_tx,
    });

    for i in 1..=35 {
        let request_next = request_nexts.recv().await.unwrap();
        request_next.send_next(format!("m{}", i)).await.unwrap();
    }

    let deliveries = await_deliveries(&log, 4).await;
    assert_eq!(
        deliveries,
        vec![entry(1, "m1"), entry(3, "m3"), entry(4, "m4"), entry(35, "m35")]
    );

    // no retransmission ever happened: every seq nr crossed the link once, in
    //  order
    let offered = link.offered().iter().map(|(s, _)| *s).collect::<Vec<_>>();
    assert_eq!(offered, (1..=35).collect::<Vec<_>>());
}
