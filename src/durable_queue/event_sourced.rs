use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::durable_queue::{DurableQueueCommand, QueueEvent, QueueState, StoreMessageSentAck};
use crate::wire_messages::WirePayload;

/// Append-only storage for serialized queue events. This is the seam to an
///  actual journal backend; the queue itself only appends and replays.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait EventJournal: Send + Sync + 'static {
    async fn append(&self, event: Bytes) -> anyhow::Result<()>;
    async fn load(&self) -> anyhow::Result<Vec<Bytes>>;
}

/// Journal that keeps events on the heap. Useful for tests and for processes
///  that only need producer-restart (not process-restart) durability.
#[derive(Debug, Default)]
pub struct InMemJournal {
    events: Mutex<Vec<Bytes>>,
}

impl InMemJournal {
    pub fn new() -> Arc<InMemJournal> {
        Arc::new(InMemJournal::default())
    }
}

#[async_trait::async_trait]
impl EventJournal for InMemJournal {
    async fn append(&self, event: Bytes) -> anyhow::Result<()> {
        self.events
            .lock()
            .expect("in-mem journal lock poisoned")
            .push(event);
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<Vec<Bytes>> {
        Ok(self
            .events
            .lock()
            .expect("in-mem journal lock poisoned")
            .clone())
    }
}

/// Runs a durable producer queue on top of an event journal: replays the journal
///  into a [QueueState] on start, then persists every command before answering.
///
/// A retried StoreMessageSent for the sequence number that was just stored (the
///  controller's store-ack got lost) is acknowledged without being persisted
///  again; any other out-of-sequence store is a programming error and fatal.
pub async fn run_event_sourced_queue<A>(
    journal: Arc<dyn EventJournal>,
    mut inbox: mpsc::Receiver<DurableQueueCommand<A>>,
) -> anyhow::Result<()>
where
    A: WirePayload + Clone + Debug + Send + 'static,
{
    let mut state = QueueState::initial();
    for raw in journal.load().await? {
        let event = QueueEvent::<A>::try_deser(&mut raw.as_ref())?;
        state.apply(event);
    }
    debug!(
        "replayed journal: current seq nr {}, {} unconfirmed",
        state.current_seq_nr,
        state.unconfirmed.len()
    );

    while let Some(cmd) = inbox.recv().await {
        match cmd {
            DurableQueueCommand::LoadState { reply_to } => {
                let _ = reply_to.send(state.clone());
            }
            DurableQueueCommand::StoreMessageSent { sent, reply_to } => {
                let stored_seq_nr = sent.seq_nr;
                if sent.seq_nr == state.current_seq_nr {
                    append(journal.as_ref(), &mut state, QueueEvent::MessageSent(sent)).await?;
                } else if sent.seq_nr == state.current_seq_nr - 1 {
                    // the ack for this store was lost and the controller retried
                    debug!("duplicate store of seq nr {} - not persisting again", sent.seq_nr);
                } else {
                    return Err(anyhow!(
                        "store of seq nr {} does not match current seq nr {}",
                        sent.seq_nr,
                        state.current_seq_nr
                    ));
                }
                let _ = reply_to.send(StoreMessageSentAck { stored_seq_nr });
            }
            DurableQueueCommand::StoreMessageConfirmed { seq_nr, qualifier } => {
                if seq_nr <= state.confirmed_seq_nr_for(&qualifier) {
                    debug!("stale confirmed watermark {} for {:?} - skipping", seq_nr, qualifier);
                    continue;
                }
                if let Err(e) = append(
                    journal.as_ref(),
                    &mut state,
                    QueueEvent::Confirmed { seq_nr, qualifier },
                )
                .await
                {
                    // write-behind watermark: losing it only causes replay
                    warn!("failed to persist confirmed watermark: {}", e);
                }
            }
        }
    }
    Ok(())
}

async fn append<A>(
    journal: &dyn EventJournal,
    state: &mut QueueState<A>,
    event: QueueEvent<A>,
) -> anyhow::Result<()>
where
    A: WirePayload + Clone,
{
    let mut buf = BytesMut::new();
    event.ser(&mut buf);
    journal.append(buf.freeze()).await?;
    state.apply(event);
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use crate::durable_queue::{MessageSent, NO_QUALIFIER};

    use super::*;

    fn sent(seq_nr: u64, msg: &str) -> MessageSent<String> {
        MessageSent {
            seq_nr,
            msg: msg.to_string(),
            ack: false,
            qualifier: NO_QUALIFIER.to_string(),
        }
    }

    async fn store(
        queue: &mpsc::Sender<DurableQueueCommand<String>>,
        msg: MessageSent<String>,
    ) -> u64 {
        let (tx, rx) = oneshot::channel();
        queue
            .send(DurableQueueCommand::StoreMessageSent {
                sent: msg,
                reply_to: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap().stored_seq_nr
    }

    async fn load(queue: &mpsc::Sender<DurableQueueCommand<String>>) -> QueueState<String> {
        let (tx, rx) = oneshot::channel();
        queue
            .send(DurableQueueCommand::LoadState { reply_to: tx })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_store_and_reload() {
        let journal = InMemJournal::new();

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_event_sourced_queue::<String>(journal.clone(), rx));

        assert_eq!(load(&tx).await, QueueState::initial());

        assert_eq!(store(&tx, sent(1, "a")).await, 1);
        assert_eq!(store(&tx, sent(2, "b")).await, 2);
        tx.send(DurableQueueCommand::StoreMessageConfirmed {
            seq_nr: 1,
            qualifier: NO_QUALIFIER.to_string(),
        })
        .await
        .unwrap();

        let state = load(&tx).await;
        assert_eq!(state.current_seq_nr, 3);
        assert_eq!(state.highest_confirmed_seq_nr, 1);
        assert_eq!(
            state.unconfirmed.iter().map(|m| m.seq_nr).collect::<Vec<_>>(),
            vec![2]
        );

        // a fresh queue instance on the same journal rehydrates the same state
        drop(tx);
        handle.await.unwrap().unwrap();

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_event_sourced_queue::<String>(journal, rx));
        assert_eq!(load(&tx).await, state);
    }

    #[tokio::test]
    async fn test_duplicate_store_is_acked_without_persisting() {
        let journal = InMemJournal::new();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_event_sourced_queue::<String>(journal.clone(), rx));

        assert_eq!(store(&tx, sent(1, "a")).await, 1);
        assert_eq!(store(&tx, sent(1, "a")).await, 1);

        assert_eq!(journal.events.lock().unwrap().len(), 1);
        assert_eq!(load(&tx).await.current_seq_nr, 2);
    }

    #[tokio::test]
    async fn test_out_of_sequence_store_is_fatal() {
        let journal = InMemJournal::new();
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_event_sourced_queue::<String>(journal, rx));

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(DurableQueueCommand::StoreMessageSent {
            sent: sent(7, "x"),
            reply_to: reply_tx,
        })
        .await
        .unwrap();

        assert!(reply_rx.await.is_err());
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_append_failure_is_fatal_for_store_sent() {
        let mut journal = MockEventJournal::new();
        journal.expect_load().returning(|| Ok(Vec::new()));
        journal
            .expect_append()
            .returning(|_| Err(anyhow!("journal gone")));

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_event_sourced_queue::<String>(Arc::new(journal), rx));

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(DurableQueueCommand::StoreMessageSent {
            sent: sent(1, "a"),
            reply_to: reply_tx,
        })
        .await
        .unwrap();

        assert!(reply_rx.await.is_err());
        assert!(handle.await.unwrap().is_err());
    }
}
