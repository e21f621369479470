use std::sync::Mutex;

use rustc_hash::FxHashSet;

use crate::consumer::ConsumerControllerRef;
use crate::messages::{SequencedMessage, SequencedMessageSink};

/// Send sink that records everything a producer controller transmits. Shared as
///  `Arc<RecordingSink<_>>` so tests keep a handle after registering it.
#[derive(Debug)]
pub struct RecordingSink<A> {
    sent: Mutex<Vec<SequencedMessage<A>>>,
}

impl<A> RecordingSink<A> {
    pub fn new() -> RecordingSink<A> {
        RecordingSink {
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn take_sent(&self) -> Vec<SequencedMessage<A>> {
        std::mem::take(&mut self.sent.lock().expect("recording sink lock poisoned"))
    }
}

impl<A: Clone + Send + 'static> SequencedMessageSink<A> for std::sync::Arc<RecordingSink<A>> {
    fn send_sequenced(&self, seq_msg: SequencedMessage<A>) {
        self.sent
            .lock()
            .expect("recording sink lock poisoned")
            .push(seq_msg);
    }
}

/// A transmission link between a producer controller and a consumer controller
///  that drops selected sequence numbers: either only their first transmission
///  (so resend recovery can be exercised) or every transmission (simulating a
///  partition for those messages). Everything offered to the link, including
///  what was dropped, is recorded.
pub struct LossyLink<A> {
    forward_to: ConsumerControllerRef<A>,
    drop_once: Mutex<FxHashSet<u64>>,
    drop_always: FxHashSet<u64>,
    offered: Mutex<Vec<(u64, bool)>>,
}

impl<A> LossyLink<A> {
    pub fn dropping_once(
        forward_to: ConsumerControllerRef<A>,
        seq_nrs: impl IntoIterator<Item = u64>,
    ) -> LossyLink<A> {
        LossyLink {
            forward_to,
            drop_once: Mutex::new(seq_nrs.into_iter().collect()),
            drop_always: FxHashSet::default(),
            offered: Mutex::new(Vec::new()),
        }
    }

    pub fn dropping_always(
        forward_to: ConsumerControllerRef<A>,
        seq_nrs: impl IntoIterator<Item = u64>,
    ) -> LossyLink<A> {
        LossyLink {
            forward_to,
            drop_once: Mutex::new(FxHashSet::default()),
            drop_always: seq_nrs.into_iter().collect(),
            offered: Mutex::new(Vec::new()),
        }
    }

    /// (seq_nr, first) of everything the producer tried to transmit
    pub fn offered(&self) -> Vec<(u64, bool)> {
        self.offered
            .lock()
            .expect("lossy link lock poisoned")
            .clone()
    }
}

impl<A: Clone + Send + 'static> SequencedMessageSink<A> for std::sync::Arc<LossyLink<A>> {
    fn send_sequenced(&self, seq_msg: SequencedMessage<A>) {
        self.offered
            .lock()
            .expect("lossy link lock poisoned")
            .push((seq_msg.seq_nr, seq_msg.first));
        if self.drop_always.contains(&seq_msg.seq_nr) {
            return;
        }
        if self
            .drop_once
            .lock()
            .expect("lossy link lock poisoned")
            .remove(&seq_msg.seq_nr)
        {
            return;
        }
        self.forward_to.send_sequenced(seq_msg);
    }
}
