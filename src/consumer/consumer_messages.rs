use tokio::sync::mpsc;

use crate::messages::SequencedMessage;
use crate::producer::ProducerControllerRef;
use crate::refs::LocalRef;

pub type ConsumerControllerRef<A> = LocalRef<ConsumerControllerMsg<A>>;

/// Everything a consumer controller's inbox accepts: lifecycle messages from the
///  application side, the producer side's sequenced stream, and the application
///  consumer's confirmations.
pub enum ConsumerControllerMsg<A> {
    Start {
        consumer: mpsc::Sender<Delivery<A>>,
    },
    /// makes the controller register itself with the given producer controller,
    ///  retried until the producer's first message arrives
    RegisterToProducerController {
        producer: ProducerControllerRef<A>,
    },

    SequencedMessage(SequencedMessage<A>),

    /// the application consumer's acknowledgement of the one outstanding Delivery
    Confirmed {
        seq_nr: u64,
    },
}

/// One application message, handed to the application consumer. Exactly one
///  Delivery is outstanding at a time; the next one follows once this one is
///  confirmed via [Delivery::confirm].
#[derive(Debug, Clone)]
pub struct Delivery<A> {
    pub producer_id: String,
    pub seq_nr: u64,
    pub msg: A,
    pub confirm_to: ConsumerControllerRef<A>,
}

impl<A> Delivery<A> {
    pub fn confirm(&self) {
        self.confirm_to.try_send(ConsumerControllerMsg::Confirmed {
            seq_nr: self.seq_nr,
        });
    }
}
