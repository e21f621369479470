use tokio::sync::{mpsc, oneshot};

use crate::consumer::ConsumerControllerRef;
use crate::refs::LocalRef;

pub type ProducerControllerRef<A> = LocalRef<ProducerControllerMsg<A>>;

/// Everything a producer controller's inbox accepts: lifecycle messages from the
///  application side, application messages in response to [RequestNext], and the
///  flow control messages from the consumer side.
pub enum ProducerControllerMsg<A> {
    Start {
        producer: mpsc::Sender<RequestNext<A>>,
    },
    RegisterConsumer {
        consumer: ConsumerControllerRef<A>,
    },

    Msg(A),
    MsgWithConfirmation {
        msg: A,
        reply_to: oneshot::Sender<u64>,
    },

    Request {
        confirmed_seq_nr: u64,
        up_to_seq_nr: u64,
        support_resend: bool,
        via_timeout: bool,
    },
    Resend {
        from_seq_nr: u64,
    },
    Ack {
        confirmed_seq_nr: u64,
    },
}

/// Demand signal to the application producer: the controller is ready to accept
///  exactly one more message, either fire-and-forget via [RequestNext::send_next]
///  or with a sequence number reply via [RequestNext::ask_next].
#[derive(Debug, Clone)]
pub struct RequestNext<A> {
    pub producer_id: String,
    pub current_seq_nr: u64,
    pub confirmed_seq_nr: u64,
    pub send_next_to: ProducerControllerRef<A>,
}

impl<A> RequestNext<A> {
    pub async fn send_next(&self, msg: A) -> anyhow::Result<()> {
        self.send_next_to.send(ProducerControllerMsg::Msg(msg)).await
    }

    /// Hands the next message over and resolves to its assigned sequence number.
    ///  With a durable queue the reply comes once the message is persisted,
    ///  without one once the consumer confirmed it.
    pub async fn ask_next(&self, msg: A) -> anyhow::Result<u64> {
        let (reply_to, reply) = oneshot::channel();
        self.send_next_to
            .send(ProducerControllerMsg::MsgWithConfirmation { msg, reply_to })
            .await?;
        Ok(reply.await?)
    }
}
