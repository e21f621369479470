use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to another agent's inbox: the sending half of its channel plus a
///  process-unique id.
///
/// The id is what makes references comparable - the consumer controller detects
///  a replaced producer controller (i.e. a new epoch) by comparing the reference
///  carried in a SequencedMessage against the one it knows. The handle is
///  non-owning: dropping it never tears down the agent behind it.
pub struct LocalRef<M> {
    id: u64,
    inbox: mpsc::Sender<M>,
}

impl<M> LocalRef<M> {
    /// creates the inbox channel together with its addressable handle
    pub fn channel(capacity: usize) -> (LocalRef<M>, mpsc::Receiver<M>) {
        let (tx, rx) = mpsc::channel(capacity);
        let r = LocalRef {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            inbox: tx,
        };
        (r, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fire-and-forget send with transport semantics: a full or closed inbox is
    ///  treated as message loss, which the protocol's timers recover from.
    pub fn try_send(&self, msg: M) {
        if let Err(e) = self.inbox.try_send(msg) {
            debug!("dropping message to {:?}: {}", self.id, e.to_string());
        }
    }

    pub async fn send(&self, msg: M) -> anyhow::Result<()> {
        self.inbox
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("ref {} is terminated", self.id))
    }
}

impl<M> Clone for LocalRef<M> {
    fn clone(&self) -> Self {
        LocalRef {
            id: self.id,
            inbox: self.inbox.clone(),
        }
    }
}

impl<M> PartialEq for LocalRef<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<M> Eq for LocalRef<M> {}

impl<M> Debug for LocalRef<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[ref:{}]", self.id)
    }
}
