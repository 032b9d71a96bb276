use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use thetaflow_error::{FlowError, Result};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::matrix::WorkerId;
use crate::message::{JoinerMessage, Participant, ReshufflerMessage, SynchronizerMessage};

/// One direction of communication with a participant.
pub trait Link<M>: Debug + Sync + Send {
    /// Try to send a message, handing it back on failure.
    fn send(&self, msg: M) -> std::result::Result<(), M>;
}

impl<M> Link<M> for mpsc::UnboundedSender<M>
where
    M: Debug + Send,
{
    fn send(&self, msg: M) -> std::result::Result<(), M> {
        mpsc::UnboundedSender::send(self, msg).map_err(|e| e.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: crate::config::DEFAULT_DELIVERY_ATTEMPTS,
            backoff: Duration::from_millis(crate::config::DEFAULT_DELIVERY_BACKOFF_MS),
        }
    }
}

/// Deliver a message, retrying with a fixed backoff.
///
/// Errors with a delivery error once every attempt failed.
pub async fn deliver_with_retry<M>(
    link: &dyn Link<M>,
    to: Participant,
    mut msg: M,
    policy: RetryPolicy,
) -> Result<()> {
    let attempts = policy.attempts.max(1);
    for attempt in 1..=attempts {
        match link.send(msg) {
            Ok(()) => return Ok(()),
            Err(returned) => {
                msg = returned;
                if attempt < attempts {
                    warn!(%to, attempt, "delivery failed, retrying");
                    tokio::time::sleep(policy.backoff).await;
                }
            }
        }
    }

    Err(FlowError::delivery("Failed to deliver message")
        .with_field("to", to)
        .with_field("attempts", attempts))
}

/// Registry of links to every participant, addressed by id.
///
/// Built once when the join is deployed and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct Topology {
    synchronizer: Arc<dyn Link<SynchronizerMessage>>,
    reshuffler: Arc<dyn Link<ReshufflerMessage>>,
    joiners: Vec<Arc<dyn Link<JoinerMessage>>>,
    retry: RetryPolicy,
}

impl Topology {
    pub fn new(
        synchronizer: Arc<dyn Link<SynchronizerMessage>>,
        reshuffler: Arc<dyn Link<ReshufflerMessage>>,
        joiners: Vec<Arc<dyn Link<JoinerMessage>>>,
        retry: RetryPolicy,
    ) -> Self {
        Topology {
            synchronizer,
            reshuffler,
            joiners,
            retry,
        }
    }

    pub fn num_joiners(&self) -> usize {
        self.joiners.len()
    }

    /// Every participant expected to acknowledge an epoch close.
    pub fn close_participants(&self) -> impl Iterator<Item = Participant> + '_ {
        std::iter::once(Participant::Reshuffler)
            .chain((0..self.joiners.len()).map(Participant::Joiner))
    }

    fn joiner(&self, worker: WorkerId) -> Result<&dyn Link<JoinerMessage>> {
        self.joiners
            .get(worker)
            .map(|link| link.as_ref())
            .ok_or_else(|| {
                FlowError::delivery("Unknown joiner")
                    .with_field("worker", worker)
                    .with_field("joiners", self.joiners.len())
            })
    }

    /// Send on the data path without retrying.
    pub fn send_joiner(&self, worker: WorkerId, msg: JoinerMessage) -> Result<()> {
        trace!(worker, kind = msg.kind(), "sending to joiner");
        self.joiner(worker)?.send(msg).map_err(|_| {
            FlowError::delivery("Joiner link closed").with_field("worker", worker)
        })
    }

    pub async fn deliver_joiner(&self, worker: WorkerId, msg: JoinerMessage) -> Result<()> {
        trace!(worker, kind = msg.kind(), "delivering to joiner");
        deliver_with_retry(self.joiner(worker)?, Participant::Joiner(worker), msg, self.retry).await
    }

    pub async fn deliver_reshuffler(&self, msg: ReshufflerMessage) -> Result<()> {
        deliver_with_retry(self.reshuffler.as_ref(), Participant::Reshuffler, msg, self.retry).await
    }

    pub async fn deliver_synchronizer(&self, msg: SynchronizerMessage) -> Result<()> {
        deliver_with_retry(self.synchronizer.as_ref(), Participant::Synchronizer, msg, self.retry)
            .await
    }
}
