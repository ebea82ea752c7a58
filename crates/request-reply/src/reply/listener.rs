use super::{ReplyBinding, ReplyManager};
use crate::config::ReplyStrategy;
use crate::correlator::Resolution;

use std::sync::Arc;
use std::time::Duration;

use courier_messaging::{ConnectionFactory, Consumer, Message};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

/// How often shared listeners re-run their selector against waiting replies.
/// Pending keys change without the queue changing, so a reply rejected a
/// moment ago may be acceptable now.
const SHARED_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Served {
    Cancelled,
    Lost,
}

impl<F> ReplyManager<F>
where
    F: ConnectionFactory,
{
    pub(super) async fn run(self: Arc<Self>, mut binding: ReplyBinding<F::Connection>) {
        loop {
            let served = self.serve(&binding).await;
            binding.close().await;

            if served == Served::Cancelled || self.shutdown_token.is_cancelled() {
                break;
            }

            warn!(strategy = %self.strategy, "reply destination lost, rebinding");
            let Some(rebound) = self.rebind().await else {
                break;
            };
            binding = rebound;

            *self.reply_to.write() = Some(binding.destination().clone());
            info!(reply_to = %binding.destination(), "reply destination rebound");
        }
    }

    async fn rebind(&self) -> Option<ReplyBinding<F::Connection>> {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown_token.cancelled() => return None,
                () = tokio::time::sleep(self.recovery_interval) => {}
            }

            match self.bind().await {
                Ok(binding) => return Some(binding),
                Err(error) => warn!(%error, "failed to rebind reply destination, retrying"),
            }
        }
    }

    /// Runs one listener per consumer until shutdown or until any of them
    /// loses its consumer, which stops the others.
    async fn serve(&self, binding: &ReplyBinding<F::Connection>) -> Served {
        let listeners_token = self.shutdown_token.child_token();

        let outcomes = join_all(
            binding
                .consumers()
                .iter()
                .map(|consumer| self.listen(consumer, &listeners_token)),
        )
        .await;

        if self.shutdown_token.is_cancelled() {
            Served::Cancelled
        } else if outcomes.contains(&Served::Lost) {
            Served::Lost
        } else {
            Served::Cancelled
        }
    }

    async fn listen<C>(&self, consumer: &C, listeners_token: &CancellationToken) -> Served
    where
        C: Consumer,
    {
        loop {
            let received = tokio::select! {
                biased;
                () = listeners_token.cancelled() => return Served::Cancelled,
                received = self.receive(consumer) => received,
            };

            match received {
                Ok(Some(message)) => self.on_reply(message),
                Ok(None) => {
                    listeners_token.cancel();
                    return Served::Lost;
                }
                Err(error) => {
                    warn!(%error, destination = %consumer.destination(), "reply consumer failed");
                    listeners_token.cancel();
                    return Served::Lost;
                }
            }
        }
    }

    async fn receive<C>(&self, consumer: &C) -> Result<Option<Message>, C::Error>
    where
        C: Consumer,
    {
        if !matches!(self.strategy, ReplyStrategy::Shared { .. }) {
            return consumer.receive().await;
        }

        loop {
            if let Ok(received) = tokio::time::timeout(SHARED_POLL_INTERVAL, consumer.receive()).await {
                return received;
            }
        }
    }

    fn on_reply(&self, message: Message) {
        let Some(key) = super::correlation_key(&message, self.correlation_property.as_deref())
        else {
            warn!(message_id = ?message.message_id, "reply carries no correlation key, dropping");
            return;
        };

        match self.correlator.resolve(&key, message) {
            Resolution::Delivered => trace!(correlation_id = %key, "reply matched"),
            Resolution::Parked => trace!(correlation_id = %key, "reply parked"),
            Resolution::Unmatched => {
                warn!(correlation_id = %key, "reply matched no waiting request, dropping");
            }
        }
    }
}
