use crate::endpoint::JmsEndpoint;
use crate::error::{Error, Result};
use crate::exchange::{Exchange, ExchangePattern};
use crate::transfer::RemoteFailure;

use std::error::Error as StdError;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use courier_messaging::message::DEFAULT_PRIORITY;
use courier_messaging::{Connection, ConnectionFactory, Consumer, Message, SendOptions};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

/// Marker trait for request handler errors.
pub trait HandlerError: StdError + Send + Sync + 'static {}

/// Handles requests received by a [`JmsConsumer`].
#[async_trait]
pub trait RequestHandler
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: HandlerError;

    /// Processes one request. The returned exchange's body and headers form
    /// the reply when the request asked for one.
    async fn handle(&self, exchange: Exchange) -> Result<Exchange, Self::Error>;
}

enum Stop {
    Cancelled,
    Lost,
}

#[derive(Debug)]
struct ConsumerInner<F, H>
where
    F: ConnectionFactory,
    H: RequestHandler,
{
    endpoint: JmsEndpoint<F>,
    handler: H,
}

/// Listener container: consumes requests from an endpoint's destination with
/// `concurrentConsumers` listeners and sends back the handler's replies.
#[derive(Debug)]
pub struct JmsConsumer<F, H>
where
    F: ConnectionFactory,
    H: RequestHandler,
{
    inner: Arc<ConsumerInner<F, H>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<F, H> JmsConsumer<F, H>
where
    F: ConnectionFactory,
    H: RequestHandler,
{
    pub(crate) fn new(endpoint: JmsEndpoint<F>, handler: H) -> Self {
        Self {
            inner: Arc::new(ConsumerInner { endpoint, handler }),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Spawns the listeners.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<()> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let listeners = self.inner.endpoint.config().concurrent_consumers;
        for index in 0..listeners {
            let inner = Arc::clone(&self.inner);
            let shutdown_token = self.shutdown_token.clone();
            self.task_tracker
                .spawn(async move { inner.listen(index, shutdown_token).await });
        }
        self.task_tracker.close();

        info!(destination = %self.inner.endpoint.destination(), listeners, "consumer started");
        Ok(())
    }

    /// Stops the listeners and waits for in-flight requests to finish.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        debug!(destination = %self.inner.endpoint.destination(), "consumer stopped");
    }
}

impl<F, H> ConsumerInner<F, H>
where
    F: ConnectionFactory,
    H: RequestHandler,
{
    async fn listen(&self, index: usize, shutdown_token: CancellationToken) {
        let destination = self.endpoint.destination();
        let recovery_interval = self.endpoint.config().recovery_interval;

        loop {
            match self.session().await {
                Ok((connection, consumer)) => {
                    trace!(listener = index, %destination, "listening");
                    let stop = self.consume(&connection, &consumer, &shutdown_token).await;

                    if let Err(error) = consumer.close().await {
                        debug!(%error, "failed to close request consumer");
                    }
                    if let Err(error) = connection.close().await {
                        debug!(%error, "failed to close listener connection");
                    }

                    if matches!(stop, Stop::Cancelled) {
                        break;
                    }
                }
                Err(error) => {
                    warn!(%error, listener = index, %destination, "failed to start listener");
                }
            }

            tokio::select! {
                biased;
                () = shutdown_token.cancelled() => break,
                () = tokio::time::sleep(recovery_interval) => {}
            }
            info!(listener = index, %destination, "recovering listener");
        }
    }

    async fn session(
        &self,
    ) -> Result<(
        F::Connection,
        <F::Connection as Connection>::Consumer,
    )> {
        let connection = self
            .endpoint
            .factory()
            .create_connection()
            .await
            .map_err(Error::messaging)?;

        match connection
            .create_consumer(self.endpoint.destination(), None)
            .await
        {
            Ok(consumer) => Ok((connection, consumer)),
            Err(error) => {
                if let Err(close_error) = connection.close().await {
                    debug!(%close_error, "failed to close listener connection");
                }
                Err(Error::messaging(error))
            }
        }
    }

    async fn consume<C>(
        &self,
        connection: &C,
        consumer: &C::Consumer,
        shutdown_token: &CancellationToken,
    ) -> Stop
    where
        C: Connection,
    {
        loop {
            let received = tokio::select! {
                biased;
                () = shutdown_token.cancelled() => return Stop::Cancelled,
                received = consumer.receive() => received,
            };

            match received {
                Ok(Some(request)) => self.on_request(connection, request).await,
                Ok(None) if shutdown_token.is_cancelled() => return Stop::Cancelled,
                Ok(None) => return Stop::Lost,
                Err(error) => {
                    warn!(%error, destination = %self.endpoint.destination(), "request consumer failed");
                    return Stop::Lost;
                }
            }
        }
    }

    async fn on_request<C>(&self, connection: &C, request: Message)
    where
        C: Connection,
    {
        let config = self.endpoint.config();
        let binding = self.endpoint.binding();

        let reply_to = request.reply_to.clone().filter(|_| !config.disable_reply_to);
        let pattern = if reply_to.is_some() {
            ExchangePattern::InOut
        } else {
            ExchangePattern::InOnly
        };

        let outcome = self
            .handler
            .handle(binding.make_exchange(&request, pattern))
            .await;

        let Some(reply_to) = reply_to else {
            if let Err(error) = outcome {
                error!(%error, message_id = ?request.message_id, "handler failed");
            }
            return;
        };

        let mut reply = match outcome {
            Ok(response) => binding.make_message(&response),
            Err(error) if config.transfer_exception => {
                warn!(%error, message_id = ?request.message_id, "handler failed, transferring failure to requester");
                match RemoteFailure::capture(&error).to_message() {
                    Ok(reply) => reply,
                    Err(encode_error) => {
                        error!(%encode_error, "failed to encode handler failure");
                        return;
                    }
                }
            }
            Err(error) => {
                error!(%error, message_id = ?request.message_id, "handler failed, no reply sent");
                return;
            }
        };

        if &reply_to == self.endpoint.destination() && !config.reply_to_same_destination_allowed {
            warn!(%reply_to, "refusing to reply to the destination being consumed");
            return;
        }

        reply.correlation_id = self.reply_correlation_id(&request);
        reply.reply_to = None;
        if let Some(property) = config.correlation_property.as_deref() {
            if let Some(value) = request.properties.get(property) {
                reply.properties.insert(property.to_string(), value.clone());
            }
        }

        let options = if config.qos.explicit_qos_enabled {
            SendOptions {
                delivery_mode: config.qos.delivery_mode,
                priority: config.qos.priority,
                time_to_live: config.qos.time_to_live,
            }
        } else {
            SendOptions {
                delivery_mode: config.qos.delivery_mode,
                priority: DEFAULT_PRIORITY,
                time_to_live: None,
            }
        };

        match connection.send(&reply_to, reply, &options).await {
            Ok(message_id) => trace!(%reply_to, %message_id, "reply sent"),
            Err(error) => warn!(%error, %reply_to, "failed to send reply"),
        }
    }

    /// The request's correlation id, falling back to its message id.
    fn reply_correlation_id(&self, request: &Message) -> Option<String> {
        if self.endpoint.config().use_message_id_as_correlation_id {
            return request.message_id.clone();
        }

        request
            .correlation_id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| request.message_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::JmsComponent;

    use std::time::Duration;

    use courier_messaging_memory::MemoryBroker;
    use tracing_test::traced_test;

    #[derive(Debug, thiserror::Error)]
    #[error("echo failed")]
    struct EchoError;

    impl HandlerError for EchoError {}

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        type Error = EchoError;

        async fn handle(&self, exchange: Exchange) -> Result<Exchange, EchoError> {
            Ok(exchange)
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_session_releases_connection() {
        let broker = MemoryBroker::new();
        let component = JmsComponent::new(broker.clone());
        let consumer = component
            .endpoint("jms:temp-queue:ID:gone:1?recoveryInterval=20")
            .unwrap()
            .create_consumer(Echo)
            .unwrap();

        consumer.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(broker.connection_count(), 0);
        assert!(logs_contain("failed to start listener"));

        consumer.shutdown().await;
    }
}
