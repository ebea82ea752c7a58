use crate::config::{CorrelationStrategy, ReplyStrategy, TemporaryAffinity};
use crate::endpoint::JmsEndpoint;
use crate::error::{Error, Result};
use crate::exchange::{Exchange, ExchangePattern, HeaderValue, Reply, headers};
use crate::reply::ReplyManager;
use crate::transfer::RemoteFailure;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use courier_messaging::message::DEFAULT_PRIORITY;
use courier_messaging::{
    Connection, ConnectionFactory, Destination, Message, MessagingError, PropertyValue,
    SendOptions,
};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Prefix of correlation ids generated for requests that carry none.
pub const GENERATED_CORRELATION_ID_PREFIX: &str = "Courier-";

/// Returns a fresh correlation id.
#[must_use]
pub fn generate_correlation_id() -> String {
    format!("{GENERATED_CORRELATION_ID_PREFIX}{}", Uuid::new_v4())
}

/// What [`JmsProducer::process`] did with an exchange.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The request was answered.
    Replied(Reply),

    /// The message was sent without waiting for a reply.
    Sent {
        /// Provider id of the sent message.
        message_id: String,
    },
}

/// Sends exchanges to an endpoint's destination, waiting for replies when the
/// exchange asks for one.
#[derive(Debug)]
pub struct JmsProducer<F>
where
    F: ConnectionFactory,
{
    endpoint: JmsEndpoint<F>,
    strategy: ReplyStrategy,
    connection: Mutex<Option<F::Connection>>,
    reply_manager: OnceCell<Arc<ReplyManager<F>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<F> JmsProducer<F>
where
    F: ConnectionFactory,
{
    pub(crate) fn new(endpoint: JmsEndpoint<F>, strategy: ReplyStrategy) -> Self {
        Self {
            endpoint,
            strategy,
            connection: Mutex::new(None),
            reply_manager: OnceCell::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// The reply strategy resolved for this producer.
    #[must_use]
    pub const fn reply_strategy(&self) -> &ReplyStrategy {
        &self.strategy
    }

    /// Opens the sending connection. The reply destination is bound on the
    /// first request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call, or the provider
    /// error if no connection can be opened.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        self.connection().await?;
        debug!(destination = %self.endpoint.destination(), strategy = %self.strategy, "producer started");

        Ok(())
    }

    /// Stops the reply manager this producer owns and closes the connection.
    /// Requests still waiting fail with [`Error::Stopped`].
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.owns_reply_manager() {
            if let Some(manager) = self.reply_manager.get() {
                manager.shutdown().await;
            }
        }

        if let Some(connection) = self.connection.lock().await.take() {
            if let Err(error) = connection.close().await {
                debug!(%error, "failed to close producer connection");
            }
        }

        debug!(destination = %self.endpoint.destination(), "producer stopped");
    }

    /// Sends the exchange as a request or as a one-way message depending on
    /// its pattern and `disableReplyTo`.
    ///
    /// # Errors
    ///
    /// See [`JmsProducer::request`] and [`JmsProducer::send`].
    pub async fn process(&self, exchange: Exchange) -> Result<Outcome> {
        if exchange.pattern == ExchangePattern::InOut && !self.endpoint.config().disable_reply_to {
            self.request(exchange).await.map(Outcome::Replied)
        } else {
            let message_id = self.send(exchange).await?;
            Ok(Outcome::Sent { message_id })
        }
    }

    /// Sends a request and waits for its reply.
    ///
    /// The `CourierJmsRequestTimeout` header (milliseconds) overrides the
    /// endpoint timeout and `CourierJmsDestinationName` the destination.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExchangeTimedOut`] if no reply arrives in time,
    /// [`Error::RemoteProcessingFailure`] if the responder transferred a
    /// failure, [`Error::DuplicateCorrelationKey`] if the correlation id is
    /// already in flight, or the provider error if sending fails.
    #[instrument(skip(self, exchange), fields(destination = %self.endpoint.destination()))]
    pub async fn request(&self, exchange: Exchange) -> Result<Reply> {
        self.ensure_running()?;

        let config = self.endpoint.config();
        let manager = self.reply_manager().await?;
        let timeout = request_timeout(&exchange, config.request_timeout);
        let destination = self.target(&exchange);

        let mut message = self.endpoint.binding().make_message(&exchange);
        message.reply_to = Some(match config.reply_to_override.as_deref() {
            Some(name) => Destination::parse(name),
            None => manager.reply_to()?,
        });
        let options = self.send_options(&message, Some(timeout));

        let pending = match config.correlation_strategy() {
            CorrelationStrategy::MessageId => {
                // The responder must echo our message id, not a caller value.
                message.correlation_id = None;

                let mut pending = manager.correlator().register_provisional(timeout);
                match self.send_message(&destination, message, &options).await {
                    Ok(message_id) => {
                        pending.rekey(message_id)?;
                        pending
                    }
                    Err(error) => {
                        pending.cancel();
                        return Err(error);
                    }
                }
            }
            CorrelationStrategy::CorrelationId => {
                let key = self.assign_correlation_key(&mut message);
                let pending = manager.correlator().register(key, timeout)?;
                if let Err(error) = self.send_message(&destination, message, &options).await {
                    pending.cancel();
                    return Err(error);
                }
                pending
            }
        };

        debug!(correlation_id = %pending.key(), ?timeout, "request sent, waiting for reply");

        let reply = pending.wait().await?;
        self.reply_from(reply)
    }

    /// Sends a one-way message and returns its provider message id.
    ///
    /// `JMSReplyTo` is only kept when `preserveMessageQos` or
    /// `explicitQosEnabled` is set, and never with `disableReplyTo`.
    ///
    /// # Errors
    ///
    /// Returns the provider error if sending fails.
    #[instrument(skip(self, exchange), fields(destination = %self.endpoint.destination()))]
    pub async fn send(&self, exchange: Exchange) -> Result<String> {
        self.ensure_running()?;

        let config = self.endpoint.config();
        let destination = self.target(&exchange);
        let mut message = self.endpoint.binding().make_message(&exchange);

        let keep_reply_to = !config.disable_reply_to
            && (config.qos.preserve_message_qos || config.qos.explicit_qos_enabled);
        if !keep_reply_to && message.reply_to.take().is_some() {
            debug!("dropping JMSReplyTo from one-way message");
        }

        let options = self.send_options(&message, None);
        let message_id = self.send_message(&destination, message, &options).await?;

        debug!(%message_id, "message sent");
        Ok(message_id)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            Err(Error::Stopped)
        } else if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotStarted)
        }
    }

    const fn owns_reply_manager(&self) -> bool {
        !matches!(
            self.strategy,
            ReplyStrategy::Temporary {
                affinity: TemporaryAffinity::Component
            }
        )
    }

    async fn reply_manager(&self) -> Result<&Arc<ReplyManager<F>>> {
        self.reply_manager
            .get_or_try_init(|| async {
                let config = self.endpoint.config();
                if self.owns_reply_manager() {
                    let manager = ReplyManager::new(
                        self.endpoint.factory().clone(),
                        self.strategy.clone(),
                        config,
                    );
                    manager.start().await?;
                    Ok::<_, Error>(manager)
                } else {
                    self.endpoint
                        .component()
                        .temporary_reply_manager(config)
                        .await
                }
            })
            .await
    }

    fn target(&self, exchange: &Exchange) -> Destination {
        exchange
            .header(headers::DESTINATION_NAME)
            .and_then(HeaderValue::as_string)
            .filter(|name| !name.is_empty())
            .map_or_else(
                || self.endpoint.destination().clone(),
                |name| Destination::parse(&name),
            )
    }

    /// Ensures the message carries a correlation key and returns it. Values
    /// generated by an earlier hop are replaced.
    fn assign_correlation_key(&self, message: &mut Message) -> String {
        let property = self.endpoint.config().correlation_property.as_deref();

        let existing = match property {
            Some(property) => message.string_property(property),
            None => message.correlation_id.clone(),
        };
        let key = existing
            .filter(|key| !key.is_empty() && !key.starts_with(GENERATED_CORRELATION_ID_PREFIX))
            .unwrap_or_else(generate_correlation_id);

        match property {
            Some(property) => {
                message
                    .properties
                    .insert(property.to_string(), PropertyValue::String(key.clone()));
            }
            None => message.correlation_id = Some(key.clone()),
        }

        key
    }

    fn send_options(&self, message: &Message, request_timeout: Option<Duration>) -> SendOptions {
        let config = self.endpoint.config();
        let qos = &config.qos;

        let (delivery_mode, priority) = if qos.preserve_message_qos {
            (message.delivery_mode, message.priority)
        } else if qos.explicit_qos_enabled {
            (qos.delivery_mode, qos.priority)
        } else {
            (qos.delivery_mode, DEFAULT_PRIORITY)
        };

        let time_to_live = match request_timeout {
            Some(_) if config.disable_time_to_live => None,
            Some(timeout) => Some(qos.time_to_live.unwrap_or(timeout)),
            None if qos.preserve_message_qos => message
                .expiration
                .and_then(|at| at.duration_since(SystemTime::now()).ok()),
            None if qos.explicit_qos_enabled => qos.time_to_live,
            None => None,
        };

        SendOptions {
            delivery_mode,
            priority,
            time_to_live,
        }
    }

    async fn connection(&self) -> Result<F::Connection> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref().filter(|connection| !connection.is_closed()) {
            return Ok(connection.clone());
        }

        let connection = self
            .endpoint
            .factory()
            .create_connection()
            .await
            .map_err(Error::messaging)?;
        *slot = Some(connection.clone());

        Ok(connection)
    }

    /// Sends on the current connection, reconnecting once if it was lost.
    async fn send_message(
        &self,
        destination: &Destination,
        message: Message,
        options: &SendOptions,
    ) -> Result<String> {
        let connection = self.connection().await?;

        match connection.send(destination, message.clone(), options).await {
            Ok(message_id) => Ok(message_id),
            Err(error) if error.is_connection_lost() => {
                warn!(%error, "producer connection lost, reconnecting");
                {
                    let mut slot = self.connection.lock().await;
                    if slot
                        .as_ref()
                        .is_some_and(|current| current.connection_id() == connection.connection_id())
                    {
                        *slot = None;
                    }
                }

                self.connection()
                    .await?
                    .send(destination, message, options)
                    .await
                    .map_err(Error::messaging)
            }
            Err(error) => Err(Error::messaging(error)),
        }
    }

    fn reply_from(&self, message: Message) -> Result<Reply> {
        if let Some(failure) = RemoteFailure::from_message(&message)? {
            debug!(kind = %failure.kind, "responder transferred a failure");
            return Err(Error::RemoteProcessingFailure(failure));
        }

        Ok(Reply {
            headers: self.endpoint.binding().extract_headers(&message),
            correlation_id: message.correlation_id,
            message_id: message.message_id,
            body: message.body,
        })
    }
}

fn request_timeout(exchange: &Exchange, default: Duration) -> Duration {
    exchange
        .header(headers::REQUEST_TIMEOUT)
        .and_then(HeaderValue::as_long)
        .and_then(|millis| u64::try_from(millis).ok())
        .filter(|millis| *millis > 0)
        .map_or(default, Duration::from_millis)
}
