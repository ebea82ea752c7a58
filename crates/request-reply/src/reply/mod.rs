mod binding;
mod listener;
mod selector;

pub use binding::ReplyBinding;
pub use selector::PendingKeysSelector;

use crate::config::{CorrelationStrategy, EndpointConfig, ReplyStrategy};
use crate::correlator::Correlator;
use crate::error::{Error, Result};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use courier_messaging::{ConnectionFactory, Destination, Message, Selector};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Returns the correlation key carried by a reply: the configured property if
/// any, otherwise `JMSCorrelationID`.
#[must_use]
pub fn correlation_key(message: &Message, correlation_property: Option<&str>) -> Option<String> {
    match correlation_property {
        Some(property) => message.string_property(property),
        None => message.correlation_id.clone(),
    }
    .filter(|key| !key.is_empty())
}

/// Owns a reply destination, the listeners consuming it and the correlator
/// matching what they receive to waiting requests.
pub struct ReplyManager<F>
where
    F: ConnectionFactory,
{
    factory: F,
    strategy: ReplyStrategy,
    correlator: Arc<Correlator<Message>>,
    correlation_property: Option<String>,
    concurrent_consumers: usize,
    recovery_interval: Duration,
    reply_to: RwLock<Option<Destination>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl<F> fmt::Debug for ReplyManager<F>
where
    F: ConnectionFactory,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyManager")
            .field("strategy", &self.strategy)
            .field("reply_to", &*self.reply_to.read())
            .field("correlator", &self.correlator)
            .finish_non_exhaustive()
    }
}

impl<F> ReplyManager<F>
where
    F: ConnectionFactory,
{
    /// Creates a manager for `strategy` using the endpoint's listener and
    /// timeout options. Nothing is bound until [`ReplyManager::start`].
    #[must_use]
    pub fn new(factory: F, strategy: ReplyStrategy, config: &EndpointConfig) -> Arc<Self> {
        // The property only carries the key when correlating on correlation ids.
        let correlation_property = match config.correlation_strategy() {
            CorrelationStrategy::CorrelationId => config.correlation_property.clone(),
            CorrelationStrategy::MessageId => None,
        };

        Arc::new(Self {
            factory,
            strategy,
            correlator: Correlator::new(config.request_timeout_checker_interval),
            correlation_property,
            concurrent_consumers: config.reply_to_concurrent_consumers.max(1),
            recovery_interval: config.recovery_interval,
            reply_to: RwLock::new(None),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        })
    }

    /// Binds the reply destination, then starts the listeners and the purge
    /// sweep.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] on a second call, or the provider
    /// error if the destination cannot be bound.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.task_tracker.is_closed() {
            return Err(Error::AlreadyStarted);
        }

        let binding = self.bind().await?;
        *self.reply_to.write() = Some(binding.destination().clone());
        self.correlator.start()?;

        let manager = Arc::clone(self);
        self.task_tracker.spawn(async move { manager.run(binding).await });
        self.task_tracker.close();

        info!(strategy = %self.strategy, reply_to = ?self.reply_to.read(), "reply manager started");
        Ok(())
    }

    /// Stops the listeners, releases the reply destination and fails every
    /// waiting request with [`Error::Stopped`].
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.correlator.shutdown().await;
        *self.reply_to.write() = None;

        debug!(strategy = %self.strategy, "reply manager stopped");
    }

    /// The destination to stamp as `JMSReplyTo` on requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] before [`ReplyManager::start`] or after
    /// shutdown.
    pub fn reply_to(&self) -> Result<Destination> {
        self.reply_to.read().clone().ok_or(Error::NotStarted)
    }

    /// The correlator requests register with.
    #[must_use]
    pub const fn correlator(&self) -> &Arc<Correlator<Message>> {
        &self.correlator
    }

    /// The reply destination strategy.
    #[must_use]
    pub const fn strategy(&self) -> &ReplyStrategy {
        &self.strategy
    }

    async fn bind(&self) -> Result<ReplyBinding<F::Connection>> {
        let selector: Option<Arc<dyn Selector>> = match self.strategy {
            ReplyStrategy::Shared { .. } => Some(Arc::new(PendingKeysSelector::new(
                Arc::clone(&self.correlator),
                self.correlation_property.clone(),
            ))),
            ReplyStrategy::Temporary { .. } | ReplyStrategy::Exclusive { .. } => None,
        };

        ReplyBinding::open(
            &self.factory,
            &self.strategy,
            self.concurrent_consumers,
            selector,
        )
        .await
    }
}
