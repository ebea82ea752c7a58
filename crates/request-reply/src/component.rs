use crate::config::{
    CorrelationStrategy, EndpointConfig, ReplyStrategy, TemporaryAffinity, parse_uri,
};
use crate::endpoint::JmsEndpoint;
use crate::error::Result;
use crate::reply::ReplyManager;

use std::collections::HashMap;
use std::sync::Arc;

use courier_messaging::{ConnectionFactory, Destination};
use tokio::sync::Mutex;
use tracing::debug;

/// Replies are matched on the correlation strategy and property, so producers
/// only share a temporary queue when both agree.
type TemporaryKey = (CorrelationStrategy, Option<String>);

#[derive(Debug)]
struct ComponentInner<F>
where
    F: ConnectionFactory,
{
    factory: F,
    defaults: EndpointConfig,
    temporary_reply_managers: Mutex<HashMap<TemporaryKey, Arc<ReplyManager<F>>>>,
}

/// Creates endpoints on one provider and owns the state they share, such as
/// the component-wide temporary reply queues.
#[derive(Clone, Debug)]
pub struct JmsComponent<F>
where
    F: ConnectionFactory,
{
    inner: Arc<ComponentInner<F>>,
}

impl<F> JmsComponent<F>
where
    F: ConnectionFactory,
{
    /// Creates a component with default endpoint options.
    pub fn new(factory: F) -> Self {
        Self::with_defaults(factory, EndpointConfig::default())
    }

    /// Creates a component whose endpoints start from `defaults`.
    pub fn with_defaults(factory: F, defaults: EndpointConfig) -> Self {
        Self {
            inner: Arc::new(ComponentInner {
                factory,
                defaults,
                temporary_reply_managers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a component whose endpoint defaults are read from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`](crate::Error::Serialization) if the
    /// JSON does not describe endpoint options.
    pub fn from_json(factory: F, defaults: &str) -> Result<Self> {
        Ok(Self::with_defaults(factory, serde_json::from_str(defaults)?))
    }

    /// The provider connection factory.
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Options every endpoint starts from.
    pub fn defaults(&self) -> &EndpointConfig {
        &self.inner.defaults
    }

    /// Creates an endpoint from a `jms:` URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUri`](crate::Error::InvalidUri) if the URI
    /// cannot be parsed.
    pub fn endpoint(&self, uri: &str) -> Result<JmsEndpoint<F>> {
        let (destination, config) = parse_uri(uri, &self.inner.defaults)?;
        Ok(JmsEndpoint::new(self.clone(), destination, config))
    }

    /// Creates an endpoint from explicit options.
    pub fn endpoint_with(&self, destination: Destination, config: EndpointConfig) -> JmsEndpoint<F> {
        JmsEndpoint::new(self.clone(), destination, config)
    }

    /// Returns the temporary reply manager shared by producers with component
    /// affinity and the same correlation settings as `config`, starting it on
    /// first use.
    pub(crate) async fn temporary_reply_manager(
        &self,
        config: &EndpointConfig,
    ) -> Result<Arc<ReplyManager<F>>> {
        let strategy = config.correlation_strategy();
        let key = match strategy {
            CorrelationStrategy::CorrelationId => (strategy, config.correlation_property.clone()),
            CorrelationStrategy::MessageId => (strategy, None),
        };

        let mut managers = self.inner.temporary_reply_managers.lock().await;
        if let Some(manager) = managers.get(&key) {
            return Ok(Arc::clone(manager));
        }

        let manager = ReplyManager::new(
            self.inner.factory.clone(),
            ReplyStrategy::Temporary {
                affinity: TemporaryAffinity::Component,
            },
            config,
        );
        manager.start().await?;

        debug!(correlation_strategy = ?key.0, correlation_property = ?key.1, "started component temporary reply manager");
        managers.insert(key, Arc::clone(&manager));

        Ok(manager)
    }

    /// Stops state shared by the component's producers.
    pub async fn shutdown(&self) {
        let managers: Vec<_> = self
            .inner
            .temporary_reply_managers
            .lock()
            .await
            .drain()
            .map(|(_, manager)| manager)
            .collect();
        for manager in managers {
            manager.shutdown().await;
        }
    }
}
