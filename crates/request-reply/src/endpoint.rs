use crate::binding::JmsBinding;
use crate::component::JmsComponent;
use crate::config::EndpointConfig;
use crate::consumer::{JmsConsumer, RequestHandler};
use crate::error::Result;
use crate::producer::JmsProducer;

use std::sync::Arc;

use courier_messaging::{ConnectionFactory, Destination};

/// A destination plus the options producers and consumers on it use.
#[derive(Clone, Debug)]
pub struct JmsEndpoint<F>
where
    F: ConnectionFactory,
{
    component: JmsComponent<F>,
    destination: Destination,
    config: Arc<EndpointConfig>,
    binding: JmsBinding,
}

impl<F> JmsEndpoint<F>
where
    F: ConnectionFactory,
{
    pub(crate) fn new(
        component: JmsComponent<F>,
        destination: Destination,
        config: EndpointConfig,
    ) -> Self {
        Self {
            component,
            destination,
            config: Arc::new(config),
            binding: JmsBinding::default(),
        }
    }

    /// Replaces the header binding.
    #[must_use]
    pub fn with_binding(mut self, binding: JmsBinding) -> Self {
        self.binding = binding;
        self
    }

    /// The destination requests are sent to and consumed from.
    #[must_use]
    pub const fn destination(&self) -> &Destination {
        &self.destination
    }

    /// The endpoint options.
    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// The header binding.
    #[must_use]
    pub const fn binding(&self) -> &JmsBinding {
        &self.binding
    }

    /// The component that created this endpoint.
    #[must_use]
    pub const fn component(&self) -> &JmsComponent<F> {
        &self.component
    }

    /// The provider connection factory.
    #[must_use]
    pub fn factory(&self) -> &F {
        self.component.factory()
    }

    /// Creates a producer, resolving the reply strategy first so a bad reply
    /// configuration fails before anything is sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReplyToConfiguration`](crate::Error::InvalidReplyToConfiguration)
    /// or [`Error::InvalidConfiguration`](crate::Error::InvalidConfiguration).
    pub fn create_producer(&self) -> Result<JmsProducer<F>> {
        self.config.validate()?;
        let strategy = self.config.reply_strategy()?;

        Ok(JmsProducer::new(self.clone(), strategy))
    }

    /// Creates a listener container that hands each request to `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`](crate::Error::InvalidConfiguration).
    pub fn create_consumer<H>(&self, handler: H) -> Result<JmsConsumer<F, H>>
    where
        H: RequestHandler,
    {
        self.config.validate()?;

        Ok(JmsConsumer::new(self.clone(), handler))
    }
}
