//! Connector construction.

use std::collections::HashMap;
use std::sync::Arc;

use super::connector::BrokerConnector;
use super::types::{BrokerConfig, BrokerKind};
use crate::error::ExecutionError;

/// Builds connectors from configuration.
///
/// Called with the router's cache lock held, so implementations must not
/// block or perform I/O.
pub trait ConnectorFactory: Send + Sync {
    /// Build a connector for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be turned into a connector.
    fn create(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnector>, ExecutionError>;
}

impl<F> ConnectorFactory for F
where
    F: Fn(&BrokerConfig) -> Result<Arc<dyn BrokerConnector>, ExecutionError> + Send + Sync,
{
    fn create(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnector>, ExecutionError> {
        self(config)
    }
}

type Constructor =
    Box<dyn Fn(&BrokerConfig) -> Result<Arc<dyn BrokerConnector>, ExecutionError> + Send + Sync>;

/// Factory dispatching on [`BrokerKind`].
#[derive(Default)]
pub struct RegistryConnectorFactory {
    constructors: HashMap<BrokerKind, Constructor>,
}

impl std::fmt::Debug for RegistryConnectorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.constructors.keys().map(ToString::to_string).collect();
        kinds.sort();
        f.debug_struct("RegistryConnectorFactory")
            .field("kinds", &kinds)
            .finish()
    }
}

impl RegistryConnectorFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `kind`, replacing any previous one.
    #[must_use]
    pub fn register<F>(mut self, kind: BrokerKind, constructor: F) -> Self
    where
        F: Fn(&BrokerConfig) -> Result<Arc<dyn BrokerConnector>, ExecutionError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(kind, Box::new(constructor));
        self
    }

    /// Returns true if `kind` has a constructor.
    #[must_use]
    pub fn supports(&self, kind: BrokerKind) -> bool {
        self.constructors.contains_key(&kind)
    }
}

impl ConnectorFactory for RegistryConnectorFactory {
    fn create(&self, config: &BrokerConfig) -> Result<Arc<dyn BrokerConnector>, ExecutionError> {
        let constructor = self.constructors.get(&config.kind).ok_or_else(|| {
            ExecutionError::invalid_parameter(
                format!("unsupported broker type: {}", config.kind),
                "ConnectorFactory",
            )
        })?;
        constructor(config)
    }
}
