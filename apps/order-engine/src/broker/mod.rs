//! Broker routing and venue connectors.
//!
//! Each brokerage venue is reached through a [`BrokerConnector`]. The
//! [`BrokerRouter`] owns one lazily built connector per client ID, tracks
//! which client each logged-in user trades on, and wraps every call in the
//! client's circuit breaker and the shared error classifier.
//!
//! ```text
//! user_id ──► sessions ──► client_id ──► connector (cached)
//!                                  │
//!                                  └──► CircuitBreaker(client_id) ──► ErrorClassifier
//! ```
//!
//! Venues that trade on behalf of other clients expose
//! [`DealerOperations`] through [`BrokerConnector::dealer`]. Dealer placement
//! falls back to a regular placement when the capability is missing.

mod connector;
mod factory;
mod router;
mod simulated;
mod types;

pub use connector::{BrokerConnector, DealerOperations};
pub use factory::{ConnectorFactory, RegistryConnectorFactory};
pub use router::{BrokerRouter, RouteFailure};
pub use simulated::SimulatedConnector;
pub use types::{
    BrokerConfig, BrokerKind, BrokerOrder, BrokerPosition, Credentials, Holding, ModifyOrder,
    OrderResponse, Quote, Session,
};
