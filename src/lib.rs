//! AMQP connection/session/link lifecycle and CBS authorization for
//! Event Hubs–style messaging clients.
//!
//! A [`scope::ConnectionScope`] owns one AMQP 1.0 connection and multiplexes
//! `management`, `producer`, and `consumer` links over it, driving
//! Claims-Based Security token authorization and periodic refresh for every
//! authorized link. It is built on top of `fe2o3-amqp` and its companion
//! crates rather than reimplementing the AMQP wire protocol.

pub mod cancellation;
pub mod cbs;
pub mod connection;
pub mod credential;
pub mod deadline;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod position;
pub mod properties;
pub mod refresh;
pub mod registry;
pub mod scope;

pub use credential::{AccessToken, TokenCredential};
pub use endpoint::{ProxySettings, ServiceEndpoint, TransportType};
pub use error::{ScopeError, Result};
pub use link::{ConsumerLink, ConsumerOptions, ManagementLink, ProducerLink};
pub use position::EventPosition;
pub use scope::ConnectionScope;
