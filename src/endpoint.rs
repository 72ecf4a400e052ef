//! Transport selection and the settings each transport needs to hand off to
//! `fe2o3-amqp`'s connection builder.
//!
//! Grounded in `fe2o3_amqp::connection::Builder` (TCP/TLS path) and
//! `fe2o3_amqp_ws` (WebSocket path), following the same
//! "negotiate-then-open" shape the teacher's `examples/service_bus` binaries
//! use directly.

use url::Url;

use crate::error::{Result, ScopeError};

/// Default AMQPS port used when the endpoint URL doesn't specify one.
pub const DEFAULT_AMQPS_PORT: u16 = 5671;

/// The two transports the scope is allowed to negotiate. Anything else is a
/// construction-time [`ScopeError::Argument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Raw TCP with a TLS layer on top (the default for Event Hubs/Service
    /// Bus style endpoints).
    TcpTls,
    /// AMQP over a `wss://` WebSocket, for environments that only allow
    /// outbound HTTPS.
    WebSockets,
}

impl TransportType {
    /// Validates an externally-supplied transport selector.
    ///
    /// `spec.md` §4.7 and §8: any value outside `{TCP-TLS, WebSockets}` is a
    /// construction-time argument failure, checked eagerly so it can never
    /// reach the opener.
    pub fn validate(self) -> Result<Self> {
        match self {
            TransportType::TcpTls | TransportType::WebSockets => Ok(self),
        }
    }
}

/// Optional HTTP(S) proxy, only meaningful for [`TransportType::WebSockets`].
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub url: Url,
}

/// The `(endpoint, entity)` the scope is bound to for its whole lifetime.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub url: Url,
    pub entity: String,
}

impl ServiceEndpoint {
    pub fn new(url: Url, entity: impl Into<String>) -> Result<Self> {
        let entity = entity.into();
        if entity.trim().is_empty() {
            return Err(ScopeError::argument("entity name must not be empty"));
        }
        Ok(ServiceEndpoint { url, entity })
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Port to dial for [`TransportType::TcpTls`], defaulting to 5671 when
    /// the URL carries none or a non-positive placeholder.
    pub fn tcp_port(&self) -> u16 {
        self.url.port().unwrap_or(DEFAULT_AMQPS_PORT)
    }

    /// `wss://{host}/$servicebus/websocket/` per spec.md §6 wire surfaces.
    pub fn websocket_url(&self) -> Result<Url> {
        let mut url = self.url.clone();
        url.set_scheme("wss")
            .map_err(|_| ScopeError::argument("endpoint URL scheme cannot be changed to wss"))?;
        url.set_path("/$servicebus/websocket/");
        url.set_port(None)
            .map_err(|_| ScopeError::argument("failed to clear port for websocket endpoint"))?;
        Ok(url)
    }

    /// AMQP management address used by `management`-role links.
    pub fn management_address(&self) -> &'static str {
        "$management"
    }

    pub fn producer_target(&self, partition_id: Option<&str>) -> String {
        match partition_id {
            Some(p) => format!("{}/Partitions/{}", self.entity, p),
            None => self.entity.clone(),
        }
    }

    pub fn consumer_source(&self, consumer_group: &str, partition_id: &str) -> String {
        format!(
            "{}/ConsumerGroups/{}/Partitions/{}",
            self.entity, consumer_group, partition_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ServiceEndpoint {
        ServiceEndpoint::new(Url::parse("sb://ns.example.net/").unwrap(), "eh").unwrap()
    }

    #[test]
    fn rejects_empty_entity() {
        let err = ServiceEndpoint::new(Url::parse("sb://ns.example.net/").unwrap(), "   ");
        assert!(matches!(err, Err(ScopeError::Argument(_))));
    }

    #[test]
    fn tcp_port_defaults_to_5671() {
        assert_eq!(endpoint().tcp_port(), DEFAULT_AMQPS_PORT);
    }

    #[test]
    fn websocket_url_matches_spec_path() {
        let ws = endpoint().websocket_url().unwrap();
        assert_eq!(ws.scheme(), "wss");
        assert_eq!(ws.path(), "/$servicebus/websocket/");
        assert_eq!(ws.port(), None);
    }

    #[test]
    fn producer_target_with_and_without_partition() {
        let e = endpoint();
        assert_eq!(e.producer_target(None), "eh");
        assert_eq!(e.producer_target(Some("0")), "eh/Partitions/0");
    }

    #[test]
    fn consumer_source_matches_spec_pattern() {
        let e = endpoint();
        assert_eq!(
            e.consumer_source("$Default", "0"),
            "eh/ConsumerGroups/$Default/Partitions/0"
        );
    }

    #[test]
    fn transport_validate_accepts_both_variants() {
        assert!(TransportType::TcpTls.validate().is_ok());
        assert!(TransportType::WebSockets.validate().is_ok());
    }
}
