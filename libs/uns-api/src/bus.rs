use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::UnsError;
use crate::record::{Message, TransportMessage};

// ════════════════════════════════════════════════════════════════
//  Transport: the provided pub/sub capability
// ════════════════════════════════════════════════════════════════

/// Client identity and broker location for one transport connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub client_id: String,
    pub host: Option<String>,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: Option<TlsSettings>,
}

/// PEM files for a TLS connection. The client certificate and key are
/// optional but go together.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct TlsSettings {
    pub ca_file: String,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

/// Low-level pub/sub connection. The wire protocol lives behind this trait;
/// the bus only needs connect/subscribe/publish/receive.
pub trait Transport: Send + Sync {
    /// Open a session. Fails with `ErrorKind::Connection` when unreachable.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;

    /// Close the session cleanly.
    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;

    fn is_connected(&self) -> bool;

    /// Add filters to the session.
    fn subscribe(
        &self,
        filters: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;

    /// Remove filters from the session.
    fn unsubscribe(
        &self,
        filters: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;

    /// Next delivery in transport order. `None` = session dropped.
    fn recv(&self) -> Pin<Box<dyn Future<Output = Option<TransportMessage>> + Send + '_>>;
}

/// Creates transports for configured messaging clients.
pub trait TransportFactory: Send + Sync {
    fn create(&self, settings: &TransportSettings) -> Result<Arc<dyn Transport>, UnsError>;
}

// ════════════════════════════════════════════════════════════════
//  MessageBus: what workers see
// ════════════════════════════════════════════════════════════════

/// Callback invoked for every delivered message.
///
/// Handlers run on the delivery path, in transport order. An error (or a
/// panic) is logged by the bus and never reaches other handlers.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> Result<(), UnsError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Result<(), UnsError> + Send + Sync,
{
    fn handle(&self, message: &Message) -> Result<(), UnsError> {
        self(message)
    }
}

/// Pub/sub client with reconnect resilience.
pub trait MessageBus: Send + Sync {
    /// Name of the messaging client this bus was built from.
    fn name(&self) -> &str;

    /// Connect, retrying until success or cancellation.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;

    /// Replace the active filter set.
    fn subscribe(
        &self,
        filters: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;

    /// JSON-encode `payload` and publish it under `topic`.
    fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        retain: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;

    /// Register a handler for every delivered message.
    fn on_message(&self, handler: Arc<dyn MessageHandler>);

    /// Stop receiving and close the connection cleanly.
    fn disconnect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;
}
