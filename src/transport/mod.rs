//! Transport abstraction between the device client and the hub.
//!
//! The device client owns a [`Transport`] and multiplexes its user-facing
//! APIs over it; the MQTT implementation lives in [`mqtt`]. The trait seam
//! exists for dependency injection and testing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::message::Message;
use crate::Credentials;

pub mod mqtt;

/// Upstream sink for decoded cloud-to-device messages. Infallible.
pub trait MessageDispatcher: Send + Sync {
    fn dispatch(&self, msg: Message);
}

impl<F> MessageDispatcher for F
where
    F: Fn(Message) + Send + Sync,
{
    fn dispatch(&self, msg: Message) {
        self(msg)
    }
}

/// Upstream sink for desired-property patches. Receives the raw payload.
pub trait TwinStateDispatcher: Send + Sync {
    fn dispatch(&self, payload: &[u8]);
}

impl<F> TwinStateDispatcher for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn dispatch(&self, payload: &[u8]) {
        self(payload)
    }
}

/// Upstream handler for direct method calls.
///
/// Returns the status code and response body to publish back to the hub.
/// An error suppresses the response; the hub's per-call timeout surfaces
/// the failure to the caller.
pub trait MethodDispatcher: Send + Sync {
    fn dispatch(&self, method: &str, payload: &[u8]) -> Result<(u16, Vec<u8>)>;
}

impl<F> MethodDispatcher for F
where
    F: Fn(&str, &[u8]) -> Result<(u16, Vec<u8>)> + Send + Sync,
{
    fn dispatch(&self, method: &str, payload: &[u8]) -> Result<(u16, Vec<u8>)> {
        self(method, payload)
    }
}

/// The device client's contract with its transport.
///
/// Implementations are shared across caller threads; every operation may
/// suspend on the network and honors its cancellation token at each
/// suspension point.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establish the session. Fails with `AlreadyConnected` when called
    /// twice or after `close`.
    async fn connect(&self, creds: &Credentials, cancel: &CancellationToken) -> Result<()>;

    /// Install the cloud-to-device message handler.
    async fn subscribe_events(
        &self,
        dispatcher: Arc<dyn MessageDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Install the desired-property patch handler.
    async fn subscribe_twin_updates(
        &self,
        dispatcher: Arc<dyn TwinStateDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Install the direct-method handler; replies are published
    /// automatically.
    async fn register_direct_methods(
        &self,
        dispatcher: Arc<dyn MethodDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// One twin GET; returns the full twin document payload.
    async fn retrieve_twin_properties(&self, cancel: &CancellationToken) -> Result<Vec<u8>>;

    /// One twin reported-properties PATCH; returns the new version.
    async fn update_twin_properties(
        &self,
        patch: &[u8],
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Publish one telemetry message at the QoS from its transport
    /// options, defaulting to at-least-once.
    async fn send(&self, msg: &Message, cancel: &CancellationToken) -> Result<()>;

    /// Tear down the session. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Whether the underlying session is currently connected.
    fn is_connected(&self) -> bool;
}

pub use mqtt::MqttTransport;
