//! Error types for the device transport.
//!
//! One crate-wide taxonomy: inbound parse failures, credential problems,
//! session state violations, wrapped MQTT client failures, and twin
//! request outcomes.

use thiserror::Error;

/// Errors surfaced by the transport and its credentials.
#[derive(Debug, Error)]
pub enum TransportError {
    /// An inbound topic did not match its grammar. Logged and dropped by
    /// the subscription handlers; surfaced directly by the codec.
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    #[error("malformed connection string")]
    MalformedConnectionString,

    /// SAS minting refused: hostname is blank.
    #[error("hostname is blank")]
    MissingHostname,

    /// SAS minting refused: shared access key is blank.
    #[error("shared access key is blank")]
    MissingKey,

    /// The shared access key is not valid base64.
    #[error("invalid shared access key")]
    InvalidKey(#[source] base64::DecodeError),

    #[error("already connected")]
    AlreadyConnected,

    #[error("not connected")]
    NotConnected,

    #[error("connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("publish failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("subscribe failed")]
    SubscribeFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("TLS configuration error")]
    Tls(#[source] rustls::Error),

    /// Certificate or key material could not be read.
    #[error("failed to load identity material")]
    Io(#[source] std::io::Error),

    /// A twin request completed with a non-2xx status code.
    #[error("request failed with {code} response code")]
    RequestFailed { code: u16 },

    /// The 30 second twin response deadline elapsed.
    #[error("request timed out")]
    Timeout,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl TransportError {
    /// Whether this error came out of the MQTT client's network machinery.
    ///
    /// The device client uses this to decide on reconnection. rumqttc wraps
    /// transport failures in dedicated variants rather than message text,
    /// so the predicate is structural.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed(_)
                | TransportError::PublishFailed(_)
                | TransportError::SubscribeFailed(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TransportError>;
