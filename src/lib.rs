//! Device-side Azure IoT Hub transport over MQTT 3.1.1 with TLS.
//!
//! This crate implements the hub's MQTT dialect from a device's
//! perspective: it multiplexes telemetry publishes, cloud-to-device
//! deliveries, direct-method request/response and twin property sync over
//! a single TLS session, speaks the hub's URL-escaped topic grammars, and
//! mints the SAS tokens used as the MQTT password.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use iothub_device::{Credentials, Message, MqttTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> iothub_device::Result<()> {
//! let creds = Credentials::from_connection_string(
//!     "HostName=hub.azure-devices.net;DeviceId=d1;SharedAccessKey=c2VjcmV0",
//! )?;
//!
//! let transport = MqttTransport::new();
//! let cancel = CancellationToken::new();
//! transport.connect(&creds, &cancel).await?;
//!
//! // telemetry
//! let mut msg = Message::new(r#"{"temperature":21.5}"#);
//! msg.properties.insert("unit".into(), "celsius".into());
//! transport.send(&msg, &cancel).await?;
//!
//! // twin sync
//! let twin = transport.retrieve_twin_properties(&cancel).await?;
//! println!("twin: {}", String::from_utf8_lossy(&twin));
//!
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Direct methods and cloud-to-device messages are delivered through the
//! dispatcher traits in [`transport`]; see
//! [`MqttTransport::register_direct_methods`] and
//! [`MqttTransport::subscribe_events`].

pub mod credentials;
pub mod error;
pub mod message;
pub mod transport;

pub use credentials::Credentials;
pub use error::{Result, TransportError};
pub use message::{Message, Qos, TransportOptions};
pub use transport::{
    MessageDispatcher, MethodDispatcher, MqttTransport, Transport, TwinStateDispatcher,
};
