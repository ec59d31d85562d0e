//! MQTT 3.1.1 implementation of the device transport.
//!
//! The module is split by concern:
//!
//! - [`topics`] - pure topic grammar encode/decode for the four hub
//!   families
//! - [`connection`] - session state, broker options, cancellable waits
//! - `dispatcher` - inbound classification and handler routing
//! - `registry` - twin request/response correlation by `$rid`
//! - `client` - the [`MqttTransport`] facade tying them together
//!
//! # Usage
//!
//! ```rust,no_run
//! use iothub_device::{Credentials, Message};
//! use iothub_device::transport::mqtt::MqttTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> iothub_device::Result<()> {
//! let creds = Credentials::from_connection_string(
//!     "HostName=hub.azure-devices.net;DeviceId=d1;SharedAccessKey=c2VjcmV0",
//! )?;
//! let transport = MqttTransport::new();
//! let cancel = CancellationToken::new();
//!
//! transport.connect(&creds, &cancel).await?;
//! transport.send(&Message::new("hello"), &cancel).await?;
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
mod dispatcher;
mod registry;
pub mod topics;

mod client;

pub use client::MqttTransport;
pub use connection::{ConnectionState, ReconnectConfig, API_VERSION};
