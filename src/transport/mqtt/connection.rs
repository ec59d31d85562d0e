//! Session state and MQTT option plumbing.
//!
//! Pure pieces of the session lifecycle: connection state, reconnect
//! backoff, broker option construction from credentials, and the
//! cancellable waits the facade builds on.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{MqttOptions, TlsConfiguration, Transport as MqttTransportLayer};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::credentials::Credentials;
use crate::error::{Result, TransportError};

/// Hub REST/MQTT dialect version sent in the username.
pub const API_VERSION: &str = "2018-06-30";

pub(crate) const MQTT_PORT: u16 = 8883;
pub(crate) const KEEP_ALIVE: Duration = Duration::from_secs(60);
/// Validity of the SAS token minted for the MQTT password.
pub(crate) const SAS_TTL: Duration = Duration::from_secs(3600);
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
/// Grace granted to the event loop task on close.
pub(crate) const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Observable connection state of one session.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state, CONNECT sent, no ConnAck yet.
    Connecting,
    Connected,
    /// Link lost with reason; the event loop keeps retrying.
    Disconnected(String),
}

/// Reconnect backoff: a fixed pattern, then a sustained delay.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub backoff_pattern: Vec<u64>,
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Backoff delay in milliseconds for the given 1-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        *self
            .backoff_pattern
            .get(index)
            .unwrap_or(&self.sustained_delay)
    }
}

/// Builds the broker options for one device session.
///
/// Broker = `tls://<hostname>:8883`, client id = device id, username
/// `<hostname>/<deviceId>/api-version=<version>`. The password is a SAS
/// token with one-hour validity for SAS auth and empty for X.509, where
/// the TLS client certificate authenticates instead.
pub(crate) fn configure_mqtt_options(creds: &Credentials) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(creds.device_id(), creds.hostname(), MQTT_PORT);
    options.set_keep_alive(KEEP_ALIVE);

    let username = format!(
        "{}/{}/api-version={}",
        creds.hostname(),
        creds.device_id(),
        API_VERSION
    );
    let password = if creds.is_sas() {
        creds.sas(SAS_TTL)?
    } else {
        String::new()
    };
    options.set_credentials(username, password);

    let tls = creds.tls_config()?;
    options.set_transport(MqttTransportLayer::Tls(TlsConfiguration::Rustls(Arc::new(
        tls,
    ))));
    Ok(options)
}

/// Awaits the Connected transition on the session state channel.
///
/// Resolves with the disconnect reason if the link drops first, a
/// connection error on deadline, or `Cancelled`.
pub(crate) async fn wait_for_connack(
    mut state_rx: watch::Receiver<ConnectionState>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let wait = async {
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected(reason) => {
                    return Err(TransportError::ConnectionFailed(reason.into()));
                }
                ConnectionState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(TransportError::ConnectionFailed(
                    "connection state channel closed".to_string().into(),
                ));
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        outcome = tokio::time::timeout(timeout, wait) => match outcome {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectionFailed(
                "no connection acknowledgment received".to_string().into(),
            )),
        },
    }
}

/// Races `fut` against the caller's cancellation token.
pub(crate) async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_pattern_then_sustained() {
        let config = ReconnectConfig::default();
        assert_eq!(config.delay_for_attempt(1), 25);
        assert_eq!(config.delay_for_attempt(2), 50);
        assert_eq!(config.delay_for_attempt(3), 100);
        assert_eq!(config.delay_for_attempt(4), 250);
        assert_eq!(config.delay_for_attempt(5), 250);
        assert_eq!(config.delay_for_attempt(100), 250);
    }

    #[test]
    fn configure_options_for_sas_credentials() {
        let creds = Credentials::from_connection_string(
            "HostName=h.example;DeviceId=d1;SharedAccessKey=dGVzdA==",
        )
        .unwrap();
        assert!(configure_mqtt_options(&creds).is_ok());
    }

    #[test]
    fn configure_options_requires_mintable_sas() {
        let creds =
            Credentials::from_connection_string("HostName=h;DeviceId=d;SharedAccessKeyName=p")
                .unwrap();
        assert!(matches!(
            configure_mqtt_options(&creds),
            Err(TransportError::MissingKey)
        ));
    }

    #[tokio::test]
    async fn wait_for_connack_success() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        let cancel = CancellationToken::new();
        let result = wait_for_connack(state_rx, Duration::from_millis(200), &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn wait_for_connack_reports_disconnect_reason() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("bad credentials".into()));
        });

        let cancel = CancellationToken::new();
        let err = wait_for_connack(state_rx, Duration::from_millis(200), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_network_error());
    }

    #[tokio::test]
    async fn wait_for_connack_times_out() {
        // keep the sender alive so the channel never closes
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let _keep = state_tx;

        let cancel = CancellationToken::new();
        let err = wait_for_connack(state_rx, Duration::from_millis(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn wait_for_connack_honors_cancellation() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let _keep = state_tx;

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            wait_for_connack(state_rx, Duration::from_secs(5), &cancel).await,
            Err(TransportError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn cancellable_passes_through_completion() {
        let cancel = CancellationToken::new();
        let result = cancellable(&cancel, async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(TransportError::Cancelled)));
    }
}
