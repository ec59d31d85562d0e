//! The MQTT device transport.
//!
//! One `MqttTransport` owns one MQTT session to the hub and multiplexes
//! four conversations over it: telemetry publishes, cloud-to-device
//! deliveries, direct methods and twin request/response. A supervised
//! event-loop task polls the connection, observes reconnects, replays
//! subscriptions and feeds inbound messages to the dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{
    cancellable, configure_mqtt_options, wait_for_connack, ConnectionState, ReconnectConfig,
    CONNECT_TIMEOUT, DISCONNECT_GRACE,
};
use super::dispatcher::{dispatch_publish, DispatchContext, Routes};
use super::registry::{self, RequestRegistry, TwinResponse};
use super::topics;
use crate::credentials::Credentials;
use crate::error::{Result, TransportError};
use crate::message::{Message, Qos};
use crate::transport::{MessageDispatcher, MethodDispatcher, Transport, TwinStateDispatcher};

/// One connected session. Dropping it stops the event loop task.
struct Session {
    client: AsyncClient,
    device_id: String,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Device-side hub transport over MQTT 3.1.1 with TLS.
///
/// Shared freely across caller threads: `connect` and `close` are
/// exclusive against all other operations, publishes and subscribes
/// proceed concurrently with one another.
pub struct MqttTransport {
    session: RwLock<Option<Session>>,
    /// One-shot close latch; a closed transport never reconnects.
    closed: AtomicBool,
    routes: Arc<Routes>,
    registry: Arc<RequestRegistry>,
    /// Filters installed so far, replayed after every reconnect.
    subscriptions: Arc<Mutex<Vec<String>>>,
    reconnect: ReconnectConfig,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MqttTransport {
    pub fn new() -> Self {
        MqttTransport {
            session: RwLock::new(None),
            closed: AtomicBool::new(false),
            routes: Arc::new(Routes::default()),
            registry: Arc::new(RequestRegistry::new()),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Establishes the MQTT session and waits for the ConnAck.
    ///
    /// Fails with `AlreadyConnected` on a second call; a session that has
    /// been closed is terminal and cannot be reconnected.
    pub async fn connect(&self, creds: &Credentials, cancel: &CancellationToken) -> Result<()> {
        let mut guard = self.session.write().await;
        if self.closed.load(Ordering::SeqCst) || guard.is_some() {
            return Err(TransportError::AlreadyConnected);
        }

        let options = configure_mqtt_options(creds)?;
        let (client, event_loop) = AsyncClient::new(options, 10);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx = DispatchContext {
            client: client.clone(),
            event_prefix: topics::devicebound_prefix(creds.device_id()),
            routes: self.routes.clone(),
            registry: self.registry.clone(),
        };
        let handle = tokio::spawn(run_event_loop(
            event_loop,
            ctx,
            self.subscriptions.clone(),
            state_tx,
            shutdown_rx,
            self.reconnect.clone(),
        ));

        // Only stored on success; dropping it tears the task down.
        let session = Session {
            client,
            device_id: creds.device_id().to_string(),
            state_rx: state_rx.clone(),
            shutdown_tx,
            handle: Some(handle),
        };

        wait_for_connack(state_rx, CONNECT_TIMEOUT, cancel).await?;

        info!(device_id = %session.device_id, "connection established");
        *guard = Some(session);
        Ok(())
    }

    /// Installs the cloud-to-device handler and subscribes to
    /// `devices/{deviceId}/messages/devicebound/#`.
    pub async fn subscribe_events(
        &self,
        dispatcher: Arc<dyn MessageDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let filter = {
            let guard = self.session.read().await;
            let session = guard.as_ref().ok_or(TransportError::NotConnected)?;
            topics::devicebound_filter(&session.device_id)
        };
        self.routes.set_event(dispatcher).await;
        self.subscribe(filter, cancel).await
    }

    /// Installs the desired-property handler and subscribes to the twin
    /// patch feed.
    pub async fn subscribe_twin_updates(
        &self,
        dispatcher: Arc<dyn TwinStateDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.routes.set_twin_state(dispatcher).await;
        self.subscribe(topics::TWIN_PATCH_DESIRED_FILTER.to_string(), cancel)
            .await
    }

    /// Installs the direct-method handler and subscribes to method
    /// requests. Replies are published automatically.
    pub async fn register_direct_methods(
        &self,
        dispatcher: Arc<dyn MethodDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.routes.set_method(dispatcher).await;
        self.subscribe(topics::METHOD_POST_FILTER.to_string(), cancel)
            .await
    }

    /// Performs one twin GET and returns the twin document payload.
    pub async fn retrieve_twin_properties(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let resp = self
            .twin_request(topics::twin_get_topic, Vec::new(), cancel)
            .await?;
        Ok(resp.body.to_vec())
    }

    /// Publishes one reported-properties PATCH and returns the twin
    /// version from the response.
    pub async fn update_twin_properties(
        &self,
        patch: &[u8],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let resp = self
            .twin_request(topics::twin_patch_topic, patch.to_vec(), cancel)
            .await?;
        Ok(resp.version.unwrap_or(0))
    }

    /// Publishes one telemetry message at the QoS from its transport
    /// options, defaulting to at-least-once.
    pub async fn send(&self, msg: &Message, cancel: &CancellationToken) -> Result<()> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(TransportError::NotConnected)?;

        let topic = topics::encode_event_topic(&session.device_id, msg);
        let qos = match msg.qos() {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        };
        cancellable(cancel, async {
            session
                .client
                .publish(topic, qos, false, msg.payload.clone())
                .await
                .map_err(|e| TransportError::PublishFailed(Box::new(e)))
        })
        .await
    }

    /// Tears down the session. Idempotent; disconnects at most once.
    ///
    /// In-flight twin requests are left to their own deadlines and
    /// cancellations.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut guard = self.session.write().await;
        if let Some(mut session) = guard.take() {
            let _ = session.shutdown_tx.send(true);
            if let Err(e) = session.client.disconnect().await {
                debug!(error = %e, "disconnect request failed");
            }
            if let Some(handle) = session.handle.take() {
                let abort = handle.abort_handle();
                if tokio::time::timeout(DISCONNECT_GRACE, handle).await.is_err() {
                    warn!("event loop did not stop within the grace period, aborting");
                    abort.abort();
                }
            }
            info!("disconnected");
        }
        Ok(())
    }

    /// Whether the session currently holds an acknowledged connection.
    pub fn is_connected(&self) -> bool {
        match self.session.try_read() {
            Ok(guard) => guard
                .as_ref()
                .map(|s| *s.state_rx.borrow() == ConnectionState::Connected)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Current connection state, `None` before connect and after close.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.session
            .try_read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.state_rx.borrow().clone()))
    }

    async fn publish(
        &self,
        topic: String,
        qos: QoS,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(TransportError::NotConnected)?;
        cancellable(cancel, async {
            session
                .client
                .publish(topic, qos, false, payload)
                .await
                .map_err(|e| TransportError::PublishFailed(Box::new(e)))
        })
        .await
    }

    async fn subscribe(&self, filter: String, cancel: &CancellationToken) -> Result<()> {
        {
            let guard = self.session.read().await;
            let session = guard.as_ref().ok_or(TransportError::NotConnected)?;
            cancellable(cancel, async {
                session
                    .client
                    .subscribe(filter.as_str(), QoS::AtLeastOnce)
                    .await
                    .map_err(|e| TransportError::SubscribeFailed(Box::new(e)))
            })
            .await?;
        }

        let mut subs = self.subscriptions.lock().await;
        if !subs.contains(&filter) {
            subs.push(filter);
        }
        Ok(())
    }

    /// One twin request/response exchange.
    ///
    /// The reply slot is registered before the request is published and
    /// removed on every exit path: reply, timeout, cancellation, error.
    async fn twin_request(
        &self,
        topic_for: fn(u32) -> String,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<TwinResponse> {
        self.registry
            .ensure_subscribed(
                self.subscribe(topics::TWIN_RESPONSE_FILTER.to_string(), cancel),
            )
            .await?;

        let (rid, mut rx) = self.registry.begin().await;
        let result = async {
            self.publish(topic_for(rid), QoS::AtLeastOnce, payload, cancel)
                .await?;
            registry::await_response(&mut rx, cancel).await
        }
        .await;
        self.registry.end(rid).await;
        result
    }
}

#[async_trait::async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, creds: &Credentials, cancel: &CancellationToken) -> Result<()> {
        MqttTransport::connect(self, creds, cancel).await
    }

    async fn subscribe_events(
        &self,
        dispatcher: Arc<dyn MessageDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        MqttTransport::subscribe_events(self, dispatcher, cancel).await
    }

    async fn subscribe_twin_updates(
        &self,
        dispatcher: Arc<dyn TwinStateDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        MqttTransport::subscribe_twin_updates(self, dispatcher, cancel).await
    }

    async fn register_direct_methods(
        &self,
        dispatcher: Arc<dyn MethodDispatcher>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        MqttTransport::register_direct_methods(self, dispatcher, cancel).await
    }

    async fn retrieve_twin_properties(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        MqttTransport::retrieve_twin_properties(self, cancel).await
    }

    async fn update_twin_properties(
        &self,
        patch: &[u8],
        cancel: &CancellationToken,
    ) -> Result<u64> {
        MqttTransport::update_twin_properties(self, patch, cancel).await
    }

    async fn send(&self, msg: &Message, cancel: &CancellationToken) -> Result<()> {
        MqttTransport::send(self, msg, cancel).await
    }

    async fn close(&self) -> Result<()> {
        MqttTransport::close(self).await
    }

    fn is_connected(&self) -> bool {
        MqttTransport::is_connected(self)
    }
}

/// Supervises one MQTT connection: polls the event loop, tracks the
/// connection state, replays subscriptions after reconnects and routes
/// inbound publishes.
async fn run_event_loop(
    mut event_loop: EventLoop,
    ctx: DispatchContext,
    subscriptions: Arc<Mutex<Vec<String>>>,
    state_tx: watch::Sender<ConnectionState>,
    mut shutdown_rx: watch::Receiver<bool>,
    reconnect: ReconnectConfig,
) {
    let mut reconnect_attempts = 0u32;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("shutdown signal received, stopping event loop");
                    break;
                }
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if reconnect_attempts > 0 {
                        info!(attempt = reconnect_attempts, "reconnection established");
                    }
                    reconnect_attempts = 0;
                    let _ = state_tx.send(ConnectionState::Connected);
                    resubscribe(&ctx.client, &subscriptions).await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    dispatch_publish(&ctx, &publish).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("disconnected by the hub");
                    let _ = state_tx.send(ConnectionState::Disconnected(
                        "server disconnect".to_string(),
                    ));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!(pkid = ack.pkid, "subscription acknowledged");
                }
                Ok(_) => {}
                Err(e) => {
                    let reason = e.to_string();
                    warn!(error = %reason, "connection lost");
                    let _ = state_tx.send(ConnectionState::Disconnected(reason));

                    reconnect_attempts = reconnect_attempts.saturating_add(1);
                    let delay = reconnect.delay_for_attempt(reconnect_attempts);
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    }
                }
            }
        }
    }
    debug!("event loop stopped");
}

/// Replays every installed filter after a reconnect; the session is
/// clean, so the broker forgets them on each drop.
async fn resubscribe(client: &AsyncClient, subscriptions: &Mutex<Vec<String>>) {
    let filters = subscriptions.lock().await.clone();
    for filter in filters {
        if let Err(e) = client.subscribe(filter.as_str(), QoS::AtLeastOnce).await {
            error!(filter = %filter, error = %e, "failed to re-subscribe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credentials() -> Credentials {
        Credentials::from_connection_string(
            "HostName=h.example;DeviceId=d1;SharedAccessKey=dGVzdA==",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn not_connected_before_connect() {
        let transport = MqttTransport::new();
        assert!(!transport.is_connected());
        assert!(transport.connection_state().is_none());
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let transport = MqttTransport::new();
        let cancel = CancellationToken::new();
        assert!(matches!(
            transport.send(&Message::new("hello"), &cancel).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn twin_operations_before_connect_fail() {
        let transport = MqttTransport::new();
        let cancel = CancellationToken::new();
        assert!(matches!(
            transport.retrieve_twin_properties(&cancel).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.update_twin_properties(b"{}", &cancel).await,
            Err(TransportError::NotConnected)
        ));
        // failed install must not latch the twin subscription
        assert_eq!(transport.registry.slot_count().await, 0);
    }

    #[tokio::test]
    async fn subscriptions_before_connect_fail() {
        let transport = MqttTransport::new();
        let cancel = CancellationToken::new();

        let events = transport
            .subscribe_events(Arc::new(|_msg: Message| {}), &cancel)
            .await;
        assert!(matches!(events, Err(TransportError::NotConnected)));

        let updates = transport
            .subscribe_twin_updates(Arc::new(|_payload: &[u8]| {}), &cancel)
            .await;
        assert!(matches!(updates, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = MqttTransport::new();
        assert!(transport.close().await.is_ok());
        assert!(transport.close().await.is_ok());
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn connect_after_close_is_rejected() {
        let transport = MqttTransport::new();
        transport.close().await.unwrap();

        let cancel = CancellationToken::new();
        assert!(matches!(
            transport.connect(&test_credentials(), &cancel).await,
            Err(TransportError::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let transport = MqttTransport::new();
        transport.close().await.unwrap();

        let cancel = CancellationToken::new();
        assert!(matches!(
            transport.send(&Message::new("hello"), &cancel).await,
            Err(TransportError::NotConnected)
        ));
    }
}
