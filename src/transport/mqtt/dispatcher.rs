//! Inbound message routing.
//!
//! The event loop hands every inbound publish to [`dispatch_publish`],
//! which classifies the topic into one of the four hub families and
//! routes it: decoded events, desired-property patches and direct-method
//! requests go to the upstream dispatchers installed in [`Routes`]; twin
//! responses fulfil pending entries in the request registry. A malformed
//! topic is logged and dropped, never torn down with the subscription.

use std::sync::Arc;

use rumqttc::{AsyncClient, Publish, QoS};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use super::registry::{RequestRegistry, TwinResponse};
use super::topics;
use crate::transport::{MessageDispatcher, MethodDispatcher, TwinStateDispatcher};

/// Upstream handlers, one slot per topic family. Installed by the facade
/// when the corresponding subscription is made.
#[derive(Default)]
pub(crate) struct Routes {
    event: RwLock<Option<Arc<dyn MessageDispatcher>>>,
    twin_state: RwLock<Option<Arc<dyn TwinStateDispatcher>>>,
    method: RwLock<Option<Arc<dyn MethodDispatcher>>>,
}

impl Routes {
    pub async fn set_event(&self, dispatcher: Arc<dyn MessageDispatcher>) {
        *self.event.write().await = Some(dispatcher);
    }

    pub async fn set_twin_state(&self, dispatcher: Arc<dyn TwinStateDispatcher>) {
        *self.twin_state.write().await = Some(dispatcher);
    }

    pub async fn set_method(&self, dispatcher: Arc<dyn MethodDispatcher>) {
        *self.method.write().await = Some(dispatcher);
    }

    async fn event(&self) -> Option<Arc<dyn MessageDispatcher>> {
        self.event.read().await.clone()
    }

    async fn twin_state(&self) -> Option<Arc<dyn TwinStateDispatcher>> {
        self.twin_state.read().await.clone()
    }

    async fn method(&self) -> Option<Arc<dyn MethodDispatcher>> {
        self.method.read().await.clone()
    }
}

/// Everything the routing path needs from the session.
pub(crate) struct DispatchContext {
    pub client: AsyncClient,
    pub event_prefix: String,
    pub routes: Arc<Routes>,
    pub registry: Arc<RequestRegistry>,
}

/// The topic family an inbound publish belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TopicFamily {
    TwinResponse,
    TwinDesiredPatch,
    MethodRequest,
    Event,
    Unknown,
}

pub(crate) fn classify(topic: &str, event_prefix: &str) -> TopicFamily {
    if topic.starts_with(topics::TWIN_RESPONSE_PREFIX) {
        TopicFamily::TwinResponse
    } else if topic.starts_with(topics::TWIN_PATCH_DESIRED_PREFIX) {
        TopicFamily::TwinDesiredPatch
    } else if topic.starts_with(topics::METHOD_POST_PREFIX) {
        TopicFamily::MethodRequest
    } else if topic.starts_with(event_prefix) {
        TopicFamily::Event
    } else {
        TopicFamily::Unknown
    }
}

pub(crate) async fn dispatch_publish(ctx: &DispatchContext, publish: &Publish) {
    match classify(&publish.topic, &ctx.event_prefix) {
        TopicFamily::TwinResponse => dispatch_twin_response(ctx, publish).await,
        TopicFamily::TwinDesiredPatch => dispatch_twin_patch(ctx, publish).await,
        TopicFamily::MethodRequest => dispatch_method(ctx, publish).await,
        TopicFamily::Event => dispatch_event(ctx, publish).await,
        TopicFamily::Unknown => {
            debug!(topic = %publish.topic, "message on unroutable topic, dropping");
        }
    }
}

async fn dispatch_event(ctx: &DispatchContext, publish: &Publish) {
    let Some(handler) = ctx.routes.event().await else {
        debug!(topic = %publish.topic, "no event handler installed, dropping");
        return;
    };
    match topics::decode_event_message(&publish.topic, &publish.payload) {
        Ok(msg) => handler.dispatch(msg),
        Err(e) => warn!(topic = %publish.topic, error = %e, "parse error"),
    }
}

async fn dispatch_twin_patch(ctx: &DispatchContext, publish: &Publish) {
    let Some(handler) = ctx.routes.twin_state().await else {
        debug!("no twin update handler installed, dropping");
        return;
    };
    handler.dispatch(&publish.payload);
}

async fn dispatch_twin_response(ctx: &DispatchContext, publish: &Publish) {
    match topics::decode_twin_response_topic(&publish.topic) {
        Ok((code, rid, version)) => {
            ctx.registry
                .deliver(
                    rid,
                    TwinResponse {
                        code,
                        body: publish.payload.clone(),
                        version,
                    },
                )
                .await;
        }
        Err(e) => warn!(topic = %publish.topic, error = %e, "parse error"),
    }
}

/// Runs the method handler off the event loop task and publishes its
/// reply on `$iothub/methods/res/{status}/?$rid={rid}`. A handler error
/// suppresses the reply; the hub's per-call timeout reports it upstream.
async fn dispatch_method(ctx: &DispatchContext, publish: &Publish) {
    let Some(handler) = ctx.routes.method().await else {
        debug!(topic = %publish.topic, "no direct method handler installed, dropping");
        return;
    };
    let (method, rid) = match topics::decode_method_topic(&publish.topic) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(topic = %publish.topic, error = %e, "parse error");
            return;
        }
    };

    let client = ctx.client.clone();
    let payload = publish.payload.clone();
    tokio::spawn(async move {
        let (status, body) = match handler.dispatch(&method, &payload) {
            Ok(reply) => reply,
            Err(e) => {
                error!(method = %method, error = %e, "dispatch error");
                return;
            }
        };
        let topic = topics::method_response_topic(status, rid);
        if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, body).await {
            error!(method = %method, error = %e, "method response error");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::message::Message;
    use bytes::Bytes;
    use rumqttc::MqttOptions;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_ctx() -> DispatchContext {
        let (client, _event_loop) = AsyncClient::new(MqttOptions::new("d1", "localhost", 1883), 10);
        DispatchContext {
            client,
            event_prefix: topics::devicebound_prefix("d1"),
            routes: Arc::new(Routes::default()),
            registry: Arc::new(RequestRegistry::new()),
        }
    }

    fn publish(topic: &str, payload: &[u8]) -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: topic.to_string(),
            pkid: 0,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn classify_topic_families() {
        let prefix = topics::devicebound_prefix("d1");
        assert_eq!(
            classify("$iothub/twin/res/200/?$rid=1", &prefix),
            TopicFamily::TwinResponse
        );
        assert_eq!(
            classify("$iothub/twin/PATCH/properties/desired/?$version=3", &prefix),
            TopicFamily::TwinDesiredPatch
        );
        assert_eq!(
            classify("$iothub/methods/POST/reboot/?$rid=1", &prefix),
            TopicFamily::MethodRequest
        );
        assert_eq!(
            classify("devices/d1/messages/devicebound/%24.mid=a", &prefix),
            TopicFamily::Event
        );
        assert_eq!(classify("devices/d2/messages/devicebound/x", &prefix), TopicFamily::Unknown);
        assert_eq!(classify("some/random/topic", &prefix), TopicFamily::Unknown);
    }

    #[tokio::test]
    async fn event_is_decoded_and_dispatched() {
        let ctx = test_ctx();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.routes
            .set_event(Arc::new(move |msg: Message| {
                tx.send(msg).unwrap();
            }))
            .await;

        let p = publish("devices/d1/messages/devicebound/%24.mid=abc&foo=bar", b"hi");
        dispatch_publish(&ctx, &p).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, b"hi");
        assert_eq!(msg.message_id.as_deref(), Some("abc"));
        assert_eq!(msg.properties["foo"], "bar");
    }

    #[tokio::test]
    async fn malformed_event_topic_is_dropped() {
        let ctx = test_ctx();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.routes
            .set_event(Arc::new(move |msg: Message| {
                tx.send(msg).unwrap();
            }))
            .await;

        // no `$.` property bag in the topic
        let p = publish("devices/d1/messages/devicebound/garbage", b"hi");
        dispatch_publish(&ctx, &p).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn twin_patch_payload_is_forwarded_raw() {
        let ctx = test_ctx();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.routes
            .set_twin_state(Arc::new(move |payload: &[u8]| {
                tx.send(payload.to_vec()).unwrap();
            }))
            .await;

        let p = publish(
            "$iothub/twin/PATCH/properties/desired/?$version=4",
            br#"{"ts":"42"}"#,
        );
        dispatch_publish(&ctx, &p).await;
        assert_eq!(rx.recv().await.unwrap(), br#"{"ts":"42"}"#);
    }

    #[tokio::test]
    async fn twin_response_fulfils_pending_request() {
        let ctx = test_ctx();
        let (rid, mut rx) = ctx.registry.begin().await;

        let p = publish(
            &format!("$iothub/twin/res/204/?$rid={rid}&$version=9"),
            b"",
        );
        dispatch_publish(&ctx, &p).await;

        let resp = rx.try_recv().unwrap();
        assert_eq!(resp.code, 204);
        assert_eq!(resp.version, Some(9));
    }

    #[tokio::test]
    async fn twin_response_without_rid_touches_no_slot() {
        let ctx = test_ctx();
        let (_rid, mut rx) = ctx.registry.begin().await;

        let p = publish("$iothub/twin/res/204/?$version=9", b"");
        dispatch_publish(&ctx, &p).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn method_handler_is_invoked() {
        let ctx = test_ctx();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.routes
            .set_method(Arc::new(
                move |method: &str, payload: &[u8]| -> crate::error::Result<(u16, Vec<u8>)> {
                    tx.send((method.to_string(), payload.to_vec())).unwrap();
                    Ok((200, br#"{"result":4.5}"#.to_vec()))
                },
            ))
            .await;

        let p = publish("$iothub/methods/POST/sum/?$rid=7", br#"{"a":1.5,"b":3}"#);
        dispatch_publish(&ctx, &p).await;

        let (method, payload) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(method, "sum");

        let args: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(args["a"], 1.5);
        assert_eq!(args["b"], 3);
    }

    #[tokio::test]
    async fn failing_method_handler_sends_no_reply() {
        let ctx = test_ctx();
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctx.routes
            .set_method(Arc::new(
                move |_: &str, _: &[u8]| -> crate::error::Result<(u16, Vec<u8>)> {
                    tx.send(()).unwrap();
                    Err(TransportError::MalformedTopic("handler refused".into()))
                },
            ))
            .await;

        let p = publish("$iothub/methods/POST/sum/?$rid=7", b"{}");
        dispatch_publish(&ctx, &p).await;

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }
}
