//! Topic grammar for the hub MQTT dialect.
//!
//! Four families cross this module: telemetry publishes, cloud-to-device
//! deliveries, direct methods and twin request/response. The grammars are
//! the wire contract with the hub and are reproduced exactly, including
//! the URL-escaped property bags embedded in topic names.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::percent_decode_str;
use url::form_urlencoded;

use crate::error::{Result, TransportError};
use crate::message::Message;

/// Subscription filter for direct method requests.
pub const METHOD_POST_FILTER: &str = "$iothub/methods/POST/#";
/// Subscription filter for twin request/response replies.
pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
/// Subscription filter for desired-property change notifications.
pub const TWIN_PATCH_DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";

pub(crate) const METHOD_POST_PREFIX: &str = "$iothub/methods/POST/";
pub(crate) const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
pub(crate) const TWIN_PATCH_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";

/// Subscription filter for cloud-to-device deliveries to one device.
pub fn devicebound_filter(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

pub(crate) fn devicebound_prefix(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/")
}

/// Builds the telemetry publish topic for `msg`.
///
/// All properties ride in the topic as a URL-encoded query: system
/// properties under their `$.`-prefixed names, user properties as plain
/// `k=v` pairs. Empty values are omitted; key order is unspecified.
pub fn encode_event_topic(device_id: &str, msg: &Message) -> String {
    let mut query = form_urlencoded::Serializer::new(String::new());

    let system = [
        ("$.mid", &msg.message_id),
        ("$.cid", &msg.correlation_id),
        ("$.uid", &msg.user_id),
        ("$.to", &msg.to),
    ];
    for (key, value) in system {
        if let Some(value) = value {
            if !value.is_empty() {
                query.append_pair(key, value);
            }
        }
    }
    if let Some(exp) = &msg.expiry_time {
        query.append_pair(
            "$.exp",
            &exp.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }
    for (key, value) in &msg.properties {
        if !value.is_empty() {
            query.append_pair(key, value);
        }
    }

    format!("devices/{}/messages/events/{}", device_id, query.finish())
}

/// Decodes a cloud-to-device delivery into a [`Message`].
pub fn decode_event_message(topic: &str, payload: &[u8]) -> Result<Message> {
    let props = parse_cloud_to_device_topic(topic)?;

    let mut msg = Message {
        payload: payload.to_vec(),
        ..Default::default()
    };
    for (key, value) in props {
        match key.as_str() {
            "$.mid" => msg.message_id = Some(value),
            "$.cid" => msg.correlation_id = Some(value),
            "$.uid" => msg.user_id = Some(value),
            "$.to" => msg.to = Some(value),
            "$.exp" => {
                let t = DateTime::parse_from_rfc3339(&value)
                    .map_err(|e| TransportError::MalformedTopic(format!("$.exp: {e}")))?;
                msg.expiry_time = Some(t.with_timezone(&Utc));
            }
            _ => {
                msg.properties.insert(key, value);
            }
        }
    }
    Ok(msg)
}

/// The property bag starts at the first `$.` of the unescaped topic;
/// everything from there on parses as a query string. Each key must carry
/// exactly one value.
fn parse_cloud_to_device_topic(topic: &str) -> Result<HashMap<String, String>> {
    let decoded = query_unescape(topic)?;
    let start = decoded.find("$.").ok_or_else(|| {
        TransportError::MalformedTopic("cloud-to-device topic has no property bag".into())
    })?;

    let mut props = HashMap::new();
    for (key, value) in form_urlencoded::parse(decoded[start..].as_bytes()) {
        if props.insert(key.into_owned(), value.into_owned()).is_some() {
            return Err(TransportError::MalformedTopic(
                "duplicate property key in cloud-to-device topic".into(),
            ));
        }
    }
    Ok(props)
}

/// Parses a direct-method request topic into its method name and `$rid`.
///
/// Format: `$iothub/methods/POST/{method}/?$rid={rid}`.
pub fn decode_method_topic(topic: &str) -> Result<(String, u64)> {
    let decoded = query_unescape(topic)?;
    let (path, query) = split_topic(&decoded);

    let path = path.trim_end_matches('/');
    let method = path.strip_prefix(METHOD_POST_PREFIX).ok_or_else(|| {
        TransportError::MalformedTopic("not a direct method request topic".into())
    })?;

    let rid = single_query_value(query, "$rid")?
        .parse()
        .map_err(|e| TransportError::MalformedTopic(format!("$rid: {e}")))?;
    Ok((method.to_string(), rid))
}

/// Publish topic for a direct-method response.
pub fn method_response_topic(status: u16, rid: u64) -> String {
    format!("$iothub/methods/res/{status}/?$rid={rid}")
}

/// Publish topic for a twin GET request. The payload is empty.
pub fn twin_get_topic(rid: u32) -> String {
    format!("$iothub/twin/GET/?$rid={rid}")
}

/// Publish topic for a twin reported-properties PATCH; the JSON patch
/// rides as the payload.
pub fn twin_patch_topic(rid: u32) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={rid}")
}

/// Parses a twin response topic into `(status, rid, version)`.
///
/// Format: `$iothub/twin/res/{rc}/?$rid={rid}` with `$version` appended
/// on PATCH responses only.
pub fn decode_twin_response_topic(topic: &str) -> Result<(u16, u32, Option<u64>)> {
    let (path, query) = split_topic(topic);

    let path = path.trim_matches('/');
    let rc = path
        .strip_prefix(TWIN_RESPONSE_PREFIX)
        .ok_or_else(|| TransportError::MalformedTopic("not a twin response topic".into()))?
        .parse()
        .map_err(|e| TransportError::MalformedTopic(format!("status code: {e}")))?;

    let rid = single_query_value(query, "$rid")?
        .parse()
        .map_err(|e| TransportError::MalformedTopic(format!("$rid: {e}")))?;

    let version = match optional_query_value(query, "$version")? {
        Some(v) => Some(
            v.parse()
                .map_err(|e| TransportError::MalformedTopic(format!("$version: {e}")))?,
        ),
        None => None,
    };
    Ok((rc, rid, version))
}

fn split_topic(topic: &str) -> (&str, &str) {
    match topic.split_once('?') {
        Some((path, query)) => (path, query),
        None => (topic, ""),
    }
}

/// Unescapes a full topic name: `+` is a space, `%XX` sequences decode.
fn query_unescape(s: &str) -> Result<String> {
    let spaced = s.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|c| c.into_owned())
        .map_err(|e| TransportError::MalformedTopic(format!("invalid escape: {e}")))
}

fn single_query_value(query: &str, key: &str) -> Result<String> {
    optional_query_value(query, key)?
        .ok_or_else(|| TransportError::MalformedTopic(format!("{key} is not available")))
}

fn optional_query_value(query: &str, key: &str) -> Result<Option<String>> {
    let mut found = None;
    for (k, v) in form_urlencoded::parse(query.as_bytes()) {
        if k == key {
            if found.is_some() {
                return Err(TransportError::MalformedTopic(format!(
                    "{key} appears more than once"
                )));
            }
            found = Some(v.into_owned());
        }
    }
    Ok(found)
}
