//! Request/reply envelope carried over the pub/sub transport.
//!
//! A caller publishes a [`Request`] on a service channel and awaits the
//! matching [`Response`] on a private reply channel derived from the
//! correlation id. Services answer with [`reply`] / [`reply_error`].

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// An RPC request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id echoed back in the response.
    pub id: String,
    /// Method the caller wants invoked.
    pub method: String,
    /// Method parameters.
    pub params: Value,
    /// Channel the response must be published on.
    pub reply_to: String,
}

/// An RPC response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request being answered.
    pub id: String,
    /// Set when the service rejected or failed the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Method result; meaningless when `error` is set.
    #[serde(default)]
    pub result: Value,
}

/// Generates a fresh correlation id.
pub fn correlation_id() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

/// Performs one RPC round trip: publish a request, await the matching
/// response.
///
/// The reply channel is subscribed before the request is published so the
/// response cannot be lost to a race. A response carrying `error` or an
/// elapsed `timeout` both surface as [`Error::RemoteService`].
pub async fn call(
    kv: &dyn KeyValueStore,
    channel: &str,
    method: &str,
    params: Value,
    timeout: Duration,
) -> Result<Value> {
    let id = correlation_id();
    let reply_to = format!("{channel}:reply:{id}");
    let mut subscription = kv.subscribe(&reply_to).await?;

    let request = Request {
        id: id.clone(),
        method: method.to_string(),
        params,
        reply_to,
    };
    kv.publish(channel, serde_json::to_value(&request)?).await?;

    let awaited = tokio::time::timeout(timeout, async {
        while let Some(message) = subscription.next().await {
            let Ok(response) = serde_json::from_value::<Response>(message.payload) else {
                continue;
            };
            if response.id == id {
                return Some(response);
            }
        }
        None
    })
    .await;

    match awaited {
        Ok(Some(Response { error: None, result, .. })) => Ok(result),
        Ok(Some(Response {
            error: Some(message),
            ..
        })) => Err(Error::remote(message)),
        Ok(None) => Err(Error::remote(format!(
            "reply channel for \"{method}\" closed before a response arrived"
        ))),
        Err(_) => Err(Error::remote(format!(
            "no response to \"{method}\" within {}s",
            timeout.as_secs_f64()
        ))),
    }
}

/// Publishes a successful response for `request`.
pub async fn reply(kv: &dyn KeyValueStore, request: &Request, result: Value) -> Result<()> {
    let response = Response {
        id: request.id.clone(),
        error: None,
        result,
    };
    kv.publish(&request.reply_to, serde_json::to_value(&response)?)
        .await
}

/// Publishes an error response for `request`.
pub async fn reply_error(kv: &dyn KeyValueStore, request: &Request, message: &str) -> Result<()> {
    let response = Response {
        id: request.id.clone(),
        error: Some(message.to_string()),
        result: Value::Null,
    };
    kv.publish(&request.reply_to, serde_json::to_value(&response)?)
        .await
}
