//! In-process publish/subscribe broker backing GraphQL subscriptions.
//!
//! One [`PubSub`] is created when the process is wired together and cloned
//! into whoever needs it; clones share the same topics.

use crate::schema::{value_field, Resolver, RootSubscriptionField};
use async_graphql::dynamic::{Object, SubscriptionFieldFuture, TypeRef};
use async_graphql::Value as GqlValue;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Topic used by the built-in `onData` subscription.
pub const ON_DATA_TOPIC: &str = "onData";

const TOPIC_CAPACITY: usize = 256;

/// Shared topic → broadcast channel map.
#[derive(Clone, Default)]
pub struct PubSub {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Value>>>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Value> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    /// Publish `payload` on `topic`, returning how many subscribers got it.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        match self.sender(topic).send(payload) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!(%topic, "published without subscribers");
                0
            }
        }
    }

    /// Stream of payloads published on `topic` after this call.
    ///
    /// Slow subscribers skip the payloads they lagged behind on.
    pub fn subscribe(&self, topic: &str) -> impl Stream<Item = Value> + Send + 'static {
        let topic_name = topic.to_string();
        BroadcastStream::new(self.sender(topic).subscribe()).filter_map(move |item| {
            let topic_name = topic_name.clone();
            async move {
                match item {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(topic = %topic_name, error = %e, "subscriber lagged");
                        None
                    }
                }
            }
        })
    }

    pub fn topics(&self) -> Vec<String> {
        let topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.keys().cloned().collect()
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("topics", &self.topics())
            .finish()
    }
}

/// Payload of the `onData` subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub data: Option<String>,
}

impl Notification {
    pub fn new(id: impl Into<String>, data: Option<String>) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Publish this notification on [`ON_DATA_TOPIC`].
    pub fn publish(&self, pubsub: &PubSub) -> usize {
        match serde_json::to_value(self) {
            Ok(payload) => pubsub.publish(ON_DATA_TOPIC, payload),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode notification");
                0
            }
        }
    }
}

/// `onData: Notification!` subscription fed by [`ON_DATA_TOPIC`].
///
/// The schema must carry a [`PubSub`] as data.
pub fn notifications_resolver() -> Resolver {
    let notification = Object::new("Notification")
        .field(value_field("id", TypeRef::named_nn(TypeRef::ID)))
        .field(value_field("data", TypeRef::named(TypeRef::STRING)));

    let on_data = RootSubscriptionField::new(
        ON_DATA_TOPIC,
        TypeRef::named_nn("Notification"),
        |ctx| {
            SubscriptionFieldFuture::new(async move {
                let pubsub = ctx.data::<PubSub>()?.clone();
                let stream = pubsub.subscribe(ON_DATA_TOPIC).map(|payload| {
                    GqlValue::from_json(payload).map_err(|e| {
                        async_graphql::Error::new(format!("invalid notification: {e}"))
                    })
                });
                Ok(stream)
            })
        },
    );

    Resolver::new("notifications")
        .subscription(on_data)
        .register(notification)
}
