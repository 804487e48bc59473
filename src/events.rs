//! Lifecycle events emitted by the server.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Observable lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The GraphQL layer is attached to the router
    ApolloReady,
    /// Full composition done, right before binding
    WebInterfaceReady,
    /// The listener is bound and accepting connections
    GraphQLListening,
    /// A runtime error surfaced by the transport or startup sequence
    Error(String),
    /// Shutdown in progress
    Exit,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ApolloReady => "onApolloReady",
            ServerEvent::WebInterfaceReady => "onWebInterfaceReady",
            ServerEvent::GraphQLListening => "onGraphQLListening",
            ServerEvent::Error(_) => "onError",
            ServerEvent::Exit => "onExit",
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::Error(message) => write!(f, "{}: {}", self.name(), message),
            other => f.write_str(other.name()),
        }
    }
}

/// Broadcast hub for [`ServerEvent`]s.
///
/// Every event except `Error` is delivered at most once per hub; repeated
/// emits are dropped.
#[derive(Clone)]
pub struct ServerEvents {
    sender: broadcast::Sender<ServerEvent>,
    fired: Arc<Mutex<HashSet<&'static str>>>,
}

impl ServerEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sender,
            fired: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Subscribe to future events. Subscribe before `start()` to see them all.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Emit an event; returns `false` when a one-shot event was already emitted.
    pub fn emit(&self, event: ServerEvent) -> bool {
        if !matches!(event, ServerEvent::Error(_)) {
            let Ok(mut fired) = self.fired.lock() else {
                return false;
            };
            if !fired.insert(event.name()) {
                return false;
            }
        }

        tracing::debug!(event = %event, "server event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
        true
    }
}

impl Default for ServerEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ServerEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEvents")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_shot_events_fire_once() {
        let events = ServerEvents::new();
        let mut rx = events.subscribe();

        assert!(events.emit(ServerEvent::ApolloReady));
        assert!(!events.emit(ServerEvent::ApolloReady));
        assert!(events.emit(ServerEvent::Exit));

        assert_eq!(rx.recv().await.unwrap(), ServerEvent::ApolloReady);
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::Exit);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn errors_fire_every_time() {
        let events = ServerEvents::new();
        let mut rx = events.subscribe();

        assert!(events.emit(ServerEvent::Error("first".into())));
        assert!(events.emit(ServerEvent::Error("second".into())));

        tokio_test::block_on(async {
            assert_eq!(rx.recv().await.unwrap(), ServerEvent::Error("first".into()));
            assert_eq!(rx.recv().await.unwrap(), ServerEvent::Error("second".into()));
        });
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let events = ServerEvents::default();
        assert!(events.emit(ServerEvent::WebInterfaceReady));
        assert_eq!(ServerEvent::GraphQLListening.to_string(), "onGraphQLListening");
    }
}
