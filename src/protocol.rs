//! Downstream message stream and the transport seam.
//!
//! The merge engine emits an ordered stream of [`ServerMessage`]s per client.
//! A [`Transport`] delivers them in order or reports that the client is gone.

use crate::types::{DocumentId, Fields, SubscriptionId};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages sent from the server to one client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ServerMessage {
    // --- Document Messages ---
    /// A document became visible to the client.
    Added {
        collection: String,
        id: DocumentId,
        fields: Fields,
    },

    /// Fields of a visible document changed.
    Changed {
        collection: String,
        id: DocumentId,
        /// Fields with a new value.
        #[serde(default, skip_serializing_if = "Fields::is_empty")]
        fields: Fields,
        /// Fields that no longer exist.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cleared: Vec<String>,
    },

    /// A document is no longer visible to the client.
    Removed { collection: String, id: DocumentId },

    // --- Subscription Messages ---
    /// Initial record sets of these subscriptions are fully delivered.
    Ready { subs: Vec<SubscriptionId> },

    /// Subscription stopped, with the error that stopped it, if any.
    Nosub {
        id: SubscriptionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorPayload>,
    },
}

impl ServerMessage {
    /// Collection this message targets, for document messages.
    pub fn collection(&self) -> Option<&str> {
        match self {
            ServerMessage::Added { collection, .. }
            | ServerMessage::Changed { collection, .. }
            | ServerMessage::Removed { collection, .. } => Some(collection),
            ServerMessage::Ready { .. } | ServerMessage::Nosub { .. } => None,
        }
    }

    /// Encode as JSON text.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client-safe error description.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Delivery failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("client disconnected")]
    Disconnected,
}

/// In-order, reliable delivery to one client.
pub trait Transport: Send + 'static {
    fn send(&mut self, message: ServerMessage) -> std::result::Result<(), TransportError>;
}

impl<F> Transport for F
where
    F: FnMut(ServerMessage) -> std::result::Result<(), TransportError> + Send + 'static,
{
    fn send(&mut self, message: ServerMessage) -> std::result::Result<(), TransportError> {
        self(message)
    }
}

/// Transport backed by an unbounded channel.
///
/// Dropping the receiver is observed as a disconnect.
pub struct ChannelTransport {
    sender: Sender<ServerMessage>,
}

impl ChannelTransport {
    pub fn new() -> (Self, Receiver<ServerMessage>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, message: ServerMessage) -> std::result::Result<(), TransportError> {
        self.sender
            .send(message)
            .map_err(|_| TransportError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_json_shape() {
        let msg = ServerMessage::Changed {
            collection: "posts".into(),
            id: "p1".into(),
            fields: crate::types::fields_from_json(json!({"title": "hi"})),
            cleared: vec!["draft".into()],
        };

        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "msg": "changed",
                "collection": "posts",
                "id": "p1",
                "fields": {"title": "hi"},
                "cleared": ["draft"]
            })
        );
    }

    #[test]
    fn test_nosub_without_error_omits_field() {
        let msg = ServerMessage::Nosub {
            id: SubscriptionId(3),
            error: None,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"msg": "nosub", "id": 3}));
    }

    #[test]
    fn test_channel_transport_reports_disconnect() {
        let (mut transport, receiver) = ChannelTransport::new();
        transport
            .send(ServerMessage::Ready { subs: vec![] })
            .unwrap();
        assert!(receiver.try_recv().is_ok());

        drop(receiver);
        let result = transport.send(ServerMessage::Ready { subs: vec![] });
        assert!(matches!(result, Err(TransportError::Disconnected)));
    }
}
