use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a hub event. `Text` carries a newly created message; the rest
/// describe mutations of messages already in the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    MessageEdited,
    MessageDeleted,
    ReactionAdded,
    ReactionRemoved,
}

/// Envelope fanned out by the hub to every connection subscribed to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

impl ChatEvent {
    pub fn new<T: Serialize>(
        channel_id: Uuid,
        user_id: Uuid,
        kind: EventKind,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            channel_id,
            user_id,
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// JSON bytes as written to the wire.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Frame sent FROM a client over its session.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientFrame {
    pub content: String,
    #[serde(default)]
    pub parent_message_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub message_id: Uuid,
    pub emoji: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_kind_as_type() {
        let event = ChatEvent::new(
            Uuid::nil(),
            Uuid::nil(),
            EventKind::ReactionAdded,
            &ReactionPayload { message_id: Uuid::nil(), emoji: "+1".into() },
        )
        .unwrap();

        let json: serde_json::Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "reaction_added");
        assert_eq!(json["payload"]["emoji"], "+1");
    }

    #[test]
    fn client_frame_parent_is_optional() {
        let frame: ClientFrame = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert_eq!(frame.content, "hi");
        assert!(frame.parent_message_id.is_none());

        assert!(serde_json::from_str::<ClientFrame>(r#"{"content":"hi","extra":1}"#).is_err());
    }
}
