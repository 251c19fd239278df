//! Wire payloads consumed from the server's JSON surface.
//!
//! Field names follow the server's camelCase; unknown fields are ignored so
//! newer servers stay readable. `readStates` arrives keyed by decimal-string
//! channel ids and is parsed into a numeric map on the way in.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

pub type ChannelId = u64;
pub type UserId = u64;
pub type MessageId = u64;

/// Body for `POST /login`.
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub identity: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite: Option<String>,
}

/// Success body from `POST /login`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub success: bool,
    /// Session token; absent on malformed success bodies.
    #[serde(default)]
    pub token: Option<String>,
}

/// Error body from `POST /login`. Servers send either a single `error`
/// string or a structured `errors` value.
#[derive(Debug, Default, Deserialize)]
pub struct LoginErrorBody {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
}

/// Reply to the `others.handshake` query.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeReply {
    #[serde(default)]
    pub handshake_hash: String,
    /// True when the server requires a password for `others.joinServer`.
    #[serde(default)]
    pub has_password: bool,
}

/// One channel from the join snapshot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub category_id: Option<u64>,
}

/// Per-channel capability flags. Flags we don't act on are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelCapabilities {
    #[serde(rename = "VIEW_CHANNEL", default)]
    pub view_channel: bool,
    #[serde(rename = "SEND_MESSAGES", default)]
    pub send_messages: bool,
}

/// Explicit permission entry for one (otherwise private) channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPermissions {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub permissions: ChannelCapabilities,
}

/// Full initial state returned by `others.joinServer`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub own_user_id: UserId,
    #[serde(default)]
    pub channels: Vec<Channel>,
    /// Keyed by channel id on the wire; only the values matter here.
    #[serde(default)]
    pub channel_permissions: HashMap<String, ChannelPermissions>,
    /// Unread count per channel at join time.
    #[serde(default, deserialize_with = "de_string_keyed_counts")]
    pub read_states: HashMap<ChannelId, u64>,
}

fn de_string_keyed_counts<'de, D>(de: D) -> Result<HashMap<ChannelId, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, u64> = HashMap::deserialize(de)?;
    Ok(raw
        .into_iter()
        .filter_map(|(key, count)| key.parse::<ChannelId>().ok().map(|id| (id, count)))
        .collect())
}

/// Incremental feed item from `messages.onNew`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    #[serde(default)]
    pub content: Option<String>,
}

/// Absolute feed item from `channels.onReadStateUpdate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStateEvent {
    pub channel_id: ChannelId,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_parses_string_keyed_read_states() {
        let snapshot: ServerSnapshot = serde_json::from_value(json!({
            "serverId": "srv-1",
            "serverName": "harbor",
            "ownUserId": 42,
            "channels": [
                { "id": 1, "name": "general", "private": false, "position": 0 },
                { "id": 2, "name": "staff", "private": true, "topic": "ops" }
            ],
            "channelPermissions": {
                "2": { "channelId": 2, "permissions": { "VIEW_CHANNEL": true, "SPEAK": false } }
            },
            "readStates": { "1": 2, "2": 5, "bogus": 9 },
            "voiceMap": {}
        }))
        .unwrap();

        assert_eq!(snapshot.own_user_id, 42);
        assert_eq!(snapshot.channels.len(), 2);
        assert!(snapshot.channels[1].private);
        assert_eq!(snapshot.read_states.get(&1), Some(&2));
        assert_eq!(snapshot.read_states.get(&2), Some(&5));
        // Unparseable keys are dropped rather than failing the join.
        assert_eq!(snapshot.read_states.len(), 2);
        assert!(snapshot.channel_permissions["2"].permissions.view_channel);
    }

    #[test]
    fn handshake_reply_defaults() {
        let reply: HandshakeReply =
            serde_json::from_value(json!({ "handshakeHash": "abc123" })).unwrap();
        assert_eq!(reply.handshake_hash, "abc123");
        assert!(!reply.has_password);
    }

    #[test]
    fn feed_events_parse_camel_case() {
        let msg: NewMessageEvent =
            serde_json::from_value(json!({ "channelId": 3, "userId": 7, "content": "hi", "id": 99 }))
                .unwrap();
        assert_eq!((msg.channel_id, msg.user_id), (3, 7));

        let read: ReadStateEvent =
            serde_json::from_value(json!({ "channelId": 3, "count": 0 })).unwrap();
        assert_eq!(read, ReadStateEvent { channel_id: 3, count: 0 });
    }

    #[test]
    fn login_request_omits_missing_invite() {
        let body = serde_json::to_value(LoginRequest {
            identity: "crab".into(),
            password: "s3cret".into(),
            invite: None,
        })
        .unwrap();
        assert_eq!(body, json!({ "identity": "crab", "password": "s3cret" }));
    }
}
