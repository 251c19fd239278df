//! Channel visibility derived from a join snapshot.

use std::collections::HashSet;

use shoal_sdk::types::{ChannelId, ServerSnapshot};

/// The set of channels the joined user may view.
///
/// A channel is permitted when it is not private, or when an explicit entry
/// grants `VIEW_CHANNEL`. Entries only ever add permission; they never take
/// it away from a non-private channel. The set is a snapshot: recomputed on
/// each successful join, never updated incrementally between joins.
pub fn permitted_channels(snapshot: &ServerSnapshot) -> HashSet<ChannelId> {
    let mut permitted: HashSet<ChannelId> = snapshot
        .channels
        .iter()
        .filter(|channel| !channel.private)
        .map(|channel| channel.id)
        .collect();

    for entry in snapshot.channel_permissions.values() {
        if entry.permissions.view_channel {
            permitted.insert(entry.channel_id);
        }
    }

    permitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot() -> ServerSnapshot {
        serde_json::from_value(json!({
            "channels": [
                { "id": 1, "name": "general", "private": false },
                { "id": 2, "name": "staff", "private": true },
                { "id": 3, "name": "audit", "private": true }
            ],
            "channelPermissions": {
                "2": { "channelId": 2, "permissions": { "VIEW_CHANNEL": true } },
                "1": { "channelId": 1, "permissions": { "VIEW_CHANNEL": false } }
            }
        }))
        .unwrap()
    }

    #[test]
    fn non_private_channels_are_permitted() {
        assert!(permitted_channels(&snapshot()).contains(&1));
    }

    #[test]
    fn view_grant_admits_a_private_channel() {
        assert!(permitted_channels(&snapshot()).contains(&2));
    }

    #[test]
    fn private_channel_without_grant_is_excluded() {
        assert!(!permitted_channels(&snapshot()).contains(&3));
    }

    #[test]
    fn a_false_grant_never_revokes_a_public_channel() {
        // Channel 1 has VIEW_CHANNEL=false in the entries, but is public.
        let permitted = permitted_channels(&snapshot());
        assert_eq!(permitted, [1, 2].into_iter().collect());
    }
}
