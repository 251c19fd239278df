//! Per-server unread bookkeeping.
//!
//! Two feeds mutate the table. The incremental new-message feed adds one per
//! qualifying event; the absolute read-state feed replaces a channel's count
//! outright. The aggregate counter is bumped by one for each counted message
//! but recomputed as a full permitted-filtered sum after every absolute
//! update or clear, so replayed or decreasing absolute events cannot drift it.

use std::collections::{HashMap, HashSet};

use shoal_sdk::types::{ChannelId, NewMessageEvent, ReadStateEvent, ServerSnapshot, UserId};

/// Unread counts for one server, filtered by the permitted-channel set.
///
/// Ground truth per channel is the most recent write, whichever feed made
/// it. Entries outside the permitted set are kept but never counted.
#[derive(Debug, Default)]
pub struct ReadStateTable {
    counts: HashMap<ChannelId, u64>,
    permitted: HashSet<ChannelId>,
    own_user_id: UserId,
    unread: u64,
}

impl ReadStateTable {
    /// Seed from a join snapshot. The aggregate is computed once as the
    /// permitted-filtered sum.
    pub fn from_snapshot(snapshot: &ServerSnapshot, permitted: HashSet<ChannelId>) -> Self {
        let counts = snapshot.read_states.clone();
        let unread = counts
            .iter()
            .filter(|(id, _)| permitted.contains(id))
            .map(|(_, count)| *count)
            .sum();
        Self { counts, permitted, own_user_id: snapshot.own_user_id, unread }
    }

    /// Apply one incremental event. Returns whether it counted.
    ///
    /// Events for unpermitted channels and our own messages are discarded.
    /// An increment is only ever revised by a later absolute update for the
    /// same channel; until one arrives the bump stands.
    pub fn apply_message(&mut self, event: &NewMessageEvent) -> bool {
        if !self.permitted.contains(&event.channel_id) {
            return false;
        }
        if event.user_id == self.own_user_id {
            return false;
        }
        *self.counts.entry(event.channel_id).or_insert(0) += 1;
        self.unread += 1;
        true
    }

    /// Apply one absolute event. The server's count is authoritative and may
    /// decrease (a channel marked read elsewhere).
    pub fn apply_read_state(&mut self, event: &ReadStateEvent) {
        self.counts.insert(event.channel_id, event.count);
        self.recompute();
    }

    /// Current aggregate unread count over permitted channels.
    pub fn unread_total(&self) -> u64 {
        self.unread
    }

    /// Permitted channels with at least one unread message.
    pub fn unread_channels(&self) -> Vec<ChannelId> {
        self.counts
            .iter()
            .filter(|(id, count)| **count > 0 && self.permitted.contains(id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Zero the given channels after a mark-as-read batch completes.
    pub fn clear(&mut self, channels: &[ChannelId]) {
        for id in channels {
            self.counts.insert(*id, 0);
        }
        self.recompute();
    }

    fn recompute(&mut self) {
        self.unread = self
            .counts
            .iter()
            .filter(|(id, _)| self.permitted.contains(id))
            .map(|(_, count)| *count)
            .sum();
    }
}
