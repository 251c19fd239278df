//! Session registry: one live session per configured server.
//!
//! [`SessionManager::update`] reconciles the desired server list against the
//! running sessions, keyed by server id. Each new session gets a driver task
//! that walks login → connect → join, classifies channel visibility, seeds
//! the unread table from the snapshot, then consumes both event feeds from a
//! single loop so each feed is applied in arrival order. Connectivity and
//! the unread counter are published into a shared aggregate map for the UI.
//!
//! A failure anywhere in the chain demotes the session to offline (unread
//! count untouched) and is not retried; recovery is the caller removing and
//! re-adding the entry. Sessions for different servers are fully independent
//! and complete in no particular order relative to each other.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use shoal_sdk::client::{Client, ClientConfig};
use shoal_sdk::rpc::{RpcHandle, SubscriptionHandle};
use shoal_sdk::types::{ChannelId, NewMessageEvent, ReadStateEvent};

use crate::permissions::permitted_channels;
use crate::readstate::ReadStateTable;

/// One configured server entry. `id` is the stable registry key; it is never
/// reused for a different endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    /// Base URL or bare host. An `https://` prefix selects TLS for both the
    /// login endpoint and the socket.
    pub url: String,
    pub identity: String,
    /// Login secret. Opaque here; at-rest protection is the store caller's
    /// concern.
    pub password: String,
    /// Join password, for servers that require one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_password: Option<String>,
}

/// Aggregate per-server state exposed to the UI layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub online: bool,
    pub unread_count: u64,
}

/// Shared aggregate map: written by session tasks, read by the UI.
type StateMap = Arc<Mutex<HashMap<String, ConnectionState>>>;

/// State a session's driver task shares with the manager.
#[derive(Default)]
struct SessionShared {
    rpc: Mutex<Option<RpcHandle>>,
    table: Mutex<Option<ReadStateTable>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

struct Session {
    driver: JoinHandle<()>,
    shared: Arc<SessionShared>,
}

/// Owns the `server id → session` map and the aggregate state.
pub struct SessionManager {
    sessions: HashMap<String, Session>,
    states: StateMap,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self { sessions: HashMap::new(), states: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Reconcile running sessions against `desired`, keyed by server id.
    ///
    /// Unchanged entries are left untouched (identity equality, not object
    /// identity). Removed ids are torn down: every recorded subscription
    /// handle is cancelled once, the transport closed, and all derived state
    /// dropped. New ids get `{online: false, unread: preserved-or-0}` and a
    /// driver task; the driver never blocks this call.
    pub fn update(&mut self, desired: &[ServerConfig]) {
        let current: Vec<String> = self.sessions.keys().cloned().collect();
        let (added, removed) = diff(&current, desired);

        for id in removed {
            if let Some(session) = self.sessions.remove(&id) {
                teardown(&id, session);
            }
            self.states.lock().remove(&id);
        }

        for config in added {
            debug!(server = %config.id, name = %config.name, "Creating session");
            {
                let mut states = self.states.lock();
                let unread =
                    states.get(&config.id).map(|state| state.unread_count).unwrap_or(0);
                states.insert(
                    config.id.clone(),
                    ConnectionState { online: false, unread_count: unread },
                );
            }

            let shared = Arc::new(SessionShared::default());
            let driver = tokio::spawn(run_session(
                config.clone(),
                Arc::clone(&shared),
                Arc::clone(&self.states),
            ));
            self.sessions.insert(config.id.clone(), Session { driver, shared });
        }
    }

    /// Zero a server's unread count immediately, then mark every positive
    /// permitted channel read on the server. The per-channel calls run
    /// concurrently; an individual failure is logged and neither blocks nor
    /// rolls back the others. Local entries are zeroed and the aggregate
    /// republished once the whole batch completes, so a feed event landing
    /// mid-batch cannot leave the aggregate out of step with the table; the
    /// next absolute read-state event corrects any remainder.
    pub async fn mark_as_read(&self, server_id: &str) {
        if let Some(state) = self.states.lock().get_mut(server_id) {
            state.unread_count = 0;
        }

        let Some(session) = self.sessions.get(server_id) else { return };
        let Some(rpc) = session.shared.rpc.lock().clone() else { return };
        let channels = match session.shared.table.lock().as_ref() {
            Some(table) => table.unread_channels(),
            None => return,
        };
        if channels.is_empty() {
            return;
        }

        debug!(server = %server_id, channels = channels.len(), "Marking channels read");
        let calls = channels.iter().map(|&channel_id| {
            let rpc = rpc.clone();
            async move {
                let input = json!({ "channelId": channel_id });
                if let Err(e) = rpc.mutate("channels.markAsRead", Some(input)).await {
                    warn!(channel = channel_id, error = %e, "markAsRead failed");
                }
            }
        });
        join_all(calls).await;

        clear_after_batch(&session.shared, &self.states, server_id, &channels);
    }

    /// Snapshot of the per-server `{online, unread}` map.
    pub fn states(&self) -> HashMap<String, ConnectionState> {
        self.states.lock().clone()
    }

    /// Aggregate state for one server, if configured.
    pub fn state(&self, server_id: &str) -> Option<ConnectionState> {
        self.states.lock().get(server_id).copied()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        for (id, session) in self.sessions.drain() {
            teardown(&id, session);
        }
    }
}

/// Identity-keyed reconciliation: which desired entries need sessions and
/// which running ids must go. Unchanged ids appear in neither list.
fn diff<'a>(current: &[String], desired: &'a [ServerConfig]) -> (Vec<&'a ServerConfig>, Vec<String>) {
    let desired_ids: HashSet<&str> = desired.iter().map(|config| config.id.as_str()).collect();
    let current_ids: HashSet<&str> = current.iter().map(String::as_str).collect();

    let removed = current
        .iter()
        .filter(|id| !desired_ids.contains(id.as_str()))
        .cloned()
        .collect();
    let added = desired
        .iter()
        .filter(|config| !current_ids.contains(config.id.as_str()))
        .collect();
    (added, removed)
}

fn teardown(id: &str, session: Session) {
    debug!(server = %id, "Removing session");
    session.driver.abort();
    for subscription in session.shared.subscriptions.lock().drain(..) {
        subscription.unsubscribe();
    }
    if let Some(rpc) = session.shared.rpc.lock().take() {
        rpc.close();
    }
    // The unread table and permitted set drop with the shared state.
}

async fn run_session(config: ServerConfig, shared: Arc<SessionShared>, states: StateMap) {
    if let Err(e) = drive(&config, &shared, &states).await {
        warn!(server = %config.id, error = %e, "Session ended");
        set_offline(&states, &config.id);
        // A connection may have opened before the failure; close it so the
        // socket doesn't outlive the session attempt.
        if let Some(rpc) = shared.rpc.lock().take() {
            rpc.close();
        }
    }
}

/// Zero the batched channels and write the table's sum back into the
/// aggregate. Feed events applied while the batch was in flight bumped the
/// aggregate from the pre-clear table, so the republish is what restores
/// `aggregate == permitted-filtered table sum`.
fn clear_after_batch(shared: &SessionShared, states: &StateMap, id: &str, channels: &[ChannelId]) {
    let mut table = shared.table.lock();
    let Some(table) = table.as_mut() else { return };
    table.clear(channels);
    if let Some(state) = states.lock().get_mut(id) {
        state.unread_count = table.unread_total();
    }
}

fn set_offline(states: &StateMap, id: &str) {
    // get_mut, never insert: a torn-down server must stay gone.
    if let Some(state) = states.lock().get_mut(id) {
        state.online = false;
    }
}

async fn drive(
    config: &ServerConfig,
    shared: &Arc<SessionShared>,
    states: &StateMap,
) -> anyhow::Result<()> {
    let mut client = Client::new(ClientConfig {
        host: config.url.clone(),
        use_ssl: config.url.starts_with("https://"),
    });

    {
        let states = Arc::clone(states);
        let id = config.id.clone();
        client.set_on_disconnect(move || {
            warn!(server = %id, "Connection lost");
            set_offline(&states, &id);
        });
    }

    client.login(&config.identity, &config.password, None).await?;
    let rpc = client.connect()?;
    *shared.rpc.lock() = Some(rpc.clone());

    let snapshot = client.join(config.join_password.as_deref()).await?;

    let permitted = permitted_channels(&snapshot);
    let table = ReadStateTable::from_snapshot(&snapshot, permitted);
    let unread = table.unread_total();
    *shared.table.lock() = Some(table);

    if let Some(state) = states.lock().get_mut(&config.id) {
        *state = ConnectionState { online: true, unread_count: unread };
    }
    debug!(server = %config.id, unread, "Session joined");

    let (message_sub, mut messages) = rpc.subscribe("messages.onNew").await?;
    let (read_sub, mut read_states) = rpc.subscribe("channels.onReadStateUpdate").await?;
    {
        let mut subscriptions = shared.subscriptions.lock();
        subscriptions.push(message_sub);
        subscriptions.push(read_sub);
    }

    // One loop for both feeds: each feed stays in arrival order and all
    // table mutation happens on this task. Both feeds end when the socket
    // closes; the disconnect callback has already demoted us by then.
    loop {
        tokio::select! {
            event = messages.recv() => match event {
                Some(value) => apply_message(config, shared, states, value),
                None => break,
            },
            event = read_states.recv() => match event {
                Some(value) => apply_read_state(config, shared, states, value),
                None => break,
            },
        }
    }

    debug!(server = %config.id, "Feeds ended");
    Ok(())
}

fn apply_message(
    config: &ServerConfig,
    shared: &SessionShared,
    states: &StateMap,
    value: serde_json::Value,
) {
    let event: NewMessageEvent = match serde_json::from_value(value) {
        Ok(event) => event,
        Err(e) => {
            warn!(server = %config.id, error = %e, "Undecodable message event");
            return;
        }
    };

    let mut table = shared.table.lock();
    let Some(table) = table.as_mut() else { return };
    if table.apply_message(&event)
        && let Some(state) = states.lock().get_mut(&config.id)
    {
        state.unread_count = table.unread_total();
    }
}

fn apply_read_state(
    config: &ServerConfig,
    shared: &SessionShared,
    states: &StateMap,
    value: serde_json::Value,
) {
    let event: ReadStateEvent = match serde_json::from_value(value) {
        Ok(event) => event,
        Err(e) => {
            warn!(server = %config.id, error = %e, "Undecodable read-state event");
            return;
        }
    };

    let mut table = shared.table.lock();
    let Some(table) = table.as_mut() else { return };
    table.apply_read_state(&event);
    if let Some(state) = states.lock().get_mut(&config.id) {
        state.unread_count = table.unread_total();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_sdk::types::ServerSnapshot;

    fn config(id: &str) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            name: format!("server {id}"),
            // Nothing listens here; drivers fail fast and go offline.
            url: format!("127.0.0.1:1/{id}"),
            identity: "tester".to_string(),
            password: "secret".to_string(),
            join_password: None,
        }
    }

    #[test]
    fn diff_is_keyed_by_identity() {
        let current = vec!["a".to_string(), "b".to_string()];
        let desired = vec![config("b"), config("c")];

        let (added, removed) = diff(&current, &desired);

        assert_eq!(added.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(removed, vec!["a".to_string()]);
    }

    #[test]
    fn diff_leaves_unchanged_entries_alone() {
        let current = vec!["a".to_string()];
        let desired = vec![config("a")];
        let (added, removed) = diff(&current, &desired);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn new_server_starts_offline_with_zero_unread() {
        let mut manager = SessionManager::new();
        manager.update(&[config("a")]);

        let state = manager.state("a").unwrap();
        assert!(!state.online);
        assert_eq!(state.unread_count, 0);
    }

    #[tokio::test]
    async fn new_server_preserves_a_previously_shown_unread_count() {
        let mut manager = SessionManager::new();
        manager
            .states
            .lock()
            .insert("a".to_string(), ConnectionState { online: false, unread_count: 7 });

        manager.update(&[config("a")]);

        let state = manager.state("a").unwrap();
        assert!(!state.online);
        assert_eq!(state.unread_count, 7);
    }

    #[tokio::test]
    async fn removed_server_drops_session_and_state() {
        let mut manager = SessionManager::new();
        manager.update(&[config("a"), config("b")]);
        assert_eq!(manager.states().len(), 2);

        manager.update(&[config("b")]);

        assert!(manager.state("a").is_none());
        assert!(!manager.sessions.contains_key("a"));
        assert!(manager.sessions.contains_key("b"));
    }

    #[tokio::test]
    async fn re_running_update_with_same_list_keeps_sessions() {
        let mut manager = SessionManager::new();
        manager.update(&[config("a")]);
        let before = manager.sessions.get("a").map(|s| Arc::as_ptr(&s.shared)).unwrap();

        manager.update(&[config("a")]);

        let after = manager.sessions.get("a").map(|s| Arc::as_ptr(&s.shared)).unwrap();
        assert_eq!(before, after, "unchanged entry must not be recreated");
    }

    #[tokio::test]
    async fn mark_as_read_zeroes_the_aggregate_even_when_offline() {
        let mut manager = SessionManager::new();
        manager.update(&[config("a")]);
        manager
            .states
            .lock()
            .insert("a".to_string(), ConnectionState { online: false, unread_count: 5 });

        manager.mark_as_read("a").await;

        assert_eq!(manager.state("a").unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn mark_as_read_on_unknown_server_is_a_no_op() {
        let manager = SessionManager::new();
        manager.mark_as_read("missing").await;
        assert!(manager.states().is_empty());
    }

    /// A message landing while a markAsRead batch is in flight bumps the
    /// aggregate from the pre-clear table; the batch-end republish must pull
    /// it back to the table's actual sum.
    #[test]
    fn batch_clear_republishes_the_aggregate_after_a_mid_batch_message() {
        let config = config("a");
        let shared = SessionShared::default();
        let states: StateMap = Arc::new(Mutex::new(HashMap::new()));
        states
            .lock()
            .insert("a".to_string(), ConnectionState { online: true, unread_count: 0 });

        let snapshot = ServerSnapshot {
            own_user_id: 42,
            read_states: [(1, 5)].into_iter().collect(),
            ..ServerSnapshot::default()
        };
        *shared.table.lock() = Some(ReadStateTable::from_snapshot(&snapshot, [1].into()));

        // Mid-batch event: the aggregate jumps to the pre-clear sum.
        apply_message(&config, &shared, &states, json!({ "channelId": 1, "userId": 7 }));
        assert_eq!(states.lock()["a"].unread_count, 6);

        clear_after_batch(&shared, &states, "a", &[1]);

        assert_eq!(shared.table.lock().as_ref().unwrap().unread_total(), 0);
        assert_eq!(states.lock()["a"].unread_count, 0);
    }

    #[test]
    fn a_lost_socket_demotes_but_keeps_the_unread_count() {
        let states: StateMap = Arc::new(Mutex::new(HashMap::new()));
        states
            .lock()
            .insert("a".to_string(), ConnectionState { online: true, unread_count: 5 });

        set_offline(&states, "a");

        assert_eq!(
            states.lock()["a"],
            ConnectionState { online: false, unread_count: 5 }
        );
    }

    #[test]
    fn a_late_offline_callback_never_resurrects_removed_state() {
        let states: StateMap = Arc::new(Mutex::new(HashMap::new()));
        set_offline(&states, "gone");
        assert!(states.lock().is_empty());
    }
}
