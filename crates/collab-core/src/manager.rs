//! The connection manager.
//!
//! Owns the dispatch queue, the user registry and the background dispatch
//! loop, and answers introspection queries over the project directory.

use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientId};
use crate::directory::ProjectDirectory;
use crate::dispatch::{DispatchSnapshot, DispatchStats, Dispatcher};
use crate::packet::Packet;
use crate::payload::Payload;
use crate::queue::{DispatchQueue, QueueError};
use crate::user::{UserInfo, UserRegistry};

/// Header of [`ConnectionManager::list_connections`].
pub const LISTING_HEADER: &str =
    "Client   Address:Port                  Pub(Effective) Sub(Effective) PID     User\n";

const NONE_LINE: &str = " - none - \n";

/// Connection manager errors.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The dispatch loop could not be started.
    #[error("Failed to spawn dispatch loop: {0}")]
    Spawn(String),

    /// The operation is not valid in the current lifecycle state.
    #[error("Connection manager is {0:?}")]
    InvalidState(ManagerState),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Lifecycle of a [`ConnectionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Running,
    Terminated,
}

/// Connection manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// First update id handed out.
    #[serde(default)]
    pub initial_update_id: u64,

    /// Queue depth at which a warning is logged.
    #[serde(default = "default_queue_warn_depth")]
    pub queue_warn_depth: usize,
}

fn default_queue_warn_depth() -> usize {
    10_000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            initial_update_id: 0,
            queue_warn_depth: default_queue_warn_depth(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes every project update through a single ordered dispatch loop.
pub struct ConnectionManager {
    config: Mutex<Option<ManagerConfig>>,
    state: Mutex<ManagerState>,
    done: Arc<AtomicBool>,
    queue: Arc<DispatchQueue>,
    users: UserRegistry,
    projects: Arc<dyn ProjectDirectory>,
    stats: Arc<DispatchStats>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager over `projects`. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(config: ManagerConfig, projects: Arc<dyn ProjectDirectory>) -> Self {
        info!("Creating connection manager with config: {:?}", config);
        Self {
            queue: Arc::new(DispatchQueue::new(
                config.initial_update_id,
                config.queue_warn_depth,
            )),
            config: Mutex::new(Some(config)),
            state: Mutex::new(ManagerState::Created),
            done: Arc::new(AtomicBool::new(false)),
            users: UserRegistry::new(),
            projects,
            stats: Arc::new(DispatchStats::default()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Launch the background dispatch loop and return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Spawn`] when called outside a tokio runtime and
    /// [`ManagerError::InvalidState`] unless the manager is freshly created.
    pub fn start(&self) -> Result<(), ManagerError> {
        let mut state = lock(&self.state);
        if *state != ManagerState::Created {
            return Err(ManagerError::InvalidState(*state));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            error!(error = %e, "Cannot start dispatch loop");
            ManagerError::Spawn(e.to_string())
        })?;

        let dispatcher = Dispatcher {
            queue: Arc::clone(&self.queue),
            projects: Arc::clone(&self.projects),
            done: Arc::clone(&self.done),
            stats: Arc::clone(&self.stats),
        };
        *lock(&self.dispatcher) = Some(runtime.spawn(dispatcher.run()));
        *state = ManagerState::Running;

        info!("Connection manager started");
        Ok(())
    }

    /// Stop dispatching and close every connected client.
    ///
    /// Sets the done flag, wakes the dispatch loop, asks each client in every
    /// project to terminate, and releases the configuration. Later calls only
    /// log a warning.
    pub fn terminate(&self) {
        {
            let mut state = lock(&self.state);
            if *state == ManagerState::Terminated {
                warn!("Connection manager already terminated");
                return;
            }
            *state = ManagerState::Terminated;
        }

        info!("Connection manager terminating");
        self.done.store(true, Ordering::Release);
        self.queue.close();

        let mut closed = 0usize;
        self.projects.loop_clients(&mut |client| {
            client.terminate();
            closed += 1;
            ControlFlow::Continue(())
        });

        if let Some(config) = lock(&self.config).take() {
            debug!("Released configuration: {:?}", config);
        }

        info!(clients = closed, "Connection manager terminated");
    }

    /// Wait for the dispatch loop to exit after [`terminate`](Self::terminate).
    pub async fn wait_stopped(&self) {
        let task = lock(&self.dispatcher).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Dispatch loop ended abnormally");
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> ManagerState {
        *lock(&self.state)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// The configuration, until it is released by [`terminate`](Self::terminate).
    #[must_use]
    pub fn config(&self) -> Option<ManagerConfig> {
        lock(&self.config).clone()
    }

    /// Queue a packet that already carries its update id.
    ///
    /// # Errors
    ///
    /// Fails once the manager has been terminated.
    pub fn enqueue(&self, packet: Packet) -> Result<(), ManagerError> {
        self.queue.enqueue(packet)?;
        Ok(())
    }

    /// Assign the next update id to an update from `origin` and queue it.
    ///
    /// Returns the assigned update id.
    ///
    /// # Errors
    ///
    /// Fails once the manager has been terminated.
    pub fn post_update(
        &self,
        origin: &dyn Client,
        cmd: impl Into<String>,
        payload: Payload,
        permission: u64,
    ) -> Result<u64, ManagerError> {
        let update_id = self.queue.enqueue_with(|update_id| {
            Packet::new(origin, cmd, payload, update_id).with_permission(permission)
        })?;
        debug!(client = %origin.id(), update_id = update_id, "Update queued");
        Ok(update_id)
    }

    /// Detach a client from its project.
    pub fn remove(&self, client: ClientId) -> bool {
        self.projects.remove_client(client).is_some()
    }

    /// Register a user in the registry.
    pub fn register_user(&self, info: UserInfo) -> bool {
        self.users.register(info)
    }

    /// Look up a user; unknown uids yield the invalid sentinel record.
    #[must_use]
    pub fn get_user_info(&self, uid: u32) -> UserInfo {
        self.users.get(uid)
    }

    #[must_use]
    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    #[must_use]
    pub fn projects(&self) -> &Arc<dyn ProjectDirectory> {
        &self.projects
    }

    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn dispatch_stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    /// Send/receive counters of every connected client.
    #[must_use]
    pub fn dump_stats(&self) -> String {
        let mut report = String::new();
        self.projects.loop_clients(&mut |client| {
            report.push_str(&client.dump_stats());
            ControlFlow::Continue(())
        });

        if report.is_empty() {
            format!("Stats:\n{NONE_LINE}")
        } else {
            format!("Stats:\n{report}")
        }
    }

    /// One fixed-width line per connected client.
    #[must_use]
    pub fn list_connections(&self) -> String {
        let mut listing = String::new();
        self.projects.loop_clients(&mut |client| {
            listing.push_str(&format_connection(client.as_ref()));
            ControlFlow::Continue(())
        });

        if listing.is_empty() {
            format!("{LISTING_HEADER}{NONE_LINE}")
        } else {
            format!("{LISTING_HEADER}{listing}")
        }
    }
}

fn format_connection(client: &dyn Client) -> String {
    let peer = client.peer_addr();
    let addr = format!("{}:", peer.ip());
    let port_width = 30usize.saturating_sub(addr.len());

    format!(
        "{:<9}{}{:<width$}0x{:08x}     0x{:08x}     {:<5} {:>3}: {}\n",
        client.uid(),
        addr,
        peer.port(),
        client.publish_mask() as u32,
        client.subscribe_mask() as u32,
        client.pid(),
        client.uid(),
        client.user(),
        width = port_width,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientHandle, ClientOutbox, Outbound, ProjectId};
    use crate::directory::ProjectMap;
    use crate::packet::UPDATE_ID_FIELD;
    use collab_protocol::{MessageKind, ALL_PERMISSIONS};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn manager() -> (ConnectionManager, Arc<ProjectMap>) {
        let projects = Arc::new(ProjectMap::new());
        let manager = ConnectionManager::new(ManagerConfig::default(), projects.clone());
        (manager, projects)
    }

    fn connect(
        manager: &ConnectionManager,
        user: UserInfo,
        project: ProjectId,
    ) -> (Arc<ClientHandle>, ClientOutbox) {
        let (handle, outbox) = ClientHandle::new(
            user,
            project,
            "192.168.1.20:51234".parse().unwrap(),
            ALL_PERMISSIONS,
            ALL_PERMISSIONS,
        );
        let handle = Arc::new(handle);
        manager.projects().add_client(handle.clone());
        (handle, outbox)
    }

    fn user(name: &str, uid: u32) -> UserInfo {
        UserInfo::new(name, uid, ALL_PERMISSIONS, ALL_PERMISSIONS)
    }

    fn payload(seq: u64) -> Payload {
        Payload::from_value(json!({"seq": seq})).unwrap()
    }

    async fn next_update(outbox: &mut ClientOutbox) -> (String, u64) {
        match timeout(WAIT, outbox.next()).await {
            Ok(Some(Outbound::Update { cmd, payload })) => {
                (cmd, payload.get_u64(UPDATE_ID_FIELD).unwrap())
            }
            other => panic!("Expected update, got {:?}", other),
        }
    }

    async fn next_ack(outbox: &mut ClientOutbox) -> u64 {
        match timeout(WAIT, outbox.next()).await {
            Ok(Some(Outbound::Message { kind, payload })) => {
                assert_eq!(kind, MessageKind::AckUpdateId);
                payload.get_u64(UPDATE_ID_FIELD).unwrap()
            }
            other => panic!("Expected ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_update_fans_out_and_acknowledges() {
        let (manager, _projects) = manager();
        manager.start().unwrap();
        assert_eq!(manager.state(), ManagerState::Running);

        let (a, mut a_out) = connect(&manager, user("a", 1), 7);
        let (_b, mut b_out) = connect(&manager, user("b", 2), 7);
        let (_c, mut c_out) = connect(&manager, user("c", 3), 7);

        let id = manager
            .post_update(a.as_ref(), "rename", payload(1), ALL_PERMISSIONS)
            .unwrap();

        assert_eq!(next_update(&mut b_out).await, ("rename".to_string(), id));
        assert_eq!(next_update(&mut c_out).await, ("rename".to_string(), id));
        assert_eq!(next_ack(&mut a_out).await, id);
        assert!(a_out.try_next().is_none());

        manager.terminate();
        manager.wait_stopped().await;
        let stats = manager.dispatch_stats();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.forwarded, 2);
        assert_eq!(stats.acknowledged, 1);
    }

    #[tokio::test]
    async fn test_members_observe_global_order() {
        let (manager, _projects) = manager();
        manager.start().unwrap();

        let (a, _a_out) = connect(&manager, user("a", 1), 1);
        let (b, _b_out) = connect(&manager, user("b", 2), 1);
        let (_c, mut c_out) = connect(&manager, user("c", 3), 1);
        let (_d, mut d_out) = connect(&manager, user("d", 4), 1);

        let mut sent = Vec::new();
        for i in 0..50 {
            let origin = if i % 2 == 0 { a.as_ref() } else { b.as_ref() };
            sent.push(
                manager
                    .post_update(origin, "edit", payload(i), ALL_PERMISSIONS)
                    .unwrap(),
            );
        }

        for outbox in [&mut c_out, &mut d_out] {
            let mut seen = Vec::new();
            for _ in 0..sent.len() {
                seen.push(next_update(outbox).await.1);
            }
            assert_eq!(seen, sent);
        }

        manager.terminate();
    }

    #[tokio::test]
    async fn test_update_ids_start_at_configured_value() {
        let projects = Arc::new(ProjectMap::new());
        let config = ManagerConfig {
            initial_update_id: 1000,
            ..ManagerConfig::default()
        };
        let manager = ConnectionManager::new(config, projects);
        let (a, _a_out) = connect(&manager, user("a", 1), 1);

        assert_eq!(
            manager
                .post_update(a.as_ref(), "x", Payload::new(), ALL_PERMISSIONS)
                .unwrap(),
            1000
        );
        assert_eq!(manager.queue_depth(), 1);
    }

    #[tokio::test]
    async fn test_terminate_unblocks_idle_loop() {
        let (manager, _projects) = manager();
        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.terminate();
        assert!(manager.is_done());
        timeout(WAIT, manager.wait_stopped())
            .await
            .expect("dispatch loop did not stop");
        assert_eq!(manager.state(), ManagerState::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_closes_clients_and_releases_config() {
        let (manager, projects) = manager();
        manager.start().unwrap();
        let (a, mut a_out) = connect(&manager, user("a", 1), 1);
        let (b, mut b_out) = connect(&manager, user("b", 2), 2);

        assert!(manager.config().is_some());
        manager.terminate();

        assert!(a.is_terminated());
        assert!(b.is_terminated());
        assert!(a_out.next().await.is_none());
        assert!(b_out.next().await.is_none());
        assert!(manager.config().is_none());

        // Connection tasks remove themselves as they notice the close.
        manager.remove(a.id());
        manager.remove(b.id());
        assert_eq!(projects.client_count(), 0);
        assert!(manager.list_connections().ends_with(" - none - \n"));

        assert!(matches!(
            manager.post_update(a.as_ref(), "x", Payload::new(), ALL_PERMISSIONS),
            Err(ManagerError::Queue(QueueError::Closed))
        ));

        // A second terminate is harmless.
        manager.terminate();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (manager, _projects) = manager();
        manager.start().unwrap();
        assert!(matches!(
            manager.start(),
            Err(ManagerError::InvalidState(ManagerState::Running))
        ));
        manager.terminate();
        assert!(matches!(
            manager.start(),
            Err(ManagerError::InvalidState(ManagerState::Terminated))
        ));
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let (manager, _projects) = manager();
        assert!(matches!(manager.start(), Err(ManagerError::Spawn(_))));
        assert_eq!(manager.state(), ManagerState::Created);
    }

    #[test]
    fn test_user_lookup_through_manager() {
        let (manager, _projects) = manager();
        manager.register_user(UserInfo::new("bob", 3, 0x1, 0x2));
        assert_eq!(manager.get_user_info(3).username, "bob");
        assert_eq!(manager.get_user_info(4).uid, crate::user::INVALID_UID);
    }

    #[test]
    fn test_listing_without_clients() {
        let (manager, _projects) = manager();
        assert_eq!(
            manager.list_connections(),
            "Client   Address:Port                  Pub(Effective) Sub(Effective) PID     User\n - none - \n"
        );
    }

    #[test]
    fn test_listing_line_format() {
        let (manager, _projects) = manager();
        let bob = UserInfo::new("bob", 3, 0x1, 0x2);
        let (_handle, _outbox) = connect(&manager, bob, 7);

        let listing = manager.list_connections();
        let line = listing.strip_prefix(LISTING_HEADER).unwrap();
        assert_eq!(
            line,
            "3        192.168.1.20:51234            0x00000001     0x00000002     7       3: bob\n"
        );
        assert!(line.contains("0x00000001"));
        assert!(line.contains("0x00000002"));
        assert!(line.trim_end().ends_with("3: bob"));
    }

    #[test]
    fn test_stats_report() {
        let (manager, _projects) = manager();
        assert_eq!(manager.dump_stats(), "Stats:\n - none - \n");

        let (a, _a_out) = connect(&manager, user("alice", 1), 1);
        let (b, _b_out) = connect(&manager, user("bob", 2), 1);
        let report = manager.dump_stats();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Stats:");
        assert!(lines[1].starts_with("1        alice"));
        assert!(lines[2].starts_with("2        bob"));
        assert!(report.contains(a.dump_stats().split(" up:").next().unwrap()));
        assert!(report.contains(b.dump_stats().split(" up:").next().unwrap()));
    }
}
