//! Project/client directory.
//!
//! The directory answers "who is in this project" for the dispatch loop. It
//! only tracks membership; permission filtering is applied by the dispatcher
//! against each visited client's subscribe mask.

use dashmap::DashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::debug;

use crate::client::{Client, ClientId, ProjectId};

/// Visitor invoked once per client. Return [`ControlFlow::Break`] to stop early.
pub type Visitor<'a> = dyn FnMut(&Arc<dyn Client>) -> ControlFlow<()> + 'a;

/// Membership index consulted by the connection manager.
///
/// Implementations must allow visits to run while other threads add or
/// remove clients, and must allow a visitor to call back into the directory.
pub trait ProjectDirectory: Send + Sync {
    /// Attach a client to the project reported by [`Client::pid`].
    fn add_client(&self, client: Arc<dyn Client>);

    /// Detach a client from whatever project it belongs to.
    fn remove_client(&self, id: ClientId) -> Option<Arc<dyn Client>>;

    /// Visit every connected client across all projects.
    fn loop_clients(&self, visit: &mut Visitor<'_>);

    /// Visit every client currently in `project`.
    fn loop_project(&self, project: ProjectId, visit: &mut Visitor<'_>);

    fn client_count(&self) -> usize;

    fn project_count(&self) -> usize;
}

/// In-memory [`ProjectDirectory`].
///
/// Visits walk a snapshot taken under the shard lock, so visitors never run
/// with a lock held. Projects are visited in ascending id order and clients
/// in join order. Empty projects are dropped.
#[derive(Default)]
pub struct ProjectMap {
    projects: DashMap<ProjectId, Vec<Arc<dyn Client>>>,
    members: DashMap<ClientId, ProjectId>,
}

impl ProjectMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Project a client is attached to, if any.
    #[must_use]
    pub fn project_of(&self, id: ClientId) -> Option<ProjectId> {
        self.members.get(&id).map(|entry| *entry.value())
    }

    /// Number of clients in one project.
    #[must_use]
    pub fn project_size(&self, project: ProjectId) -> usize {
        self.projects.get(&project).map(|e| e.len()).unwrap_or(0)
    }

    fn snapshot(&self, project: ProjectId) -> Vec<Arc<dyn Client>> {
        self.projects
            .get(&project)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    fn detach(&self, id: ClientId, project: ProjectId) -> Option<Arc<dyn Client>> {
        let removed = {
            let mut entry = self.projects.get_mut(&project)?;
            let index = entry.iter().position(|c| c.id() == id)?;
            entry.remove(index)
        };

        if self.projects.remove_if(&project, |_, clients| clients.is_empty()).is_some() {
            debug!(project = project, "Deleted empty project");
        }
        Some(removed)
    }
}

impl ProjectDirectory for ProjectMap {
    fn add_client(&self, client: Arc<dyn Client>) {
        let id = client.id();
        let project = client.pid();

        if let Some(previous) = self.members.insert(id, project) {
            if previous != project {
                self.detach(id, previous);
            }
        }

        let mut entry = self.projects.entry(project).or_default();
        if !entry.iter().any(|c| c.id() == id) {
            entry.push(client);
        }
        debug!(client = %id, project = project, members = entry.len(), "Client joined project");
    }

    fn remove_client(&self, id: ClientId) -> Option<Arc<dyn Client>> {
        let (_, project) = self.members.remove(&id)?;
        let removed = self.detach(id, project);
        debug!(client = %id, project = project, "Client left project");
        removed
    }

    fn loop_clients(&self, visit: &mut Visitor<'_>) {
        let mut projects: Vec<ProjectId> = self.projects.iter().map(|e| *e.key()).collect();
        projects.sort_unstable();

        for project in projects {
            for client in &self.snapshot(project) {
                if visit(client).is_break() {
                    return;
                }
            }
        }
    }

    fn loop_project(&self, project: ProjectId, visit: &mut Visitor<'_>) {
        for client in &self.snapshot(project) {
            if visit(client).is_break() {
                return;
            }
        }
    }

    fn client_count(&self) -> usize {
        self.members.len()
    }

    fn project_count(&self) -> usize {
        self.projects.len()
    }
}
