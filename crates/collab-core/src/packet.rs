//! Units of dispatch work.

use collab_protocol::ALL_PERMISSIONS;

use crate::client::{Client, ClientId, ProjectId};
use crate::payload::{Payload, SharedPayload};

/// Payload field carrying the server-assigned update id.
pub const UPDATE_ID_FIELD: &str = "updateid";

/// One update waiting to be fanned out to a project.
///
/// The packet refers to its originator by id only, so a client that
/// disconnects while its packet is queued leaves nothing dangling.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Originating client.
    pub origin: ClientId,
    /// The originator's project when the packet was built.
    pub project: ProjectId,
    /// Command tag.
    pub cmd: String,
    /// Shared payload, with the update id embedded.
    pub payload: SharedPayload,
    /// Server-assigned update id.
    pub update_id: u64,
    /// Category bits of this update.
    pub permission: u64,
}

impl Packet {
    /// Build a packet from `origin`, embedding `update_id` into the payload.
    #[must_use]
    pub fn new(origin: &dyn Client, cmd: impl Into<String>, payload: Payload, update_id: u64) -> Self {
        Self::from_parts(origin.id(), origin.pid(), cmd, payload, update_id)
    }

    /// Build a packet from raw origin ids.
    #[must_use]
    pub fn from_parts(
        origin: ClientId,
        project: ProjectId,
        cmd: impl Into<String>,
        mut payload: Payload,
        update_id: u64,
    ) -> Self {
        payload.set_u64(UPDATE_ID_FIELD, update_id);
        Self {
            origin,
            project,
            cmd: cmd.into(),
            payload: payload.share(),
            update_id,
            permission: ALL_PERMISSIONS,
        }
    }

    /// Restrict the update to the given category bits.
    #[must_use]
    pub fn with_permission(mut self, permission: u64) -> Self {
        self.permission = permission;
        self
    }
}
