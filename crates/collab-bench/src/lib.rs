//! Shared fixtures for the collab benchmarks.

use collab_core::{ClientHandle, ClientOutbox, Payload, ProjectDirectory, ProjectId, UserInfo};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;

/// A project member together with the receiving end of its outbox.
pub type Member = (Arc<ClientHandle>, ClientOutbox);

/// A payload shaped like a typical rename update, padded to `fields` entries.
#[must_use]
pub fn sample_payload(fields: usize) -> Payload {
    let mut payload = Payload::new();
    payload.set_u64("ea", 0x0040_1000);
    for i in 0..fields {
        payload.set_u64(format!("field{i}"), i as u64);
    }
    let mut map = payload.into_map();
    map.insert("name".into(), Value::from("sub_401000"));
    Payload::from(map)
}

/// Attach `count` members with full masks to `project`.
pub fn populate(projects: &dyn ProjectDirectory, project: ProjectId, count: usize) -> Vec<Member> {
    let peer: SocketAddr = ([127, 0, 0, 1], 40_000).into();
    (0..count)
        .map(|i| {
            let user = UserInfo::new(format!("user{i}"), i as u32, u64::MAX, u64::MAX);
            let (handle, outbox) = ClientHandle::new(user, project, peer, u64::MAX, u64::MAX);
            let handle = Arc::new(handle);
            projects.add_client(handle.clone());
            (handle, outbox)
        })
        .collect()
}

/// Empty every member's outbox, returning how many items were waiting.
pub fn drain(members: &mut [Member]) -> usize {
    members
        .iter_mut()
        .map(|(_, outbox)| std::iter::from_fn(|| outbox.try_next()).count())
        .sum()
}
