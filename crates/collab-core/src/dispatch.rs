//! The dispatch loop and the fan-out of a single packet.

use collab_protocol::MessageKind;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::directory::ProjectDirectory;
use crate::packet::{Packet, UPDATE_ID_FIELD};
use crate::payload::Payload;
use crate::queue::DispatchQueue;

/// What happened while fanning out one packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Members that were handed the update.
    pub forwarded: usize,
    /// Acknowledgments sent to the originator (0 if it already left).
    pub acknowledged: usize,
    /// Members skipped because their subscribe mask excludes the update.
    pub filtered: usize,
    /// Members that could not accept the update or the acknowledgment.
    pub failed: usize,
}

/// Running totals across all dispatched packets.
#[derive(Debug, Default)]
pub struct DispatchStats {
    packets: AtomicU64,
    forwarded: AtomicU64,
    acknowledged: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
}

/// A point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSnapshot {
    pub packets: u64,
    pub forwarded: u64,
    pub acknowledged: u64,
    pub filtered: u64,
    pub failed: u64,
}

impl DispatchStats {
    fn record(&self, outcome: &DispatchOutcome) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.forwarded
            .fetch_add(outcome.forwarded as u64, Ordering::Relaxed);
        self.acknowledged
            .fetch_add(outcome.acknowledged as u64, Ordering::Relaxed);
        self.filtered
            .fetch_add(outcome.filtered as u64, Ordering::Relaxed);
        self.failed.fetch_add(outcome.failed as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Fan one packet out to its project.
///
/// Every member other than the originator whose subscribe mask overlaps the
/// packet's permission bits gets its own reference to the payload. The
/// originator gets an acknowledgment carrying the update id instead. A member
/// that refuses delivery is logged and skipped. The packet, and with it this
/// call's payload reference, is dropped only after the whole visit.
pub fn dispatch(projects: &dyn ProjectDirectory, packet: Packet) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();

    projects.loop_project(packet.project, &mut |client| {
        if client.id() != packet.origin {
            if client.subscribe_mask() & packet.permission == 0 {
                outcome.filtered += 1;
                return ControlFlow::Continue(());
            }
            match client.post(&packet.cmd, Arc::clone(&packet.payload)) {
                Ok(()) => outcome.forwarded += 1,
                Err(e) => {
                    warn!(
                        client = %client.id(),
                        update_id = packet.update_id,
                        error = %e,
                        "Failed to forward update"
                    );
                    outcome.failed += 1;
                }
            }
        } else {
            let mut ack = Payload::new();
            ack.set_u64(UPDATE_ID_FIELD, packet.update_id);
            match client.send_data(MessageKind::AckUpdateId, ack) {
                Ok(()) => outcome.acknowledged += 1,
                Err(e) => {
                    warn!(
                        client = %client.id(),
                        update_id = packet.update_id,
                        error = %e,
                        "Failed to acknowledge update"
                    );
                    outcome.failed += 1;
                }
            }
        }
        ControlFlow::Continue(())
    });

    trace!(
        update_id = packet.update_id,
        project = packet.project,
        cmd = %packet.cmd,
        forwarded = outcome.forwarded,
        filtered = outcome.filtered,
        failed = outcome.failed,
        "Dispatched packet"
    );
    drop(packet);
    outcome
}

/// State moved into the background dispatch task.
pub(crate) struct Dispatcher {
    pub(crate) queue: Arc<DispatchQueue>,
    pub(crate) projects: Arc<dyn ProjectDirectory>,
    pub(crate) done: Arc<AtomicBool>,
    pub(crate) stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Drain the queue until the manager is terminated.
    pub(crate) async fn run(self) {
        info!("Dispatch loop started");

        while !self.done.load(Ordering::Acquire) {
            let Some(packet) = self.queue.dequeue().await else {
                debug!("Dispatch queue closed");
                break;
            };
            let outcome = dispatch(self.projects.as_ref(), packet);
            self.stats.record(&outcome);
        }

        info!(remaining = self.queue.len(), "Dispatch loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientError, ClientHandle, ClientId, ClientOutbox, Outbound, ProjectId};
    use crate::directory::ProjectMap;
    use crate::payload::SharedPayload;
    use crate::user::UserInfo;
    use serde_json::json;
    use std::net::SocketAddr;

    fn member(
        map: &ProjectMap,
        name: &str,
        project: ProjectId,
        subscribe: u64,
    ) -> (Arc<ClientHandle>, ClientOutbox) {
        let user = UserInfo::new(name, 1, u64::MAX, subscribe);
        let (handle, outbox) =
            ClientHandle::new(user, project, "127.0.0.1:1".parse().unwrap(), u64::MAX, u64::MAX);
        let handle = Arc::new(handle);
        map.add_client(handle.clone());
        (handle, outbox)
    }

    fn update_from(origin: &ClientHandle, update_id: u64) -> Packet {
        let payload = Payload::from_value(json!({"name": "main"})).unwrap();
        Packet::new(origin, "rename", payload, update_id)
    }

    /// A client whose connection is already gone.
    struct Broken {
        id: ClientId,
        project: ProjectId,
    }

    impl Client for Broken {
        fn id(&self) -> ClientId {
            self.id
        }
        fn uid(&self) -> u32 {
            99
        }
        fn pid(&self) -> ProjectId {
            self.project
        }
        fn user(&self) -> &str {
            "broken"
        }
        fn publish_mask(&self) -> u64 {
            u64::MAX
        }
        fn subscribe_mask(&self) -> u64 {
            u64::MAX
        }
        fn peer_addr(&self) -> SocketAddr {
            "127.0.0.1:2".parse().unwrap()
        }
        fn post(&self, _cmd: &str, _payload: SharedPayload) -> Result<(), ClientError> {
            Err(ClientError::Closed(self.id))
        }
        fn send_data(&self, _kind: MessageKind, _payload: Payload) -> Result<(), ClientError> {
            Err(ClientError::Closed(self.id))
        }
        fn terminate(&self) {}
        fn dump_stats(&self) -> String {
            String::new()
        }
    }

    #[test]
    fn test_no_self_forward_and_single_ack() {
        let map = ProjectMap::new();
        let (a, mut a_out) = member(&map, "a", 1, u64::MAX);
        let (_b, mut b_out) = member(&map, "b", 1, u64::MAX);
        let (_c, mut c_out) = member(&map, "c", 1, u64::MAX);

        let outcome = dispatch(&map, update_from(&a, 41));
        assert_eq!(
            outcome,
            DispatchOutcome {
                forwarded: 2,
                acknowledged: 1,
                filtered: 0,
                failed: 0
            }
        );

        match a_out.try_next() {
            Some(Outbound::Message { kind, payload }) => {
                assert_eq!(kind, MessageKind::AckUpdateId);
                assert_eq!(payload.get_u64(UPDATE_ID_FIELD), Some(41));
                assert_eq!(payload.as_map().len(), 1);
            }
            other => panic!("Expected ack, got {:?}", other),
        }
        assert!(a_out.try_next().is_none());

        for outbox in [&mut b_out, &mut c_out] {
            match outbox.try_next() {
                Some(Outbound::Update { cmd, payload }) => {
                    assert_eq!(cmd, "rename");
                    assert_eq!(payload.get_u64(UPDATE_ID_FIELD), Some(41));
                }
                other => panic!("Expected update, got {:?}", other),
            }
            assert!(outbox.try_next().is_none());
        }
    }

    #[test]
    fn test_failed_member_does_not_stop_fan_out() {
        let map = ProjectMap::new();
        let (a, _a_out) = member(&map, "a", 1, u64::MAX);
        map.add_client(Arc::new(Broken {
            id: ClientId::next(),
            project: 1,
        }));
        let (_c, mut c_out) = member(&map, "c", 1, u64::MAX);

        let outcome = dispatch(&map, update_from(&a, 1));
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.forwarded, 1);
        assert!(matches!(c_out.try_next(), Some(Outbound::Update { .. })));
    }

    #[test]
    fn test_other_projects_untouched() {
        let map = ProjectMap::new();
        let (a, _a_out) = member(&map, "a", 1, u64::MAX);
        let (_x, mut x_out) = member(&map, "x", 2, u64::MAX);

        dispatch(&map, update_from(&a, 1));
        assert!(x_out.try_next().is_none());
    }

    #[test]
    fn test_subscribe_mask_filters_members() {
        let map = ProjectMap::new();
        let (a, _a_out) = member(&map, "a", 1, u64::MAX);
        let (_b, mut b_out) = member(&map, "b", 1, 0b0010);
        let (_c, mut c_out) = member(&map, "c", 1, 0b0100);

        let outcome = dispatch(&map, update_from(&a, 1).with_permission(0b0100));
        assert_eq!(outcome.filtered, 1);
        assert_eq!(outcome.forwarded, 1);
        assert!(b_out.try_next().is_none());
        assert!(c_out.try_next().is_some());
    }

    #[test]
    fn test_payload_references_follow_recipients() {
        let map = ProjectMap::new();
        let (a, _a_out) = member(&map, "a", 1, u64::MAX);
        let (_b, mut b_out) = member(&map, "b", 1, u64::MAX);
        let (_c, mut c_out) = member(&map, "c", 1, u64::MAX);

        dispatch(&map, update_from(&a, 5));

        let Some(Outbound::Update { payload: held_by_b, .. }) = b_out.try_next() else {
            panic!("b got nothing");
        };
        // The dispatcher has released its own reference: only b and c hold one.
        assert_eq!(Arc::strong_count(&held_by_b), 2);

        drop(c_out.try_next());
        assert_eq!(Arc::strong_count(&held_by_b), 1);
    }

    #[test]
    fn test_departed_originator_gets_no_ack() {
        let map = ProjectMap::new();
        let (a, _a_out) = member(&map, "a", 1, u64::MAX);
        let (_b, mut b_out) = member(&map, "b", 1, u64::MAX);
        let packet = update_from(&a, 3);
        map.remove_client(a.id());

        let outcome = dispatch(&map, packet);
        assert_eq!(outcome.acknowledged, 0);
        assert_eq!(outcome.forwarded, 1);
        assert!(b_out.try_next().is_some());
    }

    #[test]
    fn test_stats_accumulate() {
        let stats = DispatchStats::default();
        stats.record(&DispatchOutcome {
            forwarded: 2,
            acknowledged: 1,
            filtered: 0,
            failed: 1,
        });
        stats.record(&DispatchOutcome {
            forwarded: 1,
            acknowledged: 1,
            filtered: 3,
            failed: 0,
        });
        assert_eq!(
            stats.snapshot(),
            DispatchSnapshot {
                packets: 2,
                forwarded: 3,
                acknowledged: 2,
                filtered: 3,
                failed: 1
            }
        );
    }
}
