//! Client connections as seen by the dispatch core.
//!
//! The core never touches sockets. It talks to each connection through the
//! [`Client`] trait; [`ClientHandle`] is the channel-backed implementation the
//! server hands to the directory, with a [`ClientOutbox`] on the other end
//! drained by the connection's writer task.

use collab_protocol::MessageKind;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::payload::{Payload, SharedPayload};
use crate::user::UserInfo;

/// Project identifier.
pub type ProjectId = u32;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Client delivery errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The connection is closed or was terminated.
    #[error("Client {0} is closed")]
    Closed(ClientId),
}

/// A connected client as the dispatch core sees it.
pub trait Client: Send + Sync {
    fn id(&self) -> ClientId;

    /// Registered user id.
    fn uid(&self) -> u32;

    /// Project this client is attached to.
    fn pid(&self) -> ProjectId;

    /// Display name.
    fn user(&self) -> &str;

    /// Effective publish mask.
    fn publish_mask(&self) -> u64;

    /// Effective subscribe mask.
    fn subscribe_mask(&self) -> u64;

    fn peer_addr(&self) -> SocketAddr;

    /// Hand a forwarded update to this client's outbound path.
    ///
    /// The caller passes its own reference to the payload; it is released
    /// once the client has written it out.
    ///
    /// # Errors
    ///
    /// Fails if the client can no longer accept messages.
    fn post(&self, cmd: &str, payload: SharedPayload) -> Result<(), ClientError>;

    /// Send a server-originated message to this client only.
    ///
    /// # Errors
    ///
    /// Fails if the client can no longer accept messages.
    fn send_data(&self, kind: MessageKind, payload: Payload) -> Result<(), ClientError>;

    /// Forcibly close the connection.
    fn terminate(&self);

    /// One line of send/receive counters.
    fn dump_stats(&self) -> String;
}

/// An item waiting in a client's outbox.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// An update forwarded from another project member.
    Update { cmd: String, payload: SharedPayload },
    /// A message addressed to this client.
    Message { kind: MessageKind, payload: Payload },
}

/// Channel-backed [`Client`].
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    user: UserInfo,
    project: ProjectId,
    publish: u64,
    subscribe: u64,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Outbound>,
    shutdown: watch::Sender<bool>,
    sent: AtomicU64,
    received: AtomicU64,
    connected_at: Instant,
}

impl ClientHandle {
    /// Create a handle for `user` attached to `project`.
    ///
    /// The effective masks are the user's masks intersected with the ones
    /// the client asked for.
    #[must_use]
    pub fn new(
        user: UserInfo,
        project: ProjectId,
        peer: SocketAddr,
        requested_publish: u64,
        requested_subscribe: u64,
    ) -> (Self, ClientOutbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = Self {
            id: ClientId::next(),
            publish: user.publish & requested_publish,
            subscribe: user.subscribe & requested_subscribe,
            user,
            project,
            peer,
            tx,
            shutdown,
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            connected_at: Instant::now(),
        };
        let outbox = ClientOutbox {
            rx,
            shutdown: shutdown_rx,
        };
        (handle, outbox)
    }

    /// Count one inbound message from this client.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`Client::terminate`] has been called.
    pub async fn terminated(&self) {
        let mut rx = self.shutdown.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn push(&self, item: Outbound) -> Result<(), ClientError> {
        if self.is_terminated() {
            return Err(ClientError::Closed(self.id));
        }
        self.tx.send(item).map_err(|_| ClientError::Closed(self.id))?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Client for ClientHandle {
    fn id(&self) -> ClientId {
        self.id
    }

    fn uid(&self) -> u32 {
        self.user.uid
    }

    fn pid(&self) -> ProjectId {
        self.project
    }

    fn user(&self) -> &str {
        &self.user.username
    }

    fn publish_mask(&self) -> u64 {
        self.publish
    }

    fn subscribe_mask(&self) -> u64 {
        self.subscribe
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn post(&self, cmd: &str, payload: SharedPayload) -> Result<(), ClientError> {
        self.push(Outbound::Update {
            cmd: cmd.to_string(),
            payload,
        })
    }

    fn send_data(&self, kind: MessageKind, payload: Payload) -> Result<(), ClientError> {
        self.push(Outbound::Message { kind, payload })
    }

    fn terminate(&self) {
        if !self.shutdown.send_replace(true) {
            debug!(client = %self.id, uid = self.user.uid, "Client terminated");
        }
    }

    fn dump_stats(&self) -> String {
        format!(
            "{:<9}{:<16} sent: {:>8}  received: {:>8}  up: {}s\n",
            self.user.uid,
            self.user.username,
            self.sent_count(),
            self.received_count(),
            self.connected_at.elapsed().as_secs()
        )
    }
}

/// Receiving side of a [`ClientHandle`].
#[derive(Debug)]
pub struct ClientOutbox {
    rx: mpsc::UnboundedReceiver<Outbound>,
    shutdown: watch::Receiver<bool>,
}

impl ClientOutbox {
    /// Wait for the next outbound item.
    ///
    /// Returns `None` once the client has been terminated or its handle dropped.
    pub async fn next(&mut self) -> Option<Outbound> {
        if *self.shutdown.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.wait_for(|closed| *closed) => None,
            item = self.rx.recv() => item,
        }
    }

    /// Take an item if one is already queued.
    pub fn try_next(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    /// Whether the handle side asked for the connection to close.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn peer() -> SocketAddr {
        "10.0.0.5:40000".parse().unwrap()
    }

    #[test]
    fn test_effective_masks_intersect() {
        let user = UserInfo::new("alice", 1, 0b1110, 0b0111);
        let (handle, _outbox) = ClientHandle::new(user, 9, peer(), 0b0110, u64::MAX);
        assert_eq!(handle.publish_mask(), 0b0110);
        assert_eq!(handle.subscribe_mask(), 0b0111);
        assert_eq!(handle.pid(), 9);
        assert_eq!(handle.user(), "alice");
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(ClientId::next(), ClientId::next());
    }

    #[tokio::test]
    async fn test_post_reaches_outbox() {
        let user = UserInfo::new("alice", 1, 1, 1);
        let (handle, mut outbox) = ClientHandle::new(user, 1, peer(), u64::MAX, u64::MAX);

        let payload = Payload::new().share();
        handle.post("rename", Arc::clone(&payload)).unwrap();

        match outbox.next().await {
            Some(Outbound::Update { cmd, payload: got }) => {
                assert_eq!(cmd, "rename");
                assert!(Arc::ptr_eq(&got, &payload));
            }
            other => panic!("Expected update, got {:?}", other),
        }
        assert_eq!(handle.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_terminate_closes_both_sides() {
        let user = UserInfo::new("alice", 1, 1, 1);
        let (handle, mut outbox) = ClientHandle::new(user, 1, peer(), u64::MAX, u64::MAX);

        let waiter = handle.terminated();
        handle.terminate();
        handle.terminate();
        waiter.await;

        assert!(outbox.next().await.is_none());
        assert!(outbox.is_terminated());
        assert_eq!(
            handle.send_data(MessageKind::AckUpdateId, Payload::new()),
            Err(ClientError::Closed(handle.id()))
        );
    }

    #[test]
    fn test_post_fails_when_outbox_dropped() {
        let user = UserInfo::new("alice", 1, 1, 1);
        let (handle, outbox) = ClientHandle::new(user, 1, peer(), u64::MAX, u64::MAX);
        drop(outbox);
        assert!(handle.post("x", Payload::new().share()).is_err());
        assert_eq!(handle.sent_count(), 0);
    }

    #[test]
    fn test_dump_stats_line() {
        let user = UserInfo::new("carol", 12, 1, 1);
        let (handle, _outbox) = ClientHandle::new(user, 1, peer(), u64::MAX, u64::MAX);
        handle.record_received();
        let line = handle.dump_stats();
        assert!(line.starts_with("12       carol"));
        assert!(line.contains("received:        1"));
        assert!(line.ends_with('\n'));
    }
}
